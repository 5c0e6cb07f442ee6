// SPDX-FileCopyrightText: 2026 Sqlease Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Mock engine binding for deterministic testing.
//!
//! Statements are interpreted by name:
//!
//! - `SELECT 1` returns a single `1`
//! - `SERIAL` returns the connection's generation marker
//! - `FAIL` fails with an engine error; the connection stays usable
//! - `BREAK` fails with `ConnectionLost` and poisons the connection
//! - anything else succeeds with one change

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use sqlease_core::{EngineBinding, OpenMode, SqleaseError, StatementResult, Value};

/// A fake physical connection carrying a generation marker.
#[derive(Debug)]
pub struct MockConnection {
    serial: u64,
    mode: OpenMode,
    broken: AtomicBool,
}

impl MockConnection {
    /// Creation order across the engine, starting at 1.
    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::SeqCst)
    }
}

/// Engine binding that opens [`MockConnection`]s and records what happens.
#[derive(Default)]
pub struct MockEngine {
    next_serial: AtomicU64,
    created: AtomicUsize,
    destroyed: AtomicUsize,
    fail_creates: AtomicUsize,
    create_delay: Mutex<Duration>,
    statement_delay: Mutex<Duration>,
    destroy_delay: Mutex<Duration>,
    destroyed_serials: Mutex<Vec<u64>>,
    statements: Mutex<Vec<String>>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` `create_connection` calls fail.
    pub fn fail_next_creates(&self, n: usize) {
        self.fail_creates.store(n, Ordering::SeqCst);
    }

    /// Delay every `create_connection` call by `delay`.
    pub fn set_create_delay(&self, delay: Duration) {
        *self.create_delay.lock().unwrap_or_else(PoisonError::into_inner) = delay;
    }

    /// Delay every `run_statement` call by `delay`.
    pub fn set_statement_delay(&self, delay: Duration) {
        *self.statement_delay.lock().unwrap_or_else(PoisonError::into_inner) = delay;
    }

    /// Delay every `destroy_connection` call by `delay`. The connection
    /// counts as destroyed only once the delay has passed.
    pub fn set_destroy_delay(&self, delay: Duration) {
        *self.destroy_delay.lock().unwrap_or_else(PoisonError::into_inner) = delay;
    }

    /// Connections opened so far.
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Connections destroyed so far.
    pub fn destroyed(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Connections opened and not yet destroyed.
    pub fn live(&self) -> usize {
        self.created().saturating_sub(self.destroyed())
    }

    pub fn destroyed_serials(&self) -> Vec<u64> {
        self.destroyed_serials
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Every statement run, in order, across all connections.
    pub fn statements(&self) -> Vec<String> {
        self.statements
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn delay(slot: &Mutex<Duration>) -> Duration {
        *slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl EngineBinding for MockEngine {
    type Connection = MockConnection;

    async fn create_connection(&self, mode: OpenMode) -> Result<MockConnection, SqleaseError> {
        let delay = Self::delay(&self.create_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let injected = self
            .fail_creates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(SqleaseError::engine("injected create failure"));
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        let serial = self.next_serial.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::trace!(serial, %mode, "mock connection opened");
        Ok(MockConnection {
            serial,
            mode,
            broken: AtomicBool::new(false),
        })
    }

    async fn destroy_connection(&self, conn: MockConnection) {
        let delay = Self::delay(&self.destroy_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.destroyed.fetch_add(1, Ordering::SeqCst);
        self.destroyed_serials
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(conn.serial);
    }

    async fn run_statement(
        &self,
        conn: &MockConnection,
        sql: &str,
        _params: &[Value],
    ) -> Result<StatementResult, SqleaseError> {
        self.statements
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(sql.to_string());
        let delay = Self::delay(&self.statement_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if conn.is_broken() {
            return Err(SqleaseError::connection_lost("mock connection is broken"));
        }
        match sql {
            "SELECT 1" => Ok(StatementResult {
                columns: vec!["1".to_string()],
                rows: vec![vec![Value::Integer(1)]],
                ..StatementResult::default()
            }),
            "SERIAL" => Ok(StatementResult {
                columns: vec!["serial".to_string()],
                rows: vec![vec![Value::Integer(conn.serial as i64)]],
                ..StatementResult::default()
            }),
            "FAIL" => Err(SqleaseError::engine("mock statement failed")),
            "BREAK" => {
                conn.broken.store(true, Ordering::SeqCst);
                Err(SqleaseError::connection_lost("mock connection broke"))
            }
            _ => Ok(StatementResult {
                changes: 1,
                ..StatementResult::default()
            }),
        }
    }
}
