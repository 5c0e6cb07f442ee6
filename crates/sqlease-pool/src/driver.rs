// SPDX-FileCopyrightText: 2026 Sqlease Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Driver facade: one writer, one reader pool, routed by intent.

use std::sync::Arc;

use futures::future::BoxFuture;
use sqlease_config::PoolConfig;
use sqlease_core::{
    DetachedHolder, EngineBinding, HealthStatus, LeaseHolder, ObservabilitySink, SqleaseError,
    StatementResult, TracingSink, Value,
};
use tracing::{info, warn};

use crate::lease::ConnectionLease;
use crate::readonly_pool::{PoolStats, ReadonlyConnectionPool};
use crate::write_connection::{WriteConnection, WriteStats};

/// Snapshot of both owners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverStats {
    pub readers: PoolStats,
    pub writer: WriteStats,
}

/// Statement runner bound to one lease for the duration of a callback.
///
/// A [`SqleaseError::ConnectionLost`] from the engine marks the lease invalid,
/// so the owner destroys the connection when the lease comes back.
pub struct Session<'a, E: EngineBinding> {
    engine: Arc<E>,
    lease: &'a ConnectionLease<E::Connection>,
}

impl<E: EngineBinding> Clone for Session<'_, E> {
    fn clone(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
            lease: self.lease,
        }
    }
}

impl<'a, E: EngineBinding> Session<'a, E> {
    fn new(engine: Arc<E>, lease: &'a ConnectionLease<E::Connection>) -> Self {
        Self { engine, lease }
    }

    pub async fn run(&self, sql: &str, params: &[Value]) -> Result<StatementResult, SqleaseError> {
        let conn = self.lease.connection()?;
        let result = self.engine.run_statement(conn.inner(), sql, params).await;
        if let Err(err) = &result {
            if err.is_connection_fatal() {
                self.lease.mark_as_invalid();
            }
        }
        result
    }

    pub fn lease(&self) -> &'a ConnectionLease<E::Connection> {
        self.lease
    }
}

/// Owns the write connection and the reader pool for one database.
pub struct Driver<E: EngineBinding> {
    engine: Arc<E>,
    writer: WriteConnection<E>,
    readers: ReadonlyConnectionPool<E>,
}

impl<E: EngineBinding> Clone for Driver<E> {
    fn clone(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
            writer: self.writer.clone(),
            readers: self.readers.clone(),
        }
    }
}

impl<E: EngineBinding> Driver<E> {
    pub fn new(engine: Arc<E>, config: &PoolConfig, sink: Arc<dyn ObservabilitySink>) -> Self {
        Self {
            writer: WriteConnection::new(Arc::clone(&engine), config, Arc::clone(&sink)),
            readers: ReadonlyConnectionPool::new(Arc::clone(&engine), config, sink),
            engine,
        }
    }

    /// Same as [`Driver::new`] with diagnostics going to `tracing`.
    pub fn with_tracing_sink(engine: Arc<E>, config: &PoolConfig) -> Self {
        Self::new(engine, config, Arc::new(TracingSink))
    }

    pub fn engine(&self) -> &Arc<E> {
        &self.engine
    }

    pub fn writer(&self) -> &WriteConnection<E> {
        &self.writer
    }

    pub fn readers(&self) -> &ReadonlyConnectionPool<E> {
        &self.readers
    }

    /// Open the writer, then prepare the reader pool.
    pub async fn connect(&self) -> Result<(), SqleaseError> {
        self.writer.connect().await?;
        self.readers.connect().await?;
        info!(
            writer = %self.writer.id(),
            readers = %self.readers.id(),
            pool_size = self.readers.max_size(),
            "driver connected"
        );
        Ok(())
    }

    /// Run `f` on a reader lease.
    pub async fn read<T, F>(&self, holder: Arc<dyn LeaseHolder>, f: F) -> Result<T, SqleaseError>
    where
        F: for<'a> FnOnce(Session<'a, E>) -> BoxFuture<'a, Result<T, SqleaseError>>,
    {
        let engine = Arc::clone(&self.engine);
        self.readers
            .run_exclusive(holder, move |lease| f(Session::new(engine, lease)))
            .await
    }

    /// Run `f` while holding the write lock.
    pub async fn write<T, F>(&self, holder: Arc<dyn LeaseHolder>, f: F) -> Result<T, SqleaseError>
    where
        F: for<'a> FnOnce(Session<'a, E>) -> BoxFuture<'a, Result<T, SqleaseError>>,
    {
        let engine = Arc::clone(&self.engine);
        self.writer
            .run_exclusive(holder, move |lease| f(Session::new(engine, lease)))
            .await
    }

    pub async fn lease_reader(
        &self,
        holder: Arc<dyn LeaseHolder>,
    ) -> Result<ConnectionLease<E::Connection>, SqleaseError> {
        self.readers.lease_connection(holder).await
    }

    pub async fn lease_writer(
        &self,
        holder: Arc<dyn LeaseHolder>,
    ) -> Result<ConnectionLease<E::Connection>, SqleaseError> {
        self.writer.lease_connection(holder).await
    }

    /// Start a [`Session`] on a lease obtained from [`Driver::lease_reader`]
    /// or [`Driver::lease_writer`].
    pub fn session<'a>(&self, lease: &'a ConnectionLease<E::Connection>) -> Session<'a, E> {
        Session::new(Arc::clone(&self.engine), lease)
    }

    /// Run one statement on a reader.
    pub async fn query(&self, sql: &str, params: &[Value]) -> Result<StatementResult, SqleaseError> {
        let mut lease = self.readers.lease_connection(Arc::new(DetachedHolder)).await?;
        let result = self.session(&lease).run(sql, params).await;
        self.readers.release_connection(&mut lease).await;
        result
    }

    /// Run one statement on the writer.
    pub async fn execute(&self, sql: &str, params: &[Value]) -> Result<StatementResult, SqleaseError> {
        let mut lease = self.writer.lease_connection(Arc::new(DetachedHolder)).await?;
        let result = self.session(&lease).run(sql, params).await;
        self.writer.release_connection(&mut lease).await;
        result
    }

    /// Run `f` inside `BEGIN IMMEDIATE` .. `COMMIT` on the writer.
    ///
    /// Any error from `f` or from `COMMIT` rolls back. The write lock is held
    /// for the whole transaction and released on every path.
    pub async fn transaction<T, F>(
        &self,
        holder: Arc<dyn LeaseHolder>,
        f: F,
    ) -> Result<T, SqleaseError>
    where
        F: for<'a> FnOnce(Session<'a, E>) -> BoxFuture<'a, Result<T, SqleaseError>>,
    {
        let mut lease = self.writer.lease_connection(holder).await?;
        let result = self.run_transaction(&lease, f).await;
        self.writer.release_connection(&mut lease).await;
        result
    }

    async fn run_transaction<T, F>(
        &self,
        lease: &ConnectionLease<E::Connection>,
        f: F,
    ) -> Result<T, SqleaseError>
    where
        F: for<'a> FnOnce(Session<'a, E>) -> BoxFuture<'a, Result<T, SqleaseError>>,
    {
        let session = self.session(lease);
        session.run("BEGIN IMMEDIATE", &[]).await?;
        let outcome = match f(session.clone()).await {
            Ok(value) => session.run("COMMIT", &[]).await.map(|_| value),
            Err(err) => Err(err),
        };
        if outcome.is_err() {
            if let Err(err) = session.run("ROLLBACK", &[]).await {
                // Transaction state is unknown; do not hand this writer out again.
                lease.mark_as_invalid();
                warn!(lease = %lease.id(), error = %err, "rollback failed; writer invalidated");
            }
        }
        outcome
    }

    /// Probe a reader with `SELECT 1`.
    ///
    /// Acquire timeouts count as degraded; any other failure as unhealthy.
    pub async fn health_check(&self) -> HealthStatus {
        match self.query("SELECT 1", &[]).await {
            Ok(result) if result.scalar() == Some(&Value::Integer(1)) => HealthStatus::Healthy,
            Ok(result) => HealthStatus::Degraded(format!(
                "health probe returned {:?}",
                result.scalar()
            )),
            Err(err) if err.is_timeout() => HealthStatus::Degraded(err.to_string()),
            Err(err) => HealthStatus::Unhealthy(err.to_string()),
        }
    }

    pub fn stats(&self) -> DriverStats {
        DriverStats {
            readers: self.readers.stats(),
            writer: self.writer.stats(),
        }
    }

    /// Close the readers, then the writer, so the writer is the last
    /// connection to touch the database file.
    pub async fn close(&self) {
        self.readers.close().await;
        self.writer.close().await;
        info!("driver closed");
    }
}
