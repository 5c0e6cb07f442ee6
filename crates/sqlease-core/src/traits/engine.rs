// SPDX-FileCopyrightText: 2026 Sqlease Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Engine binding trait: the open/execute/close primitives of the embedded engine.

use async_trait::async_trait;

use crate::error::SqleaseError;
use crate::types::{OpenMode, StatementResult, Value};

/// Low-level binding to the embedded database engine.
///
/// The lease core only creates, destroys, and hands out connections; it never
/// inspects them. Statement execution is exposed so that driver helpers can
/// run work through a lease.
#[async_trait]
pub trait EngineBinding: Send + Sync + 'static {
    /// One open engine connection.
    type Connection: Send + Sync + 'static;

    /// Opens a new physical connection.
    async fn create_connection(&self, mode: OpenMode) -> Result<Self::Connection, SqleaseError>;

    /// Closes a physical connection.
    ///
    /// Must not fail, even on a connection that is already broken.
    async fn destroy_connection(&self, conn: Self::Connection);

    /// Runs one statement with positional parameters.
    async fn run_statement(
        &self,
        conn: &Self::Connection,
        sql: &str,
        params: &[Value],
    ) -> Result<StatementResult, SqleaseError>;
}
