// SPDX-FileCopyrightText: 2026 Sqlease Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! `EngineBinding` over SQLite via `tokio-rusqlite`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{params_from_iter, ErrorCode, OpenFlags};
use sqlease_config::StorageConfig;
use sqlease_core::{EngineBinding, OpenMode, SqleaseError, StatementResult, Value};
use tracing::{debug, info, warn};

use crate::values::{from_sql, to_sql};

/// One open SQLite connection and the mode it was opened with.
pub struct SqliteConnection {
    conn: tokio_rusqlite::Connection,
    mode: OpenMode,
}

impl SqliteConnection {
    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    /// The underlying `tokio-rusqlite` handle, for work the binding does not cover.
    pub fn handle(&self) -> &tokio_rusqlite::Connection {
        &self.conn
    }
}

/// SQLite engine binding for one database file.
#[derive(Debug, Clone)]
pub struct SqliteEngine {
    path: PathBuf,
    wal_mode: bool,
    busy_timeout: Duration,
}

impl SqliteEngine {
    pub fn new(config: &StorageConfig) -> Self {
        Self {
            path: PathBuf::from(&config.database_path),
            wal_mode: config.wal_mode,
            busy_timeout: Duration::from_millis(config.busy_timeout_ms),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn open(&self, mode: OpenMode) -> Result<tokio_rusqlite::Connection, SqleaseError> {
        let flags = match mode {
            OpenMode::ReadWrite => {
                OpenFlags::SQLITE_OPEN_READ_WRITE
                    | OpenFlags::SQLITE_OPEN_CREATE
                    | OpenFlags::SQLITE_OPEN_NO_MUTEX
                    | OpenFlags::SQLITE_OPEN_URI
            }
            OpenMode::ReadOnly => {
                OpenFlags::SQLITE_OPEN_READ_ONLY
                    | OpenFlags::SQLITE_OPEN_NO_MUTEX
                    | OpenFlags::SQLITE_OPEN_URI
            }
        };
        if mode == OpenMode::ReadWrite {
            if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    SqleaseError::engine(format!(
                        "failed to create database directory {}: {e}",
                        parent.display()
                    ))
                })?;
            }
        }
        tokio_rusqlite::Connection::open_with_flags(&self.path, flags)
            .await
            .map_err(|e| {
                SqleaseError::engine(format!("failed to open {}: {e}", self.path.display()))
            })
    }

    async fn configure(
        &self,
        conn: &tokio_rusqlite::Connection,
        mode: OpenMode,
    ) -> Result<(), SqleaseError> {
        let busy_timeout = self.busy_timeout;
        let wal_mode = self.wal_mode;
        let journal = conn
            .call(move |conn| -> Result<Result<Option<String>, rusqlite::Error>, rusqlite::Error> {
                Ok(apply_pragmas(conn, mode, wal_mode, busy_timeout))
            })
            .await
            .map_err(|e| SqleaseError::connection_lost(e.to_string()))?
            .map_err(classify)?;

        if let Some(journal) = journal {
            info!(path = %self.path.display(), journal_mode = %journal, "writer journal configured");
        }
        Ok(())
    }
}

/// Per-connection setup. Returns the resulting journal mode for the writer.
fn apply_pragmas(
    conn: &rusqlite::Connection,
    mode: OpenMode,
    wal_mode: bool,
    busy_timeout: Duration,
) -> Result<Option<String>, rusqlite::Error> {
    conn.busy_timeout(busy_timeout)?;
    match mode {
        OpenMode::ReadWrite => {
            let journal = if wal_mode {
                Some(conn.query_row("PRAGMA journal_mode=WAL;", [], |row| row.get::<_, String>(0))?)
            } else {
                None
            };
            conn.execute_batch("PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;")?;
            Ok(journal)
        }
        OpenMode::ReadOnly => {
            conn.execute_batch("PRAGMA query_only=ON;")?;
            Ok(None)
        }
    }
}

/// Split SQLite failures into ones that poison the connection and ones that do not.
fn classify(err: rusqlite::Error) -> SqleaseError {
    let fatal = matches!(
        &err,
        rusqlite::Error::SqliteFailure(failure, _) if matches!(
            failure.code,
            ErrorCode::DatabaseCorrupt
                | ErrorCode::NotADatabase
                | ErrorCode::SystemIoFailure
                | ErrorCode::CannotOpen
        )
    );
    if fatal {
        SqleaseError::connection_lost(err)
    } else {
        SqleaseError::engine(err)
    }
}

fn run(
    conn: &rusqlite::Connection,
    sql: &str,
    params: Vec<rusqlite::types::Value>,
) -> Result<StatementResult, rusqlite::Error> {
    let mut stmt = conn.prepare(sql)?;
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();

    if columns.is_empty() {
        let changes = stmt.execute(params_from_iter(params))?;
        return Ok(StatementResult {
            changes: changes as u64,
            last_insert_rowid: Some(conn.last_insert_rowid()),
            ..StatementResult::default()
        });
    }

    let width = columns.len();
    let mut rows = stmt.query(params_from_iter(params))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut cells = Vec::with_capacity(width);
        for i in 0..width {
            cells.push(from_sql(row.get_ref(i)?));
        }
        out.push(cells);
    }
    Ok(StatementResult {
        columns,
        rows: out,
        ..StatementResult::default()
    })
}

#[async_trait]
impl EngineBinding for SqliteEngine {
    type Connection = SqliteConnection;

    async fn create_connection(&self, mode: OpenMode) -> Result<SqliteConnection, SqleaseError> {
        let conn = self.open(mode).await?;
        if let Err(err) = self.configure(&conn, mode).await {
            if let Err(close_err) = conn.close().await {
                debug!(error = %close_err, "close after failed setup also failed");
            }
            return Err(err);
        }
        debug!(path = %self.path.display(), %mode, "sqlite connection opened");
        Ok(SqliteConnection { conn, mode })
    }

    async fn destroy_connection(&self, conn: SqliteConnection) {
        let SqliteConnection { conn, mode } = conn;
        if mode == OpenMode::ReadWrite && self.wal_mode {
            let checkpoint = conn
                .call(|conn| -> Result<(), rusqlite::Error> {
                    conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
                    Ok(())
                })
                .await;
            match checkpoint {
                Ok(()) => debug!("WAL checkpoint complete"),
                Err(e) => warn!(error = %e, "WAL checkpoint before close failed"),
            }
        }
        if let Err(e) = conn.close().await {
            warn!(error = %e, %mode, "sqlite connection did not close cleanly");
        }
    }

    async fn run_statement(
        &self,
        conn: &SqliteConnection,
        sql: &str,
        params: &[Value],
    ) -> Result<StatementResult, SqleaseError> {
        let sql = sql.to_string();
        let params: Vec<rusqlite::types::Value> = params.iter().map(to_sql).collect();
        conn.conn
            .call(move |conn| -> Result<Result<StatementResult, rusqlite::Error>, rusqlite::Error> {
                Ok(run(conn, &sql, params))
            })
            .await
            .map_err(|e| SqleaseError::connection_lost(e.to_string()))?
            .map_err(classify)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlease_core::ErrorKind;
    use tempfile::TempDir;

    fn engine(dir: &TempDir) -> SqliteEngine {
        SqliteEngine::new(&StorageConfig {
            database_path: dir.path().join("nested/test.db").to_string_lossy().into_owned(),
            wal_mode: true,
            busy_timeout_ms: 1_000,
        })
    }

    #[tokio::test]
    async fn writer_enables_wal_and_creates_directories() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let writer = engine.create_connection(OpenMode::ReadWrite).await.unwrap();

        let result = engine.run_statement(&writer, "PRAGMA journal_mode", &[]).await.unwrap();
        assert_eq!(result.scalar(), Some(&Value::Text("wal".into())));
        assert!(engine.path().exists());
        engine.destroy_connection(writer).await;
    }

    #[tokio::test]
    async fn statements_report_changes_and_rows() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let writer = engine.create_connection(OpenMode::ReadWrite).await.unwrap();

        engine
            .run_statement(&writer, "CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT, data BLOB)", &[])
            .await
            .unwrap();
        let insert = engine
            .run_statement(
                &writer,
                "INSERT INTO t (name, data) VALUES (?1, ?2)",
                &[Value::from("alpha"), Value::Blob(vec![1, 2, 3])],
            )
            .await
            .unwrap();
        assert_eq!(insert.changes, 1);
        assert_eq!(insert.last_insert_rowid, Some(1));

        let rows = engine
            .run_statement(&writer, "SELECT id, name, data FROM t", &[])
            .await
            .unwrap();
        assert_eq!(rows.columns, vec!["id", "name", "data"]);
        assert_eq!(
            rows.rows,
            vec![vec![Value::Integer(1), Value::from("alpha"), Value::Blob(vec![1, 2, 3])]]
        );
        engine.destroy_connection(writer).await;
    }

    #[tokio::test]
    async fn reader_cannot_write() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let writer = engine.create_connection(OpenMode::ReadWrite).await.unwrap();
        engine.run_statement(&writer, "CREATE TABLE t (x)", &[]).await.unwrap();

        let reader = engine.create_connection(OpenMode::ReadOnly).await.unwrap();
        let err = engine
            .run_statement(&reader, "INSERT INTO t VALUES (1)", &[])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Engine);

        engine.destroy_connection(reader).await;
        engine.destroy_connection(writer).await;
    }

    #[tokio::test]
    async fn syntax_error_keeps_connection_usable() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let writer = engine.create_connection(OpenMode::ReadWrite).await.unwrap();

        let err = engine.run_statement(&writer, "SELEC 1", &[]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Engine);
        let ok = engine.run_statement(&writer, "SELECT 1", &[]).await.unwrap();
        assert_eq!(ok.scalar(), Some(&Value::Integer(1)));
        engine.destroy_connection(writer).await;
    }

    #[tokio::test]
    async fn reader_on_missing_file_fails_to_open() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        assert!(engine.create_connection(OpenMode::ReadOnly).await.is_err());
    }

    #[test]
    fn corruption_codes_are_fatal() {
        let corrupt = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CORRUPT),
            None,
        );
        assert_eq!(classify(corrupt).kind(), ErrorKind::ConnectionLost);

        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        assert_eq!(classify(busy).kind(), ErrorKind::Engine);
    }
}
