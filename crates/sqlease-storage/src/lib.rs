// SPDX-FileCopyrightText: 2026 Sqlease Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! SQLite engine binding for the sqlease lease core.
//!
//! Each physical connection is its own `tokio-rusqlite` connection with a
//! dedicated background thread. The writer enables WAL and the usual pragmas;
//! readers open the file read-only with `query_only` set.

pub mod engine;
pub mod values;

pub use engine::{SqliteConnection, SqliteEngine};
