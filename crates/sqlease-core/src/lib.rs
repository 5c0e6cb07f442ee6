// SPDX-FileCopyrightText: 2026 Sqlease Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Core library for the sqlease connection-lease driver.
//!
//! This crate provides the error type, the engine-neutral value and identity
//! types, and the collaborator traits consumed by the lease core: the engine
//! binding, lease holders, and the observability sink.

pub mod error;
pub mod sink;
pub mod traits;
pub mod types;

// Re-export key items at crate root for ergonomic imports.
pub use error::{ErrorKind, SqleaseError};
pub use sink::TracingSink;
pub use types::{
    ConnectionId, HealthStatus, LeaseId, OpenMode, OwnerId, StatementResult, Value,
};

// Re-export all collaborator traits at crate root.
pub use traits::{DetachedHolder, EngineBinding, LeaseHolder, ObservabilitySink, SinkEvent};
