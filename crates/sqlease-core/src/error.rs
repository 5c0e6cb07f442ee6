// SPDX-FileCopyrightText: 2026 Sqlease Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error types for the sqlease driver.

use std::time::Duration;

use strum::{Display, EnumString};
use thiserror::Error;

use crate::types::LeaseId;

/// The error type used across every sqlease crate.
///
/// Timeout and already-released failures are separate variants so callers can
/// branch on [`SqleaseError::kind`] instead of message text.
#[derive(Debug, Error)]
pub enum SqleaseError {
    /// Configuration errors (invalid TOML, out-of-range values).
    #[error("configuration error: {0}")]
    Config(String),

    /// Waiting for a reader-pool slot exceeded the acquire timeout.
    #[error("timed out after {duration:?} waiting for a reader connection")]
    PoolAcquireTimeout { duration: Duration },

    /// Waiting for the write lock exceeded the acquire timeout.
    #[error("timed out after {duration:?} waiting for the write lock")]
    LockAcquireTimeout { duration: Duration },

    /// The lease was released (or revoked by shutdown) before the connection was accessed.
    #[error("lease {lease} was already released")]
    LeaseAlreadyReleased { lease: LeaseId },

    /// The owning pool or write slot has been closed.
    #[error("{resource} was already released")]
    DriverAlreadyReleased { resource: String },

    /// Lease bookkeeping disagreed with a release request.
    ///
    /// Built for the observability sink; release paths never return it.
    #[error("invariant violated: {message}")]
    InvariantViolated { message: String },

    /// The engine binding failed; the connection is still usable.
    #[error("engine error: {source}")]
    Engine {
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The engine binding failed in a way that leaves the connection unusable.
    #[error("connection lost: {source}")]
    ConnectionLost {
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Internal or unexpected errors.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Discriminant of [`SqleaseError`] for branching without matching payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    Config,
    PoolAcquireTimeout,
    LockAcquireTimeout,
    LeaseAlreadyReleased,
    DriverAlreadyReleased,
    InvariantViolated,
    Engine,
    ConnectionLost,
    Internal,
}

impl SqleaseError {
    /// Returns the kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) => ErrorKind::Config,
            Self::PoolAcquireTimeout { .. } => ErrorKind::PoolAcquireTimeout,
            Self::LockAcquireTimeout { .. } => ErrorKind::LockAcquireTimeout,
            Self::LeaseAlreadyReleased { .. } => ErrorKind::LeaseAlreadyReleased,
            Self::DriverAlreadyReleased { .. } => ErrorKind::DriverAlreadyReleased,
            Self::InvariantViolated { .. } => ErrorKind::InvariantViolated,
            Self::Engine { .. } => ErrorKind::Engine,
            Self::ConnectionLost { .. } => ErrorKind::ConnectionLost,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// True for both the reader-pool and the write-lock acquire timeouts.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::PoolAcquireTimeout | ErrorKind::LockAcquireTimeout
        )
    }

    /// True when the physical connection behind the failing call must not be reused.
    pub fn is_connection_fatal(&self) -> bool {
        self.kind() == ErrorKind::ConnectionLost
    }

    /// Wrap an engine failure that leaves the connection usable.
    pub fn engine(source: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Engine {
            source: source.into(),
        }
    }

    /// Wrap an engine failure that invalidates the connection.
    pub fn connection_lost(source: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::ConnectionLost {
            source: source.into(),
        }
    }
}
