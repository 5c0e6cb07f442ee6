// SPDX-FileCopyrightText: 2026 Sqlease Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration model.
//!
//! All structs use `#[serde(deny_unknown_fields)]` so a misspelled key fails
//! at startup instead of silently falling back to a default.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level sqlease configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SqleaseConfig {
    /// Lease limits and timeouts.
    #[serde(default)]
    pub pool: PoolConfig,

    /// Database file and engine settings.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Log output settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Lease limits shared by the reader pool and the write slot.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PoolConfig {
    /// Maximum number of reader connections leased at once.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Maximum time any caller waits for a lease, in milliseconds.
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,

    /// Maximum time `close()` waits for holders to release, in milliseconds.
    #[serde(default = "default_destroy_timeout_ms")]
    pub destroy_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            destroy_timeout_ms: default_destroy_timeout_ms(),
        }
    }
}

impl PoolConfig {
    /// The timeout policy handed to every lease owner.
    pub fn timeouts(&self) -> LeaseTimeouts {
        LeaseTimeouts {
            acquire: Duration::from_millis(self.acquire_timeout_ms),
            destroy: Duration::from_millis(self.destroy_timeout_ms),
        }
    }
}

fn default_pool_size() -> usize {
    4
}

fn default_acquire_timeout_ms() -> u64 {
    5_000
}

fn default_destroy_timeout_ms() -> u64 {
    2_000
}

/// Bounds on the two blocking waits a lease owner performs.
///
/// Only waiting is bounded. Work done while holding a lease is not timed; a
/// slow holder is asked to release during shutdown and revoked after `destroy`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseTimeouts {
    /// Bound on waiting for a lease.
    pub acquire: Duration,
    /// Bound on waiting for holders to release during shutdown.
    pub destroy: Duration,
}

impl Default for LeaseTimeouts {
    fn default() -> Self {
        PoolConfig::default().timeouts()
    }
}

/// Database file and engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    /// Path to the database file.
    #[serde(default = "default_database_path")]
    pub database_path: String,

    /// Put the database in write-ahead-log mode when the writer connects.
    #[serde(default = "default_wal_mode")]
    pub wal_mode: bool,

    /// Engine-level busy timeout in milliseconds.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            wal_mode: default_wal_mode(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

fn default_database_path() -> String {
    dirs::data_dir()
        .map(|p| p.join("sqlease").join("sqlease.db"))
        .unwrap_or_else(|| std::path::PathBuf::from("sqlease.db"))
        .to_string_lossy()
        .into_owned()
}

fn default_wal_mode() -> bool {
    true
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Default level when `RUST_LOG` is unset (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
