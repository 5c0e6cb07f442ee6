// SPDX-FileCopyrightText: 2026 Sqlease Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration for the sqlease driver.
//!
//! TOML files are merged over compiled defaults following the XDG hierarchy,
//! `SQLEASE_*` environment variables override them, unknown keys are rejected,
//! and failures render as miette diagnostics with typo suggestions.
//!
//! ```no_run
//! let config = sqlease_config::load_and_validate().expect("config errors");
//! println!("readers: {}", config.pool.pool_size);
//! ```

pub mod diagnostic;
pub mod loader;
pub mod model;
pub mod validation;

pub use diagnostic::{render_errors, ConfigError};
pub use loader::{load_config, load_config_from_path, load_config_from_str};
pub use model::{LeaseTimeouts, LoggingConfig, PoolConfig, SqleaseConfig, StorageConfig};

/// Load configuration from the XDG hierarchy and validate it.
pub fn load_and_validate() -> Result<SqleaseConfig, Vec<ConfigError>> {
    finish(loader::load_config(), collect_toml_sources)
}

/// Load configuration from one TOML file (plus env overrides) and validate it.
pub fn load_and_validate_path(
    path: &std::path::Path,
) -> Result<SqleaseConfig, Vec<ConfigError>> {
    finish(loader::load_config_from_path(path), || {
        std::fs::read_to_string(path)
            .map(|content| vec![(path.display().to_string(), content)])
            .unwrap_or_default()
    })
}

/// Load configuration from an inline TOML string and validate it.
pub fn load_and_validate_str(toml_content: &str) -> Result<SqleaseConfig, Vec<ConfigError>> {
    finish(loader::load_config_from_str(toml_content), || {
        vec![("<inline>".to_string(), toml_content.to_string())]
    })
}

fn finish(
    loaded: Result<SqleaseConfig, figment::Error>,
    sources: impl FnOnce() -> Vec<(String, String)>,
) -> Result<SqleaseConfig, Vec<ConfigError>> {
    match loaded {
        Ok(config) => {
            validation::validate_config(&config)?;
            Ok(config)
        }
        Err(err) => Err(diagnostic::figment_to_config_errors(err, &sources())),
    }
}

/// Read the TOML files the loader may have merged, for diagnostic spans.
fn collect_toml_sources() -> Vec<(String, String)> {
    loader::candidate_paths()
        .into_iter()
        .filter_map(|path| {
            let content = std::fs::read_to_string(&path).ok()?;
            Some((path.display().to_string(), content))
        })
        .collect()
}
