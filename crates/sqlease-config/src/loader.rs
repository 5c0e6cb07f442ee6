// SPDX-FileCopyrightText: 2026 Sqlease Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Figment-based loader.
//!
//! Merge order, later wins: compiled defaults, `/etc/sqlease/sqlease.toml`,
//! `~/.config/sqlease/sqlease.toml`, `./sqlease.toml`, `SQLEASE_*` env vars.

#![allow(clippy::result_large_err)] // figment::Error is external

use std::path::{Path, PathBuf};

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};

use tracing::debug;

use crate::model::SqleaseConfig;

/// Section names that env keys are split on.
const SECTIONS: &[&str] = &["pool", "storage", "logging"];

/// Config files consulted by [`load_config`], lowest precedence first.
pub fn candidate_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from("/etc/sqlease/sqlease.toml")];
    if let Some(dir) = dirs::config_dir() {
        paths.push(dir.join("sqlease/sqlease.toml"));
    }
    paths.push(PathBuf::from("sqlease.toml"));
    paths
}

/// Build the full layered figment without extracting it.
pub fn build_figment() -> Figment {
    candidate_paths()
        .into_iter()
        .fold(defaults(), |figment, path| {
            if path.is_file() {
                debug!(path = %path.display(), "merging config file");
            }
            figment.merge(Toml::file(path))
        })
        .merge(env_provider())
}

/// Load configuration from the standard hierarchy with env overrides.
pub fn load_config() -> Result<SqleaseConfig, figment::Error> {
    build_figment().extract()
}

/// Load configuration from an inline TOML string only (no files, no env).
pub fn load_config_from_str(toml_content: &str) -> Result<SqleaseConfig, figment::Error> {
    defaults().merge(Toml::string(toml_content)).extract()
}

/// Load configuration from one file path with env overrides.
pub fn load_config_from_path(path: &Path) -> Result<SqleaseConfig, figment::Error> {
    debug!(path = %path.display(), "loading config file");
    defaults()
        .merge(Toml::file(path))
        .merge(env_provider())
        .extract()
}

fn defaults() -> Figment {
    Figment::new().merge(Serialized::defaults(SqleaseConfig::default()))
}

/// Env provider with explicit section mapping.
///
/// Keys contain underscores (`acquire_timeout_ms`), so splitting on `_` would
/// be ambiguous; only the leading section name becomes a dot.
pub(crate) fn env_provider() -> Env {
    Env::prefixed("SQLEASE_").map(|key| map_env_key(key.as_str()).into())
}

pub(crate) fn map_env_key(key: &str) -> String {
    for section in SECTIONS {
        if let Some(rest) = key
            .strip_prefix(section)
            .and_then(|rest| rest.strip_prefix('_'))
        {
            return format!("{section}.{rest}");
        }
    }
    key.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;
    use serial_test::serial;
    use tracing_test::traced_test;

    #[test]
    fn env_keys_map_only_the_section() {
        assert_eq!(map_env_key("pool_acquire_timeout_ms"), "pool.acquire_timeout_ms");
        assert_eq!(map_env_key("storage_busy_timeout_ms"), "storage.busy_timeout_ms");
        assert_eq!(map_env_key("logging_level"), "logging.level");
        assert_eq!(map_env_key("unrelated"), "unrelated");
    }

    #[test]
    fn candidate_paths_end_with_local_file() {
        let paths = candidate_paths();
        assert_eq!(paths.last(), Some(&PathBuf::from("sqlease.toml")));
    }

    #[test]
    #[serial]
    #[traced_test]
    fn local_config_file_is_logged_when_merged() {
        Jail::expect_with(|jail| {
            jail.create_file("sqlease.toml", "[pool]\npool_size = 3\n")?;
            let config: SqleaseConfig = build_figment().extract()?;
            assert_eq!(config.pool.pool_size, 3);
            assert!(logs_contain("merging config file"));
            Ok(())
        });
    }

    #[test]
    #[serial]
    #[traced_test]
    fn explicit_path_is_logged() {
        Jail::expect_with(|jail| {
            jail.create_file("custom.toml", "[pool]\npool_size = 2\n")?;
            let config = load_config_from_path(Path::new("custom.toml"))?;
            assert_eq!(config.pool.pool_size, 2);
            assert!(logs_contain("loading config file"));
            Ok(())
        });
    }
}
