// SPDX-FileCopyrightText: 2026 Sqlease Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Integration tests for the sqlease configuration system.

use std::time::Duration;

use figment::Jail;
use sqlease_config::diagnostic::ConfigError;
use sqlease_config::{load_and_validate_str, load_config_from_path, load_config_from_str};
use serial_test::serial;

#[test]
fn valid_toml_deserializes_into_sqlease_config() {
    let toml = r#"
[pool]
pool_size = 8
acquire_timeout_ms = 250
destroy_timeout_ms = 100

[storage]
database_path = "/tmp/app.db"
wal_mode = false
busy_timeout_ms = 10

[logging]
level = "debug"
"#;

    let config = load_config_from_str(toml).expect("valid TOML should deserialize");
    assert_eq!(config.pool.pool_size, 8);
    assert_eq!(config.pool.timeouts().acquire, Duration::from_millis(250));
    assert_eq!(config.pool.timeouts().destroy, Duration::from_millis(100));
    assert_eq!(config.storage.database_path, "/tmp/app.db");
    assert!(!config.storage.wal_mode);
    assert_eq!(config.storage.busy_timeout_ms, 10);
    assert_eq!(config.logging.level, "debug");
}

#[test]
fn empty_toml_uses_defaults() {
    let config = load_config_from_str("").expect("empty TOML should use defaults");
    assert_eq!(config.pool.pool_size, 4);
    assert_eq!(config.pool.acquire_timeout_ms, 5_000);
    assert_eq!(config.pool.destroy_timeout_ms, 2_000);
    assert!(config.storage.wal_mode);
    assert_eq!(config.logging.level, "info");
}

#[test]
fn unknown_pool_key_gets_suggestion() {
    let errors = load_and_validate_str("[pool]\npool_sise = 2\n").unwrap_err();
    assert_eq!(errors.len(), 1);
    match &errors[0] {
        ConfigError::UnknownKey {
            key,
            suggestion,
            ..
        } => {
            assert_eq!(key, "pool_sise");
            assert_eq!(suggestion.as_deref(), Some("pool_size"));
        }
        other => panic!("expected UnknownKey, got {other:?}"),
    }
}

#[test]
fn wrong_type_is_reported() {
    let errors = load_and_validate_str("[pool]\npool_size = \"many\"\n").unwrap_err();
    assert!(
        errors
            .iter()
            .any(|e| matches!(e, ConfigError::InvalidType { key, .. } if key.contains("pool_size"))),
        "got {errors:?}"
    );
}

#[test]
fn validation_runs_after_deserialization() {
    let errors = load_and_validate_str("[pool]\npool_size = 0\n").unwrap_err();
    assert!(matches!(&errors[0], ConfigError::Validation { message } if message.contains("pool_size")));
}

#[test]
#[serial]
fn env_var_overrides_file_value() {
    Jail::expect_with(|jail| {
        jail.create_file(
            "custom.toml",
            "[pool]\nacquire_timeout_ms = 100\npool_size = 2\n",
        )?;
        jail.set_env("SQLEASE_POOL_ACQUIRE_TIMEOUT_MS", "7");

        let config = load_config_from_path(std::path::Path::new("custom.toml"))?;
        assert_eq!(config.pool.acquire_timeout_ms, 7);
        assert_eq!(config.pool.pool_size, 2);
        Ok(())
    });
}

#[test]
#[serial]
fn env_var_with_underscored_key_maps_to_storage() {
    Jail::expect_with(|jail| {
        jail.create_file("custom.toml", "")?;
        jail.set_env("SQLEASE_STORAGE_BUSY_TIMEOUT_MS", "42");

        let config = load_config_from_path(std::path::Path::new("custom.toml"))?;
        assert_eq!(config.storage.busy_timeout_ms, 42);
        Ok(())
    });
}
