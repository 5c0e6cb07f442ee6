// SPDX-FileCopyrightText: 2026 Sqlease Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! sqlease - run statements against a WAL SQLite file through the lease core.

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

mod commands;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use sqlease_config::SqleaseConfig;
use sqlease_core::SqleaseError;
use sqlease_pool::Driver;
use sqlease_storage::SqliteEngine;

/// sqlease - single-writer, multi-reader SQLite access.
#[derive(Parser, Debug)]
#[command(name = "sqlease", version, about, long_about = None)]
struct Cli {
    /// Read configuration from this TOML file instead of the default locations.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Override `storage.database_path`.
    #[arg(long, global = true, value_name = "PATH")]
    db: Option<String>,

    /// Print lease metrics in Prometheus text format after the command.
    #[arg(long, global = true)]
    metrics: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a read-only statement on a pooled reader and print rows as JSON lines.
    Query {
        sql: String,
        /// Positional statement parameter; repeat for ?1, ?2, ...
        #[arg(long = "param", value_name = "VALUE")]
        params: Vec<String>,
    },
    /// Run a statement on the writer and print the change count.
    Exec {
        sql: String,
        #[arg(long = "param", value_name = "VALUE")]
        params: Vec<String>,
    },
    /// Connect, probe a reader, and print pool statistics.
    Check,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let loaded = match &cli.config {
        Some(path) => sqlease_config::load_and_validate_path(path),
        None => sqlease_config::load_and_validate(),
    };
    let mut config = match loaded {
        Ok(config) => config,
        Err(errors) => {
            sqlease_config::render_errors(&errors);
            std::process::exit(1);
        }
    };
    if let Some(db) = cli.db {
        config.storage.database_path = db;
    }

    init_tracing(&config.logging.level);

    let metrics = if cli.metrics {
        match install_metrics() {
            Ok(handle) => Some(handle),
            Err(e) => {
                eprintln!("sqlease: {e}");
                std::process::exit(1);
            }
        }
    } else {
        None
    };

    let engine = Arc::new(SqliteEngine::new(&config.storage));
    let driver = Driver::with_tracing_sink(engine, &config.pool);
    let outcome = run(&driver, &config, cli.command).await;
    driver.close().await;

    if let Some(handle) = metrics {
        print!("{}", handle.render());
    }
    if let Err(e) = outcome {
        eprintln!("sqlease: {e}");
        std::process::exit(1);
    }
}

async fn run(
    driver: &Driver<SqliteEngine>,
    config: &SqleaseConfig,
    command: Commands,
) -> Result<(), SqleaseError> {
    driver.connect().await?;
    match command {
        Commands::Query { sql, params } => {
            commands::run_query(driver, &sql, &commands::parse_params(&params)).await
        }
        Commands::Exec { sql, params } => {
            commands::run_exec(driver, &sql, &commands::parse_params(&params)).await
        }
        Commands::Check => commands::run_check(driver, config).await,
    }
}

/// Initializes the tracing subscriber. Logs go to stderr; stdout carries results.
fn init_tracing(log_level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "sqlease={log_level},sqlease_pool={log_level},sqlease_storage={log_level},sqlease_core={log_level},warn"
        ))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .init();
}

fn install_metrics() -> Result<PrometheusHandle, SqleaseError> {
    let handle = PrometheusBuilder::new().install_recorder().map_err(|e| {
        SqleaseError::Internal(format!("failed to install Prometheus recorder: {e}"))
    })?;
    sqlease_pool::recording::register_metrics();
    tracing::debug!("prometheus metrics recorder installed");
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    #[cfg(not(target_env = "msvc"))]
    fn jemalloc_is_active() {
        use tikv_jemalloc_ctl::{epoch, stats};
        epoch::advance().unwrap();
        let allocated = stats::allocated::read().unwrap();
        assert!(allocated > 0, "jemalloc should report non-zero allocation");
    }

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn global_flags_parse_after_subcommand() {
        let cli = Cli::try_parse_from([
            "sqlease", "query", "SELECT ?1", "--param", "5", "--db", "/tmp/x.db", "--metrics",
        ])
        .unwrap();
        assert_eq!(cli.db.as_deref(), Some("/tmp/x.db"));
        assert!(cli.metrics);
        match cli.command {
            Commands::Query { sql, params } => {
                assert_eq!(sql, "SELECT ?1");
                assert_eq!(params, vec!["5"]);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    #[serial_test::serial]
    fn binary_loads_config_defaults() {
        let config = sqlease_config::load_and_validate().expect("default config should be valid");
        assert_eq!(config.pool.pool_size, 4);
    }
}
