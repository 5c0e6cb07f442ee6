// SPDX-FileCopyrightText: 2026 Sqlease Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Subcommand implementations.

use serde_json::{json, Map, Value as Json};
use sqlease_config::SqleaseConfig;
use sqlease_core::{HealthStatus, SqleaseError, StatementResult, Value};
use sqlease_pool::Driver;
use sqlease_storage::SqliteEngine;

/// Interpret a `--param` argument: integers, then reals, then `null`, else text.
pub fn parse_param(raw: &str) -> Value {
    if let Ok(i) = raw.parse::<i64>() {
        Value::Integer(i)
    } else if let Ok(f) = raw.parse::<f64>() {
        Value::Real(f)
    } else if raw.eq_ignore_ascii_case("null") {
        Value::Null
    } else {
        Value::Text(raw.to_string())
    }
}

pub fn parse_params(raw: &[String]) -> Vec<Value> {
    raw.iter().map(|p| parse_param(p)).collect()
}

fn cell_to_json(cell: &Value) -> Json {
    match cell {
        Value::Null => Json::Null,
        Value::Integer(i) => Json::from(*i),
        Value::Real(f) => Json::from(*f),
        Value::Text(s) => Json::from(s.as_str()),
        Value::Blob(b) => Json::from(b.clone()),
    }
}

/// One JSON object per row, keyed by column name.
fn rows_to_json(result: &StatementResult) -> Vec<Json> {
    result
        .rows
        .iter()
        .map(|row| {
            let object: Map<String, Json> = result
                .columns
                .iter()
                .cloned()
                .zip(row.iter().map(cell_to_json))
                .collect();
            Json::Object(object)
        })
        .collect()
}

pub async fn run_query(
    driver: &Driver<SqliteEngine>,
    sql: &str,
    params: &[Value],
) -> Result<(), SqleaseError> {
    let result = driver.query(sql, params).await?;
    for line in rows_to_json(&result) {
        println!("{line}");
    }
    Ok(())
}

pub async fn run_exec(
    driver: &Driver<SqliteEngine>,
    sql: &str,
    params: &[Value],
) -> Result<(), SqleaseError> {
    let result = driver.execute(sql, params).await?;
    if result.columns.is_empty() {
        println!(
            "{}",
            json!({ "changes": result.changes, "last_insert_rowid": result.last_insert_rowid })
        );
    } else {
        for line in rows_to_json(&result) {
            println!("{line}");
        }
    }
    Ok(())
}

/// Print health and pool statistics. An unhealthy probe is an error.
pub async fn run_check(
    driver: &Driver<SqliteEngine>,
    config: &SqleaseConfig,
) -> Result<(), SqleaseError> {
    let health = driver.health_check().await;
    let stats = driver.stats();

    println!("database: {}", config.storage.database_path);
    println!("health:   {health:?}");
    println!(
        "readers:  {} leased, {} idle, {} allocated of {} (created {}, destroyed {}, timeouts {})",
        stats.readers.leased,
        stats.readers.idle,
        stats.readers.allocated,
        stats.readers.max_size,
        stats.readers.created_total,
        stats.readers.destroyed_total,
        stats.readers.timeouts_total,
    );
    println!(
        "writer:   {:?} (created {}, destroyed {}, timeouts {})",
        stats.writer.state,
        stats.writer.created_total,
        stats.writer.destroyed_total,
        stats.writer.timeouts_total,
    );
    if let Some(bytes) = allocated_bytes() {
        println!("heap:     {bytes} bytes allocated");
    }

    match health {
        HealthStatus::Unhealthy(reason) => Err(SqleaseError::Internal(format!(
            "database is unhealthy: {reason}"
        ))),
        _ => Ok(()),
    }
}

#[cfg(not(target_env = "msvc"))]
fn allocated_bytes() -> Option<usize> {
    use tikv_jemalloc_ctl::{epoch, stats};
    epoch::advance().ok()?;
    stats::allocated::read().ok()
}

#[cfg(target_env = "msvc")]
fn allocated_bytes() -> Option<usize> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_prefer_integers_then_reals() {
        assert_eq!(parse_param("42"), Value::Integer(42));
        assert_eq!(parse_param("-1.5"), Value::Real(-1.5));
        assert_eq!(parse_param("NULL"), Value::Null);
        assert_eq!(parse_param("hello"), Value::Text("hello".into()));
    }

    #[test]
    fn rows_are_keyed_by_column() {
        let result = StatementResult {
            columns: vec!["id".into(), "name".into(), "data".into()],
            rows: vec![vec![Value::Integer(1), Value::from("a"), Value::Blob(vec![7])]],
            ..StatementResult::default()
        };
        assert_eq!(
            rows_to_json(&result),
            vec![json!({ "id": 1, "name": "a", "data": [7] })]
        );
    }

    #[tokio::test]
    async fn query_and_exec_against_a_temp_database() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = SqleaseConfig::default();
        config.storage.database_path = dir.path().join("cli.db").to_string_lossy().into_owned();
        let driver = Driver::with_tracing_sink(
            std::sync::Arc::new(SqliteEngine::new(&config.storage)),
            &config.pool,
        );
        driver.connect().await.unwrap();

        run_exec(&driver, "CREATE TABLE t (x INTEGER)", &[]).await.unwrap();
        run_exec(&driver, "INSERT INTO t VALUES (?1)", &parse_params(&["3".into()]))
            .await
            .unwrap();
        run_query(&driver, "SELECT x FROM t", &[]).await.unwrap();
        run_check(&driver, &config).await.unwrap();
        driver.close().await;
    }
}
