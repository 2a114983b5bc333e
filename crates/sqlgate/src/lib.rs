//! SQL safety gate for agent-issued queries.
//!
//! Raw SQL text is normalised, split and classified lexically. Statements
//! outside a small allow-list are refused, pure `SELECT` submissions run
//! straight away, and anything that writes data is parked behind a
//! short-lived, single-use confirmation token until a caller redeems it.
//!
//! [`Database`] is the SQLite implementation of the [`SqlExecutor`]
//! collaborator the gateway forwards approved SQL to.

pub mod classifier;
pub mod executor;
pub mod gateway;
pub mod sql;
pub mod tokens;

use std::{path::Path, str::FromStr, time::Duration};

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures::TryStreamExt;
use serde_json::{Number, Value};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteConnection, SqlitePoolOptions, SqliteRow},
    Column, Either, Executor, Row, SqlitePool, TypeInfo, ValueRef,
};
use tracing::debug;

pub use classifier::{Classification, QueryType};
pub use executor::{ExecutionResult, InsertId, SqlExecutor};
pub use gateway::{
    ConfirmedExecution, EstimatedImpact, ExecutionGateway, GatewayError, PendingMutation,
    ProposeOutcome, INVALID_TOKEN_MESSAGE,
};
pub use tokens::{ConfirmationTokenStore, IssuedToken, SweeperHandle, TokenStoreConfig};

/// Default SQLite busy timeout in milliseconds when the DB is under load.
const SQLITE_BUSY_TIMEOUT_MS: u64 = 5_000;

/// SQLite-backed database collaborator.
#[derive(Clone, Debug)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Establishes (or creates) a connection pool to the SQLite database located at
    /// the given URL (e.g. `sqlite:///var/lib/sqlgate/app.db`).
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_millis(SQLITE_BUSY_TIMEOUT_MS));

        // Every connection to `:memory:` is its own database, so the pool keeps
        // exactly one and never recycles it.
        let pool_options = SqlitePoolOptions::new().min_connections(1);
        let pool_options = if database_url.contains(":memory:") {
            pool_options
                .max_connections(1)
                .max_lifetime(None)
                .idle_timeout(None)
        } else {
            pool_options.max_connections(8)
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open database {database_url}"))?;

        Ok(Self { pool })
    }

    /// Connects to a file path via `sqlite://` scheme.
    pub async fn connect_file(path: &Path) -> Result<Self> {
        let url = format!("sqlite://{}", path.display());
        Self::connect(&url).await
    }

    /// Exposes the underlying pool, e.g. for fixtures and migrations owned by
    /// the embedding application.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl SqlExecutor for Database {
    async fn execute(&self, sql: &str) -> Result<ExecutionResult> {
        let mut conn = self.pool.acquire().await?;
        let mut result = ExecutionResult::default();
        let mut last_insert_rowid = 0_i64;

        // The driver reports connection-level counters, which a `SELECT` does
        // not reset. Only the delta across this submission is ours.
        let changes_before = total_changes(&mut conn).await?;
        {
            let mut steps = (&mut *conn).fetch_many(sql);
            while let Some(step) = steps.try_next().await? {
                match step {
                    Either::Left(done) => last_insert_rowid = done.last_insert_rowid(),
                    Either::Right(row) => {
                        if result.columns.is_empty() {
                            result.columns = row
                                .columns()
                                .iter()
                                .map(|column| column.name().to_string())
                                .collect();
                        }
                        result.rows.push(map_row(&row)?);
                    }
                }
            }
        }
        let changes_after = total_changes(&mut conn).await?;

        result.rows_affected = u64::try_from(changes_after - changes_before).unwrap_or_default();
        if result.rows_affected > 0 {
            result.last_insert_rowid = InsertId::from(last_insert_rowid);
        }
        debug!(
            rows = result.rows.len(),
            rows_affected = result.rows_affected,
            "sql executed"
        );
        Ok(result)
    }

    async fn schema(&self) -> Result<String> {
        let rows = sqlx::query(
            r#"
            SELECT sql FROM sqlite_master
            WHERE type IN ('table', 'view')
              AND name NOT LIKE 'sqlite_%'
              AND sql IS NOT NULL
            ORDER BY name
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut statements = Vec::with_capacity(rows.len());
        for row in rows {
            let sql: String = row.try_get("sql")?;
            statements.push(format!("{sql};"));
        }
        Ok(statements.join("\n"))
    }
}

async fn total_changes(conn: &mut SqliteConnection) -> Result<i64> {
    let changes = sqlx::query_scalar::<_, i64>("SELECT total_changes()")
        .fetch_one(conn)
        .await?;
    Ok(changes)
}

fn map_row(row: &SqliteRow) -> Result<Vec<Value>> {
    (0..row.len()).map(|index| map_value(row, index)).collect()
}

fn map_value(row: &SqliteRow, index: usize) -> Result<Value> {
    let storage_class = {
        let raw = row.try_get_raw(index)?;
        if raw.is_null() {
            return Ok(Value::Null);
        }
        raw.type_info().name().to_owned()
    };

    let value = match storage_class.as_str() {
        "INTEGER" => Value::from(row.try_get_unchecked::<i64, _>(index)?),
        "REAL" => Number::from_f64(row.try_get_unchecked::<f64, _>(index)?)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        "BLOB" => Value::String(STANDARD.encode(row.try_get_unchecked::<Vec<u8>, _>(index)?)),
        _ => Value::String(row.try_get_unchecked::<String, _>(index)?),
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const TEST_DB_URL: &str = "sqlite::memory:";

    async fn setup_db() -> Database {
        let db = Database::connect(TEST_DB_URL).await.unwrap();
        sqlx::query(
            "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL, score REAL, avatar BLOB)",
        )
        .execute(db.pool())
        .await
        .unwrap();
        db
    }

    #[tokio::test]
    async fn select_maps_storage_classes_to_json() {
        let db = setup_db().await;
        sqlx::query("INSERT INTO users (name, score, avatar) VALUES ('ada', 1.5, x'0102')")
            .execute(db.pool())
            .await
            .unwrap();

        let result = db
            .execute("SELECT id, name, score, avatar, NULL AS missing FROM users")
            .await
            .unwrap();

        assert_eq!(result.columns, vec!["id", "name", "score", "avatar", "missing"]);
        assert_eq!(
            result.rows,
            vec![vec![json!(1), json!("ada"), json!(1.5), json!("AQI="), Value::Null]]
        );
    }

    #[tokio::test]
    async fn insert_reports_rows_affected_and_rowid() {
        let db = setup_db().await;
        let result = db
            .execute("INSERT INTO users (name) VALUES ('a'); INSERT INTO users (name) VALUES ('b')")
            .await
            .unwrap();

        assert_eq!(result.rows_affected, 2);
        assert_eq!(result.last_insert_rowid, InsertId::Number(2));
        assert!(result.rows.is_empty());
    }

    #[tokio::test]
    async fn select_after_insert_reports_no_changes() {
        let db = setup_db().await;
        db.execute("INSERT INTO users (name) VALUES ('a'), ('b'), ('c')")
            .await
            .unwrap();

        let result = db.execute("SELECT name FROM users").await.unwrap();
        assert_eq!(result.rows.len(), 3);
        assert_eq!(result.rows_affected, 0);
        assert_eq!(result.last_insert_rowid, InsertId::Number(0));
    }

    #[tokio::test]
    async fn trailing_select_does_not_double_count_changes() {
        let db = setup_db().await;
        db.execute("INSERT INTO users (name) VALUES ('a'), ('b')")
            .await
            .unwrap();

        let result = db
            .execute("UPDATE users SET name = 'z' WHERE id = 1; SELECT name FROM users ORDER BY id")
            .await
            .unwrap();
        assert_eq!(result.rows_affected, 1);
        assert_eq!(result.rows, vec![vec![json!("z")], vec![json!("b")]]);
    }

    #[tokio::test]
    async fn in_memory_pool_never_recycles_its_connection() {
        let db = setup_db().await;
        let options = db.pool().options();
        assert_eq!(options.get_max_connections(), 1);
        assert_eq!(options.get_max_lifetime(), None);
        assert_eq!(options.get_idle_timeout(), None);
    }

    #[tokio::test]
    async fn large_rowids_are_reported_as_strings() {
        let db = setup_db().await;
        let result = db
            .execute("INSERT INTO users (id, name) VALUES (9007199254740993, 'big')")
            .await
            .unwrap();

        assert_eq!(
            result.last_insert_rowid,
            InsertId::Text("9007199254740993".into())
        );
    }

    #[tokio::test]
    async fn execution_errors_carry_the_driver_message() {
        let db = setup_db().await;
        let err = db.execute("SELECT * FROM missing_table").await.unwrap_err();
        assert!(format!("{err:#}").contains("no such table"));
    }

    #[tokio::test]
    async fn schema_lists_user_tables() {
        let db = setup_db().await;
        let schema = db.schema().await.unwrap();
        assert!(schema.starts_with("CREATE TABLE users"));
        assert!(schema.ends_with(';'));
        assert!(!schema.contains("sqlite_"));
    }
}
