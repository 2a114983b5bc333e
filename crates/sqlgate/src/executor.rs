//! Database collaborator contract consumed by the gateway.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Serialize, Serializer};
use serde_json::Value;

/// Largest integer magnitude a JSON consumer can hold without rounding (2^53 - 1).
pub const MAX_SAFE_INTEGER: i64 = 9_007_199_254_740_991;

/// Row id of the last insert, kept exact on the wire.
///
/// Values outside `±MAX_SAFE_INTEGER` are carried as decimal strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertId {
    Number(i64),
    Text(String),
}

impl From<i64> for InsertId {
    fn from(value: i64) -> Self {
        if (-MAX_SAFE_INTEGER..=MAX_SAFE_INTEGER).contains(&value) {
            InsertId::Number(value)
        } else {
            InsertId::Text(value.to_string())
        }
    }
}

impl Default for InsertId {
    fn default() -> Self {
        InsertId::Number(0)
    }
}

impl Serialize for InsertId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            InsertId::Number(value) => serializer.serialize_i64(*value),
            InsertId::Text(value) => serializer.serialize_str(value),
        }
    }
}

/// Outcome of running a piece of SQL text.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub rows_affected: u64,
    pub last_insert_rowid: InsertId,
}

/// The database the gate forwards approved SQL to.
#[async_trait]
pub trait SqlExecutor: Send + Sync {
    /// Runs the text as given, which may hold several statements.
    async fn execute(&self, sql: &str) -> Result<ExecutionResult>;

    /// Human readable schema description, handed to whoever writes the SQL.
    async fn schema(&self) -> Result<String>;
}
