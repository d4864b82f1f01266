//! Dialect-agnostic database adapter layer.
//!
//! Every supported database implements [`DatabaseAdapter`]; the rest of the
//! core only ever talks to the trait. Adapters are not assumed thread-safe
//! for concurrent statements — the `ConnectionManager` serializes in-flight
//! statements per connection.

mod factory;
mod mysql;
mod postgres;
mod sqlite;
mod url;

pub use factory::{probe_drivers, AdapterFactory, DatabaseProfile, DriverProbe};
pub use url::ConnectionString;

use crate::error::Result;
use crate::types::AbortSignal;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;

/// Supported database dialects.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    Sqlite,
    Postgres,
    Mysql,
}

impl Dialect {
    /// Canonical scheme used when serializing a connection string.
    #[must_use]
    pub const fn scheme(self) -> &'static str {
        match self {
            Self::Sqlite => "sqlite",
            Self::Postgres => "postgresql",
            Self::Mysql => "mysql",
        }
    }
}

impl std::fmt::Display for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.scheme())
    }
}

/// A single bind parameter value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl SqlValue {
    /// Best-effort conversion from a JSON argument value.
    #[must_use]
    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(*b),
            serde_json::Value::Number(n) => n.as_i64().map_or_else(
                || Self::Float(n.as_f64().unwrap_or(0.0)),
                Self::Int,
            ),
            serde_json::Value::String(s) => Self::Text(s.clone()),
            other => Self::Text(other.to_string()),
        }
    }

    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Null => serde_json::Value::Null,
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Int(i) => serde_json::Value::from(*i),
            Self::Float(f) => serde_json::Value::from(*f),
            Self::Text(s) => serde_json::Value::String(s.clone()),
        }
    }
}

/// Options applied to a single statement execution.
#[derive(Clone, Debug)]
pub struct QueryOptions {
    /// Statement deadline
    pub timeout: Duration,
    /// Row cap for result sets; excess rows set `truncated`
    pub max_rows: usize,
    /// Reject the statement if it would mutate
    pub read_only: bool,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_rows: 1000,
            read_only: false,
        }
    }
}

/// Result of one statement execution.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<SqlValue>>,
    /// Driver-reported affected rows for mutations; 0 for reads
    pub rows_affected: u64,
    /// True when `max_rows` cut the result short
    pub truncated: bool,
    pub elapsed_ms: u64,
}

impl ResultSet {
    /// JSON shape fed back to the model as a function response.
    #[must_use]
    pub fn to_response_value(&self) -> serde_json::Value {
        serde_json::json!({
            "columns": self.columns,
            "rows": self
                .rows
                .iter()
                .map(|row| row.iter().map(SqlValue::to_json).collect::<Vec<_>>())
                .collect::<Vec<_>>(),
            "rows_affected": self.rows_affected,
            "truncated": self.truncated,
            "elapsed_ms": self.elapsed_ms,
        })
    }
}

/// One batch from a streaming query. Columns are repeated per batch so each
/// batch is self-describing.
#[derive(Clone, Debug)]
pub struct RowBatch {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<SqlValue>>,
}

/// Receiver side of a streaming query: finite, not restartable.
pub type RowStream = mpsc::Receiver<Result<RowBatch>>;

/// Handle for an open transaction or savepoint frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxHandle {
    /// Frame depth: 0 is the outermost transaction, deeper frames are savepoints
    pub depth: usize,
    /// Savepoint name for nested frames
    pub savepoint: Option<String>,
}

/// Transaction isolation level, mapped per dialect where supported.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

/// Column description from introspection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    pub primary_key: bool,
    pub default: Option<String>,
}

/// Table description from introspection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TableInfo {
    pub name: String,
    pub columns: Vec<ColumnInfo>,
    pub indexes: Vec<String>,
    pub foreign_keys: Vec<ForeignKeyInfo>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ForeignKeyInfo {
    pub column: String,
    pub references_table: String,
    pub references_column: String,
}

/// Snapshot of a database's structure.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    pub tables: Vec<TableInfo>,
    pub views: Vec<String>,
}

/// Contract every adapter implements.
///
/// `connect` is idempotent; `execute_query` and `execute_stream` honor the
/// abort signal cooperatively (in-flight statements are asked to cancel via
/// the dialect-specific mechanism where one exists).
#[async_trait]
pub trait DatabaseAdapter: Send + Sync {
    /// Establish the underlying connection. Calling this twice has the same
    /// observable state as calling it once.
    async fn connect(&self) -> Result<()>;

    /// Close the underlying connection.
    async fn close(&self) -> Result<()>;

    /// Execute one statement and collect its result.
    async fn execute_query(
        &self,
        sql: &str,
        params: &[SqlValue],
        opts: &QueryOptions,
        signal: &AbortSignal,
    ) -> Result<ResultSet>;

    /// Execute one statement, streaming rows in batches. The stream is
    /// finite and not restartable.
    async fn execute_stream(
        &self,
        sql: &str,
        params: &[SqlValue],
        opts: &QueryOptions,
        signal: &AbortSignal,
    ) -> Result<RowStream>;

    /// Begin a transaction, or a savepoint when one is already open.
    async fn begin_tx(&self, isolation: Option<IsolationLevel>) -> Result<TxHandle>;

    /// Commit the given frame.
    async fn commit(&self, tx: &TxHandle) -> Result<()>;

    /// Roll back the given frame.
    async fn rollback(&self, tx: &TxHandle) -> Result<()>;

    /// Describe the database's structure.
    async fn introspect(&self) -> Result<Schema>;

    /// Cheap liveness probe (`SELECT 1` or equivalent) with a bounded timeout.
    async fn health_check(&self) -> Result<()>;

    /// The adapter's dialect.
    fn dialect(&self) -> Dialect;

    /// Whether this adapter rejects mutations.
    fn read_only(&self) -> bool;
}

/// Shared batch size for `execute_stream` implementations.
pub(crate) const STREAM_BATCH_SIZE: usize = 256;

/// Reject a mutating statement when the connection is read-only.
pub(crate) fn enforce_read_only(sql: &str, read_only: bool) -> Result<()> {
    if read_only && crate::risk::classify_statement(sql).is_mutation() {
        return Err(crate::error::DbError::ReadOnly(format!(
            "statement rejected: {}",
            sql.chars().take(80).collect::<String>()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sql_value_json_round_trip() {
        let values = vec![
            SqlValue::Null,
            SqlValue::Bool(true),
            SqlValue::Int(-7),
            SqlValue::Float(1.5),
            SqlValue::Text("x".into()),
        ];
        for value in values {
            assert_eq!(SqlValue::from_json(&value.to_json()), value);
        }
    }

    #[test]
    fn result_set_response_shape() {
        let result = ResultSet {
            columns: vec!["a".into(), "b".into()],
            rows: vec![
                vec![SqlValue::Int(1), SqlValue::Text("x".into())],
                vec![SqlValue::Int(2), SqlValue::Text("y".into())],
            ],
            rows_affected: 0,
            truncated: false,
            elapsed_ms: 3,
        };
        let value = result.to_response_value();
        assert_eq!(value["columns"][0], "a");
        assert_eq!(value["rows"][1][1], "y");
        assert_eq!(value["rows_affected"], 0);
    }

    #[test]
    fn read_only_enforcement_blocks_mutations_only() {
        assert!(enforce_read_only("SELECT 1", true).is_ok());
        assert!(enforce_read_only("EXPLAIN DELETE FROM t", true).is_ok());
        let err = enforce_read_only("DELETE FROM t", true).unwrap_err();
        assert_eq!(err.kind(), "ReadOnlyError");
        assert!(enforce_read_only("DELETE FROM t", false).is_ok());
    }
}
