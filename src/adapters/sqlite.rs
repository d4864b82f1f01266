//! SQLite adapter.
//!
//! rusqlite is a blocking driver, so every statement runs on the dedicated
//! blocking pool via `spawn_blocking`. Cancellation is checked before each
//! statement and between streamed row batches; a statement already inside
//! the VM runs to its timeout.

use super::{
    enforce_read_only, ColumnInfo, DatabaseAdapter, Dialect, ForeignKeyInfo, IsolationLevel,
    QueryOptions, ResultSet, RowBatch, RowStream, Schema, SqlValue, TableInfo, TxHandle,
    STREAM_BATCH_SIZE,
};
use crate::error::{DbError, Result};
use crate::types::AbortSignal;
use async_trait::async_trait;
use rusqlite::Connection;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::debug;

/// SQLite adapter over a single shared connection.
pub struct SqliteAdapter {
    path: PathBuf,
    read_only: bool,
    /// Lazily opened; `connect` is idempotent.
    conn: Arc<Mutex<Option<Connection>>>,
    /// Savepoint frame depth for nested transactions.
    tx_depth: Mutex<usize>,
}

impl SqliteAdapter {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, read_only: bool) -> Self {
        Self {
            path: path.into(),
            read_only,
            conn: Arc::new(Mutex::new(None)),
            tx_depth: Mutex::new(0),
        }
    }

    fn open_if_needed(&self) -> Result<()> {
        let mut slot = self.conn.lock().expect("sqlite connection lock");
        if slot.is_some() {
            return Ok(());
        }
        let conn = if self.path.as_os_str() == ":memory:" {
            Connection::open_in_memory()
        } else {
            Connection::open(&self.path)
        }
        .map_err(|e| DbError::Connect(format!("sqlite open {}: {e}", self.path.display())))?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(map_sqlite_error)?;
        debug!(path = %self.path.display(), "sqlite connection opened");
        *slot = Some(conn);
        Ok(())
    }

    /// Run `f` against the connection on the blocking pool, aborting early
    /// if the signal trips while queued.
    async fn with_conn<T, F>(&self, signal: &AbortSignal, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        if signal.aborted() {
            return Err(DbError::Cancelled);
        }
        self.open_if_needed()?;
        let conn = Arc::clone(&self.conn);
        let task = tokio::task::spawn_blocking(move || {
            let guard = conn.lock().expect("sqlite connection lock");
            let conn = guard
                .as_ref()
                .ok_or_else(|| DbError::Connect("sqlite connection closed".into()))?;
            f(conn)
        });
        match task.await {
            Ok(result) => result,
            Err(e) => Err(DbError::Internal(format!("sqlite task join: {e}"))),
        }
    }
}

fn map_sqlite_error(e: rusqlite::Error) -> DbError {
    match &e {
        rusqlite::Error::SqliteFailure(code, _)
            if code.code == rusqlite::ErrorCode::OperationInterrupted =>
        {
            DbError::Cancelled
        }
        _ => DbError::query_with_detail("sqlite statement failed", e.to_string()),
    }
}

fn bind_params(params: &[SqlValue]) -> Vec<rusqlite::types::Value> {
    params
        .iter()
        .map(|p| match p {
            SqlValue::Null => rusqlite::types::Value::Null,
            SqlValue::Bool(b) => rusqlite::types::Value::Integer(i64::from(*b)),
            SqlValue::Int(i) => rusqlite::types::Value::Integer(*i),
            SqlValue::Float(f) => rusqlite::types::Value::Real(*f),
            SqlValue::Text(s) => rusqlite::types::Value::Text(s.clone()),
        })
        .collect()
}

fn read_value(row: &rusqlite::Row<'_>, idx: usize) -> SqlValue {
    use rusqlite::types::ValueRef;
    match row.get_ref(idx) {
        Ok(ValueRef::Null) | Err(_) => SqlValue::Null,
        Ok(ValueRef::Integer(i)) => SqlValue::Int(i),
        Ok(ValueRef::Real(f)) => SqlValue::Float(f),
        Ok(ValueRef::Text(t)) => SqlValue::Text(String::from_utf8_lossy(t).into_owned()),
        Ok(ValueRef::Blob(b)) => SqlValue::Text(format!("<blob {} bytes>", b.len())),
    }
}

fn run_query(
    conn: &Connection,
    sql: &str,
    params: &[SqlValue],
    max_rows: usize,
) -> Result<ResultSet> {
    let started = Instant::now();
    let mut stmt = conn.prepare(sql).map_err(map_sqlite_error)?;
    let columns: Vec<String> = stmt.column_names().iter().map(|c| (*c).to_string()).collect();

    if columns.is_empty() {
        // Mutation or DDL: no result columns.
        let affected = stmt
            .execute(rusqlite::params_from_iter(bind_params(params)))
            .map_err(map_sqlite_error)?;
        return Ok(ResultSet {
            columns,
            rows: Vec::new(),
            rows_affected: affected as u64,
            truncated: false,
            elapsed_ms: started.elapsed().as_millis() as u64,
        });
    }

    let mut rows = stmt
        .query(rusqlite::params_from_iter(bind_params(params)))
        .map_err(map_sqlite_error)?;
    let mut out: Vec<Vec<SqlValue>> = Vec::new();
    let mut truncated = false;
    while let Some(row) = rows.next().map_err(map_sqlite_error)? {
        if out.len() >= max_rows {
            truncated = true;
            break;
        }
        out.push((0..columns.len()).map(|i| read_value(row, i)).collect());
    }

    Ok(ResultSet {
        columns,
        rows: out,
        rows_affected: 0,
        truncated,
        elapsed_ms: started.elapsed().as_millis() as u64,
    })
}

#[async_trait]
impl DatabaseAdapter for SqliteAdapter {
    async fn connect(&self) -> Result<()> {
        self.open_if_needed()
    }

    async fn close(&self) -> Result<()> {
        let mut slot = self.conn.lock().expect("sqlite connection lock");
        slot.take();
        Ok(())
    }

    async fn execute_query(
        &self,
        sql: &str,
        params: &[SqlValue],
        opts: &QueryOptions,
        signal: &AbortSignal,
    ) -> Result<ResultSet> {
        enforce_read_only(sql, self.read_only || opts.read_only)?;
        let sql = sql.to_string();
        let params = params.to_vec();
        let max_rows = opts.max_rows;
        let timeout = opts.timeout;
        let work = self.with_conn(signal, move |conn| run_query(conn, &sql, &params, max_rows));
        match tokio::time::timeout(timeout, work).await {
            Ok(result) => result,
            Err(_) => Err(DbError::Timeout(timeout.as_millis() as u64)),
        }
    }

    async fn execute_stream(
        &self,
        sql: &str,
        params: &[SqlValue],
        opts: &QueryOptions,
        signal: &AbortSignal,
    ) -> Result<RowStream> {
        enforce_read_only(sql, self.read_only || opts.read_only)?;
        let (tx, rx) = mpsc::channel(4);
        let sql = sql.to_string();
        let params = params.to_vec();
        let conn = Arc::clone(&self.conn);
        self.open_if_needed()?;
        let signal = signal.clone();

        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().expect("sqlite connection lock");
            let Some(conn) = guard.as_ref() else {
                let _ = tx.blocking_send(Err(DbError::Connect("sqlite connection closed".into())));
                return;
            };
            let result: Result<()> = (|| {
                let mut stmt = conn.prepare(&sql).map_err(map_sqlite_error)?;
                let columns: Vec<String> =
                    stmt.column_names().iter().map(|c| (*c).to_string()).collect();
                let mut rows = stmt
                    .query(rusqlite::params_from_iter(bind_params(&params)))
                    .map_err(map_sqlite_error)?;
                let mut batch: Vec<Vec<SqlValue>> = Vec::with_capacity(STREAM_BATCH_SIZE);
                while let Some(row) = rows.next().map_err(map_sqlite_error)? {
                    if signal.aborted() {
                        return Err(DbError::Cancelled);
                    }
                    batch.push((0..columns.len()).map(|i| read_value(row, i)).collect());
                    if batch.len() == STREAM_BATCH_SIZE {
                        let out = RowBatch {
                            columns: columns.clone(),
                            rows: std::mem::take(&mut batch),
                        };
                        if tx.blocking_send(Ok(out)).is_err() {
                            return Ok(());
                        }
                    }
                }
                if !batch.is_empty() {
                    let _ = tx.blocking_send(Ok(RowBatch {
                        columns,
                        rows: batch,
                    }));
                }
                Ok(())
            })();
            if let Err(e) = result {
                let _ = tx.blocking_send(Err(e));
            }
        });

        Ok(rx)
    }

    async fn begin_tx(&self, _isolation: Option<IsolationLevel>) -> Result<TxHandle> {
        if self.read_only {
            return Err(DbError::ReadOnly("transactions are disabled".into()));
        }
        let signal = AbortSignal::new();
        let depth = *self.tx_depth.lock().expect("tx depth lock");
        let handle = if depth == 0 {
            self.with_conn(&signal, |conn| {
                conn.execute_batch("BEGIN").map_err(map_sqlite_error)
            })
            .await?;
            TxHandle {
                depth: 0,
                savepoint: None,
            }
        } else {
            let name = format!("sp_{depth}");
            let stmt = format!("SAVEPOINT {name}");
            self.with_conn(&signal, move |conn| {
                conn.execute_batch(&stmt).map_err(map_sqlite_error)
            })
            .await?;
            TxHandle {
                depth,
                savepoint: Some(name),
            }
        };
        *self.tx_depth.lock().expect("tx depth lock") += 1;
        Ok(handle)
    }

    async fn commit(&self, tx: &TxHandle) -> Result<()> {
        let stmt = match &tx.savepoint {
            Some(name) => format!("RELEASE SAVEPOINT {name}"),
            None => "COMMIT".to_string(),
        };
        let signal = AbortSignal::new();
        self.with_conn(&signal, move |conn| {
            conn.execute_batch(&stmt).map_err(map_sqlite_error)
        })
        .await?;
        let mut depth = self.tx_depth.lock().expect("tx depth lock");
        *depth = depth.saturating_sub(1);
        Ok(())
    }

    async fn rollback(&self, tx: &TxHandle) -> Result<()> {
        let stmt = match &tx.savepoint {
            Some(name) => format!("ROLLBACK TO SAVEPOINT {name}"),
            None => "ROLLBACK".to_string(),
        };
        let signal = AbortSignal::new();
        self.with_conn(&signal, move |conn| {
            conn.execute_batch(&stmt).map_err(map_sqlite_error)
        })
        .await?;
        let mut depth = self.tx_depth.lock().expect("tx depth lock");
        *depth = depth.saturating_sub(1);
        Ok(())
    }

    async fn introspect(&self) -> Result<Schema> {
        let signal = AbortSignal::new();
        self.with_conn(&signal, |conn| {
            let mut tables = Vec::new();
            let mut views = Vec::new();

            let mut stmt = conn
                .prepare(
                    "SELECT name, type FROM sqlite_master \
                     WHERE type IN ('table', 'view') AND name NOT LIKE 'sqlite_%' \
                     ORDER BY name",
                )
                .map_err(map_sqlite_error)?;
            let names: Vec<(String, String)> = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
                .map_err(map_sqlite_error)?
                .filter_map(std::result::Result::ok)
                .collect();

            for (name, kind) in names {
                if kind == "view" {
                    views.push(name);
                    continue;
                }
                let mut columns = Vec::new();
                let mut col_stmt = conn
                    .prepare(&format!("PRAGMA table_info({name})"))
                    .map_err(map_sqlite_error)?;
                let cols: Vec<(String, String, bool, bool, Option<String>)> = col_stmt
                    .query_map([], |row| {
                        Ok((
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, i64>(3)? == 0,
                            row.get::<_, i64>(5)? > 0,
                            row.get::<_, Option<String>>(4)?,
                        ))
                    })
                    .map_err(map_sqlite_error)?
                    .filter_map(std::result::Result::ok)
                    .collect();
                for (col_name, data_type, nullable, primary_key, default) in cols {
                    columns.push(ColumnInfo {
                        name: col_name,
                        data_type,
                        nullable,
                        primary_key,
                        default,
                    });
                }

                let mut idx_stmt = conn
                    .prepare(&format!("PRAGMA index_list({name})"))
                    .map_err(map_sqlite_error)?;
                let indexes: Vec<String> = idx_stmt
                    .query_map([], |row| row.get::<_, String>(1))
                    .map_err(map_sqlite_error)?
                    .filter_map(std::result::Result::ok)
                    .collect();

                let mut fk_stmt = conn
                    .prepare(&format!("PRAGMA foreign_key_list({name})"))
                    .map_err(map_sqlite_error)?;
                let foreign_keys: Vec<ForeignKeyInfo> = fk_stmt
                    .query_map([], |row| {
                        Ok(ForeignKeyInfo {
                            column: row.get(3)?,
                            references_table: row.get(2)?,
                            references_column: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
                        })
                    })
                    .map_err(map_sqlite_error)?
                    .filter_map(std::result::Result::ok)
                    .collect();

                tables.push(TableInfo {
                    name,
                    columns,
                    indexes,
                    foreign_keys,
                });
            }

            Ok(Schema { tables, views })
        })
        .await
    }

    async fn health_check(&self) -> Result<()> {
        let signal = AbortSignal::new();
        let probe = self.with_conn(&signal, |conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                .map_err(map_sqlite_error)
        });
        match tokio::time::timeout(std::time::Duration::from_secs(2), probe).await {
            Ok(Ok(1)) => Ok(()),
            Ok(Ok(other)) => Err(DbError::Connect(format!("health probe returned {other}"))),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(DbError::Timeout(2000)),
        }
    }

    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn read_only(&self) -> bool {
        self.read_only
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> SqliteAdapter {
        SqliteAdapter::new(":memory:", false)
    }

    #[tokio::test]
    async fn connect_is_idempotent() {
        let adapter = adapter();
        adapter.connect().await.expect("first connect");
        adapter.connect().await.expect("second connect");
        adapter.health_check().await.expect("healthy");
    }

    #[tokio::test]
    async fn query_returns_columns_and_rows() {
        let adapter = adapter();
        let signal = AbortSignal::new();
        let opts = QueryOptions::default();
        adapter
            .execute_query("CREATE TABLE t (a INTEGER, b TEXT)", &[], &opts, &signal)
            .await
            .expect("create");
        adapter
            .execute_query(
                "INSERT INTO t VALUES (1, 'x'), (2, 'y'), (3, 'z')",
                &[],
                &opts,
                &signal,
            )
            .await
            .expect("insert");

        let result = adapter
            .execute_query("SELECT * FROM t ORDER BY a LIMIT 2", &[], &opts, &signal)
            .await
            .expect("select");
        assert_eq!(result.columns, vec!["a", "b"]);
        assert_eq!(result.rows.len(), 2);
        assert_eq!(result.rows[0][0], SqlValue::Int(1));
        assert_eq!(result.rows[1][1], SqlValue::Text("y".into()));
        assert_eq!(result.rows_affected, 0);
        assert!(!result.truncated);
    }

    #[tokio::test]
    async fn max_rows_marks_truncation() {
        let adapter = adapter();
        let signal = AbortSignal::new();
        let opts = QueryOptions::default();
        adapter
            .execute_query("CREATE TABLE t (a INTEGER)", &[], &opts, &signal)
            .await
            .expect("create");
        adapter
            .execute_query("INSERT INTO t VALUES (1), (2), (3)", &[], &opts, &signal)
            .await
            .expect("insert");

        let capped = QueryOptions {
            max_rows: 2,
            ..QueryOptions::default()
        };
        let result = adapter
            .execute_query("SELECT a FROM t", &[], &capped, &signal)
            .await
            .expect("select");
        assert_eq!(result.rows.len(), 2);
        assert!(result.truncated);
    }

    #[tokio::test]
    async fn read_only_rejects_mutations() {
        let adapter = SqliteAdapter::new(":memory:", true);
        let signal = AbortSignal::new();
        let err = adapter
            .execute_query("CREATE TABLE t (a INT)", &[], &QueryOptions::default(), &signal)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "ReadOnlyError");
    }

    #[tokio::test]
    async fn nested_tx_uses_savepoints_and_preserves_outer_state() {
        let adapter = adapter();
        let signal = AbortSignal::new();
        let opts = QueryOptions::default();
        adapter
            .execute_query("CREATE TABLE t (a INTEGER)", &[], &opts, &signal)
            .await
            .expect("create");

        let outer = adapter.begin_tx(None).await.expect("outer begin");
        adapter
            .execute_query("INSERT INTO t VALUES (1)", &[], &opts, &signal)
            .await
            .expect("outer insert");

        let inner = adapter.begin_tx(None).await.expect("inner begin");
        assert!(inner.savepoint.is_some());
        adapter
            .execute_query("INSERT INTO t VALUES (2)", &[], &opts, &signal)
            .await
            .expect("inner insert");
        adapter.rollback(&inner).await.expect("inner rollback");

        adapter.commit(&outer).await.expect("outer commit");

        let result = adapter
            .execute_query("SELECT a FROM t ORDER BY a", &[], &opts, &signal)
            .await
            .expect("select");
        assert_eq!(result.rows.len(), 1);
        assert_eq!(result.rows[0][0], SqlValue::Int(1));
    }

    #[tokio::test]
    async fn introspect_lists_tables_and_keys() {
        let adapter = adapter();
        let signal = AbortSignal::new();
        let opts = QueryOptions::default();
        adapter
            .execute_query(
                "CREATE TABLE parent (id INTEGER PRIMARY KEY, label TEXT NOT NULL)",
                &[],
                &opts,
                &signal,
            )
            .await
            .expect("create parent");
        adapter
            .execute_query(
                "CREATE TABLE child (id INTEGER PRIMARY KEY, parent_id INTEGER REFERENCES parent(id))",
                &[],
                &opts,
                &signal,
            )
            .await
            .expect("create child");

        let schema = adapter.introspect().await.expect("introspect");
        assert_eq!(schema.tables.len(), 2);
        let child = schema
            .tables
            .iter()
            .find(|t| t.name == "child")
            .expect("child table");
        assert_eq!(child.foreign_keys.len(), 1);
        assert_eq!(child.foreign_keys[0].references_table, "parent");
        let parent = schema
            .tables
            .iter()
            .find(|t| t.name == "parent")
            .expect("parent table");
        let pk = parent.columns.iter().find(|c| c.primary_key).expect("pk");
        assert_eq!(pk.name, "id");
    }

    #[tokio::test]
    async fn streaming_delivers_all_rows_in_batches() {
        let adapter = adapter();
        let signal = AbortSignal::new();
        let opts = QueryOptions::default();
        adapter
            .execute_query("CREATE TABLE t (a INTEGER)", &[], &opts, &signal)
            .await
            .expect("create");
        for chunk in 0..3 {
            let values: Vec<String> =
                (0..200).map(|i| format!("({})", chunk * 200 + i)).collect();
            adapter
                .execute_query(
                    &format!("INSERT INTO t VALUES {}", values.join(",")),
                    &[],
                    &opts,
                    &signal,
                )
                .await
                .expect("insert");
        }

        let mut stream = adapter
            .execute_stream("SELECT a FROM t", &[], &opts, &signal)
            .await
            .expect("stream");
        let mut total = 0;
        while let Some(batch) = stream.recv().await {
            let batch = batch.expect("batch");
            assert_eq!(batch.columns, vec!["a"]);
            total += batch.rows.len();
        }
        assert_eq!(total, 600);
    }

    #[tokio::test]
    async fn aborted_signal_short_circuits() {
        let adapter = adapter();
        let signal = AbortSignal::new();
        signal.abort();
        let err = adapter
            .execute_query("SELECT 1", &[], &QueryOptions::default(), &signal)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "CancelledError");
    }
}
