//! MySQL / MariaDB adapter.
//!
//! Mirrors the postgres adapter's shape: a lazily created pool, a pinned
//! connection while a transaction frame is open, savepoints for nesting.

use super::{
    enforce_read_only, ColumnInfo, ConnectionString, DatabaseAdapter, Dialect, ForeignKeyInfo,
    IsolationLevel, QueryOptions, ResultSet, RowBatch, RowStream, Schema, SqlValue, TableInfo,
    TxHandle, STREAM_BATCH_SIZE,
};
use crate::error::{DbError, Result};
use crate::types::AbortSignal;
use async_trait::async_trait;
use mysql_async::prelude::Queryable;
use mysql_async::{Conn, OptsBuilder, Params, Pool, Row, Value as MyValue};
use std::time::Instant;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

/// MySQL adapter backed by a connection pool.
pub struct MysqlAdapter {
    config: ConnectionString,
    read_only: bool,
    pool: Mutex<Option<Pool>>,
    /// Connection pinned by an open transaction, with its savepoint depth.
    tx_state: Mutex<Option<(Conn, usize)>>,
}

impl MysqlAdapter {
    #[must_use]
    pub fn new(config: ConnectionString, read_only: bool) -> Self {
        Self {
            config,
            read_only,
            pool: Mutex::new(None),
            tx_state: Mutex::new(None),
        }
    }

    async fn pool(&self) -> Result<Pool> {
        let mut slot = self.pool.lock().await;
        if let Some(pool) = slot.as_ref() {
            return Ok(pool.clone());
        }
        let opts = OptsBuilder::default()
            .ip_or_hostname(self.config.host.clone().unwrap_or_else(|| "localhost".into()))
            .tcp_port(self.config.effective_port())
            .user(self.config.user.clone())
            .pass(self.config.password.clone())
            .db_name(self.config.database.clone());
        let pool = Pool::new(opts);
        debug!(
            host = self.config.host.as_deref().unwrap_or(""),
            db = self.config.database.as_deref().unwrap_or(""),
            "mysql pool created"
        );
        *slot = Some(pool.clone());
        Ok(pool)
    }

    async fn conn(&self) -> Result<Conn> {
        let pool = self.pool().await?;
        pool.get_conn().await.map_err(map_mysql_error)
    }
}

fn map_mysql_error(e: mysql_async::Error) -> DbError {
    match &e {
        mysql_async::Error::Server(server) => {
            // 1044/1045: access denied
            if server.code == 1044 || server.code == 1045 {
                DbError::Auth(server.message.clone())
            } else {
                DbError::query_with_detail(server.message.clone(), server.code.to_string())
            }
        }
        mysql_async::Error::Io(_) => DbError::Connect(e.to_string()),
        _ => DbError::query_with_detail("mysql statement failed", e.to_string()),
    }
}

fn to_mysql_params(params: &[SqlValue]) -> Params {
    if params.is_empty() {
        return Params::Empty;
    }
    Params::Positional(
        params
            .iter()
            .map(|p| match p {
                SqlValue::Null => MyValue::NULL,
                SqlValue::Bool(b) => MyValue::Int(i64::from(*b)),
                SqlValue::Int(i) => MyValue::Int(*i),
                SqlValue::Float(f) => MyValue::Double(*f),
                SqlValue::Text(s) => MyValue::Bytes(s.clone().into_bytes()),
            })
            .collect(),
    )
}

fn read_mysql_value(row: &Row, idx: usize) -> SqlValue {
    match row.as_ref(idx) {
        None | Some(MyValue::NULL) => SqlValue::Null,
        Some(MyValue::Int(i)) => SqlValue::Int(*i),
        Some(MyValue::UInt(u)) => SqlValue::Int(*u as i64),
        Some(MyValue::Float(f)) => SqlValue::Float(f64::from(*f)),
        Some(MyValue::Double(d)) => SqlValue::Float(*d),
        Some(MyValue::Bytes(b)) => SqlValue::Text(String::from_utf8_lossy(b).into_owned()),
        Some(other) => SqlValue::Text(other.as_sql(true)),
    }
}

async fn run_on_conn(
    conn: &mut Conn,
    sql: &str,
    params: &[SqlValue],
    max_rows: usize,
) -> Result<ResultSet> {
    let started = Instant::now();
    let mut result = conn
        .exec_iter(sql, to_mysql_params(params))
        .await
        .map_err(map_mysql_error)?;
    let columns: Vec<String> = result
        .columns()
        .map(|cols| cols.iter().map(|c| c.name_str().into_owned()).collect())
        .unwrap_or_default();

    let mut rows: Vec<Vec<SqlValue>> = Vec::new();
    let mut truncated = false;
    while let Some(row) = result.next().await.map_err(map_mysql_error)? {
        if rows.len() >= max_rows {
            truncated = true;
            continue; // drain the protocol stream
        }
        rows.push((0..columns.len()).map(|i| read_mysql_value(&row, i)).collect());
    }
    let rows_affected = if columns.is_empty() {
        result.affected_rows()
    } else {
        0
    };
    drop(result);

    Ok(ResultSet {
        columns,
        rows,
        rows_affected,
        truncated,
        elapsed_ms: started.elapsed().as_millis() as u64,
    })
}

#[async_trait]
impl DatabaseAdapter for MysqlAdapter {
    async fn connect(&self) -> Result<()> {
        self.health_check().await
    }

    async fn close(&self) -> Result<()> {
        self.tx_state.lock().await.take();
        let mut slot = self.pool.lock().await;
        if let Some(pool) = slot.take() {
            pool.disconnect().await.map_err(map_mysql_error)?;
        }
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
        if signal.aborted() {
            return Err(DbError::Cancelled);
        }

        // Statements inside an open transaction run on the pinned connection.
        let mut state = self.tx_state.lock().await;
        let work = async {
            match state.as_mut() {
                Some((conn, _)) => run_on_conn(conn, sql, params, opts.max_rows).await,
                None => {
                    let mut conn = self.conn().await?;
                    run_on_conn(&mut conn, sql, params, opts.max_rows).await
                }
            }
        };

        tokio::select! {
            result = tokio::time::timeout(opts.timeout, work) => match result {
                Ok(inner) => inner,
                Err(_) => Err(DbError::Timeout(opts.timeout.as_millis() as u64)),
            },
            () = signal.cancelled() => Err(DbError::Cancelled),
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
        let mut conn = self.conn().await?;
        let (tx, rx) = mpsc::channel(4);
        let sql = sql.to_string();
        let params = params.to_vec();
        let signal = signal.clone();

        tokio::spawn(async move {
            let mut result = match conn.exec_iter(sql, to_mysql_params(&params)).await {
                Ok(result) => result,
                Err(e) => {
                    let _ = tx.send(Err(map_mysql_error(e))).await;
                    return;
                }
            };
            let columns: Vec<String> = result
                .columns()
                .map(|cols| cols.iter().map(|c| c.name_str().into_owned()).collect())
                .unwrap_or_default();
            let mut batch: Vec<Vec<SqlValue>> = Vec::with_capacity(STREAM_BATCH_SIZE);
            loop {
                if signal.aborted() {
                    let _ = tx.send(Err(DbError::Cancelled)).await;
                    return;
                }
                match result.next().await {
                    Ok(Some(row)) => {
                        batch.push(
                            (0..columns.len())
                                .map(|i| read_mysql_value(&row, i))
                                .collect(),
                        );
                        if batch.len() == STREAM_BATCH_SIZE {
                            let out = RowBatch {
                                columns: columns.clone(),
                                rows: std::mem::take(&mut batch),
                            };
                            if tx.send(Ok(out)).await.is_err() {
                                return;
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        let _ = tx.send(Err(map_mysql_error(e))).await;
                        return;
                    }
                }
            }
            if !batch.is_empty() {
                let _ = tx
                    .send(Ok(RowBatch {
                        columns,
                        rows: batch,
                    }))
                    .await;
            }
        });

        Ok(rx)
    }

    async fn begin_tx(&self, isolation: Option<IsolationLevel>) -> Result<TxHandle> {
        if self.read_only {
            return Err(DbError::ReadOnly("transactions are disabled".into()));
        }
        let mut state = self.tx_state.lock().await;
        match state.as_mut() {
            None => {
                let mut conn = self.conn().await?;
                if let Some(level) = isolation {
                    let stmt = match level {
                        IsolationLevel::ReadCommitted => {
                            "SET TRANSACTION ISOLATION LEVEL READ COMMITTED"
                        }
                        IsolationLevel::RepeatableRead => {
                            "SET TRANSACTION ISOLATION LEVEL REPEATABLE READ"
                        }
                        IsolationLevel::Serializable => {
                            "SET TRANSACTION ISOLATION LEVEL SERIALIZABLE"
                        }
                    };
                    conn.query_drop(stmt).await.map_err(map_mysql_error)?;
                }
                conn.query_drop("START TRANSACTION")
                    .await
                    .map_err(map_mysql_error)?;
                *state = Some((conn, 1));
                Ok(TxHandle {
                    depth: 0,
                    savepoint: None,
                })
            }
            Some((conn, depth)) => {
                let name = format!("sp_{depth}");
                conn.query_drop(&format!("SAVEPOINT {name}"))
                    .await
                    .map_err(map_mysql_error)?;
                let handle = TxHandle {
                    depth: *depth,
                    savepoint: Some(name),
                };
                *depth += 1;
                Ok(handle)
            }
        }
    }

    async fn commit(&self, tx: &TxHandle) -> Result<()> {
        let mut state = self.tx_state.lock().await;
        let Some((conn, depth)) = state.as_mut() else {
            return Err(DbError::TxState("no open transaction".into()));
        };
        match &tx.savepoint {
            Some(name) => {
                conn.query_drop(&format!("RELEASE SAVEPOINT {name}"))
                    .await
                    .map_err(map_mysql_error)?;
                *depth = depth.saturating_sub(1);
            }
            None => {
                conn.query_drop("COMMIT").await.map_err(map_mysql_error)?;
                *state = None;
            }
        }
        Ok(())
    }

    async fn rollback(&self, tx: &TxHandle) -> Result<()> {
        let mut state = self.tx_state.lock().await;
        let Some((conn, depth)) = state.as_mut() else {
            return Err(DbError::TxState("no open transaction".into()));
        };
        match &tx.savepoint {
            Some(name) => {
                conn.query_drop(&format!("ROLLBACK TO SAVEPOINT {name}"))
                    .await
                    .map_err(map_mysql_error)?;
                *depth = depth.saturating_sub(1);
            }
            None => {
                conn.query_drop("ROLLBACK").await.map_err(map_mysql_error)?;
                *state = None;
            }
        }
        Ok(())
    }

    async fn introspect(&self) -> Result<Schema> {
        let signal = AbortSignal::new();
        let opts = QueryOptions {
            max_rows: 10_000,
            ..QueryOptions::default()
        };

        let tables_rs = self
            .execute_query(
                "SELECT table_name, table_type FROM information_schema.tables \
                 WHERE table_schema = DATABASE() ORDER BY table_name",
                &[],
                &opts,
                &signal,
            )
            .await?;

        let mut tables = Vec::new();
        let mut views = Vec::new();
        for row in &tables_rs.rows {
            let (SqlValue::Text(name), SqlValue::Text(kind)) = (&row[0], &row[1]) else {
                continue;
            };
            if kind == "VIEW" {
                views.push(name.clone());
                continue;
            }

            let cols = self
                .execute_query(
                    "SELECT column_name, data_type, is_nullable, column_default, column_key \
                     FROM information_schema.columns \
                     WHERE table_schema = DATABASE() AND table_name = ? \
                     ORDER BY ordinal_position",
                    &[SqlValue::Text(name.clone())],
                    &opts,
                    &signal,
                )
                .await?;
            let columns = cols
                .rows
                .iter()
                .filter_map(|r| {
                    let SqlValue::Text(col_name) = &r[0] else {
                        return None;
                    };
                    Some(ColumnInfo {
                        name: col_name.clone(),
                        data_type: match &r[1] {
                            SqlValue::Text(t) => t.clone(),
                            _ => String::new(),
                        },
                        nullable: matches!(&r[2], SqlValue::Text(t) if t == "YES"),
                        primary_key: matches!(&r[4], SqlValue::Text(t) if t == "PRI"),
                        default: match &r[3] {
                            SqlValue::Text(t) => Some(t.clone()),
                            _ => None,
                        },
                    })
                })
                .collect();

            let fks = self
                .execute_query(
                    "SELECT column_name, referenced_table_name, referenced_column_name \
                     FROM information_schema.key_column_usage \
                     WHERE table_schema = DATABASE() AND table_name = ? \
                       AND referenced_table_name IS NOT NULL",
                    &[SqlValue::Text(name.clone())],
                    &opts,
                    &signal,
                )
                .await?;
            let foreign_keys = fks
                .rows
                .iter()
                .filter_map(|r| match (&r[0], &r[1], &r[2]) {
                    (SqlValue::Text(col), SqlValue::Text(ref_table), SqlValue::Text(ref_col)) => {
                        Some(ForeignKeyInfo {
                            column: col.clone(),
                            references_table: ref_table.clone(),
                            references_column: ref_col.clone(),
                        })
                    }
                    _ => None,
                })
                .collect();

            let idx = self
                .execute_query(
                    "SELECT DISTINCT index_name FROM information_schema.statistics \
                     WHERE table_schema = DATABASE() AND table_name = ?",
                    &[SqlValue::Text(name.clone())],
                    &opts,
                    &signal,
                )
                .await?;
            let indexes = idx
                .rows
                .iter()
                .filter_map(|r| match &r[0] {
                    SqlValue::Text(t) => Some(t.clone()),
                    _ => None,
                })
                .collect();

            tables.push(TableInfo {
                name: name.clone(),
                columns,
                indexes,
                foreign_keys,
            });
        }

        Ok(Schema { tables, views })
    }

    async fn health_check(&self) -> Result<()> {
        let probe = async {
            let mut conn = self.conn().await?;
            conn.query_drop("SELECT 1").await.map_err(map_mysql_error)
        };
        match tokio::time::timeout(std::time::Duration::from_secs(2), probe).await {
            Ok(result) => result,
            Err(_) => Err(DbError::Timeout(2000)),
        }
    }

    fn dialect(&self) -> Dialect {
        Dialect::Mysql
    }

    fn read_only(&self) -> bool {
        self.read_only
    }
}
