//! PostgreSQL adapter.
//!
//! Connections come from a deadpool-postgres pool; transactions pin a single
//! pooled connection for the duration of the outermost frame. Cancellation
//! uses the statement timeout plus tokio-level select on the abort signal.

use super::{
    enforce_read_only, ColumnInfo, DatabaseAdapter, Dialect, ForeignKeyInfo, IsolationLevel,
    QueryOptions, ResultSet, RowBatch, RowStream, Schema, SqlValue, TableInfo, TxHandle,
    ConnectionString, STREAM_BATCH_SIZE,
};
use crate::error::{DbError, Result};
use crate::types::AbortSignal;
use async_trait::async_trait;
use deadpool_postgres::{Config, ManagerConfig, Object, Pool, RecyclingMethod, Runtime};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Mutex};
use tokio_postgres::types::ToSql;
use tokio_postgres::NoTls;
use tracing::debug;

/// PostgreSQL adapter backed by a connection pool.
pub struct PostgresAdapter {
    config: ConnectionString,
    read_only: bool,
    pool_size: usize,
    pool: Mutex<Option<Pool>>,
    /// Connection pinned by an open transaction, with its savepoint depth.
    tx_state: Mutex<Option<(Arc<Object>, usize)>>,
}

impl PostgresAdapter {
    #[must_use]
    pub fn new(config: ConnectionString, read_only: bool, pool_size: usize) -> Self {
        Self {
            config,
            read_only,
            pool_size: pool_size.max(1),
            pool: Mutex::new(None),
            tx_state: Mutex::new(None),
        }
    }

    async fn pool(&self) -> Result<Pool> {
        let mut slot = self.pool.lock().await;
        if let Some(pool) = slot.as_ref() {
            return Ok(pool.clone());
        }
        let mut cfg = Config::new();
        cfg.host = self.config.host.clone();
        cfg.port = Some(self.config.effective_port());
        cfg.dbname = self.config.database.clone();
        cfg.user = self.config.user.clone();
        cfg.password = self.config.password.clone();
        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });
        if let Some(pool_cfg) = cfg.pool.as_mut() {
            pool_cfg.max_size = self.pool_size;
        } else {
            cfg.pool = Some(deadpool_postgres::PoolConfig {
                max_size: self.pool_size,
                ..Default::default()
            });
        }
        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| DbError::Connect(format!("postgres pool: {e}")))?;
        debug!(
            host = self.config.host.as_deref().unwrap_or(""),
            db = self.config.database.as_deref().unwrap_or(""),
            "postgres pool created"
        );
        *slot = Some(pool.clone());
        Ok(pool)
    }

    /// Prefer the transaction-pinned connection when a frame is open.
    async fn client(&self) -> Result<Arc<Object>> {
        if let Some((pinned, _)) = self.tx_state.lock().await.as_ref() {
            return Ok(Arc::clone(pinned));
        }
        let pool = self.pool().await?;
        let object = pool
            .get()
            .await
            .map_err(|e| map_pool_error(&e))?;
        Ok(Arc::new(object))
    }
}

fn map_pool_error(e: &deadpool_postgres::PoolError) -> DbError {
    let text = e.to_string();
    if text.contains("password") || text.contains("authentication") {
        DbError::Auth(text)
    } else {
        DbError::Connect(text)
    }
}

fn map_pg_error(e: &tokio_postgres::Error) -> DbError {
    let text = e.to_string();
    if let Some(db_err) = e.as_db_error() {
        let code = db_err.code().code();
        if code.starts_with("28") {
            // 28xxx: invalid authorization
            return DbError::Auth(db_err.message().to_string());
        }
        if code == "57014" {
            // query_canceled
            return DbError::Cancelled;
        }
        return DbError::query_with_detail(db_err.message().to_string(), code.to_string());
    }
    if e.is_closed() {
        return DbError::Connect(text);
    }
    DbError::query_with_detail("postgres statement failed", text)
}

fn to_pg_params(params: &[SqlValue]) -> Vec<Box<dyn ToSql + Sync + Send>> {
    params
        .iter()
        .map(|p| -> Box<dyn ToSql + Sync + Send> {
            match p {
                SqlValue::Null => Box::new(Option::<String>::None),
                SqlValue::Bool(b) => Box::new(*b),
                SqlValue::Int(i) => Box::new(*i),
                SqlValue::Float(f) => Box::new(*f),
                SqlValue::Text(s) => Box::new(s.clone()),
            }
        })
        .collect()
}

fn read_pg_value(row: &tokio_postgres::Row, idx: usize) -> SqlValue {
    use tokio_postgres::types::Type;
    let column_type = row.columns()[idx].type_();
    match *column_type {
        Type::BOOL => row
            .try_get::<_, Option<bool>>(idx)
            .ok()
            .flatten()
            .map_or(SqlValue::Null, SqlValue::Bool),
        Type::INT2 => row
            .try_get::<_, Option<i16>>(idx)
            .ok()
            .flatten()
            .map_or(SqlValue::Null, |v| SqlValue::Int(i64::from(v))),
        Type::INT4 => row
            .try_get::<_, Option<i32>>(idx)
            .ok()
            .flatten()
            .map_or(SqlValue::Null, |v| SqlValue::Int(i64::from(v))),
        Type::INT8 => row
            .try_get::<_, Option<i64>>(idx)
            .ok()
            .flatten()
            .map_or(SqlValue::Null, SqlValue::Int),
        Type::FLOAT4 => row
            .try_get::<_, Option<f32>>(idx)
            .ok()
            .flatten()
            .map_or(SqlValue::Null, |v| SqlValue::Float(f64::from(v))),
        Type::FLOAT8 => row
            .try_get::<_, Option<f64>>(idx)
            .ok()
            .flatten()
            .map_or(SqlValue::Null, SqlValue::Float),
        _ => row
            .try_get::<_, Option<String>>(idx)
            .ok()
            .flatten()
            .map_or(SqlValue::Null, SqlValue::Text),
    }
}

#[async_trait]
impl DatabaseAdapter for PostgresAdapter {
    async fn connect(&self) -> Result<()> {
        // Building the pool is lazy; proving a connection works is not.
        self.health_check().await
    }

    async fn close(&self) -> Result<()> {
        let mut slot = self.pool.lock().await;
        if let Some(pool) = slot.take() {
            pool.close();
        }
        self.tx_state.lock().await.take();
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
        let client = self.client().await?;
        let started = Instant::now();
        let boxed = to_pg_params(params);
        let refs: Vec<&(dyn ToSql + Sync)> = boxed
            .iter()
            .map(|b| b.as_ref() as &(dyn ToSql + Sync))
            .collect();

        let work = async {
            let stmt = client.prepare(sql).await.map_err(|e| map_pg_error(&e))?;
            if stmt.columns().is_empty() {
                let affected = client
                    .execute(&stmt, &refs)
                    .await
                    .map_err(|e| map_pg_error(&e))?;
                return Ok(ResultSet {
                    columns: Vec::new(),
                    rows: Vec::new(),
                    rows_affected: affected,
                    truncated: false,
                    elapsed_ms: started.elapsed().as_millis() as u64,
                });
            }
            let columns: Vec<String> =
                stmt.columns().iter().map(|c| c.name().to_string()).collect();
            let rows = client
                .query(&stmt, &refs)
                .await
                .map_err(|e| map_pg_error(&e))?;
            let truncated = rows.len() > opts.max_rows;
            let out: Vec<Vec<SqlValue>> = rows
                .iter()
                .take(opts.max_rows)
                .map(|row| (0..columns.len()).map(|i| read_pg_value(row, i)).collect())
                .collect();
            Ok(ResultSet {
                columns,
                rows: out,
                rows_affected: 0,
                truncated,
                elapsed_ms: started.elapsed().as_millis() as u64,
            })
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
        let client = self.client().await?;
        let (tx, rx) = mpsc::channel(4);
        let sql = sql.to_string();
        let params = params.to_vec();
        let signal = signal.clone();

        tokio::spawn(async move {
            let boxed = to_pg_params(&params);
            let refs: Vec<&(dyn ToSql + Sync)> = boxed
                .iter()
                .map(|b| b.as_ref() as &(dyn ToSql + Sync))
                .collect();
            let stmt = match client.prepare(&sql).await {
                Ok(stmt) => stmt,
                Err(e) => {
                    let _ = tx.send(Err(map_pg_error(&e))).await;
                    return;
                }
            };
            let columns: Vec<String> =
                stmt.columns().iter().map(|c| c.name().to_string()).collect();
            let row_stream = match client.query_raw(&stmt, refs).await {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = tx.send(Err(map_pg_error(&e))).await;
                    return;
                }
            };
            futures::pin_mut!(row_stream);
            let mut batch: Vec<Vec<SqlValue>> = Vec::with_capacity(STREAM_BATCH_SIZE);
            loop {
                let next = tokio::select! {
                    next = row_stream.next() => next,
                    () = signal.cancelled() => {
                        let _ = tx.send(Err(DbError::Cancelled)).await;
                        return;
                    }
                };
                match next {
                    Some(Ok(row)) => {
                        batch.push(
                            (0..columns.len()).map(|i| read_pg_value(&row, i)).collect(),
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
                    Some(Err(e)) => {
                        let _ = tx.send(Err(map_pg_error(&e))).await;
                        return;
                    }
                    None => break,
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
                let pool = self.pool().await?;
                let object = pool.get().await.map_err(|e| map_pool_error(&e))?;
                let client = Arc::new(object);
                let begin = match isolation {
                    Some(IsolationLevel::ReadCommitted) => {
                        "BEGIN ISOLATION LEVEL READ COMMITTED"
                    }
                    Some(IsolationLevel::RepeatableRead) => {
                        "BEGIN ISOLATION LEVEL REPEATABLE READ"
                    }
                    Some(IsolationLevel::Serializable) => "BEGIN ISOLATION LEVEL SERIALIZABLE",
                    None => "BEGIN",
                };
                client
                    .batch_execute(begin)
                    .await
                    .map_err(|e| map_pg_error(&e))?;
                *state = Some((client, 1));
                Ok(TxHandle {
                    depth: 0,
                    savepoint: None,
                })
            }
            Some((client, depth)) => {
                let name = format!("sp_{depth}");
                client
                    .batch_execute(&format!("SAVEPOINT {name}"))
                    .await
                    .map_err(|e| map_pg_error(&e))?;
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
        let Some((client, depth)) = state.as_mut() else {
            return Err(DbError::TxState("no open transaction".into()));
        };
        match &tx.savepoint {
            Some(name) => {
                client
                    .batch_execute(&format!("RELEASE SAVEPOINT {name}"))
                    .await
                    .map_err(|e| map_pg_error(&e))?;
                *depth = depth.saturating_sub(1);
            }
            None => {
                client
                    .batch_execute("COMMIT")
                    .await
                    .map_err(|e| map_pg_error(&e))?;
                *state = None;
            }
        }
        Ok(())
    }

    async fn rollback(&self, tx: &TxHandle) -> Result<()> {
        let mut state = self.tx_state.lock().await;
        let Some((client, depth)) = state.as_mut() else {
            return Err(DbError::TxState("no open transaction".into()));
        };
        match &tx.savepoint {
            Some(name) => {
                client
                    .batch_execute(&format!("ROLLBACK TO SAVEPOINT {name}"))
                    .await
                    .map_err(|e| map_pg_error(&e))?;
                *depth = depth.saturating_sub(1);
            }
            None => {
                client
                    .batch_execute("ROLLBACK")
                    .await
                    .map_err(|e| map_pg_error(&e))?;
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
                 WHERE table_schema = 'public' ORDER BY table_name",
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
                    "SELECT column_name, data_type, is_nullable, column_default \
                     FROM information_schema.columns \
                     WHERE table_schema = 'public' AND table_name = $1 \
                     ORDER BY ordinal_position",
                    &[SqlValue::Text(name.clone())],
                    &opts,
                    &signal,
                )
                .await?;
            let pks = self
                .execute_query(
                    "SELECT kcu.column_name \
                     FROM information_schema.table_constraints tc \
                     JOIN information_schema.key_column_usage kcu \
                       ON tc.constraint_name = kcu.constraint_name \
                     WHERE tc.table_name = $1 AND tc.constraint_type = 'PRIMARY KEY'",
                    &[SqlValue::Text(name.clone())],
                    &opts,
                    &signal,
                )
                .await?;
            let pk_names: Vec<&str> = pks
                .rows
                .iter()
                .filter_map(|r| match &r[0] {
                    SqlValue::Text(t) => Some(t.as_str()),
                    _ => None,
                })
                .collect();

            let columns = cols
                .rows
                .iter()
                .filter_map(|r| {
                    let SqlValue::Text(col_name) = &r[0] else {
                        return None;
                    };
                    let data_type = match &r[1] {
                        SqlValue::Text(t) => t.clone(),
                        _ => String::new(),
                    };
                    let nullable = matches!(&r[2], SqlValue::Text(t) if t == "YES");
                    let default = match &r[3] {
                        SqlValue::Text(t) => Some(t.clone()),
                        _ => None,
                    };
                    Some(ColumnInfo {
                        name: col_name.clone(),
                        data_type,
                        nullable,
                        primary_key: pk_names.contains(&col_name.as_str()),
                        default,
                    })
                })
                .collect();

            let fks = self
                .execute_query(
                    "SELECT kcu.column_name, ccu.table_name, ccu.column_name \
                     FROM information_schema.table_constraints tc \
                     JOIN information_schema.key_column_usage kcu \
                       ON tc.constraint_name = kcu.constraint_name \
                     JOIN information_schema.constraint_column_usage ccu \
                       ON tc.constraint_name = ccu.constraint_name \
                     WHERE tc.table_name = $1 AND tc.constraint_type = 'FOREIGN KEY'",
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
                    "SELECT indexname FROM pg_indexes WHERE tablename = $1",
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
        let pool = self.pool().await?;
        let probe = async {
            let client = pool.get().await.map_err(|e| map_pool_error(&e))?;
            client
                .batch_execute("SELECT 1")
                .await
                .map_err(|e| map_pg_error(&e))
        };
        match tokio::time::timeout(std::time::Duration::from_secs(2), probe).await {
            Ok(result) => result,
            Err(_) => Err(DbError::Timeout(2000)),
        }
    }

    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    fn read_only(&self) -> bool {
        self.read_only
    }
}
