//! Named active connections.
//!
//! The manager owns the mapping `alias -> ActiveConnection` plus the notion
//! of a "current" alias that tools act on by default. Opening an alias that
//! is already being opened coalesces onto the in-flight attempt; statements
//! against one connection are serialized FIFO through a per-connection lock.

use crate::adapters::{AdapterFactory, DatabaseAdapter, DatabaseProfile, QueryOptions, ResultSet,
    SqlValue};
use crate::error::{DbError, Result};
use crate::types::AbortSignal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::{Mutex, OnceCell, RwLock};
use tracing::{debug, warn};

const SAVED_CONNECTIONS_FILE: &str = "connections.yaml";

/// A named, opened database session.
pub struct ActiveConnection {
    pub alias: String,
    pub adapter: Arc<dyn DatabaseAdapter>,
    pub created_at: OffsetDateTime,
    last_used_at: std::sync::Mutex<OffsetDateTime>,
    /// At most one in-flight statement per connection; waiters are FIFO.
    statement_lock: Mutex<()>,
}

impl ActiveConnection {
    fn new(alias: String, adapter: Arc<dyn DatabaseAdapter>) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            alias,
            adapter,
            created_at: now,
            last_used_at: std::sync::Mutex::new(now),
            statement_lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn last_used_at(&self) -> OffsetDateTime {
        *self.last_used_at.lock().expect("last_used lock")
    }

    fn touch(&self) {
        *self.last_used_at.lock().expect("last_used lock") = OffsetDateTime::now_utc();
    }

    /// Execute a statement with the per-connection serialization guarantee.
    pub async fn execute(
        &self,
        sql: &str,
        params: &[SqlValue],
        opts: &QueryOptions,
        signal: &AbortSignal,
    ) -> Result<ResultSet> {
        let _guard = self.statement_lock.lock().await;
        self.touch();
        self.adapter.execute_query(sql, params, opts, signal).await
    }
}

/// Summary row for `list()`.
#[derive(Clone, Debug, Serialize)]
pub struct ConnectionSummary {
    pub alias: String,
    pub dialect: String,
    pub read_only: bool,
    pub current: bool,
}

/// A saved connection profile, persisted to `~/.dbrheo/connections.yaml`.
///
/// Passwords are stored as-is in this version; treat the file accordingly.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SavedConnection {
    pub url: String,
    #[serde(default)]
    pub read_only: bool,
}

/// Owns all active connections and the current-alias pointer.
pub struct ConnectionManager {
    factory: Arc<AdapterFactory>,
    connections: RwLock<HashMap<String, Arc<ActiveConnection>>>,
    /// In-flight opens, used to coalesce concurrent `open` calls per alias.
    opening: Mutex<HashMap<String, Arc<OnceCell<Arc<ActiveConnection>>>>>,
    current: RwLock<Option<String>>,
    storage_dir: Option<PathBuf>,
}

impl ConnectionManager {
    #[must_use]
    pub fn new(factory: Arc<AdapterFactory>) -> Self {
        Self {
            factory,
            connections: RwLock::new(HashMap::new()),
            opening: Mutex::new(HashMap::new()),
            current: RwLock::new(None),
            storage_dir: dirs::home_dir().map(|home| home.join(".dbrheo")),
        }
    }

    /// Override the saved-connections directory (tests).
    #[must_use]
    pub fn with_storage_dir(mut self, dir: PathBuf) -> Self {
        self.storage_dir = Some(dir);
        self
    }

    /// Open (or return) the connection for `alias`. A newly opened alias
    /// becomes current unless `make_current` is false. Concurrent opens of
    /// the same alias are coalesced: the second caller awaits the first's
    /// result.
    pub async fn open(
        &self,
        alias: &str,
        profile: DatabaseProfile,
        make_current: bool,
    ) -> Result<Arc<ActiveConnection>> {
        let existing = self.connections.read().await.get(alias).cloned();
        if let Some(existing) = existing {
            let healthy = existing.adapter.health_check().await.is_ok();
            if healthy {
                if make_current {
                    *self.current.write().await = Some(alias.to_string());
                }
                return Ok(existing);
            }
            // One re-open attempt per request: fall through to rebuild below.
            warn!(alias, "connection failed health check, reopening");
            self.connections.write().await.remove(alias);
        }

        let cell = {
            let mut opening = self.opening.lock().await;
            Arc::clone(
                opening
                    .entry(alias.to_string())
                    .or_insert_with(|| Arc::new(OnceCell::new())),
            )
        };

        let result = cell
            .get_or_try_init(|| async {
                let adapter = self.factory.create(&profile).await?;
                adapter.connect().await?;
                debug!(alias, dialect = %adapter.dialect(), "connection opened");
                Ok::<_, DbError>(Arc::new(ActiveConnection::new(
                    alias.to_string(),
                    adapter,
                )))
            })
            .await
            .map(Arc::clone);

        // The coalescing window ends with this open attempt either way.
        self.opening.lock().await.remove(alias);

        let connection = result?;
        self.connections
            .write()
            .await
            .insert(alias.to_string(), Arc::clone(&connection));
        if make_current {
            *self.current.write().await = Some(alias.to_string());
        }
        Ok(connection)
    }

    /// Switch the current alias. Fails if the alias is not open.
    pub async fn use_alias(&self, alias: &str) -> Result<()> {
        if !self.connections.read().await.contains_key(alias) {
            return Err(DbError::Connect(format!("no open connection '{alias}'")));
        }
        *self.current.write().await = Some(alias.to_string());
        Ok(())
    }

    /// The current connection.
    pub async fn get(&self) -> Result<Arc<ActiveConnection>> {
        let current = self.current.read().await.clone();
        let alias = current.ok_or_else(|| DbError::Connect("no current connection".into()))?;
        self.get_alias(&alias).await
    }

    /// A connection by alias.
    pub async fn get_alias(&self, alias: &str) -> Result<Arc<ActiveConnection>> {
        self.connections
            .read()
            .await
            .get(alias)
            .cloned()
            .ok_or_else(|| DbError::Connect(format!("no open connection '{alias}'")))
    }

    /// All open connections, current flagged.
    pub async fn list(&self) -> Vec<ConnectionSummary> {
        let current = self.current.read().await.clone();
        let connections = self.connections.read().await;
        let mut out: Vec<ConnectionSummary> = connections
            .values()
            .map(|c| ConnectionSummary {
                alias: c.alias.clone(),
                dialect: c.adapter.dialect().to_string(),
                read_only: c.adapter.read_only(),
                current: current.as_deref() == Some(c.alias.as_str()),
            })
            .collect();
        out.sort_by(|a, b| a.alias.cmp(&b.alias));
        out
    }

    /// Close one alias, clearing the current pointer if it matched.
    pub async fn close(&self, alias: &str) -> Result<()> {
        let removed = self.connections.write().await.remove(alias);
        let Some(connection) = removed else {
            return Err(DbError::Connect(format!("no open connection '{alias}'")));
        };
        connection.adapter.close().await?;
        let mut current = self.current.write().await;
        if current.as_deref() == Some(alias) {
            *current = None;
        }
        Ok(())
    }

    /// Close everything.
    pub async fn close_all(&self) -> Result<()> {
        let drained: Vec<Arc<ActiveConnection>> =
            self.connections.write().await.drain().map(|(_, c)| c).collect();
        for connection in drained {
            if let Err(e) = connection.adapter.close().await {
                warn!(alias = connection.alias, error = %e, "close failed");
            }
        }
        *self.current.write().await = None;
        Ok(())
    }

    // Saved connections -----------------------------------------------------

    fn saved_path(&self) -> Option<PathBuf> {
        self.storage_dir
            .as_ref()
            .map(|dir| dir.join(SAVED_CONNECTIONS_FILE))
    }

    /// Load the saved alias -> profile map.
    pub fn load_saved(&self) -> Result<BTreeMap<String, SavedConnection>> {
        let Some(path) = self.saved_path() else {
            return Ok(BTreeMap::new());
        };
        if !path.exists() {
            return Ok(BTreeMap::new());
        }
        let raw = std::fs::read_to_string(&path)
            .map_err(|e| DbError::Config(format!("cannot read {}: {e}", path.display())))?;
        serde_yaml::from_str(&raw)
            .map_err(|e| DbError::Config(format!("invalid YAML in {}: {e}", path.display())))
    }

    /// Persist one alias into the saved-connections file.
    pub fn save_connection(&self, alias: &str, saved: &SavedConnection) -> Result<()> {
        let Some(path) = self.saved_path() else {
            return Err(DbError::Config("no home directory for saved connections".into()));
        };
        let mut all = self.load_saved()?;
        all.insert(alias.to_string(), saved.clone());
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| DbError::Config(format!("cannot create {}: {e}", parent.display())))?;
        }
        let yaml = serde_yaml::to_string(&all)
            .map_err(|e| DbError::Config(format!("cannot serialize connections: {e}")))?;
        std::fs::write(&path, yaml)
            .map_err(|e| DbError::Config(format!("cannot write {}: {e}", path.display())))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sqlite_profile(dir: &std::path::Path, name: &str) -> DatabaseProfile {
        DatabaseProfile::from_url(format!("sqlite:///{}", dir.join(name).display()))
    }

    fn manager(dir: &std::path::Path) -> ConnectionManager {
        ConnectionManager::new(Arc::new(AdapterFactory::new()))
            .with_storage_dir(dir.to_path_buf())
    }

    #[tokio::test]
    async fn newly_opened_alias_becomes_current() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mgr = manager(dir.path());
        mgr.open("main", sqlite_profile(dir.path(), "a.db"), true)
            .await
            .expect("open");
        let current = mgr.get().await.expect("current");
        assert_eq!(current.alias, "main");
    }

    #[tokio::test]
    async fn open_with_use_false_keeps_previous_current() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mgr = manager(dir.path());
        mgr.open("first", sqlite_profile(dir.path(), "a.db"), true)
            .await
            .expect("open first");
        mgr.open("second", sqlite_profile(dir.path(), "b.db"), false)
            .await
            .expect("open second");
        assert_eq!(mgr.get().await.expect("current").alias, "first");

        mgr.use_alias("second").await.expect("switch");
        assert_eq!(mgr.get().await.expect("current").alias, "second");
    }

    #[tokio::test]
    async fn use_unknown_alias_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mgr = manager(dir.path());
        let err = mgr.use_alias("ghost").await.unwrap_err();
        assert_eq!(err.kind(), "ConnectError");
    }

    #[tokio::test]
    async fn concurrent_opens_of_one_alias_coalesce() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mgr = Arc::new(manager(dir.path()));
        let profile = sqlite_profile(dir.path(), "shared.db");

        let mut handles = Vec::new();
        for _ in 0..4 {
            let mgr = Arc::clone(&mgr);
            let profile = profile.clone();
            handles.push(tokio::spawn(async move {
                mgr.open("shared", profile, true).await
            }));
        }
        let mut connections = Vec::new();
        for handle in handles {
            connections.push(handle.await.expect("join").expect("open"));
        }
        for pair in connections.windows(2) {
            assert!(Arc::ptr_eq(&pair[0], &pair[1]));
        }
    }

    #[tokio::test]
    async fn close_clears_current_pointer() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mgr = manager(dir.path());
        mgr.open("main", sqlite_profile(dir.path(), "a.db"), true)
            .await
            .expect("open");
        mgr.close("main").await.expect("close");
        assert!(mgr.get().await.is_err());
        assert!(mgr.list().await.is_empty());
    }

    #[tokio::test]
    async fn list_marks_the_current_connection() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mgr = manager(dir.path());
        mgr.open("a", sqlite_profile(dir.path(), "a.db"), true)
            .await
            .expect("open a");
        mgr.open("b", sqlite_profile(dir.path(), "b.db"), true)
            .await
            .expect("open b");

        let listed = mgr.list().await;
        assert_eq!(listed.len(), 2);
        let b = listed.iter().find(|c| c.alias == "b").expect("b listed");
        assert!(b.current);
        let a = listed.iter().find(|c| c.alias == "a").expect("a listed");
        assert!(!a.current);
    }

    #[tokio::test]
    async fn saved_connections_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mgr = manager(dir.path());
        mgr.save_connection(
            "prod",
            &SavedConnection {
                url: "postgresql://u:p@h/db".into(),
                read_only: true,
            },
        )
        .expect("save");

        let loaded = mgr.load_saved().expect("load");
        assert_eq!(loaded.len(), 1);
        assert!(loaded["prod"].read_only);
        assert_eq!(loaded["prod"].url, "postgresql://u:p@h/db");
    }

    #[tokio::test]
    async fn statements_on_one_connection_serialize() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mgr = manager(dir.path());
        let conn = mgr
            .open("main", sqlite_profile(dir.path(), "serial.db"), true)
            .await
            .expect("open");
        let signal = AbortSignal::new();
        let opts = QueryOptions::default();
        conn.execute("CREATE TABLE t (a INTEGER)", &[], &opts, &signal)
            .await
            .expect("create");

        let mut handles = Vec::new();
        for i in 0..8 {
            let conn = Arc::clone(&conn);
            let signal = signal.clone();
            handles.push(tokio::spawn(async move {
                conn.execute(
                    &format!("INSERT INTO t VALUES ({i})"),
                    &[],
                    &QueryOptions::default(),
                    &signal,
                )
                .await
            }));
        }
        for handle in handles {
            handle.await.expect("join").expect("insert");
        }
        let result = conn
            .execute("SELECT COUNT(*) FROM t", &[], &opts, &signal)
            .await
            .expect("count");
        assert_eq!(result.rows[0][0], SqlValue::Int(8));
    }
}
