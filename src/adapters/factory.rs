//! Adapter construction, caching, and driver probing.
//!
//! The factory accepts a structured config, a JSON map, or a raw connection
//! string. Adapters are cached by the canonical key
//! `(dialect, host, port, dbname, user)`; a cached adapter is returned only
//! if its health check still passes, otherwise it is rebuilt. Initialization
//! for the same key is single-flighted.

use super::mysql::MysqlAdapter;
use super::postgres::PostgresAdapter;
use super::sqlite::SqliteAdapter;
use super::{ConnectionString, DatabaseAdapter, Dialect};
use crate::error::{DbError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Structured database configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DatabaseProfile {
    pub url: String,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_schema: Option<String>,
}

const fn default_pool_size() -> usize {
    8
}

impl DatabaseProfile {
    #[must_use]
    pub fn from_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            read_only: false,
            pool_size: default_pool_size(),
            default_schema: None,
        }
    }

    /// Accept either a plain string or a `{url, read_only, ...}` map.
    pub fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::String(url) => Ok(Self::from_url(url.clone())),
            Value::Object(_) => serde_json::from_value(value.clone())
                .map_err(|e| DbError::Config(format!("invalid database config: {e}"))),
            other => Err(DbError::Config(format!(
                "database config must be a string or object, got {other}"
            ))),
        }
    }
}

type CacheKey = (Dialect, String, u16, String, String);

/// Per-process driver availability, probed once and memoized.
#[derive(Clone, Copy, Debug)]
pub struct DriverProbe {
    pub sqlite: bool,
    pub postgres: bool,
    pub mysql: bool,
}

impl DriverProbe {
    const fn all() -> Self {
        Self {
            sqlite: true,
            postgres: true,
            mysql: true,
        }
    }

    #[must_use]
    pub const fn supports(&self, dialect: Dialect) -> bool {
        match dialect {
            Dialect::Sqlite => self.sqlite,
            Dialect::Postgres => self.postgres,
            Dialect::Mysql => self.mysql,
        }
    }
}

static DRIVER_PROBE: OnceLock<DriverProbe> = OnceLock::new();

/// Probe driver availability once per process.
///
/// All three drivers are compiled in, so the probe is a formality today; it
/// stays behind a memoized function so an optional-driver build only has to
/// change this one place.
pub fn probe_drivers() -> DriverProbe {
    *DRIVER_PROBE.get_or_init(|| {
        debug!("probing database drivers");
        DriverProbe::all()
    })
}

/// Factory with a process-wide adapter cache.
pub struct AdapterFactory {
    cache: Mutex<HashMap<CacheKey, Arc<dyn DatabaseAdapter>>>,
}

impl Default for AdapterFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl AdapterFactory {
    #[must_use]
    pub fn new() -> Self {
        Self {
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Build or fetch an adapter for the given profile.
    pub async fn create(&self, profile: &DatabaseProfile) -> Result<Arc<dyn DatabaseAdapter>> {
        let parsed = ConnectionString::parse(&profile.url)?;
        if !probe_drivers().supports(parsed.dialect) {
            return Err(DbError::UnsupportedDialect(format!(
                "driver for {} is unavailable",
                parsed.dialect
            )));
        }
        let key = parsed.cache_key();

        // Holding the cache lock across the health check single-flights
        // concurrent creates for the same key.
        let mut cache = self.cache.lock().await;
        if let Some(existing) = cache.get(&key) {
            if existing.health_check().await.is_ok() {
                return Ok(Arc::clone(existing));
            }
            warn!(dialect = %parsed.dialect, "cached adapter failed health check, rebuilding");
            cache.remove(&key);
        }

        let adapter = Self::build(&parsed, profile)?;
        cache.insert(key, Arc::clone(&adapter));
        Ok(adapter)
    }

    /// Build or fetch an adapter from a raw connection string or JSON value.
    pub async fn create_from_value(&self, value: &Value) -> Result<Arc<dyn DatabaseAdapter>> {
        self.create(&DatabaseProfile::from_value(value)?).await
    }

    fn build(
        parsed: &ConnectionString,
        profile: &DatabaseProfile,
    ) -> Result<Arc<dyn DatabaseAdapter>> {
        let adapter: Arc<dyn DatabaseAdapter> = match parsed.dialect {
            Dialect::Sqlite => Arc::new(SqliteAdapter::new(parsed.path.clone(), profile.read_only)),
            Dialect::Postgres => Arc::new(PostgresAdapter::new(
                parsed.clone(),
                profile.read_only,
                profile.pool_size,
            )),
            Dialect::Mysql => Arc::new(MysqlAdapter::new(parsed.clone(), profile.read_only)),
        };
        Ok(adapter)
    }

    /// Drop every cached adapter. Used by tests for teardown.
    pub async fn clear(&self) {
        self.cache.lock().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_from_value_accepts_string_and_map() {
        let from_str =
            DatabaseProfile::from_value(&Value::String("sqlite:///a.db".into())).expect("string");
        assert_eq!(from_str.url, "sqlite:///a.db");
        assert!(!from_str.read_only);

        let from_map = DatabaseProfile::from_value(&serde_json::json!({
            "url": "postgresql://u@h/db",
            "read_only": true,
            "pool_size": 2,
        }))
        .expect("map");
        assert!(from_map.read_only);
        assert_eq!(from_map.pool_size, 2);

        assert!(DatabaseProfile::from_value(&Value::Bool(true)).is_err());
    }

    #[test]
    fn probe_is_memoized() {
        let first = probe_drivers();
        let second = probe_drivers();
        assert!(first.sqlite && second.sqlite);
        assert!(first.supports(Dialect::Postgres));
    }

    #[tokio::test]
    async fn unknown_scheme_fails_with_unsupported_dialect() {
        let factory = AdapterFactory::new();
        let result = factory
            .create(&DatabaseProfile::from_url("oracle://h/db"))
            .await;
        let err = match result {
            Ok(_) => panic!("expected an error"),
            Err(e) => e,
        };
        assert_eq!(err.kind(), "UnsupportedDialectError");
    }

    #[tokio::test]
    async fn healthy_adapters_are_cached_by_canonical_key() {
        let dir = tempfile::tempdir().expect("tempdir");
        let url = format!("sqlite:///{}", dir.path().join("cache.db").display());
        let factory = AdapterFactory::new();

        let first = factory
            .create(&DatabaseProfile::from_url(&url))
            .await
            .expect("first create");
        first.connect().await.expect("connect");

        let second = factory
            .create(&DatabaseProfile::from_url(&url))
            .await
            .expect("second create");
        assert!(Arc::ptr_eq(&first, &second));

        factory.clear().await;
        let third = factory
            .create(&DatabaseProfile::from_url(&url))
            .await
            .expect("third create");
        assert!(!Arc::ptr_eq(&first, &third));
    }
}
