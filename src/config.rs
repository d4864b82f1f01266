//! Layered configuration resolution.
//!
//! Settings are resolved highest-precedence first:
//!
//! 1. environment variables
//! 2. system file (`/etc/dbrheo/config.yaml`)
//! 3. workspace file (`.dbrheo.yaml` in the working directory)
//! 4. user file (`~/.dbrheo/config.yaml`)
//! 5. built-in defaults
//!
//! Resolution happens once at load; there is no silent re-resolution across
//! scopes afterwards. Unknown keys are preserved verbatim so host-specific
//! settings survive a round-trip through `save`.

use crate::error::{DbError, Result};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

const SYSTEM_CONFIG_PATH: &str = "/etc/dbrheo/config.yaml";
const WORKSPACE_CONFIG_FILE: &str = ".dbrheo.yaml";
const USER_CONFIG_DIR: &str = ".dbrheo";
const USER_CONFIG_FILE: &str = "config.yaml";

const DEFAULT_MODEL: &str = "gemini-2.5-flash";
const DEFAULT_MAX_TURNS: u32 = 10;
const DEFAULT_FAN_OUT: usize = 4;
const DEFAULT_COMPRESSION_THRESHOLD: f64 = 0.7;
const DEFAULT_CONTEXT_WINDOW_TOKENS: usize = 128_000;

/// Where a `save` lands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigScope {
    User,
    Workspace,
}

/// Retry policy for LLM transport errors.
#[derive(Clone, Debug)]
pub struct RetrySettings {
    pub base_delay: Duration,
    pub factor: f64,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            factor: 2.0,
            cap: Duration::from_secs(60),
            max_attempts: 5,
        }
    }
}

/// Resolved, read-mostly agent configuration.
///
/// Cheap to clone; writes only happen through [`AgentSettings::set`] followed
/// by an explicit [`AgentSettings::save`] from an interactive command.
#[derive(Clone, Debug)]
pub struct AgentSettings {
    /// Merged tree, already layered. Dotted-path lookups read this.
    resolved: Value,
    /// The user-scope tree only, kept separate so `save(User)` does not
    /// flatten higher-precedence layers into the user's file.
    user_layer: Value,
    workspace_layer: Value,
    workspace_root: PathBuf,
}

impl AgentSettings {
    /// Load configuration with the standard layering.
    pub fn load() -> Result<Self> {
        let workspace_root = std::env::current_dir()
            .map_err(|e| DbError::Config(format!("cannot resolve working directory: {e}")))?;
        Self::load_from(&workspace_root)
    }

    /// Load with an explicit workspace root (used by tests).
    pub fn load_from(workspace_root: &Path) -> Result<Self> {
        let defaults = Self::defaults();
        let user_layer = Self::read_yaml_layer(&Self::user_config_path())?;
        let workspace_layer =
            Self::read_yaml_layer(&workspace_root.join(WORKSPACE_CONFIG_FILE))?;
        let system_layer = Self::read_yaml_layer(Path::new(SYSTEM_CONFIG_PATH))?;
        let env_layer = Self::env_layer();

        // Lowest precedence first; later merges win.
        let mut resolved = defaults;
        merge(&mut resolved, &user_layer);
        merge(&mut resolved, &workspace_layer);
        merge(&mut resolved, &system_layer);
        merge(&mut resolved, &env_layer);

        debug!(workspace = %workspace_root.display(), "configuration resolved");

        Ok(Self {
            resolved,
            user_layer,
            workspace_layer,
            workspace_root: workspace_root.to_path_buf(),
        })
    }

    /// An in-memory settings object seeded only with defaults plus the given
    /// overrides. Tests and embedders use this to avoid touching the
    /// filesystem or process environment.
    #[must_use]
    pub fn from_overrides(overrides: Value) -> Self {
        let mut resolved = Self::defaults();
        merge(&mut resolved, &overrides);
        Self {
            resolved,
            user_layer: Value::Object(serde_json::Map::new()),
            workspace_layer: overrides,
            workspace_root: PathBuf::from("."),
        }
    }

    fn defaults() -> Value {
        serde_json::json!({
            "model": DEFAULT_MODEL,
            "max_turns": DEFAULT_MAX_TURNS,
            "debug": false,
            "auto_execute": false,
            "allow_dangerous": false,
            "compression": {
                "threshold": DEFAULT_COMPRESSION_THRESHOLD,
                "context_window_tokens": DEFAULT_CONTEXT_WINDOW_TOKENS,
            },
            "scheduler": {
                "fan_out": DEFAULT_FAN_OUT,
                "cancel_grace_ms": 5000,
            },
            "risk": {
                "threshold": "medium",
            },
            "retry": {
                "base_delay_ms": 1000,
                "factor": 2.0,
                "cap_ms": 60_000,
                "max_attempts": 5,
            },
            "credentials": {},
        })
    }

    fn env_layer() -> Value {
        let mut layer = serde_json::Map::new();
        let mut credentials = serde_json::Map::new();

        // First key that is present wins for the Google credential.
        for key in ["GOOGLE_API_KEY", "GEMINI_API_KEY"] {
            if let Ok(v) = std::env::var(key) {
                credentials.insert("google_api_key".into(), Value::String(v));
                break;
            }
        }
        if let Ok(v) = std::env::var("ANTHROPIC_API_KEY") {
            credentials.insert("anthropic_api_key".into(), Value::String(v));
        }
        if let Ok(v) = std::env::var("OPENAI_API_KEY") {
            credentials.insert("openai_api_key".into(), Value::String(v));
        }
        if let Ok(v) = std::env::var("OPENAI_API_BASE") {
            credentials.insert("openai_api_base".into(), Value::String(v));
        }
        if !credentials.is_empty() {
            layer.insert("credentials".into(), Value::Object(credentials));
        }

        if let Ok(v) = std::env::var("DBRHEO_MODEL") {
            layer.insert("model".into(), Value::String(v));
        }
        if let Ok(v) = std::env::var("DBRHEO_MAX_TURNS") {
            if let Ok(n) = v.parse::<u32>() {
                layer.insert("max_turns".into(), Value::from(n));
            }
        }
        for (env, key) in [
            ("DBRHEO_AUTO_EXECUTE", "auto_execute"),
            ("DBRHEO_ALLOW_DANGEROUS", "allow_dangerous"),
            ("DBRHEO_DEBUG", "debug"),
        ] {
            if let Ok(v) = std::env::var(env) {
                layer.insert(key.into(), Value::Bool(parse_bool(&v)));
            }
        }
        if let Ok(v) = std::env::var("DATABASE_URL") {
            layer.insert(
                "default_connection".into(),
                serde_json::json!({ "url": v }),
            );
        }

        Value::Object(layer)
    }

    fn read_yaml_layer(path: &Path) -> Result<Value> {
        if !path.exists() {
            return Ok(Value::Object(serde_json::Map::new()));
        }
        let raw = std::fs::read_to_string(path)
            .map_err(|e| DbError::Config(format!("cannot read {}: {e}", path.display())))?;
        let yaml: serde_yaml::Value = serde_yaml::from_str(&raw)
            .map_err(|e| DbError::Config(format!("invalid YAML in {}: {e}", path.display())))?;
        serde_json::to_value(yaml)
            .map_err(|e| DbError::Config(format!("cannot convert {}: {e}", path.display())))
    }

    fn user_config_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(USER_CONFIG_DIR)
            .join(USER_CONFIG_FILE)
    }

    /// Look up a value by dotted path, e.g. `"retry.max_attempts"`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        let mut node = &self.resolved;
        for segment in key.split('.') {
            node = node.get(segment)?;
        }
        Some(node)
    }

    /// Look up a string value, falling back to `default`.
    #[must_use]
    pub fn get_str(&self, key: &str, default: &str) -> String {
        self.get(key)
            .and_then(Value::as_str)
            .unwrap_or(default)
            .to_string()
    }

    /// Look up a bool value, falling back to `default`.
    #[must_use]
    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        self.get(key).and_then(Value::as_bool).unwrap_or(default)
    }

    /// Look up an unsigned integer, falling back to `default`.
    #[must_use]
    pub fn get_u64(&self, key: &str, default: u64) -> u64 {
        self.get(key).and_then(Value::as_u64).unwrap_or(default)
    }

    /// Set a dotted-path key in the given scope. Takes effect immediately in
    /// the resolved view; persisted only by [`AgentSettings::save`].
    pub fn set(&mut self, scope: ConfigScope, key: &str, value: Value) {
        let layer = match scope {
            ConfigScope::User => &mut self.user_layer,
            ConfigScope::Workspace => &mut self.workspace_layer,
        };
        set_path(layer, key, value.clone());
        set_path(&mut self.resolved, key, value);
    }

    /// Persist the given scope's layer to its YAML file.
    pub fn save(&self, scope: ConfigScope) -> Result<()> {
        let (layer, path) = match scope {
            ConfigScope::User => (&self.user_layer, Self::user_config_path()),
            ConfigScope::Workspace => (
                &self.workspace_layer,
                self.workspace_root.join(WORKSPACE_CONFIG_FILE),
            ),
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| DbError::Config(format!("cannot create {}: {e}", parent.display())))?;
        }
        // BTreeMap keeps saved files diff-stable.
        let ordered: BTreeMap<String, Value> = match layer {
            Value::Object(map) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            _ => BTreeMap::new(),
        };
        let yaml = serde_yaml::to_string(&ordered)
            .map_err(|e| DbError::Config(format!("cannot serialize config: {e}")))?;
        std::fs::write(&path, yaml)
            .map_err(|e| DbError::Config(format!("cannot write {}: {e}", path.display())))?;
        Ok(())
    }

    // Typed conveniences ----------------------------------------------------

    #[must_use]
    pub fn model(&self) -> String {
        self.get_str("model", DEFAULT_MODEL)
    }

    #[must_use]
    pub fn max_turns(&self) -> u32 {
        self.get_u64("max_turns", u64::from(DEFAULT_MAX_TURNS)) as u32
    }

    #[must_use]
    pub fn debug(&self) -> bool {
        self.get_bool("debug", false)
    }

    #[must_use]
    pub fn allows_dangerous(&self) -> bool {
        self.get_bool("allow_dangerous", false)
    }

    #[must_use]
    pub fn auto_execute(&self) -> bool {
        self.get_bool("auto_execute", false)
    }

    /// Fraction of the context window at which compression triggers,
    /// clamped into `(0, 1]`.
    #[must_use]
    pub fn compression_threshold(&self) -> f64 {
        let raw = self
            .get("compression.threshold")
            .and_then(Value::as_f64)
            .unwrap_or(DEFAULT_COMPRESSION_THRESHOLD);
        raw.clamp(f64::EPSILON, 1.0)
    }

    #[must_use]
    pub fn context_window_tokens(&self) -> usize {
        self.get_u64(
            "compression.context_window_tokens",
            DEFAULT_CONTEXT_WINDOW_TOKENS as u64,
        ) as usize
    }

    /// Max concurrent side-effect-free tool calls per turn.
    #[must_use]
    pub fn fan_out(&self) -> usize {
        self.get_u64("scheduler.fan_out", DEFAULT_FAN_OUT as u64).max(1) as usize
    }

    /// Grace period granted to an executing tool after cancellation.
    #[must_use]
    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.get_u64("scheduler.cancel_grace_ms", 5000))
    }

    #[must_use]
    pub fn retry(&self) -> RetrySettings {
        let defaults = RetrySettings::default();
        RetrySettings {
            base_delay: Duration::from_millis(
                self.get_u64("retry.base_delay_ms", defaults.base_delay.as_millis() as u64),
            ),
            factor: self
                .get("retry.factor")
                .and_then(Value::as_f64)
                .unwrap_or(defaults.factor),
            cap: Duration::from_millis(
                self.get_u64("retry.cap_ms", defaults.cap.as_millis() as u64),
            ),
            max_attempts: self.get_u64("retry.max_attempts", u64::from(defaults.max_attempts))
                as u32,
        }
    }

    #[must_use]
    pub fn credential(&self, name: &str) -> Option<String> {
        self.get(&format!("credentials.{name}"))
            .and_then(Value::as_str)
            .map(String::from)
    }

    #[must_use]
    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }
}

fn parse_bool(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Deep-merge `overlay` into `base`. Objects merge recursively, everything
/// else in the overlay replaces the base value.
fn merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base_slot, overlay_value) => {
            if !overlay_value.is_null() {
                *base_slot = overlay_value.clone();
            }
        }
    }
}

fn set_path(root: &mut Value, key: &str, value: Value) {
    if !root.is_object() {
        *root = Value::Object(serde_json::Map::new());
    }
    let map = root.as_object_mut().expect("coerced to object above");
    match key.split_once('.') {
        None => {
            map.insert(key.to_string(), value);
        }
        Some((head, rest)) => {
            let child = map
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(serde_json::Map::new()));
            set_path(child, rest, value);
        }
    }
}
