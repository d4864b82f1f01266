//! Tool storage and capability-tagged discovery.
//!
//! The registry owns every tool the agent can call, indexed by unique name.
//! Reads are concurrent; registration takes an exclusive lock. Lookups by
//! name are O(1); listings are ordered by priority (descending) then name.

use crate::error::{DbError, Result};
use crate::tools::DatabaseTool;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, OnceLock, RwLock};

/// Coarse tag describing the class of effect a tool has.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Query,
    Modify,
    SchemaChange,
    Explore,
    Analyze,
    Export,
    Read,
    Write,
    Import,
    Backup,
    Transform,
}

impl Capability {
    /// Capabilities whose tools are side-effect-free and may run
    /// concurrently within one turn.
    #[must_use]
    pub const fn is_side_effect_free(self) -> bool {
        matches!(
            self,
            Self::Query | Self::Explore | Self::Read | Self::Analyze | Self::Export
        )
    }
}

/// A registered tool plus its discovery metadata.
#[derive(Clone)]
pub struct ToolRegistration {
    pub tool: Arc<dyn DatabaseTool>,
    pub capabilities: HashSet<Capability>,
    pub tags: HashSet<String>,
    pub priority: i32,
    pub enabled: bool,
    pub metadata: Value,
}

impl ToolRegistration {
    /// A tool is effect-free only if every claimed capability is.
    #[must_use]
    pub fn is_side_effect_free(&self) -> bool {
        !self.capabilities.is_empty()
            && self
                .capabilities
                .iter()
                .all(|cap| cap.is_side_effect_free())
    }
}

/// Snapshot entry exposed to the model for function calling.
#[derive(Clone, Debug, Serialize)]
pub struct ToolDeclaration {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

fn valid_name(name: &str) -> bool {
    static NAME_RE: OnceLock<Regex> = OnceLock::new();
    NAME_RE
        .get_or_init(|| Regex::new(r"^[a-z][a-z0-9_]{0,63}$").expect("static regex"))
        .is_match(name)
}

/// Registry of available tools.
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, ToolRegistration>>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
        }
    }

    /// Register a tool. Re-registering an existing name replaces it
    /// atomically. Invalid names fail loudly at startup.
    pub fn register(
        &self,
        tool: Arc<dyn DatabaseTool>,
        capabilities: impl IntoIterator<Item = Capability>,
        tags: impl IntoIterator<Item = String>,
        priority: i32,
        metadata: Value,
    ) -> Result<()> {
        let name = tool.name().to_string();
        if !valid_name(&name) {
            return Err(DbError::Config(format!(
                "tool name '{name}' must match [a-z][a-z0-9_]{{0,63}}"
            )));
        }
        let registration = ToolRegistration {
            tool,
            capabilities: capabilities.into_iter().collect(),
            tags: tags.into_iter().collect(),
            priority,
            enabled: true,
            metadata,
        };
        self.tools
            .write()
            .expect("registry lock")
            .insert(name, registration);
        Ok(())
    }

    /// Remove a tool by name. Returns whether it was present.
    pub fn unregister(&self, name: &str) -> bool {
        self.tools
            .write()
            .expect("registry lock")
            .remove(name)
            .is_some()
    }

    /// Get a tool by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn DatabaseTool>> {
        self.tools
            .read()
            .expect("registry lock")
            .get(name)
            .filter(|r| r.enabled)
            .map(|r| Arc::clone(&r.tool))
    }

    /// Get a full registration by name.
    #[must_use]
    pub fn registration(&self, name: &str) -> Option<ToolRegistration> {
        self.tools.read().expect("registry lock").get(name).cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tools.read().expect("registry lock").len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tools.read().expect("registry lock").is_empty()
    }

    /// All registrations, priority descending then name ascending.
    #[must_use]
    pub fn list(&self) -> Vec<ToolRegistration> {
        let tools = self.tools.read().expect("registry lock");
        let mut out: Vec<ToolRegistration> = tools.values().cloned().collect();
        out.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.tool.name().cmp(b.tool.name()))
        });
        out
    }

    /// Tools claiming exactly this capability.
    #[must_use]
    pub fn by_capability(&self, capability: Capability) -> Vec<Arc<dyn DatabaseTool>> {
        self.list()
            .into_iter()
            .filter(|r| r.enabled && r.capabilities.contains(&capability))
            .map(|r| r.tool)
            .collect()
    }

    /// Tools claiming all (or any, when `match_all` is false) of the given
    /// capabilities.
    #[must_use]
    pub fn by_capabilities(
        &self,
        capabilities: &[Capability],
        match_all: bool,
    ) -> Vec<Arc<dyn DatabaseTool>> {
        self.list()
            .into_iter()
            .filter(|r| {
                r.enabled
                    && if match_all {
                        capabilities.iter().all(|c| r.capabilities.contains(c))
                    } else {
                        capabilities.iter().any(|c| r.capabilities.contains(c))
                    }
            })
            .map(|r| r.tool)
            .collect()
    }

    /// Substring search over name, description, and tags. Results sorted by
    /// capability intersection size, then priority, then name.
    #[must_use]
    pub fn search(
        &self,
        query: &str,
        capabilities: Option<&[Capability]>,
    ) -> Vec<Arc<dyn DatabaseTool>> {
        let needle = query.to_ascii_lowercase();
        let wanted: HashSet<Capability> = capabilities
            .map(|caps| caps.iter().copied().collect())
            .unwrap_or_default();

        let mut matches: Vec<(usize, i32, String, Arc<dyn DatabaseTool>)> = self
            .list()
            .into_iter()
            .filter(|r| r.enabled)
            .filter(|r| {
                r.tool.name().contains(&needle)
                    || r.tool.description().to_ascii_lowercase().contains(&needle)
                    || r.tags.iter().any(|t| t.to_ascii_lowercase().contains(&needle))
            })
            .map(|r| {
                let overlap = r.capabilities.intersection(&wanted).count();
                (overlap, r.priority, r.tool.name().to_string(), r.tool)
            })
            .collect();

        matches.sort_by(|a, b| {
            b.0.cmp(&a.0)
                .then_with(|| b.1.cmp(&a.1))
                .then_with(|| a.2.cmp(&b.2))
        });
        matches.into_iter().map(|(_, _, _, tool)| tool).collect()
    }

    /// Function-calling snapshot handed to the LLM service.
    #[must_use]
    pub fn snapshot_for_llm(&self) -> Vec<ToolDeclaration> {
        self.list()
            .into_iter()
            .filter(|r| r.enabled)
            .map(|r| ToolDeclaration {
                name: r.tool.name().to_string(),
                description: r.tool.description().to_string(),
                parameters: r.tool.input_schema(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{ToolContext, ToolResult};
    use crate::types::AbortSignal;
    use async_trait::async_trait;
    use serde_json::json;

    struct StubTool {
        name: &'static str,
        description: &'static str,
    }

    #[async_trait]
    impl DatabaseTool for StubTool {
        fn name(&self) -> &str {
            self.name
        }

        fn description(&self) -> &str {
            self.description
        }

        fn input_schema(&self) -> Value {
            json!({"type": "object"})
        }

        async fn execute(
            &self,
            _args: Value,
            _ctx: &ToolContext,
            _signal: &AbortSignal,
        ) -> anyhow::Result<ToolResult> {
            Ok(ToolResult::new("ok", json!({})))
        }
    }

    fn stub(name: &'static str, description: &'static str) -> Arc<dyn DatabaseTool> {
        Arc::new(StubTool { name, description })
    }

    #[test]
    fn register_and_lookup() {
        let registry = ToolRegistry::new();
        registry
            .register(
                stub("sql_execute", "Run SQL"),
                [Capability::Query, Capability::Modify],
                ["sql".to_string()],
                90,
                json!({}),
            )
            .expect("register");

        assert_eq!(registry.len(), 1);
        assert!(registry.get("sql_execute").is_some());
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn invalid_names_fail_loudly() {
        let registry = ToolRegistry::new();
        let err = registry
            .register(stub("BadName", "x"), [], [], 0, json!({}))
            .unwrap_err();
        assert_eq!(err.kind(), "ConfigError");
        assert!(registry.is_empty());
    }

    #[test]
    fn reregistering_replaces_atomically() {
        let registry = ToolRegistry::new();
        registry
            .register(stub("tool_a", "first"), [], [], 0, json!({}))
            .expect("first");
        registry
            .register(stub("tool_a", "second"), [], [], 0, json!({}))
            .expect("second");
        assert_eq!(registry.len(), 1);
        assert_eq!(
            registry.get("tool_a").expect("present").description(),
            "second"
        );
    }

    #[test]
    fn list_orders_by_priority_then_name() {
        let registry = ToolRegistry::new();
        registry
            .register(stub("b_tool", "x"), [], [], 50, json!({}))
            .expect("b");
        registry
            .register(stub("a_tool", "x"), [], [], 50, json!({}))
            .expect("a");
        registry
            .register(stub("c_tool", "x"), [], [], 90, json!({}))
            .expect("c");

        let names: Vec<String> = registry
            .list()
            .iter()
            .map(|r| r.tool.name().to_string())
            .collect();
        assert_eq!(names, vec!["c_tool", "a_tool", "b_tool"]);
    }

    #[test]
    fn capability_filters() {
        let registry = ToolRegistry::new();
        registry
            .register(
                stub("sql_execute", "Run SQL"),
                [Capability::Query, Capability::Modify],
                [],
                90,
                json!({}),
            )
            .expect("sql");
        registry
            .register(
                stub("schema_discovery", "Explore schema"),
                [Capability::Explore],
                [],
                85,
                json!({}),
            )
            .expect("schema");

        assert_eq!(registry.by_capability(Capability::Explore).len(), 1);
        assert_eq!(
            registry
                .by_capabilities(&[Capability::Query, Capability::Explore], false)
                .len(),
            2
        );
        assert_eq!(
            registry
                .by_capabilities(&[Capability::Query, Capability::Modify], true)
                .len(),
            1
        );
    }

    #[test]
    fn search_matches_name_description_and_tags() {
        let registry = ToolRegistry::new();
        registry
            .register(
                stub("sql_execute", "Run SQL statements"),
                [Capability::Query],
                ["dml".to_string()],
                90,
                json!({}),
            )
            .expect("sql");
        registry
            .register(
                stub("file_read", "Read a file from disk"),
                [Capability::Read],
                ["filesystem".to_string()],
                50,
                json!({}),
            )
            .expect("file");

        assert_eq!(registry.search("sql", None).len(), 1);
        assert_eq!(registry.search("disk", None).len(), 1);
        assert_eq!(registry.search("dml", None).len(), 1);
        assert!(registry.search("nonexistent", None).is_empty());

        // Capability overlap ranks first.
        let ranked = registry.search("e", Some(&[Capability::Read]));
        assert_eq!(ranked[0].name(), "file_read");
    }

    #[test]
    fn snapshot_exposes_schema() {
        let registry = ToolRegistry::new();
        registry
            .register(stub("sql_execute", "Run SQL"), [Capability::Query], [], 90, json!({}))
            .expect("register");
        let snapshot = registry.snapshot_for_llm();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].name, "sql_execute");
        assert_eq!(snapshot[0].parameters["type"], "object");
    }

    #[test]
    fn side_effect_free_requires_all_capabilities_clean() {
        let registry = ToolRegistry::new();
        registry
            .register(
                stub("sql_execute", "Run SQL"),
                [Capability::Query, Capability::Modify],
                [],
                90,
                json!({}),
            )
            .expect("sql");
        registry
            .register(
                stub("schema_discovery", "Explore"),
                [Capability::Explore, Capability::Analyze],
                [],
                85,
                json!({}),
            )
            .expect("schema");

        assert!(!registry
            .registration("sql_execute")
            .expect("sql registered")
            .is_side_effect_free());
        assert!(registry
            .registration("schema_discovery")
            .expect("schema registered")
            .is_side_effect_free());
    }
}
