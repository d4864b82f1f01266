//! Tool definition and execution context.
//!
//! Tools are the units of work the model can invoke. Each implements
//! [`DatabaseTool`] and is discovered by name through the
//! [`ToolRegistry`](crate::registry::ToolRegistry). Tools never hold a
//! reference to the scheduler; everything they need arrives through
//! [`ToolContext`].

mod code_exec;
mod connect;
mod export;
mod file;
mod http;
mod schema;
mod shell;
mod sql;

pub use code_exec::CodeExecutionTool;
pub use connect::DatabaseConnectTool;
pub use export::DatabaseExportTool;
pub use file::{FileReadTool, FileWriteTool};
pub use http::WebFetchTool;
pub use schema::{SchemaDiscoveryTool, TableDetailsTool};
pub use shell::ShellTool;
pub use sql::SqlTool;

use crate::config::AgentSettings;
use crate::connection::ConnectionManager;
use crate::types::AbortSignal;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Context handed to every tool execution.
#[derive(Clone)]
pub struct ToolContext {
    pub settings: Arc<AgentSettings>,
    pub connections: Arc<ConnectionManager>,
    pub workspace_root: PathBuf,
}

impl ToolContext {
    #[must_use]
    pub fn new(settings: Arc<AgentSettings>, connections: Arc<ConnectionManager>) -> Self {
        let workspace_root = settings.workspace_root().to_path_buf();
        Self {
            settings,
            connections,
            workspace_root,
        }
    }
}

/// Result of a tool execution, fed back to the model as a function response.
#[derive(Clone, Debug)]
pub struct ToolResult {
    /// Short human-readable summary for UI event lines
    pub summary: String,
    /// Structured payload returned to the model
    pub data: Value,
}

impl ToolResult {
    #[must_use]
    pub fn new(summary: impl Into<String>, data: Value) -> Self {
        Self {
            summary: summary.into(),
            data,
        }
    }
}

/// A unit of work the model can invoke.
#[async_trait]
pub trait DatabaseTool: Send + Sync {
    /// Unique name, `[a-z][a-z0-9_]*` (used in model tool calls)
    fn name(&self) -> &str;

    /// Human-readable display name
    fn display_name(&self) -> &str {
        self.name()
    }

    /// What this tool does, for the model
    fn description(&self) -> &str;

    /// JSON schema for the tool's parameters
    fn input_schema(&self) -> Value;

    /// Default execution deadline; overridable per call via `_timeout_ms`
    fn default_timeout(&self) -> Duration {
        Duration::from_secs(60)
    }

    /// Validate arguments before scheduling. Return a message on rejection.
    fn validate(&self, _args: &Value) -> Option<String> {
        None
    }

    /// Execute the tool.
    ///
    /// # Errors
    /// Returns an error if execution fails; the scheduler captures it into
    /// a structured function response.
    async fn execute(
        &self,
        args: Value,
        ctx: &ToolContext,
        signal: &AbortSignal,
    ) -> Result<ToolResult>;
}

/// Resolve a possibly relative path under the workspace root, rejecting
/// `..` traversal for relative inputs.
pub(crate) fn resolve_workspace_path(ctx: &ToolContext, raw: &str) -> Result<PathBuf> {
    let candidate = PathBuf::from(raw);
    if candidate.is_absolute() {
        return Ok(candidate);
    }
    if raw.split('/').any(|seg| seg == "..") {
        anyhow::bail!("path escapes the workspace: {raw}");
    }
    Ok(ctx.workspace_root.join(candidate))
}
