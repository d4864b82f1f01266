//! Connection management tool: open, switch, list, close, and save aliases.

use super::{DatabaseTool, ToolContext, ToolResult};
use crate::adapters::DatabaseProfile;
use crate::connection::SavedConnection;
use crate::types::AbortSignal;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Debug, Deserialize)]
struct ConnectInput {
    /// `open`, `use`, `list`, `close`, or `save`
    action: String,
    #[serde(default)]
    alias: Option<String>,
    /// Connection string for `open`/`save`; a saved alias is used when omitted
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    read_only: bool,
}

/// Manages named database connections for the session.
pub struct DatabaseConnectTool;

#[async_trait]
impl DatabaseTool for DatabaseConnectTool {
    fn name(&self) -> &str {
        "database_connect"
    }

    fn display_name(&self) -> &str {
        "Connection Manager"
    }

    fn description(&self) -> &str {
        "Opens, switches, lists, closes, and saves named database connections. \
         Supported URLs: sqlite:///path, postgresql://..., mysql://... . A newly \
         opened alias becomes the current connection."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "action": {
                    "type": "string",
                    "enum": ["open", "use", "list", "close", "save"],
                    "description": "What to do"
                },
                "alias": { "type": "string", "description": "Connection alias" },
                "url": { "type": "string", "description": "Connection string (for open/save)" },
                "read_only": { "type": "boolean", "description": "Open the connection read-only", "default": false }
            },
            "required": ["action"]
        })
    }

    fn validate(&self, args: &Value) -> Option<String> {
        let action = args.get("action").and_then(Value::as_str).unwrap_or("");
        if !matches!(action, "open" | "use" | "list" | "close" | "save") {
            return Some(format!("unknown action '{action}'"));
        }
        if action != "list" && args.get("alias").and_then(Value::as_str).unwrap_or("").is_empty() {
            return Some(format!("action '{action}' requires an alias"));
        }
        None
    }

    async fn execute(
        &self,
        args: Value,
        ctx: &ToolContext,
        _signal: &AbortSignal,
    ) -> Result<ToolResult> {
        let input: ConnectInput =
            serde_json::from_value(args).context("invalid database_connect input")?;

        match input.action.as_str() {
            "open" => {
                let alias = input.alias.clone().context("alias is required")?;
                let profile = match &input.url {
                    Some(url) => DatabaseProfile {
                        url: url.clone(),
                        read_only: input.read_only,
                        ..DatabaseProfile::from_url(url.clone())
                    },
                    None => {
                        let saved = ctx.connections.load_saved()?;
                        let entry = saved
                            .get(&alias)
                            .with_context(|| format!("no saved connection named '{alias}'"))?;
                        DatabaseProfile {
                            url: entry.url.clone(),
                            read_only: entry.read_only || input.read_only,
                            ..DatabaseProfile::from_url(entry.url.clone())
                        }
                    }
                };
                let connection = ctx.connections.open(&alias, profile, true).await?;
                Ok(ToolResult::new(
                    format!("connected '{alias}' ({})", connection.adapter.dialect()),
                    json!({
                        "alias": alias,
                        "dialect": connection.adapter.dialect().to_string(),
                        "read_only": connection.adapter.read_only(),
                        "current": true,
                    }),
                ))
            }
            "use" => {
                let alias = input.alias.clone().context("alias is required")?;
                ctx.connections.use_alias(&alias).await?;
                Ok(ToolResult::new(
                    format!("current connection is now '{alias}'"),
                    json!({ "alias": alias, "current": true }),
                ))
            }
            "list" => {
                let connections = ctx.connections.list().await;
                let saved: Vec<String> = ctx.connections.load_saved()?.keys().cloned().collect();
                Ok(ToolResult::new(
                    format!("{} open connection(s)", connections.len()),
                    json!({
                        "open": connections,
                        "saved": saved,
                    }),
                ))
            }
            "close" => {
                let alias = input.alias.clone().context("alias is required")?;
                ctx.connections.close(&alias).await?;
                Ok(ToolResult::new(
                    format!("closed '{alias}'"),
                    json!({ "alias": alias }),
                ))
            }
            "save" => {
                let alias = input.alias.clone().context("alias is required")?;
                let url = input
                    .url
                    .context("action 'save' requires a url")?;
                ctx.connections.save_connection(
                    &alias,
                    &SavedConnection {
                        url,
                        read_only: input.read_only,
                    },
                )?;
                Ok(ToolResult::new(
                    format!("saved '{alias}'"),
                    json!({ "alias": alias, "saved": true }),
                ))
            }
            other => anyhow::bail!("unknown action '{other}'"),
        }
    }
}
