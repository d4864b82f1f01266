//! SQL execution tool.

use super::{DatabaseTool, ToolContext, ToolResult};
use crate::adapters::QueryOptions;
use crate::connection::ActiveConnection;
use crate::types::AbortSignal;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Deserialize)]
struct SqlInput {
    /// Statement to execute; multi-line is fine
    sql: String,
    /// Connection alias; defaults to the current connection
    #[serde(default)]
    database: Option<String>,
    /// `execute` runs and commits; `dry_run` runs inside a rolled-back transaction
    #[serde(default = "default_mode")]
    mode: String,
    /// Row cap for result sets
    #[serde(default)]
    limit: Option<usize>,
}

fn default_mode() -> String {
    "execute".to_string()
}

/// Executes SQL with dialect adaptation and result formatting.
pub struct SqlTool;

impl SqlTool {
    async fn resolve_connection(
        ctx: &ToolContext,
        database: Option<&str>,
    ) -> Result<Arc<ActiveConnection>> {
        match database {
            Some(alias) => ctx
                .connections
                .get_alias(alias)
                .await
                .with_context(|| format!("connection '{alias}' is not open")),
            None => ctx
                .connections
                .get()
                .await
                .context("no current connection; use database_connect first"),
        }
    }
}

#[async_trait]
impl DatabaseTool for SqlTool {
    fn name(&self) -> &str {
        "sql_execute"
    }

    fn display_name(&self) -> &str {
        "SQL Executor"
    }

    fn description(&self) -> &str {
        "Executes SQL statements against the current or a named database connection. \
         Supports a dry_run mode that runs the statement inside a transaction and rolls \
         it back. Returns columns, rows, affected counts, and timing."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "sql": {
                    "type": "string",
                    "description": "The SQL statement to execute"
                },
                "database": {
                    "type": "string",
                    "description": "Connection alias created with database_connect; defaults to the current connection"
                },
                "mode": {
                    "type": "string",
                    "enum": ["execute", "dry_run"],
                    "description": "execute runs normally; dry_run rolls back afterwards",
                    "default": "execute"
                },
                "limit": {
                    "type": "integer",
                    "description": "Maximum number of result rows to return"
                }
            },
            "required": ["sql"]
        })
    }

    fn default_timeout(&self) -> Duration {
        Duration::from_secs(120)
    }

    fn validate(&self, args: &Value) -> Option<String> {
        let sql = args.get("sql").and_then(Value::as_str).unwrap_or("");
        if sql.trim().is_empty() {
            return Some("sql must not be empty".to_string());
        }
        if let Some(mode) = args.get("mode").and_then(Value::as_str) {
            if !matches!(mode, "execute" | "dry_run") {
                return Some(format!("unknown mode '{mode}'"));
            }
        }
        None
    }

    async fn execute(
        &self,
        args: Value,
        ctx: &ToolContext,
        signal: &AbortSignal,
    ) -> Result<ToolResult> {
        let input: SqlInput = serde_json::from_value(args).context("invalid sql_execute input")?;
        let connection = Self::resolve_connection(ctx, input.database.as_deref()).await?;

        let opts = QueryOptions {
            max_rows: input.limit.unwrap_or(1000),
            ..QueryOptions::default()
        };

        let result = if input.mode == "dry_run" {
            let tx = connection.adapter.begin_tx(None).await?;
            let outcome = connection.execute(&input.sql, &[], &opts, signal).await;
            connection.adapter.rollback(&tx).await?;
            outcome?
        } else {
            connection.execute(&input.sql, &[], &opts, signal).await?
        };

        let summary = if result.columns.is_empty() {
            format!(
                "{} row(s) affected in {}ms",
                result.rows_affected, result.elapsed_ms
            )
        } else {
            format!(
                "{} row(s){} in {}ms",
                result.rows.len(),
                if result.truncated { " (truncated)" } else { "" },
                result.elapsed_ms
            )
        };

        let mut data = result.to_response_value();
        if input.mode == "dry_run" {
            data["dry_run"] = Value::Bool(true);
        }
        Ok(ToolResult::new(summary, data))
    }
}
