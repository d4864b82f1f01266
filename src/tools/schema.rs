//! Schema exploration tools.

use super::{DatabaseTool, ToolContext, ToolResult};
use crate::types::AbortSignal;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

/// Lists tables and views, optionally filtered by a substring pattern.
pub struct SchemaDiscoveryTool;

#[derive(Debug, Deserialize)]
struct DiscoveryInput {
    #[serde(default)]
    database: Option<String>,
    /// Case-insensitive substring filter on object names
    #[serde(default)]
    pattern: Option<String>,
}

#[async_trait]
impl DatabaseTool for SchemaDiscoveryTool {
    fn name(&self) -> &str {
        "schema_discovery"
    }

    fn display_name(&self) -> &str {
        "Schema Discovery"
    }

    fn description(&self) -> &str {
        "Lists tables and views in the connected database, with column counts. \
         Use table_details for the full definition of one table."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "database": {
                    "type": "string",
                    "description": "Connection alias; defaults to the current connection"
                },
                "pattern": {
                    "type": "string",
                    "description": "Optional case-insensitive substring filter on names"
                }
            }
        })
    }

    async fn execute(
        &self,
        args: Value,
        ctx: &ToolContext,
        _signal: &AbortSignal,
    ) -> Result<ToolResult> {
        let input: DiscoveryInput =
            serde_json::from_value(args).context("invalid schema_discovery input")?;
        let connection = match input.database.as_deref() {
            Some(alias) => ctx.connections.get_alias(alias).await?,
            None => ctx.connections.get().await.context("no current connection")?,
        };

        let schema = connection.adapter.introspect().await?;
        let filter = input.pattern.map(|p| p.to_ascii_lowercase());
        let matches = |name: &str| {
            filter
                .as_deref()
                .map_or(true, |f| name.to_ascii_lowercase().contains(f))
        };

        let tables: Vec<Value> = schema
            .tables
            .iter()
            .filter(|t| matches(&t.name))
            .map(|t| {
                json!({
                    "name": t.name,
                    "columns": t.columns.len(),
                    "indexes": t.indexes.len(),
                    "foreign_keys": t.foreign_keys.len(),
                })
            })
            .collect();
        let views: Vec<&String> = schema.views.iter().filter(|v| matches(v)).collect();

        let summary = format!("{} table(s), {} view(s)", tables.len(), views.len());
        Ok(ToolResult::new(
            summary,
            json!({
                "dialect": connection.adapter.dialect().to_string(),
                "tables": tables,
                "views": views,
            }),
        ))
    }
}

/// Full definition of a single table.
pub struct TableDetailsTool;

#[derive(Debug, Deserialize)]
struct DetailsInput {
    table: String,
    #[serde(default)]
    database: Option<String>,
}

#[async_trait]
impl DatabaseTool for TableDetailsTool {
    fn name(&self) -> &str {
        "table_details"
    }

    fn display_name(&self) -> &str {
        "Table Details"
    }

    fn description(&self) -> &str {
        "Returns the full definition of one table: columns with types, nullability, \
         primary keys, defaults, indexes, and foreign keys."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "table": {
                    "type": "string",
                    "description": "Table name"
                },
                "database": {
                    "type": "string",
                    "description": "Connection alias; defaults to the current connection"
                }
            },
            "required": ["table"]
        })
    }

    fn validate(&self, args: &Value) -> Option<String> {
        let table = args.get("table").and_then(Value::as_str).unwrap_or("");
        if table.trim().is_empty() {
            return Some("table must not be empty".to_string());
        }
        None
    }

    async fn execute(
        &self,
        args: Value,
        ctx: &ToolContext,
        _signal: &AbortSignal,
    ) -> Result<ToolResult> {
        let input: DetailsInput =
            serde_json::from_value(args).context("invalid table_details input")?;
        let connection = match input.database.as_deref() {
            Some(alias) => ctx.connections.get_alias(alias).await?,
            None => ctx.connections.get().await.context("no current connection")?,
        };

        let schema = connection.adapter.introspect().await?;
        let table = schema
            .tables
            .iter()
            .find(|t| t.name.eq_ignore_ascii_case(&input.table))
            .with_context(|| format!("table '{}' not found", input.table))?;

        let columns: Vec<Value> = table
            .columns
            .iter()
            .map(|c| {
                json!({
                    "name": c.name,
                    "type": c.data_type,
                    "nullable": c.nullable,
                    "primary_key": c.primary_key,
                    "default": c.default,
                })
            })
            .collect();
        let foreign_keys: Vec<Value> = table
            .foreign_keys
            .iter()
            .map(|fk| {
                json!({
                    "column": fk.column,
                    "references": format!("{}.{}", fk.references_table, fk.references_column),
                })
            })
            .collect();

        Ok(ToolResult::new(
            format!("{} ({} columns)", table.name, table.columns.len()),
            json!({
                "name": table.name,
                "columns": columns,
                "indexes": table.indexes,
                "foreign_keys": foreign_keys,
            }),
        ))
    }
}
