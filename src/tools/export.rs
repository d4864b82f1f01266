//! Query export tool: streams a result set into a CSV or JSON file.

use super::{resolve_workspace_path, DatabaseTool, ToolContext, ToolResult};
use crate::adapters::{QueryOptions, SqlValue};
use crate::types::AbortSignal;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::io::AsyncWriteExt;

#[derive(Debug, Deserialize)]
struct ExportInput {
    sql: String,
    path: String,
    /// `csv` or `json`
    #[serde(default = "default_format")]
    format: String,
    #[serde(default)]
    database: Option<String>,
}

fn default_format() -> String {
    "csv".to_string()
}

/// Streams query results to a file without buffering the full result set.
pub struct DatabaseExportTool;

fn csv_escape(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

fn render_csv_value(value: &SqlValue) -> String {
    match value {
        SqlValue::Null => String::new(),
        SqlValue::Bool(b) => b.to_string(),
        SqlValue::Int(i) => i.to_string(),
        SqlValue::Float(f) => f.to_string(),
        SqlValue::Text(s) => csv_escape(s),
    }
}

#[async_trait]
impl DatabaseTool for DatabaseExportTool {
    fn name(&self) -> &str {
        "database_export"
    }

    fn display_name(&self) -> &str {
        "Data Export"
    }

    fn description(&self) -> &str {
        "Runs a query and streams the result to a CSV or JSON file under the \
         workspace. Large results are streamed in batches, not buffered."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "sql": { "type": "string", "description": "The query to export" },
                "path": { "type": "string", "description": "Output file path" },
                "format": {
                    "type": "string",
                    "enum": ["csv", "json"],
                    "description": "Output format",
                    "default": "csv"
                },
                "database": { "type": "string", "description": "Connection alias; defaults to current" }
            },
            "required": ["sql", "path"]
        })
    }

    fn default_timeout(&self) -> Duration {
        Duration::from_secs(300)
    }

    fn validate(&self, args: &Value) -> Option<String> {
        if args.get("sql").and_then(Value::as_str).unwrap_or("").trim().is_empty() {
            return Some("sql must not be empty".to_string());
        }
        if args.get("path").and_then(Value::as_str).unwrap_or("").trim().is_empty() {
            return Some("path must not be empty".to_string());
        }
        if let Some(format) = args.get("format").and_then(Value::as_str) {
            if !matches!(format, "csv" | "json") {
                return Some(format!("unsupported format '{format}'"));
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
        let input: ExportInput =
            serde_json::from_value(args).context("invalid database_export input")?;
        let connection = match input.database.as_deref() {
            Some(alias) => ctx.connections.get_alias(alias).await?,
            None => ctx.connections.get().await.context("no current connection")?,
        };
        let path = resolve_workspace_path(ctx, &input.path)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("cannot create {}", parent.display()))?;
        }

        let opts = QueryOptions {
            max_rows: usize::MAX,
            timeout: self.default_timeout(),
            read_only: false,
        };
        let mut stream = connection
            .adapter
            .execute_stream(&input.sql, &[], &opts, signal)
            .await?;

        let mut file = tokio::fs::File::create(&path)
            .await
            .with_context(|| format!("cannot create {}", path.display()))?;
        let mut rows_written: u64 = 0;
        let mut header_written = false;
        let json_format = input.format == "json";
        let mut columns: Vec<String> = Vec::new();

        if json_format {
            file.write_all(b"[").await?;
        }

        while let Some(batch) = stream.recv().await {
            let batch = batch?;
            if !header_written {
                columns = batch.columns.clone();
                if !json_format {
                    let header: Vec<String> =
                        columns.iter().map(|c| csv_escape(c)).collect();
                    file.write_all(header.join(",").as_bytes()).await?;
                    file.write_all(b"\n").await?;
                }
                header_written = true;
            }
            for row in &batch.rows {
                if json_format {
                    let object: serde_json::Map<String, Value> = columns
                        .iter()
                        .zip(row.iter())
                        .map(|(c, v)| (c.clone(), v.to_json()))
                        .collect();
                    let prefix = if rows_written == 0 { "" } else { ",\n" };
                    file.write_all(prefix.as_bytes()).await?;
                    file.write_all(serde_json::to_string(&object)?.as_bytes())
                        .await?;
                } else {
                    let line: Vec<String> = row.iter().map(render_csv_value).collect();
                    file.write_all(line.join(",").as_bytes()).await?;
                    file.write_all(b"\n").await?;
                }
                rows_written += 1;
            }
        }

        if json_format {
            file.write_all(b"]\n").await?;
        }
        file.flush().await?;

        Ok(ToolResult::new(
            format!("exported {rows_written} row(s) to {}", input.path),
            json!({
                "path": input.path,
                "format": input.format,
                "rows_written": rows_written,
            }),
        ))
    }
}
