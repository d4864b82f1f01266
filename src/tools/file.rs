//! File read and write tools, scoped to the workspace root by default.

use super::{resolve_workspace_path, DatabaseTool, ToolContext, ToolResult};
use crate::types::AbortSignal;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

const MAX_READ_BYTES: u64 = 1024 * 1024;

/// Reads a text file.
pub struct FileReadTool;

#[derive(Debug, Deserialize)]
struct ReadInput {
    path: String,
    /// 1-based line to start from
    #[serde(default)]
    offset: Option<usize>,
    /// Maximum number of lines to return
    #[serde(default)]
    limit: Option<usize>,
}

#[async_trait]
impl DatabaseTool for FileReadTool {
    fn name(&self) -> &str {
        "file_read"
    }

    fn display_name(&self) -> &str {
        "File Reader"
    }

    fn description(&self) -> &str {
        "Reads a text file, optionally a line range. Relative paths resolve under \
         the workspace root."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "File path" },
                "offset": { "type": "integer", "description": "1-based first line to return" },
                "limit": { "type": "integer", "description": "Maximum number of lines" }
            },
            "required": ["path"]
        })
    }

    async fn execute(
        &self,
        args: Value,
        ctx: &ToolContext,
        _signal: &AbortSignal,
    ) -> Result<ToolResult> {
        let input: ReadInput = serde_json::from_value(args).context("invalid file_read input")?;
        let path = resolve_workspace_path(ctx, &input.path)?;

        let meta = tokio::fs::metadata(&path)
            .await
            .with_context(|| format!("cannot stat {}", path.display()))?;
        if meta.len() > MAX_READ_BYTES {
            anyhow::bail!(
                "file is {} bytes, larger than the {MAX_READ_BYTES} byte limit",
                meta.len()
            );
        }

        let raw = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("cannot read {}", path.display()))?;

        let start = input.offset.unwrap_or(1).saturating_sub(1);
        let all_lines = raw.lines().count();
        let content: String = match input.limit {
            Some(limit) => raw
                .lines()
                .skip(start)
                .take(limit)
                .collect::<Vec<_>>()
                .join("\n"),
            None if start > 0 => raw.lines().skip(start).collect::<Vec<_>>().join("\n"),
            None => raw,
        };

        Ok(ToolResult::new(
            format!("{} ({} lines)", input.path, all_lines),
            json!({
                "path": input.path,
                "content": content,
                "total_lines": all_lines,
            }),
        ))
    }
}

/// Writes a text file, creating parent directories as needed.
pub struct FileWriteTool;

#[derive(Debug, Deserialize)]
struct WriteInput {
    path: String,
    content: String,
    /// Append instead of overwrite
    #[serde(default)]
    append: bool,
}

#[async_trait]
impl DatabaseTool for FileWriteTool {
    fn name(&self) -> &str {
        "file_write"
    }

    fn display_name(&self) -> &str {
        "File Writer"
    }

    fn description(&self) -> &str {
        "Writes text to a file, overwriting or appending. Relative paths resolve \
         under the workspace root; writes outside it are gated on confirmation."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "File path" },
                "content": { "type": "string", "description": "Content to write" },
                "append": { "type": "boolean", "description": "Append instead of overwrite", "default": false }
            },
            "required": ["path", "content"]
        })
    }

    async fn execute(
        &self,
        args: Value,
        ctx: &ToolContext,
        _signal: &AbortSignal,
    ) -> Result<ToolResult> {
        let input: WriteInput = serde_json::from_value(args).context("invalid file_write input")?;
        let path = resolve_workspace_path(ctx, &input.path)?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("cannot create {}", parent.display()))?;
        }

        let bytes = input.content.len();
        if input.append {
            use tokio::io::AsyncWriteExt;
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await
                .with_context(|| format!("cannot open {}", path.display()))?;
            file.write_all(input.content.as_bytes())
                .await
                .with_context(|| format!("cannot append to {}", path.display()))?;
        } else {
            tokio::fs::write(&path, &input.content)
                .await
                .with_context(|| format!("cannot write {}", path.display()))?;
        }

        Ok(ToolResult::new(
            format!("wrote {bytes} bytes to {}", input.path),
            json!({ "path": input.path, "bytes_written": bytes, "appended": input.append }),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::AdapterFactory;
    use crate::config::AgentSettings;
    use crate::connection::ConnectionManager;
    use std::sync::Arc;

    fn context(workspace: &std::path::Path) -> ToolContext {
        let settings = Arc::new(AgentSettings::load_from(workspace).expect("load"));
        let connections = Arc::new(ConnectionManager::new(Arc::new(AdapterFactory::new())));
        ToolContext::new(settings, connections)
    }

    #[tokio::test]
    async fn write_then_read_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = context(dir.path());
        let signal = AbortSignal::new();

        FileWriteTool
            .execute(
                json!({"path": "out/report.txt", "content": "alpha\nbeta\ngamma"}),
                &ctx,
                &signal,
            )
            .await
            .expect("write");

        let read = FileReadTool
            .execute(json!({"path": "out/report.txt"}), &ctx, &signal)
            .await
            .expect("read");
        assert_eq!(read.data["content"], "alpha\nbeta\ngamma");
        assert_eq!(read.data["total_lines"], 3);
    }

    #[tokio::test]
    async fn read_supports_line_ranges() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = context(dir.path());
        let signal = AbortSignal::new();

        FileWriteTool
            .execute(
                json!({"path": "lines.txt", "content": "1\n2\n3\n4\n5"}),
                &ctx,
                &signal,
            )
            .await
            .expect("write");

        let read = FileReadTool
            .execute(
                json!({"path": "lines.txt", "offset": 2, "limit": 2}),
                &ctx,
                &signal,
            )
            .await
            .expect("read");
        assert_eq!(read.data["content"], "2\n3");
    }

    #[tokio::test]
    async fn append_extends_the_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = context(dir.path());
        let signal = AbortSignal::new();

        FileWriteTool
            .execute(json!({"path": "log.txt", "content": "a"}), &ctx, &signal)
            .await
            .expect("write");
        FileWriteTool
            .execute(
                json!({"path": "log.txt", "content": "b", "append": true}),
                &ctx,
                &signal,
            )
            .await
            .expect("append");

        let read = FileReadTool
            .execute(json!({"path": "log.txt"}), &ctx, &signal)
            .await
            .expect("read");
        assert_eq!(read.data["content"], "ab");
    }

    #[tokio::test]
    async fn traversal_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = context(dir.path());
        let signal = AbortSignal::new();
        let err = FileReadTool
            .execute(json!({"path": "../outside.txt"}), &ctx, &signal)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("escapes"));
    }
}
