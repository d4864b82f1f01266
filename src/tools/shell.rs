//! Shell command execution tool.

use super::{DatabaseTool, ToolContext, ToolResult};
use crate::types::AbortSignal;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tracing::debug;

const MAX_OUTPUT_BYTES: usize = 30_000;

#[derive(Debug, Deserialize)]
struct ShellInput {
    command: String,
    /// Timeout in milliseconds (default 2 minutes, capped at 10)
    #[serde(default = "default_timeout_ms")]
    timeout_ms: u64,
}

const fn default_timeout_ms() -> u64 {
    120_000
}

/// Executes a shell command and returns stdout, stderr, and the exit code.
pub struct ShellTool;

#[async_trait]
impl DatabaseTool for ShellTool {
    fn name(&self) -> &str {
        "shell_execute"
    }

    fn display_name(&self) -> &str {
        "Shell"
    }

    fn description(&self) -> &str {
        "Execute a shell command in the workspace directory. Returns stdout, stderr, \
         and the exit code. Commands outside the configured whitelist require \
         confirmation."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute"
                },
                "timeout_ms": {
                    "type": "integer",
                    "description": "Timeout in milliseconds. Default: 120000"
                }
            },
            "required": ["command"]
        })
    }

    fn default_timeout(&self) -> Duration {
        Duration::from_millis(default_timeout_ms())
    }

    fn validate(&self, args: &Value) -> Option<String> {
        let command = args.get("command").and_then(Value::as_str).unwrap_or("");
        if command.trim().is_empty() {
            return Some("command must not be empty".to_string());
        }
        None
    }

    async fn execute(
        &self,
        args: Value,
        ctx: &ToolContext,
        signal: &AbortSignal,
    ) -> Result<ToolResult> {
        let input: ShellInput =
            serde_json::from_value(args).context("invalid shell_execute input")?;
        let timeout = Duration::from_millis(input.timeout_ms.min(600_000));

        debug!(command = %input.command, "spawning shell command");
        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&input.command)
            .current_dir(&ctx.workspace_root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .context("failed to spawn shell")?;

        let mut stdout_pipe = child.stdout.take().context("missing stdout pipe")?;
        let mut stderr_pipe = child.stderr.take().context("missing stderr pipe")?;
        // Drain pipes concurrently with wait so a chatty child cannot block
        // on a full pipe buffer.
        let stdout_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            stdout_pipe.read_to_end(&mut buf).await.ok();
            buf
        });
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            stderr_pipe.read_to_end(&mut buf).await.ok();
            buf
        });

        let waited = tokio::select! {
            status = child.wait() => Some(status.context("wait failed")?),
            () = signal.cancelled() => None,
            () = tokio::time::sleep(timeout) => {
                child.kill().await.ok();
                anyhow::bail!("command timed out after {}ms", timeout.as_millis());
            }
        };
        let Some(status) = waited else {
            child.kill().await.ok();
            anyhow::bail!("command cancelled");
        };

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();
        let stdout = truncate(String::from_utf8_lossy(&stdout).into_owned());
        let stderr = truncate(String::from_utf8_lossy(&stderr).into_owned());
        let exit_code = status.code().unwrap_or(-1);

        let summary = if status.success() {
            "exit 0".to_string()
        } else {
            format!("exit {exit_code}")
        };

        Ok(ToolResult::new(
            summary,
            json!({
                "exit_code": exit_code,
                "stdout": stdout,
                "stderr": stderr,
            }),
        ))
    }
}

fn truncate(mut text: String) -> String {
    if text.len() > MAX_OUTPUT_BYTES {
        let mut cut = MAX_OUTPUT_BYTES;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
        text.push_str("\n... (output truncated)");
    }
    text
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
    async fn captures_stdout_and_exit_code() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = context(dir.path());
        let result = ShellTool
            .execute(json!({"command": "echo out; echo err 1>&2"}), &ctx, &AbortSignal::new())
            .await
            .expect("run");
        assert_eq!(result.data["exit_code"], 0);
        assert_eq!(result.data["stdout"], "out\n");
        assert_eq!(result.data["stderr"], "err\n");
    }

    #[tokio::test]
    async fn nonzero_exit_is_reported_not_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = context(dir.path());
        let result = ShellTool
            .execute(json!({"command": "exit 3"}), &ctx, &AbortSignal::new())
            .await
            .expect("run");
        assert_eq!(result.data["exit_code"], 3);
        assert_eq!(result.summary, "exit 3");
    }

    #[tokio::test]
    async fn timeout_kills_the_process() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = context(dir.path());
        let err = ShellTool
            .execute(
                json!({"command": "sleep 5", "timeout_ms": 50}),
                &ctx,
                &AbortSignal::new(),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn cancellation_kills_the_process() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = context(dir.path());
        let signal = AbortSignal::new();
        let run = {
            let ctx = ctx.clone();
            let signal = signal.clone();
            tokio::spawn(async move {
                ShellTool
                    .execute(json!({"command": "sleep 5"}), &ctx, &signal)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        signal.abort();
        let err = run.await.expect("join").unwrap_err();
        assert!(err.to_string().contains("cancelled"));
    }

    #[test]
    fn truncation_is_bounded() {
        let long = "x".repeat(MAX_OUTPUT_BYTES + 100);
        let out = truncate(long);
        assert!(out.len() <= MAX_OUTPUT_BYTES + 30);
        assert!(out.ends_with("(output truncated)"));
    }
}
