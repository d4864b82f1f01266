//! Code execution tool: runs a short script through an interpreter.

use super::{DatabaseTool, ToolContext, ToolResult};
use crate::types::AbortSignal;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

const MAX_OUTPUT_BYTES: usize = 30_000;

#[derive(Debug, Deserialize)]
struct CodeInput {
    code: String,
    /// `python` or `sh`
    #[serde(default = "default_language")]
    language: String,
    #[serde(default = "default_timeout_ms")]
    timeout_ms: u64,
}

fn default_language() -> String {
    "python".to_string()
}

const fn default_timeout_ms() -> u64 {
    60_000
}

/// Runs a snippet of python or shell code and captures its output.
pub struct CodeExecutionTool;

#[async_trait]
impl DatabaseTool for CodeExecutionTool {
    fn name(&self) -> &str {
        "code_execute"
    }

    fn display_name(&self) -> &str {
        "Code Runner"
    }

    fn description(&self) -> &str {
        "Runs a short python or shell script in the workspace directory and returns \
         its stdout, stderr, and exit code. Useful for data munging the SQL tools \
         cannot express."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "code": { "type": "string", "description": "Script source to run" },
                "language": {
                    "type": "string",
                    "enum": ["python", "sh"],
                    "description": "Interpreter to use",
                    "default": "python"
                },
                "timeout_ms": { "type": "integer", "description": "Timeout in milliseconds. Default: 60000" }
            },
            "required": ["code"]
        })
    }

    fn default_timeout(&self) -> Duration {
        Duration::from_millis(default_timeout_ms())
    }

    fn validate(&self, args: &Value) -> Option<String> {
        let code = args.get("code").and_then(Value::as_str).unwrap_or("");
        if code.trim().is_empty() {
            return Some("code must not be empty".to_string());
        }
        if let Some(language) = args.get("language").and_then(Value::as_str) {
            if !matches!(language, "python" | "sh") {
                return Some(format!("unsupported language '{language}'"));
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
        let input: CodeInput = serde_json::from_value(args).context("invalid code_execute input")?;
        let timeout = Duration::from_millis(input.timeout_ms.min(600_000));

        let (program, arg) = match input.language.as_str() {
            "sh" => ("sh", "-s"),
            _ => ("python3", "-"),
        };

        let mut child = tokio::process::Command::new(program)
            .arg(arg)
            .current_dir(&ctx.workspace_root)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn {program}"))?;

        let mut stdin = child.stdin.take().context("missing stdin pipe")?;
        stdin
            .write_all(input.code.as_bytes())
            .await
            .context("failed to write script")?;
        drop(stdin);

        let output = tokio::select! {
            output = child.wait_with_output() => output.context("wait failed")?,
            () = signal.cancelled() => anyhow::bail!("code execution cancelled"),
            () = tokio::time::sleep(timeout) => {
                anyhow::bail!("code execution timed out after {}ms", timeout.as_millis())
            }
        };

        let stdout = bounded(String::from_utf8_lossy(&output.stdout).into_owned());
        let stderr = bounded(String::from_utf8_lossy(&output.stderr).into_owned());
        let exit_code = output.status.code().unwrap_or(-1);

        Ok(ToolResult::new(
            format!("{program} exit {exit_code}"),
            json!({
                "exit_code": exit_code,
                "stdout": stdout,
                "stderr": stderr,
            }),
        ))
    }
}

fn bounded(mut text: String) -> String {
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
