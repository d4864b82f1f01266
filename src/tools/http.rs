//! Web fetch tool for retrieving remote content.

use super::{DatabaseTool, ToolContext, ToolResult};
use crate::types::AbortSignal;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

/// Maximum content size to fetch (1MB).
const MAX_CONTENT_SIZE: usize = 1024 * 1024;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct FetchInput {
    url: String,
    /// Maximum bytes to return (capped at 1MB)
    #[serde(default)]
    max_bytes: Option<usize>,
}

/// Fetches a URL and returns its body as text.
pub struct WebFetchTool {
    client: reqwest::Client,
}

impl Default for WebFetchTool {
    fn default() -> Self {
        Self::new()
    }
}

impl WebFetchTool {
    /// # Panics
    /// Panics if the HTTP client cannot be built, which does not happen with
    /// default settings.
    #[must_use]
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .user_agent("dbrheo/0.1")
            .build()
            .expect("default reqwest client");
        Self { client }
    }
}

#[async_trait]
impl DatabaseTool for WebFetchTool {
    fn name(&self) -> &str {
        "web_fetch"
    }

    fn display_name(&self) -> &str {
        "Web Fetch"
    }

    fn description(&self) -> &str {
        "Fetches a URL over HTTP(S) and returns the response body as text, with \
         the final URL, status, and content type."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "url": { "type": "string", "description": "The http(s) URL to fetch" },
                "max_bytes": { "type": "integer", "description": "Maximum bytes to return (up to 1MB)" }
            },
            "required": ["url"]
        })
    }

    fn default_timeout(&self) -> Duration {
        DEFAULT_TIMEOUT
    }

    fn validate(&self, args: &Value) -> Option<String> {
        let raw = args.get("url").and_then(Value::as_str).unwrap_or("");
        match url::Url::parse(raw) {
            Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => None,
            Ok(parsed) => Some(format!("unsupported URL scheme '{}'", parsed.scheme())),
            Err(e) => Some(format!("invalid URL: {e}")),
        }
    }

    async fn execute(
        &self,
        args: Value,
        _ctx: &ToolContext,
        signal: &AbortSignal,
    ) -> Result<ToolResult> {
        let input: FetchInput = serde_json::from_value(args).context("invalid web_fetch input")?;
        let cap = input.max_bytes.unwrap_or(MAX_CONTENT_SIZE).min(MAX_CONTENT_SIZE);

        let request = self.client.get(&input.url).send();
        let response = tokio::select! {
            response = request => response.context("request failed")?,
            () = signal.cancelled() => anyhow::bail!("fetch cancelled"),
        };

        let status = response.status().as_u16();
        let final_url = response.url().to_string();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        let bytes = tokio::select! {
            bytes = response.bytes() => bytes.context("failed to read body")?,
            () = signal.cancelled() => anyhow::bail!("fetch cancelled"),
        };
        let truncated = bytes.len() > cap;
        let body = String::from_utf8_lossy(&bytes[..bytes.len().min(cap)]).into_owned();

        Ok(ToolResult::new(
            format!("{status} {} ({} bytes)", input.url, bytes.len()),
            json!({
                "url": final_url,
                "status": status,
                "content_type": content_type,
                "body": body,
                "truncated": truncated,
            }),
        ))
    }
}
