//! History compression.
//!
//! When the estimated token footprint of the history crosses the configured
//! fraction of the context window, the oldest contiguous prefix that contains
//! no unresolved call/response pairing is replaced by a single user-role
//! summary produced by the model. Within one turn the operation is
//! idempotent: a history whose head is already a summary marker and below
//! the threshold is left alone.

use crate::config::AgentSettings;
use crate::error::{DbError, Result};
use crate::llm::{GenerationConfig, LlmRequest, LlmService, StreamEvent};
use crate::types::{AbortSignal, Content, Part, Role};
use futures::StreamExt;
use std::sync::Arc;
use tracing::{debug, info};

const SUMMARY_PREFIX: &str = "[Conversation summary]\n\n";
const SUMMARY_SYSTEM_PROMPT: &str = "You summarize database-agent conversations precisely. \
Keep every table name, connection alias, SQL statement outcome, and pending task; drop \
pleasantries.";
const SUMMARY_USER_PROMPT: &str = "Summarize the conversation below so the work can continue \
seamlessly. Preserve schema facts, executed statements and their results, open questions, \
and the user's goal.\n\nConversation:\n";

/// Character-based token estimator: ~4 chars per token plus small per-part
/// overheads. Good enough to drive the compression trigger.
pub struct TokenEstimator;

impl TokenEstimator {
    const CHARS_PER_TOKEN: usize = 4;
    const CONTENT_OVERHEAD: usize = 4;
    const CALL_OVERHEAD: usize = 20;
    const RESPONSE_OVERHEAD: usize = 10;

    #[must_use]
    pub const fn estimate_text(text: &str) -> usize {
        text.len().div_ceil(Self::CHARS_PER_TOKEN)
    }

    #[must_use]
    pub fn estimate_part(part: &Part) -> usize {
        match part {
            Part::Text { text } => Self::estimate_text(text),
            Part::FunctionCall(call) => {
                Self::estimate_text(&call.name)
                    + Self::estimate_text(&call.args.to_string())
                    + Self::CALL_OVERHEAD
            }
            Part::FunctionResponse(resp) => {
                Self::estimate_text(&resp.response.to_string()) + Self::RESPONSE_OVERHEAD
            }
        }
    }

    #[must_use]
    pub fn estimate_content(content: &Content) -> usize {
        content.parts.iter().map(Self::estimate_part).sum::<usize>() + Self::CONTENT_OVERHEAD
    }

    #[must_use]
    pub fn estimate_history(history: &[Content]) -> usize {
        history.iter().map(Self::estimate_content).sum()
    }
}

/// Result of one compression pass.
#[derive(Clone, Debug)]
pub struct CompressionResult {
    pub history: Vec<Content>,
    pub original_contents: usize,
    pub new_contents: usize,
    pub original_tokens: usize,
    pub new_tokens: usize,
}

/// LLM-backed history compressor.
pub struct HistoryCompressor {
    service: Arc<dyn LlmService>,
    threshold_tokens: usize,
    /// Number of most recent contents kept verbatim
    retain_recent: usize,
}

impl HistoryCompressor {
    #[must_use]
    pub fn new(service: Arc<dyn LlmService>, settings: &AgentSettings) -> Self {
        let threshold_tokens = (settings.compression_threshold()
            * settings.context_window_tokens() as f64) as usize;
        Self {
            service,
            threshold_tokens,
            retain_recent: 6,
        }
    }

    #[must_use]
    pub const fn with_retain_recent(mut self, retain_recent: usize) -> Self {
        self.retain_recent = retain_recent;
        self
    }

    fn is_summary_content(content: &Content) -> bool {
        content.role == Role::User
            && matches!(
                content.parts.first(),
                Some(Part::Text { text }) if text.starts_with(SUMMARY_PREFIX)
            )
    }

    /// Whether this history needs compression.
    #[must_use]
    pub fn needs_compression(&self, history: &[Content]) -> bool {
        TokenEstimator::estimate_history(history) >= self.threshold_tokens
    }

    /// Largest prefix length that splits no call/response pair and leaves
    /// `retain_recent` contents intact.
    fn split_point(&self, history: &[Content]) -> usize {
        let max_prefix = history.len().saturating_sub(self.retain_recent);
        let mut best = 0;
        for candidate in 1..=max_prefix {
            if crate::types::unpaired_call_ids(&history[..candidate]).is_empty() {
                best = candidate;
            }
        }
        best
    }

    fn render_for_summary(prefix: &[Content]) -> String {
        use std::fmt::Write;
        let mut out = String::new();
        for content in prefix {
            let role = match content.role {
                Role::User => "User",
                Role::Model => "Agent",
                Role::Function => "Tool",
            };
            for part in &content.parts {
                match part {
                    Part::Text { text } => {
                        let _ = writeln!(out, "{role}: {text}");
                    }
                    Part::FunctionCall(call) => {
                        let _ = writeln!(out, "{role} called {}({})", call.name, call.args);
                    }
                    Part::FunctionResponse(resp) => {
                        let rendered = resp.response.to_string();
                        let clipped: String = rendered.chars().take(500).collect();
                        let _ = writeln!(out, "{role} result for {}: {clipped}", resp.name);
                    }
                }
            }
        }
        out
    }

    async fn summarize(&self, prefix: &[Content], signal: &AbortSignal) -> Result<String> {
        let rendered = Self::render_for_summary(prefix);
        let request = LlmRequest {
            history: vec![Content::user(format!("{SUMMARY_USER_PROMPT}{rendered}"))],
            system_instruction: SUMMARY_SYSTEM_PROMPT.to_string(),
            tools: Vec::new(),
            generation: GenerationConfig {
                max_output_tokens: 2000,
                temperature: None,
            },
        };

        let mut stream = self.service.stream(request, signal.clone());
        let mut summary = String::new();
        while let Some(item) = stream.next().await {
            match item? {
                StreamEvent::TextDelta(delta) => summary.push_str(&delta),
                StreamEvent::Finish(_) => break,
                _ => {}
            }
        }
        if summary.trim().is_empty() {
            return Err(DbError::Compression("summarizer returned no text".into()));
        }
        Ok(summary)
    }

    /// Compress if needed. Returns `None` when the history is below the
    /// threshold or no pairing-safe prefix exists.
    pub async fn maybe_compress(
        &self,
        history: &[Content],
        signal: &AbortSignal,
    ) -> Result<Option<CompressionResult>> {
        if !self.needs_compression(history) {
            return Ok(None);
        }

        // Idempotence: skip the summary content a previous pass inserted.
        let start = usize::from(history.first().map_or(false, Self::is_summary_content));
        let split = self.split_point(&history[start..]) + start;
        if split <= start {
            debug!("no pairing-safe prefix to compress");
            return Ok(None);
        }

        let original_tokens = TokenEstimator::estimate_history(history);
        let summary = self.summarize(&history[..split], signal).await?;

        let mut compressed = Vec::with_capacity(history.len() - split + 1);
        compressed.push(Content::user(format!("{SUMMARY_PREFIX}{summary}")));
        compressed.extend_from_slice(&history[split..]);

        let result = CompressionResult {
            original_contents: history.len(),
            new_contents: compressed.len(),
            original_tokens,
            new_tokens: TokenEstimator::estimate_history(&compressed),
            history: compressed,
        };
        info!(
            original_contents = result.original_contents,
            new_contents = result.new_contents,
            original_tokens = result.original_tokens,
            new_tokens = result.new_tokens,
            "history compressed"
        );
        Ok(Some(result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::turn::test_support::ScriptedService;
    use crate::types::{FunctionCall, FunctionResponse};
    use serde_json::json;

    fn service_with_summary(summary: &str) -> Arc<ScriptedService> {
        Arc::new(ScriptedService::new(vec![ScriptedService::text_turn(
            summary,
        )]))
    }

    fn compressor(service: Arc<ScriptedService>, threshold_tokens: usize) -> HistoryCompressor {
        // Threshold is threshold_fraction * window; pick fraction 1.0 and a
        // window equal to the wanted token count for direct control.
        let settings = AgentSettings::from_overrides(json!({
            "compression": {
                "threshold": 1.0,
                "context_window_tokens": threshold_tokens,
            },
        }));
        HistoryCompressor::new(service, &settings).with_retain_recent(2)
    }

    fn chatty_history(contents: usize) -> Vec<Content> {
        let mut history = Vec::new();
        for i in 0..contents {
            history.push(Content::user(format!("question {i}: {}", "x".repeat(200))));
            history.push(Content::model(vec![Part::text(format!(
                "answer {i}: {}",
                "y".repeat(200)
            ))]));
        }
        history
    }

    #[test]
    fn estimator_counts_parts_and_overheads() {
        assert_eq!(TokenEstimator::estimate_text(""), 0);
        assert_eq!(TokenEstimator::estimate_text("test"), 1);
        assert_eq!(TokenEstimator::estimate_text("hello"), 2);

        let content = Content::user("Hello, how are you?"); // 19 chars -> 5 tokens
        assert_eq!(TokenEstimator::estimate_content(&content), 9);
    }

    #[tokio::test]
    async fn below_threshold_is_a_no_op() {
        let service = service_with_summary("unused");
        let compressor = compressor(service, 1_000_000);
        let history = chatty_history(3);
        let result = compressor
            .maybe_compress(&history, &AbortSignal::new())
            .await
            .expect("compress");
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn at_threshold_compresses_exactly_once() {
        let history = chatty_history(10);
        let exact = TokenEstimator::estimate_history(&history);
        let service = service_with_summary("the gist");
        let first_compressor = compressor(service, exact);

        // Exactly at the threshold triggers.
        let result = first_compressor
            .maybe_compress(&history, &AbortSignal::new())
            .await
            .expect("compress")
            .expect("triggered");
        assert!(result.new_contents < result.original_contents);
        assert!(matches!(
            &result.history[0].parts[0],
            Part::Text { text } if text.starts_with(SUMMARY_PREFIX)
        ));

        // The compressed history is now far below the threshold; a second
        // pass must be a no-op.
        let again_service = service_with_summary("unused");
        let again = compressor(again_service, exact);
        let second = again
            .maybe_compress(&result.history, &AbortSignal::new())
            .await
            .expect("second pass");
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn call_response_pairs_are_never_split() {
        let mut history = vec![Content::user("start")];
        // A call whose response lands two contents later.
        history.push(Content::model(vec![
            Part::text("running"),
            Part::FunctionCall(FunctionCall {
                id: "c1".into(),
                name: "sql_execute".into(),
                args: json!({"sql": "SELECT 1"}),
            }),
        ]));
        history.push(Content::function_responses(vec![FunctionResponse::ok(
            "c1",
            "sql_execute",
            json!({"rows": [[1]]}),
        )]));
        for filler in chatty_history(6) {
            history.push(filler);
        }

        let service = service_with_summary("sum");
        let compressor = compressor(service, 1);
        let result = compressor
            .maybe_compress(&history, &AbortSignal::new())
            .await
            .expect("compress")
            .expect("triggered");
        assert!(crate::types::unpaired_call_ids(&result.history).is_empty());
    }

    #[tokio::test]
    async fn prefix_with_open_call_is_not_compressible() {
        // The only possible split points all cross the open call.
        let history = vec![
            Content::model(vec![Part::FunctionCall(FunctionCall {
                id: "open".into(),
                name: "sql_execute".into(),
                args: json!({}),
            })]),
            Content::user("a"),
            Content::user("b"),
            Content::user("c"),
        ];
        let service = service_with_summary("unused");
        let compressor = compressor(service, 1).with_retain_recent(3);
        let result = compressor
            .maybe_compress(&history, &AbortSignal::new())
            .await
            .expect("compress");
        assert!(result.is_none());
    }
}
