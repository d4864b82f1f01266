//! Core value types for the agent loop.
//!
//! This module contains the fundamental types shared across the core:
//!
//! - [`Content`] / [`Part`]: the conversation data model
//! - [`Role`]: who produced a piece of content
//! - [`AbortSignal`]: one-shot cancellation flag threaded through every
//!   suspending operation
//! - [`TokenUsage`]: token consumption statistics
//! - [`FinishReason`]: why a model turn ended

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Who produced a piece of conversation content.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
    Function,
}

/// A single element inside a [`Content`].
///
/// Parts of different kinds may interleave within one model content; the
/// order is preserved everywhere.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Part {
    Text { text: String },
    FunctionCall(FunctionCall),
    FunctionResponse(FunctionResponse),
}

impl Part {
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    #[must_use]
    pub const fn as_call(&self) -> Option<&FunctionCall> {
        match self {
            Self::FunctionCall(call) => Some(call),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_response(&self) -> Option<&FunctionResponse> {
        match self {
            Self::FunctionResponse(resp) => Some(resp),
            _ => None,
        }
    }
}

/// A structured request by the model to invoke a named tool.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    /// Unique id for this call, provider-assigned or synthesized
    pub id: String,
    /// Registered tool name
    pub name: String,
    /// JSON-shaped arguments
    pub args: serde_json::Value,
}

/// The paired result of a [`FunctionCall`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FunctionResponse {
    /// Id of the call this responds to
    pub id: String,
    /// Tool name, repeated for the model's benefit
    pub name: String,
    /// Result payload; on failure this is `{error: {kind, message, detail?}}`
    pub response: serde_json::Value,
    /// Set when the payload is an error object
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,
}

impl FunctionResponse {
    #[must_use]
    pub fn ok(id: impl Into<String>, name: impl Into<String>, response: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            response,
            is_error: false,
        }
    }

    #[must_use]
    pub fn error(
        id: impl Into<String>,
        name: impl Into<String>,
        response: serde_json::Value,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            response,
            is_error: true,
        }
    }
}

/// One entry in the conversation history: a role plus an ordered list of
/// parts. Contents are append-only; nothing in the core mutates one after
/// it has been committed to history.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Content {
    pub role: Role,
    pub parts: Vec<Part>,
}

impl Content {
    #[must_use]
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            parts: vec![Part::text(text)],
        }
    }

    #[must_use]
    pub fn model(parts: Vec<Part>) -> Self {
        Self {
            role: Role::Model,
            parts,
        }
    }

    #[must_use]
    pub fn function_responses(responses: Vec<FunctionResponse>) -> Self {
        Self {
            role: Role::Function,
            parts: responses.into_iter().map(Part::FunctionResponse).collect(),
        }
    }

    /// Concatenated text of all text parts.
    #[must_use]
    pub fn joined_text(&self) -> String {
        let mut out = String::new();
        for part in &self.parts {
            if let Part::Text { text } = part {
                out.push_str(text);
            }
        }
        out
    }

    pub fn function_calls(&self) -> impl Iterator<Item = &FunctionCall> {
        self.parts.iter().filter_map(Part::as_call)
    }

    #[must_use]
    pub fn has_function_calls(&self) -> bool {
        self.parts.iter().any(|p| p.as_call().is_some())
    }
}

/// Ids of function calls in `history` that have no matching response at or
/// after the call. Used by the compressor to find pairing-safe split points
/// and by tests to assert the pairing invariant.
#[must_use]
pub fn unpaired_call_ids(history: &[Content]) -> Vec<String> {
    let mut pending: Vec<String> = Vec::new();
    for content in history {
        for part in &content.parts {
            match part {
                Part::FunctionCall(call) => pending.push(call.id.clone()),
                Part::FunctionResponse(resp) => pending.retain(|id| *id != resp.id),
                Part::Text { .. } => {}
            }
        }
    }
    pending
}

/// Why a model turn ended.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// Natural end of the model's output
    #[default]
    Stop,
    /// Output hit the max-token limit
    MaxTokens,
    /// Aborted via the abort signal
    Cancelled,
    /// Provider-side refusal or filter
    Refusal,
}

/// Token usage statistics, accumulated across turns.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached_tokens: Option<u32>,
}

impl TokenUsage {
    pub fn add(&mut self, other: &Self) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        if let Some(cached) = other.cached_tokens {
            *self.cached_tokens.get_or_insert(0) += cached;
        }
    }
}

/// One-shot cancellation flag.
///
/// Once tripped the signal stays tripped. Every suspending operation in the
/// core takes a clone; tripping it is idempotent and safe from any task.
#[derive(Clone, Debug, Default)]
pub struct AbortSignal {
    inner: Arc<AbortInner>,
}

#[derive(Debug, Default)]
struct AbortInner {
    tripped: AtomicBool,
    notify: Notify,
}

impl AbortSignal {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Trip the signal. Idempotent.
    pub fn abort(&self) {
        self.inner.tripped.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Whether the signal has been tripped.
    #[must_use]
    pub fn aborted(&self) -> bool {
        self.inner.tripped.load(Ordering::SeqCst)
    }

    /// Resolve once the signal trips. Resolves immediately if already tripped.
    pub async fn cancelled(&self) {
        // Register interest before re-checking so a concurrent abort is not missed.
        loop {
            if self.aborted() {
                return;
            }
            let notified = self.inner.notify.notified();
            if self.aborted() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn content_text_joins_parts_in_order() {
        let content = Content {
            role: Role::Model,
            parts: vec![
                Part::text("Hello, "),
                Part::FunctionCall(FunctionCall {
                    id: "c1".into(),
                    name: "sql_execute".into(),
                    args: json!({"sql": "SELECT 1"}),
                }),
                Part::text("world"),
            ],
        };
        assert_eq!(content.joined_text(), "Hello, world");
        assert!(content.has_function_calls());
    }

    #[test]
    fn unpaired_ids_detects_orphan_calls() {
        let history = vec![
            Content::user("hi"),
            Content::model(vec![Part::FunctionCall(FunctionCall {
                id: "c1".into(),
                name: "sql_execute".into(),
                args: json!({}),
            })]),
        ];
        assert_eq!(unpaired_call_ids(&history), vec!["c1".to_string()]);

        let mut paired = history;
        paired.push(Content::function_responses(vec![FunctionResponse::ok(
            "c1",
            "sql_execute",
            json!({"rows": []}),
        )]));
        assert!(unpaired_call_ids(&paired).is_empty());
    }

    #[test]
    fn usage_accumulates() {
        let mut total = TokenUsage::default();
        total.add(&TokenUsage {
            input_tokens: 10,
            output_tokens: 20,
            cached_tokens: Some(5),
        });
        total.add(&TokenUsage {
            input_tokens: 1,
            output_tokens: 2,
            cached_tokens: None,
        });
        assert_eq!(total.input_tokens, 11);
        assert_eq!(total.output_tokens, 22);
        assert_eq!(total.cached_tokens, Some(5));
    }

    #[tokio::test]
    async fn abort_signal_is_one_shot_and_observable() {
        let signal = AbortSignal::new();
        assert!(!signal.aborted());

        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move {
                signal.cancelled().await;
            })
        };

        signal.abort();
        signal.abort(); // idempotent
        assert!(signal.aborted());
        waiter.await.expect("waiter completes");

        // Already-tripped signals resolve immediately.
        signal.cancelled().await;
    }

    #[test]
    fn serde_round_trip_preserves_structure() {
        let content = Content {
            role: Role::Model,
            parts: vec![
                Part::text("checking"),
                Part::FunctionCall(FunctionCall {
                    id: "c9".into(),
                    name: "schema_discovery".into(),
                    args: json!({"pattern": "%"}),
                }),
            ],
        };
        let encoded = serde_json::to_string(&content).expect("encode");
        let decoded: Content = serde_json::from_str(&encoded).expect("decode");
        assert_eq!(decoded, content);
    }
}
