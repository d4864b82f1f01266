//! Agent events for real-time streaming.
//!
//! The [`AgentEvent`] enum represents everything a host (CLI, web bridge)
//! can observe during one `send_message_stream` call. Events are delivered
//! over an async channel and are totally ordered within one call.
//!
//! # Event Flow
//!
//! A typical sequence looks like:
//! 1. `Text` deltas as the model streams
//! 2. `ToolStart` / `ToolAwaitingConfirmation` / `ToolRunning` / `ToolFinished`
//!    as the scheduler drives each call
//! 3. `UsageUpdate` after each model round-trip
//! 4. `Finish` once the loop completes, or `Error` if it could not

use crate::risk::RiskLevel;
use crate::types::{FinishReason, TokenUsage};
use serde::{Deserialize, Serialize};

/// Events emitted during agent execution, streamed to the host UI.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// A text delta from the streaming model
    Text { delta: String },

    /// A tool call entered validation
    ToolStart {
        id: String,
        name: String,
        args: serde_json::Value,
    },

    /// A tool call is gated on user confirmation
    ToolAwaitingConfirmation {
        id: String,
        risk: RiskLevel,
        summary: String,
    },

    /// A tool call began executing
    ToolRunning { id: String },

    /// A tool call reached a terminal state
    ToolFinished {
        id: String,
        ok: bool,
        summary: String,
    },

    /// Token usage for the most recent model round-trip
    UsageUpdate { usage: TokenUsage },

    /// A non-recoverable failure; terminates the current stream
    Error { kind: String, message: String },

    /// History was compressed to fit the context budget
    HistoryCompressed {
        original_contents: usize,
        new_contents: usize,
        original_tokens: usize,
        new_tokens: usize,
    },

    /// A diagnostic the host may surface (e.g. unknown model fallback)
    Warning { message: String },

    /// The message stream completed
    Finish { reason: FinishReason },
}

impl AgentEvent {
    #[must_use]
    pub fn text(delta: impl Into<String>) -> Self {
        Self::Text {
            delta: delta.into(),
        }
    }

    #[must_use]
    pub fn tool_start(
        id: impl Into<String>,
        name: impl Into<String>,
        args: serde_json::Value,
    ) -> Self {
        Self::ToolStart {
            id: id.into(),
            name: name.into(),
            args,
        }
    }

    #[must_use]
    pub fn tool_awaiting(id: impl Into<String>, risk: RiskLevel, summary: impl Into<String>) -> Self {
        Self::ToolAwaitingConfirmation {
            id: id.into(),
            risk,
            summary: summary.into(),
        }
    }

    #[must_use]
    pub fn tool_running(id: impl Into<String>) -> Self {
        Self::ToolRunning { id: id.into() }
    }

    #[must_use]
    pub fn tool_finished(id: impl Into<String>, ok: bool, summary: impl Into<String>) -> Self {
        Self::ToolFinished {
            id: id.into(),
            ok,
            summary: summary.into(),
        }
    }

    #[must_use]
    pub const fn usage(usage: TokenUsage) -> Self {
        Self::UsageUpdate { usage }
    }

    #[must_use]
    pub fn error(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            kind: kind.into(),
            message: message.into(),
        }
    }

    #[must_use]
    pub fn warning(message: impl Into<String>) -> Self {
        Self::Warning {
            message: message.into(),
        }
    }

    #[must_use]
    pub const fn finish(reason: FinishReason) -> Self {
        Self::Finish { reason }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_snake_case_tags() {
        let event = AgentEvent::text("hello");
        let value = serde_json::to_value(&event).expect("encode");
        assert_eq!(value["type"], "text");
        assert_eq!(value["delta"], "hello");

        let event = AgentEvent::tool_awaiting("c1", RiskLevel::High, "DROP TABLE t");
        let value = serde_json::to_value(&event).expect("encode");
        assert_eq!(value["type"], "tool_awaiting_confirmation");
        assert_eq!(value["risk"], "high");
    }

    #[test]
    fn finish_round_trips() {
        let event = AgentEvent::finish(crate::types::FinishReason::Stop);
        let encoded = serde_json::to_string(&event).expect("encode");
        let decoded: AgentEvent = serde_json::from_str(&encoded).expect("decode");
        assert_eq!(decoded, event);
    }
}
