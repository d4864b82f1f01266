//! One model round-trip.
//!
//! A turn sends the current history to the LLM service, relays text deltas
//! to the host as events, and collects the function calls the model emitted.
//! Turns never mutate history; the client commits the resulting contents
//! atomically after the turn completes.

use crate::error::Result;
use crate::events::AgentEvent;
use crate::llm::{EventStream, GenerationConfig, LlmRequest, LlmService, StreamEvent};
use crate::registry::ToolDeclaration;
use crate::types::{AbortSignal, Content, FinishReason, FunctionCall, TokenUsage};
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Everything one turn produced.
#[derive(Clone, Debug, Default)]
pub struct TurnResult {
    /// Text segments in arrival order (one per contiguous run of deltas)
    pub text_segments: Vec<String>,
    /// Function calls in the order the model emitted them
    pub function_calls: Vec<FunctionCall>,
    pub usage: Option<TokenUsage>,
    pub finish_reason: FinishReason,
}

/// One invocation of the model over the current history.
pub struct Turn {
    service: Arc<dyn LlmService>,
    system_instruction: String,
    tools: Vec<ToolDeclaration>,
    generation: GenerationConfig,
}

impl Turn {
    #[must_use]
    pub fn new(
        service: Arc<dyn LlmService>,
        system_instruction: String,
        tools: Vec<ToolDeclaration>,
        generation: GenerationConfig,
    ) -> Self {
        Self {
            service,
            system_instruction,
            tools,
            generation,
        }
    }

    /// Run the turn: stream deltas out as events, collect calls, return the
    /// aggregate. On abort mid-stream the turn ends with
    /// [`FinishReason::Cancelled`] and whatever was collected so far.
    pub async fn run(
        &self,
        history: &[Content],
        signal: &AbortSignal,
        events: &mpsc::Sender<AgentEvent>,
    ) -> Result<TurnResult> {
        let request = LlmRequest {
            history: history.to_vec(),
            system_instruction: self.system_instruction.clone(),
            tools: self.tools.clone(),
            generation: self.generation.clone(),
        };

        debug!(
            model = self.service.model(),
            contents = history.len(),
            tools = self.tools.len(),
            "turn start"
        );

        let mut stream: EventStream = self.service.stream(request, signal.clone());
        let mut result = TurnResult::default();
        let mut current_text = String::new();

        while let Some(item) = stream.next().await {
            if signal.aborted() {
                if !current_text.is_empty() {
                    result.text_segments.push(std::mem::take(&mut current_text));
                }
                result.finish_reason = FinishReason::Cancelled;
                return Ok(result);
            }
            match item {
                Ok(StreamEvent::TextDelta(delta)) => {
                    current_text.push_str(&delta);
                    let _ = events.send(AgentEvent::text(delta)).await;
                }
                Ok(StreamEvent::FunctionCall(call)) => {
                    if !current_text.is_empty() {
                        result.text_segments.push(std::mem::take(&mut current_text));
                    }
                    result.function_calls.push(call);
                }
                Ok(StreamEvent::UsageUpdate(usage)) => {
                    result.usage = Some(usage);
                    let _ = events.send(AgentEvent::usage(usage)).await;
                }
                Ok(StreamEvent::Finish(reason)) => {
                    result.finish_reason = reason;
                }
                Err(e) if e.is_cancellation() => {
                    result.finish_reason = FinishReason::Cancelled;
                    if !current_text.is_empty() {
                        result.text_segments.push(std::mem::take(&mut current_text));
                    }
                    return Ok(result);
                }
                Err(e) => return Err(e),
            }
        }

        if !current_text.is_empty() {
            result.text_segments.push(current_text);
        }
        debug!(
            segments = result.text_segments.len(),
            calls = result.function_calls.len(),
            finish = ?result.finish_reason,
            "turn complete"
        );
        Ok(result)
    }
}

/// Helper shared with the client: was this turn pure text?
impl TurnResult {
    #[must_use]
    pub fn has_calls(&self) -> bool {
        !self.function_calls.is_empty()
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::ScriptedService;
    use super::*;
    use crate::error::DbError;
    use serde_json::json;

    fn drain(rx: &mut mpsc::Receiver<AgentEvent>) -> Vec<AgentEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn relays_text_and_collects_calls() {
        let service = Arc::new(ScriptedService::new(vec![vec![
            Ok(StreamEvent::TextDelta("Let me ".into())),
            Ok(StreamEvent::TextDelta("check.".into())),
            Ok(StreamEvent::FunctionCall(FunctionCall {
                id: "c1".into(),
                name: "sql_execute".into(),
                args: json!({"sql": "SELECT 1"}),
            })),
            Ok(StreamEvent::UsageUpdate(TokenUsage {
                input_tokens: 12,
                output_tokens: 7,
                cached_tokens: None,
            })),
            Ok(StreamEvent::Finish(FinishReason::Stop)),
        ]]));
        let turn = Turn::new(
            service,
            String::new(),
            Vec::new(),
            GenerationConfig::default(),
        );
        let (tx, mut rx) = mpsc::channel(64);

        let history = vec![Content::user("hi")];
        let result = turn
            .run(&history, &AbortSignal::new(), &tx)
            .await
            .expect("turn");

        assert_eq!(result.text_segments, vec!["Let me check."]);
        assert_eq!(result.function_calls.len(), 1);
        assert_eq!(result.function_calls[0].id, "c1");
        assert_eq!(result.finish_reason, FinishReason::Stop);
        assert_eq!(result.usage.expect("usage").input_tokens, 12);

        let events = drain(&mut rx);
        let text_deltas: Vec<&AgentEvent> = events
            .iter()
            .filter(|e| matches!(e, AgentEvent::Text { .. }))
            .collect();
        assert_eq!(text_deltas.len(), 2);
    }

    #[tokio::test]
    async fn turn_does_not_mutate_history() {
        let service = Arc::new(ScriptedService::new(vec![ScriptedService::text_turn(
            "ok",
        )]));
        let turn = Turn::new(
            service,
            String::new(),
            Vec::new(),
            GenerationConfig::default(),
        );
        let (tx, _rx) = mpsc::channel(64);
        let history = vec![Content::user("hello")];
        let before = history.clone();
        turn.run(&history, &AbortSignal::new(), &tx)
            .await
            .expect("turn");
        assert_eq!(history, before);
    }

    #[tokio::test]
    async fn transport_error_propagates() {
        let service = Arc::new(ScriptedService::new(vec![vec![Err(
            DbError::LlmTransport("boom".into()),
        )]]));
        let turn = Turn::new(
            service,
            String::new(),
            Vec::new(),
            GenerationConfig::default(),
        );
        let (tx, _rx) = mpsc::channel(64);
        let err = turn
            .run(&[Content::user("x")], &AbortSignal::new(), &tx)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "LLMTransportError");
    }
}
