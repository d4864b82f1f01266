//! Top-level orchestration.
//!
//! The client owns the conversation history, the tool registry, the
//! scheduler, and the LLM service. One `send_message_stream` call runs the
//! recursive turn loop: model streams, tools execute behind the risk gate,
//! paired contents are committed atomically, history is compressed when it
//! grows, and the next-speaker heuristic decides whether the model keeps
//! going, all bounded by `max_turns`.

use crate::adapters::AdapterFactory;
use crate::compressor::HistoryCompressor;
use crate::config::AgentSettings;
use crate::connection::ConnectionManager;
use crate::error::Result;
use crate::events::AgentEvent;
use crate::llm::{create_service, GenerationConfig, LlmService};
use crate::next_speaker::{self, NextSpeaker};
use crate::registry::{Capability, ToolRegistry};
use crate::scheduler::{ConfirmationHandler, ToolScheduler};
use crate::tools::{self, ToolContext};
use crate::types::{AbortSignal, Content, FinishReason, Part};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

const DEFAULT_SYSTEM_PROMPT: &str = "You are a database agent. You plan, run SQL and \
ancillary tools on the user's behalf, and explain results concisely. Prefer exploring \
schema before mutating anything.";

/// The conversational database agent.
pub struct AgentClient {
    settings: Arc<AgentSettings>,
    registry: Arc<ToolRegistry>,
    scheduler: Arc<ToolScheduler>,
    connections: Arc<ConnectionManager>,
    service: Arc<dyn LlmService>,
    history: Arc<Mutex<Vec<Content>>>,
    system_instruction: String,
    current_signal: Mutex<AbortSignal>,
    startup_warning: Mutex<Option<String>>,
}

impl AgentClient {
    /// Build a client with the default tool set and the service selected by
    /// the configured model name.
    pub fn new(settings: AgentSettings) -> Result<Self> {
        let settings = Arc::new(settings);
        let selection = create_service(&settings);
        Self::with_service(settings, selection.service, selection.warning)
    }

    /// Build a client around an explicit service (tests, embedders).
    pub fn with_service(
        settings: Arc<AgentSettings>,
        service: Arc<dyn LlmService>,
        startup_warning: Option<String>,
    ) -> Result<Self> {
        let registry = Arc::new(ToolRegistry::new());
        register_default_tools(&registry)?;
        let connections = Arc::new(ConnectionManager::new(Arc::new(AdapterFactory::new())));
        let scheduler = Arc::new(ToolScheduler::new(
            Arc::clone(&registry),
            Arc::clone(&settings),
        ));
        let system_instruction = settings.get_str("system_prompt", DEFAULT_SYSTEM_PROMPT);

        Ok(Self {
            settings,
            registry,
            scheduler,
            connections,
            service,
            history: Arc::new(Mutex::new(Vec::new())),
            system_instruction,
            current_signal: Mutex::new(AbortSignal::new()),
            startup_warning: Mutex::new(startup_warning),
        })
    }

    /// The tool registry (read access for hosts).
    #[must_use]
    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// The connection manager (host commands: open/use/close).
    #[must_use]
    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    /// Register the user-facing confirmation gate.
    pub async fn on_confirmation_required(&self, handler: Arc<dyn ConfirmationHandler>) {
        self.scheduler.on_confirmation_required(handler).await;
    }

    /// Trip the abort signal of the in-flight `send_message_stream`.
    pub async fn interrupt(&self) {
        self.current_signal.lock().await.abort();
    }

    /// Snapshot of the conversation history.
    pub async fn history(&self) -> Vec<Content> {
        self.history.lock().await.clone()
    }

    /// Send one user message; events stream back on the returned channel.
    pub async fn send_message_stream(
        self: Arc<Self>,
        user_text: impl Into<String>,
        signal: AbortSignal,
    ) -> mpsc::Receiver<AgentEvent> {
        let text = user_text.into();
        self.send_parts_stream(vec![Part::text(text)], signal).await
    }

    /// Send one user message given as explicit parts.
    pub async fn send_parts_stream(
        self: Arc<Self>,
        parts: Vec<Part>,
        signal: AbortSignal,
    ) -> mpsc::Receiver<AgentEvent> {
        let (tx, rx) = mpsc::channel(128);
        *self.current_signal.lock().await = signal.clone();

        let client = Arc::clone(&self);
        tokio::spawn(async move {
            if let Err(e) = client.run_loop(parts, signal, &tx).await {
                if e.is_cancellation() {
                    let _ = tx.send(AgentEvent::finish(FinishReason::Cancelled)).await;
                } else {
                    let _ = tx.send(AgentEvent::error(e.kind(), e.to_string())).await;
                }
            }
        });

        rx
    }

    async fn run_loop(
        &self,
        user_parts: Vec<Part>,
        signal: AbortSignal,
        events: &mpsc::Sender<AgentEvent>,
    ) -> Result<()> {
        if let Some(warning) = self.startup_warning.lock().await.take() {
            let _ = events.send(AgentEvent::warning(warning)).await;
        }

        self.history.lock().await.push(Content {
            role: crate::types::Role::User,
            parts: user_parts,
        });

        let tool_ctx = ToolContext::new(Arc::clone(&self.settings), Arc::clone(&self.connections));
        let compressor = HistoryCompressor::new(Arc::clone(&self.service), &self.settings);
        let max_turns = self.settings.max_turns();
        let mut finish = FinishReason::Stop;

        for turn_index in 0..max_turns {
            if signal.aborted() {
                finish = FinishReason::Cancelled;
                break;
            }

            let turn = crate::turn::Turn::new(
                Arc::clone(&self.service),
                self.system_instruction.clone(),
                self.registry.snapshot_for_llm(),
                GenerationConfig::default(),
            );
            let history_snapshot = self.history.lock().await.clone();
            let result = turn.run(&history_snapshot, &signal, events).await?;
            debug!(
                turn = turn_index,
                calls = result.function_calls.len(),
                finish = ?result.finish_reason,
                "turn finished"
            );

            if result.finish_reason == FinishReason::Cancelled {
                // No partial model content is committed on cancellation.
                finish = FinishReason::Cancelled;
                break;
            }

            let mut model_parts: Vec<Part> = Vec::new();
            for segment in &result.text_segments {
                model_parts.push(Part::text(segment.clone()));
            }
            for call in &result.function_calls {
                model_parts.push(Part::FunctionCall(call.clone()));
            }

            if !result.has_calls() {
                if !model_parts.is_empty() {
                    self.history.lock().await.push(Content::model(model_parts));
                }
                finish = result.finish_reason;
                break;
            }

            let responses = self
                .scheduler
                .dispatch(result.function_calls.clone(), &tool_ctx, &signal, events)
                .await;

            // One model content with all calls plus one function content
            // with all responses, committed together so no observer ever
            // sees an unpaired call.
            {
                let mut history = self.history.lock().await;
                history.push(Content::model(model_parts));
                history.push(Content::function_responses(responses));
            }

            if signal.aborted() {
                finish = FinishReason::Cancelled;
                break;
            }

            self.compress_if_needed(&compressor, &signal, events).await;

            let history_snapshot = self.history.lock().await.clone();
            match next_speaker::decide(&history_snapshot, result.finish_reason, true) {
                NextSpeaker::Model => continue,
                NextSpeaker::User => {
                    finish = result.finish_reason;
                    break;
                }
            }
        }

        let _ = events.send(AgentEvent::finish(finish)).await;
        Ok(())
    }

    async fn compress_if_needed(
        &self,
        compressor: &HistoryCompressor,
        signal: &AbortSignal,
        events: &mpsc::Sender<AgentEvent>,
    ) {
        let snapshot = self.history.lock().await.clone();
        match compressor.maybe_compress(&snapshot, signal).await {
            Ok(Some(result)) => {
                *self.history.lock().await = result.history.clone();
                let _ = events
                    .send(AgentEvent::HistoryCompressed {
                        original_contents: result.original_contents,
                        new_contents: result.new_contents,
                        original_tokens: result.original_tokens,
                        new_tokens: result.new_tokens,
                    })
                    .await;
            }
            Ok(None) => {}
            Err(e) => {
                // A failed summary never loses history.
                warn!(error = %e, "history compression failed, continuing uncompressed");
            }
        }
    }
}

fn register_default_tools(registry: &Arc<ToolRegistry>) -> Result<()> {
    registry.register(
        Arc::new(tools::SqlTool),
        [
            Capability::Query,
            Capability::Modify,
            Capability::SchemaChange,
            Capability::Analyze,
        ],
        ["sql".to_string(), "execute".to_string(), "core".to_string()],
        90,
        json!({}),
    )?;
    registry.register(
        Arc::new(tools::SchemaDiscoveryTool),
        [Capability::Explore, Capability::Analyze],
        ["schema".to_string(), "discovery".to_string(), "core".to_string()],
        85,
        json!({}),
    )?;
    registry.register(
        Arc::new(tools::TableDetailsTool),
        [Capability::Explore, Capability::Analyze],
        ["schema".to_string(), "metadata".to_string()],
        80,
        json!({}),
    )?;
    registry.register(
        Arc::new(tools::DatabaseConnectTool),
        [Capability::Explore],
        ["connection".to_string(), "core".to_string()],
        75,
        json!({}),
    )?;
    registry.register(
        Arc::new(tools::DatabaseExportTool),
        [Capability::Export, Capability::Query],
        ["export".to_string(), "csv".to_string(), "json".to_string()],
        70,
        json!({}),
    )?;
    registry.register(
        Arc::new(tools::FileReadTool),
        [Capability::Read],
        ["file".to_string(), "filesystem".to_string()],
        60,
        json!({}),
    )?;
    registry.register(
        Arc::new(tools::FileWriteTool),
        [Capability::Write],
        ["file".to_string(), "filesystem".to_string()],
        60,
        json!({}),
    )?;
    registry.register(
        Arc::new(tools::WebFetchTool::new()),
        [Capability::Read],
        ["web".to_string(), "http".to_string()],
        50,
        json!({}),
    )?;
    registry.register(
        Arc::new(tools::ShellTool),
        [Capability::Transform],
        ["shell".to_string(), "command".to_string()],
        40,
        json!({}),
    )?;
    registry.register(
        Arc::new(tools::CodeExecutionTool),
        [Capability::Transform, Capability::Analyze],
        ["code".to_string(), "python".to_string()],
        40,
        json!({}),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::turn::test_support::ScriptedService;
    use crate::types::{unpaired_call_ids, FunctionCall, Role};

    async fn collect(mut rx: mpsc::Receiver<AgentEvent>) -> Vec<AgentEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    fn client_with(scripts: Vec<Vec<Result<crate::llm::StreamEvent>>>) -> Arc<AgentClient> {
        let settings = Arc::new(AgentSettings::from_overrides(json!({"max_turns": 4})));
        let service = Arc::new(ScriptedService::new(scripts));
        Arc::new(
            AgentClient::with_service(settings, service, None).expect("client"),
        )
    }

    #[tokio::test]
    async fn plain_text_round_trip() {
        let client = client_with(vec![ScriptedService::text_turn("Hello there")]);
        let rx = Arc::clone(&client)
            .send_message_stream("hi", AbortSignal::new())
            .await;
        let events = collect(rx).await;

        assert!(events
            .iter()
            .any(|e| matches!(e, AgentEvent::Text { delta } if delta == "Hello there")));
        assert!(matches!(
            events.last(),
            Some(AgentEvent::Finish {
                reason: FinishReason::Stop
            })
        ));

        let history = client.history().await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, Role::User);
        assert_eq!(history[1].role, Role::Model);
    }

    #[tokio::test]
    async fn unknown_tool_call_still_pairs_history() {
        let client = client_with(vec![
            ScriptedService::call_turn(vec![FunctionCall {
                id: "c1".into(),
                name: "ghost_tool".into(),
                args: json!({}),
            }]),
            ScriptedService::text_turn("that tool does not exist"),
        ]);
        let rx = Arc::clone(&client).send_message_stream("go", AbortSignal::new()).await;
        let events = collect(rx).await;

        assert!(events
            .iter()
            .any(|e| matches!(e, AgentEvent::ToolFinished { ok: false, .. })));

        let history = client.history().await;
        assert!(unpaired_call_ids(&history).is_empty());
        // user, model(call), function(response), model(text)
        assert_eq!(history.len(), 4);
        assert_eq!(history[2].role, Role::Function);
    }

    #[tokio::test]
    async fn startup_warning_is_emitted_once() {
        let settings = Arc::new(AgentSettings::from_overrides(json!({"max_turns": 2})));
        let service = Arc::new(ScriptedService::new(vec![
            ScriptedService::text_turn("one"),
            ScriptedService::text_turn("two"),
        ]));
        let client = Arc::new(
            AgentClient::with_service(settings, service, Some("fallback model".into()))
                .expect("client"),
        );

        let events = collect(Arc::clone(&client).send_message_stream("a", AbortSignal::new()).await).await;
        assert!(events
            .iter()
            .any(|e| matches!(e, AgentEvent::Warning { message } if message.contains("fallback"))));

        let events = collect(Arc::clone(&client).send_message_stream("b", AbortSignal::new()).await).await;
        assert!(!events
            .iter()
            .any(|e| matches!(e, AgentEvent::Warning { .. })));
    }

    #[tokio::test]
    async fn pre_aborted_signal_leaves_only_user_content() {
        let client = client_with(vec![ScriptedService::text_turn("never seen")]);
        let signal = AbortSignal::new();
        signal.abort();
        let events = collect(Arc::clone(&client).send_message_stream("hi", signal).await).await;

        assert!(matches!(
            events.last(),
            Some(AgentEvent::Finish {
                reason: FinishReason::Cancelled
            })
        ));
        let history = client.history().await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].role, Role::User);
    }

    #[tokio::test]
    async fn max_turns_caps_auto_continuation() {
        // Every turn requests an unknown tool, which would loop forever
        // without the cap.
        let loop_turn = || {
            ScriptedService::call_turn(vec![FunctionCall {
                id: format!("c{}", uuid::Uuid::new_v4().simple()),
                name: "ghost_tool".into(),
                args: json!({}),
            }])
        };
        let client = client_with(vec![loop_turn(), loop_turn(), loop_turn(), loop_turn(), loop_turn()]);
        let events = collect(Arc::clone(&client).send_message_stream("go", AbortSignal::new()).await).await;

        assert!(matches!(events.last(), Some(AgentEvent::Finish { .. })));
        let history = client.history().await;
        // 1 user + 4 turns * (model + function) = 9; the 5th script is never used.
        assert_eq!(history.len(), 9);
        assert!(unpaired_call_ids(&history).is_empty());
    }
}
