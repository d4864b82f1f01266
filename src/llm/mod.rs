//! Streaming LLM service abstraction.
//!
//! One trait, three providers. Each service normalizes its provider's wire
//! protocol into the same [`StreamEvent`] sequence so the turn loop never
//! sees provider differences. The factory dispatches on model-name prefix.

mod anthropic;
mod gemini;
mod openai;
mod retry;
mod sse;

pub use anthropic::AnthropicService;
pub use gemini::GeminiService;
pub use openai::OpenAiService;
pub use retry::send_with_retry;

use crate::config::AgentSettings;
use crate::error::Result;
use crate::registry::ToolDeclaration;
use crate::types::{AbortSignal, Content, FinishReason, FunctionCall, TokenUsage};
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;
use tracing::warn;

/// Generation parameters forwarded to the provider.
#[derive(Clone, Debug)]
pub struct GenerationConfig {
    pub max_output_tokens: u32,
    pub temperature: Option<f64>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_output_tokens: 4096,
            temperature: None,
        }
    }
}

/// One model invocation.
#[derive(Clone, Debug)]
pub struct LlmRequest {
    pub history: Vec<Content>,
    pub system_instruction: String,
    pub tools: Vec<ToolDeclaration>,
    pub generation: GenerationConfig,
}

/// Normalized streaming events from any provider.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamEvent {
    TextDelta(String),
    FunctionCall(FunctionCall),
    UsageUpdate(TokenUsage),
    Finish(FinishReason),
}

/// A lazy, finite, non-restartable event sequence.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent>> + Send>>;

/// Provider-agnostic streaming LLM service.
#[async_trait]
pub trait LlmService: Send + Sync {
    /// Stream one model invocation. Events arrive in provider order; the
    /// stream ends after a `Finish` event or an error.
    fn stream(&self, request: LlmRequest, signal: AbortSignal) -> EventStream;

    /// Count tokens for the given contents, or `None` when the provider has
    /// no counting API.
    async fn count_tokens(&self, contents: &[Content]) -> Result<Option<u64>>;

    /// Whether the provider supports function calling.
    fn supports_function_calling(&self) -> bool {
        true
    }

    /// Model identifier this service was built for.
    fn model(&self) -> &str;

    /// Short provider name for logs and events.
    fn provider(&self) -> &'static str;
}

/// Outcome of service construction: the service plus an optional warning
/// (set when an unknown model prefix fell back to the default provider).
pub struct ServiceSelection {
    pub service: Arc<dyn LlmService>,
    pub warning: Option<String>,
}

/// Build the service for the configured model, dispatching on name prefix:
/// `gemini-*`, `claude-*`/`sonnet*`/`opus*`, `gpt-*`/`o3*`/`o4*`. Unknown
/// prefixes fall back to the Gemini service with a warning.
#[must_use]
pub fn create_service(settings: &AgentSettings) -> ServiceSelection {
    let model = settings.model();
    let retry = settings.retry();

    if model.starts_with("gemini-") {
        let api_key = settings.credential("google_api_key").unwrap_or_default();
        return ServiceSelection {
            service: Arc::new(GeminiService::new(api_key, model, retry)),
            warning: None,
        };
    }
    if model.starts_with("claude-") || model.starts_with("sonnet") || model.starts_with("opus") {
        let api_key = settings.credential("anthropic_api_key").unwrap_or_default();
        return ServiceSelection {
            service: Arc::new(AnthropicService::new(api_key, model, retry)),
            warning: None,
        };
    }
    if model.starts_with("gpt-") || model.starts_with("o3") || model.starts_with("o4") {
        let api_key = settings.credential("openai_api_key").unwrap_or_default();
        let base_url = settings.credential("openai_api_base");
        return ServiceSelection {
            service: Arc::new(OpenAiService::new(api_key, model, base_url, retry)),
            warning: None,
        };
    }

    warn!(model, "unknown model prefix, falling back to the Gemini service");
    let api_key = settings.credential("google_api_key").unwrap_or_default();
    let warning = format!("unknown model '{model}': falling back to the Gemini service");
    ServiceSelection {
        service: Arc::new(GeminiService::new(api_key, model, retry)),
        warning: Some(warning),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn factory_dispatches_on_model_prefix() {
        let gemini = create_service(&AgentSettings::from_overrides(
            json!({"model": "gemini-2.5-flash"}),
        ));
        assert_eq!(gemini.service.provider(), "gemini");
        assert!(gemini.warning.is_none());

        let claude = create_service(&AgentSettings::from_overrides(
            json!({"model": "claude-sonnet-4-20250514"}),
        ));
        assert_eq!(claude.service.provider(), "anthropic");

        let sonnet = create_service(&AgentSettings::from_overrides(json!({"model": "sonnet-4"})));
        assert_eq!(sonnet.service.provider(), "anthropic");

        let openai = create_service(&AgentSettings::from_overrides(json!({"model": "gpt-4o"})));
        assert_eq!(openai.service.provider(), "openai");

        let o3 = create_service(&AgentSettings::from_overrides(json!({"model": "o3-mini"})));
        assert_eq!(o3.service.provider(), "openai");
    }

    #[test]
    fn unknown_prefix_falls_back_to_gemini_with_warning() {
        let selection = create_service(&AgentSettings::from_overrides(
            json!({"model": "mistral-large"}),
        ));
        assert_eq!(selection.service.provider(), "gemini");
        assert_eq!(selection.service.model(), "mistral-large");
        let warning = selection.warning.expect("warning present");
        assert!(warning.contains("mistral-large"));
    }
}
