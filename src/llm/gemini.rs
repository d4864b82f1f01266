//! Google Gemini service.
//!
//! Gemini parts map one-to-one onto core parts: text stays text, and a
//! `functionCall` part arrives with structured args, so no JSON buffering is
//! needed. Call ids are synthesized because the API does not assign them.

use super::{send_with_retry, EventStream, LlmRequest, LlmService, StreamEvent};
use crate::config::RetrySettings;
use crate::error::{DbError, Result};
use crate::types::{AbortSignal, Content, FinishReason, FunctionCall, Part, Role, TokenUsage};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

const API_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Google Gemini streaming service.
pub struct GeminiService {
    client: reqwest::Client,
    api_key: String,
    model: String,
    retry: RetrySettings,
    base_url: String,
}

impl GeminiService {
    #[must_use]
    pub fn new(api_key: String, model: String, retry: RetrySettings) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            model,
            retry,
            base_url: API_BASE_URL.to_owned(),
        }
    }

    /// Point the service at a different endpoint (tests).
    #[must_use]
    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = base_url;
        self
    }

    fn build_request_body(request: &LlmRequest) -> ApiGenerateRequest {
        let contents = request.history.iter().map(build_api_content).collect();
        let system_instruction = if request.system_instruction.is_empty() {
            None
        } else {
            Some(ApiContent {
                role: None,
                parts: vec![ApiPart::Text {
                    text: request.system_instruction.clone(),
                }],
            })
        };
        let tools = if request.tools.is_empty() {
            None
        } else {
            Some(vec![ApiTools {
                function_declarations: request
                    .tools
                    .iter()
                    .map(|t| ApiFunctionDeclaration {
                        name: t.name.clone(),
                        description: t.description.clone(),
                        parameters: t.parameters.clone(),
                    })
                    .collect(),
            }])
        };
        ApiGenerateRequest {
            contents,
            system_instruction,
            tools,
            generation_config: Some(ApiGenerationConfig {
                max_output_tokens: Some(request.generation.max_output_tokens),
                temperature: request.generation.temperature,
            }),
        }
    }
}

fn build_api_content(content: &Content) -> ApiContent {
    let role = match content.role {
        Role::User | Role::Function => Some("user".to_string()),
        Role::Model => Some("model".to_string()),
    };
    let parts = content
        .parts
        .iter()
        .map(|part| match part {
            Part::Text { text } => ApiPart::Text { text: text.clone() },
            Part::FunctionCall(call) => ApiPart::FunctionCall {
                function_call: ApiFunctionCall {
                    name: call.name.clone(),
                    args: call.args.clone(),
                },
            },
            Part::FunctionResponse(resp) => ApiPart::FunctionResponse {
                function_response: ApiFunctionResponse {
                    name: resp.name.clone(),
                    response: resp.response.clone(),
                },
            },
        })
        .collect();
    ApiContent { role, parts }
}

/// Map a Gemini-normalized wire content back into a core content.
#[cfg(test)]
fn content_from_api(api: &ApiContent, role: Role) -> Content {
    let parts = api
        .parts
        .iter()
        .map(|part| match part {
            ApiPart::Text { text } => Part::Text { text: text.clone() },
            ApiPart::FunctionCall { function_call } => Part::FunctionCall(FunctionCall {
                id: String::new(),
                name: function_call.name.clone(),
                args: function_call.args.clone(),
            }),
            ApiPart::FunctionResponse { function_response } => {
                Part::FunctionResponse(crate::types::FunctionResponse {
                    id: String::new(),
                    name: function_response.name.clone(),
                    response: function_response.response.clone(),
                    is_error: false,
                })
            }
        })
        .collect();
    Content { role, parts }
}

#[async_trait]
impl LlmService for GeminiService {
    fn stream(&self, request: LlmRequest, signal: AbortSignal) -> EventStream {
        let client = self.client.clone();
        let api_key = self.api_key.clone();
        let model = self.model.clone();
        let retry = self.retry.clone();
        let url = format!(
            "{}/models/{}:streamGenerateContent",
            self.base_url, self.model
        );
        let body = Self::build_request_body(&request);

        Box::pin(async_stream::try_stream! {
            debug!(model, "gemini stream request");
            let response = send_with_retry(
                || {
                    client
                        .post(&url)
                        .header("Content-Type", "application/json")
                        .query(&[("key", api_key.as_str()), ("alt", "sse")])
                        .json(&body)
                        .send()
                },
                &retry,
                &signal,
            )
            .await?;

            let mut usage: Option<TokenUsage> = None;
            let mut finish: Option<FinishReason> = None;
            let mut parser = super::sse::SseParser::new();
            let byte_stream = response.bytes_stream();
            futures::pin_mut!(byte_stream);

            while let Some(chunk) = futures::StreamExt::next(&mut byte_stream).await {
                if signal.aborted() {
                    Err(DbError::Cancelled)?;
                }
                let chunk =
                    chunk.map_err(|e| DbError::LlmTransport(format!("stream read: {e}")))?;
                for payload in parser.feed(&chunk) {
                    let Ok(parsed) = serde_json::from_str::<ApiGenerateResponse>(&payload) else {
                        continue;
                    };
                    if let Some(meta) = parsed.usage_metadata {
                        usage = Some(TokenUsage {
                            input_tokens: meta.prompt_token_count,
                            output_tokens: meta.candidates_token_count,
                            cached_tokens: meta.cached_content_token_count,
                        });
                    }
                    if let Some(candidate) = parsed.candidates.into_iter().next() {
                        if let Some(reason) = candidate.finish_reason.as_deref() {
                            finish = Some(map_finish_reason(reason));
                        }
                        for part in candidate.content.parts {
                            match part {
                                ApiPart::Text { text } if !text.is_empty() => {
                                    yield StreamEvent::TextDelta(text);
                                }
                                ApiPart::FunctionCall { function_call } => {
                                    yield StreamEvent::FunctionCall(FunctionCall {
                                        id: format!("call_{}", uuid::Uuid::new_v4().simple()),
                                        name: function_call.name,
                                        args: function_call.args,
                                    });
                                }
                                _ => {}
                            }
                        }
                    }
                }
            }

            if let Some(usage) = usage {
                yield StreamEvent::UsageUpdate(usage);
            }
            yield StreamEvent::Finish(finish.unwrap_or(FinishReason::Stop));
        })
    }

    async fn count_tokens(&self, contents: &[Content]) -> Result<Option<u64>> {
        let url = format!("{}/models/{}:countTokens", self.base_url, self.model);
        let body = ApiCountRequest {
            contents: contents.iter().map(build_api_content).collect(),
        };
        let response = self
            .client
            .post(&url)
            .query(&[("key", self.api_key.as_str())])
            .json(&body)
            .send()
            .await
            .map_err(|e| DbError::LlmTransport(format!("countTokens: {e}")))?;
        if !response.status().is_success() {
            return Ok(None);
        }
        let counted: ApiCountResponse = response
            .json()
            .await
            .map_err(|e| DbError::LlmProtocol(format!("countTokens body: {e}")))?;
        Ok(Some(counted.total_tokens))
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn provider(&self) -> &'static str {
        "gemini"
    }
}

fn map_finish_reason(raw: &str) -> FinishReason {
    match raw {
        "MAX_TOKENS" => FinishReason::MaxTokens,
        "SAFETY" | "PROHIBITED_CONTENT" | "BLOCKLIST" => FinishReason::Refusal,
        _ => FinishReason::Stop,
    }
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ApiGenerateRequest {
    contents: Vec<ApiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<ApiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ApiTools>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<ApiGenerationConfig>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ApiTools {
    function_declarations: Vec<ApiFunctionDeclaration>,
}

#[derive(Serialize)]
struct ApiFunctionDeclaration {
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ApiGenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
}

#[derive(Serialize, Deserialize, Debug)]
pub(crate) struct ApiContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) role: Option<String>,
    #[serde(default)]
    pub(crate) parts: Vec<ApiPart>,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(untagged)]
pub(crate) enum ApiPart {
    FunctionCall {
        #[serde(rename = "functionCall")]
        function_call: ApiFunctionCall,
    },
    FunctionResponse {
        #[serde(rename = "functionResponse")]
        function_response: ApiFunctionResponse,
    },
    Text { text: String },
}

#[derive(Serialize, Deserialize, Debug)]
pub(crate) struct ApiFunctionCall {
    pub(crate) name: String,
    #[serde(default)]
    pub(crate) args: Value,
}

#[derive(Serialize, Deserialize, Debug)]
pub(crate) struct ApiFunctionResponse {
    pub(crate) name: String,
    #[serde(default)]
    pub(crate) response: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiGenerateResponse {
    #[serde(default)]
    candidates: Vec<ApiCandidate>,
    #[serde(default)]
    usage_metadata: Option<ApiUsageMetadata>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiCandidate {
    #[serde(default = "empty_content")]
    content: ApiContent,
    #[serde(default)]
    finish_reason: Option<String>,
}

fn empty_content() -> ApiContent {
    ApiContent {
        role: None,
        parts: Vec::new(),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiUsageMetadata {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
    #[serde(default)]
    cached_content_token_count: Option<u32>,
}

#[derive(Serialize)]
struct ApiCountRequest {
    contents: Vec<ApiContent>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiCountResponse {
    total_tokens: u64,
}
