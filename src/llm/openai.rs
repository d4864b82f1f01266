//! OpenAI Chat Completions service.
//!
//! Streaming tool calls arrive as incremental JSON-stringified argument
//! fragments keyed by index. The service buffers each call and emits a single
//! `FunctionCall` once its arguments parse; a fragment set that still does not
//! parse at finish is an invalid tool call.

use super::{send_with_retry, EventStream, LlmRequest, LlmService, StreamEvent};
use crate::config::RetrySettings;
use crate::error::{DbError, Result};
use crate::types::{AbortSignal, Content, FinishReason, FunctionCall, Part, Role, TokenUsage};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::debug;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// OpenAI streaming service; also talks to OpenAI-compatible endpoints via a
/// custom base URL.
pub struct OpenAiService {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
    retry: RetrySettings,
}

impl OpenAiService {
    #[must_use]
    pub fn new(
        api_key: String,
        model: String,
        base_url: Option<String>,
        retry: RetrySettings,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            model,
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_owned()),
            retry,
        }
    }

    fn build_request_body(&self, request: &LlmRequest) -> ApiChatRequest {
        let mut messages = Vec::new();
        if !request.system_instruction.is_empty() {
            messages.push(ApiMessage {
                role: "system".to_string(),
                content: Some(request.system_instruction.clone()),
                tool_calls: None,
                tool_call_id: None,
            });
        }
        for content in &request.history {
            append_api_messages(&mut messages, content);
        }

        let tools = if request.tools.is_empty() {
            None
        } else {
            Some(
                request
                    .tools
                    .iter()
                    .map(|t| ApiToolDef {
                        tool_type: "function".to_string(),
                        function: ApiFunctionDef {
                            name: t.name.clone(),
                            description: t.description.clone(),
                            parameters: t.parameters.clone(),
                        },
                    })
                    .collect(),
            )
        };

        ApiChatRequest {
            model: self.model.clone(),
            messages,
            tools,
            max_completion_tokens: Some(request.generation.max_output_tokens),
            temperature: request.generation.temperature,
            stream: true,
            stream_options: ApiStreamOptions {
                include_usage: true,
            },
        }
    }
}

fn append_api_messages(messages: &mut Vec<ApiMessage>, content: &Content) {
    match content.role {
        Role::User => {
            messages.push(ApiMessage {
                role: "user".to_string(),
                content: Some(content.joined_text()),
                tool_calls: None,
                tool_call_id: None,
            });
        }
        Role::Model => {
            let text = content.joined_text();
            let tool_calls: Vec<ApiToolCall> = content
                .function_calls()
                .map(|call| ApiToolCall {
                    id: call.id.clone(),
                    call_type: "function".to_string(),
                    function: ApiFunctionCall {
                        name: call.name.clone(),
                        arguments: call.args.to_string(),
                    },
                })
                .collect();
            messages.push(ApiMessage {
                role: "assistant".to_string(),
                content: if text.is_empty() { None } else { Some(text) },
                tool_calls: if tool_calls.is_empty() {
                    None
                } else {
                    Some(tool_calls)
                },
                tool_call_id: None,
            });
        }
        Role::Function => {
            // One tool-role message per response part.
            for part in &content.parts {
                if let Part::FunctionResponse(resp) = part {
                    messages.push(ApiMessage {
                        role: "tool".to_string(),
                        content: Some(resp.response.to_string()),
                        tool_calls: None,
                        tool_call_id: Some(resp.id.clone()),
                    });
                }
            }
        }
    }
}

#[derive(Debug, Default)]
struct ToolCallBuffer {
    id: String,
    name: String,
    arguments: String,
}

#[async_trait]
impl LlmService for OpenAiService {
    fn stream(&self, request: LlmRequest, signal: AbortSignal) -> EventStream {
        let client = self.client.clone();
        let api_key = self.api_key.clone();
        let model = self.model.clone();
        let retry = self.retry.clone();
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.build_request_body(&request);

        Box::pin(async_stream::try_stream! {
            debug!(model, "openai stream request");
            let response = send_with_retry(
                || {
                    client
                        .post(&url)
                        .header("Content-Type", "application/json")
                        .header("Authorization", format!("Bearer {api_key}"))
                        .json(&body)
                        .send()
                },
                &retry,
                &signal,
            )
            .await?;

            let mut usage: Option<TokenUsage> = None;
            let mut finish: Option<FinishReason> = None;
            let mut buffers: BTreeMap<u64, ToolCallBuffer> = BTreeMap::new();
            let mut parser = super::sse::SseParser::new();
            let byte_stream = response.bytes_stream();
            futures::pin_mut!(byte_stream);

            'outer: while let Some(chunk) = futures::StreamExt::next(&mut byte_stream).await {
                if signal.aborted() {
                    Err(DbError::Cancelled)?;
                }
                let chunk =
                    chunk.map_err(|e| DbError::LlmTransport(format!("stream read: {e}")))?;
                for payload in parser.feed(&chunk) {
                    if payload == "[DONE]" {
                        break 'outer;
                    }
                    let Ok(parsed) = serde_json::from_str::<ApiChatChunk>(&payload) else {
                        continue;
                    };
                    if let Some(chunk_usage) = parsed.usage {
                        usage = Some(TokenUsage {
                            input_tokens: chunk_usage.prompt_tokens,
                            output_tokens: chunk_usage.completion_tokens,
                            cached_tokens: None,
                        });
                    }
                    let Some(choice) = parsed.choices.into_iter().next() else {
                        continue;
                    };
                    if let Some(text) = choice.delta.content {
                        if !text.is_empty() {
                            yield StreamEvent::TextDelta(text);
                        }
                    }
                    for delta in choice.delta.tool_calls.unwrap_or_default() {
                        let buffer = buffers.entry(delta.index).or_default();
                        if let Some(id) = delta.id {
                            buffer.id = id;
                        }
                        if let Some(function) = delta.function {
                            if let Some(name) = function.name {
                                buffer.name = name;
                            }
                            if let Some(arguments) = function.arguments {
                                buffer.arguments.push_str(&arguments);
                            }
                        }
                    }
                    if let Some(reason) = choice.finish_reason.as_deref() {
                        finish = Some(match reason {
                            "length" => FinishReason::MaxTokens,
                            "content_filter" => FinishReason::Refusal,
                            _ => FinishReason::Stop,
                        });
                    }
                }
            }

            // Buffered tool calls are emitted once their arguments parse as
            // valid JSON; a parse failure at finish is a protocol error.
            for (_, buffer) in buffers {
                let args: Value = if buffer.arguments.trim().is_empty() {
                    Value::Object(serde_json::Map::new())
                } else {
                    serde_json::from_str(&buffer.arguments).map_err(|e| {
                        DbError::InvalidToolCall(format!(
                            "tool call '{}' arguments did not parse: {e}",
                            buffer.name
                        ))
                    })?
                };
                let id = if buffer.id.is_empty() {
                    format!("call_{}", uuid::Uuid::new_v4().simple())
                } else {
                    buffer.id
                };
                yield StreamEvent::FunctionCall(FunctionCall {
                    id,
                    name: buffer.name,
                    args,
                });
            }

            if let Some(usage) = usage {
                yield StreamEvent::UsageUpdate(usage);
            }
            yield StreamEvent::Finish(finish.unwrap_or(FinishReason::Stop));
        })
    }

    async fn count_tokens(&self, _contents: &[Content]) -> Result<Option<u64>> {
        // Chat Completions has no token-counting endpoint.
        Ok(None)
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn provider(&self) -> &'static str {
        "openai"
    }
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Serialize)]
struct ApiChatRequest {
    model: String,
    messages: Vec<ApiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ApiToolDef>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_completion_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    stream: bool,
    stream_options: ApiStreamOptions,
}

#[derive(Serialize)]
struct ApiStreamOptions {
    include_usage: bool,
}

#[derive(Serialize)]
struct ApiMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ApiToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Serialize)]
struct ApiToolCall {
    id: String,
    #[serde(rename = "type")]
    call_type: String,
    function: ApiFunctionCall,
}

#[derive(Serialize)]
struct ApiFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Serialize)]
struct ApiToolDef {
    #[serde(rename = "type")]
    tool_type: String,
    function: ApiFunctionDef,
}

#[derive(Serialize)]
struct ApiFunctionDef {
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Deserialize)]
struct ApiChatChunk {
    #[serde(default)]
    choices: Vec<ApiChoice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Deserialize)]
struct ApiChoice {
    delta: ApiDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct ApiDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ApiToolCallDelta>>,
}

#[derive(Deserialize)]
struct ApiToolCallDelta {
    #[serde(default)]
    index: u64,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<ApiFunctionDelta>,
}

#[derive(Deserialize)]
struct ApiFunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Deserialize)]
struct ApiUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}
