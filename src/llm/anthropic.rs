//! Anthropic Messages API service.
//!
//! Content blocks are concatenated into the normalized event stream:
//! `text_delta` becomes `TextDelta`, a `tool_use` block accumulates its
//! `input_json_delta` fragments and is emitted as one `FunctionCall` when the
//! block closes. Function-role contents are serialized back as `tool_result`
//! blocks in user messages.

use super::{send_with_retry, EventStream, LlmRequest, LlmService, StreamEvent};
use crate::config::RetrySettings;
use crate::error::{DbError, Result};
use crate::types::{AbortSignal, Content, FinishReason, FunctionCall, Part, Role, TokenUsage};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

const API_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";

/// Anthropic streaming service using the Messages API.
pub struct AnthropicService {
    client: reqwest::Client,
    api_key: String,
    model: String,
    retry: RetrySettings,
    base_url: String,
}

impl AnthropicService {
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

    fn build_request_body(&self, request: &LlmRequest) -> ApiMessagesRequest {
        let messages = build_api_messages(&request.history);
        let tools = if request.tools.is_empty() {
            None
        } else {
            Some(
                request
                    .tools
                    .iter()
                    .map(|t| ApiTool {
                        name: t.name.clone(),
                        description: t.description.clone(),
                        input_schema: t.parameters.clone(),
                    })
                    .collect(),
            )
        };
        ApiMessagesRequest {
            model: self.model.clone(),
            max_tokens: request.generation.max_output_tokens,
            system: request.system_instruction.clone(),
            messages,
            tools,
            temperature: request.generation.temperature,
            stream: true,
        }
    }
}

fn build_api_messages(history: &[Content]) -> Vec<ApiMessage> {
    history
        .iter()
        .map(|content| {
            let role = match content.role {
                Role::Model => "assistant",
                Role::User | Role::Function => "user",
            };
            let blocks = content
                .parts
                .iter()
                .map(|part| match part {
                    Part::Text { text } => ApiContentBlock::Text { text: text.clone() },
                    Part::FunctionCall(call) => ApiContentBlock::ToolUse {
                        id: call.id.clone(),
                        name: call.name.clone(),
                        input: call.args.clone(),
                    },
                    Part::FunctionResponse(resp) => ApiContentBlock::ToolResult {
                        tool_use_id: resp.id.clone(),
                        content: serde_json::to_string(&resp.response).unwrap_or_default(),
                        is_error: if resp.is_error { Some(true) } else { None },
                    },
                })
                .collect();
            ApiMessage {
                role: role.to_string(),
                content: blocks,
            }
        })
        .collect()
}

#[async_trait]
impl LlmService for AnthropicService {
    fn stream(&self, request: LlmRequest, signal: AbortSignal) -> EventStream {
        let client = self.client.clone();
        let api_key = self.api_key.clone();
        let model = self.model.clone();
        let retry = self.retry.clone();
        let url = format!("{}/v1/messages", self.base_url);
        let body = self.build_request_body(&request);

        Box::pin(async_stream::try_stream! {
            debug!(model, "anthropic stream request");
            let response = send_with_retry(
                || {
                    client
                        .post(&url)
                        .header("Content-Type", "application/json")
                        .header("x-api-key", api_key.as_str())
                        .header("anthropic-version", API_VERSION)
                        .json(&body)
                        .send()
                },
                &retry,
                &signal,
            )
            .await?;

            let mut usage = TokenUsage::default();
            let mut finish: Option<FinishReason> = None;
            // Open tool_use block, if any: (block index, id, name, buffered json).
            let mut open_tool: Option<(u64, String, String, String)> = None;
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
                    let Ok(event) = serde_json::from_str::<ApiStreamEvent>(&payload) else {
                        continue;
                    };
                    match event {
                        ApiStreamEvent::MessageStart { message } => {
                            usage.input_tokens = message.usage.input_tokens;
                        }
                        ApiStreamEvent::ContentBlockStart {
                            index,
                            content_block,
                        } => {
                            if let ApiStreamBlock::ToolUse { id, name } = content_block {
                                open_tool = Some((index, id, name, String::new()));
                            }
                        }
                        ApiStreamEvent::ContentBlockDelta { delta, .. } => match delta {
                            ApiDelta::TextDelta { text } => {
                                yield StreamEvent::TextDelta(text);
                            }
                            ApiDelta::InputJsonDelta { partial_json } => {
                                if let Some((_, _, _, buffer)) = open_tool.as_mut() {
                                    buffer.push_str(&partial_json);
                                }
                            }
                            ApiDelta::Other => {}
                        },
                        ApiStreamEvent::ContentBlockStop { index } => {
                            if open_tool.as_ref().map(|(i, _, _, _)| *i) == Some(index) {
                                let (_, id, name, buffer) =
                                    open_tool.take().expect("checked above");
                                let args: Value = if buffer.trim().is_empty() {
                                    Value::Object(serde_json::Map::new())
                                } else {
                                    serde_json::from_str(&buffer).map_err(|e| {
                                        DbError::InvalidToolCall(format!(
                                            "tool_use '{name}' input did not parse: {e}"
                                        ))
                                    })?
                                };
                                yield StreamEvent::FunctionCall(FunctionCall { id, name, args });
                            }
                        }
                        ApiStreamEvent::MessageDelta { delta, usage: delta_usage } => {
                            if let Some(delta_usage) = delta_usage {
                                usage.output_tokens = delta_usage.output_tokens;
                            }
                            if let Some(reason) = delta.stop_reason.as_deref() {
                                finish = Some(match reason {
                                    "max_tokens" => FinishReason::MaxTokens,
                                    "refusal" => FinishReason::Refusal,
                                    _ => FinishReason::Stop,
                                });
                            }
                        }
                        ApiStreamEvent::MessageStop => {}
                        ApiStreamEvent::Error { error } => {
                            Err(DbError::LlmProtocol(format!(
                                "{}: {}",
                                error.error_type, error.message
                            )))?;
                        }
                        ApiStreamEvent::Other => {}
                    }
                }
            }

            yield StreamEvent::UsageUpdate(usage);
            yield StreamEvent::Finish(finish.unwrap_or(FinishReason::Stop));
        })
    }

    async fn count_tokens(&self, _contents: &[Content]) -> Result<Option<u64>> {
        // Estimation is handled by the compressor; no counting round-trip here.
        Ok(None)
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn provider(&self) -> &'static str {
        "anthropic"
    }
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Serialize)]
struct ApiMessagesRequest {
    model: String,
    max_tokens: u32,
    system: String,
    messages: Vec<ApiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ApiTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    stream: bool,
}

#[derive(Serialize)]
struct ApiTool {
    name: String,
    description: String,
    input_schema: Value,
}

#[derive(Serialize)]
struct ApiMessage {
    role: String,
    content: Vec<ApiContentBlock>,
}

#[derive(Serialize)]
#[serde(tag = "type")]
enum ApiContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ApiStreamEvent {
    MessageStart {
        message: ApiMessageStart,
    },
    ContentBlockStart {
        index: u64,
        content_block: ApiStreamBlock,
    },
    ContentBlockDelta {
        #[allow(dead_code)]
        index: u64,
        delta: ApiDelta,
    },
    ContentBlockStop {
        index: u64,
    },
    MessageDelta {
        delta: ApiMessageDelta,
        #[serde(default)]
        usage: Option<ApiOutputUsage>,
    },
    MessageStop,
    Error {
        error: ApiError,
    },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct ApiMessageStart {
    usage: ApiInputUsage,
}

#[derive(Deserialize)]
struct ApiInputUsage {
    #[serde(default)]
    input_tokens: u32,
}

#[derive(Deserialize)]
struct ApiOutputUsage {
    #[serde(default)]
    output_tokens: u32,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ApiStreamBlock {
    ToolUse {
        id: String,
        name: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ApiDelta {
    TextDelta {
        text: String,
    },
    InputJsonDelta {
        partial_json: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct ApiMessageDelta {
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Deserialize)]
struct ApiError {
    #[serde(rename = "type", default)]
    error_type: String,
    #[serde(default)]
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn history_maps_to_message_blocks() {
        let history = vec![
            Content::user("show tables"),
            Content::model(vec![
                Part::text("Checking."),
                Part::FunctionCall(FunctionCall {
                    id: "toolu_1".into(),
                    name: "schema_discovery".into(),
                    args: json!({}),
                }),
            ]),
            Content::function_responses(vec![crate::types::FunctionResponse::ok(
                "toolu_1",
                "schema_discovery",
                json!({"tables": []}),
            )]),
        ];
        let messages = build_api_messages(&history);
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].role, "user");
        assert_eq!(messages[1].role, "assistant");
        // Function-role contents serialize back as user-side tool_result blocks.
        assert_eq!(messages[2].role, "user");

        let encoded = serde_json::to_value(&messages[2]).expect("encode");
        assert_eq!(encoded["content"][0]["type"], "tool_result");
        assert_eq!(encoded["content"][0]["tool_use_id"], "toolu_1");
    }

    #[test]
    fn stream_events_deserialize() {
        let start: ApiStreamEvent = serde_json::from_str(
            r#"{"type":"message_start","message":{"id":"m1","usage":{"input_tokens":12}}}"#,
        )
        .expect("message_start");
        assert!(matches!(
            start,
            ApiStreamEvent::MessageStart { message } if message.usage.input_tokens == 12
        ));

        let block: ApiStreamEvent = serde_json::from_str(
            r#"{"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"toolu_9","name":"sql_execute"}}"#,
        )
        .expect("content_block_start");
        assert!(matches!(
            block,
            ApiStreamEvent::ContentBlockStart {
                index: 1,
                content_block: ApiStreamBlock::ToolUse { .. }
            }
        ));

        let delta: ApiStreamEvent = serde_json::from_str(
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"hi"}}"#,
        )
        .expect("content_block_delta");
        assert!(matches!(
            delta,
            ApiStreamEvent::ContentBlockDelta {
                delta: ApiDelta::TextDelta { .. },
                ..
            }
        ));

        let unknown: ApiStreamEvent =
            serde_json::from_str(r#"{"type":"ping"}"#).expect("unknown event tolerated");
        assert!(matches!(unknown, ApiStreamEvent::Other));
    }
}
