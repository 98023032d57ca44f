//! Anthropic Messages API turn driver.
//!
//! Features:
//! - `x-api-key` header authentication (not Bearer)
//! - `anthropic-version` header
//! - System prompt as top-level field
//! - Native tool use with `tool_use` / `tool_result` content blocks
//! - Streaming via SSE, translated into [`TurnEvent`]s
//! - Extended thinking support

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use toolbridge_core::error::ProviderError;
use toolbridge_core::event::{StopReason, TurnEvent, TurnSender, TurnStream};
use toolbridge_core::message::{ContentBlock, Conversation, Message, Role};
use toolbridge_core::provider::TurnDriver;
use toolbridge_core::tool::ToolDescriptor;
use tracing::{debug, trace, warn};

use crate::sse::SseDecoder;

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";
const DEFAULT_MAX_TOKENS: u32 = 1024;
const EVENT_BUFFER: usize = 64;

/// Strip a provider prefix such as `anthropic:` from a model name.
pub fn normalize_model(name: &str) -> String {
    let name = name.trim();
    name.strip_prefix("anthropic:").unwrap_or(name).trim().to_string()
}

/// Anthropic native Messages API driver.
pub struct AnthropicDriver {
    name: String,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
    model: String,
    max_tokens: u32,
    temperature: f32,
    system_prompt: Option<String>,
    /// Budget tokens for extended thinking; `None` disables it.
    thinking_budget: Option<u32>,
}

impl AnthropicDriver {
    /// Create a driver with a request timeout.
    pub fn new(api_key: impl Into<String>, timeout: Duration) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ProviderError::NotConfigured(format!("HTTP client: {e}")))?;

        Ok(Self {
            name: "anthropic".into(),
            base_url: DEFAULT_BASE_URL.into(),
            api_key: api_key.into(),
            client,
            model: DEFAULT_MODEL.into(),
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: 0.0,
            system_prompt: None,
            thinking_budget: None,
        })
    }

    /// Create with a custom base URL (e.g., for testing or proxies).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_model(mut self, model: &str) -> Self {
        self.model = normalize_model(model);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_system_prompt(mut self, prompt: Option<String>) -> Self {
        self.system_prompt = prompt;
        self
    }

    /// Enable extended thinking.
    pub fn with_extended_thinking(mut self, budget_tokens: u32) -> Self {
        self.thinking_budget = Some(budget_tokens);
        self
    }

    /// Deployment prompt followed by client instructions.
    fn system_text(&self, conversation: &Conversation) -> Option<String> {
        let parts: Vec<&str> = self
            .system_prompt
            .iter()
            .map(String::as_str)
            .chain(conversation.instructions.iter().map(String::as_str))
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();

        (!parts.is_empty()).then(|| parts.join("\n\n"))
    }

    /// Convert the conversation to Anthropic API messages.
    ///
    /// Tool results travel as user-role `tool_result` blocks, and
    /// consecutive messages with the same API role are merged.
    fn to_api_messages(messages: &[Message]) -> Vec<AnthropicMessage> {
        let mut result: Vec<AnthropicMessage> = Vec::new();

        for msg in messages {
            let role = match msg.role {
                Role::User | Role::Tool => "user",
                Role::Assistant => "assistant",
            };
            let blocks: Vec<ApiBlock> = msg.content.iter().filter_map(ApiBlock::from_block).collect();
            if blocks.is_empty() {
                continue;
            }

            match result.last_mut() {
                Some(last) if last.role == role => last.content.extend(blocks),
                _ => result.push(AnthropicMessage {
                    role: role.into(),
                    content: blocks,
                }),
            }
        }

        result
    }

    /// Convert tool descriptors to Anthropic format.
    fn to_api_tools(tools: &[ToolDescriptor]) -> Vec<AnthropicTool> {
        tools
            .iter()
            .map(|t| AnthropicTool {
                name: t.name.clone(),
                description: t.description.clone(),
                input_schema: t.input_schema.clone(),
            })
            .collect()
    }

    fn request_body(&self, conversation: &Conversation, tools: &[ToolDescriptor]) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": Self::to_api_messages(&conversation.messages),
            "max_tokens": self.max_tokens,
            "stream": true,
        });

        if let Some(sys) = self.system_text(conversation) {
            body["system"] = serde_json::json!(sys);
        }

        if !tools.is_empty() {
            body["tools"] = serde_json::json!(Self::to_api_tools(tools));
        }

        // Thinking requests only accept the default temperature.
        match self.thinking_budget {
            Some(budget) => {
                body["thinking"] = serde_json::json!({
                    "type": "enabled",
                    "budget_tokens": budget
                });
            }
            None => body["temperature"] = serde_json::json!(self.temperature),
        }

        body
    }
}

#[async_trait]
impl TurnDriver for AnthropicDriver {
    fn name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn run_turn(&self, conversation: &Conversation, tools: &[ToolDescriptor]) -> TurnStream {
        let url = format!("{}/v1/messages", self.base_url);
        let body = self.request_body(conversation, tools);

        debug!(
            provider = "anthropic",
            model = %self.model,
            messages = conversation.messages.len(),
            tools = tools.len(),
            "Sending streaming turn request"
        );

        let request = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
            .header("Accept", "text/event-stream")
            .json(&body);

        let (tx, stream) = TurnStream::channel(EVENT_BUFFER);
        tokio::spawn(async move {
            let response = match request.send().await {
                Ok(response) => response,
                Err(e) => {
                    let err = ProviderError::Network(e.to_string());
                    warn!(error = %err, "Anthropic request failed");
                    tx.send(TurnEvent::failure(err.to_string())).await;
                    return;
                }
            };

            let status = response.status().as_u16();
            if status != 200 {
                let error_body = response.text().await.unwrap_or_default();
                let err = status_error(status, &error_body);
                warn!(status, error = %err, "Anthropic API error");
                tx.send(TurnEvent::failure(err.to_string())).await;
                return;
            }

            pump_stream(response, tx).await;
        });

        stream
    }
}

/// Map a non-success HTTP status to a provider error.
fn status_error(status: u16, body: &str) -> ProviderError {
    let message = serde_json::from_str::<ErrorEnvelope>(body)
        .map(|e| e.error.message)
        .unwrap_or_else(|_| body.to_string());

    match status {
        401 | 403 => ProviderError::AuthenticationFailed(message),
        429 => ProviderError::RateLimited(message),
        _ => ProviderError::ApiError {
            status_code: status,
            message,
        },
    }
}

/// Read the SSE body and forward translated events until the turn ends.
async fn pump_stream(response: reqwest::Response, tx: TurnSender) {
    let mut byte_stream = response.bytes_stream();
    let mut decoder = SseDecoder::new();
    let mut translator = StreamTranslator::default();

    while let Some(chunk) = byte_stream.next().await {
        let bytes = match chunk {
            Ok(b) => b,
            Err(e) => {
                let err = ProviderError::StreamInterrupted(e.to_string());
                tx.send(TurnEvent::failure(err.to_string())).await;
                return;
            }
        };

        for frame in decoder.push(&bytes) {
            for event in translator.on_data(&frame.data) {
                if !tx.send(event).await {
                    debug!("Turn consumer went away, dropping upstream stream");
                    return;
                }
            }
            if translator.is_done() {
                return;
            }
        }
    }

    if let Some(frame) = decoder.finish() {
        for event in translator.on_data(&frame.data) {
            if !tx.send(event).await {
                return;
            }
        }
    }

    if !translator.is_done() {
        let err = ProviderError::StreamInterrupted("stream ended before message_stop".into());
        tx.send(TurnEvent::failure(err.to_string())).await;
    }
}

/// Map an Anthropic stop reason onto the canonical set.
fn map_stop_reason(reason: &str) -> StopReason {
    match reason {
        "tool_use" => StopReason::ToolUse,
        "max_tokens" => StopReason::MaxTokens,
        // end_turn, stop_sequence, pause_turn, refusal
        _ => StopReason::EndTurn,
    }
}

#[derive(Debug)]
enum OpenBlock {
    Text,
    Thinking { signature: Option<String> },
    ToolUse { call_id: String },
    Other,
}

/// Stateful translation of Anthropic stream events into turn events.
///
/// Blocks are keyed by their stream index, so interleaved tool-call
/// streams stay attributed to the right call.
#[derive(Debug, Default)]
struct StreamTranslator {
    blocks: HashMap<usize, OpenBlock>,
    stop_reason: Option<StopReason>,
    done: bool,
}

impl StreamTranslator {
    fn is_done(&self) -> bool {
        self.done
    }

    fn on_data(&mut self, data: &str) -> Vec<TurnEvent> {
        let data = data.trim();
        if data.is_empty() || self.done {
            return Vec::new();
        }
        match serde_json::from_str::<StreamEvent>(data) {
            Ok(event) => self.on_event(event),
            Err(e) => {
                trace!(error = %e, data = %data, "Ignoring unparseable Anthropic SSE");
                Vec::new()
            }
        }
    }

    fn on_event(&mut self, event: StreamEvent) -> Vec<TurnEvent> {
        let mut out = Vec::new();
        match event {
            StreamEvent::ContentBlockStart {
                index,
                content_block,
            } => {
                let block = match content_block {
                    StartBlock::Text { text } => {
                        if !text.is_empty() {
                            out.push(TurnEvent::TextDelta { text });
                        }
                        OpenBlock::Text
                    }
                    StartBlock::Thinking { thinking } => {
                        if !thinking.is_empty() {
                            out.push(TurnEvent::ThinkingDelta { text: thinking });
                        }
                        OpenBlock::Thinking { signature: None }
                    }
                    StartBlock::ToolUse { id, name } => {
                        out.push(TurnEvent::ToolCallStart {
                            call_id: id.clone(),
                            tool_name: name,
                        });
                        OpenBlock::ToolUse { call_id: id }
                    }
                    StartBlock::Other => OpenBlock::Other,
                };
                self.blocks.insert(index, block);
            }
            StreamEvent::ContentBlockDelta { index, delta } => match delta {
                BlockDelta::TextDelta { text } => {
                    if !text.is_empty() {
                        out.push(TurnEvent::TextDelta { text });
                    }
                }
                BlockDelta::ThinkingDelta { thinking } => {
                    if !thinking.is_empty() {
                        out.push(TurnEvent::ThinkingDelta { text: thinking });
                    }
                }
                BlockDelta::SignatureDelta { signature } => {
                    if let Some(OpenBlock::Thinking { signature: slot }) = self.blocks.get_mut(&index) {
                        slot.get_or_insert_with(String::new).push_str(&signature);
                    }
                }
                BlockDelta::InputJsonDelta { partial_json } => match self.blocks.get(&index) {
                    Some(OpenBlock::ToolUse { call_id }) => {
                        out.push(TurnEvent::ToolCallArgsDelta {
                            call_id: call_id.clone(),
                            partial_json,
                        });
                    }
                    _ => warn!(index, "input_json_delta for a block that is not a tool call"),
                },
                BlockDelta::Other => {}
            },
            StreamEvent::ContentBlockStop { index } => match self.blocks.remove(&index) {
                Some(OpenBlock::ToolUse { call_id }) => out.push(TurnEvent::ToolCallEnd { call_id }),
                Some(OpenBlock::Thinking { signature }) => out.push(TurnEvent::ThinkingEnd { signature }),
                Some(OpenBlock::Text | OpenBlock::Other) | None => {}
            },
            StreamEvent::MessageDelta { delta } => {
                if let Some(reason) = delta.stop_reason.as_deref() {
                    self.stop_reason = Some(map_stop_reason(reason));
                }
            }
            StreamEvent::MessageStop {} => {
                self.done = true;
                out.push(TurnEvent::end(self.stop_reason.unwrap_or(StopReason::EndTurn)));
            }
            StreamEvent::Error { error } => {
                self.done = true;
                let err = ProviderError::Upstream(format!("{}: {}", error.kind, error.message));
                out.push(TurnEvent::failure(err.to_string()));
            }
            StreamEvent::MessageStart {} | StreamEvent::Ping {} | StreamEvent::Unknown => {}
        }
        out
    }
}

// --- Anthropic API types ---

#[derive(Debug, Serialize, Deserialize)]
struct AnthropicMessage {
    role: String,
    content: Vec<ApiBlock>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ApiBlock {
    Text {
        text: String,
    },
    Thinking {
        thinking: String,
        signature: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
}

impl ApiBlock {
    fn from_block(block: &ContentBlock) -> Option<Self> {
        match block {
            ContentBlock::Text { text } if text.is_empty() => None,
            ContentBlock::Text { text } => Some(Self::Text { text: text.clone() }),
            // Unsigned thinking is rejected upstream, so it is not replayed.
            ContentBlock::Thinking { thinking, signature } => signature.as_ref().map(|sig| Self::Thinking {
                thinking: thinking.clone(),
                signature: sig.clone(),
            }),
            ContentBlock::ToolCall(call) => Some(Self::ToolUse {
                id: call.call_id.clone(),
                name: call.tool_name.clone(),
                input: call.arguments.clone(),
            }),
            ContentBlock::ToolResult(result) => Some(Self::ToolResult {
                tool_use_id: result.call_id.clone(),
                content: result.content.clone(),
                is_error: result.is_error,
            }),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct AnthropicTool {
    name: String,
    description: String,
    input_schema: serde_json::Value,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    MessageStart {},
    ContentBlockStart {
        index: usize,
        content_block: StartBlock,
    },
    ContentBlockDelta {
        index: usize,
        delta: BlockDelta,
    },
    ContentBlockStop {
        index: usize,
    },
    MessageDelta {
        delta: MessageDeltaBody,
    },
    MessageStop {},
    Ping {},
    Error {
        error: ApiErrorBody,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StartBlock {
    Text {
        #[serde(default)]
        text: String,
    },
    Thinking {
        #[serde(default)]
        thinking: String,
    },
    ToolUse {
        id: String,
        name: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BlockDelta {
    TextDelta { text: String },
    InputJsonDelta { partial_json: String },
    ThinkingDelta { thinking: String },
    SignatureDelta { signature: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct MessageDeltaBody {
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ApiErrorBody,
}
