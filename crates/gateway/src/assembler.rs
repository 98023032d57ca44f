//! Response assembly: agent events in, OpenAI chunks out.
//!
//! Both response modes run the same translation. Streaming forwards each
//! chunk as it is produced; the aggregate mode folds the full chunk
//! sequence into one `chat.completion`, so the two always agree.

use serde_json::Value;
use tokio::sync::mpsc;
use toolbridge_agent::{AgentEvent, FinishReason};
use toolbridge_core::message::{ToolCallBlock, ToolResultBlock};

use crate::openai::{
    AssistantMessage, CHUNK_OBJECT, COMPLETION_OBJECT, ChatCompletion, ChatCompletionChunk,
    ChunkChoice, CompletionChoice, Delta, FunctionCall, ToolCall, ToolCallDelta, Usage,
};

const THOUGHTS_HEADER: &str = "**Thoughts:**\n";
const THOUGHTS_SEPARATOR: &str = "\n\n---\n\n";
const ENDED_EARLY: &str = "The agent stopped before completing its response.";

/// OpenAI `finish_reason` for a loop outcome.
pub fn finish_reason(reason: FinishReason) -> &'static str {
    match reason {
        FinishReason::Completed | FinishReason::BudgetExhausted => "stop",
        FinishReason::MaxTokens => "length",
        FinishReason::ProviderError
        | FinishReason::RegistryUnavailable
        | FinishReason::Fatal
        | FinishReason::Cancelled => "error",
    }
}

/// Translates one request's [`AgentEvent`]s into chat-completion chunks.
#[derive(Debug)]
pub struct ResponseAssembler {
    id: String,
    created: i64,
    model: String,
    include_tool_logs: bool,
    role_sent: bool,
    in_thinking: bool,
    /// Tail of the content emitted so far, for blank-line separation
    tail: String,
    /// A new turn started and nothing has been emitted for it yet
    turn_boundary: bool,
    tool_index: u32,
    finished: bool,
}

impl ResponseAssembler {
    pub fn new(model: impl Into<String>, include_tool_logs: bool) -> Self {
        Self {
            id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
            created: chrono::Utc::now().timestamp(),
            model: model.into(),
            include_tool_logs,
            role_sent: false,
            in_thinking: false,
            tail: String::new(),
            turn_boundary: false,
            tool_index: 0,
            finished: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Chunks for one event, in order. Nothing is produced after `Finished`.
    pub fn translate(&mut self, event: AgentEvent) -> Vec<ChatCompletionChunk> {
        if self.finished {
            return Vec::new();
        }

        let mut chunks = Vec::new();
        match event {
            AgentEvent::TurnStarted { turn } => {
                self.turn_boundary = turn > 1;
            }
            AgentEvent::Text { text } => {
                if text.is_empty() {
                    return chunks;
                }
                self.close_thinking(&mut chunks);
                let content = self.with_separator(&text);
                chunks.push(self.content_chunk(content));
            }
            AgentEvent::Thinking { text } => {
                if text.is_empty() {
                    return chunks;
                }
                let content = if self.in_thinking {
                    text.clone()
                } else {
                    self.in_thinking = true;
                    self.with_separator(&format!("{THOUGHTS_HEADER}{text}"))
                };
                self.remember(&content);
                chunks.push(self.chunk(
                    Delta {
                        content: Some(content),
                        reasoning_content: Some(text),
                        ..Delta::default()
                    },
                    None,
                ));
            }
            AgentEvent::ThinkingEnd => self.close_thinking(&mut chunks),
            AgentEvent::ToolCallStarted { .. } | AgentEvent::ToolCallArguments { .. } => {}
            AgentEvent::ToolCallCompleted { call } => {
                self.close_thinking(&mut chunks);
                chunks.push(self.tool_call_chunk(&call));
                if self.include_tool_logs {
                    let log = calling_log(&call);
                    chunks.push(self.content_chunk(log));
                }
            }
            AgentEvent::ToolCallMalformed {
                tool_name, reason, ..
            } => {
                self.close_thinking(&mut chunks);
                if self.include_tool_logs {
                    let log = format!("\n\nSkipped call to `{tool_name}`: {reason}\n");
                    chunks.push(self.content_chunk(log));
                }
            }
            AgentEvent::ToolResult { call, result } => {
                if self.include_tool_logs {
                    let log = result_log(&call, &result);
                    chunks.push(self.content_chunk(log));
                }
            }
            AgentEvent::Finished { reason, notice, .. } => {
                self.close_thinking(&mut chunks);
                if let Some(notice) = notice.filter(|n| !n.is_empty()) {
                    self.turn_boundary = true;
                    let content = self.with_separator(&notice);
                    chunks.push(self.content_chunk(content));
                }
                chunks.push(self.chunk(Delta::default(), Some(finish_reason(reason))));
                self.finished = true;
            }
        }
        chunks
    }

    /// Close the response. If the loop never reported `Finished`, an
    /// explanatory terminal chunk is produced so the stream still ends
    /// with a finish reason.
    pub fn finish(&mut self) -> Vec<ChatCompletionChunk> {
        if self.finished {
            return Vec::new();
        }
        let mut chunks = Vec::new();
        self.close_thinking(&mut chunks);
        self.turn_boundary = true;
        let content = self.with_separator(ENDED_EARLY);
        chunks.push(self.content_chunk(content));
        chunks.push(self.chunk(Delta::default(), Some("error")));
        self.finished = true;
        chunks
    }

    /// Translate every event from `events`, then close the response.
    pub async fn drain(&mut self, events: &mut mpsc::Receiver<AgentEvent>) -> Vec<ChatCompletionChunk> {
        let mut chunks = Vec::new();
        while let Some(event) = events.recv().await {
            chunks.extend(self.translate(event));
        }
        chunks.extend(self.finish());
        chunks
    }

    /// Fold a chunk sequence produced by this assembler into one completion.
    pub fn completion(&self, chunks: &[ChatCompletionChunk], prompt: Vec<String>) -> ChatCompletion {
        let mut content = String::new();
        let mut reasoning = String::new();
        let mut tool_calls = Vec::new();
        let mut finish = None;

        for choice in chunks.iter().flat_map(|c| c.choices.iter()) {
            if let Some(text) = &choice.delta.content {
                content.push_str(text);
            }
            if let Some(text) = &choice.delta.reasoning_content {
                reasoning.push_str(text);
            }
            if let Some(calls) = &choice.delta.tool_calls {
                tool_calls.extend(calls.iter().map(|d| d.call.clone()));
            }
            if let Some(reason) = &choice.finish_reason {
                finish = Some(reason.clone());
            }
        }

        ChatCompletion {
            id: self.id.clone(),
            object: COMPLETION_OBJECT.to_string(),
            created: self.created,
            model: self.model.clone(),
            usage: Usage::default(),
            choices: vec![CompletionChoice {
                index: 0,
                message: AssistantMessage {
                    role: "assistant".to_string(),
                    content,
                    reasoning_content: (!reasoning.is_empty()).then_some(reasoning),
                    tool_calls,
                },
                finish_reason: finish.unwrap_or_else(|| "error".to_string()),
                prompt,
            }],
        }
    }

    fn close_thinking(&mut self, chunks: &mut Vec<ChatCompletionChunk>) {
        if self.in_thinking {
            self.in_thinking = false;
            chunks.push(self.content_chunk(THOUGHTS_SEPARATOR.to_string()));
        }
    }

    /// Prefix `text` with whatever it takes to leave a blank line after
    /// the previous turn's output.
    fn with_separator(&mut self, text: &str) -> String {
        if !std::mem::take(&mut self.turn_boundary) || self.tail.is_empty() {
            return text.to_string();
        }
        let prefix = if self.tail.ends_with("\n\n") {
            ""
        } else if self.tail.ends_with('\n') {
            "\n"
        } else {
            "\n\n"
        };
        format!("{prefix}{text}")
    }

    fn remember(&mut self, content: &str) {
        self.tail.push_str(content);
        if self.tail.len() > 2 {
            let cut = self
                .tail
                .char_indices()
                .rev()
                .nth(1)
                .map_or(0, |(i, _)| i);
            self.tail.drain(..cut);
        }
    }

    fn content_chunk(&mut self, content: String) -> ChatCompletionChunk {
        self.remember(&content);
        self.chunk(
            Delta {
                content: Some(content),
                ..Delta::default()
            },
            None,
        )
    }

    fn tool_call_chunk(&mut self, call: &ToolCallBlock) -> ChatCompletionChunk {
        let index = self.tool_index;
        self.tool_index += 1;
        self.chunk(
            Delta {
                tool_calls: Some(vec![ToolCallDelta {
                    index,
                    call: ToolCall {
                        id: call.call_id.clone(),
                        kind: "function".to_string(),
                        function: FunctionCall {
                            name: call.tool_name.clone(),
                            arguments: call.arguments.to_string(),
                        },
                    },
                }]),
                ..Delta::default()
            },
            None,
        )
    }

    fn chunk(&mut self, mut delta: Delta, finish_reason: Option<&str>) -> ChatCompletionChunk {
        if !self.role_sent {
            self.role_sent = true;
            delta.role = Some("assistant".to_string());
        }
        ChatCompletionChunk {
            id: self.id.clone(),
            object: CHUNK_OBJECT.to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason: finish_reason.map(str::to_string),
            }],
        }
    }
}

fn calling_log(call: &ToolCallBlock) -> String {
    format!(
        "\n\nCalling `{}` with args:\n```json\n{}\n```",
        call.tool_name, call.arguments
    )
}

fn result_log(call: &ToolCallBlock, result: &ToolResultBlock) -> String {
    // JSON output is re-encoded compactly; anything else is shown as is.
    let rendered = match serde_json::from_str::<Value>(&result.content) {
        Ok(value) => value.to_string(),
        Err(_) => result.content.clone(),
    };
    format!(
        "\n\nResult from `{}`:\n```json\n{}\n```\n",
        call.tool_name, rendered
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn content_of(chunks: &[ChatCompletionChunk]) -> String {
        chunks
            .iter()
            .filter_map(|c| c.choices[0].delta.content.clone())
            .collect()
    }

    fn finished(reason: FinishReason, notice: Option<&str>) -> AgentEvent {
        AgentEvent::Finished {
            reason,
            notice: notice.map(str::to_string),
            turns: 0,
        }
    }

    fn lookup_call() -> ToolCallBlock {
        ToolCallBlock {
            call_id: "c1".into(),
            tool_name: "lookup".into(),
            arguments: json!({"q": "x"}),
        }
    }

    fn run(assembler: &mut ResponseAssembler, events: Vec<AgentEvent>) -> Vec<ChatCompletionChunk> {
        let mut chunks: Vec<ChatCompletionChunk> =
            events.into_iter().flat_map(|e| assembler.translate(e)).collect();
        chunks.extend(assembler.finish());
        chunks
    }

    #[test]
    fn text_chunks_then_stop() {
        let mut asm = ResponseAssembler::new("claude", true);
        let chunks = run(
            &mut asm,
            vec![
                AgentEvent::TurnStarted { turn: 1 },
                AgentEvent::Text { text: "Hel".into() },
                AgentEvent::Text { text: "lo".into() },
                finished(FinishReason::Completed, None),
            ],
        );

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].choices[0].delta.role.as_deref(), Some("assistant"));
        assert!(chunks[1].choices[0].delta.role.is_none());
        assert_eq!(content_of(&chunks), "Hello");

        let last = chunks.last().unwrap();
        assert_eq!(last.choices[0].finish_reason.as_deref(), Some("stop"));
        assert_eq!(last.choices[0].delta.content, None);
        assert!(chunks.iter().all(|c| c.id == asm.id() && c.object == CHUNK_OBJECT));
        assert!(asm.id().starts_with("chatcmpl-"));
    }

    #[test]
    fn tool_call_and_logs() {
        let mut asm = ResponseAssembler::new("claude", true);
        let call = lookup_call();
        let chunks = run(
            &mut asm,
            vec![
                AgentEvent::TurnStarted { turn: 1 },
                AgentEvent::ToolCallStarted {
                    call_id: "c1".into(),
                    tool_name: "lookup".into(),
                },
                AgentEvent::ToolCallArguments {
                    call_id: "c1".into(),
                    partial_json: r#"{"q":"x"}"#.into(),
                },
                AgentEvent::ToolCallCompleted { call: call.clone() },
                AgentEvent::ToolResult {
                    call: call.clone(),
                    result: ToolResultBlock::success("c1", "42"),
                },
                AgentEvent::TurnStarted { turn: 2 },
                AgentEvent::Text {
                    text: "The answer is 42".into(),
                },
                finished(FinishReason::Completed, None),
            ],
        );

        let calls = chunks[0].choices[0].delta.tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].index, 0);
        assert_eq!(calls[0].call.id, "c1");
        assert_eq!(calls[0].call.function.name, "lookup");
        assert_eq!(calls[0].call.function.arguments, r#"{"q":"x"}"#);

        assert_eq!(
            content_of(&chunks),
            "\n\nCalling `lookup` with args:\n```json\n{\"q\":\"x\"}\n```\
             \n\nResult from `lookup`:\n```json\n42\n```\n\
             \nThe answer is 42"
        );
    }

    #[test]
    fn tool_logs_can_be_hidden() {
        let mut asm = ResponseAssembler::new("claude", false);
        let call = lookup_call();
        let chunks = run(
            &mut asm,
            vec![
                AgentEvent::ToolCallCompleted { call: call.clone() },
                AgentEvent::ToolResult {
                    call,
                    result: ToolResultBlock::success("c1", "42"),
                },
                AgentEvent::TurnStarted { turn: 2 },
                AgentEvent::Text {
                    text: "The answer is 42".into(),
                },
                finished(FinishReason::Completed, None),
            ],
        );
        assert_eq!(content_of(&chunks), "The answer is 42");
        assert!(chunks[0].choices[0].delta.tool_calls.is_some());
    }

    #[test]
    fn successive_turns_are_separated_by_a_blank_line() {
        let mut asm = ResponseAssembler::new("claude", false);
        let chunks = run(
            &mut asm,
            vec![
                AgentEvent::TurnStarted { turn: 1 },
                AgentEvent::Text {
                    text: "Let me check.".into(),
                },
                AgentEvent::TurnStarted { turn: 2 },
                AgentEvent::Text { text: "Done.".into() },
                finished(FinishReason::Completed, None),
            ],
        );
        assert_eq!(content_of(&chunks), "Let me check.\n\nDone.");
    }

    #[test]
    fn thinking_is_framed_and_mirrored() {
        let mut asm = ResponseAssembler::new("claude", true);
        let chunks = run(
            &mut asm,
            vec![
                AgentEvent::Thinking { text: "hmm".into() },
                AgentEvent::Thinking { text: " ok".into() },
                AgentEvent::ThinkingEnd,
                AgentEvent::Text {
                    text: "Answer".into(),
                },
                finished(FinishReason::Completed, None),
            ],
        );
        assert_eq!(
            content_of(&chunks),
            "**Thoughts:**\nhmm ok\n\n---\n\nAnswer"
        );
        let completion = asm.completion(&chunks, vec![]);
        assert_eq!(
            completion.choices[0].message.reasoning_content.as_deref(),
            Some("hmm ok")
        );
    }

    #[test]
    fn notice_and_finish_reason_mapping() {
        let mut asm = ResponseAssembler::new("claude", true);
        let chunks = run(
            &mut asm,
            vec![
                AgentEvent::Text {
                    text: "partial".into(),
                },
                finished(FinishReason::BudgetExhausted, Some("Stopped after 3 turns.")),
            ],
        );
        assert_eq!(content_of(&chunks), "partial\n\nStopped after 3 turns.");
        assert_eq!(
            chunks.last().unwrap().choices[0].finish_reason.as_deref(),
            Some("stop")
        );

        assert_eq!(finish_reason(FinishReason::MaxTokens), "length");
        assert_eq!(finish_reason(FinishReason::ProviderError), "error");
        assert_eq!(finish_reason(FinishReason::Fatal), "error");
    }

    #[test]
    fn provider_error_on_first_turn_is_terminal_chunk() {
        let mut asm = ResponseAssembler::new("claude", true);
        let chunks = run(
            &mut asm,
            vec![
                AgentEvent::TurnStarted { turn: 1 },
                finished(
                    FinishReason::ProviderError,
                    Some("The model request failed: boom"),
                ),
            ],
        );
        assert_eq!(chunks.len(), 2);
        assert_eq!(content_of(&chunks), "The model request failed: boom");
        assert_eq!(chunks[1].choices[0].finish_reason.as_deref(), Some("error"));
    }

    #[test]
    fn missing_finished_is_synthesized_once() {
        let mut asm = ResponseAssembler::new("claude", true);
        let mut chunks = asm.translate(AgentEvent::Text { text: "hi".into() });
        chunks.extend(asm.finish());
        assert!(asm.is_finished());
        assert!(asm.finish().is_empty());
        assert!(asm.translate(AgentEvent::Text { text: "late".into() }).is_empty());

        let terminal: Vec<_> = chunks
            .iter()
            .filter(|c| c.choices[0].finish_reason.is_some())
            .collect();
        assert_eq!(terminal.len(), 1);
        assert_eq!(terminal[0].choices[0].finish_reason.as_deref(), Some("error"));
        assert!(content_of(&chunks).ends_with(ENDED_EARLY));
    }

    #[test]
    fn completion_folds_the_same_content() {
        let mut asm = ResponseAssembler::new("claude-sonnet", true);
        let call = lookup_call();
        let chunks = run(
            &mut asm,
            vec![
                AgentEvent::ToolCallCompleted { call: call.clone() },
                AgentEvent::ToolResult {
                    call,
                    result: ToolResultBlock::success("c1", r#"{ "value": 42 }"#),
                },
                AgentEvent::TurnStarted { turn: 2 },
                AgentEvent::Text { text: "42".into() },
                finished(FinishReason::Completed, None),
            ],
        );
        let completion = asm.completion(&chunks, vec!["what?".into()]);
        let choice = &completion.choices[0];
        assert_eq!(choice.message.content, content_of(&chunks));
        assert!(choice.message.content.contains(r#"{"value":42}"#));
        assert_eq!(choice.message.tool_calls.len(), 1);
        assert_eq!(choice.finish_reason, "stop");
        assert_eq!(choice.prompt, vec!["what?".to_string()]);
        assert_eq!(completion.object, COMPLETION_OBJECT);
        assert_eq!(completion.model, "claude-sonnet");
        assert_eq!(completion.id, asm.id());
    }

    #[tokio::test]
    async fn drain_consumes_channel_and_closes() {
        let (tx, mut rx) = mpsc::channel(4);
        tx.send(AgentEvent::Text { text: "a".into() }).await.unwrap();
        tx.send(finished(FinishReason::Completed, None)).await.unwrap();
        drop(tx);

        let mut asm = ResponseAssembler::new("claude", true);
        let chunks = asm.drain(&mut rx).await;
        assert_eq!(content_of(&chunks), "a");
        assert_eq!(
            chunks.last().unwrap().choices[0].finish_reason.as_deref(),
            Some("stop")
        );
    }
}
