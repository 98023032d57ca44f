//! Agent-level streaming events.
//!
//! `AgentEvent` is what the loop hands to the response assembler: turn
//! events forwarded as they arrive, plus the loop's own decisions (tool
//! results, malformed calls, the terminal `Finished`).

use serde::{Deserialize, Serialize};
use toolbridge_core::message::{ToolCallBlock, ToolResultBlock};

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// The model ended its turn normally.
    Completed,
    /// The model hit its output token limit.
    MaxTokens,
    /// The tool-use turn budget ran out.
    BudgetExhausted,
    /// The upstream model turn failed.
    ProviderError,
    /// The tool registry could not be reached.
    RegistryUnavailable,
    /// An internal invariant was violated (e.g. an unknown tool was invoked).
    Fatal,
    /// The client went away; never delivered.
    Cancelled,
}

impl FinishReason {
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            Self::ProviderError | Self::RegistryUnavailable | Self::Fatal
        )
    }
}

/// Events emitted by the agent loop, in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// A provider turn is about to be requested (1-based).
    TurnStarted { turn: u32 },

    /// Partial text from the model.
    Text { text: String },

    /// Partial provider reasoning.
    Thinking { text: String },

    /// A reasoning block closed.
    ThinkingEnd,

    ToolCallStarted { call_id: String, tool_name: String },

    ToolCallArguments { call_id: String, partial_json: String },

    /// A call's arguments are complete and it will be invoked.
    ToolCallCompleted { call: ToolCallBlock },

    /// A call that will not be invoked; an error result is synthesized.
    ToolCallMalformed {
        call_id: String,
        tool_name: String,
        reason: String,
    },

    /// A call was invoked.
    ToolResult {
        call: ToolCallBlock,
        result: ToolResultBlock,
    },

    /// Terminal event. `notice` is the synthesized final text for
    /// budget exhaustion, truncation and errors.
    Finished {
        reason: FinishReason,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        notice: Option<String>,
        turns: u32,
    },
}

impl AgentEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::TurnStarted { .. } => "turn_started",
            Self::Text { .. } => "text",
            Self::Thinking { .. } => "thinking",
            Self::ThinkingEnd => "thinking_end",
            Self::ToolCallStarted { .. } => "tool_call_started",
            Self::ToolCallArguments { .. } => "tool_call_arguments",
            Self::ToolCallCompleted { .. } => "tool_call_completed",
            Self::ToolCallMalformed { .. } => "tool_call_malformed",
            Self::ToolResult { .. } => "tool_result",
            Self::Finished { .. } => "finished",
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Finished { .. })
    }
}
