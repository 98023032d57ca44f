//! Scripted doubles for the driver and tool backend.
//!
//! Available to this crate's tests and, with the `testing` feature, to
//! downstream crates' tests.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::Value;
use toolbridge_core::error::RegistryError;
use toolbridge_core::event::{StopReason, TurnEvent, TurnStream};
use toolbridge_core::message::Conversation;
use toolbridge_core::provider::TurnDriver;
use toolbridge_core::tool::{ToolBackend, ToolDescriptor, ToolOutput};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A complete text-only turn.
pub fn text_turn(text: &str) -> Vec<TurnEvent> {
    vec![
        TurnEvent::TextDelta {
            text: text.to_string(),
        },
        TurnEvent::end(StopReason::EndTurn),
    ]
}

/// A turn requesting a single tool call with the given raw arguments.
pub fn tool_call_turn(call_id: &str, tool_name: &str, arguments: &str) -> Vec<TurnEvent> {
    vec![
        TurnEvent::ToolCallStart {
            call_id: call_id.to_string(),
            tool_name: tool_name.to_string(),
        },
        TurnEvent::ToolCallArgsDelta {
            call_id: call_id.to_string(),
            partial_json: arguments.to_string(),
        },
        TurnEvent::ToolCallEnd {
            call_id: call_id.to_string(),
        },
        TurnEvent::end(StopReason::ToolUse),
    ]
}

/// A driver that replays scripted turns and records what it was asked.
///
/// Once the script runs out every further turn fails, unless the driver
/// was built with [`repeating`](Self::repeating).
pub struct ScriptedDriver {
    turns: Mutex<Vec<Vec<TurnEvent>>>,
    repeat: Option<Vec<TurnEvent>>,
    conversations: Mutex<Vec<Conversation>>,
    offered: Mutex<Vec<Vec<String>>>,
}

impl ScriptedDriver {
    pub fn new(turns: Vec<Vec<TurnEvent>>) -> Self {
        Self {
            turns: Mutex::new(turns.into_iter().rev().collect()),
            repeat: None,
            conversations: Mutex::new(Vec::new()),
            offered: Mutex::new(Vec::new()),
        }
    }

    /// Answer every turn with the same events.
    pub fn repeating(turn: Vec<TurnEvent>) -> Self {
        Self {
            repeat: Some(turn),
            ..Self::new(Vec::new())
        }
    }

    pub fn call_count(&self) -> usize {
        lock(&self.conversations).len()
    }

    /// The conversation as seen by each turn request.
    pub fn conversations(&self) -> Vec<Conversation> {
        lock(&self.conversations).clone()
    }

    /// Tool names offered on each turn request.
    pub fn offered_tools(&self) -> Vec<Vec<String>> {
        lock(&self.offered).clone()
    }
}

#[async_trait]
impl TurnDriver for ScriptedDriver {
    fn name(&self) -> &str {
        "scripted"
    }

    fn model(&self) -> &str {
        "scripted-model"
    }

    async fn run_turn(&self, conversation: &Conversation, tools: &[ToolDescriptor]) -> TurnStream {
        lock(&self.conversations).push(conversation.clone());
        lock(&self.offered).push(tools.iter().map(|t| t.name.clone()).collect());

        let next = lock(&self.turns).pop().or_else(|| self.repeat.clone());
        match next {
            Some(events) => TurnStream::from_events(events),
            None => TurnStream::failed("scripted driver has no more turns"),
        }
    }
}

/// An in-memory tool backend.
///
/// Tools without a configured response succeed with `"ok"`.
pub struct MockBackend {
    tools: Vec<ToolDescriptor>,
    list_error: Option<RegistryError>,
    responses: HashMap<String, Result<ToolOutput, RegistryError>>,
    calls: Mutex<Vec<(String, Value)>>,
    lists: Mutex<usize>,
}

impl MockBackend {
    pub fn new(tools: Vec<ToolDescriptor>) -> Self {
        Self {
            tools,
            list_error: None,
            responses: HashMap::new(),
            calls: Mutex::new(Vec::new()),
            lists: Mutex::new(0),
        }
    }

    /// A backend whose discovery always fails.
    pub fn unavailable(message: &str) -> Self {
        Self {
            list_error: Some(RegistryError::Unavailable(message.to_string())),
            ..Self::new(Vec::new())
        }
    }

    pub fn with_output(mut self, tool: &str, output: ToolOutput) -> Self {
        self.responses.insert(tool.to_string(), Ok(output));
        self
    }

    pub fn with_error(mut self, tool: &str, error: RegistryError) -> Self {
        self.responses.insert(tool.to_string(), Err(error));
        self
    }

    /// Every `(tool, arguments)` pair invoked, in order.
    pub fn calls(&self) -> Vec<(String, Value)> {
        lock(&self.calls).clone()
    }

    pub fn list_count(&self) -> usize {
        *lock(&self.lists)
    }
}

#[async_trait]
impl ToolBackend for MockBackend {
    fn endpoint(&self) -> &str {
        "mock://tools"
    }

    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, RegistryError> {
        *lock(&self.lists) += 1;
        match &self.list_error {
            Some(e) => Err(e.clone()),
            None => Ok(self.tools.clone()),
        }
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolOutput, RegistryError> {
        lock(&self.calls).push((name.to_string(), arguments));
        self.responses
            .get(name)
            .cloned()
            .unwrap_or_else(|| Ok(ToolOutput::success("ok")))
    }
}
