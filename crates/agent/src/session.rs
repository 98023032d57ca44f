//! Per-request working state of the agent loop.
//!
//! An [`AgentSession`] owns the conversation, the tool-phase counter and
//! the events accumulated for the current turn. It is created when a
//! request arrives and dropped when the request ends.

use std::collections::HashSet;

use serde_json::Value;
use toolbridge_core::error::MalformedToolCall;
use toolbridge_core::event::TurnEvent;
use toolbridge_core::message::{
    ContentBlock, Conversation, Message, Role, ToolCallBlock, ToolResultBlock,
};
use tracing::warn;

use crate::stream_event::{AgentEvent, FinishReason};

/// Where the session is in the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Seeding,
    AwaitingTurn,
    ToolPhase,
    Finished,
}

#[derive(Debug)]
enum CallState {
    Streaming,
    Ready(Value),
    Rejected(String),
}

#[derive(Debug)]
struct PendingCall {
    call_id: String,
    tool_name: String,
    args: String,
    state: CallState,
}

/// Everything one turn produced, keyed by call id for tool calls.
#[derive(Debug, Default)]
struct TurnAccumulator {
    thinking: Vec<(String, Option<String>)>,
    open_thinking: Option<String>,
    text: String,
    calls: Vec<PendingCall>,
    /// Indices into `calls`, in the order their `ToolCallEnd` arrived
    completed: Vec<usize>,
}

/// The result of closing a turn.
#[derive(Debug, Default)]
pub struct ClosedTurn {
    /// Calls to invoke, in completion order
    pub ready: Vec<ToolCallBlock>,
    /// Calls that will not be invoked, with why
    pub rejected: Vec<(ToolCallBlock, MalformedToolCall)>,
    /// Malformed-call events discovered while closing
    pub events: Vec<AgentEvent>,
}

impl ClosedTurn {
    pub fn has_calls(&self) -> bool {
        !self.ready.is_empty() || !self.rejected.is_empty()
    }
}

#[derive(Debug)]
pub struct AgentSession {
    pub conversation: Conversation,
    state: SessionState,
    offered: HashSet<String>,
    tool_phases: u32,
    provider_turns: u32,
    current: TurnAccumulator,
    finish_reason: Option<FinishReason>,
}

impl AgentSession {
    pub fn new(conversation: Conversation) -> Self {
        Self {
            conversation,
            state: SessionState::Seeding,
            offered: HashSet::new(),
            tool_phases: 0,
            provider_turns: 0,
            current: TurnAccumulator::default(),
            finish_reason: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Completed tool phases (the turn counter).
    pub fn tool_phases(&self) -> u32 {
        self.tool_phases
    }

    /// Provider turns requested so far.
    pub fn provider_turns(&self) -> u32 {
        self.provider_turns
    }

    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.finish_reason
    }

    /// Record the tool names offered to the model this request.
    pub fn offer_tools<'a>(&mut self, names: impl IntoIterator<Item = &'a str>) {
        self.offered = names.into_iter().map(str::to_string).collect();
    }

    /// Enter `AwaitingTurn` with a fresh accumulator. Returns the turn number.
    pub fn begin_turn(&mut self) -> u32 {
        self.state = SessionState::AwaitingTurn;
        self.current = TurnAccumulator::default();
        self.provider_turns += 1;
        self.provider_turns
    }

    /// Fold one non-terminal turn event into the session.
    ///
    /// Returns the events to forward, in order. `TurnEnd` is handled by
    /// [`close_turn`](Self::close_turn) and yields nothing here.
    pub fn observe(&mut self, event: TurnEvent) -> Vec<AgentEvent> {
        let acc = &mut self.current;
        match event {
            TurnEvent::TextDelta { text } => {
                acc.text.push_str(&text);
                vec![AgentEvent::Text { text }]
            }
            TurnEvent::ThinkingDelta { text } => {
                acc.open_thinking.get_or_insert_with(String::new).push_str(&text);
                vec![AgentEvent::Thinking { text }]
            }
            TurnEvent::ThinkingEnd { signature } => {
                let thinking = acc.open_thinking.take().unwrap_or_default();
                acc.thinking.push((thinking, signature));
                vec![AgentEvent::ThinkingEnd]
            }
            TurnEvent::ToolCallStart { call_id, tool_name } => {
                if acc.calls.iter().any(|c| c.call_id == call_id) {
                    warn!(call_id = %call_id, "Duplicate ToolCallStart ignored");
                    return Vec::new();
                }
                acc.calls.push(PendingCall {
                    call_id: call_id.clone(),
                    tool_name: tool_name.clone(),
                    args: String::new(),
                    state: CallState::Streaming,
                });
                vec![AgentEvent::ToolCallStarted { call_id, tool_name }]
            }
            TurnEvent::ToolCallArgsDelta {
                call_id,
                partial_json,
            } => {
                let Some(call) = acc
                    .calls
                    .iter_mut()
                    .find(|c| c.call_id == call_id && matches!(c.state, CallState::Streaming))
                else {
                    warn!(call_id = %call_id, "Argument fragment for a call that is not streaming");
                    return Vec::new();
                };
                call.args.push_str(&partial_json);
                vec![AgentEvent::ToolCallArguments {
                    call_id,
                    partial_json,
                }]
            }
            TurnEvent::ToolCallEnd { call_id } => {
                let Some(index) = acc
                    .calls
                    .iter()
                    .position(|c| c.call_id == call_id && matches!(c.state, CallState::Streaming))
                else {
                    warn!(call_id = %call_id, "ToolCallEnd for a call that is not streaming");
                    return Vec::new();
                };
                let offered = &self.offered;
                let call = &mut acc.calls[index];
                call.state = match parse_arguments(&call.args) {
                    Ok(_) if !offered.contains(&call.tool_name) => {
                        CallState::Rejected(format!("tool `{}` is not available", call.tool_name))
                    }
                    Ok(arguments) => CallState::Ready(arguments),
                    Err(reason) => CallState::Rejected(reason),
                };

                match &call.state {
                    CallState::Ready(arguments) => {
                        let block = ToolCallBlock {
                            call_id: call.call_id.clone(),
                            tool_name: call.tool_name.clone(),
                            arguments: arguments.clone(),
                        };
                        acc.completed.push(index);
                        vec![AgentEvent::ToolCallCompleted { call: block }]
                    }
                    CallState::Rejected(reason) => {
                        warn!(call_id = %call.call_id, tool = %call.tool_name, reason = %reason, "Malformed tool call");
                        vec![AgentEvent::ToolCallMalformed {
                            call_id: call.call_id.clone(),
                            tool_name: call.tool_name.clone(),
                            reason: reason.clone(),
                        }]
                    }
                    CallState::Streaming => Vec::new(),
                }
            }
            TurnEvent::TurnEnd { .. } => Vec::new(),
        }
    }

    /// Close the current turn and append the assistant message.
    ///
    /// Calls still streaming become malformed. The assistant message
    /// carries every call of the turn so each one can be answered.
    pub fn close_turn(&mut self) -> ClosedTurn {
        let mut acc = std::mem::take(&mut self.current);
        let mut closed = ClosedTurn::default();

        if let Some(thinking) = acc.open_thinking.take() {
            acc.thinking.push((thinking, None));
        }

        for call in acc.calls.iter_mut() {
            if matches!(call.state, CallState::Streaming) {
                let reason = "the turn ended before the call's arguments were complete".to_string();
                warn!(call_id = %call.call_id, tool = %call.tool_name, "Tool call never completed");
                closed.events.push(AgentEvent::ToolCallMalformed {
                    call_id: call.call_id.clone(),
                    tool_name: call.tool_name.clone(),
                    reason: reason.clone(),
                });
                call.state = CallState::Rejected(reason);
            }
        }

        for &index in &acc.completed {
            let call = &acc.calls[index];
            if let CallState::Ready(arguments) = &call.state {
                closed.ready.push(ToolCallBlock {
                    call_id: call.call_id.clone(),
                    tool_name: call.tool_name.clone(),
                    arguments: arguments.clone(),
                });
            }
        }
        for call in &acc.calls {
            if let CallState::Rejected(reason) = &call.state {
                closed.rejected.push((
                    ToolCallBlock {
                        call_id: call.call_id.clone(),
                        tool_name: call.tool_name.clone(),
                        arguments: Value::Object(Default::default()),
                    },
                    MalformedToolCall::new(&call.call_id, reason),
                ));
            }
        }

        let mut content: Vec<ContentBlock> = acc
            .thinking
            .into_iter()
            .map(|(thinking, signature)| ContentBlock::Thinking {
                thinking,
                signature,
            })
            .collect();
        if !acc.text.is_empty() {
            content.push(ContentBlock::Text { text: acc.text });
        }
        content.extend(closed.ready.iter().cloned().map(ContentBlock::ToolCall));
        content.extend(
            closed
                .rejected
                .iter()
                .map(|(call, _)| ContentBlock::ToolCall(call.clone())),
        );

        if !content.is_empty() {
            self.conversation.push(Message {
                role: Role::Assistant,
                content,
            });
        }

        closed
    }

    pub fn enter_tool_phase(&mut self) {
        self.state = SessionState::ToolPhase;
    }

    /// Append one tool phase's results and bump the turn counter.
    pub fn record_results(&mut self, results: Vec<ToolResultBlock>) -> u32 {
        if !results.is_empty() {
            self.conversation.push(Message::tool_results(results));
        }
        self.tool_phases += 1;
        self.tool_phases
    }

    /// Enter `Finished`, appending the synthesized final message if any.
    pub fn finish(&mut self, reason: FinishReason, notice: Option<&str>) {
        if let Some(notice) = notice {
            self.conversation.push(Message::assistant(notice));
        }
        self.state = SessionState::Finished;
        self.finish_reason = Some(reason);
    }
}

/// Parse a complete arguments payload. Empty means no arguments.
fn parse_arguments(raw: &str) -> Result<Value, String> {
    if raw.trim().is_empty() {
        return Ok(Value::Object(Default::default()));
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(value @ Value::Object(_)) => Ok(value),
        Ok(_) => Err("tool arguments must be a JSON object".into()),
        Err(e) => Err(format!("tool arguments are not valid JSON: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use toolbridge_core::event::StopReason;

    fn session_with(tools: &[&str]) -> AgentSession {
        let mut conv = Conversation::new();
        conv.push(Message::user("hi"));
        let mut session = AgentSession::new(conv);
        session.offer_tools(tools.iter().copied());
        session.begin_turn();
        session
    }

    fn start(id: &str, name: &str) -> TurnEvent {
        TurnEvent::ToolCallStart {
            call_id: id.into(),
            tool_name: name.into(),
        }
    }

    fn args(id: &str, json: &str) -> TurnEvent {
        TurnEvent::ToolCallArgsDelta {
            call_id: id.into(),
            partial_json: json.into(),
        }
    }

    fn end(id: &str) -> TurnEvent {
        TurnEvent::ToolCallEnd { call_id: id.into() }
    }

    #[test]
    fn text_turn_builds_assistant_message() {
        let mut session = session_with(&[]);
        assert_eq!(session.state(), SessionState::AwaitingTurn);
        let out = session.observe(TurnEvent::TextDelta { text: "Hel".into() });
        assert_eq!(out, vec![AgentEvent::Text { text: "Hel".into() }]);
        session.observe(TurnEvent::TextDelta { text: "lo".into() });
        assert!(session.observe(TurnEvent::end(StopReason::EndTurn)).is_empty());

        let closed = session.close_turn();
        assert!(!closed.has_calls());
        assert_eq!(session.conversation.last().unwrap().text(), "Hello");
        assert_eq!(session.conversation.last().unwrap().role, Role::Assistant);
    }

    #[test]
    fn interleaved_calls_are_keyed_by_id_and_ordered_by_completion() {
        let mut session = session_with(&["a", "b"]);
        session.observe(start("c1", "a"));
        session.observe(start("c2", "b"));
        session.observe(args("c2", r#"{"k":"#));
        session.observe(args("c1", r#"{"q":"x"}"#));
        session.observe(args("c2", "1}"));
        let out = session.observe(end("c2"));
        assert!(matches!(&out[0], AgentEvent::ToolCallCompleted { call } if call.call_id == "c2"));
        session.observe(end("c1"));

        let closed = session.close_turn();
        let ids: Vec<&str> = closed.ready.iter().map(|c| c.call_id.as_str()).collect();
        assert_eq!(ids, vec!["c2", "c1"]);
        assert_eq!(closed.ready[0].arguments, json!({"k": 1}));
        assert_eq!(closed.ready[1].arguments, json!({"q": "x"}));

        let assistant = session.conversation.last().unwrap();
        let call_ids: Vec<&str> = assistant.tool_calls().map(|c| c.call_id.as_str()).collect();
        assert_eq!(call_ids, vec!["c2", "c1"]);
    }

    #[test]
    fn empty_arguments_parse_as_object() {
        let mut session = session_with(&["ping"]);
        session.observe(start("c1", "ping"));
        session.observe(end("c1"));
        let closed = session.close_turn();
        assert_eq!(closed.ready[0].arguments, json!({}));
    }

    #[test]
    fn unparseable_arguments_are_malformed() {
        let mut session = session_with(&["lookup"]);
        session.observe(start("c1", "lookup"));
        session.observe(args("c1", r#"{"q": "#));
        let out = session.observe(end("c1"));
        match &out[0] {
            AgentEvent::ToolCallMalformed { call_id, reason, .. } => {
                assert_eq!(call_id, "c1");
                assert!(reason.contains("not valid JSON"));
            }
            other => panic!("unexpected {other:?}"),
        }

        let closed = session.close_turn();
        assert!(closed.ready.is_empty());
        assert_eq!(closed.rejected.len(), 1);
        assert_eq!(closed.rejected[0].0.arguments, json!({}));
        assert_eq!(closed.rejected[0].1.call_id, "c1");
    }

    #[test]
    fn non_object_arguments_are_malformed() {
        let mut session = session_with(&["lookup"]);
        session.observe(start("c1", "lookup"));
        session.observe(args("c1", "[1,2]"));
        let out = session.observe(end("c1"));
        assert!(matches!(&out[0], AgentEvent::ToolCallMalformed { reason, .. } if reason.contains("JSON object")));
    }

    #[test]
    fn call_without_end_is_malformed_at_close() {
        let mut session = session_with(&["lookup"]);
        session.observe(start("c1", "lookup"));
        session.observe(args("c1", r#"{"q":"x"}"#));

        let closed = session.close_turn();
        assert!(closed.ready.is_empty());
        assert_eq!(closed.rejected.len(), 1);
        assert!(matches!(&closed.events[0], AgentEvent::ToolCallMalformed { call_id, .. } if call_id == "c1"));
        // Still recorded so the error result has a matching call.
        assert_eq!(session.conversation.unanswered_calls(), vec!["c1"]);
    }

    #[test]
    fn tool_outside_snapshot_is_rejected() {
        let mut session = session_with(&["lookup"]);
        session.observe(start("c1", "delete_everything"));
        let out = session.observe(end("c1"));
        assert!(matches!(&out[0], AgentEvent::ToolCallMalformed { reason, .. } if reason.contains("not available")));
    }

    #[test]
    fn stray_fragments_are_ignored() {
        let mut session = session_with(&["lookup"]);
        assert!(session.observe(args("ghost", "{}")).is_empty());
        assert!(session.observe(end("ghost")).is_empty());
        session.observe(start("c1", "lookup"));
        assert!(session.observe(start("c1", "lookup")).is_empty());
        session.observe(end("c1"));
        assert!(session.observe(args("c1", "more")).is_empty());
        assert!(session.observe(end("c1")).is_empty());
        assert_eq!(session.close_turn().ready.len(), 1);
    }

    #[test]
    fn thinking_blocks_lead_the_assistant_message() {
        let mut session = session_with(&[]);
        session.observe(TurnEvent::ThinkingDelta { text: "plan".into() });
        session.observe(TurnEvent::ThinkingEnd {
            signature: Some("sig".into()),
        });
        session.observe(TurnEvent::TextDelta { text: "answer".into() });
        session.close_turn();

        let assistant = session.conversation.last().unwrap();
        assert_eq!(
            assistant.content[0],
            ContentBlock::Thinking {
                thinking: "plan".into(),
                signature: Some("sig".into())
            }
        );
        assert_eq!(assistant.text(), "answer");
    }

    #[test]
    fn empty_turn_appends_nothing() {
        let mut session = session_with(&[]);
        let before = session.conversation.messages.len();
        session.close_turn();
        assert_eq!(session.conversation.messages.len(), before);
    }

    #[test]
    fn results_bump_counter_and_finish_appends_notice() {
        let mut session = session_with(&[]);
        session.enter_tool_phase();
        assert_eq!(session.state(), SessionState::ToolPhase);
        assert_eq!(
            session.record_results(vec![ToolResultBlock::success("c1", "42")]),
            1
        );
        assert_eq!(session.conversation.last().unwrap().role, Role::Tool);

        session.finish(FinishReason::BudgetExhausted, Some("out of turns"));
        assert_eq!(session.state(), SessionState::Finished);
        assert_eq!(session.finish_reason(), Some(FinishReason::BudgetExhausted));
        assert_eq!(session.conversation.last().unwrap().text(), "out of turns");
    }
}
