//! Turn events: the structured output of one model turn.
//!
//! A [`TurnStream`] is lazy, finite and not restartable. It always ends
//! with exactly one [`TurnEvent::TurnEnd`]; if the producer goes away
//! early the consumer sees a synthesized error `TurnEnd` instead of a
//! silently truncated turn.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Why a model turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    Error,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::EndTurn => "end_turn",
            Self::ToolUse => "tool_use",
            Self::MaxTokens => "max_tokens",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// One event of a model turn, in causal order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    TextDelta {
        text: String,
    },
    /// Provider reasoning fragment (extended thinking).
    ThinkingDelta {
        text: String,
    },
    /// Closes the current reasoning block.
    ThinkingEnd {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    ToolCallStart {
        call_id: String,
        tool_name: String,
    },
    ToolCallArgsDelta {
        call_id: String,
        partial_json: String,
    },
    ToolCallEnd {
        call_id: String,
    },
    TurnEnd {
        stop_reason: StopReason,
        /// Descriptive payload when `stop_reason` is `error`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl TurnEvent {
    pub fn end(stop_reason: StopReason) -> Self {
        Self::TurnEnd {
            stop_reason,
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self::TurnEnd {
            stop_reason: StopReason::Error,
            error: Some(error.into()),
        }
    }

    pub fn is_turn_end(&self) -> bool {
        matches!(self, Self::TurnEnd { .. })
    }
}

/// Producer half of a [`TurnStream`].
#[derive(Debug, Clone)]
pub struct TurnSender {
    tx: mpsc::Sender<TurnEvent>,
}

impl TurnSender {
    /// Send an event. Returns `false` once the consumer has gone away.
    pub async fn send(&self, event: TurnEvent) -> bool {
        self.tx.send(event).await.is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer half: the lazy event sequence of one turn.
#[derive(Debug)]
pub struct TurnStream {
    rx: mpsc::Receiver<TurnEvent>,
    ended: bool,
}

impl TurnStream {
    pub fn channel(capacity: usize) -> (TurnSender, TurnStream) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (TurnSender { tx }, TurnStream { rx, ended: false })
    }

    /// A stream that has already been filled with `events`.
    pub fn from_events(events: Vec<TurnEvent>) -> Self {
        let (tx, rx) = mpsc::channel(events.len().max(1));
        for event in events {
            // Capacity equals the event count, so this cannot fill up.
            let _ = tx.try_send(event);
        }
        TurnStream { rx, ended: false }
    }

    /// A turn that failed before producing anything.
    pub fn failed(error: impl Into<String>) -> Self {
        Self::from_events(vec![TurnEvent::failure(error)])
    }

    /// Next event, or `None` after the terminating `TurnEnd`.
    pub async fn next(&mut self) -> Option<TurnEvent> {
        if self.ended {
            return None;
        }
        match self.rx.recv().await {
            Some(event) => {
                if event.is_turn_end() {
                    self.ended = true;
                    self.rx.close();
                }
                Some(event)
            }
            None => {
                self.ended = true;
                Some(TurnEvent::failure(
                    "turn stream closed before the turn completed",
                ))
            }
        }
    }

    /// Drain the remaining events of the turn.
    pub async fn collect(mut self) -> Vec<TurnEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.next().await {
            events.push(event);
        }
        events
    }
}
