//! Turn driver trait, the abstraction over the upstream model.
//!
//! A driver sends the running conversation plus the discovered tool
//! schemas to the model and yields the turn as a [`TurnStream`].
//! Generation parameters (model, temperature, token limits, thinking
//! budget) belong to the driver's deployment configuration, never to
//! the request.

use async_trait::async_trait;

use crate::event::TurnStream;
use crate::message::Conversation;
use crate::tool::ToolDescriptor;

#[async_trait]
pub trait TurnDriver: Send + Sync {
    /// Human-readable driver name (e.g., "anthropic").
    fn name(&self) -> &str;

    /// Model identifier reported to clients.
    fn model(&self) -> &str;

    /// Run one model turn.
    ///
    /// Never fails directly: connection, auth and protocol failures are
    /// reported as a terminal `TurnEnd { stop_reason: Error, .. }`.
    async fn run_turn(&self, conversation: &Conversation, tools: &[ToolDescriptor]) -> TurnStream;
}
