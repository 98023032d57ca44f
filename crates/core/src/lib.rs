//! # toolbridge core
//!
//! Domain types, traits, and error definitions for the toolbridge agent
//! gateway. This crate has **no framework dependencies**: it defines the
//! model every other crate implements against.
//!
//! ## Design
//!
//! The two backing services are traits here:
//! - [`TurnDriver`] talks to the upstream model, one turn at a time
//! - [`ToolBackend`] talks to the tool registry
//!
//! Implementations live in `toolbridge-providers` and `toolbridge-tools`,
//! which keeps the agent loop testable with scripted doubles.

pub mod error;
pub mod event;
pub mod message;
pub mod provider;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use error::{Error, MalformedToolCall, ProviderError, RegistryError, Result};
pub use event::{StopReason, TurnEvent, TurnSender, TurnStream};
pub use message::{
    ContentBlock, Conversation, ConversationId, Message, Role, ToolCallBlock, ToolResultBlock,
};
pub use provider::TurnDriver;
pub use tool::{ToolBackend, ToolDescriptor, ToolOutput, ToolRegistryClient};
