//! The agent loop for toolbridge.
//!
//! One [`AgentLoop`] run serves one client request:
//!
//! 1. **Seed** the conversation and discover tools from the registry
//! 2. **Request a turn** from the model, forwarding its events as they arrive
//! 3. **If tool calls**: invoke them in completion order, append the results, go to 2
//! 4. **Otherwise**: finish with the model's answer
//!
//! The loop also finishes when the tool-use turn budget runs out, when the
//! model hits its token limit, or when a turn fails. Every run ends with
//! exactly one [`AgentEvent::Finished`].

pub mod loop_runner;
pub mod session;
pub mod stream_event;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use loop_runner::{AgentLoop, LoopSettings, SIMULATED_RESPONSE};
pub use session::{AgentSession, SessionState};
pub use stream_event::{AgentEvent, FinishReason};
