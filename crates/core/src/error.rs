//! Error types for the toolbridge domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each collaborator (provider, tool registry) has its own error enum;
//! the top-level [`Error`] wraps them.

use thiserror::Error;

/// The top-level error type for toolbridge operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Provider errors ---
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    // --- Tool registry errors ---
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    // --- Tool call errors ---
    #[error(transparent)]
    MalformedToolCall(#[from] MalformedToolCall),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Failures talking to the upstream model.
///
/// A turn driver never returns these to the loop directly; they are
/// rendered into the `error` payload of a terminal `TurnEnd`.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError { status_code: u16, message: String },

    #[error("Rate limited by provider: {0}")]
    RateLimited(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Upstream error event: {0}")]
    Upstream(String),

    #[error("Network error: {0}")]
    Network(String),
}

/// Failures of the tool registry client.
///
/// Tool-side execution failures are *not* errors here: they come back as an
/// error [`ToolResultBlock`](crate::message::ToolResultBlock).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("Tool registry unavailable: {0}")]
    Unavailable(String),

    #[error("Unknown tool: {0}")]
    UnknownTool(String),
}

/// A tool call the loop refuses to invoke.
///
/// Recovered locally: the loop answers it with a synthesized error result.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Malformed tool call {call_id}: {reason}")]
pub struct MalformedToolCall {
    pub call_id: String,
    pub reason: String,
}

impl MalformedToolCall {
    pub fn new(call_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_error_display() {
        let err = ProviderError::ApiError {
            status_code: 400,
            message: "bad request".into(),
        };
        assert_eq!(err.to_string(), "API request failed: bad request (status: 400)");
    }

    #[test]
    fn registry_error_wraps_into_top_level() {
        let err: Error = RegistryError::Unavailable("connection refused".into()).into();
        assert_eq!(
            err.to_string(),
            "Registry error: Tool registry unavailable: connection refused"
        );
    }

    #[test]
    fn malformed_tool_call_display() {
        let err = MalformedToolCall::new("c1", "arguments are not valid JSON");
        assert_eq!(
            err.to_string(),
            "Malformed tool call c1: arguments are not valid JSON"
        );
        let top: Error = err.into();
        assert!(top.to_string().starts_with("Malformed tool call c1"));
    }
}
