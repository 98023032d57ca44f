//! Stand-in driver for deployments without upstream credentials.
//!
//! Every turn fails immediately with a descriptive `TurnEnd`, so requests
//! still receive a well-formed terminal response. Simulated requests never
//! reach it.

use async_trait::async_trait;
use toolbridge_core::error::ProviderError;
use toolbridge_core::event::TurnStream;
use toolbridge_core::message::Conversation;
use toolbridge_core::provider::TurnDriver;
use toolbridge_core::tool::ToolDescriptor;
use tracing::warn;

pub struct UnconfiguredDriver {
    model: String,
    reason: String,
}

impl UnconfiguredDriver {
    pub fn new(model: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl TurnDriver for UnconfiguredDriver {
    fn name(&self) -> &str {
        "unconfigured"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn run_turn(&self, _conversation: &Conversation, _tools: &[ToolDescriptor]) -> TurnStream {
        let err = ProviderError::NotConfigured(self.reason.clone());
        warn!(error = %err, "Turn requested without a configured provider");
        TurnStream::failed(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use toolbridge_core::event::{StopReason, TurnEvent};

    #[tokio::test]
    async fn every_turn_fails_with_reason() {
        let driver = UnconfiguredDriver::new("claude-x", "ANTHROPIC_API_KEY is not set");
        assert_eq!(driver.model(), "claude-x");

        let events = driver.run_turn(&Conversation::new(), &[]).await.collect().await;
        assert_eq!(events.len(), 1);
        match &events[0] {
            TurnEvent::TurnEnd { stop_reason, error } => {
                assert_eq!(*stop_reason, StopReason::Error);
                assert_eq!(
                    error.as_deref(),
                    Some("Provider not configured: ANTHROPIC_API_KEY is not set")
                );
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
