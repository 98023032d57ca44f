//! Turn driver implementations for toolbridge.
//!
//! All drivers implement the `toolbridge_core::TurnDriver` trait.
//! [`build_from_config`] picks the driver for a deployment.

pub mod anthropic;
pub mod sse;
pub mod unconfigured;

use std::sync::Arc;
use std::time::Duration;

use toolbridge_config::AppConfig;
use toolbridge_core::error::ProviderError;
use toolbridge_core::provider::TurnDriver;
use tracing::info;

pub use anthropic::{AnthropicDriver, normalize_model};
pub use unconfigured::UnconfiguredDriver;

/// Build the deployment's turn driver.
///
/// Without an API key the deployment still starts: simulated requests
/// work, and live requests end with a descriptive error.
pub fn build_from_config(
    config: &AppConfig,
    system_prompt: Option<String>,
) -> Result<Arc<dyn TurnDriver>, ProviderError> {
    let provider = &config.provider;
    let model = normalize_model(&provider.model);

    let Some(api_key) = provider.api_key.as_deref() else {
        return Ok(Arc::new(UnconfiguredDriver::new(
            model,
            "ANTHROPIC_API_KEY is not set",
        )));
    };

    let mut driver = AnthropicDriver::new(api_key, Duration::from_secs(provider.timeout_secs))?
        .with_base_url(&provider.base_url)
        .with_model(&model)
        .with_max_tokens(provider.max_output_tokens)
        .with_temperature(provider.temperature)
        .with_system_prompt(system_prompt);

    if provider.thinking_enabled {
        driver = driver.with_extended_thinking(provider.thinking_budget_tokens);
    }

    info!(
        provider = "anthropic",
        model = %model,
        thinking = provider.thinking_enabled,
        "Turn driver configured"
    );
    Ok(Arc::new(driver))
}
