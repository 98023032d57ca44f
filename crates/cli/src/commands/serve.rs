//! `toolbridge serve`: Start the HTTP gateway.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use toolbridge_gateway::GatewayState;

pub async fn run(config_path: Option<&Path>, port_override: Option<u16>) -> anyhow::Result<()> {
    let mut config = super::load_config(config_path)?;
    if let Some(port) = port_override {
        config.gateway.port = port;
    }

    let base_dir = std::env::current_dir().context("Cannot read the working directory")?;
    let state = GatewayState::from_config(&config, &base_dir)
        .context("Failed to configure the turn driver")?;

    if !config.has_api_key() && !config.agent.simulate {
        eprintln!("  WARNING: ANTHROPIC_API_KEY is not set; only simulated requests will succeed.");
    }
    eprintln!("toolbridge gateway");
    eprintln!("   Listening: {}:{}", config.gateway.host, config.gateway.port);
    eprintln!("   Model:     {}", state.driver.model());
    eprintln!("   Tools:     {}", state.tools.endpoint());

    toolbridge_gateway::serve(&config, Arc::new(state))
        .await
        .context("Gateway stopped")?;
    Ok(())
}
