//! Tool registry backends for toolbridge.
//!
//! The agent loop sees tools only through `toolbridge_core::ToolBackend`.
//! Production deployments talk to an MCP server over streamable HTTP;
//! deployments without one get [`EmptyBackend`].

pub mod empty;
pub mod mcp;

use std::sync::Arc;
use std::time::Duration;

use toolbridge_config::AppConfig;
use toolbridge_core::tool::ToolBackend;
use tracing::{info, warn};

pub use empty::EmptyBackend;
pub use mcp::McpBackend;

/// Build the deployment's tool backend.
pub fn build_from_config(config: &AppConfig) -> Arc<dyn ToolBackend> {
    match config.mcp.server_url.as_deref() {
        Some(url) => {
            info!(endpoint = %url, client = %config.mcp.client_name, "Using MCP tool registry");
            Arc::new(
                McpBackend::new(url, &config.mcp.client_name)
                    .with_timeout(Duration::from_secs(config.mcp.timeout_secs)),
            )
        }
        None => {
            warn!("MCP_SERVER_URL is not set, no tools will be offered");
            Arc::new(EmptyBackend)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_server_means_empty_backend() {
        let backend = build_from_config(&AppConfig::default());
        assert_eq!(backend.endpoint(), "none");
    }

    #[test]
    fn server_url_builds_mcp_backend() {
        let mut config = AppConfig::default();
        config.mcp.server_url = Some("http://tools:8000/mcp".into());
        let backend = build_from_config(&config);
        assert_eq!(backend.endpoint(), "http://tools:8000/mcp");
    }
}
