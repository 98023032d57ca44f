//! Backend for deployments without a tool registry.

use async_trait::async_trait;
use serde_json::Value;
use toolbridge_core::error::RegistryError;
use toolbridge_core::tool::{ToolBackend, ToolDescriptor, ToolOutput};

/// Offers no tools; any invocation is refused.
#[derive(Debug, Default)]
pub struct EmptyBackend;

#[async_trait]
impl ToolBackend for EmptyBackend {
    fn endpoint(&self) -> &str {
        "none"
    }

    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, RegistryError> {
        Ok(Vec::new())
    }

    async fn call_tool(&self, name: &str, _arguments: Value) -> Result<ToolOutput, RegistryError> {
        Err(RegistryError::UnknownTool(name.to_string()))
    }
}
