//! Tool registry client and the transport trait behind it.
//!
//! Tools live on a remote registry. [`ToolBackend`] is the transport seam
//! (MCP in production, mocks in tests); [`ToolRegistryClient`] adds the
//! per-request discovery snapshot and the invocation rules on top.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::RegistryError;
use crate::message::{ToolCallBlock, ToolResultBlock};

/// A callable tool advertised by the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// Unique within one discovery snapshot
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// JSON Schema of the tool's arguments
    #[serde(default = "default_input_schema")]
    pub input_schema: serde_json::Value,
}

pub fn default_input_schema() -> serde_json::Value {
    serde_json::json!({"type": "object"})
}

impl ToolDescriptor {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema: default_input_schema(),
        }
    }

    pub fn with_schema(mut self, input_schema: serde_json::Value) -> Self {
        self.input_schema = input_schema;
        self
    }
}

/// What the registry returned for one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    pub text: String,
    /// The tool ran but reported failure.
    pub is_error: bool,
}

impl ToolOutput {
    pub fn success(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_error: false,
        }
    }

    pub fn failure(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_error: true,
        }
    }
}

/// Transport to a tool registry.
///
/// `call_tool` returns `Err` only when the registry could not be reached;
/// tool-side failures come back as `ToolOutput { is_error: true, .. }`.
#[async_trait]
pub trait ToolBackend: Send + Sync {
    /// Where the registry lives, for logs.
    fn endpoint(&self) -> &str;

    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, RegistryError>;

    async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<ToolOutput, RegistryError>;
}

/// Per-request view of the tool registry.
pub struct ToolRegistryClient {
    backend: Arc<dyn ToolBackend>,
    snapshot: Vec<ToolDescriptor>,
}

impl ToolRegistryClient {
    pub fn new(backend: Arc<dyn ToolBackend>) -> Self {
        Self {
            backend,
            snapshot: Vec::new(),
        }
    }

    /// Refresh the snapshot from the registry.
    ///
    /// On failure the snapshot is emptied, so a caller that degrades to
    /// toolless operation cannot invoke stale tools.
    pub async fn discover(&mut self) -> Result<&[ToolDescriptor], RegistryError> {
        let listed = match self.backend.list_tools().await {
            Ok(tools) => tools,
            Err(e) => {
                self.snapshot.clear();
                return Err(match e {
                    RegistryError::UnknownTool(name) => {
                        RegistryError::Unavailable(format!("unexpected unknown tool {name}"))
                    }
                    other => other,
                });
            }
        };

        let mut seen = HashSet::new();
        self.snapshot = listed
            .into_iter()
            .filter(|tool| {
                let fresh = seen.insert(tool.name.clone());
                if !fresh {
                    warn!(tool = %tool.name, "Registry advertised a duplicate tool name, keeping the first");
                }
                fresh
            })
            .collect();

        debug!(
            endpoint = self.backend.endpoint(),
            tools = self.snapshot.len(),
            "Discovered tools"
        );
        Ok(&self.snapshot)
    }

    /// Tools from the most recent successful discovery.
    pub fn descriptors(&self) -> &[ToolDescriptor] {
        &self.snapshot
    }

    pub fn contains(&self, name: &str) -> bool {
        self.snapshot.iter().any(|t| t.name == name)
    }

    /// Invoke one tool call.
    ///
    /// Tool-side failures become an error [`ToolResultBlock`]. Only an
    /// unreachable registry or a name outside the snapshot is an `Err`.
    pub async fn invoke(&self, call: &ToolCallBlock) -> Result<ToolResultBlock, RegistryError> {
        if !self.contains(&call.tool_name) {
            return Err(RegistryError::UnknownTool(call.tool_name.clone()));
        }

        let output = self
            .backend
            .call_tool(&call.tool_name, call.arguments.clone())
            .await?;

        Ok(if output.is_error {
            ToolResultBlock::error(&call.call_id, output.text)
        } else {
            ToolResultBlock::success(&call.call_id, output.text)
        })
    }
}
