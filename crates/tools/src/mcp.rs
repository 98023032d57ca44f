//! MCP tool backend over streamable HTTP.
//!
//! Each operation opens its own MCP session (initialize, list or call,
//! close). Tool sets are rediscovered per request, so nothing is cached
//! between calls.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use rmcp::{
    RoleClient, ServiceError, ServiceExt,
    model::{
        CallToolRequestParam, ClientCapabilities, ClientInfo, Content, Implementation, RawContent,
        ResourceContents, Tool,
    },
    service::RunningService,
    transport::StreamableHttpClientTransport,
};
use serde_json::Value;
use toolbridge_core::error::RegistryError;
use toolbridge_core::tool::{ToolBackend, ToolDescriptor, ToolOutput, default_input_schema};
use tracing::{debug, warn};

/// Placeholder for tools that succeed without returning content.
pub const EMPTY_OUTPUT: &str = "No content returned by tool.";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

pub struct McpBackend {
    server_url: String,
    client_name: String,
    timeout: Duration,
}

impl McpBackend {
    pub fn new(server_url: impl Into<String>, client_name: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            client_name: client_name.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Bound each whole operation, handshake included.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn client_info(&self) -> ClientInfo {
        ClientInfo {
            protocol_version: Default::default(),
            capabilities: ClientCapabilities::default(),
            client_info: Implementation {
                name: self.client_name.clone(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        }
    }

    async fn connect(&self) -> Result<RunningService<RoleClient, ClientInfo>, RegistryError> {
        let transport = StreamableHttpClientTransport::from_uri(self.server_url.as_str());
        self.client_info().serve(transport).await.map_err(|e| {
            RegistryError::Unavailable(format!(
                "failed to initialize MCP session with {}: {e}",
                self.server_url
            ))
        })
    }

    /// Run `op` inside a fresh session, closing it afterwards.
    async fn with_session<T, F, Fut>(&self, what: &str, op: F) -> Result<T, RegistryError>
    where
        F: FnOnce(RunningService<RoleClient, ClientInfo>) -> Fut,
        Fut: Future<Output = (RunningService<RoleClient, ClientInfo>, Result<T, RegistryError>)>,
    {
        let work = async {
            let service = self.connect().await?;
            let (service, result) = op(service).await;
            if let Err(e) = service.cancel().await {
                debug!(error = %e, "MCP session did not shut down cleanly");
            }
            result
        };

        tokio::time::timeout(self.timeout, work)
            .await
            .map_err(|_| {
                RegistryError::Unavailable(format!(
                    "MCP {what} timed out after {}s",
                    self.timeout.as_secs()
                ))
            })?
    }
}

#[async_trait]
impl ToolBackend for McpBackend {
    fn endpoint(&self) -> &str {
        &self.server_url
    }

    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, RegistryError> {
        let tools = self
            .with_session("list_tools", |service| async move {
                let result = service
                    .list_tools(Default::default())
                    .await
                    .map(|response| response.tools)
                    .map_err(|e| RegistryError::Unavailable(format!("list_tools failed: {e}")));
                (service, result)
            })
            .await?;

        debug!(endpoint = %self.server_url, tools = tools.len(), "Listed MCP tools");
        Ok(tools.iter().map(convert_tool).collect())
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolOutput, RegistryError> {
        let arguments = match arguments {
            Value::Object(map) => Some(map),
            Value::Null => None,
            other => {
                return Ok(ToolOutput::failure(format!(
                    "tool arguments must be a JSON object, got {other}"
                )));
            }
        };
        let request = CallToolRequestParam {
            name: name.to_string().into(),
            arguments,
        };

        let tool_name = name.to_string();
        self.with_session("call_tool", |service| async move {
            let result = match service.call_tool(request).await {
                Ok(result) => {
                    let text = render_content(&result.content);
                    if result.is_error.unwrap_or(false) {
                        warn!(tool = %tool_name, "MCP tool reported an error");
                        Ok(ToolOutput::failure(text))
                    } else {
                        Ok(ToolOutput::success(text))
                    }
                }
                // JSON-RPC error from the server: the tool side failed, not the transport.
                Err(ServiceError::McpError(err)) => {
                    warn!(tool = %tool_name, error = %err.message, "MCP tool call rejected");
                    Ok(ToolOutput::failure(err.message.to_string()))
                }
                Err(other) => Err(RegistryError::Unavailable(format!(
                    "call_tool {tool_name} failed: {other}"
                ))),
            };
            (service, result)
        })
        .await
    }
}

fn convert_tool(tool: &Tool) -> ToolDescriptor {
    let input_schema = if tool.input_schema.is_empty() {
        default_input_schema()
    } else {
        Value::Object(tool.input_schema.as_ref().clone())
    };

    ToolDescriptor {
        name: tool.name.to_string(),
        description: tool
            .description
            .as_ref()
            .map(|d| d.as_ref())
            .unwrap_or("")
            .to_string(),
        input_schema,
    }
}

/// Flatten MCP content into the text handed back to the model.
fn render_content(content: &[Content]) -> String {
    let parts: Vec<String> = content
        .iter()
        .map(|c| match &c.raw {
            RawContent::Text(text) => text.text.clone(),
            RawContent::Image(image) => {
                format!("Image ({}, {} bytes)", image.mime_type, image.data.len())
            }
            RawContent::Resource(resource) => match &resource.resource {
                ResourceContents::TextResourceContents { uri, .. }
                | ResourceContents::BlobResourceContents { uri, .. } => format!("Resource: {uri}"),
            },
            RawContent::Audio(audio) => {
                format!("Audio ({}, {} bytes)", audio.mime_type, audio.data.len())
            }
        })
        .collect();

    let text = parts.join("\n");
    if text.trim().is_empty() {
        EMPTY_OUTPUT.to_string()
    } else {
        text
    }
}
