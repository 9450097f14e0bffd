//! One live MCP server connection: handshake, tool discovery, invocation.

use serde_json::Value;

use crate::config::{McpServerConfig, McpTransportKind};
use crate::protocol::{self, McpToolDef, ToolCallResult, ToolsListResult};
use crate::transport::{HttpTransport, McpTransport, StdioTransport, TransportError};

/// Errors specific to MCP operations.
#[derive(Debug, thiserror::Error)]
pub enum McpError {
    #[error("MCP transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("MCP protocol error: {0}")]
    Protocol(String),

    #[error("MCP server is down: {0}")]
    ServerDown(String),
}

/// An initialized MCP server connection.
pub struct McpConnection {
    /// Server name from the device's config; becomes the `mcp.<name>`
    /// tool id prefix.
    pub name: String,
    /// Tools discovered via `tools/list`.
    pub tools: Vec<McpToolDef>,
    transport: Box<dyn McpTransport>,
}

impl McpConnection {
    /// Connect a server: spawn/dial the transport, perform the MCP
    /// handshake, and discover tools.
    pub async fn connect(config: &McpServerConfig) -> Result<Self, McpError> {
        let transport: Box<dyn McpTransport> = match config.transport {
            McpTransportKind::Stdio => Box::new(StdioTransport::spawn(config)?),
            McpTransportKind::Http | McpTransportKind::Sse => {
                Box::new(HttpTransport::connect(config)?)
            }
        };

        // Step 1: initialize.
        let init_params = protocol::initialize_params();
        let params_value = serde_json::to_value(&init_params)
            .map_err(|e| McpError::Protocol(format!("failed to serialize initialize params: {e}")))?;
        let resp = transport.send_request("initialize", Some(params_value)).await?;
        if let Err(err) = resp.into_result() {
            return Err(McpError::Protocol(format!("initialize failed: {err}")));
        }

        // Step 2: initialized notification.
        transport.send_notification("notifications/initialized").await?;

        // Step 3: discover tools.
        let tools_resp = transport.send_request("tools/list", None).await?;
        let tools = match tools_resp.into_result() {
            Ok(value) => match serde_json::from_value::<ToolsListResult>(value) {
                Ok(r) => r.tools,
                Err(e) => {
                    tracing::warn!(
                        server = %config.name,
                        error = %e,
                        "failed to parse tools/list result"
                    );
                    Vec::new()
                }
            },
            Err(err) => {
                tracing::warn!(
                    server = %config.name,
                    error = %err,
                    "tools/list returned error, server will have no tools"
                );
                Vec::new()
            }
        };

        tracing::info!(
            server = %config.name,
            tool_count = tools.len(),
            "MCP server initialized"
        );

        Ok(Self {
            name: config.name.clone(),
            tools,
            transport,
        })
    }

    pub fn is_alive(&self) -> bool {
        self.transport.is_alive()
    }

    /// Call a tool on this server by its bare (unprefixed) name.
    pub async fn call_tool(&self, tool_name: &str, arguments: Value) -> Result<ToolCallResult, McpError> {
        if !self.transport.is_alive() {
            return Err(McpError::ServerDown(self.name.clone()));
        }

        let params = serde_json::json!({
            "name": tool_name,
            "arguments": arguments,
        });
        let resp = self.transport.send_request("tools/call", Some(params)).await?;
        let value = resp
            .into_result()
            .map_err(|err| McpError::Protocol(format!("tools/call failed: {err}")))?;
        serde_json::from_value::<ToolCallResult>(value)
            .map_err(|e| McpError::Protocol(format!("failed to parse tools/call result: {e}")))
    }

    /// Gracefully shut down the connection.
    pub async fn shutdown(&self) {
        tracing::info!(server = %self.name, "shutting down MCP connection");
        self.transport.shutdown().await;
    }
}
