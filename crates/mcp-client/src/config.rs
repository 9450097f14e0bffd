use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// How an MCP server is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum McpTransportKind {
    /// Spawn a child process, JSON-RPC over stdin/stdout.
    Stdio,
    /// Streamable HTTP: JSON-RPC POSTs, responses as JSON or SSE frames.
    Http,
    /// Legacy SSE endpoints — same POST path, event-stream responses.
    Sse,
}

/// Resolved configuration for one MCP server connection.
///
/// Built by the gateway from the device's `mcp_configs` envelope; any
/// credential has already been decrypted into `headers` by that point.
#[derive(Debug, Clone)]
pub struct McpServerConfig {
    pub name: String,
    pub transport: McpTransportKind,
    /// Stdio: the command to spawn.
    pub command: Option<String>,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    /// Http/Sse: the endpoint URL.
    pub url: Option<String>,
    /// Extra request headers (authorization and friends).
    pub headers: HashMap<String, String>,
}

impl McpServerConfig {
    pub fn stdio(name: impl Into<String>, command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            transport: McpTransportKind::Stdio,
            command: Some(command.into()),
            args,
            env: HashMap::new(),
            url: None,
            headers: HashMap::new(),
        }
    }

    pub fn http(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            transport: McpTransportKind::Http,
            command: None,
            args: Vec::new(),
            env: HashMap::new(),
            url: Some(url.into()),
            headers: HashMap::new(),
        }
    }
}
