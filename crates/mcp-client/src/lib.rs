//! MCP (Model Context Protocol) client.
//!
//! One [`McpConnection`] per configured external tool server. The server's
//! MCP gateway owns the lifecycle (debounce, retries, generations); this
//! crate owns the wire: JSON-RPC framing, stdio and streamable-HTTP
//! transports, the initialize handshake, and tool discovery/invocation.

mod config;
mod connection;
mod protocol;
mod transport;

pub use config::{McpServerConfig, McpTransportKind};
pub use connection::{McpConnection, McpError};
pub use protocol::{McpToolDef, ToolCallContent, ToolCallResult};
pub use transport::TransportError;
