//! DotBot server: the cloud half of the agent platform.
//!
//! Holds the master encryption material, mediates LLM calls, runs the
//! orchestration pipeline and tool loops, and reaches external MCP
//! servers on behalf of connected devices. Devices connect over a
//! single persistent WebSocket channel; tool execution crosses back to
//! them as `execution_request` envelopes.

pub mod agents;
pub mod channel;
pub mod collections;
pub mod credentials;
pub mod identity;
pub mod mcp_gateway;
pub mod pipeline;
pub mod router;
pub mod state;
pub mod tools;

use axum::routing::get;
use axum::Router;
use tower_http::trace::TraceLayer;

use state::SharedState;

/// The full HTTP surface: the WS channel plus the credential pages.
pub fn app(state: SharedState) -> Router {
    Router::new()
        .route("/ws", get(channel::ws::ws_handler))
        .merge(credentials::http::routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
