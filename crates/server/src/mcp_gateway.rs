//! MCP gateway: server-side connections to the external tool servers a
//! device lists in its `mcp_configs` envelope.
//!
//! Rapid config re-sends (reconnect storms) are debounced for 3 seconds.
//! Every accepted config bumps the device's generation counter; handlers
//! belonging to an older generation discard their work instead of
//! fighting the new one. Discovered tools register as
//! `mcp.<server>.<tool>` and route back here from the tool loop.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use dotbot_mcp_client::{McpConnection, McpError, McpServerConfig, McpToolDef, McpTransportKind};
use dotbot_domain::tool::ToolDefinition;
use dotbot_protocol::{AgentRequest, McpServerEntry, ServerPayload};

use crate::channel::pending::PendingMap;
use crate::channel::session::SessionRegistry;
use crate::credentials::crypto::CredentialCipher;
use crate::tools::DispatchOutcome;

/// Coalesce window for config re-sends.
const DEBOUNCE: Duration = Duration::from_secs(3);
/// Connect attempts per server (initial + retries).
const CONNECT_ATTEMPTS: usize = 3;
/// Delay between connect retries.
const RETRY_DELAY: Duration = Duration::from_secs(3);
/// Delay before the single scheduled reconnect after a live drop.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);
/// Flattened MCP output cap.
const OUTPUT_CAP: usize = 8000;

/// A live server connection, behind a trait so tests can fake it.
#[async_trait::async_trait]
pub trait McpServerHandle: Send + Sync {
    fn server_name(&self) -> &str;
    fn tool_defs(&self) -> Vec<McpToolDef>;
    async fn invoke(&self, tool: &str, args: serde_json::Value) -> Result<String, McpError>;
    async fn close(&self);
}

#[async_trait::async_trait]
impl McpServerHandle for McpConnection {
    fn server_name(&self) -> &str {
        &self.name
    }
    fn tool_defs(&self) -> Vec<McpToolDef> {
        self.tools.clone()
    }
    async fn invoke(&self, tool: &str, args: serde_json::Value) -> Result<String, McpError> {
        let result = self.call_tool(tool, args).await?;
        Ok(result.flatten(OUTPUT_CAP))
    }
    async fn close(&self) {
        self.shutdown().await;
    }
}

/// Dials one server config. Production uses [`McpConnection::connect`].
#[async_trait::async_trait]
pub trait McpConnector: Send + Sync {
    async fn connect(&self, config: &McpServerConfig) -> Result<Arc<dyn McpServerHandle>, McpError>;
}

pub struct RealConnector;

#[async_trait::async_trait]
impl McpConnector for RealConnector {
    async fn connect(&self, config: &McpServerConfig) -> Result<Arc<dyn McpServerHandle>, McpError> {
        let conn = McpConnection::connect(config).await?;
        Ok(Arc::new(conn))
    }
}

pub struct McpGateway {
    connector: Arc<dyn McpConnector>,
    sessions: Arc<SessionRegistry>,
    pending: Arc<PendingMap>,
    cipher: Arc<CredentialCipher>,
    /// device → server name → connection.
    connections: RwLock<HashMap<String, HashMap<String, Arc<dyn McpServerHandle>>>>,
    /// device → server name → resolved config, kept for reconnects.
    configs: RwLock<HashMap<String, HashMap<String, McpServerConfig>>>,
    /// device → accepted-config generation.
    generations: RwLock<HashMap<String, u64>>,
    /// Servers with a reconnect already scheduled.
    reconnecting: Mutex<HashSet<(String, String)>>,
}

impl McpGateway {
    pub fn new(
        connector: Arc<dyn McpConnector>,
        sessions: Arc<SessionRegistry>,
        pending: Arc<PendingMap>,
        cipher: Arc<CredentialCipher>,
    ) -> Self {
        Self {
            connector,
            sessions,
            pending,
            cipher,
            connections: RwLock::new(HashMap::new()),
            configs: RwLock::new(HashMap::new()),
            generations: RwLock::new(HashMap::new()),
            reconnecting: Mutex::new(HashSet::new()),
        }
    }

    /// Current generation for a device.
    pub fn generation(&self, device_id: &str) -> u64 {
        *self.generations.read().get(device_id).unwrap_or(&0)
    }

    /// Handle an `mcp_configs` envelope: bump the generation and apply
    /// after the debounce window, unless a newer config supersedes us.
    pub fn configs_received(self: &Arc<Self>, device_id: &str, servers: Vec<McpServerEntry>) {
        let generation = {
            let mut generations = self.generations.write();
            let g = generations.entry(device_id.to_string()).or_insert(0);
            *g += 1;
            *g
        };
        tracing::info!(
            device_id = %device_id,
            generation,
            servers = servers.len(),
            "mcp configs received, debouncing"
        );

        let gateway = self.clone();
        let device_id = device_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(DEBOUNCE).await;
            if gateway.generation(&device_id) != generation {
                tracing::debug!(device_id = %device_id, generation, "superseded during debounce");
                return;
            }
            gateway.apply_configs(&device_id, generation, servers).await;
        });
    }

    async fn apply_configs(
        self: &Arc<Self>,
        device_id: &str,
        generation: u64,
        servers: Vec<McpServerEntry>,
    ) {
        // Tear down the previous generation's connections.
        let old = self.connections.write().remove(device_id);
        if let Some(old) = old {
            for (_, conn) in old {
                conn.close().await;
            }
        }

        let mut connected: HashMap<String, Arc<dyn McpServerHandle>> = HashMap::new();
        let mut resolved: HashMap<String, McpServerConfig> = HashMap::new();
        for entry in servers {
            if self.generation(device_id) != generation {
                tracing::debug!(device_id = %device_id, "generation bumped mid-apply, stopping");
                return;
            }
            let config = match self.resolve_config(device_id, &entry).await {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!(server = %entry.name, error = %e, "skipping MCP server");
                    continue;
                }
            };
            match self.connect_with_retries(&config).await {
                Some(conn) => {
                    connected.insert(entry.name.clone(), conn);
                    resolved.insert(entry.name.clone(), config);
                }
                None => {
                    tracing::warn!(server = %entry.name, "MCP server failed to connect");
                }
            }
        }

        if self.generation(device_id) != generation {
            for (_, conn) in connected {
                conn.close().await;
            }
            return;
        }
        let count = connected.len();
        self.connections
            .write()
            .insert(device_id.to_string(), connected);
        self.configs.write().insert(device_id.to_string(), resolved);
        tracing::info!(device_id = %device_id, servers = count, "mcp gateway ready");
    }

    async fn connect_with_retries(
        &self,
        config: &McpServerConfig,
    ) -> Option<Arc<dyn McpServerHandle>> {
        for attempt in 1..=CONNECT_ATTEMPTS {
            match self.connector.connect(config).await {
                Ok(conn) => return Some(conn),
                Err(e) => {
                    tracing::warn!(
                        server = %config.name,
                        attempt,
                        error = %e,
                        "MCP connect failed"
                    );
                    if attempt < CONNECT_ATTEMPTS {
                        tokio::time::sleep(RETRY_DELAY).await;
                    }
                }
            }
        }
        None
    }

    /// Build the transport config, fetching and decrypting the server's
    /// credential when one is named. The blob comes from the device's
    /// vault; plaintext exists only long enough to set the header.
    async fn resolve_config(
        &self,
        device_id: &str,
        entry: &McpServerEntry,
    ) -> Result<McpServerConfig, String> {
        let transport = match entry.transport.as_str() {
            "stdio" => McpTransportKind::Stdio,
            "http" => McpTransportKind::Http,
            "sse" => McpTransportKind::Sse,
            other => return Err(format!("unknown transport '{other}'")),
        };
        let mut config = McpServerConfig {
            name: entry.name.clone(),
            transport,
            command: entry.command.clone(),
            args: entry.args.clone(),
            env: HashMap::new(),
            url: entry.url.clone(),
            headers: HashMap::new(),
        };

        if let Some(key_name) = &entry.credential_key {
            let result = self
                .pending
                .call(
                    &self.sessions,
                    device_id,
                    |correlation_id| {
                        ServerPayload::VaultRequest(AgentRequest {
                            correlation_id,
                            name: Some(key_name.clone()),
                            args: None,
                        })
                    },
                    Duration::from_secs(30),
                )
                .await;
            let blob = result
                .and_then(|r| r.result)
                .and_then(|v| v.as_str().map(String::from))
                .ok_or_else(|| format!("vault has no blob for '{key_name}'"))?;
            let plaintext = self
                .cipher
                .decrypt(&blob, None)
                .map_err(|e| format!("credential decrypt failed: {e}"))?;
            let header = entry
                .credential_header
                .clone()
                .unwrap_or_else(|| "Authorization".into());
            config.headers.insert(header, plaintext);
        }
        Ok(config)
    }

    /// All discovered tools for a device, namespaced `mcp.<server>.<tool>`
    /// under category `mcp.<server>`.
    pub fn manifest(&self, device_id: &str) -> Vec<ToolDefinition> {
        let connections = self.connections.read();
        let Some(servers) = connections.get(device_id) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for (server, conn) in servers {
            for tool in conn.tool_defs() {
                out.push(ToolDefinition {
                    name: format!("mcp.{server}.{}", tool.name),
                    description: tool.description.clone(),
                    parameters: tool.input_schema.clone(),
                    category: format!("mcp.{server}"),
                });
            }
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Invoke `mcp.<server>.<tool>` for a device.
    pub async fn call(
        self: &Arc<Self>,
        device_id: &str,
        full_tool_id: &str,
        args: serde_json::Value,
    ) -> DispatchOutcome {
        let Some((server, tool)) = parse_tool_id(full_tool_id) else {
            return DispatchOutcome::error(format!("malformed MCP tool id '{full_tool_id}'"));
        };
        let conn = {
            let connections = self.connections.read();
            connections
                .get(device_id)
                .and_then(|servers| servers.get(server))
                .cloned()
        };
        let Some(conn) = conn else {
            return DispatchOutcome::error(format!("MCP server '{server}' is not connected"));
        };

        match conn.invoke(tool, args).await {
            Ok(text) => DispatchOutcome::ok(text),
            Err(McpError::ServerDown(_)) | Err(McpError::Transport(_)) => {
                self.schedule_reconnect(device_id, server);
                DispatchOutcome::error(format!(
                    "MCP server '{server}' dropped; reconnect scheduled"
                ))
            }
            Err(e) => DispatchOutcome::error(e.to_string()),
        }
    }

    /// One reconnect per drop, 5 s out; repeats are suppressed while the
    /// flag is set.
    fn schedule_reconnect(self: &Arc<Self>, device_id: &str, server: &str) {
        let key = (device_id.to_string(), server.to_string());
        if !self.reconnecting.lock().insert(key.clone()) {
            return;
        }
        let gateway = self.clone();
        let generation = self.generation(device_id);
        tokio::spawn(async move {
            tokio::time::sleep(RECONNECT_DELAY).await;
            let (device_id, server) = key.clone();
            gateway.reconnecting.lock().remove(&key);
            if gateway.generation(&device_id) != generation {
                return; // a newer config already rebuilt everything
            }
            let config = gateway
                .configs
                .read()
                .get(&device_id)
                .and_then(|m| m.get(&server))
                .cloned();
            let Some(config) = config else { return };
            match gateway.connector.connect(&config).await {
                Ok(conn) => {
                    if gateway.generation(&device_id) != generation {
                        conn.close().await;
                        return;
                    }
                    if let Some(servers) = gateway.connections.write().get_mut(&device_id) {
                        servers.insert(server.clone(), conn);
                    }
                    tracing::info!(device_id = %device_id, server = %server, "MCP reconnected");
                }
                Err(e) => {
                    tracing::warn!(
                        device_id = %device_id,
                        server = %server,
                        error = %e,
                        "MCP reconnect failed; awaiting next mcp_configs"
                    );
                }
            }
        });
    }

    /// Tear down everything a device owns (on channel disconnect).
    pub async fn device_disconnected(&self, device_id: &str) {
        let removed = self.connections.write().remove(device_id);
        self.configs.write().remove(device_id);
        if let Some(servers) = removed {
            for (_, conn) in servers {
                conn.close().await;
            }
            tracing::info!(device_id = %device_id, "mcp connections torn down");
        }
    }
}

fn parse_tool_id(full: &str) -> Option<(&str, &str)> {
    let rest = full.strip_prefix("mcp.")?;
    rest.split_once('.')
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeHandle {
        name: String,
        tools: Vec<McpToolDef>,
    }

    #[async_trait::async_trait]
    impl McpServerHandle for FakeHandle {
        fn server_name(&self) -> &str {
            &self.name
        }
        fn tool_defs(&self) -> Vec<McpToolDef> {
            self.tools.clone()
        }
        async fn invoke(&self, tool: &str, _args: serde_json::Value) -> Result<String, McpError> {
            Ok(format!("{tool} ran"))
        }
        async fn close(&self) {}
    }

    struct FakeConnector;

    #[async_trait::async_trait]
    impl McpConnector for FakeConnector {
        async fn connect(
            &self,
            config: &McpServerConfig,
        ) -> Result<Arc<dyn McpServerHandle>, McpError> {
            Ok(Arc::new(FakeHandle {
                name: config.name.clone(),
                tools: vec![McpToolDef {
                    name: "list_messages".into(),
                    description: "List".into(),
                    input_schema: serde_json::json!({"type": "object"}),
                }],
            }))
        }
    }

    fn gateway() -> Arc<McpGateway> {
        Arc::new(McpGateway::new(
            Arc::new(FakeConnector),
            Arc::new(SessionRegistry::new()),
            Arc::new(PendingMap::new()),
            Arc::new(CredentialCipher::new([1u8; 32])),
        ))
    }

    #[test]
    fn tool_id_parsing() {
        assert_eq!(parse_tool_id("mcp.gmail.list_messages"), Some(("gmail", "list_messages")));
        assert_eq!(
            parse_tool_id("mcp.gmail.labels.get"),
            Some(("gmail", "labels.get"))
        );
        assert_eq!(parse_tool_id("shell.run"), None);
        assert_eq!(parse_tool_id("mcp.gmail"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn debounce_coalesces_rapid_resends() {
        let gw = gateway();
        let entry = McpServerEntry {
            name: "gmail".into(),
            transport: "http".into(),
            command: None,
            args: vec![],
            url: Some("http://localhost:9000/mcp".into()),
            credential_key: None,
            credential_header: None,
        };

        gw.configs_received("dev-1", vec![entry.clone()]);
        gw.configs_received("dev-1", vec![entry.clone()]);
        gw.configs_received("dev-1", vec![entry]);
        assert_eq!(gw.generation("dev-1"), 3);

        // Only the final generation applies after the debounce window.
        tokio::time::sleep(Duration::from_secs(4)).await;
        tokio::task::yield_now().await;
        let manifest = gw.manifest("dev-1");
        assert_eq!(manifest.len(), 1);
        assert_eq!(manifest[0].name, "mcp.gmail.list_messages");
        assert_eq!(manifest[0].category, "mcp.gmail");
    }

    #[tokio::test(start_paused = true)]
    async fn call_routes_to_connected_server() {
        let gw = gateway();
        gw.configs_received(
            "dev-1",
            vec![McpServerEntry {
                name: "gmail".into(),
                transport: "http".into(),
                command: None,
                args: vec![],
                url: Some("http://localhost:9000/mcp".into()),
                credential_key: None,
                credential_header: None,
            }],
        );
        tokio::time::sleep(Duration::from_secs(4)).await;
        tokio::task::yield_now().await;

        let out = gw
            .call("dev-1", "mcp.gmail.list_messages", serde_json::json!({}))
            .await;
        assert!(!out.is_error);
        assert_eq!(out.text, "list_messages ran");

        let miss = gw
            .call("dev-1", "mcp.slack.post", serde_json::json!({}))
            .await;
        assert!(miss.is_error);
    }

    #[tokio::test]
    async fn disconnect_tears_down() {
        let gw = gateway();
        gw.connections.write().insert(
            "dev-1".into(),
            HashMap::from([(
                "gmail".to_string(),
                Arc::new(FakeHandle {
                    name: "gmail".into(),
                    tools: vec![],
                }) as Arc<dyn McpServerHandle>,
            )]),
        );
        gw.device_disconnected("dev-1").await;
        assert!(gw.manifest("dev-1").is_empty());
    }
}
