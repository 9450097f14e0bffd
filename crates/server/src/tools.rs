//! Tool routing: category → destination and timeout, manifest lookup
//! with fuzzy resolution, and the dispatcher the tool loop calls into.
//!
//! Routing rules:
//! 1. `mcp.*` tool ids → the MCP gateway.
//! 2. Server-side categories (`premium`, `imagegen`, `knowledge.ingest`,
//!    `schedule`, `research`) → server-side executors.
//! 3. Everything else crosses the channel to the device as an
//!    `execution_request`.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use dotbot_domain::tool::ToolDefinition;
use dotbot_protocol::{AgentRequest, ServerPayload};

use crate::channel::pending::PendingMap;
use crate::channel::session::SessionRegistry;

/// Categories executed on the server rather than the device.
pub const SERVER_SIDE_CATEGORIES: &[&str] =
    &["premium", "imagegen", "knowledge.ingest", "schedule", "research"];

/// Per-category execution timeout.
pub fn category_timeout(category: &str) -> Duration {
    match category {
        "codegen" => Duration::from_secs(11 * 60),
        "secrets" => Duration::from_secs(16 * 60),
        "shell" => Duration::from_secs(5 * 60),
        "market" => Duration::from_secs(3 * 60),
        "browser" | "gui" => Duration::from_secs(60),
        _ => Duration::from_secs(30),
    }
}

/// Does this tool execute server-side?
pub fn is_server_side(tool_id: &str, category: &str) -> bool {
    tool_id.starts_with("mcp.") || SERVER_SIDE_CATEGORIES.contains(&category)
}

/// Resolve a called function name against the manifest.
///
/// Exact id first; otherwise a second pass matches the trailing segment,
/// so a model calling `send_message` finds `discord.send_message`.
pub fn resolve_tool<'a>(manifest: &'a [ToolDefinition], name: &str) -> Option<&'a ToolDefinition> {
    if let Some(def) = manifest.iter().find(|d| d.name == name) {
        return Some(def);
    }
    manifest
        .iter()
        .find(|d| d.name.rsplit('.').next() == Some(name))
}

/// What one tool execution produced.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub text: String,
    pub is_error: bool,
}

impl DispatchOutcome {
    pub fn ok(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_error: false,
        }
    }
    pub fn error(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_error: true,
        }
    }
}

/// Executes resolved tool calls and answers manifest-expansion requests.
/// The production implementation routes over the channel / MCP gateway;
/// tests substitute an in-memory fake.
#[async_trait::async_trait]
pub trait ToolDispatcher: Send + Sync {
    async fn dispatch(&self, tool: &ToolDefinition, args: &Value) -> DispatchOutcome;

    /// Tools available in the given categories, for `agent.request_tools`.
    fn tools_in_categories(&self, categories: &[String]) -> Vec<ToolDefinition>;
}

/// Production dispatcher: `result.*` tools answer from the collection
/// navigator, `mcp.*` ids go to the MCP gateway, and everything else
/// crosses the channel with its category timeout. Oversized results are
/// intercepted into collections on the way back.
pub struct ChannelDispatcher {
    pub sessions: Arc<SessionRegistry>,
    pub pending: Arc<PendingMap>,
    pub device_id: String,
    pub mcp: Arc<crate::mcp_gateway::McpGateway>,
    pub navigator: Arc<crate::collections::Navigator>,
}

impl ChannelDispatcher {
    async fn dispatch_navigator(&self, tool: &str, args: &Value) -> DispatchOutcome {
        let now = chrono::Utc::now();
        let collection_id = args
            .get("collection_id")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let result = match tool {
            "result.overview" => self.navigator.overview(collection_id, now).await,
            "result.get" => {
                let index = args.get("index").and_then(Value::as_u64).unwrap_or(0) as usize;
                let fields: Option<Vec<String>> = args
                    .get("fields")
                    .and_then(Value::as_array)
                    .map(|a| {
                        a.iter()
                            .filter_map(Value::as_str)
                            .map(String::from)
                            .collect()
                    });
                self.navigator
                    .get(collection_id, index, fields.as_deref(), now)
                    .await
            }
            "result.filter" => {
                let field = args.get("field").and_then(Value::as_str).unwrap_or_default();
                let op = args.get("op").and_then(Value::as_str).unwrap_or_default();
                let value = args
                    .get("value")
                    .map(|v| match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .unwrap_or_default();
                self.navigator
                    .filter(collection_id, field, op, &value, now)
                    .await
            }
            "result.query" => {
                let expr = args
                    .get("expression")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                self.navigator.query(collection_id, expr, now).await
            }
            other => {
                return DispatchOutcome::error(format!("unknown navigator tool '{other}'"))
            }
        };
        match result {
            Ok(text) => DispatchOutcome::ok(text),
            Err(e) => DispatchOutcome::error(e.to_string()),
        }
    }
}

#[async_trait::async_trait]
impl ToolDispatcher for ChannelDispatcher {
    async fn dispatch(&self, tool: &ToolDefinition, args: &Value) -> DispatchOutcome {
        if tool.name.starts_with("result.") {
            return self.dispatch_navigator(&tool.name, args).await;
        }
        if tool.name.starts_with("mcp.") {
            let outcome = self.mcp.call(&self.device_id, &tool.name, args.clone()).await;
            return self.intercept(&tool.name, outcome).await;
        }

        if !self.sessions.is_connected(&self.device_id) {
            return DispatchOutcome::error("no device connected for this session");
        }

        let timeout = category_timeout(&tool.category);
        let result = self
            .pending
            .call(
                &self.sessions,
                &self.device_id,
                |correlation_id| {
                    ServerPayload::ExecutionRequest(AgentRequest {
                        correlation_id,
                        name: Some(tool.name.clone()),
                        args: Some(args.clone()),
                    })
                },
                timeout,
            )
            .await;

        let outcome = match result {
            Some(r) if r.success => {
                let text = r
                    .result
                    .map(|v| match v {
                        Value::String(s) => s,
                        other => other.to_string(),
                    })
                    .unwrap_or_default();
                DispatchOutcome::ok(text)
            }
            Some(r) => DispatchOutcome::error(
                r.error.unwrap_or_else(|| "tool execution failed".into()),
            ),
            None => DispatchOutcome::error(format!(
                "tool '{}' timed out or the local agent is not connected",
                tool.name
            )),
        };
        self.intercept(&tool.name, outcome).await
    }

    fn tools_in_categories(&self, categories: &[String]) -> Vec<ToolDefinition> {
        let mut out = Vec::new();
        for def in crate::collections::navigator_tool_defs() {
            if categories.iter().any(|c| def.category == *c) {
                out.push(def);
            }
        }
        for def in self.sessions.manifest(&self.device_id) {
            if categories.iter().any(|c| def.category == *c) {
                out.push(def);
            }
        }
        for def in self.mcp.manifest(&self.device_id) {
            if categories
                .iter()
                .any(|c| def.category == *c || def.category.starts_with(&format!("{c}.")))
            {
                out.push(def);
            }
        }
        out
    }
}

impl ChannelDispatcher {
    /// Run successful results through the collection pipeline so
    /// oversized payloads never reach model context raw.
    async fn intercept(&self, tool_id: &str, outcome: DispatchOutcome) -> DispatchOutcome {
        if outcome.is_error {
            return outcome;
        }
        match self
            .navigator
            .process_result(tool_id, &outcome.text, chrono::Utc::now())
            .await
        {
            crate::collections::ProcessedResult::Passthrough(text) => DispatchOutcome::ok(text),
            crate::collections::ProcessedResult::Overview { markdown, .. } => {
                DispatchOutcome::ok(markdown)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn def(name: &str, category: &str) -> ToolDefinition {
        ToolDefinition {
            name: name.into(),
            description: String::new(),
            parameters: serde_json::json!({"type": "object", "properties": {}}),
            category: category.into(),
        }
    }

    #[test]
    fn category_timeouts_match_policy() {
        assert_eq!(category_timeout("codegen"), Duration::from_secs(660));
        assert_eq!(category_timeout("secrets"), Duration::from_secs(960));
        assert_eq!(category_timeout("shell"), Duration::from_secs(300));
        assert_eq!(category_timeout("market"), Duration::from_secs(180));
        assert_eq!(category_timeout("browser"), Duration::from_secs(60));
        assert_eq!(category_timeout("gui"), Duration::from_secs(60));
        assert_eq!(category_timeout("filesystem"), Duration::from_secs(30));
    }

    #[test]
    fn server_side_routing() {
        assert!(is_server_side("mcp.gmail.list_messages", "mcp.gmail"));
        assert!(is_server_side("image.generate", "imagegen"));
        assert!(is_server_side("research.deep", "research"));
        assert!(!is_server_side("shell.run", "shell"));
        assert!(!is_server_side("filesystem.create_file", "filesystem"));
    }

    #[test]
    fn fuzzy_resolution_matches_trailing_segment() {
        let manifest = vec![
            def("discord.send_message", "discord"),
            def("filesystem.read_file", "filesystem"),
        ];
        assert_eq!(
            resolve_tool(&manifest, "discord.send_message").unwrap().name,
            "discord.send_message"
        );
        assert_eq!(
            resolve_tool(&manifest, "send_message").unwrap().name,
            "discord.send_message"
        );
        assert!(resolve_tool(&manifest, "delete_message").is_none());
    }

    #[test]
    fn exact_match_beats_fuzzy() {
        let manifest = vec![def("run", "shell"), def("shell.run", "shell")];
        assert_eq!(resolve_tool(&manifest, "run").unwrap().name, "run");
    }
}
