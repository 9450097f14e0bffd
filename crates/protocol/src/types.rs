use serde::{Deserialize, Serialize};

use dotbot_domain::tool::ToolDefinition;

/// Why an authentication attempt was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthFailReason {
    FingerprintMismatch,
    DeviceRevoked,
    RateLimited,
    InvalidToken,
    TokenExpired,
    TokenConsumed,
    TokenRevoked,
}

impl AuthFailReason {
    /// Numbered remediation steps printed by the client on fatal auth.
    pub fn remediation(&self) -> &'static str {
        match self {
            AuthFailReason::FingerprintMismatch => {
                "1. This device's hardware changed or the credential was copied.\n\
                 2. The device has been revoked; delete ~/.bot/device.json.\n\
                 3. Ask an admin for a new invite and register again."
            }
            AuthFailReason::DeviceRevoked => {
                "1. This device was revoked by an admin.\n\
                 2. Delete ~/.bot/device.json.\n\
                 3. Ask an admin for a new invite and register again."
            }
            AuthFailReason::RateLimited => {
                "1. Too many failed attempts from this address.\n\
                 2. Wait 15 minutes and try again."
            }
            AuthFailReason::InvalidToken => {
                "1. The invite token is not recognized.\n\
                 2. Check DOTBOT_INVITE_TOKEN in ~/.bot/.env for typos.\n\
                 3. Ask an admin to issue a fresh invite."
            }
            AuthFailReason::TokenExpired => {
                "1. The invite token has expired.\n\
                 2. Ask an admin to issue a fresh invite."
            }
            AuthFailReason::TokenConsumed => {
                "1. The invite token was already used.\n\
                 2. Ask an admin to issue a fresh invite for this device."
            }
            AuthFailReason::TokenRevoked => {
                "1. The invite token was revoked.\n\
                 2. Ask an admin to issue a fresh invite."
            }
        }
    }
}

/// Platform + capability facts a device declares when connecting.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DeviceFacts {
    /// Declared platform (e.g. "linux", "macos", "windows").
    pub platform: String,
    /// Tool definitions the device can execute.
    #[serde(default)]
    pub capabilities: Vec<ToolDefinition>,
    /// Scratch directory usable for cached artifacts on the device.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_dir: Option<String>,
}

// ── Auth payloads ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterDevice {
    pub invite_token: String,
    pub label: String,
    /// SHA-256 over stable machine identifiers. Held in memory only.
    pub fingerprint: String,
    #[serde(flatten)]
    pub facts: DeviceFacts,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRegistered {
    pub device_id: String,
    pub device_secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthRequest {
    pub device_id: String,
    pub device_secret: String,
    pub device_name: String,
    pub fingerprint: String,
    #[serde(flatten)]
    pub facts: DeviceFacts,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthOk {
    pub success: bool,
    pub user_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthFailed {
    pub reason: AuthFailReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

// ── Prompt / pipeline payloads ─────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prompt {
    pub prompt: String,
    /// Originating surface: "cli", "discord", "restart-queue", ...
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hints: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_user_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAcknowledged {
    pub acknowledgment: String,
    pub prompt: String,
    /// Human duration label ("~30s"), derived from the classification.
    pub estimated_label: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEvent {
    pub agent_id: String,
    pub topic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamChunk {
    pub agent_id: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalResponse {
    pub text: String,
    /// Labeled sections when several agents contributed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sections: Vec<ResponseSection>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub task_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseSection {
    pub label: String,
    pub text: String,
}

// ── Server → client requests (answered by `request_result`) ───────

/// A request the server routes into the local agent. The `correlation_id`
/// pairs the eventual [`RequestResult`]; the kind tag names the resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRequest {
    pub correlation_id: String,
    /// Tool id for execution requests; resource name otherwise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<serde_json::Value>,
}

/// Client's answer to any server-initiated request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestResult {
    pub correlation_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ── Credential payloads ────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialSessionRequest {
    pub correlation_id: String,
    pub key_name: String,
    pub prompt: String,
    pub title: String,
    pub allowed_domain: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialSessionReady {
    pub correlation_id: String,
    pub entry_url: String,
    pub expires_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialStored {
    pub key_name: String,
    /// `srv:`-prefixed blob; opaque to the client.
    pub encrypted_blob: String,
}

/// Client gateways (Discord and friends) need working plaintext; the
/// client ships its opaque blob to the server for decryption.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialResolve {
    pub correlation_id: String,
    pub key_name: String,
    pub encrypted_blob: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialResolveResponse {
    pub correlation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Where the decrypted credential is injected into the proxied request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialPlacement {
    pub header: String,
    #[serde(default)]
    pub prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyDescriptor {
    pub base_url: String,
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub headers: std::collections::HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
    pub placement: CredentialPlacement,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialProxy {
    pub correlation_id: String,
    pub key_name: String,
    #[serde(flatten)]
    pub request: ProxyDescriptor,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialProxyResponse {
    pub correlation_id: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default)]
    pub headers: std::collections::HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ── LLM relay payloads ─────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmCall {
    pub correlation_id: String,
    pub provider: String,
    pub model: String,
    pub messages: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmCallResponse {
    pub correlation_id: String,
    pub content: String,
    #[serde(default)]
    pub tool_calls: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<serde_json::Value>,
    pub model: String,
    pub provider: String,
}

// ── MCP / restart / side-channel payloads ──────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerEntry {
    pub name: String,
    /// "stdio", "http", or "sse".
    pub transport: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Vault key name holding the server's credential, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_key: Option<String>,
    /// Header the decrypted credential is sent in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_header: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpConfigs {
    pub servers: Vec<McpServerEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelBeforeRestart {
    pub correlation_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelBeforeRestartAck {
    pub correlation_id: String,
    pub cancelled: usize,
    pub prompts: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserNotification {
    pub title: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunLog {
    pub agent_id: String,
    pub entries: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveAgentWork {
    pub agent_id: String,
    pub topic: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadUpdate {
    pub thread_id: String,
    pub role: String,
    pub text: String,
    pub topic: String,
}
