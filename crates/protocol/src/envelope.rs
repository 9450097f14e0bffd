use serde::{Deserialize, Serialize};

use crate::types::*;

/// Client → server payloads, adjacently tagged as
/// `{ "type": "...", "payload": {...} }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientPayload {
    RegisterDevice(RegisterDevice),
    Auth(AuthRequest),
    Ping {},
    Prompt(Prompt),
    /// Answer to any server-initiated request (`execution_request`,
    /// `memory_request`, ...), paired by correlation id.
    RequestResult(RequestResult),
    CredentialSessionRequest(CredentialSessionRequest),
    CredentialResolve(CredentialResolve),
    CredentialProxy(CredentialProxy),
    LlmCall(LlmCall),
    McpConfigs(McpConfigs),
    CancelBeforeRestart(CancelBeforeRestart),
}

/// Server → client payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerPayload {
    DeviceRegistered(DeviceRegistered),
    Auth(AuthOk),
    AuthFailed(AuthFailed),
    Pong {},
    TaskAcknowledged(TaskAcknowledged),
    AgentStarted(AgentEvent),
    AgentComplete(AgentEvent),
    TaskProgress(AgentEvent),
    StreamChunk(StreamChunk),
    Response(FinalResponse),
    // ── Tool- and memory-routed requests into the local agent ──────
    ExecutionRequest(AgentRequest),
    SchemaRequest(AgentRequest),
    MemoryRequest(AgentRequest),
    SkillRequest(AgentRequest),
    PersonaRequest(AgentRequest),
    CouncilRequest(AgentRequest),
    KnowledgeRequest(AgentRequest),
    KnowledgeQuery(AgentRequest),
    ToolRequest(AgentRequest),
    ThreadRequest(AgentRequest),
    ThreadUpdate(ThreadUpdate),
    SaveToThread(ThreadUpdate),
    StoreAsset(AgentRequest),
    RetrieveAsset(AgentRequest),
    CleanupAssets(AgentRequest),
    /// Server-initiated fetch of a stored blob (`name` = key name); the
    /// client answers verbatim with a `request_result` — the blob is
    /// opaque to it.
    VaultRequest(AgentRequest),
    // ── Credentials ────────────────────────────────────────────────
    CredentialSessionReady(CredentialSessionReady),
    CredentialStored(CredentialStored),
    CredentialResolveResponse(CredentialResolveResponse),
    CredentialProxyResponse(CredentialProxyResponse),
    LlmCallResponse(LlmCallResponse),
    // ── Restart & side channel ─────────────────────────────────────
    CancelBeforeRestartAck(CancelBeforeRestartAck),
    UserNotification(UserNotification),
    RunLog(RunLog),
    SaveAgentWork(SaveAgentWork),
}

/// Wire envelope, client → server direction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientEnvelope {
    pub id: String,
    pub timestamp: i64,
    #[serde(flatten)]
    pub body: ClientPayload,
}

/// Wire envelope, server → client direction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerEnvelope {
    pub id: String,
    pub timestamp: i64,
    #[serde(flatten)]
    pub body: ServerPayload,
}

impl ClientEnvelope {
    pub fn new(body: ClientPayload) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            body,
        }
    }
}

impl ServerEnvelope {
    pub fn new(body: ServerPayload) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            body,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_envelope_wire_shape() {
        let env = ClientEnvelope::new(ClientPayload::Ping {});
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["type"], "ping");
        assert!(json["id"].is_string());
        assert!(json["timestamp"].is_i64());
        assert!(json["payload"].is_object());
    }

    #[test]
    fn auth_tag_is_shared_between_request_and_reply() {
        let req = ClientEnvelope::new(ClientPayload::Auth(AuthRequest {
            device_id: "dev-1".into(),
            device_secret: "s".into(),
            device_name: "laptop".into(),
            fingerprint: "fp".into(),
            facts: DeviceFacts::default(),
        }));
        let reply = ServerEnvelope::new(ServerPayload::Auth(AuthOk {
            success: true,
            user_id: "u-1".into(),
        }));
        assert_eq!(serde_json::to_value(&req).unwrap()["type"], "auth");
        let reply_json = serde_json::to_value(&reply).unwrap();
        assert_eq!(reply_json["type"], "auth");
        assert_eq!(reply_json["payload"]["success"], true);
    }

    #[test]
    fn auth_failed_reason_round_trips() {
        let env = ServerEnvelope::new(ServerPayload::AuthFailed(AuthFailed {
            reason: AuthFailReason::TokenConsumed,
            message: None,
        }));
        let json = serde_json::to_string(&env).unwrap();
        assert!(json.contains("\"token_consumed\""));
        let back: ServerEnvelope = serde_json::from_str(&json).unwrap();
        match back.body {
            ServerPayload::AuthFailed(f) => {
                assert_eq!(f.reason, AuthFailReason::TokenConsumed)
            }
            other => panic!("expected auth_failed, got {other:?}"),
        }
    }

    #[test]
    fn execution_request_round_trips_with_correlation() {
        let env = ServerEnvelope::new(ServerPayload::ExecutionRequest(AgentRequest {
            correlation_id: "corr-7".into(),
            name: Some("filesystem.create_file".into()),
            args: Some(serde_json::json!({"path": "/tmp/x"})),
        }));
        let json = serde_json::to_string(&env).unwrap();
        let back: ServerEnvelope = serde_json::from_str(&json).unwrap();
        match back.body {
            ServerPayload::ExecutionRequest(r) => {
                assert_eq!(r.correlation_id, "corr-7");
                assert_eq!(r.name.as_deref(), Some("filesystem.create_file"));
            }
            other => panic!("expected execution_request, got {other:?}"),
        }
    }

    #[test]
    fn unknown_type_fails_to_parse() {
        let raw = r#"{"id":"x","timestamp":1,"type":"bogus","payload":{}}"#;
        assert!(serde_json::from_str::<ClientEnvelope>(raw).is_err());
    }
}
