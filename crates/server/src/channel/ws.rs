//! WebSocket endpoint for device connections.
//!
//! Flow:
//! 1. Device connects to `GET /ws` and sends `register_device` (invite
//!    path) or `auth` (credential pair + fingerprint).
//! 2. On successful auth the session is registered, the per-device
//!    orchestrator and navigator are assembled, and the bidirectional
//!    envelope loop runs until disconnect.
//!
//! One connection task per device; outbound envelopes funnel through a
//! writer task fed by the session's sink.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{ConnectInfo, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use dotbot_domain::config::LoopConfig;
use dotbot_domain::tool::Message as ChatMessage;
use dotbot_protocol::{
    AgentRequest, AuthFailReason, AuthFailed, AuthOk, CancelBeforeRestartAck, ClientEnvelope,
    ClientPayload, CredentialProxyResponse, CredentialResolveResponse, CredentialSessionReady,
    DeviceRegistered, LlmCallResponse, ServerEnvelope, ServerPayload,
};
use dotbot_providers::{ChatRequest, LlmProvider};

use crate::agents::research::ResearchService;
use crate::agents::{AgentRuntimes, WaitRegistry};
use crate::channel::session::Session;
use crate::collections::{ClientFiles, Navigator};
use crate::pipeline::shortpath::IdentityRecord;
use crate::pipeline::{DeviceManifest, Orchestrator};
use crate::router::MessageRouter;
use crate::state::SharedState;
use crate::tools::ChannelDispatcher;

/// Time allowed for the first auth/registration envelope.
const AUTH_PHASE_TIMEOUT: Duration = Duration::from_secs(30);

/// Client-side cache directory for collection raw files.
const RESEARCH_CACHE_DIR: &str = "~/.bot/memory/research-cache";

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, addr))
}

async fn handle_socket(socket: WebSocket, state: SharedState, addr: SocketAddr) {
    let ip = addr.ip().to_string();
    let (mut ws_sink, mut ws_stream) = socket.split();

    // ── Auth phase ─────────────────────────────────────────────────
    let authed = tokio::time::timeout(AUTH_PHASE_TIMEOUT, async {
        while let Some(Ok(msg)) = ws_stream.next().await {
            let Message::Text(text) = msg else { continue };
            let Ok(envelope) = serde_json::from_str::<ClientEnvelope>(&text) else {
                tracing::debug!(ip = %ip, "unparseable pre-auth envelope");
                continue;
            };
            match envelope.body {
                ClientPayload::RegisterDevice(reg) => {
                    if state.auth_limiter.is_limited(&ip, Utc::now()) {
                        send_auth_failed(&mut ws_sink, AuthFailReason::RateLimited).await;
                        return None;
                    }
                    match state.identity.register(
                        &reg.invite_token,
                        &reg.label,
                        &reg.fingerprint,
                        Utc::now(),
                    ) {
                        Ok(cred) => {
                            let reply = ServerEnvelope::new(ServerPayload::DeviceRegistered(
                                DeviceRegistered {
                                    device_id: cred.device_id,
                                    device_secret: cred.device_secret,
                                },
                            ));
                            let _ = send_json(&mut ws_sink, &reply).await;
                            // The device now re-auths with its new pair.
                        }
                        Err(reason) => {
                            state.auth_limiter.record_failure(&ip, Utc::now());
                            send_auth_failed(&mut ws_sink, reason).await;
                            return None;
                        }
                    }
                }
                ClientPayload::Auth(auth) => {
                    if state.auth_limiter.is_limited(&ip, Utc::now()) {
                        send_auth_failed(&mut ws_sink, AuthFailReason::RateLimited).await;
                        return None;
                    }
                    match state.identity.authenticate(
                        &auth.device_id,
                        &auth.device_secret,
                        &auth.fingerprint,
                    ) {
                        Ok(record) => {
                            let reply = ServerEnvelope::new(ServerPayload::Auth(AuthOk {
                                success: true,
                                user_id: record.user_id.clone(),
                            }));
                            let _ = send_json(&mut ws_sink, &reply).await;
                            return Some((record, auth.device_name, auth.facts));
                        }
                        Err(reason) => {
                            state.auth_limiter.record_failure(&ip, Utc::now());
                            send_auth_failed(&mut ws_sink, reason).await;
                            return None;
                        }
                    }
                }
                _ => {
                    tracing::debug!(ip = %ip, "ignoring envelope before auth");
                }
            }
        }
        None
    })
    .await;

    let Ok(Some((record, device_name, facts))) = authed else {
        tracing::info!(ip = %ip, "connection closed without auth");
        return;
    };
    let device_id = record.device_id.clone();

    // ── Session assembly ───────────────────────────────────────────
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<ServerEnvelope>(256);
    state.sessions.register(Session {
        device_id: device_id.clone(),
        user_id: record.user_id.clone(),
        label: device_name,
        facts,
        connected_at: Utc::now(),
        last_seen: Utc::now(),
        sink: outbound_tx,
    });

    let orchestrator = assemble_orchestrator(&state, &device_id, &record.user_id);

    // Writer task: serialize outbound envelopes onto the socket.
    let writer = tokio::spawn(async move {
        while let Some(envelope) = outbound_rx.recv().await {
            if send_json(&mut ws_sink, &envelope).await.is_err() {
                break;
            }
        }
    });

    tracing::info!(device_id = %device_id, user_id = %record.user_id, "device connected");

    // ── Envelope loop ──────────────────────────────────────────────
    while let Some(Ok(msg)) = ws_stream.next().await {
        match msg {
            Message::Text(text) => {
                state.sessions.touch(&device_id);
                match serde_json::from_str::<ClientEnvelope>(&text) {
                    Ok(envelope) => {
                        dispatch(&state, &orchestrator, &device_id, envelope.body).await;
                    }
                    Err(e) => {
                        tracing::debug!(device_id = %device_id, error = %e, "bad envelope");
                    }
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    // ── Cleanup ────────────────────────────────────────────────────
    let failed = state.pending.fail_for_device(&device_id);
    state.mcp.device_disconnected(&device_id).await;
    state.sessions.remove(&device_id);
    writer.abort();
    tracing::info!(
        device_id = %device_id,
        failed_in_flight = failed,
        "device disconnected"
    );
}

fn assemble_orchestrator(
    state: &SharedState,
    device_id: &str,
    user_id: &str,
) -> Arc<Orchestrator> {
    let router = Arc::new(MessageRouter::new());
    let waits = Arc::new(WaitRegistry::new(router.clone()));
    let files: Arc<dyn ClientFiles> = Arc::new(ChannelClientFiles {
        state: state.clone(),
        device_id: device_id.to_string(),
    });
    let navigator = Arc::new(Navigator::new(
        state.collections.clone(),
        state.hints.clone(),
        files,
        state.config.collections.clone(),
        RESEARCH_CACHE_DIR,
    ));
    let dispatcher = Arc::new(ChannelDispatcher {
        sessions: state.sessions.clone(),
        pending: state.pending.clone(),
        device_id: device_id.to_string(),
        mcp: state.mcp.clone(),
        navigator,
    });
    let manifest = Arc::new(DeviceManifest {
        sessions: state.sessions.clone(),
        mcp: state.mcp.clone(),
        device_id: device_id.to_string(),
    });
    let research = Arc::new(ResearchService {
        provider: state
            .providers
            .for_role(dotbot_domain::model::ModelRole::Workhorse)
            .unwrap_or_else(|_| {
                Arc::new(dotbot_providers::scripted::ScriptedProvider::text(
                    "unconfigured",
                    ["no LLM providers are configured on this server"],
                ))
            }),
        dispatcher: dispatcher.clone(),
        manifest,
        router: router.clone(),
        loop_config: LoopConfig::default(),
    });

    Arc::new(Orchestrator {
        device_id: device_id.to_string(),
        user_id: user_id.to_string(),
        providers: state.providers.clone(),
        router,
        waits,
        runtimes: Arc::new(AgentRuntimes::new()),
        dispatcher,
        research,
        sessions: state.sessions.clone(),
        mcp: state.mcp.clone(),
        loop_config: state.config.loops.clone(),
        identity: parking_lot::RwLock::new(IdentityRecord::default()),
    })
}

async fn dispatch(
    state: &SharedState,
    orchestrator: &Arc<Orchestrator>,
    device_id: &str,
    payload: ClientPayload,
) {
    match payload {
        ClientPayload::Ping {} => {
            send_to_device(state, device_id, ServerPayload::Pong {}).await;
        }
        ClientPayload::Prompt(prompt) => {
            let orchestrator = orchestrator.clone();
            let state = state.clone();
            let device_id = device_id.to_string();
            tokio::spawn(async move {
                let response = orchestrator.run(&prompt.prompt).await;
                send_to_device(&state, &device_id, ServerPayload::Response(response)).await;
            });
        }
        ClientPayload::RequestResult(result) => {
            state.pending.complete(result);
        }
        ClientPayload::CredentialSessionRequest(req) => {
            if req.allowed_domain.trim().is_empty() {
                // Domain scoping is mandatory; a domainless credential
                // could be replayed anywhere.
                tracing::error!(key_name = %req.key_name, "credential session without allowed_domain");
                return;
            }
            let user_id = state
                .sessions
                .user_of(device_id)
                .unwrap_or_else(|| "default".into());
            let session = state.entry_sessions.create(
                &user_id,
                device_id,
                &req.key_name,
                &req.prompt,
                &req.title,
                &req.allowed_domain,
                Utc::now(),
            );
            let entry_url = format!(
                "{}/credentials/enter/{}",
                state.config.listen.public_url.trim_end_matches('/'),
                session.token
            );
            send_to_device(
                state,
                device_id,
                ServerPayload::CredentialSessionReady(CredentialSessionReady {
                    correlation_id: req.correlation_id,
                    entry_url,
                    expires_at: session.expires_at.timestamp_millis(),
                }),
            )
            .await;
        }
        ClientPayload::CredentialResolve(req) => {
            let response = match state.cipher.decrypt(&req.encrypted_blob, None) {
                Ok(value) => CredentialResolveResponse {
                    correlation_id: req.correlation_id,
                    value: Some(value),
                    error: None,
                },
                Err(e) => CredentialResolveResponse {
                    correlation_id: req.correlation_id,
                    value: None,
                    error: Some(e.to_string()),
                },
            };
            send_to_device(
                state,
                device_id,
                ServerPayload::CredentialResolveResponse(response),
            )
            .await;
        }
        ClientPayload::CredentialProxy(req) => {
            let state = state.clone();
            let device_id = device_id.to_string();
            tokio::spawn(async move {
                let result = state
                    .proxy
                    .call(&device_id, &req.key_name, &req.request)
                    .await;
                send_to_device(
                    &state,
                    &device_id,
                    ServerPayload::CredentialProxyResponse(CredentialProxyResponse {
                        correlation_id: req.correlation_id,
                        ok: result.ok,
                        status: result.status,
                        headers: result.headers,
                        body: result.body,
                        error: result.error,
                    }),
                )
                .await;
            });
        }
        ClientPayload::LlmCall(call) => {
            let state = state.clone();
            let device_id = device_id.to_string();
            tokio::spawn(async move {
                let response = relay_llm_call(&state, &call).await;
                send_to_device(&state, &device_id, ServerPayload::LlmCallResponse(response))
                    .await;
            });
        }
        ClientPayload::McpConfigs(configs) => {
            state.mcp.configs_received(device_id, configs.servers);
        }
        ClientPayload::CancelBeforeRestart(req) => {
            let prompts = orchestrator.cancel_all();
            send_to_device(
                state,
                device_id,
                ServerPayload::CancelBeforeRestartAck(CancelBeforeRestartAck {
                    correlation_id: req.correlation_id,
                    cancelled: prompts.len(),
                    prompts,
                }),
            )
            .await;
        }
        ClientPayload::RegisterDevice(_) | ClientPayload::Auth(_) => {
            tracing::debug!(device_id = %device_id, "ignoring re-auth on live session");
        }
    }
}

/// Relay a client-requested LLM call through the provider registry.
async fn relay_llm_call(
    state: &SharedState,
    call: &dotbot_protocol::LlmCall,
) -> LlmCallResponse {
    let provider = match state
        .providers
        .for_role(dotbot_domain::model::ModelRole::Workhorse)
    {
        Ok(p) => p,
        Err(e) => {
            return LlmCallResponse {
                correlation_id: call.correlation_id.clone(),
                content: format!("no provider available: {e}"),
                tool_calls: Vec::new(),
                usage: None,
                model: call.model.clone(),
                provider: call.provider.clone(),
            }
        }
    };

    let messages: Vec<ChatMessage> = call
        .messages
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|m| {
                    let role = m.get("role")?.as_str()?;
                    let content = m.get("content")?.as_str()?;
                    Some(match role {
                        "system" => ChatMessage::system(content),
                        "assistant" => ChatMessage::assistant(content),
                        _ => ChatMessage::user(content),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    match provider
        .chat(ChatRequest {
            messages,
            tools: Vec::new(),
            temperature: None,
            max_tokens: None,
            model: Some(call.model.clone()),
        })
        .await
    {
        Ok(response) => LlmCallResponse {
            correlation_id: call.correlation_id.clone(),
            content: response.content,
            tool_calls: Vec::new(),
            usage: response
                .usage
                .and_then(|u| serde_json::to_value(u).ok()),
            model: response.model,
            provider: call.provider.clone(),
        },
        Err(e) => LlmCallResponse {
            correlation_id: call.correlation_id.clone(),
            content: format!("LLM call failed: {e}"),
            tool_calls: Vec::new(),
            usage: None,
            model: call.model.clone(),
            provider: call.provider.clone(),
        },
    }
}

async fn send_to_device(state: &SharedState, device_id: &str, payload: ServerPayload) {
    if let Some(sink) = state.sessions.get_sink(device_id) {
        let _ = sink.send(ServerEnvelope::new(payload)).await;
    }
}

async fn send_auth_failed(
    sink: &mut (impl SinkExt<Message> + Unpin),
    reason: AuthFailReason,
) {
    let envelope = ServerEnvelope::new(ServerPayload::AuthFailed(AuthFailed {
        reason,
        message: Some(reason.remediation().to_string()),
    }));
    let _ = send_json(sink, &envelope).await;
}

async fn send_json<T: serde::Serialize>(
    sink: &mut (impl SinkExt<Message> + Unpin),
    payload: &T,
) -> Result<(), ()> {
    let json = serde_json::to_string(payload).map_err(|_| ())?;
    sink.send(Message::Text(json)).await.map_err(|_| ())
}

/// Client filesystem access for the collection cache, over the channel.
/// Writes are fire-and-forget (the reply, if any, has no pending entry
/// and is dropped); reads wait up to 30 s.
struct ChannelClientFiles {
    state: SharedState,
    device_id: String,
}

#[async_trait::async_trait]
impl ClientFiles for ChannelClientFiles {
    async fn write_file(&self, path: &str, content: &str) {
        if let Some(sink) = self.state.sessions.get_sink(&self.device_id) {
            let envelope = ServerEnvelope::new(ServerPayload::ExecutionRequest(AgentRequest {
                correlation_id: uuid::Uuid::new_v4().to_string(),
                name: Some("filesystem.create_file".into()),
                args: Some(serde_json::json!({ "path": path, "content": content })),
            }));
            let _ = sink.send(envelope).await;
        }
    }

    async fn read_file(&self, path: &str) -> dotbot_domain::Result<String> {
        let result = self
            .state
            .pending
            .call(
                &self.state.sessions,
                &self.device_id,
                |correlation_id| {
                    ServerPayload::ExecutionRequest(AgentRequest {
                        correlation_id,
                        name: Some("filesystem.read_file".into()),
                        args: Some(serde_json::json!({ "path": path })),
                    })
                },
                Duration::from_secs(30),
            )
            .await;
        result
            .and_then(|r| r.result)
            .and_then(|v| v.as_str().map(String::from))
            .ok_or_else(|| {
                dotbot_domain::Error::Infrastructure(format!(
                    "could not read cached file {path} from the device"
                ))
            })
    }
}
