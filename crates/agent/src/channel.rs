//! The persistent channel to the server: connect, authenticate (or
//! register), keep alive, dispatch inbound envelopes, and reconnect with
//! backoff until the circuit breaker gives up.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message as WsMessage;

use dotbot_protocol::{
    AuthRequest, ClientEnvelope, ClientPayload, DeviceFacts, Prompt, RegisterDevice,
    RequestResult, ServerEnvelope, ServerPayload,
};

use crate::identity::{hardware_fingerprint, DeviceCredential};
use crate::periodic::ActivityTracker;
use crate::reconnect::{CircuitBreaker, NextStep};
use crate::restart::{RestartQueue, RESUME_PREFIX};
use crate::tools::ToolRegistry;
use crate::vault::Vault;
use crate::{envfile, AgentPaths};

/// Keepalive cadence.
const PING_INTERVAL: Duration = Duration::from_secs(30);
/// Client-initiated request timeout.
const CALL_TIMEOUT: Duration = Duration::from_secs(120);
/// Ceiling on the pre-restart cancel handshake.
const CANCEL_ACK_TIMEOUT: Duration = Duration::from_secs(3);
/// Transport-level dedupe window (envelope ids).
const DEDUPE_CAPACITY: usize = 1024;

/// Why the channel loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// Clean shutdown requested by the user.
    Normal,
    /// Fatal auth or circuit breaker: exit 1, do not auto-restart.
    Permanent(String),
    /// Exit 42: launcher, restart me.
    Restart,
}

/// Rendered events for the front-end (CLI lines, Discord forwards).
#[derive(Debug, Clone)]
pub enum UiEvent {
    Line(String),
    Final(String),
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Correlation for client-initiated calls
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Pending client → server calls, keyed by payload correlation id.
/// Timeouts resolve `None`; responses nobody waits for are dropped.
#[derive(Default)]
pub struct ClientPending {
    map: Mutex<HashMap<String, oneshot::Sender<ServerPayload>>>,
}

impl ClientPending {
    pub fn register(&self, correlation_id: &str) -> oneshot::Receiver<ServerPayload> {
        let (tx, rx) = oneshot::channel();
        self.map.lock().insert(correlation_id.to_string(), tx);
        rx
    }

    pub fn complete(&self, correlation_id: &str, payload: ServerPayload) {
        if let Some(tx) = self.map.lock().remove(correlation_id) {
            let _ = tx.send(payload);
        } else {
            tracing::debug!(correlation_id, "response with no pending entry dropped");
        }
    }

    pub fn forget(&self, correlation_id: &str) {
        self.map.lock().remove(correlation_id);
    }
}

/// The correlation id inside a server payload, when it answers a
/// client-initiated call.
pub fn correlation_of(payload: &ServerPayload) -> Option<&str> {
    match payload {
        ServerPayload::CredentialSessionReady(p) => Some(&p.correlation_id),
        ServerPayload::CredentialResolveResponse(p) => Some(&p.correlation_id),
        ServerPayload::CredentialProxyResponse(p) => Some(&p.correlation_id),
        ServerPayload::LlmCallResponse(p) => Some(&p.correlation_id),
        ServerPayload::CancelBeforeRestartAck(p) => Some(&p.correlation_id),
        _ => None,
    }
}

/// Transport-level dedupe: remembers recent envelope ids.
pub struct DedupeWindow {
    seen: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl DedupeWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            seen: HashSet::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    /// True when the id is fresh; duplicates return false.
    pub fn check(&mut self, id: &str) -> bool {
        if self.seen.contains(id) {
            return false;
        }
        self.seen.insert(id.to_string());
        self.order.push_back(id.to_string());
        if self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.seen.remove(&old);
            }
        }
        true
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ChannelClient
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ChannelClient {
    pub paths: AgentPaths,
    pub server_url: String,
    pub device_name: String,
    pub invite_token: Option<String>,
    pub temp_dir: Option<String>,
    pub registry: ToolRegistry,
    pub vault: Arc<Vault>,
    pub activity: Arc<ActivityTracker>,
    pub pending: Arc<ClientPending>,
    pub ui: mpsc::Sender<UiEvent>,
    /// Set while a connection is live; prompts submitted through here.
    outbound: Arc<Mutex<Option<mpsc::Sender<ClientEnvelope>>>>,
    /// Restart requests raised by tool dispatch (`system.restart`).
    restart_flag: Arc<tokio_util::sync::CancellationToken>,
}

impl ChannelClient {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        paths: AgentPaths,
        server_url: String,
        device_name: String,
        invite_token: Option<String>,
        temp_dir: Option<String>,
        registry: ToolRegistry,
        vault: Arc<Vault>,
        activity: Arc<ActivityTracker>,
        ui: mpsc::Sender<UiEvent>,
    ) -> Self {
        Self {
            paths,
            server_url,
            device_name,
            invite_token,
            temp_dir,
            registry,
            vault,
            activity,
            pending: Arc::new(ClientPending::default()),
            ui,
            outbound: Arc::new(Mutex::new(None)),
            restart_flag: Arc::new(tokio_util::sync::CancellationToken::new()),
        }
    }

    /// Submit a user prompt over the channel.
    pub async fn send_prompt(&self, text: &str, source: &str) -> bool {
        let sink = self.outbound.lock().clone();
        match sink {
            Some(sink) => sink
                .send(ClientEnvelope::new(ClientPayload::Prompt(Prompt {
                    prompt: text.to_string(),
                    source: source.to_string(),
                    hints: None,
                    source_user_id: None,
                })))
                .await
                .is_ok(),
            None => false,
        }
    }

    /// Run the channel until a terminal exit reason.
    pub async fn run(self: Arc<Self>) -> ExitReason {
        let mut breaker = CircuitBreaker::new();
        loop {
            match self.connect_once(&mut breaker).await {
                Ok(SessionEnd::Disconnected) => {
                    // Transient: fall through to backoff.
                }
                Ok(SessionEnd::Restart) => return ExitReason::Restart,
                Err(reason) => return reason,
            }

            match breaker.on_failure(Utc::now()) {
                NextStep::Retry(delay) => {
                    tracing::info!(
                        attempt = breaker.attempts(),
                        delay_secs = delay.as_secs(),
                        "reconnecting"
                    );
                    tokio::time::sleep(delay).await;
                }
                NextStep::GiveUp => {
                    return ExitReason::Permanent(
                        "connection failed continuously for over an hour".into(),
                    );
                }
                NextStep::AskForRestart => return ExitReason::Restart,
            }
        }
    }

    async fn connect_once(
        self: &Arc<Self>,
        breaker: &mut CircuitBreaker,
    ) -> Result<SessionEnd, ExitReason> {
        tracing::info!(url = %self.server_url, "connecting");
        let (ws, _) = match tokio_tungstenite::connect_async(&self.server_url).await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!(error = %e, "connect failed");
                return Ok(SessionEnd::Disconnected);
            }
        };
        let (mut sink, mut stream) = ws.split();
        let fingerprint = hardware_fingerprint();
        let facts = DeviceFacts {
            platform: std::env::consts::OS.to_string(),
            capabilities: self.registry.manifest(),
            temp_dir: self.temp_dir.clone(),
        };

        // ── Register if we have no credential yet ──────────────────
        let mut credential = DeviceCredential::load(&self.paths.device_file());
        if credential.is_none() {
            let Some(token) = self.invite_token.clone() else {
                return Err(ExitReason::Permanent(
                    "no device credential and no DOTBOT_INVITE_TOKEN in ~/.bot/.env".into(),
                ));
            };
            let register = ClientEnvelope::new(ClientPayload::RegisterDevice(RegisterDevice {
                invite_token: token,
                label: self.device_name.clone(),
                fingerprint: fingerprint.clone(),
                facts: facts.clone(),
            }));
            if send_envelope(&mut sink, &register).await.is_err() {
                return Ok(SessionEnd::Disconnected);
            }
            match wait_for_reply(&mut stream).await {
                Some(ServerPayload::DeviceRegistered(registered)) => {
                    let fresh = DeviceCredential {
                        device_id: registered.device_id,
                        device_secret: registered.device_secret,
                        server_url: self.server_url.clone(),
                        label: self.device_name.clone(),
                        registered_at: Utc::now(),
                    };
                    if let Err(e) = fresh.save(&self.paths.device_file()) {
                        return Err(ExitReason::Permanent(format!(
                            "could not persist device.json: {e}"
                        )));
                    }
                    // The invite is consumed; drop it from .env so the
                    // next start doesn't try to redeem it again.
                    let _ = envfile::remove_key(&self.paths.env_file(), "DOTBOT_INVITE_TOKEN");
                    tracing::info!(device_id = %fresh.device_id, "device registered");
                    credential = Some(fresh);
                }
                Some(ServerPayload::AuthFailed(failed)) => {
                    return Err(ExitReason::Permanent(format!(
                        "registration rejected ({:?}).\n{}",
                        failed.reason,
                        failed.message.unwrap_or_default()
                    )));
                }
                _ => return Ok(SessionEnd::Disconnected),
            }
        }
        let credential = credential.expect("credential present after registration");

        // ── Authenticate ───────────────────────────────────────────
        let auth = ClientEnvelope::new(ClientPayload::Auth(AuthRequest {
            device_id: credential.device_id.clone(),
            device_secret: credential.device_secret.clone(),
            device_name: self.device_name.clone(),
            fingerprint,
            facts,
        }));
        if send_envelope(&mut sink, &auth).await.is_err() {
            return Ok(SessionEnd::Disconnected);
        }
        match wait_for_reply(&mut stream).await {
            Some(ServerPayload::Auth(ok)) if ok.success => {
                tracing::info!(user_id = %ok.user_id, "authenticated");
            }
            Some(ServerPayload::AuthFailed(failed)) => {
                return Err(ExitReason::Permanent(format!(
                    "authentication failed ({:?}).\n{}",
                    failed.reason,
                    failed.message.unwrap_or_default()
                )));
            }
            _ => return Ok(SessionEnd::Disconnected),
        }
        breaker.on_established();

        // ── Live session ───────────────────────────────────────────
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<ClientEnvelope>(256);
        *self.outbound.lock() = Some(outbound_tx.clone());

        let writer = tokio::spawn(async move {
            while let Some(envelope) = outbound_rx.recv().await {
                if send_envelope(&mut sink, &envelope).await.is_err() {
                    break;
                }
            }
        });

        // Keepalive ping every 30 s. Pings never count as activity.
        let ping_tx = outbound_tx.clone();
        let pinger = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PING_INTERVAL);
            loop {
                ticker.tick().await;
                if ping_tx
                    .send(ClientEnvelope::new(ClientPayload::Ping {}))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });

        // Re-submit prompts queued before the last restart (once).
        let queue = RestartQueue::new(self.paths.restart_queue_file());
        for prompt in queue.take() {
            let _ = outbound_tx
                .send(ClientEnvelope::new(ClientPayload::Prompt(Prompt {
                    prompt: format!("{RESUME_PREFIX}{prompt}"),
                    source: "restart-queue".into(),
                    hints: None,
                    source_user_id: None,
                })))
                .await;
        }

        // ── Reader loop ────────────────────────────────────────────
        let mut dedupe = DedupeWindow::new(DEDUPE_CAPACITY);
        let end = loop {
            tokio::select! {
                _ = self.restart_flag.cancelled() => {
                    self.before_restart(&outbound_tx).await;
                    break SessionEnd::Restart;
                }
                frame = stream.next() => {
                    let Some(Ok(msg)) = frame else { break SessionEnd::Disconnected };
                    let WsMessage::Text(text) = msg else { continue };
                    let envelope: ServerEnvelope = match serde_json::from_str(&text) {
                        Ok(e) => e,
                        Err(e) => {
                            tracing::debug!(error = %e, "bad inbound envelope");
                            continue;
                        }
                    };
                    if !dedupe.check(&envelope.id) {
                        continue;
                    }
                    if counts_as_activity(&envelope.body) {
                        self.activity.notify_activity();
                    }
                    self.dispatch(envelope.body, &outbound_tx).await;
                }
            }
        };

        *self.outbound.lock() = None;
        pinger.abort();
        writer.abort();
        Ok(end)
    }

    /// Ask the server to cancel in-flight work, persist the prompts, and
    /// let `run` exit 42. The 3-second ceiling is absolute — if the ack
    /// doesn't arrive we restart anyway.
    async fn before_restart(&self, outbound: &mpsc::Sender<ClientEnvelope>) {
        let correlation_id = uuid::Uuid::new_v4().to_string();
        let rx = self.pending.register(&correlation_id);
        let sent = outbound
            .send(ClientEnvelope::new(ClientPayload::CancelBeforeRestart(
                dotbot_protocol::CancelBeforeRestart {
                    correlation_id: correlation_id.clone(),
                },
            )))
            .await
            .is_ok();

        if sent {
            if let Ok(Ok(ServerPayload::CancelBeforeRestartAck(ack))) =
                tokio::time::timeout(CANCEL_ACK_TIMEOUT, rx).await
            {
                let queue = RestartQueue::new(self.paths.restart_queue_file());
                if let Err(e) = queue.write(&ack.prompts) {
                    tracing::error!(error = %e, "failed to write restart queue");
                } else if !ack.prompts.is_empty() {
                    tracing::info!(prompts = ack.prompts.len(), "restart queue written");
                }
                return;
            }
        }
        self.pending.forget(&correlation_id);
        tracing::warn!("no cancel ack within 3s, restarting anyway");
    }

    /// Trip the restart flow (invoked by the `system.restart` tool).
    pub fn request_restart(&self) {
        self.restart_flag.cancel();
    }

    async fn dispatch(
        self: &Arc<Self>,
        payload: ServerPayload,
        outbound: &mpsc::Sender<ClientEnvelope>,
    ) {
        if let Some(correlation_id) = correlation_of(&payload) {
            let correlation_id = correlation_id.to_string();
            self.pending.complete(&correlation_id, payload);
            return;
        }

        match payload {
            ServerPayload::Pong {} => {}
            ServerPayload::ExecutionRequest(req) | ServerPayload::ToolRequest(req) => {
                let name = req.name.clone().unwrap_or_default();
                if name == "system.restart" {
                    let _ = self
                        .reply(
                            outbound,
                            RequestResult {
                                correlation_id: req.correlation_id.clone(),
                                success: true,
                                result: Some(serde_json::json!("restarting")),
                                error: None,
                            },
                        )
                        .await;
                    self.request_restart();
                    return;
                }
                let client = self.clone();
                let outbound = outbound.clone();
                tokio::spawn(async move {
                    let result = client
                        .registry
                        .execute(&name, req.args.unwrap_or(serde_json::Value::Null))
                        .await;
                    let _ = client
                        .reply(
                            &outbound,
                            RequestResult {
                                correlation_id: req.correlation_id,
                                success: result.success,
                                result: Some(result.result),
                                error: result.error,
                            },
                        )
                        .await;
                });
            }
            ServerPayload::VaultRequest(req) => {
                let key_name = req.name.clone().unwrap_or_default();
                let blob = self.vault.blob(&key_name);
                let _ = self
                    .reply(
                        outbound,
                        RequestResult {
                            correlation_id: req.correlation_id,
                            success: blob.is_some(),
                            result: blob.map(serde_json::Value::String),
                            error: None,
                        },
                    )
                    .await;
            }
            ServerPayload::CredentialStored(stored) => {
                self.vault.store(&stored.key_name, &stored.encrypted_blob);
                let _ = self
                    .ui
                    .send(UiEvent::Line(format!(
                        "✔ credential '{}' stored",
                        stored.key_name
                    )))
                    .await;
            }
            ServerPayload::ThreadUpdate(update) | ServerPayload::SaveToThread(update) => {
                self.append_thread(&update);
            }
            ServerPayload::TaskAcknowledged(ack) => {
                let _ = self
                    .ui
                    .send(UiEvent::Line(format!(
                        "{} ({})",
                        ack.acknowledgment, ack.estimated_label
                    )))
                    .await;
            }
            ServerPayload::AgentStarted(event) => {
                let _ = self
                    .ui
                    .send(UiEvent::Line(format!("▶ [{}] {}", event.agent_id, event.topic)))
                    .await;
            }
            ServerPayload::AgentComplete(event) => {
                let _ = self
                    .ui
                    .send(UiEvent::Line(format!("■ [{}] {}", event.agent_id, event.topic)))
                    .await;
            }
            ServerPayload::TaskProgress(event) => {
                if let Some(detail) = event.detail {
                    let _ = self
                        .ui
                        .send(UiEvent::Line(format!("… [{}] {detail}", event.agent_id)))
                        .await;
                }
            }
            ServerPayload::StreamChunk(chunk) => {
                let _ = self.ui.send(UiEvent::Line(chunk.text)).await;
            }
            ServerPayload::Response(response) => {
                let _ = self.ui.send(UiEvent::Final(response.text)).await;
            }
            ServerPayload::UserNotification(notification) => {
                let _ = self
                    .ui
                    .send(UiEvent::Line(format!(
                        "🔔 {}: {}",
                        notification.title, notification.body
                    )))
                    .await;
            }
            ServerPayload::RunLog(log) => {
                let dir = crate::runlog::RunLogDir::new(self.paths.run_logs_dir());
                let entries: Vec<crate::runlog::RunLogEntry> = log
                    .entries
                    .into_iter()
                    .map(|detail| crate::runlog::RunLogEntry {
                        at: Utc::now(),
                        kind: "server".into(),
                        detail,
                    })
                    .collect();
                if let Err(e) = dir.write(&log.agent_id, &entries) {
                    tracing::warn!(error = %e, "run log write failed");
                }
            }
            ServerPayload::SaveAgentWork(work) => {
                let path = self
                    .paths
                    .research_cache_dir()
                    .join(format!("{}.md", work.agent_id));
                if let Some(parent) = path.parent() {
                    let _ = std::fs::create_dir_all(parent);
                }
                let _ = std::fs::write(path, format!("# {}\n\n{}", work.topic, work.content));
            }
            // Memory-routed requests belong to the local store collaborator;
            // without one registered we answer honestly.
            ServerPayload::SchemaRequest(req)
            | ServerPayload::MemoryRequest(req)
            | ServerPayload::SkillRequest(req)
            | ServerPayload::PersonaRequest(req)
            | ServerPayload::CouncilRequest(req)
            | ServerPayload::KnowledgeRequest(req)
            | ServerPayload::KnowledgeQuery(req)
            | ServerPayload::ThreadRequest(req)
            | ServerPayload::StoreAsset(req)
            | ServerPayload::RetrieveAsset(req)
            | ServerPayload::CleanupAssets(req) => {
                let _ = self
                    .reply(
                        outbound,
                        RequestResult {
                            correlation_id: req.correlation_id,
                            success: false,
                            result: None,
                            error: Some("no memory store handler registered".into()),
                        },
                    )
                    .await;
            }
            ServerPayload::DeviceRegistered(_)
            | ServerPayload::Auth(_)
            | ServerPayload::AuthFailed(_)
            | ServerPayload::CredentialSessionReady(_)
            | ServerPayload::CredentialResolveResponse(_)
            | ServerPayload::CredentialProxyResponse(_)
            | ServerPayload::LlmCallResponse(_)
            | ServerPayload::CancelBeforeRestartAck(_) => {
                // Correlated payloads land here only when nobody waits.
            }
        }
    }

    async fn reply(
        &self,
        outbound: &mpsc::Sender<ClientEnvelope>,
        result: RequestResult,
    ) -> Result<(), ()> {
        outbound
            .send(ClientEnvelope::new(ClientPayload::RequestResult(result)))
            .await
            .map_err(|_| ())
    }

    fn append_thread(&self, update: &dotbot_protocol::ThreadUpdate) {
        let path: PathBuf = self
            .paths
            .threads_dir()
            .join(format!("{}.json", update.thread_id));
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let mut turns: Vec<serde_json::Value> = std::fs::read_to_string(&path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();
        turns.push(serde_json::json!({
            "role": update.role,
            "text": update.text,
            "topic": update.topic,
            "at": Utc::now().timestamp_millis(),
        }));
        if let Ok(json) = serde_json::to_string_pretty(&turns) {
            let _ = std::fs::write(&path, json);
        }
    }
}

enum SessionEnd {
    Disconnected,
    Restart,
}

/// Ping/pong and auth traffic never counts as user activity.
fn counts_as_activity(payload: &ServerPayload) -> bool {
    !matches!(
        payload,
        ServerPayload::Pong {} | ServerPayload::Auth(_) | ServerPayload::AuthFailed(_)
    )
}

async fn send_envelope(
    sink: &mut (impl SinkExt<WsMessage> + Unpin),
    envelope: &ClientEnvelope,
) -> Result<(), ()> {
    let json = serde_json::to_string(envelope).map_err(|_| ())?;
    sink.send(WsMessage::Text(json)).await.map_err(|_| ())
}

/// Wait for the next parseable server envelope (auth phase).
async fn wait_for_reply(
    stream: &mut (impl StreamExt<
        Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>,
    > + Unpin),
) -> Option<ServerPayload> {
    let deadline = Duration::from_secs(15);
    tokio::time::timeout(deadline, async {
        while let Some(Ok(msg)) = stream.next().await {
            if let WsMessage::Text(text) = msg {
                if let Ok(envelope) = serde_json::from_str::<ServerEnvelope>(&text) {
                    return Some(envelope.body);
                }
            }
        }
        None
    })
    .await
    .unwrap_or(None)
}

/// A client-initiated request/response call with the 2-minute ceiling.
/// Timeout resolves to `None` — callers treat that as "no answer".
pub async fn call(
    pending: &ClientPending,
    outbound: &mpsc::Sender<ClientEnvelope>,
    make_payload: impl FnOnce(String) -> ClientPayload,
) -> Option<ServerPayload> {
    let correlation_id = uuid::Uuid::new_v4().to_string();
    let rx = pending.register(&correlation_id);
    if outbound
        .send(ClientEnvelope::new(make_payload(correlation_id.clone())))
        .await
        .is_err()
    {
        pending.forget(&correlation_id);
        return None;
    }
    match tokio::time::timeout(CALL_TIMEOUT, rx).await {
        Ok(Ok(payload)) => Some(payload),
        _ => {
            pending.forget(&correlation_id);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedupe_window_drops_repeats_and_rolls() {
        let mut window = DedupeWindow::new(2);
        assert!(window.check("a"));
        assert!(!window.check("a"));
        assert!(window.check("b"));
        assert!(window.check("c")); // evicts "a"
        assert!(window.check("a"));
    }

    #[test]
    fn correlation_extraction() {
        let payload = ServerPayload::CredentialSessionReady(
            dotbot_protocol::CredentialSessionReady {
                correlation_id: "corr-1".into(),
                entry_url: "https://x/enter/t".into(),
                expires_at: 0,
            },
        );
        assert_eq!(correlation_of(&payload), Some("corr-1"));
        assert_eq!(correlation_of(&ServerPayload::Pong {}), None);
    }

    #[tokio::test]
    async fn pending_resolves_and_drops_unknown() {
        let pending = ClientPending::default();
        let rx = pending.register("c1");
        pending.complete(
            "c1",
            ServerPayload::Pong {},
        );
        assert!(matches!(rx.await, Ok(ServerPayload::Pong {})));

        // Unknown correlation ids are silently dropped.
        pending.complete("nobody", ServerPayload::Pong {});
    }

    #[test]
    fn activity_classification() {
        assert!(!counts_as_activity(&ServerPayload::Pong {}));
        assert!(counts_as_activity(&ServerPayload::UserNotification(
            dotbot_protocol::UserNotification {
                title: "t".into(),
                body: "b".into(),
                priority: None,
            }
        )));
    }
}
