//! Request/response correlation for server-initiated calls into devices.
//!
//! Fire-and-forget transport underneath: the caller records a oneshot
//! keyed by a payload-level correlation id, sends the envelope, and
//! awaits. Timeouts resolve to `None` — "no answer, move on" — never an
//! error, so a dead device cannot crash a tool loop. Responses with no
//! pending entry are dropped silently.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use dotbot_protocol::{RequestResult, ServerEnvelope, ServerPayload};

use super::session::SessionRegistry;

/// Default ceiling for server-initiated calls into the local agent.
pub const SERVER_CALL_TIMEOUT: Duration = Duration::from_secs(600);

struct PendingRequest {
    device_id: String,
    tx: oneshot::Sender<RequestResult>,
}

pub struct PendingMap {
    pending: Mutex<HashMap<String, PendingRequest>>,
}

impl Default for PendingMap {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingMap {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Send a request envelope to a device and await its answer.
    ///
    /// `make_payload` receives the generated correlation id and builds the
    /// outbound payload. Returns `None` when the device is missing, the
    /// send fails, or the timeout elapses.
    pub async fn call(
        &self,
        sessions: &SessionRegistry,
        device_id: &str,
        make_payload: impl FnOnce(String) -> ServerPayload,
        timeout: Duration,
    ) -> Option<RequestResult> {
        let correlation_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(
            correlation_id.clone(),
            PendingRequest {
                device_id: device_id.to_string(),
                tx,
            },
        );

        let Some(sink) = sessions.get_sink(device_id) else {
            self.pending.lock().remove(&correlation_id);
            return None;
        };

        let envelope = ServerEnvelope::new(make_payload(correlation_id.clone()));
        if sink.send(envelope).await.is_err() {
            self.pending.lock().remove(&correlation_id);
            return None;
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => Some(result),
            // Channel dropped — device disconnected mid-flight.
            Ok(Err(_)) => None,
            Err(_) => {
                self.pending.lock().remove(&correlation_id);
                tracing::warn!(
                    device_id = %device_id,
                    correlation_id = %correlation_id,
                    timeout_secs = timeout.as_secs(),
                    "server-initiated request timed out"
                );
                None
            }
        }
    }

    /// Called by the WS reader when a device answers.
    pub fn complete(&self, result: RequestResult) {
        let correlation_id = result.correlation_id.clone();
        if let Some(pending) = self.pending.lock().remove(&correlation_id) {
            let _ = pending.tx.send(result);
        } else {
            tracing::debug!(
                correlation_id = %correlation_id,
                "dropping response with no pending entry"
            );
        }
    }

    /// Fail all pending requests for a device (on disconnect).
    /// Returns the number of requests failed.
    pub fn fail_for_device(&self, device_id: &str) -> usize {
        let mut pending = self.pending.lock();
        let keys: Vec<String> = pending
            .iter()
            .filter(|(_, p)| p.device_id == device_id)
            .map(|(k, _)| k.clone())
            .collect();
        let count = keys.len();
        for key in keys {
            // Dropping the sender resolves the awaiting caller's oneshot
            // with an error, which `call` maps to `None`.
            pending.remove(&key);
        }
        if count > 0 {
            tracing::warn!(
                device_id = %device_id,
                failed = count,
                "failed in-flight requests for disconnected device"
            );
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}
