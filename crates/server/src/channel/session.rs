//! In-memory registry of connected device sessions.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;

use dotbot_domain::tool::ToolDefinition;
use dotbot_protocol::{DeviceFacts, ServerEnvelope};

/// Channel into a device's WS writer task.
pub type DeviceSink = mpsc::Sender<ServerEnvelope>;

/// One authenticated device connection.
pub struct Session {
    pub device_id: String,
    pub user_id: String,
    pub label: String,
    /// Declared platform, tool manifest, temp dir.
    pub facts: DeviceFacts,
    pub connected_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub sink: DeviceSink,
}

/// Summary returned by list endpoints and the admin CLI.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub device_id: String,
    pub user_id: String,
    pub label: String,
    pub platform: String,
    pub tool_count: usize,
    pub connected_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Thread-safe registry of all connected device sessions.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Session>>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Register a session. Replaces any existing session with the same
    /// device id (reconnect scenario).
    pub fn register(&self, session: Session) {
        let id = session.device_id.clone();
        tracing::info!(
            device_id = %id,
            user_id = %session.user_id,
            tools = session.facts.capabilities.len(),
            "session registered"
        );
        self.sessions.write().insert(id, session);
    }

    /// Remove a session (on disconnect).
    pub fn remove(&self, device_id: &str) {
        if self.sessions.write().remove(device_id).is_some() {
            tracing::info!(device_id = %device_id, "session removed");
        }
    }

    /// Update the last_seen timestamp (on any inbound envelope).
    pub fn touch(&self, device_id: &str) {
        if let Some(s) = self.sessions.write().get_mut(device_id) {
            s.last_seen = Utc::now();
        }
    }

    pub fn get_sink(&self, device_id: &str) -> Option<DeviceSink> {
        self.sessions.read().get(device_id).map(|s| s.sink.clone())
    }

    pub fn user_of(&self, device_id: &str) -> Option<String> {
        self.sessions.read().get(device_id).map(|s| s.user_id.clone())
    }

    /// The tool manifest the device currently exposes.
    pub fn manifest(&self, device_id: &str) -> Vec<ToolDefinition> {
        self.sessions
            .read()
            .get(device_id)
            .map(|s| s.facts.capabilities.clone())
            .unwrap_or_default()
    }

    pub fn is_connected(&self, device_id: &str) -> bool {
        self.sessions.read().contains_key(device_id)
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        self.sessions
            .read()
            .values()
            .map(|s| SessionInfo {
                device_id: s.device_id.clone(),
                user_id: s.user_id.clone(),
                label: s.label.clone(),
                platform: s.facts.platform.clone(),
                tool_count: s.facts.capabilities.len(),
                connected_at: s.connected_at,
                last_seen: s.last_seen,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Register a bare session and return the receiving end of its sink.
    pub fn connect_fake_device(
        registry: &SessionRegistry,
        device_id: &str,
        user_id: &str,
    ) -> mpsc::Receiver<ServerEnvelope> {
        let (tx, rx) = mpsc::channel(64);
        registry.register(Session {
            device_id: device_id.into(),
            user_id: user_id.into(),
            label: "test".into(),
            facts: DeviceFacts::default(),
            connected_at: Utc::now(),
            last_seen: Utc::now(),
            sink: tx,
        });
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_replaces_duplicate() {
        let reg = SessionRegistry::new();
        let _rx1 = test_support::connect_fake_device(&reg, "dev-1", "u");
        let _rx2 = test_support::connect_fake_device(&reg, "dev-1", "u");
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn remove_and_lookup() {
        let reg = SessionRegistry::new();
        let _rx = test_support::connect_fake_device(&reg, "dev-1", "user-9");
        assert!(reg.is_connected("dev-1"));
        assert_eq!(reg.user_of("dev-1").as_deref(), Some("user-9"));
        reg.remove("dev-1");
        assert!(!reg.is_connected("dev-1"));
        assert!(reg.get_sink("dev-1").is_none());
    }
}
