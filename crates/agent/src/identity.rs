//! Device credential storage and the hardware fingerprint.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// `~/.bot/device.json` — created on first successful registration,
/// loaded at every startup, destroyed only by explicit user action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceCredential {
    pub device_id: String,
    pub device_secret: String,
    /// The server this device was registered against.
    pub server_url: String,
    pub label: String,
    pub registered_at: DateTime<Utc>,
}

impl DeviceCredential {
    pub fn load(path: &Path) -> Option<Self> {
        let raw = std::fs::read_to_string(path).ok()?;
        match serde_json::from_str(&raw) {
            Ok(cred) => Some(cred),
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "device.json is corrupt");
                None
            }
        }
    }

    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
    }
}

/// Stable hardware fingerprint: SHA-256 over machine-level identifiers.
/// Computed once at startup, held in memory only, never surfaced to
/// tools or the LLM.
pub fn hardware_fingerprint() -> String {
    let mut hasher = Sha256::new();
    for source in identifier_sources() {
        hasher.update(source.as_bytes());
        hasher.update(b"\x1f");
    }
    hex::encode(hasher.finalize())
}

fn identifier_sources() -> Vec<String> {
    let mut sources = Vec::new();

    // Machine id (systemd / dbus on Linux).
    for path in ["/etc/machine-id", "/var/lib/dbus/machine-id"] {
        if let Ok(id) = std::fs::read_to_string(path) {
            let id = id.trim();
            if !id.is_empty() {
                sources.push(id.to_string());
                break;
            }
        }
    }

    // Hostname.
    if let Ok(hostname) = std::fs::read_to_string("/proc/sys/kernel/hostname") {
        sources.push(hostname.trim().to_string());
    } else if let Ok(hostname) = std::env::var("HOSTNAME") {
        sources.push(hostname);
    }

    // MAC addresses of physical-looking interfaces, sorted for stability.
    if let Ok(entries) = std::fs::read_dir("/sys/class/net") {
        let mut macs: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name() != "lo")
            .filter_map(|e| std::fs::read_to_string(e.path().join("address")).ok())
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty() && m != "00:00:00:00:00:00")
            .collect();
        macs.sort();
        sources.extend(macs);
    }

    if sources.is_empty() {
        // Last resort so the fingerprint is at least per-user stable.
        sources.push(format!(
            "{}@{}",
            std::env::var("USER").unwrap_or_default(),
            std::env::var("HOME").unwrap_or_default()
        ));
    }
    sources
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credential_round_trips_disk() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("device.json");
        let cred = DeviceCredential {
            device_id: "dev-1".into(),
            device_secret: "s".repeat(128),
            server_url: "wss://bot.example.com/ws".into(),
            label: "laptop".into(),
            registered_at: Utc::now(),
        };
        cred.save(&path).unwrap();
        let loaded = DeviceCredential::load(&path).unwrap();
        assert_eq!(loaded.device_id, "dev-1");
        assert_eq!(loaded.device_secret.len(), 128);
    }

    #[test]
    fn missing_or_corrupt_file_is_none() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(DeviceCredential::load(&dir.path().join("nope.json")).is_none());
        let bad = dir.path().join("bad.json");
        std::fs::write(&bad, "{not json").unwrap();
        assert!(DeviceCredential::load(&bad).is_none());
    }

    #[test]
    fn fingerprint_is_stable_and_hex() {
        let a = hardware_fingerprint();
        let b = hardware_fingerprint();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
