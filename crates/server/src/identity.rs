//! Device identity: invites, device credentials, fingerprint enforcement,
//! and the per-IP failed-auth rate limit.
//!
//! Stores persist as JSON under the configured data directory and load at
//! startup. All mutation happens behind a single `RwLock` per store;
//! writes are flushed synchronously (the files are tiny).

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use dotbot_domain::config::IdentityConfig;
use dotbot_protocol::{format_invite, is_invite_format, AuthFailReason};

/// Constant-time string comparison via SHA-256 digest.
/// Hashing normalizes lengths so ct_eq always compares 32 bytes.
fn digest_eq(a: &str, b: &str) -> bool {
    let ha = Sha256::digest(a.as_bytes());
    let hb = Sha256::digest(b.as_bytes());
    ha.ct_eq(&hb).into()
}

fn sha256_hex(s: &str) -> String {
    hex::encode(Sha256::digest(s.as_bytes()))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Records
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub device_id: String,
    /// SHA-256 hex of the device secret. The plaintext secret exists only
    /// in the `device_registered` reply.
    pub secret_hash: String,
    pub user_id: String,
    pub label: String,
    /// Fingerprint recorded at registration; any later mismatch revokes.
    pub fingerprint: String,
    pub registered_at: DateTime<Utc>,
    #[serde(default)]
    pub revoked: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InviteRecord {
    pub token: String,
    pub label: String,
    pub user_id: String,
    pub max_uses: u32,
    #[serde(default)]
    pub uses: u32,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub revoked: bool,
}

/// A freshly issued credential pair, returned exactly once.
#[derive(Debug, Clone)]
pub struct IssuedCredential {
    pub device_id: String,
    pub device_secret: String,
    pub user_id: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// IdentityStore
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct IdentityStore {
    devices: RwLock<HashMap<String, DeviceRecord>>,
    invites: RwLock<HashMap<String, InviteRecord>>,
    devices_path: PathBuf,
    invites_path: PathBuf,
    invite_expiry_days: i64,
}

impl IdentityStore {
    /// Load (or initialize) the stores under `cfg.data_dir`.
    pub fn open(cfg: &IdentityConfig) -> std::io::Result<Self> {
        let dir = Path::new(&cfg.data_dir);
        std::fs::create_dir_all(dir)?;
        let devices_path = dir.join("devices.json");
        let invites_path = dir.join("invites.json");

        let devices = load_map(&devices_path, |d: &DeviceRecord| d.device_id.clone())?;
        let invites = load_map(&invites_path, |i: &InviteRecord| i.token.clone())?;

        Ok(Self {
            devices: RwLock::new(devices),
            invites: RwLock::new(invites),
            devices_path,
            invites_path,
            invite_expiry_days: cfg.invite_expiry_days,
        })
    }

    fn save_devices(&self) {
        persist_map(&self.devices_path, &self.devices.read());
    }

    fn save_invites(&self) {
        persist_map(&self.invites_path, &self.invites.read());
    }

    // ── Invites ────────────────────────────────────────────────────

    /// Mint a new invite token.
    pub fn create_invite(
        &self,
        label: &str,
        user_id: &str,
        max_uses: u32,
        expiry_days: Option<i64>,
    ) -> InviteRecord {
        let mut indices = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut indices);
        let token = format_invite(&indices);
        let now = Utc::now();
        let record = InviteRecord {
            token: token.clone(),
            label: label.to_string(),
            user_id: user_id.to_string(),
            max_uses: max_uses.max(1),
            uses: 0,
            created_at: now,
            expires_at: now + Duration::days(expiry_days.unwrap_or(self.invite_expiry_days)),
            revoked: false,
        };
        self.invites.write().insert(token, record.clone());
        self.save_invites();
        tracing::info!(label = %record.label, max_uses = record.max_uses, "invite created");
        record
    }

    pub fn list_invites(&self) -> Vec<InviteRecord> {
        let mut out: Vec<_> = self.invites.read().values().cloned().collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        out
    }

    /// Redeem an invite into a fresh device credential.
    pub fn register(
        &self,
        invite_token: &str,
        label: &str,
        fingerprint: &str,
        now: DateTime<Utc>,
    ) -> Result<IssuedCredential, AuthFailReason> {
        if !is_invite_format(invite_token) {
            return Err(AuthFailReason::InvalidToken);
        }

        let user_id = {
            let mut invites = self.invites.write();
            let invite = invites
                .get_mut(invite_token)
                .ok_or(AuthFailReason::InvalidToken)?;
            if invite.revoked {
                return Err(AuthFailReason::TokenRevoked);
            }
            if now > invite.expires_at {
                return Err(AuthFailReason::TokenExpired);
            }
            if invite.uses >= invite.max_uses {
                return Err(AuthFailReason::TokenConsumed);
            }
            invite.uses += 1;
            invite.user_id.clone()
        };
        self.save_invites();

        let device_id = format!("dev-{}", uuid::Uuid::new_v4());
        let mut secret_bytes = [0u8; 64];
        rand::thread_rng().fill_bytes(&mut secret_bytes);
        let device_secret = hex::encode(secret_bytes);

        let record = DeviceRecord {
            device_id: device_id.clone(),
            secret_hash: sha256_hex(&device_secret),
            user_id: user_id.clone(),
            label: label.to_string(),
            fingerprint: fingerprint.to_string(),
            registered_at: now,
            revoked: false,
        };
        self.devices.write().insert(device_id.clone(), record);
        self.save_devices();

        tracing::info!(device_id = %device_id, label = %label, "device registered");
        Ok(IssuedCredential {
            device_id,
            device_secret,
            user_id,
        })
    }

    // ── Devices ────────────────────────────────────────────────────

    /// Validate a credential pair + fingerprint. A fingerprint mismatch
    /// permanently revokes the device before returning the error.
    pub fn authenticate(
        &self,
        device_id: &str,
        device_secret: &str,
        fingerprint: &str,
    ) -> Result<DeviceRecord, AuthFailReason> {
        let record = {
            let devices = self.devices.read();
            devices
                .get(device_id)
                .cloned()
                .ok_or(AuthFailReason::DeviceRevoked)?
        };

        if record.revoked {
            return Err(AuthFailReason::DeviceRevoked);
        }
        if !digest_eq(&record.secret_hash, &sha256_hex(device_secret)) {
            return Err(AuthFailReason::DeviceRevoked);
        }
        if !digest_eq(&record.fingerprint, fingerprint) {
            self.revoke(device_id);
            tracing::warn!(device_id = %device_id, "fingerprint mismatch, device revoked");
            return Err(AuthFailReason::FingerprintMismatch);
        }
        Ok(record)
    }

    pub fn revoke(&self, device_id: &str) {
        if let Some(d) = self.devices.write().get_mut(device_id) {
            d.revoked = true;
        }
        self.save_devices();
    }

    pub fn list_devices(&self) -> Vec<DeviceRecord> {
        let mut out: Vec<_> = self.devices.read().values().cloned().collect();
        out.sort_by(|a, b| a.registered_at.cmp(&b.registered_at));
        out
    }
}

fn load_map<T, F>(path: &Path, key: F) -> std::io::Result<HashMap<String, T>>
where
    T: for<'de> Deserialize<'de>,
    F: Fn(&T) -> String,
{
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let raw = std::fs::read_to_string(path)?;
    let items: Vec<T> = serde_json::from_str(&raw).unwrap_or_default();
    Ok(items.into_iter().map(|i| (key(&i), i)).collect())
}

fn persist_map<T: Serialize>(path: &Path, map: &HashMap<String, T>) {
    let items: Vec<&T> = map.values().collect();
    match serde_json::to_string_pretty(&items) {
        Ok(json) => {
            if let Err(e) = std::fs::write(path, json) {
                tracing::error!(path = %path.display(), error = %e, "failed to persist store");
            }
        }
        Err(e) => tracing::error!(error = %e, "failed to serialize store"),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Per-IP rolling rate limit
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Rolling-window failure counter keyed by source IP.
///
/// Shared by the WS auth path and the credential entry form. Only
/// *failures* are recorded; once the window is saturated, every check
/// fails until enough entries age out.
pub struct RateLimitWindow {
    window: Duration,
    max_failures: u32,
    hits: RwLock<HashMap<String, VecDeque<DateTime<Utc>>>>,
}

impl RateLimitWindow {
    pub fn new(max_failures: u32, window_min: i64) -> Self {
        Self {
            window: Duration::minutes(window_min),
            max_failures,
            hits: RwLock::new(HashMap::new()),
        }
    }

    /// Is this source currently limited?
    pub fn is_limited(&self, ip: &str, now: DateTime<Utc>) -> bool {
        let hits = self.hits.read();
        let Some(entries) = hits.get(ip) else {
            return false;
        };
        let cutoff = now - self.window;
        let live = entries.iter().filter(|t| **t > cutoff).count();
        live >= self.max_failures as usize
    }

    /// Record a failed attempt.
    pub fn record_failure(&self, ip: &str, now: DateTime<Utc>) {
        let mut hits = self.hits.write();
        let entries = hits.entry(ip.to_string()).or_default();
        let cutoff = now - self.window;
        while entries.front().is_some_and(|t| *t <= cutoff) {
            entries.pop_front();
        }
        entries.push_back(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, IdentityStore) {
        let dir = TempDir::new().unwrap();
        let cfg = IdentityConfig {
            data_dir: dir.path().to_string_lossy().into_owned(),
            ..Default::default()
        };
        let store = IdentityStore::open(&cfg).unwrap();
        (dir, store)
    }

    #[test]
    fn register_then_authenticate_roundtrip() {
        let (_dir, store) = store();
        let invite = store.create_invite("laptop", "default", 1, None);
        let cred = store
            .register(&invite.token, "laptop", "fp-1", Utc::now())
            .unwrap();

        let record = store
            .authenticate(&cred.device_id, &cred.device_secret, "fp-1")
            .unwrap();
        assert_eq!(record.label, "laptop");
        assert_eq!(record.user_id, "default");
    }

    #[test]
    fn invite_max_uses_enforced() {
        let (_dir, store) = store();
        let invite = store.create_invite("team", "default", 2, None);
        let now = Utc::now();
        assert!(store.register(&invite.token, "a", "fp", now).is_ok());
        assert!(store.register(&invite.token, "b", "fp", now).is_ok());
        assert_eq!(
            store.register(&invite.token, "c", "fp", now).unwrap_err(),
            AuthFailReason::TokenConsumed
        );
    }

    #[test]
    fn expired_invite_rejected() {
        let (_dir, store) = store();
        let invite = store.create_invite("old", "default", 1, Some(1));
        let later = Utc::now() + Duration::days(2);
        assert_eq!(
            store.register(&invite.token, "x", "fp", later).unwrap_err(),
            AuthFailReason::TokenExpired
        );
    }

    #[test]
    fn unknown_token_is_invalid() {
        let (_dir, store) = store();
        assert_eq!(
            store
                .register("dbot-AAAA-BBBB-CCCC-DDDD", "x", "fp", Utc::now())
                .unwrap_err(),
            AuthFailReason::InvalidToken
        );
        assert_eq!(
            store
                .register("not-a-token", "x", "fp", Utc::now())
                .unwrap_err(),
            AuthFailReason::InvalidToken
        );
    }

    #[test]
    fn fingerprint_mismatch_revokes_permanently() {
        let (_dir, store) = store();
        let invite = store.create_invite("laptop", "default", 1, None);
        let cred = store
            .register(&invite.token, "laptop", "fp-1", Utc::now())
            .unwrap();

        assert_eq!(
            store
                .authenticate(&cred.device_id, &cred.device_secret, "fp-OTHER")
                .unwrap_err(),
            AuthFailReason::FingerprintMismatch
        );
        // Even the correct fingerprint is now refused.
        assert_eq!(
            store
                .authenticate(&cred.device_id, &cred.device_secret, "fp-1")
                .unwrap_err(),
            AuthFailReason::DeviceRevoked
        );
    }

    #[test]
    fn stores_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let cfg = IdentityConfig {
            data_dir: dir.path().to_string_lossy().into_owned(),
            ..Default::default()
        };
        let cred = {
            let store = IdentityStore::open(&cfg).unwrap();
            let invite = store.create_invite("laptop", "default", 1, None);
            store
                .register(&invite.token, "laptop", "fp-1", Utc::now())
                .unwrap()
        };
        let reopened = IdentityStore::open(&cfg).unwrap();
        assert!(reopened
            .authenticate(&cred.device_id, &cred.device_secret, "fp-1")
            .is_ok());
    }

    #[test]
    fn rate_limit_window_rolls() {
        let limiter = RateLimitWindow::new(3, 15);
        let t0 = Utc::now();
        for _ in 0..3 {
            limiter.record_failure("1.2.3.4", t0);
        }
        assert!(limiter.is_limited("1.2.3.4", t0));
        assert!(!limiter.is_limited("5.6.7.8", t0));
        // Window rolls past the failures.
        let later = t0 + Duration::minutes(16);
        assert!(!limiter.is_limited("1.2.3.4", later));
    }
}
