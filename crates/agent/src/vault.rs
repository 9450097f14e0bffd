//! On-disk credential vault.
//!
//! Holds only `srv:`-prefixed blobs the server minted — nothing here can
//! be decrypted locally. A small resolve cache keeps plaintext values
//! the server returned for client-side gateways; storing a fresh blob
//! clears the cache entry so gateways pick up the new value.

use std::collections::HashMap;
use std::path::PathBuf;

use parking_lot::Mutex;

pub struct Vault {
    path: PathBuf,
    blobs: Mutex<HashMap<String, String>>,
    resolve_cache: Mutex<HashMap<String, String>>,
}

impl Vault {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let blobs = std::fs::read_to_string(&path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();
        Self {
            path,
            blobs: Mutex::new(blobs),
            resolve_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Store a blob under its key name and clear any cached plaintext.
    pub fn store(&self, key_name: &str, blob: &str) {
        self.blobs
            .lock()
            .insert(key_name.to_string(), blob.to_string());
        self.resolve_cache.lock().remove(key_name);
        self.persist();
        tracing::info!(key_name = %key_name, "credential blob stored");
    }

    /// The opaque blob for a key, verbatim.
    pub fn blob(&self, key_name: &str) -> Option<String> {
        self.blobs.lock().get(key_name).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.blobs.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Cached plaintext from an earlier server resolve, if any.
    pub fn cached_value(&self, key_name: &str) -> Option<String> {
        self.resolve_cache.lock().get(key_name).cloned()
    }

    pub fn cache_value(&self, key_name: &str, value: &str) {
        self.resolve_cache
            .lock()
            .insert(key_name.to_string(), value.to_string());
    }

    fn persist(&self) {
        if let Some(parent) = self.path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let blobs = self.blobs.lock();
        match serde_json::to_string_pretty(&*blobs) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&self.path, json) {
                    tracing::error!(error = %e, "failed to persist vault");
                }
            }
            Err(e) => tracing::error!(error = %e, "failed to serialize vault"),
        }
    }
}
