//! Collection navigator: oversized tool results are cached on the
//! client, introspected once, and browsed through a small overview /
//! get / filter / query API instead of being dumped into model context.

pub mod introspect;
mod navigator;
pub mod query;

pub use navigator::{navigator_tool_defs, ClientFiles, Navigator, ProcessedResult};

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};

use introspect::OutputHints;

/// Server-side reference to one cached collection.
#[derive(Debug, Clone)]
pub struct CollectionRef {
    pub id: String,
    /// Path of the raw cache file on the client.
    pub cache_path: String,
    pub tool_id: String,
    pub hints: OutputHints,
    pub item_count: usize,
    pub last_access: DateTime<Utc>,
}

/// Process-wide store of live collection references. TTL is extended on
/// every access; idle references are garbage-collected.
pub struct CollectionStore {
    refs: Mutex<HashMap<String, CollectionRef>>,
    ttl: Duration,
}

impl CollectionStore {
    pub fn new(ttl_min: i64) -> Self {
        Self {
            refs: Mutex::new(HashMap::new()),
            ttl: Duration::minutes(ttl_min),
        }
    }

    pub fn insert(&self, reference: CollectionRef) {
        self.refs.lock().insert(reference.id.clone(), reference);
    }

    /// Fetch a reference and extend its TTL.
    pub fn touch(&self, id: &str, now: DateTime<Utc>) -> Option<CollectionRef> {
        let mut refs = self.refs.lock();
        let r = refs.get_mut(id)?;
        r.last_access = now;
        Some(r.clone())
    }

    /// Drop references idle longer than the TTL.
    pub fn purge(&self, now: DateTime<Utc>) {
        let ttl = self.ttl;
        self.refs.lock().retain(|_, r| now - r.last_access <= ttl);
    }

    pub fn len(&self) -> usize {
        self.refs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.refs.lock().is_empty()
    }
}

/// Disk-backed store of output hints keyed by tool id, so repeat calls
/// from the same tool skip introspection.
pub struct HintStore {
    path: PathBuf,
    hints: RwLock<HashMap<String, OutputHints>>,
}

impl HintStore {
    pub fn open(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let hints = std::fs::read_to_string(&path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();
        Self {
            path,
            hints: RwLock::new(hints),
        }
    }

    pub fn get(&self, tool_id: &str) -> Option<OutputHints> {
        self.hints.read().get(tool_id).cloned()
    }

    pub fn put(&self, tool_id: &str, hints: OutputHints) {
        self.hints.write().insert(tool_id.to_string(), hints);
        self.persist();
    }

    fn persist(&self) {
        if let Some(parent) = self.path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let map = self.hints.read();
        match serde_json::to_string_pretty(&*map) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&self.path, json) {
                    tracing::warn!(error = %e, "failed to persist hint store");
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to serialize hint store"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use introspect::ShapeKind;

    fn reference(id: &str, at: DateTime<Utc>) -> CollectionRef {
        CollectionRef {
            id: id.into(),
            cache_path: "/tmp/x.json".into(),
            tool_id: "gmail.list_messages".into(),
            hints: OutputHints {
                shape: ShapeKind::Json,
                array_path: vec!["messages".into()],
                summary_fields: vec!["id".into()],
                noise_fields: vec![],
                est_item_size: 100,
                verified_at: at,
            },
            item_count: 40,
            last_access: at,
        }
    }

    #[test]
    fn touch_extends_ttl() {
        let store = CollectionStore::new(30);
        let t0 = Utc::now();
        store.insert(reference("c1", t0));

        // Keep touching it past the original TTL.
        let t1 = t0 + Duration::minutes(25);
        assert!(store.touch("c1", t1).is_some());
        let t2 = t1 + Duration::minutes(25);
        store.purge(t2);
        assert_eq!(store.len(), 1, "touched reference survives");

        // Left idle, it is collected.
        let t3 = t2 + Duration::minutes(31);
        store.purge(t3);
        assert!(store.is_empty());
    }

    #[test]
    fn hint_store_round_trips_disk() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("hints.json");
        {
            let store = HintStore::open(&path);
            store.put("gmail.list_messages", reference("x", Utc::now()).hints);
        }
        let reopened = HintStore::open(&path);
        let hints = reopened.get("gmail.list_messages").unwrap();
        assert_eq!(hints.array_path, vec!["messages"]);
        assert!(reopened.get("other.tool").is_none());
    }
}
