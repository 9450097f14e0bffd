//! Credential entry sessions: one-time-use tokens behind the web form.
//!
//! A session is minted when the local agent asks for one over the
//! channel, served once via GET, and consumed atomically on the first
//! POST. The second of two racing POSTs sees a consumed session and gets
//! the expired page.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rand::RngCore;

#[derive(Debug, Clone)]
pub struct EntrySession {
    pub token: String,
    pub user_id: String,
    pub device_id: String,
    pub key_name: String,
    pub prompt: String,
    pub title: String,
    pub allowed_domain: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub consumed: bool,
}

pub struct EntrySessionStore {
    sessions: Mutex<HashMap<String, EntrySession>>,
    ttl: Duration,
}

impl EntrySessionStore {
    pub fn new(ttl_min: i64) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            ttl: Duration::minutes(ttl_min),
        }
    }

    /// Mint a session. The token is 32 random bytes, hex-encoded.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        &self,
        user_id: &str,
        device_id: &str,
        key_name: &str,
        prompt: &str,
        title: &str,
        allowed_domain: &str,
        now: DateTime<Utc>,
    ) -> EntrySession {
        let mut token_bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut token_bytes);
        let session = EntrySession {
            token: hex::encode(token_bytes),
            user_id: user_id.to_string(),
            device_id: device_id.to_string(),
            key_name: key_name.to_string(),
            prompt: prompt.to_string(),
            title: title.to_string(),
            allowed_domain: allowed_domain.to_lowercase(),
            created_at: now,
            expires_at: now + self.ttl,
            consumed: false,
        };
        self.sessions
            .lock()
            .insert(session.token.clone(), session.clone());
        session
    }

    /// Read-only view for the GET page. `None` for unknown, consumed, or
    /// expired tokens.
    pub fn peek(&self, token: &str, now: DateTime<Utc>) -> Option<EntrySession> {
        let sessions = self.sessions.lock();
        let s = sessions.get(token)?;
        if s.consumed || now > s.expires_at {
            return None;
        }
        Some(s.clone())
    }

    /// Atomic get-and-consume. Exactly one caller per token ever gets
    /// `Some`; the losing POST of a race gets `None`.
    pub fn consume(&self, token: &str, now: DateTime<Utc>) -> Option<EntrySession> {
        let mut sessions = self.sessions.lock();
        let s = sessions.get_mut(token)?;
        if s.consumed || now > s.expires_at {
            return None;
        }
        s.consumed = true;
        Some(s.clone())
    }

    /// Drop consumed and expired sessions.
    pub fn purge(&self, now: DateTime<Utc>) {
        self.sessions
            .lock()
            .retain(|_, s| !s.consumed && now <= s.expires_at);
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> EntrySessionStore {
        EntrySessionStore::new(15)
    }

    fn mint(store: &EntrySessionStore, now: DateTime<Utc>) -> EntrySession {
        store.create(
            "user-1",
            "dev-1",
            "DISCORD_BOT_TOKEN",
            "Paste your Discord bot token",
            "Discord",
            "Discord.COM",
            now,
        )
    }

    #[test]
    fn token_is_unguessable_length_and_domain_lowercased() {
        let now = Utc::now();
        let s = mint(&store(), now);
        assert_eq!(s.token.len(), 64);
        assert_eq!(s.allowed_domain, "discord.com");
    }

    #[test]
    fn consume_is_single_shot() {
        let store = store();
        let now = Utc::now();
        let s = mint(&store, now);

        assert!(store.consume(&s.token, now).is_some());
        // Second consume fails even though the entry is still in the map.
        assert_eq!(store.len(), 1);
        assert!(store.consume(&s.token, now).is_none());
        assert!(store.peek(&s.token, now).is_none());
    }

    #[test]
    fn racing_consumers_get_exactly_one_winner() {
        let store = std::sync::Arc::new(store());
        let now = Utc::now();
        let token = mint(&store, now).token;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let token = token.clone();
            handles.push(std::thread::spawn(move || {
                store.consume(&token, now).is_some()
            }));
        }
        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(wins, 1);
    }

    #[test]
    fn expired_sessions_unusable() {
        let store = store();
        let now = Utc::now();
        let s = mint(&store, now);
        let later = now + Duration::minutes(16);
        assert!(store.peek(&s.token, later).is_none());
        assert!(store.consume(&s.token, later).is_none());
    }

    #[test]
    fn purge_drops_consumed_and_expired() {
        let store = store();
        let now = Utc::now();
        let consumed = mint(&store, now);
        let _fresh = mint(&store, now);
        store.consume(&consumed.token, now);
        store.purge(now);
        assert_eq!(store.len(), 1);
    }
}
