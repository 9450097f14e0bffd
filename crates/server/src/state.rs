//! Shared application state for the server.

use std::sync::Arc;

use dotbot_domain::config::ServerConfig;
use dotbot_providers::ProviderRegistry;

use crate::channel::pending::PendingMap;
use crate::channel::session::SessionRegistry;
use crate::collections::{CollectionStore, HintStore};
use crate::credentials::crypto::CredentialCipher;
use crate::credentials::entry::EntrySessionStore;
use crate::credentials::proxy::CredentialProxy;
use crate::identity::{IdentityStore, RateLimitWindow};
use crate::mcp_gateway::McpGateway;

/// Process-wide services. Per-device state (orchestrator, navigator)
/// is assembled by the WS handler at authentication time.
pub struct AppState {
    pub config: ServerConfig,
    pub identity: Arc<IdentityStore>,
    pub sessions: Arc<SessionRegistry>,
    pub pending: Arc<PendingMap>,
    pub cipher: Arc<CredentialCipher>,
    pub entry_sessions: Arc<EntrySessionStore>,
    pub auth_limiter: Arc<RateLimitWindow>,
    pub entry_limiter: Arc<RateLimitWindow>,
    pub collections: Arc<CollectionStore>,
    pub hints: Arc<HintStore>,
    pub mcp: Arc<McpGateway>,
    pub proxy: Arc<CredentialProxy>,
    pub providers: Arc<ProviderRegistry>,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn build(config: ServerConfig, providers: ProviderRegistry) -> anyhow::Result<SharedState> {
        let identity = Arc::new(IdentityStore::open(&config.identity)?);
        let sessions = Arc::new(SessionRegistry::new());
        let pending = Arc::new(PendingMap::new());

        let master_key = crate::credentials::crypto::load_or_create_master_key(
            std::path::Path::new(&config.credentials.master_key_path),
        )?;
        let cipher = Arc::new(CredentialCipher::new(master_key));

        let entry_sessions = Arc::new(EntrySessionStore::new(config.credentials.entry_ttl_min));
        let auth_limiter = Arc::new(RateLimitWindow::new(
            config.identity.auth_max_failures,
            config.identity.rate_window_min,
        ));
        let entry_limiter = Arc::new(RateLimitWindow::new(
            config.credentials.entry_max_attempts,
            config.identity.rate_window_min,
        ));

        let collections = Arc::new(CollectionStore::new(config.collections.ttl_min));
        let hints = Arc::new(HintStore::open(
            std::path::Path::new(&config.identity.data_dir).join("hints.json"),
        ));

        let mcp = Arc::new(McpGateway::new(
            Arc::new(crate::mcp_gateway::RealConnector),
            sessions.clone(),
            pending.clone(),
            cipher.clone(),
        ));
        let proxy = Arc::new(CredentialProxy::new(
            sessions.clone(),
            pending.clone(),
            cipher.clone(),
        ));

        Ok(Arc::new(AppState {
            config,
            identity,
            sessions,
            pending,
            cipher,
            entry_sessions,
            auth_limiter,
            entry_limiter,
            collections,
            hints,
            mcp,
            proxy,
            providers: Arc::new(providers),
        }))
    }
}
