use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Server configuration
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Top-level server configuration, loaded from TOML with env overrides.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServerConfig {
    #[serde(default)]
    pub listen: ListenConfig,
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub credentials: CredentialConfig,
    #[serde(default)]
    pub collections: CollectionConfig,
    #[serde(default)]
    pub loops: LoopConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenConfig {
    /// Bind address for the WS channel and credential pages.
    #[serde(default = "d_bind")]
    pub bind: String,
    /// Public base URL used when building credential entry links.
    #[serde(default = "d_public_url")]
    pub public_url: String,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            bind: d_bind(),
            public_url: d_public_url(),
        }
    }
}

fn d_bind() -> String {
    "0.0.0.0:3720".into()
}
fn d_public_url() -> String {
    "http://localhost:3720".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Directory holding `devices.json` and `invites.json`.
    #[serde(default = "d_data_dir")]
    pub data_dir: String,
    /// Days before a fresh invite expires.
    #[serde(default = "d_invite_expiry_days")]
    pub invite_expiry_days: i64,
    /// Failed auth attempts per source IP in the rolling window.
    #[serde(default = "d_auth_max_failures")]
    pub auth_max_failures: u32,
    /// Rolling rate-limit window, minutes.
    #[serde(default = "d_rate_window_min")]
    pub rate_window_min: i64,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            data_dir: d_data_dir(),
            invite_expiry_days: d_invite_expiry_days(),
            auth_max_failures: d_auth_max_failures(),
            rate_window_min: d_rate_window_min(),
        }
    }
}

fn d_data_dir() -> String {
    "./data".into()
}
fn d_invite_expiry_days() -> i64 {
    7
}
fn d_auth_max_failures() -> u32 {
    10
}
fn d_rate_window_min() -> i64 {
    15
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialConfig {
    /// Path to the 32-byte master key file (created on first start).
    #[serde(default = "d_master_key_path")]
    pub master_key_path: String,
    /// Entry-session lifetime, minutes.
    #[serde(default = "d_entry_ttl_min")]
    pub entry_ttl_min: i64,
    /// Credential form POSTs per source IP in the rolling window.
    #[serde(default = "d_entry_max_attempts")]
    pub entry_max_attempts: u32,
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self {
            master_key_path: d_master_key_path(),
            entry_ttl_min: d_entry_ttl_min(),
            entry_max_attempts: d_entry_max_attempts(),
        }
    }
}

fn d_master_key_path() -> String {
    "./data/master.key".into()
}
fn d_entry_ttl_min() -> i64 {
    15
}
fn d_entry_max_attempts() -> u32 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionConfig {
    /// Tool results longer than this (chars) become collections.
    #[serde(default = "d_collection_threshold")]
    pub threshold_chars: usize,
    /// Idle minutes before a collection reference is garbage-collected.
    #[serde(default = "d_collection_ttl_min")]
    pub ttl_min: i64,
    /// Rows shown in the overview table.
    #[serde(default = "d_overview_rows")]
    pub overview_rows: usize,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            threshold_chars: d_collection_threshold(),
            ttl_min: d_collection_ttl_min(),
            overview_rows: d_overview_rows(),
        }
    }
}

fn d_collection_threshold() -> usize {
    10_000
}
fn d_collection_ttl_min() -> i64 {
    30
}
fn d_overview_rows() -> usize {
    25
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopConfig {
    /// Iteration cap for a spawned agent's tool loop.
    #[serde(default = "d_max_iterations")]
    pub max_iterations: usize,
    /// Consecutive same-tool calls before the soft warning.
    #[serde(default = "d_stuck_warning")]
    pub stuck_warning_threshold: u32,
    /// Consecutive same-tool calls before forced escalation.
    #[serde(default = "d_stuck_escalate")]
    pub stuck_escalate_threshold: u32,
    /// Tool result texts are clipped to this many chars.
    #[serde(default = "d_result_cap")]
    pub tool_result_cap: usize,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: d_max_iterations(),
            stuck_warning_threshold: d_stuck_warning(),
            stuck_escalate_threshold: d_stuck_escalate(),
            tool_result_cap: d_result_cap(),
        }
    }
}

fn d_max_iterations() -> usize {
    25
}
fn d_stuck_warning() -> u32 {
    3
}
fn d_stuck_escalate() -> u32 {
    5
}
fn d_result_cap() -> usize {
    8000
}
