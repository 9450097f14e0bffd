//! DotBot local agent: the on-device half of the platform.
//!
//! Owns the device credential, the encrypted-blob vault, the tool
//! handler registry, the periodic loops, and the reconnecting channel to
//! the server. All LLM work happens server-side; this process executes
//! tools and renders results.

pub mod channel;
pub mod envfile;
pub mod identity;
pub mod periodic;
pub mod reconnect;
pub mod reminders;
pub mod restart;
pub mod runlog;
pub mod tasks;
pub mod tools;
pub mod validate;
pub mod vault;

use std::path::{Path, PathBuf};

/// The fixed `~/.bot` layout.
#[derive(Debug, Clone)]
pub struct AgentPaths {
    root: PathBuf,
}

impl AgentPaths {
    /// Root under the user's home directory (or an override for tests).
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn from_home() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self::new(home.join(".bot"))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
    pub fn device_file(&self) -> PathBuf {
        self.root.join("device.json")
    }
    pub fn env_file(&self) -> PathBuf {
        self.root.join(".env")
    }
    pub fn vault_file(&self) -> PathBuf {
        self.root.join("vault.json")
    }
    pub fn reminders_file(&self) -> PathBuf {
        self.root.join("reminders.json")
    }
    pub fn restart_queue_file(&self) -> PathBuf {
        self.root.join("restart-queue.json")
    }
    pub fn run_logs_dir(&self) -> PathBuf {
        self.root.join("run-logs")
    }
    pub fn threads_dir(&self) -> PathBuf {
        self.root.join("memory/threads")
    }
    pub fn research_cache_dir(&self) -> PathBuf {
        self.root.join("memory/research-cache")
    }
    pub fn personas_dir(&self) -> PathBuf {
        self.root.join("personas")
    }
}
