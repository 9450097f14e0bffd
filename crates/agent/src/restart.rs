//! Restart queue: prompts in flight when the process restarts survive
//! to the next session.
//!
//! Before exiting with the restart code, the channel asks the server to
//! cancel everything and writes the returned prompts here. On the next
//! successful auth, [`RestartQueue::take`] reads the file and deletes it
//! so a second restart cannot re-submit.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Prefix stamped on resubmitted prompts.
pub const RESUME_PREFIX: &str = "[Resumed after restart] ";

#[derive(Debug, Serialize, Deserialize, Default)]
struct QueueFile {
    prompts: Vec<String>,
}

pub struct RestartQueue {
    path: PathBuf,
}

impl RestartQueue {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Persist prompts for the next process.
    pub fn write(&self, prompts: &[String]) -> std::io::Result<()> {
        if prompts.is_empty() {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = QueueFile {
            prompts: prompts.to_vec(),
        };
        std::fs::write(&self.path, serde_json::to_string_pretty(&file)?)
    }

    /// Read and delete. The deletion happens before the prompts are
    /// returned, so even a crash mid-resubmit cannot loop the queue.
    pub fn take(&self) -> Vec<String> {
        let Ok(raw) = std::fs::read_to_string(&self.path) else {
            return Vec::new();
        };
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!(error = %e, "failed to delete restart queue");
        }
        match serde_json::from_str::<QueueFile>(&raw) {
            Ok(file) => file.prompts,
            Err(e) => {
                tracing::warn!(error = %e, "restart queue was corrupt, dropping");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_take_deletes_file() {
        // Scenario S5's file half.
        let dir = tempfile::TempDir::new().unwrap();
        let queue = RestartQueue::new(dir.path().join("restart-queue.json"));

        queue
            .write(&["draft the report".into(), "check the inbox".into()])
            .unwrap();
        let prompts = queue.take();
        assert_eq!(prompts, vec!["draft the report", "check the inbox"]);

        // A second restart finds nothing.
        assert!(queue.take().is_empty());
    }

    #[test]
    fn empty_write_creates_nothing() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("restart-queue.json");
        RestartQueue::new(&path).write(&[]).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn corrupt_file_is_dropped() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("restart-queue.json");
        std::fs::write(&path, "{broken").unwrap();
        assert!(RestartQueue::new(&path).take().is_empty());
        assert!(!path.exists());
    }
}
