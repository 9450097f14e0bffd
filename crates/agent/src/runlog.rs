//! Per-prompt run logs under `~/.bot/run-logs/`, pruned at 14 days.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

const RETENTION_DAYS: i64 = 14;

#[derive(Debug, Serialize)]
pub struct RunLogEntry {
    pub at: DateTime<Utc>,
    pub kind: String,
    pub detail: serde_json::Value,
}

pub struct RunLogDir {
    dir: PathBuf,
}

impl RunLogDir {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn write(&self, run_id: &str, entries: &[RunLogEntry]) -> std::io::Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(format!("{run_id}.json"));
        std::fs::write(&path, serde_json::to_string_pretty(entries)?)?;
        Ok(path)
    }

    /// Delete logs older than the retention window (by mtime).
    pub fn prune(&self, now: DateTime<Utc>) -> std::io::Result<usize> {
        let cutoff = now - Duration::days(RETENTION_DAYS);
        let mut pruned = 0;
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return Ok(0);
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Ok(metadata) = entry.metadata() else { continue };
            let Ok(modified) = metadata.modified() else { continue };
            let modified: DateTime<Utc> = modified.into();
            if modified < cutoff {
                if std::fs::remove_file(&path).is_ok() {
                    pruned += 1;
                }
            }
        }
        if pruned > 0 {
            tracing::debug!(pruned, "old run logs removed");
        }
        Ok(pruned)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}
