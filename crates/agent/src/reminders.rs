//! Reminder store (`~/.bot/reminders.json`) and the due-check used by
//! the `reminder-check` periodic task.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ReminderPriority {
    P0,
    P1,
    P2,
    P3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReminderStatus {
    Scheduled,
    Triggered,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reminder {
    pub id: String,
    pub message: String,
    pub scheduled_for: DateTime<Utc>,
    pub priority: ReminderPriority,
    pub status: ReminderStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triggered_at: Option<DateTime<Utc>>,
}

pub struct ReminderStore {
    path: PathBuf,
    reminders: Mutex<Vec<Reminder>>,
}

impl ReminderStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let reminders = std::fs::read_to_string(&path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();
        Self {
            path,
            reminders: Mutex::new(reminders),
        }
    }

    pub fn add(
        &self,
        message: &str,
        scheduled_for: DateTime<Utc>,
        priority: ReminderPriority,
    ) -> Reminder {
        let reminder = Reminder {
            id: format!("rem-{}", &uuid::Uuid::new_v4().to_string()[..8]),
            message: message.to_string(),
            scheduled_for,
            priority,
            status: ReminderStatus::Scheduled,
            created_at: Utc::now(),
            triggered_at: None,
        };
        self.reminders.lock().push(reminder.clone());
        self.persist();
        reminder
    }

    /// Scheduled reminders whose time has come, most urgent first.
    pub fn due(&self, now: DateTime<Utc>) -> Vec<Reminder> {
        let mut due: Vec<Reminder> = self
            .reminders
            .lock()
            .iter()
            .filter(|r| r.status == ReminderStatus::Scheduled && r.scheduled_for <= now)
            .cloned()
            .collect();
        due.sort_by_key(|r| r.priority);
        due
    }

    pub fn mark_triggered(&self, id: &str, now: DateTime<Utc>) {
        {
            let mut reminders = self.reminders.lock();
            if let Some(r) = reminders.iter_mut().find(|r| r.id == id) {
                r.status = ReminderStatus::Triggered;
                r.triggered_at = Some(now);
            }
        }
        self.persist();
    }

    pub fn cancel(&self, id: &str) {
        {
            let mut reminders = self.reminders.lock();
            if let Some(r) = reminders.iter_mut().find(|r| r.id == id) {
                r.status = ReminderStatus::Cancelled;
            }
        }
        self.persist();
    }

    /// Any scheduled reminders at all (the task's `can_run`).
    pub fn has_scheduled(&self) -> bool {
        self.reminders
            .lock()
            .iter()
            .any(|r| r.status == ReminderStatus::Scheduled)
    }

    fn persist(&self) {
        if let Some(parent) = self.path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let reminders = self.reminders.lock();
        match serde_json::to_string_pretty(&*reminders) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&self.path, json) {
                    tracing::error!(error = %e, "failed to persist reminders");
                }
            }
            Err(e) => tracing::error!(error = %e, "failed to serialize reminders"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn due_respects_schedule_and_priority() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = ReminderStore::open(dir.path().join("reminders.json"));
        let now = Utc::now();
        store.add("low, due", now - Duration::minutes(1), ReminderPriority::P3);
        store.add("urgent, due", now - Duration::minutes(5), ReminderPriority::P0);
        store.add("future", now + Duration::hours(1), ReminderPriority::P1);

        let due = store.due(now);
        assert_eq!(due.len(), 2);
        assert_eq!(due[0].message, "urgent, due");
        assert!(store.has_scheduled());
    }

    #[test]
    fn triggered_reminders_do_not_refire() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = ReminderStore::open(dir.path().join("reminders.json"));
        let now = Utc::now();
        let r = store.add("once", now - Duration::minutes(1), ReminderPriority::P2);

        store.mark_triggered(&r.id, now);
        assert!(store.due(now).is_empty());
        assert!(!store.has_scheduled());
    }

    #[test]
    fn cancelled_never_fire_and_store_persists() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("reminders.json");
        let now = Utc::now();
        {
            let store = ReminderStore::open(&path);
            let r = store.add("cancel me", now - Duration::minutes(1), ReminderPriority::P1);
            store.cancel(&r.id);
        }
        let reopened = ReminderStore::open(&path);
        assert!(reopened.due(now).is_empty());
    }
}
