//! The fixed set of periodic tasks: heartbeat, reminder-check,
//! sleep-cycle, onboarding-check, update-check.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Timelike, Utc};
use parking_lot::Mutex;

use crate::channel::{ChannelClient, UiEvent};
use crate::periodic::{in_active_hours, parse_hour, PeriodicTask};
use crate::reminders::ReminderStore;
use crate::AgentPaths;

/// Heartbeats stop when the user has been away this long.
const HEARTBEAT_MAX_IDLE: Duration = Duration::from_secs(4 * 3600);
/// Sleep-cycle prunes research-cache files older than this.
const CACHE_RETENTION_DAYS: u64 = 7;

/// Build all five tasks from the environment map.
pub fn standard_tasks(
    env: &HashMap<String, String>,
    client: Arc<ChannelClient>,
    reminders: Arc<ReminderStore>,
    paths: AgentPaths,
) -> Vec<PeriodicTask> {
    vec![
        heartbeat(env, client.clone()),
        reminder_check(client.clone(), reminders),
        sleep_cycle(paths.clone()),
        onboarding_check(client.clone(), paths),
        update_check(),
    ]
}

fn heartbeat(env: &HashMap<String, String>, client: Arc<ChannelClient>) -> PeriodicTask {
    let enabled = env
        .get("HEARTBEAT_ENABLED")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    let interval_min: u64 = env
        .get("HEARTBEAT_INTERVAL_MIN")
        .and_then(|v| v.parse().ok())
        .unwrap_or(5);
    let start = env
        .get("HEARTBEAT_ACTIVE_START")
        .and_then(|v| parse_hour(v))
        .unwrap_or(8);
    let end = env
        .get("HEARTBEAT_ACTIVE_END")
        .and_then(|v| parse_hour(v))
        .unwrap_or(22);

    let mut task = PeriodicTask::new(
        "heartbeat",
        "Heartbeat",
        Duration::from_secs(interval_min * 60),
        Duration::from_secs(60),
        Arc::new(move |ctx| {
            let client = client.clone();
            Box::pin(async move {
                // Nobody home — no point poking the server.
                if ctx.idle > HEARTBEAT_MAX_IDLE {
                    return Ok(());
                }
                let sent = client
                    .send_prompt(
                        "[heartbeat] Check for anything that needs my user's attention.",
                        "heartbeat",
                    )
                    .await;
                if !sent {
                    return Err("channel not connected".into());
                }
                Ok(())
            })
        }),
    );
    task.enabled = enabled;
    task.can_run = Arc::new(move || in_active_hours(Utc::now().hour(), start, end));
    task
}

fn reminder_check(client: Arc<ChannelClient>, reminders: Arc<ReminderStore>) -> PeriodicTask {
    let store = reminders.clone();
    let mut task = PeriodicTask::new(
        "reminder-check",
        "Reminder check",
        Duration::from_secs(15),
        Duration::from_secs(10),
        Arc::new(move |_ctx| {
            let client = client.clone();
            let store = store.clone();
            Box::pin(async move {
                let now = Utc::now();
                for reminder in store.due(now) {
                    store.mark_triggered(&reminder.id, now);
                    let _ = client
                        .ui
                        .send(UiEvent::Line(format!(
                            "⏰ [{:?}] {}",
                            reminder.priority, reminder.message
                        )))
                        .await;
                }
                Ok(())
            })
        }),
    );
    // Reminders must fire on schedule regardless of user activity.
    task.bypass_idle_check = true;
    task.can_run = Arc::new(move || reminders.has_scheduled());
    task
}

fn sleep_cycle(paths: AgentPaths) -> PeriodicTask {
    PeriodicTask::new(
        "sleep-cycle",
        "Memory consolidation",
        Duration::from_secs(30 * 60),
        Duration::from_secs(5 * 60),
        Arc::new(move |_ctx| {
            let cache_dir = paths.research_cache_dir();
            Box::pin(async move {
                let Ok(entries) = std::fs::read_dir(&cache_dir) else {
                    return Ok(());
                };
                let cutoff = std::time::SystemTime::now()
                    - Duration::from_secs(CACHE_RETENTION_DAYS * 24 * 3600);
                let mut pruned = 0;
                for entry in entries.flatten() {
                    let Ok(metadata) = entry.metadata() else { continue };
                    let Ok(modified) = metadata.modified() else { continue };
                    if modified < cutoff && std::fs::remove_file(entry.path()).is_ok() {
                        pruned += 1;
                    }
                }
                if pruned > 0 {
                    tracing::info!(pruned, "sleep cycle pruned research cache");
                }
                Ok(())
            })
        }),
    )
}

fn onboarding_check(client: Arc<ChannelClient>, paths: AgentPaths) -> PeriodicTask {
    // Nag at most once per day.
    let last_nag: Arc<Mutex<Option<chrono::DateTime<Utc>>>> = Arc::new(Mutex::new(None));
    PeriodicTask::new(
        "onboarding-check",
        "Onboarding check",
        Duration::from_secs(3600),
        Duration::from_secs(5 * 60),
        Arc::new(move |_ctx| {
            let client = client.clone();
            let personas = paths.personas_dir();
            let last_nag = last_nag.clone();
            Box::pin(async move {
                let has_personas = std::fs::read_dir(&personas)
                    .map(|mut entries| entries.next().is_some())
                    .unwrap_or(false);
                if has_personas {
                    return Ok(());
                }
                let now = Utc::now();
                {
                    let mut last = last_nag.lock();
                    if last.is_some_and(|t| (now - t).num_hours() < 24) {
                        return Ok(());
                    }
                    *last = Some(now);
                }
                let _ = client
                    .ui
                    .send(UiEvent::Line(
                        "No personas set up yet — ask me to create one to get started.".into(),
                    ))
                    .await;
                Ok(())
            })
        }),
    )
}

fn update_check() -> PeriodicTask {
    PeriodicTask::new(
        "update-check",
        "Update check",
        Duration::from_secs(6 * 3600),
        Duration::from_secs(10 * 60),
        Arc::new(|_ctx| {
            Box::pin(async {
                // Release lookups are deployment-specific; the loop just
                // keeps the slot alive and records the check.
                tracing::debug!(version = env!("CARGO_PKG_VERSION"), "update check ran");
                Ok(())
            })
        }),
    )
}
