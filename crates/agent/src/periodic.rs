//! Periodic manager: a small fixed set of background loops with common
//! lifecycle, idle-awareness, and no overlapping ticks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tokio::time::Instant;

/// Non-bypass tasks wait for at least this much user idleness before a
/// tick is allowed to run — background maintenance defers to the user.
const MIN_IDLE_FOR_BACKGROUND: Duration = Duration::from_secs(120);

/// Tracks when the user (or the server, on their behalf) last did
/// something. Ping/pong and auth traffic never counts.
pub struct ActivityTracker {
    last: Mutex<Instant>,
}

impl Default for ActivityTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivityTracker {
    pub fn new() -> Self {
        Self {
            last: Mutex::new(Instant::now()),
        }
    }

    pub fn notify_activity(&self) {
        *self.last.lock() = Instant::now();
    }

    pub fn idle(&self) -> Duration {
        self.last.lock().elapsed()
    }
}

/// Context handed to each task run.
pub struct TaskContext {
    /// Current user idle duration.
    pub idle: Duration,
}

type RunFn = dyn Fn(TaskContext) -> BoxFuture<'static, Result<(), String>> + Send + Sync;
type CanRunFn = dyn Fn() -> bool + Send + Sync;

pub struct PeriodicTask {
    pub id: String,
    pub name: String,
    pub interval: Duration,
    pub initial_delay: Duration,
    pub enabled: bool,
    /// Reminders must fire on schedule regardless of user activity.
    pub bypass_idle_check: bool,
    pub can_run: Arc<CanRunFn>,
    pub run: Arc<RunFn>,
}

impl PeriodicTask {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        interval: Duration,
        initial_delay: Duration,
        run: Arc<RunFn>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            interval,
            initial_delay,
            enabled: true,
            bypass_idle_check: false,
            can_run: Arc::new(|| true),
            run,
        }
    }
}

pub struct PeriodicManager {
    activity: Arc<ActivityTracker>,
    handles: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl PeriodicManager {
    pub fn new(activity: Arc<ActivityTracker>) -> Self {
        Self {
            activity,
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn activity(&self) -> Arc<ActivityTracker> {
        self.activity.clone()
    }

    /// Start a task loop. Disabled tasks are skipped entirely.
    pub fn spawn(&self, task: PeriodicTask) {
        if !task.enabled {
            tracing::debug!(task = %task.id, "periodic task disabled");
            return;
        }
        let activity = self.activity.clone();
        let running = Arc::new(AtomicBool::new(false));

        let handle = tokio::spawn(async move {
            tokio::time::sleep(task.initial_delay).await;
            let mut ticker = tokio::time::interval(task.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;

                let idle = activity.idle();
                if !task.bypass_idle_check && idle < MIN_IDLE_FOR_BACKGROUND {
                    tracing::trace!(task = %task.id, "user active, skipping tick");
                    continue;
                }
                if !(task.can_run)() {
                    continue;
                }
                // At most one execution at a time; overlapping ticks are
                // dropped, not queued.
                if running
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_err()
                {
                    tracing::debug!(task = %task.id, "tick overlaps running execution, dropped");
                    continue;
                }

                let result = (task.run)(TaskContext { idle }).await;
                if let Err(e) = result {
                    tracing::warn!(task = %task.id, error = %e, "periodic task failed");
                }
                running.store(false, Ordering::SeqCst);
            }
        });
        self.handles.lock().push(handle);
    }

    /// Abort all task loops (shutdown).
    pub fn stop(&self) {
        for handle in self.handles.lock().drain(..) {
            handle.abort();
        }
    }
}

/// Parse an `HH` or `HH:MM` active-hours bound.
pub fn parse_hour(raw: &str) -> Option<u32> {
    let hour_part = raw.split(':').next()?;
    let hour: u32 = hour_part.trim().parse().ok()?;
    (hour < 24).then_some(hour)
}

/// Is `hour` inside the `[start, end)` window, handling wrap-around
/// windows like 22–6?
pub fn in_active_hours(hour: u32, start: u32, end: u32) -> bool {
    if start == end {
        return true; // degenerate window means always
    }
    if start < end {
        (start..end).contains(&hour)
    } else {
        hour >= start || hour < end
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn counting_task(
        id: &str,
        interval: Duration,
        delay: Duration,
        counter: Arc<AtomicU32>,
        hold: Duration,
    ) -> PeriodicTask {
        let mut task = PeriodicTask::new(
            id,
            id,
            interval,
            delay,
            Arc::new(move |_ctx| {
                let counter = counter.clone();
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(hold).await;
                    Ok(())
                })
            }),
        );
        task.bypass_idle_check = true;
        task
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_run_on_schedule() {
        let manager = PeriodicManager::new(Arc::new(ActivityTracker::new()));
        let count = Arc::new(AtomicU32::new(0));
        manager.spawn(counting_task(
            "t",
            Duration::from_secs(10),
            Duration::from_secs(1),
            count.clone(),
            Duration::ZERO,
        ));

        tokio::time::sleep(Duration::from_secs(32)).await;
        tokio::task::yield_now().await;
        // Initial tick fires right after the delay, then every 10 s.
        assert_eq!(count.load(Ordering::SeqCst), 4);
        manager.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_ticks_are_dropped() {
        let manager = PeriodicManager::new(Arc::new(ActivityTracker::new()));
        let count = Arc::new(AtomicU32::new(0));
        // Each run takes 25 s but the interval is 10 s.
        manager.spawn(counting_task(
            "slow",
            Duration::from_secs(10),
            Duration::ZERO,
            count.clone(),
            Duration::from_secs(25),
        ));

        tokio::time::sleep(Duration::from_secs(35)).await;
        tokio::task::yield_now().await;
        let executions = count.load(Ordering::SeqCst);
        assert!(
            executions <= 2,
            "overlapping ticks must be dropped, got {executions}"
        );
        manager.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_task_never_runs() {
        let manager = PeriodicManager::new(Arc::new(ActivityTracker::new()));
        let count = Arc::new(AtomicU32::new(0));
        let mut task = counting_task(
            "off",
            Duration::from_secs(1),
            Duration::ZERO,
            count.clone(),
            Duration::ZERO,
        );
        task.enabled = false;
        manager.spawn(task);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn can_run_gates_ticks() {
        let manager = PeriodicManager::new(Arc::new(ActivityTracker::new()));
        let count = Arc::new(AtomicU32::new(0));
        let mut task = counting_task(
            "gated",
            Duration::from_secs(5),
            Duration::ZERO,
            count.clone(),
            Duration::ZERO,
        );
        task.can_run = Arc::new(|| false);
        manager.spawn(task);

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        manager.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn non_bypass_task_waits_for_idle() {
        let activity = Arc::new(ActivityTracker::new());
        let manager = PeriodicManager::new(activity.clone());
        let count = Arc::new(AtomicU32::new(0));
        let mut task = counting_task(
            "bg",
            Duration::from_secs(30),
            Duration::ZERO,
            count.clone(),
            Duration::ZERO,
        );
        task.bypass_idle_check = false;
        manager.spawn(task);

        // Keep the user "active" for the first minute.
        for _ in 0..6 {
            activity.notify_activity();
            tokio::time::sleep(Duration::from_secs(10)).await;
        }
        assert_eq!(count.load(Ordering::SeqCst), 0, "active user suppresses ticks");

        // Now go idle past the threshold.
        tokio::time::sleep(Duration::from_secs(180)).await;
        tokio::task::yield_now().await;
        assert!(count.load(Ordering::SeqCst) >= 1);
        manager.stop();
    }

    #[test]
    fn active_hours_windows() {
        assert!(in_active_hours(9, 8, 22));
        assert!(!in_active_hours(23, 8, 22));
        // Wrap-around window 22–06.
        assert!(in_active_hours(23, 22, 6));
        assert!(in_active_hours(3, 22, 6));
        assert!(!in_active_hours(12, 22, 6));
        assert!(in_active_hours(5, 5, 5));
    }

    #[test]
    fn hour_parsing() {
        assert_eq!(parse_hour("8"), Some(8));
        assert_eq!(parse_hour("08:30"), Some(8));
        assert_eq!(parse_hour("25"), None);
        assert_eq!(parse_hour("late"), None);
    }
}
