//! Reconnect policy: exponential backoff with a one-hour circuit
//! breaker and an attempt-count escape hatch.
//!
//! The breaker clock starts at the first failure of a streak and only
//! resets when a connection is truly established (authenticated), not on
//! a TCP connect that dies during the handshake.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// Exit code: permanent failure, launcher must not restart us.
pub const EXIT_PERMANENT: i32 = 1;
/// Exit code: launcher, restart me (clears internal stale state).
pub const EXIT_RESTART: i32 = 42;

/// How long a failing streak may last before giving up for good.
const BREAKER_WINDOW_SECS: i64 = 3600;
/// Attempt ceiling inside the breaker window.
const MAX_ATTEMPTS: u32 = 50;

/// `min(2s · 2^(n−1), 60s)` for attempt `n` (1-based).
pub fn backoff_delay(attempt: u32) -> Duration {
    let attempt = attempt.max(1);
    let exp = attempt.saturating_sub(1).min(6); // 2·2^6 > 60 already
    let secs = (2u64 << exp).min(60);
    Duration::from_secs(secs)
}

/// What the connect loop should do next after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextStep {
    /// Sleep this long and try again.
    Retry(Duration),
    /// Exit 1 — the streak outlived the breaker window.
    GiveUp,
    /// Exit 42 — too many attempts; ask the launcher for a fresh process.
    AskForRestart,
}

/// Tracks the current failing streak.
#[derive(Debug, Default)]
pub struct CircuitBreaker {
    attempts: u32,
    streak_started: Option<DateTime<Utc>>,
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure and decide the next step.
    pub fn on_failure(&mut self, now: DateTime<Utc>) -> NextStep {
        let started = *self.streak_started.get_or_insert(now);
        self.attempts += 1;

        if (now - started).num_seconds() > BREAKER_WINDOW_SECS {
            return NextStep::GiveUp;
        }
        if self.attempts > MAX_ATTEMPTS {
            return NextStep::AskForRestart;
        }
        NextStep::Retry(backoff_delay(self.attempts))
    }

    /// A connection was fully established: the streak is over.
    pub fn on_established(&mut self) {
        self.attempts = 0;
        self.streak_started = None;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn backoff_table() {
        assert_eq!(backoff_delay(1), Duration::from_secs(2));
        assert_eq!(backoff_delay(2), Duration::from_secs(4));
        assert_eq!(backoff_delay(5), Duration::from_secs(32));
        assert_eq!(backoff_delay(6), Duration::from_secs(60));
        assert_eq!(backoff_delay(40), Duration::from_secs(60));
    }

    #[test]
    fn breaker_trips_after_an_hour() {
        let mut breaker = CircuitBreaker::new();
        let t0 = Utc::now();
        assert_eq!(
            breaker.on_failure(t0),
            NextStep::Retry(Duration::from_secs(2))
        );
        // Still inside the hour: retries continue.
        let t1 = t0 + ChronoDuration::minutes(59);
        assert!(matches!(breaker.on_failure(t1), NextStep::Retry(_)));
        // Past the hour: give up.
        let t2 = t0 + ChronoDuration::minutes(61);
        assert_eq!(breaker.on_failure(t2), NextStep::GiveUp);
    }

    #[test]
    fn attempt_ceiling_asks_for_restart() {
        let mut breaker = CircuitBreaker::new();
        let t0 = Utc::now();
        for i in 1..=MAX_ATTEMPTS {
            let step = breaker.on_failure(t0 + ChronoDuration::seconds(i as i64));
            assert!(matches!(step, NextStep::Retry(_)), "attempt {i}");
        }
        assert_eq!(
            breaker.on_failure(t0 + ChronoDuration::seconds(51)),
            NextStep::AskForRestart
        );
    }

    #[test]
    fn established_resets_the_streak() {
        let mut breaker = CircuitBreaker::new();
        let t0 = Utc::now();
        breaker.on_failure(t0);
        breaker.on_failure(t0);
        breaker.on_established();
        assert_eq!(breaker.attempts(), 0);
        // A fresh failure starts a fresh streak with the short delay.
        assert_eq!(
            breaker.on_failure(t0 + ChronoDuration::hours(2)),
            NextStep::Retry(Duration::from_secs(2))
        );
    }
}
