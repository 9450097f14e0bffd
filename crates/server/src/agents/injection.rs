//! Per-agent injection queue.
//!
//! External actors — user replies landing while an agent runs, watchdog
//! interventions — push text here; the tool loop drains it at the top of
//! every iteration and injects the text as fresh user messages.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

#[derive(Clone, Default)]
pub struct InjectionQueue {
    queue: Arc<Mutex<VecDeque<String>>>,
}

impl InjectionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, text: impl Into<String>) {
        self.queue.lock().push_back(text.into());
    }

    /// Take everything queued, in push order.
    pub fn drain(&self) -> Vec<String> {
        self.queue.lock().drain(..).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drains_in_push_order_once() {
        let q = InjectionQueue::new();
        q.push("first");
        q.push("second");
        assert_eq!(q.drain(), vec!["first", "second"]);
        assert!(q.drain().is_empty());
        assert!(q.is_empty());
    }

    #[test]
    fn clones_share_the_queue() {
        let q = InjectionQueue::new();
        let q2 = q.clone();
        q2.push("via clone");
        assert_eq!(q.drain(), vec!["via clone"]);
    }
}
