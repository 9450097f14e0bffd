//! Spawned-agent runtime: the tool loop, injection queues, the
//! wait-for-user registry, and research sub-agents.

pub mod injection;
pub mod research;
pub mod tool_loop;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use dotbot_domain::model::AgentStatus;
use injection::InjectionQueue;
use tokio_util::sync::CancellationToken;

use crate::router::MessageRouter;

/// Default ceiling for `agent.wait_for_user` when the tool call names no
/// timeout.
const DEFAULT_WAIT_MINUTES: u64 = 60;

/// Fulfills `agent.wait_for_user` suspensions.
///
/// The tool loop parks here; the orchestrator delivers the text when the
/// router matches an incoming user message to the blocked agent. Keyed on
/// agent ids — no pointers back into loops.
pub struct WaitRegistry {
    router: Arc<MessageRouter>,
    waits: Mutex<HashMap<String, oneshot::Sender<String>>>,
}

impl WaitRegistry {
    pub fn new(router: Arc<MessageRouter>) -> Self {
        Self {
            router,
            waits: Mutex::new(HashMap::new()),
        }
    }

    /// Deliver a user reply to a blocked agent. Returns false when the
    /// agent is not waiting (raced with a timeout, or never blocked).
    pub fn deliver(&self, agent_id: &str, text: &str) -> bool {
        match self.waits.lock().remove(agent_id) {
            Some(tx) => tx.send(text.to_string()).is_ok(),
            None => false,
        }
    }

    pub fn is_waiting(&self, agent_id: &str) -> bool {
        self.waits.lock().contains_key(agent_id)
    }
}

#[async_trait::async_trait]
impl tool_loop::UserWaiter for WaitRegistry {
    async fn wait_for_user(
        &self,
        agent_id: &str,
        reason: &str,
        _resume_hint: &str,
        timeout_minutes: Option<u64>,
    ) -> Option<String> {
        let (tx, rx) = oneshot::channel();
        self.waits.lock().insert(agent_id.to_string(), tx);
        self.router.set_status(agent_id, AgentStatus::Blocked);
        tracing::info!(agent_id = %agent_id, reason = %reason, "agent blocked on user");

        let timeout =
            Duration::from_secs(timeout_minutes.unwrap_or(DEFAULT_WAIT_MINUTES) * 60);
        let result = tokio::time::timeout(timeout, rx).await;

        self.waits.lock().remove(agent_id);
        self.router.set_status(agent_id, AgentStatus::Running);
        match result {
            Ok(Ok(text)) => Some(text),
            _ => None,
        }
    }
}

/// Live handles for a running agent: its injection queue, abort signal,
/// and originating prompt (reported by `cancel_before_restart`).
#[derive(Clone)]
pub struct AgentRuntime {
    pub injection: InjectionQueue,
    pub abort: CancellationToken,
    pub prompt: String,
}

/// Registry of runtimes for agents currently executing.
#[derive(Default)]
pub struct AgentRuntimes {
    inner: Mutex<HashMap<String, AgentRuntime>>,
}

impl AgentRuntimes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, agent_id: &str, prompt: &str) -> AgentRuntime {
        let runtime = AgentRuntime {
            injection: InjectionQueue::new(),
            abort: CancellationToken::new(),
            prompt: prompt.to_string(),
        };
        self.inner
            .lock()
            .insert(agent_id.to_string(), runtime.clone());
        runtime
    }

    pub fn get(&self, agent_id: &str) -> Option<AgentRuntime> {
        self.inner.lock().get(agent_id).cloned()
    }

    pub fn remove(&self, agent_id: &str) {
        self.inner.lock().remove(agent_id);
    }

    /// Abort every running agent; returns their originating prompts for
    /// the restart queue.
    pub fn cancel_all(&self) -> Vec<String> {
        let mut inner = self.inner.lock();
        let prompts: Vec<String> = inner.values().map(|r| r.prompt.clone()).collect();
        for runtime in inner.values() {
            runtime.abort.cancel();
        }
        inner.clear();
        prompts
    }
}
