//! Per-session message router.
//!
//! Owns the indexed conversation feed, the feed-index → agent
//! assignments, and the authoritative registry of spawned agents.
//! Everything else refers to agents by id — never by pointer — so there
//! are no cycles between agents and the router.
//!
//! The router is the oracle the orchestrator consults to answer "which
//! of the running agents is this follow-up for?".

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use dotbot_domain::model::{AgentStatus, ModelRole};

/// A server-side agent spawned for one sub-task of a user prompt.
#[derive(Debug, Clone)]
pub struct SpawnedAgent {
    pub id: String,
    /// Short display topic ("morning with kids").
    pub topic: String,
    /// The natural-language task given to the agent.
    pub task: String,
    pub system_prompt: String,
    /// Tool ids the planner granted this agent.
    pub allowed_tools: Vec<String>,
    pub model_role: ModelRole,
    pub status: AgentStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct Assignment {
    agent_id: String,
    #[allow(dead_code)]
    topic: String,
}

/// Minimum meaningful keyword score. At or below this only the recency
/// bias contributed, so keyword routing has no real signal.
const MIN_SIGNAL: f32 = 0.1;

/// Recency bias added to the most recently created candidate.
const RECENCY_BIAS: f32 = 0.1;

pub struct MessageRouter {
    feed: RwLock<Vec<String>>,
    assignments: RwLock<HashMap<usize, Assignment>>,
    agents: RwLock<HashMap<String, SpawnedAgent>>,
}

impl Default for MessageRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageRouter {
    pub fn new() -> Self {
        Self {
            feed: RwLock::new(Vec::new()),
            assignments: RwLock::new(HashMap::new()),
            agents: RwLock::new(HashMap::new()),
        }
    }

    // ── Feed ───────────────────────────────────────────────────────

    /// Append a message to the conversation feed, returning its index.
    pub fn push_message(&self, text: &str) -> usize {
        let mut feed = self.feed.write();
        feed.push(text.to_string());
        feed.len() - 1
    }

    /// Assign a feed index to an agent.
    pub fn assign(&self, index: usize, agent_id: &str, topic: &str) {
        self.assignments.write().insert(
            index,
            Assignment {
                agent_id: agent_id.to_string(),
                topic: topic.to_string(),
            },
        );
    }

    /// The subset of the feed assigned to an agent, in feed order.
    pub fn messages_for(&self, agent_id: &str) -> Vec<String> {
        let feed = self.feed.read();
        let assignments = self.assignments.read();
        let mut indices: Vec<usize> = assignments
            .iter()
            .filter(|(_, a)| a.agent_id == agent_id)
            .map(|(i, _)| *i)
            .collect();
        indices.sort_unstable();
        indices
            .into_iter()
            .filter_map(|i| feed.get(i).cloned())
            .collect()
    }

    // ── Agent registry ─────────────────────────────────────────────

    pub fn register_agent(&self, agent: SpawnedAgent) {
        self.agents.write().insert(agent.id.clone(), agent);
    }

    pub fn get_agent(&self, agent_id: &str) -> Option<SpawnedAgent> {
        self.agents.read().get(agent_id).cloned()
    }

    pub fn set_status(&self, agent_id: &str, status: AgentStatus) {
        if let Some(a) = self.agents.write().get_mut(agent_id) {
            tracing::debug!(agent_id = %agent_id, from = %a.status, to = %status, "agent status");
            a.status = status;
        }
    }

    /// Agents in `running` or `blocked` state.
    pub fn active_agents(&self) -> Vec<SpawnedAgent> {
        let mut out: Vec<_> = self
            .agents
            .read()
            .values()
            .filter(|a| a.status.is_active())
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        out
    }

    pub fn any_blocked(&self) -> bool {
        self.agents
            .read()
            .values()
            .any(|a| a.status == AgentStatus::Blocked)
    }

    /// Compact context block for the receptionist:
    /// one `- [id] "topic" (status)` line per active agent.
    pub fn active_summary(&self) -> String {
        self.active_agents()
            .iter()
            .map(|a| format!("- [{}] \"{}\" ({})", a.id, a.topic, a.status))
            .collect::<Vec<_>>()
            .join("\n")
    }

    // ── Follow-up routing ──────────────────────────────────────────

    /// Which agent is this message for?
    ///
    /// Candidates are all registered agents, or only active ones. One
    /// candidate wins outright. A single blocked agent claims the message
    /// unconditionally — the user is answering its `wait_for_user`.
    /// Otherwise candidates are scored by keyword overlap against
    /// topic + task with a recency bias; when only recency contributed,
    /// active-only mode falls back to the newest agent while all-agents
    /// mode reports no match (treat as a new topic).
    pub fn find_best(&self, message: &str, active_only: bool) -> Option<SpawnedAgent> {
        let candidates: Vec<SpawnedAgent> = if active_only {
            self.active_agents()
        } else {
            let mut all: Vec<_> = self.agents.read().values().cloned().collect();
            all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
            all
        };

        if candidates.is_empty() {
            return None;
        }
        if candidates.len() == 1 {
            return Some(candidates.into_iter().next().unwrap());
        }

        if active_only {
            let blocked: Vec<&SpawnedAgent> = candidates
                .iter()
                .filter(|a| a.status == AgentStatus::Blocked)
                .collect();
            if blocked.len() == 1 {
                return Some(blocked[0].clone());
            }
        }

        let tokens = keyword_tokens(message);
        let newest = candidates
            .iter()
            .max_by_key(|a| a.created_at)
            .map(|a| a.id.clone());

        let mut best: Option<(f32, &SpawnedAgent)> = None;
        for agent in &candidates {
            let haystack = format!("{} {}", agent.topic, agent.task).to_lowercase();
            let overlap = tokens.iter().filter(|t| haystack.contains(*t)).count();
            let mut score = if tokens.is_empty() {
                0.0
            } else {
                overlap as f32 / tokens.len() as f32
            };
            if newest.as_deref() == Some(agent.id.as_str()) {
                score += RECENCY_BIAS;
            }
            let better = match &best {
                Some((best_score, _)) => score > *best_score,
                None => true,
            };
            if better {
                best = Some((score, agent));
            }
        }

        let (score, agent) = best?;
        if score <= MIN_SIGNAL {
            return if active_only {
                // The user is most likely still talking to the newest agent.
                candidates.iter().max_by_key(|a| a.created_at).cloned()
            } else {
                None
            };
        }
        Some(agent.clone())
    }
}

/// Lowercased tokens longer than two characters.
fn keyword_tokens(message: &str) -> Vec<String> {
    message
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 2)
        .map(|t| t.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn agent(id: &str, topic: &str, task: &str, status: AgentStatus, age_secs: i64) -> SpawnedAgent {
        SpawnedAgent {
            id: id.into(),
            topic: topic.into(),
            task: task.into(),
            system_prompt: String::new(),
            allowed_tools: Vec::new(),
            model_role: ModelRole::Workhorse,
            status,
            created_at: Utc::now() - Duration::seconds(age_secs),
        }
    }

    #[test]
    fn feed_assignment_partitions_messages() {
        let router = MessageRouter::new();
        let i0 = router.push_message("plan the morning");
        let i1 = router.push_message("draft the proposal");
        let i2 = router.push_message("make it shorter");
        router.assign(i0, "a", "morning");
        router.assign(i1, "b", "proposal");
        router.assign(i2, "b", "proposal");

        assert_eq!(router.messages_for("a"), vec!["plan the morning"]);
        assert_eq!(
            router.messages_for("b"),
            vec!["draft the proposal", "make it shorter"]
        );
    }

    #[test]
    fn single_candidate_wins_outright() {
        let router = MessageRouter::new();
        router.register_agent(agent("a", "inbox", "triage inbox", AgentStatus::Running, 10));
        let hit = router.find_best("anything at all", true).unwrap();
        assert_eq!(hit.id, "a");
    }

    #[test]
    fn keyword_overlap_routes_follow_up() {
        // Scenario S6: "make it shorter" goes to the proposal agent.
        let router = MessageRouter::new();
        router.register_agent(agent(
            "a",
            "morning with kids",
            "plan my morning with the kids",
            AgentStatus::Running,
            20,
        ));
        router.register_agent(agent(
            "b",
            "business proposal",
            "draft the business proposal and keep it shorter than one page",
            AgentStatus::Running,
            10,
        ));

        let hit = router.find_best("make the proposal shorter", true).unwrap();
        assert_eq!(hit.id, "b");
        assert_eq!(router.messages_for("a").len(), 0);
    }

    #[test]
    fn single_blocked_agent_claims_message_unconditionally() {
        let router = MessageRouter::new();
        router.register_agent(agent(
            "a",
            "weather",
            "check the weather",
            AgentStatus::Running,
            5,
        ));
        router.register_agent(agent(
            "b",
            "discord",
            "send a discord message",
            AgentStatus::Blocked,
            30,
        ));

        // Zero keyword overlap with b, but b is the only blocked agent.
        let hit = router.find_best("yes go ahead", true).unwrap();
        assert_eq!(hit.id, "b");
    }

    #[test]
    fn no_signal_active_mode_returns_newest() {
        let router = MessageRouter::new();
        router.register_agent(agent("old", "alpha", "alpha task", AgentStatus::Running, 100));
        router.register_agent(agent("new", "beta", "beta task", AgentStatus::Running, 1));

        let hit = router.find_best("zzz qqq", true).unwrap();
        assert_eq!(hit.id, "new");
    }

    #[test]
    fn no_signal_all_mode_returns_none() {
        let router = MessageRouter::new();
        router.register_agent(agent("a", "alpha", "alpha task", AgentStatus::Completed, 100));
        router.register_agent(agent("b", "beta", "beta task", AgentStatus::Completed, 1));

        assert!(router.find_best("zzz qqq", false).is_none());
    }

    #[test]
    fn active_summary_format() {
        let router = MessageRouter::new();
        router.register_agent(agent("a1", "inbox triage", "triage", AgentStatus::Running, 10));
        router.register_agent(agent("a2", "report", "write", AgentStatus::Blocked, 5));
        router.register_agent(agent("a3", "done", "done", AgentStatus::Completed, 1));

        let summary = router.active_summary();
        assert!(summary.contains("- [a1] \"inbox triage\" (running)"));
        assert!(summary.contains("- [a2] \"report\" (blocked)"));
        assert!(!summary.contains("a3"));
    }

    #[test]
    fn short_tokens_are_ignored() {
        assert_eq!(keyword_tokens("go to it an"), Vec::<String>::new());
        assert_eq!(
            keyword_tokens("Send THE Discord message!"),
            vec!["send", "discord", "message"]
        );
    }
}
