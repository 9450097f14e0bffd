use serde::{Deserialize, Serialize};

/// Model roles — which tier of model a spawned agent runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelRole {
    /// Cheap, fast classification (receptionist, short path).
    Intake,
    /// Default tier for tool-driven work.
    Workhorse,
    /// Highest tier for planning-heavy or subtle tasks.
    Smart,
}

impl Default for ModelRole {
    fn default() -> Self {
        ModelRole::Workhorse
    }
}

/// Receptionist classification of an incoming prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Classification {
    Conversational,
    InfoRequest,
    Action,
    Compound,
    Continuation,
    MemoryUpdate,
}

impl Classification {
    /// Rough duration label driving progress notifications. Not a timeout.
    pub fn estimate_secs(&self) -> u64 {
        match self {
            Classification::InfoRequest => 15,
            Classification::Action => 30,
            Classification::Compound => 60,
            Classification::Continuation => 30,
            Classification::Conversational | Classification::MemoryUpdate => 10,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "CONVERSATIONAL" => Some(Classification::Conversational),
            "INFO_REQUEST" => Some(Classification::InfoRequest),
            "ACTION" => Some(Classification::Action),
            "COMPOUND" => Some(Classification::Compound),
            "CONTINUATION" => Some(Classification::Continuation),
            "MEMORY_UPDATE" => Some(Classification::MemoryUpdate),
            _ => None,
        }
    }
}

/// How urgently the pipeline treats a classified prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    /// Caller awaits agent completion before responding.
    Blocking,
    /// Acknowledged, progress is surfaced, response follows.
    Foreground,
    /// Acknowledged immediately; the agent runs detached.
    Background,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Foreground
    }
}

/// Lifecycle of a spawned agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Pending,
    Running,
    /// Suspended on `agent.wait_for_user`.
    Blocked,
    Completed,
    Failed,
}

impl AgentStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, AgentStatus::Running | AgentStatus::Blocked)
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AgentStatus::Pending => "pending",
            AgentStatus::Running => "running",
            AgentStatus::Blocked => "blocked",
            AgentStatus::Completed => "completed",
            AgentStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Research sub-agent depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResearchDepth {
    Quick,
    Moderate,
    Thorough,
}

impl ResearchDepth {
    pub fn max_iterations(&self) -> usize {
        match self {
            ResearchDepth::Quick => 5,
            ResearchDepth::Moderate => 15,
            ResearchDepth::Thorough => 30,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "quick" => Some(ResearchDepth::Quick),
            "moderate" => Some(ResearchDepth::Moderate),
            "thorough" => Some(ResearchDepth::Thorough),
            _ => None,
        }
    }
}

/// Research findings output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    PlainText,
    StructuredJson,
    Markdown,
}

impl Default for OutputFormat {
    fn default() -> Self {
        OutputFormat::PlainText
    }
}

/// Where a persona lives. Keyed on identifiers, never on pointers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum PersonaRef {
    /// On-disk persona under `~/.bot/personas/<slug>/`.
    Local { slug: String },
    /// Persona supplied by the connected device's manifest.
    Client { id: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_estimates() {
        assert_eq!(Classification::InfoRequest.estimate_secs(), 15);
        assert_eq!(Classification::Compound.estimate_secs(), 60);
        assert_eq!(Classification::MemoryUpdate.estimate_secs(), 10);
    }

    #[test]
    fn classification_parse_is_case_tolerant() {
        assert_eq!(
            Classification::parse("info_request"),
            Some(Classification::InfoRequest)
        );
        assert_eq!(Classification::parse("ACTION"), Some(Classification::Action));
        assert_eq!(Classification::parse("nonsense"), None);
    }

    #[test]
    fn depth_iterations() {
        assert_eq!(ResearchDepth::Quick.max_iterations(), 5);
        assert_eq!(ResearchDepth::Moderate.max_iterations(), 15);
        assert_eq!(ResearchDepth::Thorough.max_iterations(), 30);
    }

    #[test]
    fn active_statuses() {
        assert!(AgentStatus::Running.is_active());
        assert!(AgentStatus::Blocked.is_active());
        assert!(!AgentStatus::Completed.is_active());
        assert!(!AgentStatus::Pending.is_active());
    }
}
