//! Research sub-agents.
//!
//! A `agent.request_research` call spawns a fresh agent configured from
//! the depth table, runs its tool loop to completion, and hands the
//! findings string back to the requesting loop. The sub-agent references
//! its parent by id only.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use dotbot_domain::config::LoopConfig;
use dotbot_domain::error::Result;
use dotbot_domain::model::{AgentStatus, ModelRole, OutputFormat, ResearchDepth};
use dotbot_domain::tool::ToolDefinition;
use dotbot_providers::LlmProvider;

use crate::router::{MessageRouter, SpawnedAgent};
use crate::tools::ToolDispatcher;

use super::injection::InjectionQueue;
use super::tool_loop::{ResearchRunner, ToolLoop, ToolLoopInput, UserWaiter};

const RESEARCH_SYSTEM_PROMPT: &str = "You are a research agent. Find the answer to the \
query using your tools. Report what you found with sources. No opinions, no advice — \
just findings.";

/// Tool categories granted per depth.
fn categories_for(depth: ResearchDepth) -> &'static [&'static str] {
    match depth {
        ResearchDepth::Quick => &["search"],
        ResearchDepth::Moderate => &["search", "http", "knowledge"],
        ResearchDepth::Thorough => &["search", "http", "knowledge", "filesystem", "knowledge.ingest"],
    }
}

fn format_instruction(format: OutputFormat) -> &'static str {
    match format {
        OutputFormat::PlainText => "Report your findings as plain text.",
        OutputFormat::StructuredJson => {
            "Report your findings as a single JSON object with keys \
             `answer`, `sources` (array), and `confidence`."
        }
        OutputFormat::Markdown => "Report your findings as markdown with a Sources section.",
    }
}

/// Supplies the full tool manifest research agents filter from.
pub trait ManifestSource: Send + Sync {
    fn manifest(&self) -> Vec<ToolDefinition>;
}

pub struct ResearchService {
    pub provider: Arc<dyn LlmProvider>,
    pub dispatcher: Arc<dyn ToolDispatcher>,
    pub manifest: Arc<dyn ManifestSource>,
    pub router: Arc<MessageRouter>,
    pub loop_config: LoopConfig,
}

/// Research agents never block on the user.
struct NeverWait;
#[async_trait::async_trait]
impl UserWaiter for NeverWait {
    async fn wait_for_user(&self, _: &str, _: &str, _: &str, _: Option<u64>) -> Option<String> {
        None
    }
}

/// And they cannot recurse into further research.
struct NoNestedResearch;
#[async_trait::async_trait]
impl ResearchRunner for NoNestedResearch {
    async fn run_research(
        &self,
        _: &str,
        _: &str,
        _: ResearchDepth,
        _: OutputFormat,
    ) -> Result<String> {
        Ok("(research agents cannot spawn nested research)".into())
    }
}

#[async_trait::async_trait]
impl ResearchRunner for ResearchService {
    async fn run_research(
        &self,
        parent_agent_id: &str,
        query: &str,
        depth: ResearchDepth,
        format: OutputFormat,
    ) -> Result<String> {
        let agent_id = format!("research-{}", &uuid::Uuid::new_v4().to_string()[..8]);
        let categories = categories_for(depth);
        let tools: Vec<ToolDefinition> = self
            .manifest
            .manifest()
            .into_iter()
            .filter(|t| {
                categories
                    .iter()
                    .any(|c| t.category == *c || t.category.starts_with(&format!("{c}.")))
            })
            .collect();

        self.router.register_agent(SpawnedAgent {
            id: agent_id.clone(),
            topic: format!("research: {query}"),
            task: query.to_string(),
            system_prompt: RESEARCH_SYSTEM_PROMPT.to_string(),
            allowed_tools: tools.iter().map(|t| t.name.clone()).collect(),
            model_role: ModelRole::Workhorse,
            status: AgentStatus::Running,
            created_at: chrono::Utc::now(),
        });
        tracing::info!(
            agent_id = %agent_id,
            parent = %parent_agent_id,
            ?depth,
            tools = tools.len(),
            "research sub-agent spawned"
        );

        let mut config = self.loop_config.clone();
        config.max_iterations = depth.max_iterations();

        let (events, mut events_rx) = mpsc::channel(64);
        // Drain events quietly; research progress is not user-facing.
        tokio::spawn(async move { while events_rx.recv().await.is_some() {} });

        let tool_loop = ToolLoop {
            provider: self.provider.clone(),
            dispatcher: self.dispatcher.clone(),
            waiter: Arc::new(NeverWait),
            research: Arc::new(NoNestedResearch),
            injection: InjectionQueue::new(),
            abort: CancellationToken::new(),
            events,
            config,
        };

        let user_message = format!("{query}\n\n{}", format_instruction(format));
        let outcome = tool_loop
            .run(ToolLoopInput {
                agent_id: agent_id.clone(),
                system_prompt: RESEARCH_SYSTEM_PROMPT.to_string(),
                user_message,
                history: Vec::new(),
                tools,
                model: None,
                temperature: None,
                max_tokens: None,
                skill_nudge: false,
            })
            .await;

        self.router.set_status(
            &agent_id,
            if outcome.completed {
                AgentStatus::Completed
            } else {
                AgentStatus::Failed
            },
        );
        Ok(outcome.final_response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::DispatchOutcome;
    use dotbot_providers::scripted::{ScriptedProvider, ScriptedTurn};
    use serde_json::Value;

    struct FixedManifest(Vec<ToolDefinition>);
    impl ManifestSource for FixedManifest {
        fn manifest(&self) -> Vec<ToolDefinition> {
            self.0.clone()
        }
    }

    struct OkDispatcher;
    #[async_trait::async_trait]
    impl ToolDispatcher for OkDispatcher {
        async fn dispatch(&self, _: &ToolDefinition, _: &Value) -> DispatchOutcome {
            DispatchOutcome::ok("search hit")
        }
        fn tools_in_categories(&self, _: &[String]) -> Vec<ToolDefinition> {
            Vec::new()
        }
    }

    fn def(name: &str, category: &str) -> ToolDefinition {
        ToolDefinition {
            name: name.into(),
            description: String::new(),
            parameters: serde_json::json!({"type": "object"}),
            category: category.into(),
        }
    }

    #[tokio::test]
    async fn quick_depth_gets_search_tools_only() {
        let provider = Arc::new(ScriptedProvider::new(
            "s",
            vec![ScriptedTurn::Text("found it".into())],
        ));
        let requests = provider.requests();
        let router = Arc::new(MessageRouter::new());
        let service = ResearchService {
            provider,
            dispatcher: Arc::new(OkDispatcher),
            manifest: Arc::new(FixedManifest(vec![
                def("search.web", "search"),
                def("http.get", "http"),
                def("filesystem.read_file", "filesystem"),
            ])),
            router: router.clone(),
            loop_config: LoopConfig::default(),
        };

        let findings = service
            .run_research("parent-1", "what is tokio", ResearchDepth::Quick, OutputFormat::PlainText)
            .await
            .unwrap();
        assert_eq!(findings, "found it");

        let reqs = requests.lock();
        let tool_names: Vec<&str> = reqs[0].tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(tool_names, vec!["search.web"]);

        // The sub-agent completed and is registered by id.
        let research_agents = router
            .find_best("tokio research", false)
            .map(|a| a.status);
        assert_eq!(research_agents, Some(AgentStatus::Completed));
    }

    #[tokio::test]
    async fn thorough_depth_widens_tools_and_iterations() {
        let provider = Arc::new(ScriptedProvider::new(
            "s",
            vec![ScriptedTurn::Text("deep findings".into())],
        ));
        let requests = provider.requests();
        let service = ResearchService {
            provider,
            dispatcher: Arc::new(OkDispatcher),
            manifest: Arc::new(FixedManifest(vec![
                def("search.web", "search"),
                def("http.get", "http"),
                def("filesystem.read_file", "filesystem"),
                def("knowledge.ingest_doc", "knowledge.ingest"),
            ])),
            router: Arc::new(MessageRouter::new()),
            loop_config: LoopConfig::default(),
        };

        service
            .run_research("p", "q", ResearchDepth::Thorough, OutputFormat::Markdown)
            .await
            .unwrap();
        let reqs = requests.lock();
        assert_eq!(reqs[0].tools.len(), 4);
        // The format instruction rides along in the user message.
        let user_text = reqs[0]
            .messages
            .last()
            .unwrap()
            .content
            .extract_all_text();
        assert!(user_text.contains("markdown"));
    }
}
