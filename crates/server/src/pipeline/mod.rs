//! Orchestration pipeline: short path → receptionist → planner → spawn →
//! synthesize.
//!
//! One orchestrator per connected device session. Failures at any stage
//! collapse to a generic conversational reply; the underlying error is
//! logged and tracked agents flip to failed.

pub mod planner;
pub mod receptionist;
pub mod shortpath;

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;

use dotbot_domain::config::LoopConfig;
use dotbot_domain::error::Result;
use dotbot_domain::model::{AgentStatus, Classification, Priority};
use dotbot_domain::tool::{Message, ToolDefinition};
use dotbot_protocol::{
    AgentEvent, FinalResponse, ResponseSection, ServerEnvelope, ServerPayload, StreamChunk,
    TaskAcknowledged, ThreadUpdate,
};
use dotbot_providers::{ChatRequest, LlmProvider, ProviderRegistry};

use crate::agents::research::ManifestSource;
use crate::agents::tool_loop::{
    LoopEvent, ResearchRunner, ToolLoop, ToolLoopInput, ToolLoopOutcome,
};
use crate::agents::{AgentRuntimes, WaitRegistry};
use crate::channel::session::SessionRegistry;
use crate::mcp_gateway::McpGateway;
use crate::router::{MessageRouter, SpawnedAgent};
use crate::tools::ToolDispatcher;

use planner::AgentPlan;
use shortpath::{IdentityRecord, ShortPath};

const GENERIC_ERROR: &str =
    "I ran into an error handling that — sorry. Mind trying again, or rephrasing?";

pub struct Orchestrator {
    pub device_id: String,
    pub user_id: String,
    pub providers: Arc<ProviderRegistry>,
    pub router: Arc<MessageRouter>,
    pub waits: Arc<WaitRegistry>,
    pub runtimes: Arc<AgentRuntimes>,
    pub dispatcher: Arc<dyn ToolDispatcher>,
    pub research: Arc<dyn ResearchRunner>,
    pub sessions: Arc<SessionRegistry>,
    pub mcp: Arc<McpGateway>,
    pub loop_config: LoopConfig,
    pub identity: RwLock<IdentityRecord>,
}

/// Manifest view handed to research sub-agents: the device manifest plus
/// MCP discoveries plus the navigator tools. Keyed on the device id, so
/// no reference cycle back into the orchestrator.
pub struct DeviceManifest {
    pub sessions: Arc<SessionRegistry>,
    pub mcp: Arc<McpGateway>,
    pub device_id: String,
}

impl ManifestSource for DeviceManifest {
    fn manifest(&self) -> Vec<ToolDefinition> {
        let mut manifest = self.sessions.manifest(&self.device_id);
        manifest.extend(self.mcp.manifest(&self.device_id));
        manifest.extend(crate::collections::navigator_tool_defs());
        manifest
    }
}

impl Orchestrator {
    /// The device manifest, MCP-discovered tools, and the navigator's
    /// `result.*` tools.
    pub fn full_manifest(&self) -> Vec<ToolDefinition> {
        let mut manifest = self.sessions.manifest(&self.device_id);
        manifest.extend(self.mcp.manifest(&self.device_id));
        manifest.extend(crate::collections::navigator_tool_defs());
        manifest
    }

    async fn notify(&self, payload: ServerPayload) {
        if let Some(sink) = self.sessions.get_sink(&self.device_id) {
            let _ = sink.send(ServerEnvelope::new(payload)).await;
        }
    }

    /// Run one user prompt through the pipeline.
    pub async fn run(self: &Arc<Self>, prompt: &str) -> FinalResponse {
        match self.run_inner(prompt).await {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(device_id = %self.device_id, error = %e, "pipeline stage failed");
                FinalResponse {
                    text: GENERIC_ERROR.to_string(),
                    sections: Vec::new(),
                    task_ids: Vec::new(),
                }
            }
        }
    }

    async fn run_inner(self: &Arc<Self>, prompt: &str) -> Result<FinalResponse> {
        let index = self.router.push_message(prompt);

        // A reply for a blocked agent takes precedence over everything.
        if self.router.any_blocked() {
            if let Some(agent) = self.router.find_best(prompt, true) {
                if agent.status == AgentStatus::Blocked && self.waits.deliver(&agent.id, prompt) {
                    self.router.assign(index, &agent.id, &agent.topic);
                    return Ok(text_response(format!(
                        "Passed that along to the agent working on \"{}\".",
                        agent.topic
                    )));
                }
            }
        }

        // Short-path bypass.
        let short_path = ShortPath {
            provider: self
                .providers
                .for_role(dotbot_domain::model::ModelRole::Intake)?,
            identity: self.identity.read().clone(),
        };
        if let Some(reply) = short_path
            .try_handle(prompt, self.router.any_blocked())
            .await
        {
            return Ok(text_response(reply));
        }

        // Receptionist.
        let intake = self
            .providers
            .for_role(dotbot_domain::model::ModelRole::Intake)?;
        let decision =
            receptionist::classify(&intake, prompt, &self.router.active_summary()).await?;

        self.notify(ServerPayload::TaskAcknowledged(TaskAcknowledged {
            acknowledgment: decision.acknowledgment.clone(),
            prompt: prompt.to_string(),
            estimated_label: format!("~{}s", decision.classification.estimate_secs()),
        }))
        .await;

        match decision.classification {
            Classification::Conversational | Classification::MemoryUpdate => {
                let reply = self.converse(prompt).await?;
                Ok(text_response(reply))
            }
            Classification::Continuation => {
                if let Some(agent) = self.router.find_best(prompt, true) {
                    self.router.assign(index, &agent.id, &agent.topic);
                    if agent.status == AgentStatus::Blocked {
                        self.waits.deliver(&agent.id, prompt);
                    } else if let Some(runtime) = self.runtimes.get(&agent.id) {
                        runtime.injection.push(prompt);
                    }
                    Ok(text_response(format!(
                        "Folding that into the work on \"{}\".",
                        agent.topic
                    )))
                } else {
                    // Nothing to continue — converse rather than stall.
                    let reply = self.converse(prompt).await?;
                    Ok(text_response(reply))
                }
            }
            Classification::InfoRequest | Classification::Action | Classification::Compound => {
                let smart = self
                    .providers
                    .for_role(dotbot_domain::model::ModelRole::Smart)?;
                let manifest = self.full_manifest();
                let plans = planner::plan(&smart, &decision.subtasks, &manifest).await?;
                self.spawn_and_collect(prompt, index, plans, decision.priority, manifest)
                    .await
            }
        }
    }

    /// Plain conversational reply in the persona's voice.
    async fn converse(&self, prompt: &str) -> Result<String> {
        let identity = self.identity.read().clone();
        let provider = self
            .providers
            .for_role(dotbot_domain::model::ModelRole::Intake)?;
        let system = format!(
            "You are {}. {} Keep replies short and natural.",
            if identity.name.is_empty() {
                "a personal assistant"
            } else {
                &identity.name
            },
            identity.instructions,
        );
        let response = provider
            .chat(ChatRequest {
                messages: vec![Message::system(system), Message::user(prompt)],
                tools: Vec::new(),
                temperature: Some(0.7),
                max_tokens: Some(400),
                model: None,
            })
            .await?;
        Ok(response.content)
    }

    async fn spawn_and_collect(
        self: &Arc<Self>,
        prompt: &str,
        feed_index: usize,
        plans: Vec<AgentPlan>,
        priority: Priority,
        manifest: Vec<ToolDefinition>,
    ) -> Result<FinalResponse> {
        let mut spawned: Vec<(String, AgentPlan)> = Vec::new();
        for plan in plans {
            let agent_id = format!("agent-{}", &uuid::Uuid::new_v4().to_string()[..8]);
            self.router.register_agent(SpawnedAgent {
                id: agent_id.clone(),
                topic: plan.topic.clone(),
                task: plan.task.clone(),
                system_prompt: String::new(),
                allowed_tools: plan.tools.clone(),
                model_role: plan.model_role,
                status: AgentStatus::Running,
                created_at: chrono::Utc::now(),
            });
            self.router.assign(feed_index, &agent_id, &plan.topic);
            self.runtimes.create(&agent_id, prompt);
            self.notify(ServerPayload::AgentStarted(AgentEvent {
                agent_id: agent_id.clone(),
                topic: plan.topic.clone(),
                detail: None,
            }))
            .await;
            spawned.push((agent_id, plan));
        }
        let task_ids: Vec<String> = spawned.iter().map(|(id, _)| id.clone()).collect();

        if priority == Priority::Background {
            let orchestrator = self.clone();
            let manifest = manifest.clone();
            tokio::spawn(async move {
                let results = orchestrator.run_agents(spawned, manifest).await;
                let response = synthesize(&results);
                orchestrator
                    .notify(ServerPayload::Response(response))
                    .await;
            });
            return Ok(FinalResponse {
                text: "Working on it in the background — I'll report back.".to_string(),
                sections: Vec::new(),
                task_ids,
            });
        }

        let results = self.run_agents(spawned, manifest).await;
        let mut response = synthesize(&results);
        response.task_ids = task_ids;
        Ok(response)
    }

    /// Run spawned agents concurrently and gather `(topic, text)` pairs.
    async fn run_agents(
        self: &Arc<Self>,
        spawned: Vec<(String, AgentPlan)>,
        manifest: Vec<ToolDefinition>,
    ) -> Vec<(String, String)> {
        let futures: Vec<_> = spawned
            .into_iter()
            .map(|(agent_id, plan)| {
                let orchestrator = self.clone();
                let manifest = manifest.clone();
                async move {
                    let topic = plan.topic.clone();
                    let text = orchestrator.run_agent(&agent_id, plan, &manifest).await;
                    (topic, text)
                }
            })
            .collect();
        futures_util::future::join_all(futures).await
    }

    async fn run_agent(
        self: &Arc<Self>,
        agent_id: &str,
        plan: AgentPlan,
        manifest: &[ToolDefinition],
    ) -> String {
        let runtime = match self.runtimes.get(agent_id) {
            Some(r) => r,
            None => return GENERIC_ERROR.to_string(),
        };
        let provider = match self.providers.for_role(plan.model_role) {
            Ok(p) => p,
            Err(e) => {
                tracing::error!(agent_id = %agent_id, error = %e, "no provider for role");
                self.router.set_status(agent_id, AgentStatus::Failed);
                return GENERIC_ERROR.to_string();
            }
        };

        let tools: Vec<ToolDefinition> = manifest
            .iter()
            .filter(|t| plan.tools.contains(&t.name))
            .cloned()
            .collect();

        let identity = self.identity.read().clone();
        let system_prompt = agent_system_prompt(&identity, &plan.topic);

        // Forward loop events to the device as progress envelopes.
        let (events, mut events_rx) = mpsc::channel::<LoopEvent>(64);
        let sessions = self.sessions.clone();
        let device_id = self.device_id.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                let payload = match event {
                    LoopEvent::LlmTurn {
                        agent_id, content, ..
                    } if !content.is_empty() => Some(ServerPayload::StreamChunk(StreamChunk {
                        agent_id,
                        text: content,
                    })),
                    LoopEvent::ToolInvocation {
                        agent_id, tool, ..
                    } => Some(ServerPayload::TaskProgress(AgentEvent {
                        agent_id,
                        topic: String::new(),
                        detail: Some(format!("running {tool}")),
                    })),
                    LoopEvent::Waiting {
                        agent_id,
                        reason,
                        resume_hint,
                    } => Some(ServerPayload::TaskProgress(AgentEvent {
                        agent_id,
                        topic: String::new(),
                        detail: Some(format!("waiting on you: {reason} ({resume_hint})")),
                    })),
                    _ => None,
                };
                if let Some(payload) = payload {
                    if let Some(sink) = sessions.get_sink(&device_id) {
                        let _ = sink.send(ServerEnvelope::new(payload)).await;
                    }
                }
            }
        });

        let tool_loop = ToolLoop {
            provider,
            dispatcher: self.dispatcher.clone(),
            waiter: self.waits.clone(),
            research: self.research.clone(),
            injection: runtime.injection.clone(),
            abort: runtime.abort.clone(),
            events,
            config: self.loop_config.clone(),
        };
        let outcome = tool_loop
            .run(ToolLoopInput {
                agent_id: agent_id.to_string(),
                system_prompt,
                user_message: plan.task.clone(),
                history: Vec::new(),
                tools,
                model: None,
                temperature: None,
                max_tokens: None,
                skill_nudge: true,
            })
            .await;
        forwarder.abort();

        self.finish_agent(agent_id, &plan.topic, &outcome).await;
        outcome.final_response
    }

    async fn finish_agent(&self, agent_id: &str, topic: &str, outcome: &ToolLoopOutcome) {
        let status = if outcome.completed {
            AgentStatus::Completed
        } else {
            AgentStatus::Failed
        };
        self.router.set_status(agent_id, status);
        self.runtimes.remove(agent_id);
        self.notify(ServerPayload::AgentComplete(AgentEvent {
            agent_id: agent_id.to_string(),
            topic: topic.to_string(),
            detail: outcome.escalated.as_ref().map(|e| e.reason.clone()),
        }))
        .await;
        // The thread store lives on the client; hand it the turn.
        self.notify(ServerPayload::SaveToThread(ThreadUpdate {
            thread_id: format!("thread-{agent_id}"),
            role: "assistant".to_string(),
            text: outcome.final_response.clone(),
            topic: topic.to_string(),
        }))
        .await;
    }

    /// Abort all running agents; returns their prompts for the restart
    /// queue (`cancel_before_restart`).
    pub fn cancel_all(&self) -> Vec<String> {
        let prompts = self.runtimes.cancel_all();
        for agent in self.router.active_agents() {
            self.router.set_status(&agent.id, AgentStatus::Failed);
        }
        prompts
    }
}

fn agent_system_prompt(identity: &IdentityRecord, topic: &str) -> String {
    let mut prompt = String::new();
    if !identity.name.is_empty() {
        prompt.push_str(&format!(
            "You are {}, working on behalf of your user. ",
            identity.name
        ));
    }
    prompt.push_str(&format!(
        "You are a focused agent handling: {topic}. Use your tools to finish the task. \
         Call agent.wait_for_user if you need the user, agent.escalate if you lack the \
         right tools, agent.request_research for open-ended questions."
    ));
    if !identity.instructions.is_empty() {
        prompt.push('\n');
        prompt.push_str(&identity.instructions);
    }
    prompt
}

fn text_response(text: String) -> FinalResponse {
    FinalResponse {
        text,
        sections: Vec::new(),
        task_ids: Vec::new(),
    }
}

/// Merge agent outputs. One agent passes through; several keep their
/// labeled sections (rendered as embeds on chat surfaces).
pub fn synthesize(results: &[(String, String)]) -> FinalResponse {
    match results {
        [] => text_response("Nothing to report.".to_string()),
        [(_, only)] => text_response(only.clone()),
        many => FinalResponse {
            text: many
                .iter()
                .map(|(topic, text)| format!("**{topic}**\n{text}"))
                .collect::<Vec<_>>()
                .join("\n\n"),
            sections: many
                .iter()
                .map(|(topic, text)| ResponseSection {
                    label: topic.clone(),
                    text: text.clone(),
                })
                .collect(),
            task_ids: Vec::new(),
        },
    }
}
