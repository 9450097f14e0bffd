//! Planner stage: pick exact tool ids and a model role per sub-task.

use std::sync::Arc;

use serde::Deserialize;

use dotbot_domain::error::Result;
use dotbot_domain::model::ModelRole;
use dotbot_domain::tool::{Message, ToolDefinition};
use dotbot_providers::{ChatRequest, LlmProvider};

use super::receptionist::{extract_json_object, SubTask};

#[derive(Debug, Clone)]
pub struct AgentPlan {
    pub topic: String,
    pub task: String,
    pub tools: Vec<String>,
    pub model_role: ModelRole,
}

#[derive(Debug, Deserialize)]
struct RawPlan {
    #[serde(default)]
    topic: Option<String>,
    #[serde(default)]
    tools: Vec<String>,
    #[serde(default)]
    model_role: Option<ModelRole>,
}

#[derive(Debug, Deserialize)]
struct RawPlans {
    plans: Vec<RawPlan>,
}

const SYSTEM_PROMPT: &str = "You are the planner for a personal agent system. For each \
sub-task, pick the tool ids the agent will need (from the available list, exact ids \
only) and a model role. Reply with ONLY JSON:\n\
{\"plans\": [{\"topic\": \"...\", \"tools\": [\"id\", ...], \
\"model_role\": \"intake|workhorse|smart\"}]}\n\
Grant the minimum toolset that can finish the job.";

pub async fn plan(
    provider: &Arc<dyn LlmProvider>,
    subtasks: &[SubTask],
    manifest: &[ToolDefinition],
) -> Result<Vec<AgentPlan>> {
    let tool_list = manifest
        .iter()
        .map(|t| format!("- {} ({}): {}", t.name, t.category, t.description))
        .collect::<Vec<_>>()
        .join("\n");
    let task_list = subtasks
        .iter()
        .enumerate()
        .map(|(i, s)| format!("{}. [{}] {}", i + 1, s.topic, s.task))
        .collect::<Vec<_>>()
        .join("\n");

    let response = provider
        .chat(ChatRequest {
            messages: vec![
                Message::system(SYSTEM_PROMPT),
                Message::user(format!(
                    "Available tools:\n{tool_list}\n\nSub-tasks:\n{task_list}"
                )),
            ],
            tools: Vec::new(),
            temperature: Some(0.1),
            max_tokens: Some(800),
            model: None,
        })
        .await?;

    Ok(parse_plans(&response.content, subtasks, manifest))
}

/// Merge the model's plans with the sub-task list. Unknown tool ids are
/// dropped; a sub-task with no usable plan gets the full manifest and the
/// workhorse role so the pipeline never stalls on a planner hiccup.
pub fn parse_plans(
    raw: &str,
    subtasks: &[SubTask],
    manifest: &[ToolDefinition],
) -> Vec<AgentPlan> {
    let parsed: Vec<RawPlan> = extract_json_object(raw)
        .and_then(|json| serde_json::from_str::<RawPlans>(&json).ok())
        .map(|p| p.plans)
        .unwrap_or_default();

    subtasks
        .iter()
        .enumerate()
        .map(|(i, subtask)| {
            let raw_plan = parsed.get(i);
            let mut tools: Vec<String> = raw_plan
                .map(|p| {
                    p.tools
                        .iter()
                        .filter(|t| manifest.iter().any(|m| m.name == **t))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();
            if tools.is_empty() {
                tools = manifest.iter().map(|m| m.name.clone()).collect();
            }
            AgentPlan {
                topic: raw_plan
                    .and_then(|p| p.topic.clone())
                    .unwrap_or_else(|| subtask.topic.clone()),
                task: subtask.task.clone(),
                tools,
                model_role: raw_plan.and_then(|p| p.model_role).unwrap_or_default(),
            }
        })
        .collect()
}
