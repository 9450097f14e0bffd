//! Receptionist stage: one intake-tier LLM call that classifies the
//! prompt, optionally decomposes it, and picks a priority and a short
//! acknowledgment.

use std::sync::Arc;

use serde::Deserialize;

use dotbot_domain::error::{Error, Result};
use dotbot_domain::model::{Classification, Priority};
use dotbot_providers::{ChatRequest, LlmProvider};

use dotbot_domain::tool::Message;

#[derive(Debug, Clone)]
pub struct Decision {
    pub classification: Classification,
    pub priority: Priority,
    pub acknowledgment: String,
    pub subtasks: Vec<SubTask>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubTask {
    pub topic: String,
    pub task: String,
    #[serde(default)]
    pub persona: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawDecision {
    classification: String,
    #[serde(default)]
    priority: Option<String>,
    #[serde(default)]
    acknowledgment: Option<String>,
    #[serde(default)]
    subtasks: Vec<SubTask>,
}

const SYSTEM_PROMPT: &str = "You are the intake receptionist for a personal agent system. \
Classify the user's message and reply with ONLY a JSON object:\n\
{\"classification\": \"CONVERSATIONAL|INFO_REQUEST|ACTION|COMPOUND|CONTINUATION|MEMORY_UPDATE\",\n\
 \"priority\": \"BLOCKING|FOREGROUND|BACKGROUND\",\n\
 \"acknowledgment\": \"one short sentence telling the user what you're doing\",\n\
 \"subtasks\": [{\"topic\": \"short label\", \"task\": \"what to do\", \"persona\": null}]}\n\
Rules: COMPOUND means several independent pieces of work — list each as a subtask. \
For single-task messages emit exactly one subtask. CONTINUATION means the message \
belongs to an agent already running (see the active agent list).";

pub async fn classify(
    provider: &Arc<dyn LlmProvider>,
    prompt: &str,
    active_summary: &str,
) -> Result<Decision> {
    let mut user = String::new();
    if !active_summary.is_empty() {
        user.push_str("Active agents:\n");
        user.push_str(active_summary);
        user.push_str("\n\n");
    }
    user.push_str("Message: ");
    user.push_str(prompt);

    let response = provider
        .chat(ChatRequest {
            messages: vec![Message::system(SYSTEM_PROMPT), Message::user(user)],
            tools: Vec::new(),
            temperature: Some(0.1),
            max_tokens: Some(500),
            model: None,
        })
        .await?;

    parse_decision(&response.content, prompt)
        .ok_or_else(|| Error::Pipeline(format!("unparseable receptionist reply: {}", response.content)))
}

/// Parse the model's JSON, tolerating code fences and stray prose.
/// Always yields at least one subtask so the planner has work.
pub fn parse_decision(raw: &str, prompt: &str) -> Option<Decision> {
    let json = extract_json_object(raw)?;
    let parsed: RawDecision = serde_json::from_str(&json).ok()?;
    let classification = Classification::parse(&parsed.classification)?;
    let priority = parsed
        .priority
        .as_deref()
        .and_then(parse_priority)
        .unwrap_or_default();

    let mut subtasks = parsed.subtasks;
    if subtasks.is_empty() {
        subtasks.push(SubTask {
            topic: summarize_topic(prompt),
            task: prompt.to_string(),
            persona: None,
        });
    }

    Some(Decision {
        classification,
        priority,
        acknowledgment: parsed
            .acknowledgment
            .unwrap_or_else(|| "On it.".to_string()),
        subtasks,
    })
}

fn parse_priority(s: &str) -> Option<Priority> {
    match s.trim().to_ascii_uppercase().as_str() {
        "BLOCKING" => Some(Priority::Blocking),
        "FOREGROUND" => Some(Priority::Foreground),
        "BACKGROUND" => Some(Priority::Background),
        _ => None,
    }
}

/// First few words of the prompt as a fallback topic label.
pub fn summarize_topic(prompt: &str) -> String {
    let words: Vec<&str> = prompt.split_whitespace().take(5).collect();
    words.join(" ")
}

/// Pull the first `{...}` object out of a reply that may carry fences or
/// prose around it.
pub fn extract_json_object(raw: &str) -> Option<String> {
    let start = raw.find('{')?;
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in raw[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(raw[start..start + i + 1].to_string());
                }
            }
            _ => {}
        }
    }
    None
}
