//! The agentic tool loop: drive one spawned agent from a task to a final
//! response by iterating LLM turns and tool executions.
//!
//! The loop never panics or returns `Err` — every failure mode collapses
//! into the [`ToolLoopOutcome`] record so the pipeline always has
//! something to report.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use dotbot_domain::config::LoopConfig;
use dotbot_domain::error::Result;
use dotbot_domain::model::{OutputFormat, ResearchDepth};
use dotbot_domain::tool::{Message, ToolCall, ToolDefinition};
use dotbot_providers::{ChatRequest, LlmProvider};

use crate::tools::{resolve_tool, DispatchOutcome, ToolDispatcher};

use super::injection::InjectionQueue;

/// Appended to clipped tool results.
pub const TRUNCATION_SUFFIX: &str = "\n[truncated: result exceeded the 8000 character limit]";

/// Tool-role placeholder for calls that never executed.
pub const SKIPPED_RESULT: &str = "(no result — tool execution was skipped)";

/// Error fragments meaning the device is gone; retrying burns iterations
/// on guaranteed failures.
const INFRA_PATTERNS: &[&str] = &["no local-agent", "not connected", "no device"];

const INFRA_RESPONSE: &str = "I can't reach your local agent right now — it looks like the \
device is disconnected. Please check that the agent is running and connected, then try again.";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Suspension-point collaborators
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Fulfilled by the orchestrator: blocks the agent until the router
/// matches an incoming user message to it (or the timeout passes).
#[async_trait::async_trait]
pub trait UserWaiter: Send + Sync {
    async fn wait_for_user(
        &self,
        agent_id: &str,
        reason: &str,
        resume_hint: &str,
        timeout_minutes: Option<u64>,
    ) -> Option<String>;
}

/// Runs a research sub-agent and returns its findings string.
#[async_trait::async_trait]
pub trait ResearchRunner: Send + Sync {
    async fn run_research(
        &self,
        parent_agent_id: &str,
        query: &str,
        depth: ResearchDepth,
        format: OutputFormat,
    ) -> Result<String>;
}

/// Progress events surfaced to the session (stream chunks, tool activity).
#[derive(Debug, Clone)]
pub enum LoopEvent {
    LlmTurn {
        agent_id: String,
        content: String,
        tool_call_count: usize,
    },
    ToolInvocation {
        agent_id: String,
        tool: String,
        arguments: Value,
    },
    ToolResult {
        tool: String,
        success: bool,
    },
    Waiting {
        agent_id: String,
        reason: String,
        resume_hint: String,
    },
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Input / outcome records
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ToolLoopInput {
    pub agent_id: String,
    pub system_prompt: String,
    pub user_message: String,
    /// Prior conversation, prepended between system and user message.
    pub history: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// When set, a tool-free first turn gets one corrective nudge.
    pub skill_nudge: bool,
}

#[derive(Debug, Clone)]
pub struct ToolCallRecord {
    pub tool_name: String,
    pub arguments: Value,
    pub result: String,
    pub success: bool,
}

#[derive(Debug, Clone)]
pub struct Escalation {
    pub needed_tool_categories: Vec<String>,
    pub reason: String,
}

#[derive(Debug)]
pub struct ToolLoopOutcome {
    pub final_response: String,
    pub tool_calls: Vec<ToolCallRecord>,
    pub iterations: usize,
    pub completed: bool,
    pub escalated: Option<Escalation>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ToolLoop
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ToolLoop {
    pub provider: Arc<dyn LlmProvider>,
    pub dispatcher: Arc<dyn ToolDispatcher>,
    pub waiter: Arc<dyn UserWaiter>,
    pub research: Arc<dyn ResearchRunner>,
    pub injection: InjectionQueue,
    pub abort: CancellationToken,
    pub events: mpsc::Sender<LoopEvent>,
    pub config: LoopConfig,
}

impl ToolLoop {
    pub async fn run(&self, input: ToolLoopInput) -> ToolLoopOutcome {
        let mut messages = Vec::with_capacity(input.history.len() + 2);
        messages.push(Message::system(&input.system_prompt));
        messages.extend(input.history.iter().cloned());
        messages.push(Message::user(&input.user_message));

        let mut tools = input.tools.clone();
        let mut records: Vec<ToolCallRecord> = Vec::new();
        let mut seen_calls: HashSet<String> = HashSet::new();
        let mut stuck_tool: Option<String> = None;
        let mut stuck_count: u32 = 0;
        let mut final_response = String::new();
        let mut completed = false;
        let mut escalated: Option<Escalation> = None;
        let mut infra_down = false;
        let mut iterations = 0usize;

        'outer: for iteration in 1..=self.config.max_iterations {
            iterations = iteration;

            // 1. Drain the injection queue. A fresh user turn resets any
            //    provider reasoning traces carried in the history.
            let injected = self.injection.drain();
            if !injected.is_empty() {
                strip_reasoning(&mut messages);
                for text in injected {
                    messages.push(Message::user(text));
                }
            }

            // 2. Abort check.
            if self.abort.is_cancelled() {
                tracing::info!(agent_id = %input.agent_id, "tool loop aborted");
                break;
            }

            // 3. LLM call.
            let request = ChatRequest {
                messages: messages.clone(),
                tools: tools.clone(),
                temperature: input.temperature,
                max_tokens: input.max_tokens,
                model: input.model.clone(),
            };
            let response = match self.provider.chat(request).await {
                Ok(r) => r,
                Err(e) => {
                    tracing::error!(agent_id = %input.agent_id, error = %e, "LLM call failed");
                    final_response =
                        "I ran into an internal error while working on this.".to_string();
                    break;
                }
            };
            let _ = self
                .events
                .send(LoopEvent::LlmTurn {
                    agent_id: input.agent_id.clone(),
                    content: response.content.clone(),
                    tool_call_count: response.tool_calls.len(),
                })
                .await;

            // 4. Text-only turn: final answer, unless the skill nudge
            //    applies (model described the calls instead of making them).
            if response.tool_calls.is_empty() {
                if input.skill_nudge && iteration <= 2 && records.is_empty() {
                    messages.push(Message::assistant(&response.content));
                    messages.push(Message::user(
                        "Make the tool calls now. Do not describe what you would do — call the tools.",
                    ));
                    continue;
                }
                final_response = response.content;
                completed = true;
                break;
            }

            // 5. Record the assistant turn with its calls.
            messages.push(Message::assistant_with_calls(
                &response.content,
                &response.tool_calls,
            ));

            // 6. Duplicate and stuck bookkeeping.
            let duplicate_flags: Vec<bool> = response
                .tool_calls
                .iter()
                .map(|call| !seen_calls.insert(call_key(call)))
                .collect();
            if response.tool_calls.len() == 1 {
                let name = &response.tool_calls[0].tool_name;
                if stuck_tool.as_deref() == Some(name.as_str()) {
                    stuck_count += 1;
                } else {
                    stuck_tool = Some(name.clone());
                    stuck_count = 1;
                }
            } else {
                stuck_tool = None;
                stuck_count = 0;
            }

            // The soft warning must not split the assistant turn from its
            // tool results; it is appended after the batch executes.
            let warn_after_batch = stuck_count == self.config.stuck_warning_threshold;
            if stuck_count >= self.config.stuck_escalate_threshold {
                let tool = stuck_tool.clone().unwrap_or_default();
                skip_batch(&mut messages, &mut records, &response.tool_calls, 0);
                escalated = Some(Escalation {
                    needed_tool_categories: Vec::new(),
                    reason: format!("called `{tool}` {stuck_count} times consecutively without progress"),
                });
                final_response = escalation_response();
                break;
            }

            // 7. Execute the calls sequentially, in emission order.
            for (idx, call) in response.tool_calls.iter().enumerate() {
                let _ = self
                    .events
                    .send(LoopEvent::ToolInvocation {
                        agent_id: input.agent_id.clone(),
                        tool: call.tool_name.clone(),
                        arguments: call.arguments.clone(),
                    })
                    .await;

                match call.tool_name.as_str() {
                    "agent.escalate" => {
                        skip_batch(&mut messages, &mut records, &response.tool_calls, idx);
                        escalated = Some(Escalation {
                            needed_tool_categories: string_array(&call.arguments, "categories"),
                            reason: string_arg(&call.arguments, "reason")
                                .unwrap_or_else(|| "agent requested escalation".into()),
                        });
                        final_response = escalation_response();
                        break 'outer;
                    }
                    "agent.wait_for_user" => {
                        let reason = string_arg(&call.arguments, "reason").unwrap_or_default();
                        let resume_hint =
                            string_arg(&call.arguments, "resume_hint").unwrap_or_default();
                        let timeout_minutes = call
                            .arguments
                            .get("timeout_minutes")
                            .and_then(Value::as_u64);
                        let _ = self
                            .events
                            .send(LoopEvent::Waiting {
                                agent_id: input.agent_id.clone(),
                                reason: reason.clone(),
                                resume_hint: resume_hint.clone(),
                            })
                            .await;
                        let reply = self
                            .waiter
                            .wait_for_user(&input.agent_id, &reason, &resume_hint, timeout_minutes)
                            .await;
                        let text = match reply {
                            Some(user_text) => format!("User replied: {user_text}"),
                            None => "(no user reply before the timeout)".to_string(),
                        };
                        self.push_result(&mut messages, &mut records, call, text, true)
                            .await;
                    }
                    "agent.request_tools" => {
                        let categories = string_array(&call.arguments, "categories");
                        let added = self.dispatcher.tools_in_categories(&categories);
                        let names: Vec<String> =
                            added.iter().map(|d| d.name.clone()).collect();
                        for def in added {
                            if !tools.iter().any(|t| t.name == def.name) {
                                tools.push(def);
                            }
                        }
                        let text = if names.is_empty() {
                            format!("No tools available in categories {categories:?}.")
                        } else {
                            format!("Added tools: {}", names.join(", "))
                        };
                        self.push_result(&mut messages, &mut records, call, text, true)
                            .await;
                    }
                    "agent.request_research" => {
                        let query = string_arg(&call.arguments, "query").unwrap_or_default();
                        let depth = string_arg(&call.arguments, "depth")
                            .and_then(|d| ResearchDepth::parse(&d))
                            .unwrap_or(ResearchDepth::Quick);
                        let format = string_arg(&call.arguments, "format")
                            .and_then(|f| serde_json::from_value(Value::String(f)).ok())
                            .unwrap_or(OutputFormat::PlainText);
                        let (text, success) = match self
                            .research
                            .run_research(&input.agent_id, &query, depth, format)
                            .await
                        {
                            Ok(findings) => (findings, true),
                            Err(e) => (format!("research failed: {e}"), false),
                        };
                        self.push_result(&mut messages, &mut records, call, text, success)
                            .await;
                    }
                    _ => {
                        let mut outcome = match resolve_tool(&tools, &call.tool_name) {
                            Some(def) => self.dispatcher.dispatch(def, &call.arguments).await,
                            None => DispatchOutcome::error(format!(
                                "unknown tool: {}",
                                call.tool_name
                            )),
                        };
                        if duplicate_flags.get(idx).copied().unwrap_or(false) {
                            outcome.text.push_str(
                                "\n(note: this exact call was already made earlier in this run)",
                            );
                        }

                        if outcome.is_error && is_infrastructure_error(&outcome.text) {
                            self.push_result(
                                &mut messages,
                                &mut records,
                                call,
                                outcome.text,
                                false,
                            )
                            .await;
                            skip_batch(
                                &mut messages,
                                &mut records,
                                &response.tool_calls,
                                idx + 1,
                            );
                            infra_down = true;
                            break;
                        }
                        self.push_result(
                            &mut messages,
                            &mut records,
                            call,
                            outcome.text,
                            !outcome.is_error,
                        )
                        .await;
                    }
                }
            }

            if infra_down {
                final_response = INFRA_RESPONSE.to_string();
                break;
            }

            if warn_after_batch {
                messages.push(Message::user(format!(
                    "[system warning] You have called `{}` {} times in a row. If it is not \
                     producing what you need, change approach or call agent.escalate.",
                    stuck_tool.as_deref().unwrap_or_default(),
                    stuck_count,
                )));
            }

            // 8. Sequence sanitization before the next LLM call — a hard
            //    precondition of the provider APIs.
            sanitize_messages(&mut messages);
        }

        // 9. Iteration cap without a text-only turn: one synthesis pass
        //    with tools disabled.
        if !completed && final_response.is_empty() && !self.abort.is_cancelled() {
            sanitize_messages(&mut messages);
            messages.push(Message::user(
                "Summarize what you accomplished and what remains, in plain text.",
            ));
            let request = ChatRequest {
                messages,
                tools: Vec::new(),
                temperature: input.temperature,
                max_tokens: input.max_tokens,
                model: input.model.clone(),
            };
            final_response = match self.provider.chat(request).await {
                Ok(r) => r.content,
                Err(_) => "I ran out of iterations before finishing this task.".to_string(),
            };
        }

        ToolLoopOutcome {
            final_response,
            tool_calls: records,
            iterations,
            completed,
            escalated,
        }
    }

    /// Truncate, extract images, append the tool message, record.
    async fn push_result(
        &self,
        messages: &mut Vec<Message>,
        records: &mut Vec<ToolCallRecord>,
        call: &ToolCall,
        raw_text: String,
        success: bool,
    ) {
        let (text, images) = extract_images(raw_text);
        let text = truncate_result(&text, self.config.tool_result_cap);
        let _ = self
            .events
            .send(LoopEvent::ToolResult {
                tool: call.tool_name.clone(),
                success,
            })
            .await;
        records.push(ToolCallRecord {
            tool_name: call.tool_name.clone(),
            arguments: call.arguments.clone(),
            result: text.clone(),
            success,
        });
        if images.is_empty() {
            messages.push(Message::tool_result(&call.call_id, text));
        } else {
            messages.push(Message::tool_result_with_images(&call.call_id, text, images));
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn call_key(call: &ToolCall) -> String {
    format!("{}:{}", call.tool_name, call.arguments)
}

fn string_arg(args: &Value, key: &str) -> Option<String> {
    args.get(key).and_then(Value::as_str).map(String::from)
}

fn string_array(args: &Value, key: &str) -> Vec<String> {
    args.get(key)
        .and_then(Value::as_array)
        .map(|a| {
            a.iter()
                .filter_map(Value::as_str)
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

fn escalation_response() -> String {
    "I don't have the right tools to finish this task, so I'm handing it back for \
     re-routing. You'll get an update once it's picked up with the right capabilities."
        .to_string()
}

pub fn is_infrastructure_error(text: &str) -> bool {
    let lower = text.to_lowercase();
    INFRA_PATTERNS.iter().any(|p| lower.contains(p))
}

/// Fill skipped placeholder results for `calls[from..]`.
fn skip_batch(
    messages: &mut Vec<Message>,
    records: &mut Vec<ToolCallRecord>,
    calls: &[ToolCall],
    from: usize,
) {
    for call in &calls[from..] {
        messages.push(Message::tool_result(&call.call_id, SKIPPED_RESULT));
        records.push(ToolCallRecord {
            tool_name: call.tool_name.clone(),
            arguments: call.arguments.clone(),
            result: SKIPPED_RESULT.to_string(),
            success: false,
        });
    }
}

/// Clip to `cap` characters, appending the truncation notice when clipped.
pub fn truncate_result(text: &str, cap: usize) -> String {
    if text.chars().count() <= cap {
        return text.to_string();
    }
    let clipped: String = text.chars().take(cap).collect();
    format!("{clipped}{TRUNCATION_SUFFIX}")
}

/// Pull `screenshot_ref` / `image_base64` fields out of a JSON tool
/// result into image content blocks, stripping them from the text part.
fn extract_images(text: String) -> (String, Vec<(String, Option<String>)>) {
    let Ok(mut value) = serde_json::from_str::<Value>(&text) else {
        return (text, Vec::new());
    };
    let Some(obj) = value.as_object_mut() else {
        return (text, Vec::new());
    };
    let mut images = Vec::new();
    for key in ["screenshot_ref", "image_base64"] {
        if let Some(Value::String(data)) = obj.remove(key) {
            images.push((data, Some("image/png".to_string())));
        }
    }
    if images.is_empty() {
        return (text, Vec::new());
    }
    (value.to_string(), images)
}

/// Provider reasoning traces are dropped when a fresh user turn arrives;
/// the model treats the new turn as a reset.
fn strip_reasoning(messages: &mut [Message]) {
    use dotbot_domain::tool::{ContentPart, MessageContent, Role};
    for msg in messages.iter_mut() {
        if msg.role != Role::Assistant {
            continue;
        }
        if let MessageContent::Parts(parts) = &mut msg.content {
            parts.retain(|p| {
                !matches!(p, ContentPart::Text { text } if text.starts_with("<thinking>"))
            });
        }
    }
}

/// Enforce the provider-API invariant: every assistant message with `k`
/// tool calls is immediately followed by exactly `k` tool-role messages
/// whose ids match in order. Missing results become placeholders.
pub fn sanitize_messages(messages: &mut Vec<Message>) {
    let mut out: Vec<Message> = Vec::with_capacity(messages.len());
    let mut iter = std::mem::take(messages).into_iter().peekable();

    while let Some(msg) = iter.next() {
        let expected: Vec<String> = msg
            .tool_call_ids()
            .into_iter()
            .map(String::from)
            .collect();
        out.push(msg);
        if expected.is_empty() {
            continue;
        }
        // Collect the contiguous run of tool results that follows.
        let mut available: Vec<Message> = Vec::new();
        while iter
            .peek()
            .is_some_and(|m| m.answered_call_id().is_some())
        {
            available.push(iter.next().unwrap());
        }
        for id in &expected {
            let found = available
                .iter()
                .position(|m| m.answered_call_id() == Some(id.as_str()));
            match found {
                Some(pos) => out.push(available.remove(pos)),
                None => out.push(Message::tool_result(id, SKIPPED_RESULT)),
            }
        }
        // Orphan results answering nothing in this batch are dropped.
    }
    *messages = out;
}

#[cfg(test)]
mod tests {
    use super::*;
    use dotbot_domain::tool::{MessageContent, Role};
    use dotbot_providers::scripted::{ScriptedProvider, ScriptedTurn};
    use parking_lot::Mutex;

    struct FakeDispatcher {
        results: Mutex<std::collections::HashMap<String, DispatchOutcome>>,
        extra_tools: Vec<ToolDefinition>,
    }

    impl FakeDispatcher {
        fn new() -> Self {
            Self {
                results: Mutex::new(std::collections::HashMap::new()),
                extra_tools: Vec::new(),
            }
        }
        fn with_result(self, tool: &str, outcome: DispatchOutcome) -> Self {
            self.results.lock().insert(tool.into(), outcome);
            self
        }
        fn with_extra_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
            self.extra_tools = tools;
            self
        }
    }

    #[async_trait::async_trait]
    impl ToolDispatcher for FakeDispatcher {
        async fn dispatch(&self, tool: &ToolDefinition, _args: &Value) -> DispatchOutcome {
            self.results
                .lock()
                .get(&tool.name)
                .cloned()
                .unwrap_or_else(|| DispatchOutcome::ok("ok"))
        }
        fn tools_in_categories(&self, categories: &[String]) -> Vec<ToolDefinition> {
            self.extra_tools
                .iter()
                .filter(|t| categories.contains(&t.category))
                .cloned()
                .collect()
        }
    }

    struct NoWaiter;
    #[async_trait::async_trait]
    impl UserWaiter for NoWaiter {
        async fn wait_for_user(&self, _: &str, _: &str, _: &str, _: Option<u64>) -> Option<String> {
            None
        }
    }

    struct CannedWaiter(String);
    #[async_trait::async_trait]
    impl UserWaiter for CannedWaiter {
        async fn wait_for_user(&self, _: &str, _: &str, _: &str, _: Option<u64>) -> Option<String> {
            Some(self.0.clone())
        }
    }

    struct NoResearch;
    #[async_trait::async_trait]
    impl ResearchRunner for NoResearch {
        async fn run_research(
            &self,
            _: &str,
            _: &str,
            _: ResearchDepth,
            _: OutputFormat,
        ) -> Result<String> {
            Ok("findings: none".into())
        }
    }

    fn def(name: &str, category: &str) -> ToolDefinition {
        ToolDefinition {
            name: name.into(),
            description: String::new(),
            parameters: serde_json::json!({"type": "object", "properties": {}}),
            category: category.into(),
        }
    }

    fn make_loop(provider: ScriptedProvider, dispatcher: FakeDispatcher) -> ToolLoop {
        make_loop_with(provider, dispatcher, Arc::new(NoWaiter))
    }

    fn make_loop_with(
        provider: ScriptedProvider,
        dispatcher: FakeDispatcher,
        waiter: Arc<dyn UserWaiter>,
    ) -> ToolLoop {
        let (events, _rx) = mpsc::channel(256);
        ToolLoop {
            provider: Arc::new(provider),
            dispatcher: Arc::new(dispatcher),
            waiter,
            research: Arc::new(NoResearch),
            injection: InjectionQueue::new(),
            abort: CancellationToken::new(),
            events,
            config: LoopConfig::default(),
        }
    }

    fn input(tools: Vec<ToolDefinition>) -> ToolLoopInput {
        ToolLoopInput {
            agent_id: "agent-1".into(),
            system_prompt: "You are a helpful worker.".into(),
            user_message: "do the thing".into(),
            history: Vec::new(),
            tools,
            model: None,
            temperature: None,
            max_tokens: None,
            skill_nudge: false,
        }
    }

    #[tokio::test]
    async fn text_only_turn_completes_immediately() {
        let provider = ScriptedProvider::text("s", ["all done"]);
        let lp = make_loop(provider, FakeDispatcher::new());
        let out = lp.run(input(vec![])).await;
        assert!(out.completed);
        assert_eq!(out.final_response, "all done");
        assert_eq!(out.iterations, 1);
        assert!(out.tool_calls.is_empty());
    }

    #[tokio::test]
    async fn executes_tools_then_finishes() {
        let provider = ScriptedProvider::new(
            "s",
            vec![
                ScriptedTurn::Calls(
                    "checking".into(),
                    vec![("shell.run".into(), serde_json::json!({"command": "ls"}))],
                ),
                ScriptedTurn::Text("files listed".into()),
            ],
        );
        let dispatcher =
            FakeDispatcher::new().with_result("shell.run", DispatchOutcome::ok("a.txt\nb.txt"));
        let lp = make_loop(provider, dispatcher);
        let out = lp.run(input(vec![def("shell.run", "shell")])).await;

        assert!(out.completed);
        assert_eq!(out.final_response, "files listed");
        assert_eq!(out.tool_calls.len(), 1);
        assert!(out.tool_calls[0].success);
        assert_eq!(out.tool_calls[0].result, "a.txt\nb.txt");
    }

    #[tokio::test]
    async fn truncation_law_holds_exactly() {
        let big = "z".repeat(9000);
        let provider = ScriptedProvider::new(
            "s",
            vec![
                ScriptedTurn::Calls(
                    String::new(),
                    vec![("shell.run".into(), serde_json::json!({}))],
                ),
                ScriptedTurn::Text("done".into()),
            ],
        );
        let dispatcher =
            FakeDispatcher::new().with_result("shell.run", DispatchOutcome::ok(big.clone()));
        let lp = make_loop(provider, dispatcher);
        let out = lp.run(input(vec![def("shell.run", "shell")])).await;

        let expected = format!("{}{}", &big[..8000], TRUNCATION_SUFFIX);
        assert_eq!(out.tool_calls[0].result, expected);
    }

    #[tokio::test]
    async fn stuck_escalates_at_threshold_with_placeholders() {
        // Scenario S3: the same single tool, turn after turn.
        let call = || {
            ScriptedTurn::Calls(
                String::new(),
                vec![(
                    "knowledge.search".into(),
                    serde_json::json!({"q": "discord"}),
                )],
            )
        };
        let provider = ScriptedProvider::new("s", vec![call(), call(), call(), call(), call()]);
        let dispatcher = FakeDispatcher::new()
            .with_result("knowledge.search", DispatchOutcome::ok("nothing relevant"));
        let lp = make_loop(provider, dispatcher);
        let out = lp.run(input(vec![def("knowledge.search", "knowledge")])).await;

        let esc = out.escalated.expect("should escalate");
        assert!(esc.reason.contains("5 times"));
        assert!(!out.completed);
        // The 5th turn's call never executed: placeholder result recorded.
        let last = out.tool_calls.last().unwrap();
        assert_eq!(last.result, SKIPPED_RESULT);
        assert!(!out.final_response.is_empty());
    }

    #[tokio::test]
    async fn explicit_escalate_fills_remaining_slots() {
        let provider = ScriptedProvider::new(
            "s",
            vec![ScriptedTurn::Calls(
                String::new(),
                vec![
                    (
                        "agent.escalate".into(),
                        serde_json::json!({"categories": ["discord"], "reason": "need discord tools"}),
                    ),
                    ("shell.run".into(), serde_json::json!({})),
                ],
            )],
        );
        let lp = make_loop(provider, FakeDispatcher::new());
        let out = lp.run(input(vec![def("shell.run", "shell")])).await;

        let esc = out.escalated.unwrap();
        assert_eq!(esc.needed_tool_categories, vec!["discord"]);
        assert_eq!(esc.reason, "need discord tools");
        // Both the escalate call and the unexecuted shell call got skipped results.
        assert_eq!(out.tool_calls.len(), 2);
        assert!(out.tool_calls.iter().all(|r| r.result == SKIPPED_RESULT));
    }

    #[tokio::test]
    async fn wait_for_user_resumes_with_reply() {
        let provider = ScriptedProvider::new(
            "s",
            vec![
                ScriptedTurn::Calls(
                    String::new(),
                    vec![(
                        "agent.wait_for_user".into(),
                        serde_json::json!({"reason": "need approval", "resume_hint": "say yes"}),
                    )],
                ),
                ScriptedTurn::Text("proceeding".into()),
            ],
        );
        let lp = make_loop_with(
            provider,
            FakeDispatcher::new(),
            Arc::new(CannedWaiter("yes go".into())),
        );
        let out = lp.run(input(vec![])).await;
        assert!(out.completed);
        assert!(out.tool_calls[0].result.contains("yes go"));
    }

    #[tokio::test]
    async fn request_tools_expands_manifest_in_place() {
        let provider = ScriptedProvider::new(
            "s",
            vec![
                ScriptedTurn::Calls(
                    String::new(),
                    vec![(
                        "agent.request_tools".into(),
                        serde_json::json!({"categories": ["discord"], "reason": "messaging"}),
                    )],
                ),
                ScriptedTurn::Calls(
                    String::new(),
                    vec![("discord.send_message".into(), serde_json::json!({}))],
                ),
                ScriptedTurn::Text("sent".into()),
            ],
        );
        let dispatcher = FakeDispatcher::new()
            .with_extra_tools(vec![def("discord.send_message", "discord")])
            .with_result("discord.send_message", DispatchOutcome::ok("message sent"));
        let lp = make_loop(provider, dispatcher);
        let out = lp.run(input(vec![])).await;

        assert!(out.completed);
        assert!(out.tool_calls[0].result.contains("discord.send_message"));
        assert_eq!(out.tool_calls[1].result, "message sent");
    }

    #[tokio::test]
    async fn research_findings_injected_as_result() {
        let provider = ScriptedProvider::new(
            "s",
            vec![
                ScriptedTurn::Calls(
                    String::new(),
                    vec![(
                        "agent.request_research".into(),
                        serde_json::json!({"query": "rust web frameworks", "depth": "quick"}),
                    )],
                ),
                ScriptedTurn::Text("summarized".into()),
            ],
        );
        let lp = make_loop(provider, FakeDispatcher::new());
        let out = lp.run(input(vec![])).await;
        assert_eq!(out.tool_calls[0].result, "findings: none");
        assert!(out.completed);
    }

    #[tokio::test]
    async fn infrastructure_error_short_circuits() {
        let provider = ScriptedProvider::new(
            "s",
            vec![
                ScriptedTurn::Calls(
                    String::new(),
                    vec![("shell.run".into(), serde_json::json!({}))],
                ),
                // Would keep going, but the loop must not.
                ScriptedTurn::Calls(
                    String::new(),
                    vec![("shell.run".into(), serde_json::json!({}))],
                ),
            ],
        );
        let dispatcher = FakeDispatcher::new().with_result(
            "shell.run",
            DispatchOutcome::error("no device connected for this session"),
        );
        let lp = make_loop(provider, dispatcher);
        let out = lp.run(input(vec![def("shell.run", "shell")])).await;

        assert!(!out.completed);
        assert_eq!(out.final_response, INFRA_RESPONSE);
        assert_eq!(out.iterations, 1);
    }

    #[tokio::test]
    async fn skill_nudge_retries_then_accepts() {
        let provider = ScriptedProvider::text("s", ["I would call shell.run here", "final answer"]);
        let mut inp = input(vec![def("shell.run", "shell")]);
        inp.skill_nudge = true;
        let lp = make_loop(provider, FakeDispatcher::new());
        let out = lp.run(inp).await;
        assert!(out.completed);
        assert_eq!(out.final_response, "final answer");
        assert_eq!(out.iterations, 2);
    }

    #[tokio::test]
    async fn iteration_cap_triggers_synthesis_pass() {
        let calls: Vec<ScriptedTurn> = (0..30)
            .map(|i| {
                ScriptedTurn::Calls(
                    String::new(),
                    vec![("shell.run".into(), serde_json::json!({"i": i}))],
                )
            })
            .collect();
        let provider = ScriptedProvider::new("s", calls);
        let requests = provider.requests();
        let mut lp = make_loop(provider, FakeDispatcher::new());
        lp.config.max_iterations = 3;
        // Raise the stuck thresholds so the cap is what fires.
        lp.config.stuck_escalate_threshold = 100;
        lp.config.stuck_warning_threshold = 99;
        let out = lp.run(input(vec![def("shell.run", "shell")])).await;

        assert!(!out.completed);
        assert_eq!(out.iterations, 3);
        // The synthesis call carries no tools.
        let reqs = requests.lock();
        let last = reqs.last().unwrap();
        assert!(last.tools.is_empty());
    }

    #[tokio::test]
    async fn injection_queue_drained_at_top_of_iteration() {
        let provider = ScriptedProvider::new(
            "s",
            vec![
                ScriptedTurn::Calls(
                    String::new(),
                    vec![("shell.run".into(), serde_json::json!({}))],
                ),
                ScriptedTurn::Text("done".into()),
            ],
        );
        let requests = provider.requests();
        let lp = make_loop(provider, FakeDispatcher::new());
        lp.injection.push("user correction: use /tmp");
        let out = lp.run(input(vec![def("shell.run", "shell")])).await;
        assert!(out.completed);

        let reqs = requests.lock();
        let first = &reqs[0];
        let has_injection = first.messages.iter().any(|m| {
            matches!(&m.content, MessageContent::Text(t) if t.contains("user correction"))
        });
        assert!(has_injection, "injected text must precede the first LLM call");
    }

    #[tokio::test]
    async fn image_fields_become_content_blocks() {
        let provider = ScriptedProvider::new(
            "s",
            vec![
                ScriptedTurn::Calls(
                    String::new(),
                    vec![("gui.screenshot".into(), serde_json::json!({}))],
                ),
                ScriptedTurn::Text("looked at it".into()),
            ],
        );
        let requests = provider.requests();
        let dispatcher = FakeDispatcher::new().with_result(
            "gui.screenshot",
            DispatchOutcome::ok(
                serde_json::json!({"ok": true, "image_base64": "aGVsbG8="}).to_string(),
            ),
        );
        let lp = make_loop(provider, dispatcher);
        let out = lp.run(input(vec![def("gui.screenshot", "gui")])).await;
        assert!(out.completed);
        // The stripped field is gone from the recorded text.
        assert!(!out.tool_calls[0].result.contains("image_base64"));

        // And the second request's tool message carries an image part.
        let reqs = requests.lock();
        let second = &reqs[1];
        let has_image = second.messages.iter().any(|m| {
            matches!(&m.content, MessageContent::Parts(parts)
                if parts.iter().any(|p| matches!(p, dotbot_domain::tool::ContentPart::Image { .. })))
        });
        assert!(has_image);
    }

    // ── sanitize_messages property ─────────────────────────────────

    fn assert_sanitized(messages: &[Message]) {
        let mut i = 0;
        while i < messages.len() {
            let ids = messages[i].tool_call_ids();
            if !ids.is_empty() {
                for (k, id) in ids.iter().enumerate() {
                    let follower = &messages[i + 1 + k];
                    assert_eq!(
                        follower.answered_call_id(),
                        Some(*id),
                        "call {id} must be answered in order"
                    );
                }
                i += 1 + messages[i].tool_call_ids().len();
            } else {
                i += 1;
            }
        }
    }

    #[test]
    fn sanitize_fills_missing_results_in_order() {
        let calls = vec![
            ToolCall {
                call_id: "c1".into(),
                tool_name: "a".into(),
                arguments: serde_json::json!({}),
            },
            ToolCall {
                call_id: "c2".into(),
                tool_name: "b".into(),
                arguments: serde_json::json!({}),
            },
        ];
        let mut messages = vec![
            Message::user("hi"),
            Message::assistant_with_calls("", &calls),
            // Only c2 answered, out of order, c1 missing entirely.
            Message::tool_result("c2", "second"),
            Message::assistant("after"),
        ];
        sanitize_messages(&mut messages);
        assert_sanitized(&messages);
        assert_eq!(messages[2].answered_call_id(), Some("c1"));
        assert_eq!(messages[3].answered_call_id(), Some("c2"));
        assert_eq!(
            messages[2].content.extract_all_text(),
            "",
            "placeholder carries no loose text"
        );
        assert!(matches!(messages[4].role, Role::Assistant));
    }

    #[test]
    fn sanitize_is_idempotent_on_valid_sequences() {
        let calls = vec![ToolCall {
            call_id: "c1".into(),
            tool_name: "a".into(),
            arguments: serde_json::json!({}),
        }];
        let mut messages = vec![
            Message::system("s"),
            Message::user("u"),
            Message::assistant_with_calls("", &calls),
            Message::tool_result("c1", "r"),
        ];
        let before = serde_json::to_string(&messages).unwrap();
        sanitize_messages(&mut messages);
        let after = serde_json::to_string(&messages).unwrap();
        assert_eq!(before, after);
    }
}
