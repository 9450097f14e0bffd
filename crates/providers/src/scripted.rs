//! Deterministic scripted provider for tests.
//!
//! Plays back a fixed sequence of turns and records every request it
//! receives, so loop behavior can be asserted without a live model.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use dotbot_domain::error::Result;
use dotbot_domain::tool::ToolCall;

use crate::traits::{ChatRequest, ChatResponse, LlmProvider};

/// One pre-scripted model turn.
#[derive(Debug, Clone)]
pub enum ScriptedTurn {
    /// A plain text reply (terminates a tool loop).
    Text(String),
    /// Text plus tool calls, as `(tool_name, arguments)` pairs.
    Calls(String, Vec<(String, serde_json::Value)>),
}

pub struct ScriptedProvider {
    id: String,
    script: Mutex<VecDeque<ScriptedTurn>>,
    requests: Arc<Mutex<Vec<ChatRequest>>>,
    call_seq: Mutex<u32>,
}

impl ScriptedProvider {
    pub fn new(id: impl Into<String>, turns: Vec<ScriptedTurn>) -> Self {
        Self {
            id: id.into(),
            script: Mutex::new(turns.into()),
            requests: Arc::new(Mutex::new(Vec::new())),
            call_seq: Mutex::new(0),
        }
    }

    /// Text-only script.
    pub fn text<I, S>(id: impl Into<String>, turns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(
            id,
            turns
                .into_iter()
                .map(|t| ScriptedTurn::Text(t.into()))
                .collect(),
        )
    }

    /// Shared handle to the recorded requests, for assertions.
    pub fn requests(&self) -> Arc<Mutex<Vec<ChatRequest>>> {
        self.requests.clone()
    }

    /// Number of chat calls served so far.
    pub fn calls_served(&self) -> usize {
        self.requests.lock().len()
    }
}

#[async_trait::async_trait]
impl LlmProvider for ScriptedProvider {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse> {
        self.requests.lock().push(req);

        let turn = self
            .script
            .lock()
            .pop_front()
            .unwrap_or_else(|| ScriptedTurn::Text("(script exhausted)".into()));

        let (content, tool_calls) = match turn {
            ScriptedTurn::Text(t) => (t, Vec::new()),
            ScriptedTurn::Calls(text, calls) => {
                let mut seq = self.call_seq.lock();
                let out = calls
                    .into_iter()
                    .map(|(name, args)| {
                        *seq += 1;
                        ToolCall {
                            call_id: format!("call-{}", *seq),
                            tool_name: name,
                            arguments: args,
                        }
                    })
                    .collect();
                (text, out)
            }
        };

        Ok(ChatResponse {
            content,
            tool_calls,
            reasoning: None,
            usage: None,
            model: self.id.clone(),
        })
    }

    fn provider_id(&self) -> &str {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn plays_turns_in_order_then_reports_exhaustion() {
        let p = ScriptedProvider::text("s", ["one", "two"]);
        assert_eq!(p.chat(ChatRequest::default()).await.unwrap().content, "one");
        assert_eq!(p.chat(ChatRequest::default()).await.unwrap().content, "two");
        assert_eq!(
            p.chat(ChatRequest::default()).await.unwrap().content,
            "(script exhausted)"
        );
        assert_eq!(p.calls_served(), 3);
    }

    #[tokio::test]
    async fn scripted_calls_get_sequential_ids() {
        let p = ScriptedProvider::new(
            "s",
            vec![ScriptedTurn::Calls(
                String::new(),
                vec![
                    ("a.tool".into(), serde_json::json!({})),
                    ("b.tool".into(), serde_json::json!({})),
                ],
            )],
        );
        let resp = p.chat(ChatRequest::default()).await.unwrap();
        assert_eq!(resp.tool_calls[0].call_id, "call-1");
        assert_eq!(resp.tool_calls[1].call_id, "call-2");
    }
}
