//! Short-path bypass: answer trivially-conversational messages before
//! the pipeline spends a full classification on them.
//!
//! Rule table first (greetings, acknowledgments, status checks,
//! farewells, pure emoji), then a memory-question matcher, then a tiny
//! capped LLM fallback. Skipped entirely while any agent is blocked
//! (the next message is that agent's reply) and for messages of ten or
//! more words.

use std::sync::Arc;

use serde::Deserialize;

use dotbot_domain::tool::Message;
use dotbot_providers::{ChatRequest, LlmProvider};

/// Messages with this many words or more always take the full pipeline.
const MAX_WORDS: usize = 10;
/// Token cap for the LLM fallback.
const FALLBACK_MAX_TOKENS: u32 = 200;
/// Word cap instruction for the fallback.
const FALLBACK_MAX_WORDS: usize = 12;
/// Fallback sentinel meaning "not mine — run the pipeline".
const PASS: &str = "PASS";

/// Parsed identity record seeding short-path tone.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct IdentityRecord {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub traits: Vec<String>,
    #[serde(default)]
    pub communication_style: String,
    #[serde(default)]
    pub instructions: String,
}

impl IdentityRecord {
    pub fn parse(value: &serde_json::Value) -> Self {
        serde_json::from_value(value.clone()).unwrap_or_default()
    }

    fn display_name(&self) -> &str {
        if self.name.is_empty() {
            "your assistant"
        } else {
            &self.name
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rule {
    Greeting,
    Acknowledgment,
    StatusCheck,
    Farewell,
    Emoji,
    MemoryQuestion,
}

/// Classify against the rule table. Pure and cheap.
pub fn match_rule(message: &str) -> Option<Rule> {
    let trimmed = message.trim();
    if trimmed.is_empty() {
        return None;
    }
    let lower = trimmed.to_lowercase();
    let bare: String = lower
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace() || *c == '\'')
        .collect();
    let bare = bare.trim();

    const GREETINGS: &[&str] = &[
        "hi", "hello", "hey", "yo", "good morning", "good afternoon", "good evening", "morning",
    ];
    const ACKS: &[&str] = &[
        "ok", "okay", "k", "thanks", "thank you", "got it", "cool", "nice", "great", "perfect",
        "sounds good",
    ];
    const STATUS: &[&str] = &[
        "status", "you there", "are you there", "still there", "how's it going", "hows it going",
        "any update", "progress",
    ];
    const FAREWELLS: &[&str] = &["bye", "goodbye", "goodnight", "good night", "see you", "later"];

    if GREETINGS.contains(&bare) {
        return Some(Rule::Greeting);
    }
    if ACKS.contains(&bare) {
        return Some(Rule::Acknowledgment);
    }
    if STATUS.contains(&bare) {
        return Some(Rule::StatusCheck);
    }
    if FAREWELLS.contains(&bare) {
        return Some(Rule::Farewell);
    }
    if !trimmed.chars().any(|c| c.is_ascii_alphanumeric()) {
        return Some(Rule::Emoji);
    }
    if MEMORY_PATTERNS.is_match(&lower) {
        return Some(Rule::MemoryQuestion);
    }
    None
}

static MEMORY_PATTERNS: std::sync::LazyLock<regex::RegexSet> = std::sync::LazyLock::new(|| {
    regex::RegexSet::new([
        r"^what do you know about\b",
        r"^do you remember\b",
        r"^what did i tell you about\b",
        r"^who is\b",
        r"^remind me what\b",
    ])
    .expect("memory patterns are valid regexes")
});

pub fn word_count(message: &str) -> usize {
    message.split_whitespace().count()
}

/// Canned response for a table rule, seeded with the persona name.
fn canned_response(rule: Rule, identity: &IdentityRecord) -> Option<String> {
    let name = identity.display_name();
    match rule {
        Rule::Greeting => Some(format!("Hey! {name} here — what can I do for you?")),
        Rule::Acknowledgment => Some("Anytime.".to_string()),
        Rule::StatusCheck => Some("Here and listening. Nothing blocked on my side.".to_string()),
        Rule::Farewell => Some("Goodnight! I'll keep an eye on things.".to_string()),
        Rule::Emoji => Some("🙂".to_string()),
        Rule::MemoryQuestion => None, // needs the LLM fallback
    }
}

pub struct ShortPath {
    pub provider: Arc<dyn LlmProvider>,
    pub identity: IdentityRecord,
}

impl ShortPath {
    /// Try to answer without the pipeline. `any_blocked` comes from the
    /// router; a blocked agent owns the next message.
    pub async fn try_handle(&self, message: &str, any_blocked: bool) -> Option<String> {
        if any_blocked {
            return None;
        }
        if word_count(message) >= MAX_WORDS {
            return None;
        }

        let rule = match_rule(message);
        if let Some(rule) = rule {
            if let Some(text) = canned_response(rule, &self.identity) {
                return Some(text);
            }
        }

        let memory_lookup = rule == Some(Rule::MemoryQuestion);
        self.llm_fallback(message, memory_lookup).await
    }

    async fn llm_fallback(&self, message: &str, memory_lookup: bool) -> Option<String> {
        let system = format!(
            "You are {}, {}. Traits: {}. Style: {}. {}\n\
             Reply to trivial conversational messages in at most {FALLBACK_MAX_WORDS} words. \
             If the message needs actual work, tools, or a real answer you don't have, \
             reply with exactly {PASS}.",
            self.identity.display_name(),
            if self.identity.role.is_empty() {
                "a personal assistant"
            } else {
                &self.identity.role
            },
            self.identity.traits.join(", "),
            self.identity.communication_style,
            self.identity.instructions,
        );
        let temperature = if memory_lookup { 0.1 } else { 0.5 };

        let response = self
            .provider
            .chat(ChatRequest {
                messages: vec![Message::system(system), Message::user(message)],
                tools: Vec::new(),
                temperature: Some(temperature),
                max_tokens: Some(FALLBACK_MAX_TOKENS),
                model: None,
            })
            .await
            .ok()?;

        let text = response.content.trim().to_string();
        if text.is_empty() || text == PASS {
            return None;
        }
        Some(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dotbot_providers::scripted::ScriptedProvider;

    #[test]
    fn rule_table_matches() {
        assert_eq!(match_rule("hey"), Some(Rule::Greeting));
        assert_eq!(match_rule("Good morning!"), Some(Rule::Greeting));
        assert_eq!(match_rule("thanks"), Some(Rule::Acknowledgment));
        assert_eq!(match_rule("any update"), Some(Rule::StatusCheck));
        assert_eq!(match_rule("goodnight"), Some(Rule::Farewell));
        assert_eq!(match_rule("👍🎉"), Some(Rule::Emoji));
        assert_eq!(
            match_rule("do you remember my wifi password"),
            Some(Rule::MemoryQuestion)
        );
        assert_eq!(match_rule("send bob a message"), None);
    }

    fn shortpath(turns: Vec<&str>) -> ShortPath {
        ShortPath {
            provider: Arc::new(ScriptedProvider::text("intake", turns)),
            identity: IdentityRecord {
                name: "Ada".into(),
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn canned_rules_skip_the_llm() {
        let sp = shortpath(vec![]);
        let reply = sp.try_handle("hello", false).await.unwrap();
        assert!(reply.contains("Ada"));
    }

    #[tokio::test]
    async fn blocked_agent_suppresses_short_path() {
        let sp = shortpath(vec![]);
        assert!(sp.try_handle("hello", true).await.is_none());
    }

    #[tokio::test]
    async fn ten_word_messages_fall_through() {
        let sp = shortpath(vec![]);
        let long = "please take these nine extra words and do real work";
        assert_eq!(word_count(long), 10);
        assert!(sp.try_handle(long, false).await.is_none());
    }

    #[tokio::test]
    async fn fallback_pass_sentinel_defers_to_pipeline() {
        let sp = shortpath(vec!["PASS"]);
        assert!(sp.try_handle("fix my printer", false).await.is_none());
    }

    #[tokio::test]
    async fn fallback_short_answer_is_used() {
        let sp = shortpath(vec!["Your wifi is CasaNet."]);
        let reply = sp
            .try_handle("do you remember my wifi", false)
            .await
            .unwrap();
        assert_eq!(reply, "Your wifi is CasaNet.");
    }

    #[test]
    fn identity_record_parses_leniently() {
        let id = IdentityRecord::parse(&serde_json::json!({
            "name": "Jeeves", "role": "butler", "traits": ["dry", "precise"],
        }));
        assert_eq!(id.name, "Jeeves");
        assert_eq!(id.traits.len(), 2);
        let empty = IdentityRecord::parse(&serde_json::json!("not an object"));
        assert_eq!(empty.display_name(), "your assistant");
    }
}
