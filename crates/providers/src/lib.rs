//! LLM provider abstraction.
//!
//! The platform never talks to an LLM SDK directly: everything goes
//! through [`LlmProvider`]. Adapter crates (Anthropic, OpenAI-compat, ...)
//! implement the trait out of tree; the [`ProviderRegistry`] maps model
//! roles to instances. [`scripted::ScriptedProvider`] is the deterministic
//! stand-in used by the server's tests.

mod registry;
pub mod scripted;
mod traits;

pub use registry::ProviderRegistry;
pub use traits::{ChatRequest, ChatResponse, LlmProvider, Usage};
