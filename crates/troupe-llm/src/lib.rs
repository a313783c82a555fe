//! Troupe LLM - Provider adapters with streaming support

pub mod anthropic;
pub mod provider;
pub mod scripted;
pub mod types;

pub use anthropic::AnthropicProvider;
pub use provider::{LlmError, LlmProvider, LlmResult, LlmStream};
pub use scripted::{ScriptedProvider, ScriptedReply};
pub use tokio_util::sync::CancellationToken;
pub use troupe_core::Usage;
pub use types::*;
