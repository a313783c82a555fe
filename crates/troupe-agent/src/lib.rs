//! Troupe Agent - agent graph, session context engine and the runtime that
//! drives multi-agent runs

pub mod agent;
pub mod context;
pub mod handoff;
pub mod manager;
pub mod runtime;
pub mod session;
pub mod store;
pub mod suggestions;

pub use agent::{Agent, AgentGraph};
pub use context::{build_view, narrate, trim_messages, trim_messages_with, Authorship, ContextManager, TrimPolicy};
pub use handoff::{TransferTaskArgs, TRANSFER_TASK};
pub use manager::SessionManager;
pub use runtime::{CompactionConfig, EventStream, RunState, Runtime, RuntimeConfig};
pub use session::{
    AgentMessage, PendingElicitation, PermissionsConfig, Session, SessionItem, SharedSession,
    ToolApproval, USER_AUTHOR,
};
pub use store::{InMemorySessionStore, SessionStore};
pub use suggestions::{parse_suggestions, SuggestionsConfig};
