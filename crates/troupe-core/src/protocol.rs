//! Run event protocol
//!
//! Every run produces an ordered sequence of events, serialized as tagged
//! JSON objects:
//!
//!   { "type": "token_delta", "agent": "root", "content": "Hel" }
//!   { "type": "tool_call_result", "agent": "root", "tool_call_id": "t1", ... }
//!   { "type": "done", "agent": "root", "stop_reason": "end_turn", ... }
//!
//! A run ends with exactly one of `done`, `error`, `cancelled`, or
//! `elicitation_request` (the run is suspended until resumed).

use crate::types::{ToolCall, Usage};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Runtime → Consumer: events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    TokenDelta {
        agent: String,
        content: String,
    },
    ToolCallStarted {
        agent: String,
        tool_call: ToolCall,
    },
    ToolCallResult {
        agent: String,
        tool_call_id: String,
        name: String,
        content: String,
        is_error: bool,
    },
    ElicitationRequest {
        agent: String,
        message: String,
        tool_call: ToolCall,
    },
    AgentSwitched {
        from: String,
        to: String,
    },
    SessionCompacted {
        agent: String,
        summary: String,
    },
    FollowUpSuggestions {
        agent: String,
        suggestions: Vec<String>,
    },
    Error {
        message: String,
    },
    Cancelled,
    Done {
        agent: String,
        stop_reason: String,
        usage: Usage,
        cost: f64,
    },
}

impl Event {
    pub fn token_delta(agent: &str, content: impl Into<String>) -> Self {
        Self::TokenDelta {
            agent: agent.to_string(),
            content: content.into(),
        }
    }

    pub fn tool_call_started(agent: &str, tool_call: &ToolCall) -> Self {
        Self::ToolCallStarted {
            agent: agent.to_string(),
            tool_call: tool_call.clone(),
        }
    }

    pub fn tool_call_result(
        agent: &str,
        tool_call: &ToolCall,
        content: impl Into<String>,
        is_error: bool,
    ) -> Self {
        Self::ToolCallResult {
            agent: agent.to_string(),
            tool_call_id: tool_call.id.clone(),
            name: tool_call.name.clone(),
            content: content.into(),
            is_error,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Wire name of the event kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::TokenDelta { .. } => "token_delta",
            Event::ToolCallStarted { .. } => "tool_call_started",
            Event::ToolCallResult { .. } => "tool_call_result",
            Event::ElicitationRequest { .. } => "elicitation_request",
            Event::AgentSwitched { .. } => "agent_switched",
            Event::SessionCompacted { .. } => "session_compacted",
            Event::FollowUpSuggestions { .. } => "follow_up_suggestions",
            Event::Error { .. } => "error",
            Event::Cancelled => "cancelled",
            Event::Done { .. } => "done",
        }
    }

    /// True for the events that end a run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Event::Done { .. } | Event::Error { .. } | Event::Cancelled | Event::ElicitationRequest { .. }
        )
    }
}

// ---------------------------------------------------------------------------
// Consumer → Runtime: elicitation resume
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ElicitationAction {
    Accept,
    Decline,
    Cancel,
}

/// Decision for a suspended run, keyed by session id by the caller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResumeElicitationRequest {
    pub action: ElicitationAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<serde_json::Value>,
}

impl ResumeElicitationRequest {
    pub fn accept() -> Self {
        Self {
            action: ElicitationAction::Accept,
            content: None,
        }
    }

    /// Accept and approve every tool for the rest of the session.
    pub fn accept_for_session() -> Self {
        Self {
            action: ElicitationAction::Accept,
            content: Some(serde_json::json!({ "approve_session": true })),
        }
    }

    pub fn decline() -> Self {
        Self {
            action: ElicitationAction::Decline,
            content: None,
        }
    }

    pub fn cancel() -> Self {
        Self {
            action: ElicitationAction::Cancel,
            content: None,
        }
    }

    pub fn approves_session(&self) -> bool {
        self.action == ElicitationAction::Accept
            && self
                .content
                .as_ref()
                .and_then(|c| c.get("approve_session"))
                .and_then(|v| v.as_bool())
                .unwrap_or(false)
    }
}
