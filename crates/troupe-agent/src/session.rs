//! Session state: the shared transcript every agent reads from, plus the
//! approval state and usage counters of the conversation.

use crate::agent::{Agent, AgentGraph};
use crate::context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use troupe_core::{Message, Role, ToolCall, Usage};

/// A session shared between the runtime and its caller.
pub type SharedSession = Arc<RwLock<Session>>;

/// Author recorded for messages typed by the user. Every agent sees these as
/// its own.
pub const USER_AUTHOR: &str = "";

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AgentMessage {
    pub agent_name: String,
    pub message: Message,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionItem {
    Message(AgentMessage),
    Summary { summary: String, created_at: DateTime<Utc> },
}

impl SessionItem {
    pub fn as_message(&self) -> Option<&AgentMessage> {
        match self {
            SessionItem::Message(m) => Some(m),
            SessionItem::Summary { .. } => None,
        }
    }
}

/// Tool name patterns. A trailing `*` matches any suffix.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct PermissionsConfig {
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
}

fn pattern_matches(pattern: &str, name: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => name.starts_with(prefix),
        None => pattern == name,
    }
}

/// What to do with a tool call before running it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ToolApproval {
    Approved,
    Denied,
    Ask,
}

/// A run suspended on a tool call awaiting a human decision. `tool_calls`
/// holds the call awaiting approval followed by the calls of the same
/// assistant turn that have not run yet.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PendingElicitation {
    pub agent: String,
    pub tool_calls: Vec<ToolCall>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    #[serde(default)]
    pub title: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub items: Vec<SessionItem>,
    /// Every tool runs without asking once set.
    #[serde(default)]
    pub tools_approved: bool,
    #[serde(default)]
    pub permissions: PermissionsConfig,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cost: f64,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Agent the next run starts with. The graph root when unset.
    #[serde(default)]
    pub active_agent: Option<String>,
    #[serde(default)]
    pub pending: Option<PendingElicitation>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            title: String::new(),
            created_at: Utc::now(),
            items: Vec::new(),
            tools_approved: false,
            permissions: PermissionsConfig::default(),
            input_tokens: 0,
            output_tokens: 0,
            cost: 0.0,
            working_dir: None,
            active_agent: None,
            pending: None,
        }
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_tools_approved(mut self, approved: bool) -> Self {
        self.tools_approved = approved;
        self
    }

    pub fn with_permissions(mut self, permissions: PermissionsConfig) -> Self {
        self.permissions = permissions;
        self
    }

    pub fn into_shared(self) -> SharedSession {
        Arc::new(RwLock::new(self))
    }

    pub fn add_message(&mut self, agent_name: &str, message: Message) {
        self.items.push(SessionItem::Message(AgentMessage {
            agent_name: agent_name.to_string(),
            message,
            created_at: Utc::now(),
        }));
    }

    pub fn add_user_message(&mut self, content: impl Into<String>) {
        self.add_message(USER_AUTHOR, Message::user(content));
    }

    /// Append a summary. Views only include items recorded after the latest
    /// summary.
    pub fn add_summary(&mut self, summary: impl Into<String>) {
        self.items.push(SessionItem::Summary {
            summary: summary.into(),
            created_at: Utc::now(),
        });
    }

    /// The latest summary and the items after it.
    pub fn items_since_summary(&self) -> (Option<&str>, &[SessionItem]) {
        let latest = self
            .items
            .iter()
            .rposition(|item| matches!(item, SessionItem::Summary { .. }));
        match latest {
            Some(i) => {
                let summary = match &self.items[i] {
                    SessionItem::Summary { summary, .. } => Some(summary.as_str()),
                    SessionItem::Message(_) => None,
                };
                (summary, &self.items[i + 1..])
            }
            None => (None, &self.items[..]),
        }
    }

    /// The message list `agent` sends to its model.
    pub fn get_messages(&self, agent: &Agent, graph: &AgentGraph) -> Vec<Message> {
        context::build_view(self, agent, graph)
    }

    pub fn all_messages(&self) -> impl DoubleEndedIterator<Item = &AgentMessage> {
        self.items.iter().filter_map(SessionItem::as_message)
    }

    pub fn message_count(&self) -> usize {
        self.all_messages().count()
    }

    fn last_content(&self, role: Role) -> &str {
        self.all_messages()
            .rev()
            .find(|m| m.message.role == role)
            .map(|m| m.message.content.as_str())
            .unwrap_or_default()
    }

    /// Content of the most recent user message, empty when there is none.
    pub fn last_user_message_content(&self) -> &str {
        self.last_content(Role::User)
    }

    pub fn last_assistant_message_content(&self) -> &str {
        self.last_content(Role::Assistant)
    }

    /// Up to `n` most recent non-blank user messages, oldest first.
    pub fn last_user_messages(&self, n: usize) -> Vec<&str> {
        let mut recent: Vec<&str> = self
            .all_messages()
            .rev()
            .filter(|m| m.message.role == Role::User && !m.message.content.trim().is_empty())
            .take(n)
            .map(|m| m.message.content.as_str())
            .collect();
        recent.reverse();
        recent
    }

    /// Attach usage to the most recent assistant message. No-op when there
    /// is none.
    pub fn update_last_assistant_message_usage(&mut self, usage: Usage, cost: f64, model: &str) {
        let last = self.items.iter_mut().rev().find_map(|item| match item {
            SessionItem::Message(m) if m.message.role == Role::Assistant => Some(m),
            _ => None,
        });
        if let Some(m) = last {
            m.message.usage = Some(usage);
            m.message.cost = Some(cost);
            m.message.model = Some(model.to_string());
        }
    }

    /// Add one model call to the session counters.
    pub fn record_usage(&mut self, usage: &Usage, cost: f64) {
        self.input_tokens += usage.input_tokens;
        self.output_tokens += usage.output_tokens;
        self.cost += cost;
    }

    /// Deny patterns win over allow patterns and over the session-wide
    /// approval.
    pub fn tool_approval(&self, tool_name: &str) -> ToolApproval {
        if self.permissions.deny.iter().any(|p| pattern_matches(p, tool_name)) {
            return ToolApproval::Denied;
        }
        if self.tools_approved || self.permissions.allow.iter().any(|p| pattern_matches(p, tool_name)) {
            return ToolApproval::Approved;
        }
        ToolApproval::Ask
    }

    pub fn is_tool_auto_approved(&self, tool_name: &str) -> bool {
        self.tool_approval(tool_name) == ToolApproval::Approved
    }
}
