//! Per-agent context views and token estimation
//!
//! A view is three zones of system messages followed by the conversation:
//!
//!   invariant   instructions, handoff prompt, tool set instructions
//!   context     date and environment details
//!   summary     the latest session summary
//!
//! Messages another agent authored are rewritten into plain user messages
//! so a model never sees tool calls it did not make.

use crate::agent::{Agent, AgentGraph};
use crate::handoff::handoff_prompt;
use crate::session::{Session, SessionItem};
use std::collections::HashSet;
use std::path::Path;
use troupe_core::{Message, Role};

const CHARS_PER_TOKEN: f32 = 4.0;

pub struct ContextManager {
    max_tokens: usize,
}

impl ContextManager {
    pub fn new(max_tokens: usize) -> Self {
        Self { max_tokens }
    }

    pub fn estimate_tokens(text: &str) -> usize {
        (text.len() as f32 / CHARS_PER_TOKEN).ceil() as usize
    }

    pub fn message_tokens(message: &Message) -> usize {
        let calls: usize = message
            .calls()
            .iter()
            .map(|c| Self::estimate_tokens(&c.name) + Self::estimate_tokens(&c.arguments))
            .sum();
        Self::estimate_tokens(&message.content) + calls + 10
    }

    pub fn calculate_total(messages: &[Message]) -> usize {
        messages.iter().map(Self::message_tokens).sum()
    }

    pub fn exceeds(&self, messages: &[Message]) -> bool {
        Self::calculate_total(messages) > self.max_tokens
    }
}

// ---------------------------------------------------------------------------
// Authorship rewriting
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Authorship<'a> {
    Own,
    Foreign(&'a str),
}

impl<'a> Authorship<'a> {
    /// User-authored messages (empty author) belong to every agent.
    pub fn of(viewer: &str, author: &'a str) -> Self {
        if author.is_empty() || author == viewer {
            Authorship::Own
        } else {
            Authorship::Foreign(author)
        }
    }
}

/// How `message` appears to a viewer. `None` drops it from the view.
pub fn narrate(message: &Message, authorship: Authorship<'_>) -> Option<Message> {
    let author = match authorship {
        Authorship::Own => {
            let mut own = message.clone();
            own.cache_checkpoint = false;
            return Some(own);
        }
        Authorship::Foreign(author) => author,
    };

    match message.role {
        Role::Assistant => {
            let mut parts = Vec::new();
            if !message.content.is_empty() {
                parts.push(format!("[{}] said: {}", author, message.content));
            }
            for call in message.calls() {
                parts.push(format!(
                    "[{}] called tool `{}` with parameters: {}",
                    author, call.name, call.arguments
                ));
            }
            if parts.is_empty() {
                None
            } else {
                Some(Message::user(format!("For context: {}", parts.join("\n"))))
            }
        }
        Role::Tool => {
            if message.content.is_empty() {
                None
            } else {
                Some(Message::user(format!(
                    "For context: Tool returned result: {}",
                    message.content
                )))
            }
        }
        Role::User => Some(Message::user(message.content.clone())),
        Role::System => Some(Message::system(message.content.clone())),
    }
}

// ---------------------------------------------------------------------------
// History trimming
// ---------------------------------------------------------------------------

/// How `trim_messages_with` treats tool results whose assistant falls
/// outside the kept window.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TrimPolicy {
    /// Widen the window to the left until it includes the assistant.
    #[default]
    ExpandLeft,
    /// Keep the window and drop the stranded results.
    DropOrphans,
}

pub fn trim_messages(messages: &[Message], max: usize) -> Vec<Message> {
    trim_messages_with(messages, max, TrimPolicy::ExpandLeft)
}

/// Keep the last `max` messages without splitting a tool call from its
/// results. Tool results with no preceding matching call are always dropped.
pub fn trim_messages_with(messages: &[Message], max: usize, policy: TrimPolicy) -> Vec<Message> {
    if max == 0 {
        return Vec::new();
    }
    let mut start = messages.len().saturating_sub(max);

    if policy == TrimPolicy::ExpandLeft {
        loop {
            let stranded = stranded_ids(&messages[start..]);
            if stranded.is_empty() {
                break;
            }
            let owner = messages[..start].iter().rposition(|m| {
                m.role == Role::Assistant && m.calls().iter().any(|c| stranded.contains(c.id.as_str()))
            });
            match owner {
                Some(i) => start = i,
                None => break,
            }
        }
    }

    let mut seen = HashSet::new();
    messages[start..]
        .iter()
        .filter(|m| {
            for call in m.calls() {
                seen.insert(call.id.as_str());
            }
            match (&m.role, &m.tool_call_id) {
                (Role::Tool, Some(id)) => seen.contains(id.as_str()),
                (Role::Tool, None) => false,
                _ => true,
            }
        })
        .cloned()
        .collect()
}

fn stranded_ids(window: &[Message]) -> HashSet<&str> {
    let mut seen = HashSet::new();
    let mut stranded = HashSet::new();
    for m in window {
        for call in m.calls() {
            seen.insert(call.id.as_str());
        }
        if let (Role::Tool, Some(id)) = (&m.role, &m.tool_call_id) {
            if !seen.contains(id.as_str()) {
                stranded.insert(id.as_str());
            }
        }
    }
    stranded
}

// ---------------------------------------------------------------------------
// View assembly
// ---------------------------------------------------------------------------

pub fn environment_info(working_dir: Option<&Path>) -> String {
    let dir = working_dir
        .map(|d| d.display().to_string())
        .or_else(|| std::env::current_dir().ok().map(|d| d.display().to_string()))
        .unwrap_or_default();
    format!(
        "Here is useful information about the environment you are running in:\n\
         <env>\nWorking directory: {}\nPlatform: {}\n</env>",
        dir,
        std::env::consts::OS
    )
}

fn mark_last(zone: &mut [Message]) -> bool {
    match zone.last_mut() {
        Some(m) => {
            m.cache_checkpoint = true;
            true
        }
        None => false,
    }
}

/// Assemble the message list `agent` sends to its model.
pub fn build_view(session: &Session, agent: &Agent, graph: &AgentGraph) -> Vec<Message> {
    let mut invariant = vec![Message::system(&agent.instructions)];
    let targets = graph.handoff_targets(&agent.name);
    if !targets.is_empty() {
        invariant.push(Message::system(handoff_prompt(&targets)));
    }
    invariant.extend(agent.toolset_instructions().into_iter().map(Message::system));

    let mut context = Vec::new();
    if agent.add_date {
        context.push(Message::system(format!(
            "Today's date: {}",
            chrono::Local::now().format("%Y-%m-%d")
        )));
    }
    if agent.add_environment_info {
        context.push(Message::system(environment_info(session.working_dir.as_deref())));
    }

    let (summary, tail) = session.items_since_summary();
    let mut summary_zone: Vec<Message> = summary
        .map(|s| Message::system(format!("Session Summary: {}", s)))
        .into_iter()
        .collect();

    let mut conversation: Vec<Message> = tail
        .iter()
        .filter_map(|item| match item {
            SessionItem::Message(m) => narrate(&m.message, Authorship::of(&agent.name, &m.agent_name)),
            SessionItem::Summary { .. } => None,
        })
        .collect();
    if let Some(n) = agent.num_history_items {
        conversation = trim_messages(&conversation, n);
    }

    // At most two checkpoints: the summary only stands in for a missing zone.
    let marked_invariant = mark_last(&mut invariant);
    let marked_context = mark_last(&mut context);
    if !(marked_invariant && marked_context) {
        mark_last(&mut summary_zone);
    }

    let mut view = invariant;
    view.append(&mut context);
    view.append(&mut summary_zone);
    view.append(&mut conversation);
    view
}
