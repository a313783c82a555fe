//! Follow-up suggestions generated after a run completes
//!
//! The generator is itself a run: a one-agent graph and a throwaway session
//! seeded with a prompt built from the last exchange, driven by a nested
//! `Runtime` with compaction and suggestions turned off.

use crate::agent::{Agent, AgentGraph};
use crate::runtime::{CompactionConfig, Runtime, RuntimeConfig};
use crate::session::Session;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use troupe_core::Event;
use troupe_llm::{LlmProvider, ModelOptions};

const SYSTEM_PROMPT: &str = "You are a helpful AI assistant. Based on the conversation, suggest \
follow-up actions or questions the user might want to explore next.

Rules:
- Keep each suggestion very concise (under 8 words)
- Use action verbs or short questions
- No explanations, just the suggestion text

Return suggestions as a JSON array of strings:
[\"suggestion 1\", \"suggestion 2\", \"suggestion 3\"]

Return ONLY the JSON array, nothing else. Order suggestions by relevance (most relevant first).";

#[derive(Clone, Debug)]
pub struct SuggestionsConfig {
    pub enabled: bool,
    pub max_count: usize,
    pub timeout: Duration,
    pub max_tokens: u32,
}

impl Default for SuggestionsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_count: 3,
            timeout: Duration::from_millis(5000),
            max_tokens: 300,
        }
    }
}

fn user_prompt(max: usize, last_user: &str, last_assistant: &str) -> String {
    format!(
        "Based on this conversation, suggest {max} follow-up options:\n\n\
         Last user message: {last_user}\n\n\
         Last assistant response: {last_assistant}\n\n\
         Provide exactly {max} suggestions as a JSON array."
    )
}

/// Pull a JSON string array out of a reply that may wrap it in prose or a
/// code fence. Blank entries are skipped; at most `max` are kept.
pub fn parse_suggestions(response: &str, max: usize) -> Vec<String> {
    let candidate = match (response.find('['), response.rfind(']')) {
        (Some(start), Some(end)) if end > start => &response[start..=end],
        _ => response,
    };
    let Ok(parsed) = serde_json::from_str::<Vec<String>>(candidate) else {
        return Vec::new();
    };
    parsed
        .into_iter()
        .filter(|s| !s.trim().is_empty())
        .take(max)
        .collect()
}

/// Ask `model` for follow-ups to the exchange and return what survives
/// parsing. Every failure ends up as an empty list.
pub async fn generate(
    model: Arc<dyn LlmProvider>,
    last_user: &str,
    last_assistant: &str,
    config: &SuggestionsConfig,
    cancel: CancellationToken,
) -> Vec<String> {
    if last_user.is_empty() || last_assistant.is_empty() {
        debug!("Skipping suggestions: missing user or assistant message");
        return Vec::new();
    }

    let model = model.clone_with_options(ModelOptions {
        max_tokens: Some(config.max_tokens),
        structured_output: None,
        ..model.options().clone()
    });
    let graph = match AgentGraph::new(vec![Agent::new("root", model).with_instructions(SYSTEM_PROMPT)]) {
        Ok(graph) => Arc::new(graph),
        Err(e) => {
            warn!("Failed to build suggestions agent: {}", e);
            return Vec::new();
        }
    };
    let runtime = Runtime::new(
        graph,
        RuntimeConfig {
            max_iterations: 1,
            compaction: CompactionConfig {
                enabled: false,
                ..CompactionConfig::default()
            },
            suggestions: SuggestionsConfig::default(),
            ..RuntimeConfig::default()
        },
    );

    let mut session = Session::new();
    session.add_user_message(user_prompt(config.max_count, last_user, last_assistant));
    let session = session.into_shared();

    match runtime.run(session.clone(), cancel).await {
        Ok(events) => {
            if let Some(Event::Error { message }) = events.last() {
                warn!("Suggestions run failed: {}", message);
                return Vec::new();
            }
        }
        Err(e) => {
            warn!("Suggestions run failed: {}", e);
            return Vec::new();
        }
    }

    let reply = session.read().await.last_assistant_message_content().to_string();
    let suggestions = parse_suggestions(&reply, config.max_count);
    if suggestions.is_empty() {
        debug!("No usable suggestions in reply: {}", reply);
    }
    suggestions
}

/// Background task body: generate within the configured timeout and emit a
/// `follow_up_suggestions` event when anything survived.
pub(crate) async fn follow_up(
    model: Arc<dyn LlmProvider>,
    last_user: String,
    last_assistant: String,
    config: SuggestionsConfig,
    agent: String,
    events: mpsc::Sender<Event>,
    cancel: CancellationToken,
) {
    let cancel = cancel.child_token();
    let generated = tokio::time::timeout(
        config.timeout,
        generate(model, &last_user, &last_assistant, &config, cancel.clone()),
    )
    .await;

    let suggestions = match generated {
        Ok(suggestions) => suggestions,
        Err(_) => {
            cancel.cancel();
            debug!("Suggestions timed out after {:?}", config.timeout);
            return;
        }
    };
    if !suggestions.is_empty() {
        let _ = events
            .send(Event::FollowUpSuggestions { agent, suggestions })
            .await;
    }
}
