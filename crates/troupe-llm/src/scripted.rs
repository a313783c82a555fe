//! ScriptedProvider: deterministic model replies for tests and dry runs
//!
//! Each call to `complete_stream` pops the next reply off a shared script.
//! Clones made through `clone_with_options` share the script and the
//! request log, so a nested run consumes the same sequence.

use crate::provider::{LlmError, LlmProvider, LlmResult, LlmStream};
use crate::types::{LlmRequest, ModelOptions, Pricing, StreamDelta};
use async_stream::stream;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use troupe_core::Usage;

/// One scripted model reply
#[derive(Clone, Debug)]
pub enum ScriptedReply {
    /// Text-only reply, streamed in small chunks
    Text(String),
    /// One or more tool calls with JSON arguments
    ToolCalls(Vec<(String, Value)>),
    /// Text followed by tool calls
    TextThenTools(String, Vec<(String, Value)>),
    /// A tool call whose argument text is passed through verbatim
    RawToolCall { name: String, arguments: String },
    /// Request rejected before any delta is streamed
    Error(String),
    /// Streams `text`, then fails
    FailAfter { text: String, error: String },
    /// Waits `delay` before replying with the text
    Delayed { delay: Duration, text: String },
    /// Never completes unless cancelled
    Hang,
}

#[derive(Default)]
struct Script {
    replies: Mutex<VecDeque<ScriptedReply>>,
    requests: Mutex<Vec<LlmRequest>>,
    next_call_id: AtomicUsize,
}

#[derive(Clone)]
pub struct ScriptedProvider {
    script: Arc<Script>,
    model: String,
    options: ModelOptions,
    usage: Usage,
    pricing: Option<Pricing>,
}

impl ScriptedProvider {
    pub fn new(replies: Vec<ScriptedReply>) -> Self {
        Self {
            script: Arc::new(Script {
                replies: Mutex::new(replies.into()),
                ..Default::default()
            }),
            model: "scripted".to_string(),
            options: ModelOptions::default(),
            usage: Usage::new(10, 5),
            pricing: None,
        }
    }

    /// Usage reported at the end of every reply.
    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = usage;
        self
    }

    pub fn with_pricing(mut self, pricing: Pricing) -> Self {
        self.pricing = Some(pricing);
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub async fn push(&self, reply: ScriptedReply) {
        self.script.replies.lock().await.push_back(reply);
    }

    /// Every request received so far, across all clones.
    pub async fn requests(&self) -> Vec<LlmRequest> {
        self.script.requests.lock().await.clone()
    }

    pub async fn remaining(&self) -> usize {
        self.script.replies.lock().await.len()
    }

    fn next_id(&self) -> String {
        format!("call_{}", self.script.next_call_id.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn tool_deltas(&self, calls: Vec<(String, String)>) -> Vec<StreamDelta> {
        let mut deltas = Vec::new();
        for (name, arguments) in calls {
            let id = self.next_id();
            deltas.push(StreamDelta::ToolCallStart { id: id.clone(), name });
            deltas.push(StreamDelta::ToolCallDelta { id: id.clone(), arguments });
            deltas.push(StreamDelta::ToolCallEnd { id });
        }
        deltas
    }
}

fn chunks(text: &str) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars.chunks(16).map(|c| c.iter().collect()).collect()
}

fn json_calls(calls: Vec<(String, Value)>) -> Vec<(String, String)> {
    calls.into_iter().map(|(name, args)| (name, args.to_string())).collect()
}

#[async_trait::async_trait]
impl LlmProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn options(&self) -> &ModelOptions {
        &self.options
    }

    fn clone_with_options(&self, options: ModelOptions) -> Arc<dyn LlmProvider> {
        let mut cloned = self.clone();
        cloned.options = options;
        Arc::new(cloned)
    }

    fn pricing(&self) -> Option<Pricing> {
        self.pricing
    }

    async fn complete_stream(
        &self,
        request: LlmRequest,
        cancel: Option<CancellationToken>,
    ) -> LlmResult<LlmStream> {
        self.script.requests.lock().await.push(request);
        let reply = self
            .script
            .replies
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| ScriptedReply::Text("(script exhausted)".into()));

        let cancel = cancel.unwrap_or_default();
        let usage = self.usage;

        let (deltas, stop_reason, tail) = match reply {
            ScriptedReply::Error(message) => return Err(LlmError::RequestFailed(message)),
            ScriptedReply::Text(text) => {
                let deltas = chunks(&text).into_iter().map(StreamDelta::Text).collect();
                (deltas, "end_turn", Tail::Done)
            }
            ScriptedReply::ToolCalls(calls) => {
                (self.tool_deltas(json_calls(calls)), "tool_use", Tail::Done)
            }
            ScriptedReply::TextThenTools(text, calls) => {
                let mut deltas = vec![StreamDelta::Text(text)];
                deltas.extend(self.tool_deltas(json_calls(calls)));
                (deltas, "tool_use", Tail::Done)
            }
            ScriptedReply::RawToolCall { name, arguments } => {
                (self.tool_deltas(vec![(name, arguments)]), "tool_use", Tail::Done)
            }
            ScriptedReply::FailAfter { text, error } => {
                (vec![StreamDelta::Text(text)], "error", Tail::Fail(error))
            }
            ScriptedReply::Delayed { delay, text } => {
                (vec![StreamDelta::Text(text)], "end_turn", Tail::DelayedDone(delay))
            }
            ScriptedReply::Hang => (Vec::new(), "end_turn", Tail::Hang),
        };

        Ok(Box::pin(stream! {
            if let Tail::DelayedDone(delay) = &tail {
                let cancelled = tokio::select! {
                    _ = cancel.cancelled() => true,
                    _ = tokio::time::sleep(*delay) => false,
                };
                if cancelled {
                    yield Err(LlmError::Cancelled);
                    return;
                }
            }
            for delta in deltas {
                if cancel.is_cancelled() {
                    yield Err(LlmError::Cancelled);
                    return;
                }
                yield Ok(delta);
            }
            match tail {
                Tail::Done | Tail::DelayedDone(_) => {
                    yield Ok(StreamDelta::Done {
                        stop_reason: Some(stop_reason.to_string()),
                        usage: Some(usage),
                    });
                }
                Tail::Fail(error) => {
                    yield Err(LlmError::StreamError(error));
                }
                Tail::Hang => {
                    cancel.cancelled().await;
                    yield Err(LlmError::Cancelled);
                }
            }
        }))
    }
}

enum Tail {
    Done,
    DelayedDone(Duration),
    Fail(String),
    Hang,
}
