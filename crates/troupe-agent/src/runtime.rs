//! Runtime - drives one run of a session through its agents
//!
//! A run alternates between dispatching the active agent's view to its model
//! and executing the tool calls that come back, until the model answers
//! without tool calls. Every step is reported on a bounded event channel that
//! the driver task closes when it returns.

use crate::agent::AgentGraph;
use crate::context::ContextManager;
use crate::handoff::{transfer_task_tool, TransferTaskArgs, TRANSFER_TASK};
use crate::session::{PendingElicitation, SharedSession, ToolApproval};
use crate::suggestions::{self, SuggestionsConfig};
use futures::StreamExt;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use troupe_core::{
    ElicitationAction, Error, Event, Message, ResumeElicitationRequest, Result, Role, ToolCall, Usage,
};
use troupe_llm::{AccumulatedToolCall, LlmError, LlmRequest, StreamDelta};

/// Ordered events of one run.
pub type EventStream = ReceiverStream<Event>;

const SUMMARY_PROMPT: &str = "You are a helpful AI assistant that summarizes conversations. \
Write a concise summary of the conversation below. Keep every fact, decision, file name, \
command and open task that later turns may depend on. Leave out pleasantries. \
Return only the summary.";

#[derive(Clone, Debug)]
pub struct CompactionConfig {
    pub enabled: bool,
    /// Compact when the active agent's view is estimated above this size.
    pub threshold_tokens: usize,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold_tokens: 100_000,
        }
    }
}

#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    /// Model calls allowed in one run.
    pub max_iterations: usize,
    /// Capacity of the event channel.
    pub event_buffer: usize,
    pub compaction: CompactionConfig,
    pub suggestions: SuggestionsConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            event_buffer: 256,
            compaction: CompactionConfig::default(),
            suggestions: SuggestionsConfig::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunState {
    Dispatching,
    Streaming,
    AwaitingToolResult,
    AwaitingElicitation,
    Compacting,
    Done,
    Failed,
}

enum Outcome {
    Done { stop_reason: String },
    Suspended,
    Cancelled,
    Failed(String),
}

enum Flow {
    Continue,
    Suspended,
    Cancelled,
}

struct Turn {
    calls: Vec<ToolCall>,
    stop_reason: String,
}

#[derive(Clone)]
pub struct Runtime {
    graph: Arc<AgentGraph>,
    config: Arc<RuntimeConfig>,
    tracker: TaskTracker,
}

impl Runtime {
    pub fn new(graph: Arc<AgentGraph>, config: RuntimeConfig) -> Self {
        Self {
            graph,
            config: Arc::new(config),
            tracker: TaskTracker::new(),
        }
    }

    pub fn graph(&self) -> &Arc<AgentGraph> {
        &self.graph
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Start every tool set attached to the graph.
    pub async fn start(&self) -> Result<()> {
        for set in self.graph.toolsets() {
            set.start().await?;
        }
        Ok(())
    }

    /// Start a run for the session's active agent. The session must not be
    /// waiting on an elicitation.
    pub async fn run_stream(&self, session: SharedSession, cancel: CancellationToken) -> Result<EventStream> {
        let (session_id, agent) = {
            let s = session.read().await;
            if s.pending.is_some() {
                return Err(Error::InvalidRequest(format!(
                    "session {} is waiting for an elicitation response",
                    s.id
                )));
            }
            let agent = s
                .active_agent
                .clone()
                .unwrap_or_else(|| self.graph.root().name.clone());
            (s.id.clone(), agent)
        };
        self.graph.agent(&agent)?;
        Ok(self.spawn_driver(session, session_id, agent, cancel, None))
    }

    /// Continue a run suspended on an elicitation.
    pub async fn resume_stream(
        &self,
        session: SharedSession,
        request: ResumeElicitationRequest,
        cancel: CancellationToken,
    ) -> Result<EventStream> {
        let (session_id, agent, pending) = {
            let mut s = session.write().await;
            let pending = s
                .pending
                .take()
                .ok_or_else(|| Error::NoPendingElicitation(s.id.clone()))?;
            let agent = s.active_agent.clone().unwrap_or_else(|| pending.agent.clone());
            (s.id.clone(), agent, pending)
        };
        Ok(self.spawn_driver(session, session_id, agent, cancel, Some((pending, request))))
    }

    /// Run to completion and collect the events.
    pub async fn run(&self, session: SharedSession, cancel: CancellationToken) -> Result<Vec<Event>> {
        let stream = self.run_stream(session, cancel).await?;
        Ok(stream.collect().await)
    }

    // Kept a plain fn: the driver spawns suggestion runs that call back into
    // `run_stream`, so the driver future must not be part of its type.
    fn spawn_driver(
        &self,
        session: SharedSession,
        session_id: String,
        agent: String,
        cancel: CancellationToken,
        resume: Option<(PendingElicitation, ResumeElicitationRequest)>,
    ) -> EventStream {
        let (tx, rx) = mpsc::channel(self.config.event_buffer.max(1));
        info!("Run started: session={} agent={}", session_id, agent);
        let run = Run {
            runtime: self.clone(),
            session,
            session_id,
            tx,
            cancel,
            agent,
            state: RunState::Dispatching,
        };
        self.tracker.spawn(run.drive(resume));
        ReceiverStream::new(rx)
    }

    /// Summarize what `agent_name` currently sees and append the summary to
    /// the session. `None` when there is nothing to summarize.
    pub async fn summarize(
        &self,
        session: &SharedSession,
        agent_name: &str,
        cancel: CancellationToken,
    ) -> Result<Option<String>> {
        let agent = self.graph.agent(agent_name)?;
        let (previous, conversation) = {
            let s = session.read().await;
            let previous = s.items_since_summary().0.map(str::to_string);
            let conversation: Vec<Message> = s
                .get_messages(agent, &self.graph)
                .into_iter()
                .filter(|m| m.role != Role::System)
                .collect();
            (previous, conversation)
        };
        if conversation.is_empty() {
            return Ok(None);
        }

        let mut transcript = String::new();
        if let Some(previous) = previous {
            transcript.push_str(&format!("Previous summary: {}\n\n", previous));
        }
        transcript.push_str(&render_transcript(&conversation));

        let model = agent.model.clone();
        let request = LlmRequest::new(
            model.model(),
            vec![Message::system(SUMMARY_PROMPT), Message::user(transcript)],
            model.options(),
        );
        let mut stream = model
            .complete_stream(request, Some(cancel))
            .await
            .map_err(|e| e.into_core(model.name()))?;

        let mut text = String::new();
        let mut usage = None;
        while let Some(delta) = stream.next().await {
            match delta.map_err(|e| e.into_core(model.name()))? {
                StreamDelta::Text(t) => text.push_str(&t),
                StreamDelta::Done { usage: u, .. } => usage = u,
                StreamDelta::Error(e) => return Err(Error::llm_error(model.name(), e)),
                _ => {}
            }
        }

        let summary = text.trim().to_string();
        if summary.is_empty() {
            return Ok(None);
        }
        let mut s = session.write().await;
        if let Some(usage) = usage {
            let cost = model.pricing().map(|p| p.cost(&usage)).unwrap_or(0.0);
            s.record_usage(&usage, cost);
        }
        s.add_summary(summary.clone());
        info!("Session compacted: session={} agent={} chars={}", s.id, agent_name, summary.len());
        Ok(Some(summary))
    }

    /// Wait for every driver and suggestions task spawned so far.
    pub async fn wait_background(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    /// Wait for background work, then stop every tool set.
    pub async fn shutdown(&self) {
        self.wait_background().await;
        for set in self.graph.toolsets() {
            if let Err(e) = set.stop().await {
                warn!("Failed to stop tool set: {}", e);
            }
        }
    }
}

fn render_transcript(conversation: &[Message]) -> String {
    let mut parts = Vec::new();
    for m in conversation {
        match m.role {
            Role::User => parts.push(format!("User: {}", m.content)),
            Role::Assistant => {
                if !m.content.is_empty() {
                    parts.push(format!("Assistant: {}", m.content));
                }
                for call in m.calls() {
                    parts.push(format!("Assistant called `{}` with {}", call.name, call.arguments));
                }
            }
            Role::Tool => parts.push(format!("Tool result: {}", m.content)),
            Role::System => {}
        }
    }
    parts.join("\n\n")
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

struct Run {
    runtime: Runtime,
    session: SharedSession,
    session_id: String,
    tx: mpsc::Sender<Event>,
    cancel: CancellationToken,
    /// Agent the next dispatch goes to.
    agent: String,
    state: RunState,
}

impl Run {
    async fn drive(mut self, resume: Option<(PendingElicitation, ResumeElicitationRequest)>) {
        let outcome = self.execute(resume).await;
        self.finish(outcome).await;
    }

    fn transition(&mut self, next: RunState) {
        debug!(
            "Run state: session={} agent={} {:?} -> {:?}",
            self.session_id, self.agent, self.state, next
        );
        self.state = next;
    }

    async fn emit(&self, event: Event) {
        let _ = self.tx.send(event).await;
    }

    async fn execute(&mut self, resume: Option<(PendingElicitation, ResumeElicitationRequest)>) -> Outcome {
        if let Some((pending, request)) = resume {
            match self.resume(pending, request).await {
                Flow::Continue => {}
                Flow::Suspended => return Outcome::Suspended,
                Flow::Cancelled => return Outcome::Cancelled,
            }
        }

        let mut iterations = 0;
        loop {
            if self.cancel.is_cancelled() {
                return Outcome::Cancelled;
            }
            if iterations >= self.runtime.config.max_iterations {
                warn!(
                    "Run hit max iterations: session={} limit={}",
                    self.session_id, self.runtime.config.max_iterations
                );
                return Outcome::Done {
                    stop_reason: "max_iterations".to_string(),
                };
            }
            iterations += 1;
            self.transition(RunState::Dispatching);

            let turn = match self.call_model().await {
                Ok(turn) => turn,
                Err(outcome) => return outcome,
            };
            if turn.calls.is_empty() {
                return Outcome::Done {
                    stop_reason: turn.stop_reason,
                };
            }

            self.transition(RunState::AwaitingToolResult);
            let caller = self.agent.clone();
            match self.process_tool_calls(&caller, turn.calls.into()).await {
                Flow::Continue => {}
                Flow::Suspended => return Outcome::Suspended,
                Flow::Cancelled => return Outcome::Cancelled,
            }
        }
    }

    /// One model call: stream deltas out, then record the assistant message.
    async fn call_model(&mut self) -> std::result::Result<Turn, Outcome> {
        let graph = self.runtime.graph.clone();
        let agent = graph
            .agent(&self.agent)
            .map_err(|e| Outcome::Failed(e.to_string()))?;
        let model = agent.model.clone();

        let messages = self.session.read().await.get_messages(agent, &graph);
        let mut tools = agent.tools().get_definitions();
        let targets = graph.handoff_targets(&agent.name);
        if !targets.is_empty() {
            tools.push(transfer_task_tool(&targets));
        }
        debug!(
            "Dispatching: agent={} messages={} tools={} ~{} tokens",
            agent.name,
            messages.len(),
            tools.len(),
            ContextManager::calculate_total(&messages)
        );
        let request = LlmRequest::new(model.model(), messages, model.options()).with_tools(tools);

        let mut stream = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(Outcome::Cancelled),
            result = model.complete_stream(request, Some(self.cancel.clone())) => match result {
                Ok(stream) => stream,
                Err(LlmError::Cancelled) => return Err(Outcome::Cancelled),
                Err(e) => return Err(Outcome::Failed(e.into_core(model.name()).to_string())),
            },
        };
        self.transition(RunState::Streaming);

        let mut text = String::new();
        let mut calls: Vec<AccumulatedToolCall> = Vec::new();
        let mut stop_reason = None;
        let mut usage: Option<Usage> = None;

        let interrupted = loop {
            let delta = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break Some(Outcome::Cancelled),
                delta = stream.next() => delta,
            };
            match delta {
                Some(Ok(StreamDelta::Text(t))) => {
                    text.push_str(&t);
                    self.emit(Event::token_delta(&self.agent, t)).await;
                }
                Some(Ok(StreamDelta::Thinking(_))) => {}
                Some(Ok(StreamDelta::ToolCallStart { id, name })) => {
                    calls.push(AccumulatedToolCall {
                        id,
                        name,
                        arguments: String::new(),
                    });
                }
                Some(Ok(StreamDelta::ToolCallDelta { id, arguments })) => {
                    if let Some(call) = calls.iter_mut().rev().find(|c| c.id == id) {
                        call.arguments.push_str(&arguments);
                    }
                }
                Some(Ok(StreamDelta::ToolCallEnd { .. })) => {}
                Some(Ok(StreamDelta::Done { stop_reason: r, usage: u })) => {
                    stop_reason = r;
                    usage = u;
                }
                Some(Ok(StreamDelta::Error(message))) => {
                    break Some(Outcome::Failed(
                        Error::llm_error(model.name(), message).to_string(),
                    ))
                }
                Some(Err(LlmError::Cancelled)) => break Some(Outcome::Cancelled),
                Some(Err(e)) => break Some(Outcome::Failed(e.into_core(model.name()).to_string())),
                None => break None,
            }
        };

        if let Some(outcome) = interrupted {
            if matches!(outcome, Outcome::Cancelled) && !text.is_empty() {
                self.session.write().await.add_message(&self.agent, Message::assistant(text));
            }
            return Err(outcome);
        }

        let calls: Vec<ToolCall> = calls.into_iter().map(AccumulatedToolCall::into_tool_call).collect();
        let fallback = if calls.is_empty() { "end_turn" } else { "tool_use" };
        let stop_reason = stop_reason.unwrap_or_else(|| fallback.to_string());

        let mut session = self.session.write().await;
        session.add_message(&self.agent, Message::assistant_with_tools(text, calls.clone()));
        if let Some(usage) = usage {
            let cost = model.pricing().map(|p| p.cost(&usage)).unwrap_or(0.0);
            session.update_last_assistant_message_usage(usage, cost, model.model());
            session.record_usage(&usage, cost);
        }
        drop(session);

        Ok(Turn { calls, stop_reason })
    }

    /// Run `calls` issued by `caller` in order. Stops early when one needs
    /// approval or the run is cancelled.
    async fn process_tool_calls(&mut self, caller: &str, mut queue: VecDeque<ToolCall>) -> Flow {
        while let Some(call) = queue.pop_front() {
            if self.cancel.is_cancelled() {
                queue.push_front(call);
                self.record_cancelled(caller, queue.into()).await;
                return Flow::Cancelled;
            }
            self.emit(Event::tool_call_started(caller, &call)).await;

            if call.name == TRANSFER_TASK {
                self.handoff(caller, &call).await;
                continue;
            }

            let tool = self
                .runtime
                .graph
                .get(caller)
                .and_then(|agent| agent.tools().get(&call.name));
            let Some(tool) = tool else {
                let message = format!("Tool not found: {}", call.name);
                self.record_result(caller, &call, message, true).await;
                continue;
            };

            let approval = self.session.read().await.tool_approval(&call.name);
            match approval {
                ToolApproval::Denied => {
                    let message = format!("Tool call to `{}` was denied by the session permissions.", call.name);
                    self.record_result(caller, &call, message, true).await;
                    continue;
                }
                ToolApproval::Ask if tool.requires_approval() => {
                    queue.push_front(call.clone());
                    self.suspend(caller, call, queue.into()).await;
                    return Flow::Suspended;
                }
                _ => {}
            }

            self.run_tool(caller, &call).await;
        }
        Flow::Continue
    }

    async fn run_tool(&mut self, caller: &str, call: &ToolCall) {
        let graph = self.runtime.graph.clone();
        let result = match graph.agent(caller) {
            Ok(agent) => agent.tools().execute_call(call, self.cancel.clone()).await,
            Err(e) => Err(e),
        };
        let (content, is_error) = match result {
            Ok(result) => (result.to_content_string(), result.is_error()),
            Err(e) => (e.to_string(), true),
        };
        debug!("Tool {} finished: error={} bytes={}", call.name, is_error, content.len());
        self.record_result(caller, call, content, is_error).await;
    }

    async fn record_result(&self, caller: &str, call: &ToolCall, content: String, is_error: bool) {
        self.session
            .write()
            .await
            .add_message(caller, Message::tool_result(&call.id, &content));
        self.emit(Event::tool_call_result(caller, call, content, is_error)).await;
    }

    async fn record_cancelled(&self, caller: &str, calls: Vec<ToolCall>) {
        for call in calls {
            self.record_result(caller, &call, "The tool call was cancelled.".to_string(), true)
                .await;
        }
    }

    async fn suspend(&mut self, caller: &str, call: ToolCall, outstanding: Vec<ToolCall>) {
        self.transition(RunState::AwaitingElicitation);
        self.session.write().await.pending = Some(PendingElicitation {
            agent: caller.to_string(),
            tool_calls: outstanding,
        });
        info!(
            "Run suspended for approval: session={} tool={}",
            self.session_id, call.name
        );
        let message = format!("Allow {} to run the `{}` tool?", caller, call.name);
        self.emit(Event::ElicitationRequest {
            agent: caller.to_string(),
            message,
            tool_call: call,
        })
        .await;
    }

    async fn resume(&mut self, pending: PendingElicitation, request: ResumeElicitationRequest) -> Flow {
        let PendingElicitation { agent: caller, tool_calls } = pending;
        let mut queue: VecDeque<ToolCall> = tool_calls.into();
        let Some(call) = queue.pop_front() else {
            return Flow::Continue;
        };
        info!(
            "Resuming run: session={} tool={} action={:?}",
            self.session_id, call.name, request.action
        );

        self.transition(RunState::AwaitingToolResult);
        match request.action {
            ElicitationAction::Accept => {
                if request.approves_session() {
                    self.session.write().await.tools_approved = true;
                }
                self.run_tool(&caller, &call).await;
            }
            ElicitationAction::Decline => {
                let message = format!("The user declined to run the `{}` tool.", call.name);
                self.record_result(&caller, &call, message, true).await;
            }
            ElicitationAction::Cancel => {
                queue.push_front(call);
                self.record_cancelled(&caller, queue.into()).await;
                return Flow::Cancelled;
            }
        }
        self.process_tool_calls(&caller, queue).await
    }

    async fn handoff(&mut self, caller: &str, call: &ToolCall) {
        let args = call
            .parse_arguments()
            .and_then(serde_json::from_value::<TransferTaskArgs>);
        let args = match args {
            Ok(args) => args,
            Err(e) => {
                let message = format!("Invalid arguments for {}: {}", TRANSFER_TASK, e);
                self.record_result(caller, call, message, true).await;
                return;
            }
        };

        let graph = self.runtime.graph.clone();
        let targets = graph.handoff_targets(caller);
        if !targets.iter().any(|t| t.name == args.agent) {
            let names: Vec<&str> = targets.iter().map(|t| t.name.as_str()).collect();
            let message = format!(
                "Agent {} is not a valid handoff target for {}. Valid targets: {}",
                args.agent,
                caller,
                if names.is_empty() { "none".to_string() } else { names.join(", ") }
            );
            self.record_result(caller, call, message, true).await;
            return;
        }

        let message = format!("Task transferred to {}.", args.agent);
        self.record_result(caller, call, message, false).await;
        {
            let mut session = self.session.write().await;
            session.add_message(&args.agent, Message::user(args.briefing(caller)));
            session.active_agent = Some(args.agent.clone());
        }
        info!("Agent switched: session={} {} -> {}", self.session_id, caller, args.agent);
        self.emit(Event::AgentSwitched {
            from: caller.to_string(),
            to: args.agent.clone(),
        })
        .await;
        self.agent = args.agent;
    }

    async fn compact_if_needed(&mut self) {
        let compaction = self.runtime.config.compaction.clone();
        if !compaction.enabled {
            return;
        }
        let graph = self.runtime.graph.clone();
        let Some(agent) = graph.get(&self.agent) else { return };
        let view = self.session.read().await.get_messages(agent, &graph);
        if !ContextManager::new(compaction.threshold_tokens).exceeds(&view) {
            return;
        }
        let tokens = ContextManager::calculate_total(&view);

        self.transition(RunState::Compacting);
        info!(
            "Compacting session: session={} ~{} tokens > {}",
            self.session_id, tokens, compaction.threshold_tokens
        );
        match self
            .runtime
            .summarize(&self.session, &self.agent, self.cancel.clone())
            .await
        {
            Ok(Some(summary)) => {
                self.emit(Event::SessionCompacted {
                    agent: self.agent.clone(),
                    summary,
                })
                .await;
            }
            Ok(None) => {}
            Err(e) => warn!("Compaction failed: session={} {}", self.session_id, e),
        }
    }

    async fn follow_up(&self) {
        let config = self.runtime.config.suggestions.clone();
        if !config.enabled {
            return;
        }
        let Some(agent) = self.runtime.graph.get(&self.agent) else { return };
        let (last_user, last_assistant) = {
            let s = self.session.read().await;
            (
                s.last_user_message_content().to_string(),
                s.last_assistant_message_content().to_string(),
            )
        };
        let task = suggestions::follow_up(
            agent.model.clone(),
            last_user,
            last_assistant,
            config,
            self.agent.clone(),
            self.tx.clone(),
            self.cancel.clone(),
        );
        if let Err(e) = self.runtime.tracker.spawn(task).await {
            warn!("Suggestions task failed: {}", e);
        }
    }

    /// Emit the terminal event for `outcome`. With suggestions enabled the
    /// `done` event follows the suggestions task, so consumers see it up to
    /// the suggestions timeout later than the last model reply.
    async fn finish(mut self, outcome: Outcome) {
        match outcome {
            Outcome::Done { stop_reason } => {
                self.compact_if_needed().await;
                self.transition(RunState::Done);
                let (usage, cost) = {
                    let s = self.session.read().await;
                    (Usage::new(s.input_tokens, s.output_tokens), s.cost)
                };
                info!(
                    "Run complete: session={} agent={} stop_reason={} input_tokens={} output_tokens={}",
                    self.session_id, self.agent, stop_reason, usage.input_tokens, usage.output_tokens
                );
                self.follow_up().await;
                self.emit(Event::Done {
                    agent: self.agent.clone(),
                    stop_reason,
                    usage,
                    cost,
                })
                .await;
            }
            Outcome::Suspended => {}
            Outcome::Cancelled => {
                info!("Run cancelled: session={}", self.session_id);
                self.emit(Event::Cancelled).await;
            }
            Outcome::Failed(message) => {
                self.transition(RunState::Failed);
                warn!("Run failed: session={} {}", self.session_id, message);
                self.emit(Event::error(message)).await;
            }
        }
    }
}
