//! Runtime, session manager and suggestions tests driven by ScriptedProvider

use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use troupe_agent::*;
use troupe_core::{Error, Event, ResumeElicitationRequest, Role, Usage};
use troupe_llm::{Pricing, ScriptedProvider, ScriptedReply};
use troupe_tools::{parse_args, Tool, ToolError, ToolResult, ToolSet};

// ===========================================================================
// Test tools
// ===========================================================================

struct EchoTool;

#[async_trait::async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str { "echo" }

    fn description(&self) -> &str { "Echo the text back" }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "text": { "type": "string" } },
            "required": ["text"]
        })
    }

    fn is_read_only(&self) -> bool { true }

    async fn execute(&self, args: Value, _cancel: CancellationToken) -> Result<ToolResult, ToolError> {
        #[derive(Deserialize)]
        struct Args {
            text: String,
        }
        let Args { text } = parse_args(args)?;
        Ok(ToolResult::text(format!("echo: {}", text)))
    }
}

/// Side-effecting tool; needs approval.
struct TouchTool {
    calls: Arc<AtomicUsize>,
}

#[async_trait::async_trait]
impl Tool for TouchTool {
    fn name(&self) -> &str { "touch" }

    fn description(&self) -> &str { "Touch something" }

    fn input_schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    async fn execute(&self, _args: Value, _cancel: CancellationToken) -> Result<ToolResult, ToolError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ToolResult::text("touched"))
    }
}

#[derive(Default)]
struct TestTools {
    touches: Arc<AtomicUsize>,
    stopped: AtomicBool,
}

#[async_trait::async_trait]
impl ToolSet for TestTools {
    fn tools(&self) -> Vec<Arc<dyn Tool>> {
        vec![
            Arc::new(EchoTool),
            Arc::new(TouchTool {
                calls: self.touches.clone(),
            }),
        ]
    }

    async fn stop(&self) -> troupe_core::Result<()> {
        self.stopped.store(true, Ordering::SeqCst);
        Ok(())
    }
}

// ===========================================================================
// Helpers
// ===========================================================================

struct Fixture {
    runtime: Runtime,
    provider: ScriptedProvider,
    tools: Arc<TestTools>,
}

fn fixture_with(replies: Vec<ScriptedReply>, config: RuntimeConfig) -> Fixture {
    let provider = ScriptedProvider::new(replies);
    let tools = Arc::new(TestTools::default());
    let root = Agent::new("root", Arc::new(provider.clone()))
        .with_instructions("You are a test agent.")
        .with_toolset(tools.clone());
    let graph = AgentGraph::new(vec![root]).unwrap();
    Fixture {
        runtime: Runtime::new(Arc::new(graph), config),
        provider,
        tools,
    }
}

fn fixture(replies: Vec<ScriptedReply>) -> Fixture {
    fixture_with(replies, RuntimeConfig::default())
}

fn text(s: &str) -> ScriptedReply {
    ScriptedReply::Text(s.to_string())
}

fn call(name: &str, args: Value) -> ScriptedReply {
    ScriptedReply::ToolCalls(vec![(name.to_string(), args)])
}

fn session_with(prompt: &str) -> SharedSession {
    let mut session = Session::new();
    session.add_user_message(prompt);
    session.into_shared()
}

fn kinds(events: &[Event]) -> Vec<&'static str> {
    let mut out: Vec<&'static str> = Vec::new();
    for e in events {
        // Collapse runs of token deltas
        if e.kind() == "token_delta" && out.last() == Some(&"token_delta") {
            continue;
        }
        out.push(e.kind());
    }
    out
}

fn streamed_text(events: &[Event]) -> String {
    events
        .iter()
        .filter_map(|e| match e {
            Event::TokenDelta { content, .. } => Some(content.as_str()),
            _ => None,
        })
        .collect()
}

fn tool_results(events: &[Event]) -> Vec<(String, bool)> {
    events
        .iter()
        .filter_map(|e| match e {
            Event::ToolCallResult { content, is_error, .. } => Some((content.clone(), *is_error)),
            _ => None,
        })
        .collect()
}

async fn run(fx: &Fixture, session: &SharedSession) -> Vec<Event> {
    fx.runtime
        .run(session.clone(), CancellationToken::new())
        .await
        .unwrap()
}

async fn resume(fx: &Fixture, session: &SharedSession, request: ResumeElicitationRequest) -> Vec<Event> {
    fx.runtime
        .resume_stream(session.clone(), request, CancellationToken::new())
        .await
        .unwrap()
        .collect()
        .await
}

// ===========================================================================
// Basic runs
// ===========================================================================

#[tokio::test]
async fn text_reply_streams_then_done() {
    let fx = fixture(vec![text("Hello there, this reply spans several chunks.")]);
    let session = session_with("hi");

    let events = run(&fx, &session).await;

    assert_eq!(kinds(&events), vec!["token_delta", "done"]);
    assert_eq!(streamed_text(&events), "Hello there, this reply spans several chunks.");
    match events.last().unwrap() {
        Event::Done { agent, stop_reason, usage, .. } => {
            assert_eq!(agent, "root");
            assert_eq!(stop_reason, "end_turn");
            assert_eq!(*usage, Usage::new(10, 5));
        }
        other => panic!("expected done, got {:?}", other),
    }

    let s = session.read().await;
    assert_eq!(s.last_assistant_message_content(), "Hello there, this reply spans several chunks.");
    let last = s.all_messages().last().unwrap();
    assert_eq!(last.agent_name, "root");
    assert_eq!(last.message.usage, Some(Usage::new(10, 5)));
    assert_eq!(last.message.model.as_deref(), Some("scripted"));
}

#[tokio::test]
async fn tool_call_runs_and_redispatches() {
    let fx = fixture(vec![call("echo", json!({"text": "ping"})), text("pong received")]);
    let session = session_with("echo ping");

    let events = run(&fx, &session).await;

    assert_eq!(
        kinds(&events),
        vec!["tool_call_started", "tool_call_result", "token_delta", "done"]
    );
    assert_eq!(tool_results(&events), vec![("echo: ping".to_string(), false)]);

    let requests = fx.provider.requests().await;
    assert_eq!(requests.len(), 2);
    let tool_names: Vec<String> = requests[0]
        .tools
        .as_ref()
        .unwrap()
        .iter()
        .map(|t| t.name.clone())
        .collect();
    assert_eq!(tool_names, vec!["echo", "touch"]);

    let last = requests[1].messages.last().unwrap();
    assert_eq!(last.role, Role::Tool);
    assert_eq!(last.tool_call_id.as_deref(), Some("call_1"));
    assert_eq!(last.content, "echo: ping");

    let s = session.read().await;
    assert_eq!(s.input_tokens, 20);
    assert_eq!(s.output_tokens, 10);
}

#[tokio::test]
async fn unknown_tool_yields_error_result() {
    let fx = fixture(vec![call("nope", json!({})), text("sorry")]);
    let session = session_with("go");

    let events = run(&fx, &session).await;

    assert_eq!(tool_results(&events), vec![("Tool not found: nope".to_string(), true)]);
    assert_eq!(events.last().unwrap().kind(), "done");
}

#[tokio::test]
async fn malformed_arguments_keep_call_paired() {
    let fx = fixture(vec![
        ScriptedReply::RawToolCall {
            name: "echo".into(),
            arguments: "{not json".into(),
        },
        text("retrying"),
    ]);
    let session = session_with("go");

    let events = run(&fx, &session).await;

    let results = tool_results(&events);
    assert_eq!(results.len(), 1);
    assert!(results[0].1);
    assert!(results[0].0.contains("invalid arguments for tool echo"));

    let requests = fx.provider.requests().await;
    let second = &requests[1].messages;
    let tool = second.iter().find(|m| m.role == Role::Tool).unwrap();
    let assistant = second.iter().find(|m| !m.calls().is_empty()).unwrap();
    assert_eq!(tool.tool_call_id.as_deref(), Some(assistant.calls()[0].id.as_str()));
}

#[tokio::test]
async fn cost_comes_from_pricing() {
    let provider = ScriptedProvider::new(vec![text("ok")]).with_pricing(Pricing {
        input_per_mtok: 100_000.0,
        output_per_mtok: 200_000.0,
        ..Default::default()
    });
    let graph = AgentGraph::new(vec![Agent::new("root", Arc::new(provider))]).unwrap();
    let runtime = Runtime::new(Arc::new(graph), RuntimeConfig::default());
    let session = session_with("hi");

    let events = runtime.run(session.clone(), CancellationToken::new()).await.unwrap();

    match events.last().unwrap() {
        Event::Done { cost, .. } => assert_eq!(*cost, 2.0),
        other => panic!("expected done, got {:?}", other),
    }
    assert_eq!(session.read().await.cost, 2.0);
}

#[tokio::test]
async fn max_iterations_ends_as_done() {
    let config = RuntimeConfig {
        max_iterations: 2,
        ..RuntimeConfig::default()
    };
    let fx = fixture_with(
        vec![
            call("echo", json!({"text": "1"})),
            call("echo", json!({"text": "2"})),
            call("echo", json!({"text": "3"})),
        ],
        config,
    );
    let session = session_with("loop");

    let events = run(&fx, &session).await;

    assert_eq!(tool_results(&events).len(), 2);
    match events.last().unwrap() {
        Event::Done { stop_reason, .. } => assert_eq!(stop_reason, "max_iterations"),
        other => panic!("expected done, got {:?}", other),
    }
    assert_eq!(fx.provider.remaining().await, 1);
}

// ===========================================================================
// Failures and cancellation
// ===========================================================================

#[tokio::test]
async fn provider_error_emits_single_error() {
    let fx = fixture(vec![ScriptedReply::Error("upstream down".into())]);
    let session = session_with("hi");

    let events = run(&fx, &session).await;

    assert_eq!(kinds(&events), vec!["error"]);
    match &events[0] {
        Event::Error { message } => assert!(message.contains("upstream down")),
        other => panic!("expected error, got {:?}", other),
    }
}

#[tokio::test]
async fn stream_failure_keeps_partial_events() {
    let fx = fixture(vec![ScriptedReply::FailAfter {
        text: "partial".into(),
        error: "connection reset".into(),
    }]);
    let session = session_with("hi");

    let events = run(&fx, &session).await;

    assert_eq!(kinds(&events), vec!["token_delta", "error"]);
    assert_eq!(streamed_text(&events), "partial");
    assert_eq!(events.iter().filter(|e| e.kind() == "error").count(), 1);
}

#[tokio::test]
async fn cancellation_emits_cancelled() {
    let fx = fixture(vec![ScriptedReply::Hang]);
    let session = session_with("hi");
    let cancel = CancellationToken::new();

    let mut stream = fx.runtime.run_stream(session.clone(), cancel.clone()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();

    let mut events = Vec::new();
    while let Some(event) = tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .unwrap()
    {
        events.push(event);
    }
    assert_eq!(kinds(&events), vec!["cancelled"]);
}

// ===========================================================================
// Elicitation
// ===========================================================================

#[tokio::test]
async fn approval_required_tool_suspends_and_accept_resumes() {
    let fx = fixture(vec![call("touch", json!({})), text("all done")]);
    let session = session_with("touch it");

    let events = run(&fx, &session).await;
    assert_eq!(kinds(&events), vec!["tool_call_started", "elicitation_request"]);
    assert_eq!(fx.tools.touches.load(Ordering::SeqCst), 0);
    assert!(session.read().await.pending.is_some());

    let err = fx
        .runtime
        .run_stream(session.clone(), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidRequest(_)));

    let events = resume(&fx, &session, ResumeElicitationRequest::accept()).await;
    assert_eq!(kinds(&events), vec!["tool_call_result", "token_delta", "done"]);
    assert_eq!(tool_results(&events), vec![("touched".to_string(), false)]);
    assert_eq!(fx.tools.touches.load(Ordering::SeqCst), 1);

    let s = session.read().await;
    assert!(s.pending.is_none());
    assert!(!s.tools_approved);
}

#[tokio::test]
async fn decline_records_declined_result() {
    let fx = fixture(vec![call("touch", json!({})), text("ok, skipped")]);
    let session = session_with("touch it");
    run(&fx, &session).await;

    let events = resume(&fx, &session, ResumeElicitationRequest::decline()).await;

    let results = tool_results(&events);
    assert_eq!(results.len(), 1);
    assert!(results[0].0.contains("declined"));
    assert!(results[0].1);
    assert_eq!(events.last().unwrap().kind(), "done");
    assert_eq!(fx.tools.touches.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn cancel_records_every_outstanding_call() {
    let fx = fixture(vec![ScriptedReply::ToolCalls(vec![
        ("touch".into(), json!({})),
        ("echo".into(), json!({"text": "later"})),
    ])]);
    let session = session_with("touch and echo");
    run(&fx, &session).await;

    let events = resume(&fx, &session, ResumeElicitationRequest::cancel()).await;

    assert_eq!(
        kinds(&events),
        vec!["tool_call_result", "tool_call_result", "cancelled"]
    );
    assert!(tool_results(&events).iter().all(|(c, err)| c.contains("cancelled") && *err));
    assert!(session.read().await.pending.is_none());
}

#[tokio::test]
async fn approve_session_skips_later_prompts() {
    let fx = fixture(vec![
        call("touch", json!({})),
        call("touch", json!({})),
        text("touched twice"),
    ]);
    let session = session_with("touch twice");
    run(&fx, &session).await;

    let events = resume(&fx, &session, ResumeElicitationRequest::accept_for_session()).await;

    assert!(events.iter().all(|e| e.kind() != "elicitation_request"));
    assert_eq!(events.last().unwrap().kind(), "done");
    assert_eq!(fx.tools.touches.load(Ordering::SeqCst), 2);
    assert!(session.read().await.tools_approved);
}

#[tokio::test]
async fn approved_session_never_asks() {
    let fx = fixture(vec![call("touch", json!({})), text("done")]);
    let session = Session::new().with_tools_approved(true);
    let session = session.into_shared();
    session.write().await.add_user_message("touch");

    let events = run(&fx, &session).await;

    assert_eq!(tool_results(&events), vec![("touched".to_string(), false)]);
}

#[tokio::test]
async fn denied_tool_is_not_run() {
    let fx = fixture(vec![call("touch", json!({})), text("ok")]);
    let mut session = Session::new().with_permissions(PermissionsConfig {
        allow: vec![],
        deny: vec!["touch".into()],
    });
    session.add_user_message("touch");
    let session = session.into_shared();

    let events = run(&fx, &session).await;

    let results = tool_results(&events);
    assert!(results[0].0.contains("denied"));
    assert!(results[0].1);
    assert_eq!(fx.tools.touches.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn resume_without_pending_is_rejected() {
    let fx = fixture(vec![]);
    let session = session_with("hi");
    let err = fx
        .runtime
        .resume_stream(session, ResumeElicitationRequest::accept(), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NoPendingElicitation(_)));
    assert!(err.is_client_error());
}

// ===========================================================================
// Handoff
// ===========================================================================

fn team(root_replies: Vec<ScriptedReply>, librarian_replies: Vec<ScriptedReply>) -> (Runtime, ScriptedProvider) {
    let librarian_model = ScriptedProvider::new(librarian_replies);
    let graph = AgentGraph::new(vec![
        Agent::new("root", Arc::new(ScriptedProvider::new(root_replies))).with_sub_agents(["librarian"]),
        Agent::new("librarian", Arc::new(librarian_model.clone())).with_description("Finds books"),
    ])
    .unwrap();
    (Runtime::new(Arc::new(graph), RuntimeConfig::default()), librarian_model)
}

#[tokio::test]
async fn transfer_task_switches_agent() {
    let (runtime, librarian) = team(
        vec![call("transfer_task", json!({"agent": "librarian", "task": "find Dune"}))],
        vec![text("Dune is on shelf 3")],
    );
    let session = session_with("where is Dune?");

    let events = runtime.run(session.clone(), CancellationToken::new()).await.unwrap();

    assert_eq!(
        kinds(&events),
        vec!["tool_call_started", "tool_call_result", "agent_switched", "token_delta", "done"]
    );
    assert!(events.contains(&Event::AgentSwitched {
        from: "root".into(),
        to: "librarian".into(),
    }));
    match events.last().unwrap() {
        Event::Done { agent, .. } => assert_eq!(agent, "librarian"),
        other => panic!("expected done, got {:?}", other),
    }
    assert_eq!(session.read().await.active_agent.as_deref(), Some("librarian"));

    let request = &librarian.requests().await[0];
    assert!(request.messages.iter().any(|m| m.content == "Task from root: find Dune"));
    assert!(request
        .messages
        .iter()
        .all(|m| m.tool_calls.is_none() && m.tool_call_id.is_none()));
    assert!(request
        .messages
        .iter()
        .any(|m| m.content.starts_with("For context: [root] called tool `transfer_task`")));
}

#[tokio::test]
async fn transfer_to_unknown_agent_is_an_error_result() {
    let (runtime, librarian) = team(
        vec![
            call("transfer_task", json!({"agent": "archivist", "task": "x"})),
            text("I'll handle it myself"),
        ],
        vec![],
    );
    let session = session_with("help");

    let events = runtime.run(session.clone(), CancellationToken::new()).await.unwrap();

    let results = tool_results(&events);
    assert!(results[0].1);
    assert!(results[0].0.contains("not a valid handoff target"));
    assert!(events.iter().all(|e| e.kind() != "agent_switched"));
    match events.last().unwrap() {
        Event::Done { agent, .. } => assert_eq!(agent, "root"),
        other => panic!("expected done, got {:?}", other),
    }
    assert!(librarian.requests().await.is_empty());
}

#[tokio::test]
async fn root_offers_transfer_task_tool() {
    let root_model = ScriptedProvider::new(vec![text("hi")]);
    let graph = AgentGraph::new(vec![
        Agent::new("root", Arc::new(root_model.clone())).with_sub_agents(["librarian"]),
        Agent::new("librarian", Arc::new(ScriptedProvider::new(vec![]))),
    ])
    .unwrap();
    let runtime = Runtime::new(Arc::new(graph), RuntimeConfig::default());
    runtime.run(session_with("hi"), CancellationToken::new()).await.unwrap();

    let tools = root_model.requests().await[0].tools.clone().unwrap();
    let transfer = tools.iter().find(|t| t.name == TRANSFER_TASK).unwrap();
    assert_eq!(transfer.input_schema["properties"]["agent"]["enum"], json!(["librarian"]));
}

// ===========================================================================
// Compaction
// ===========================================================================

#[tokio::test]
async fn compaction_appends_summary_before_done() {
    let config = RuntimeConfig {
        compaction: CompactionConfig {
            enabled: true,
            threshold_tokens: 1,
        },
        ..RuntimeConfig::default()
    };
    let fx = fixture_with(vec![text("the answer"), text("user asked, agent answered")], config);
    let session = session_with("the question");

    let events = run(&fx, &session).await;

    assert_eq!(kinds(&events), vec!["token_delta", "session_compacted", "done"]);
    let s = session.read().await;
    assert_eq!(s.items_since_summary().0, Some("user asked, agent answered"));
    assert_eq!(s.message_count(), 2, "stored messages are kept");

    let requests = fx.provider.requests().await;
    let transcript = &requests[1].messages[1].content;
    assert!(transcript.contains("User: the question"));
    assert!(transcript.contains("Assistant: the answer"));
}

#[tokio::test]
async fn summarize_on_demand() {
    let fx = fixture(vec![text("short summary")]);
    let session = session_with("something worth remembering");

    let summary = fx
        .runtime
        .summarize(&session, "root", CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.as_deref(), Some("short summary"));
    let graph = fx.runtime.graph().clone();
    let view = session.read().await.get_messages(graph.root(), &graph);
    assert!(view.iter().any(|m| m.content == "Session Summary: short summary"));
    assert!(view.iter().all(|m| m.content != "something worth remembering"));
}

#[tokio::test]
async fn summarize_empty_session_is_none() {
    let fx = fixture(vec![]);
    let session = Session::new().into_shared();
    let summary = fx
        .runtime
        .summarize(&session, "root", CancellationToken::new())
        .await
        .unwrap();
    assert!(summary.is_none());
    assert!(fx.provider.requests().await.is_empty());
}

// ===========================================================================
// Suggestions
// ===========================================================================

fn with_suggestions() -> RuntimeConfig {
    RuntimeConfig {
        suggestions: SuggestionsConfig {
            enabled: true,
            ..SuggestionsConfig::default()
        },
        ..RuntimeConfig::default()
    }
}

#[tokio::test]
async fn suggestions_arrive_before_done() {
    let fx = fixture_with(
        vec![
            text("Rust is a systems language."),
            text("Sure:\n```json\n[\"Show an example\", \"\", \"Compare with C++\", \"Explain ownership\", \"More\"]\n```"),
        ],
        with_suggestions(),
    );
    let session = session_with("what is rust?");

    let events = run(&fx, &session).await;

    assert_eq!(kinds(&events), vec!["token_delta", "follow_up_suggestions", "done"]);
    match &events[events.len() - 2] {
        Event::FollowUpSuggestions { agent, suggestions } => {
            assert_eq!(agent, "root");
            assert_eq!(suggestions, &["Show an example", "Compare with C++", "Explain ownership"]);
        }
        other => panic!("expected suggestions, got {:?}", other),
    }

    let requests = fx.provider.requests().await;
    assert_eq!(requests[1].max_tokens, Some(300));
    assert!(requests[1].tools.is_none());
    let prompt = &requests[1].messages.last().unwrap().content;
    assert!(prompt.contains("Last user message: what is rust?"));
    assert!(prompt.contains("Last assistant response: Rust is a systems language."));

    // Nested run does not touch the parent session
    assert_eq!(session.read().await.message_count(), 2);
}

#[tokio::test]
async fn done_waits_for_slow_suggestions() {
    let fx = fixture_with(
        vec![
            text("answer"),
            ScriptedReply::Delayed {
                delay: Duration::from_millis(200),
                text: "[\"next\"]".into(),
            },
        ],
        with_suggestions(),
    );
    let session = session_with("question");

    let started = std::time::Instant::now();
    let events = run(&fx, &session).await;

    assert!(started.elapsed() >= Duration::from_millis(200));
    assert_eq!(kinds(&events), vec!["token_delta", "follow_up_suggestions", "done"]);
}

#[tokio::test]
async fn suggestion_failures_are_swallowed() {
    let fx = fixture_with(
        vec![text("answer"), ScriptedReply::Error("overloaded".into())],
        with_suggestions(),
    );
    let session = session_with("question");

    let events = run(&fx, &session).await;

    assert_eq!(kinds(&events), vec!["token_delta", "done"]);
}

#[tokio::test]
async fn suggestions_time_out() {
    let mut config = with_suggestions();
    config.suggestions.timeout = Duration::from_millis(50);
    let fx = fixture_with(
        vec![
            text("answer"),
            ScriptedReply::Delayed {
                delay: Duration::from_secs(10),
                text: "[\"late\"]".into(),
            },
        ],
        config,
    );
    let session = session_with("question");

    let events = tokio::time::timeout(Duration::from_secs(5), run(&fx, &session))
        .await
        .unwrap();

    assert_eq!(kinds(&events), vec!["token_delta", "done"]);
}

#[tokio::test]
async fn suggestions_skip_without_assistant_text() {
    let model = Arc::new(ScriptedProvider::new(vec![]));
    let out = troupe_agent::suggestions::generate(
        model,
        "question",
        "",
        &SuggestionsConfig::default(),
        CancellationToken::new(),
    )
    .await;
    assert!(out.is_empty());
}

// ===========================================================================
// Lifecycle
// ===========================================================================

#[tokio::test]
async fn shutdown_stops_toolsets() {
    let fx = fixture(vec![text("bye")]);
    run(&fx, &session_with("hi")).await;

    fx.runtime.shutdown().await;

    assert!(fx.tools.stopped.load(Ordering::SeqCst));
}

#[tokio::test]
async fn wait_background_returns_after_runs() {
    let fx = fixture(vec![text("one"), text("two")]);
    let _first = fx.runtime.run_stream(session_with("a"), CancellationToken::new()).await.unwrap();
    let _second = fx.runtime.run_stream(session_with("b"), CancellationToken::new()).await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), fx.runtime.wait_background())
        .await
        .unwrap();

    // Tracker is usable again afterwards
    let events = run(&fx, &session_with("c")).await;
    assert_eq!(events.last().unwrap().kind(), "done");
}

// ===========================================================================
// SessionManager
// ===========================================================================

#[tokio::test]
async fn manager_runs_and_persists() {
    let fx = fixture(vec![text("stored reply")]);
    let store = Arc::new(InMemorySessionStore::new());
    let manager = SessionManager::new(fx.runtime.clone(), store.clone());
    let id = manager.create_session(Session::new()).await.unwrap();

    let events: Vec<Event> = manager
        .run_session(&id, Some("hello".into()), CancellationToken::new())
        .await
        .unwrap()
        .collect()
        .await;

    assert_eq!(events.last().unwrap().kind(), "done");
    let stored = store.get(&id).await.unwrap();
    assert_eq!(stored.message_count(), 2);
    assert_eq!(stored.last_assistant_message_content(), "stored reply");
    assert!(!manager.is_running(&id));
}

#[tokio::test]
async fn manager_rejects_concurrent_runs() {
    let fx = fixture(vec![ScriptedReply::Hang]);
    let manager = SessionManager::new(fx.runtime.clone(), Arc::new(InMemorySessionStore::new()));
    let id = manager.create_session(Session::new()).await.unwrap();
    let cancel = CancellationToken::new();

    let first = manager
        .run_session(&id, Some("wait".into()), cancel.clone())
        .await
        .unwrap();
    let err = manager
        .run_session(&id, Some("again".into()), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::SessionBusy(_)));

    cancel.cancel();
    let events: Vec<Event> = first.collect().await;
    assert_eq!(events.last().unwrap().kind(), "cancelled");
    assert!(!manager.is_running(&id));
}

#[tokio::test]
async fn manager_unknown_session() {
    let fx = fixture(vec![]);
    let manager = SessionManager::new(fx.runtime.clone(), Arc::new(InMemorySessionStore::new()));
    let err = manager
        .run_session("missing", None, CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::SessionNotFound(_)));
    assert!(!manager.is_running("missing"));
}

#[tokio::test]
async fn manager_resumes_elicitation_by_id() {
    let fx = fixture(vec![call("touch", json!({})), text("done touching")]);
    let store = Arc::new(InMemorySessionStore::new());
    let manager = SessionManager::new(fx.runtime.clone(), store.clone());
    let id = manager.create_session(Session::new()).await.unwrap();

    let events: Vec<Event> = manager
        .run_session(&id, Some("touch".into()), CancellationToken::new())
        .await
        .unwrap()
        .collect()
        .await;
    assert_eq!(events.last().unwrap().kind(), "elicitation_request");
    assert!(store.get(&id).await.unwrap().pending.is_some());

    let events: Vec<Event> = manager
        .resume_elicitation(&id, ResumeElicitationRequest::accept(), CancellationToken::new())
        .await
        .unwrap()
        .collect()
        .await;
    assert_eq!(events.last().unwrap().kind(), "done");
    assert!(store.get(&id).await.unwrap().pending.is_none());
    assert_eq!(fx.tools.touches.load(Ordering::SeqCst), 1);
}

// ===========================================================================
// Shell tool end to end
// ===========================================================================

#[cfg(unix)]
#[tokio::test]
async fn shell_tool_through_runtime() {
    use troupe_tools::{ShellConfig, ShellToolSet};

    let dir = tempfile::tempdir().unwrap();
    let mut config = ShellConfig::new(dir.path());
    config.shell = vec!["/bin/sh".into(), "-c".into()];
    let provider = ScriptedProvider::new(vec![
        call("shell", json!({"cmd": "echo from-shell", "cwd": "."})),
        text("ran it"),
    ]);
    let graph = AgentGraph::new(vec![Agent::new("root", Arc::new(provider))
        .with_toolset(Arc::new(ShellToolSet::new(config)))])
    .unwrap();
    let runtime = Runtime::new(Arc::new(graph), RuntimeConfig::default());
    let mut session = Session::new().with_tools_approved(true);
    session.add_user_message("run echo");

    let events = runtime.run(session.into_shared(), CancellationToken::new()).await.unwrap();

    let results = tool_results(&events);
    assert_eq!(results.len(), 1);
    assert!(results[0].0.contains("from-shell"));
    assert!(!results[0].1);
    runtime.shutdown().await;
}
