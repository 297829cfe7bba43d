//! End-to-end engine tests driven by the scripted mock provider: plan /
//! approval / rejection flows, stop, delegation fallback, path confinement,
//! and auto-compaction.

use isocode_agent::{AgentRuntime, SessionKey, TurnRequest};
use isocode_core::{
    AgentEvent, Decision, Directive, Message, Mode, Role, RuntimeConfig,
};
use isocode_llm::{LlmProvider, MockProvider};
use isocode_tools::{create_default_registry, FileIndexCache, ToolServerPool};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

fn test_workspace() -> PathBuf {
    let id = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("isocode-agent-test-{}-{}", std::process::id(), id));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn cleanup(dir: &Path) {
    let _ = std::fs::remove_dir_all(dir);
}

fn build_runtime(mock: Arc<MockProvider>, config: RuntimeConfig) -> AgentRuntime {
    let provider: Arc<dyn LlmProvider> = mock;
    let index_cache = Arc::new(FileIndexCache::new());
    let registry = create_default_registry(
        provider.clone(),
        None,
        index_cache.clone(),
        Arc::new(ToolServerPool::new()),
    );
    AgentRuntime::new(
        provider,
        Arc::new(registry),
        index_cache,
        Arc::new(RwLock::new(config)),
    )
}

fn agent_request(session_id: &str, message: &str, mode: Mode, ws: &Path) -> TurnRequest {
    TurnRequest {
        session_id: session_id.to_string(),
        message: message.to_string(),
        mode,
        model: Some("mock-model".to_string()),
        workspace_root: ws.to_path_buf(),
        context: Vec::new(),
        max_steps: 50,
        disable_delegation: false,
    }
}

async fn run_and_collect(runtime: &AgentRuntime, request: TurnRequest) -> Vec<AgentEvent> {
    let (tx, mut rx) = mpsc::channel(256);
    runtime.run_turn(request, tx).await;
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    events
}

fn event_types(events: &[AgentEvent]) -> Vec<String> {
    events
        .iter()
        .map(|e| {
            serde_json::to_value(e).unwrap()["type"]
                .as_str()
                .unwrap()
                .to_string()
        })
        .collect()
}

fn push_directive(mock: &MockProvider, directive: serde_json::Value) {
    mock.push_text(directive.to_string());
}

// ===========================================================================
// Scenario: plan -> act -> edit -> approve -> continue
// ===========================================================================

#[tokio::test]
async fn plan_act_approve_continue() {
    let ws = test_workspace();
    std::fs::create_dir_all(ws.join("src")).unwrap();
    std::fs::write(ws.join("src/a.ts"), "function foo() {}\n").unwrap();

    let mock = Arc::new(MockProvider::new());
    push_directive(&mock, json!({"type": "thought", "content": "PLAN:\n1. Rename foo to bar in src/a.ts"}));
    push_directive(&mock, json!({"type": "action", "tool": "read_file", "args": {"path": "src/a.ts"}}));
    push_directive(&mock, json!({"type": "action", "tool": "write_file", "args": {"path": "src/a.ts", "content": "function bar() {}\n"}}));
    let runtime = build_runtime(mock.clone(), RuntimeConfig::default());

    let events = run_and_collect(
        &runtime,
        agent_request("s-approve", "rename foo to bar in src/a.ts", Mode::Agent, &ws),
    )
    .await;

    assert_eq!(
        event_types(&events),
        vec!["thought", "action", "observation", "diff_request"]
    );
    match &events[3] {
        AgentEvent::DiffRequest {
            file_path,
            diff,
            session_id,
        } => {
            assert_eq!(file_path, "src/a.ts");
            assert!(diff.contains("-function foo() {}"));
            assert!(diff.contains("+function bar() {}"));
            assert_eq!(session_id, "s-approve");
        }
        other => panic!("expected diff_request, got {:?}", other),
    }

    // The session is waiting and the file is untouched.
    let session = runtime
        .sessions()
        .get(&SessionKey::new("s-approve"))
        .expect("session retained while awaiting approval");
    assert!(session.state.lock().await.pending_diff.is_some());
    assert_eq!(
        std::fs::read_to_string(ws.join("src/a.ts")).unwrap(),
        "function foo() {}\n"
    );

    // Approve: the stored diff is applied and the loop continues to final.
    push_directive(&mock, json!({"type": "thought", "content": "PROGRESS: Completed task 1"}));
    push_directive(&mock, json!({"type": "final", "content": "Renamed foo to bar."}));

    let (tx, mut rx) = mpsc::channel(256);
    runtime
        .resume_with_decision("s-approve", Decision::Approve, tx, 50)
        .await
        .unwrap();
    let mut continuation = Vec::new();
    while let Some(event) = rx.recv().await {
        continuation.push(event);
    }

    assert_eq!(event_types(&continuation), vec!["observation", "thought", "final"]);
    match &continuation[0] {
        AgentEvent::Observation { content } => assert!(content.starts_with("User APPROVED.")),
        other => panic!("expected observation, got {:?}", other),
    }
    assert_eq!(
        std::fs::read_to_string(ws.join("src/a.ts")).unwrap(),
        "function bar() {}\n"
    );

    // Terminal final removes the session and persists everything.
    assert!(runtime.sessions().get(&SessionKey::new("s-approve")).is_none());
    assert!(ws.join(".isocode/conversations/s-approve.json").exists());
    assert!(ws.join(".isocode/checkpoints/s-approve.md").exists());
    assert!(ws.join(".isocode/memory/s-approve.json").exists());
    assert!(ws.join(".isocode/project-context.json").exists());
    cleanup(&ws);
}

// ===========================================================================
// Scenario: reject and retry
// ===========================================================================

#[tokio::test]
async fn reject_then_new_diff_request() {
    let ws = test_workspace();
    std::fs::write(ws.join("f.txt"), "original\n").unwrap();

    let mock = Arc::new(MockProvider::new());
    push_directive(&mock, json!({"type": "action", "tool": "write_file", "args": {"path": "f.txt", "content": "first attempt\n"}}));
    let runtime = build_runtime(mock.clone(), RuntimeConfig::default());

    let events = run_and_collect(
        &runtime,
        agent_request("s-reject", "change f.txt", Mode::Agent, &ws),
    )
    .await;
    let first_diff = match events.last() {
        Some(AgentEvent::DiffRequest { diff, .. }) => diff.clone(),
        other => panic!("expected diff_request, got {:?}", other),
    };

    push_directive(&mock, json!({"type": "action", "tool": "write_file", "args": {"path": "f.txt", "content": "second attempt\n"}}));

    let (tx, mut rx) = mpsc::channel(256);
    runtime
        .resume_with_decision("s-reject", Decision::Reject, tx, 50)
        .await
        .unwrap();
    let mut continuation = Vec::new();
    while let Some(event) = rx.recv().await {
        continuation.push(event);
    }

    assert_eq!(event_types(&continuation), vec!["observation", "diff_request"]);
    match &continuation[0] {
        AgentEvent::Observation { content } => assert!(content.contains("User REJECTED")),
        other => panic!("expected observation, got {:?}", other),
    }
    let second_diff = match &continuation[1] {
        AgentEvent::DiffRequest { diff, .. } => diff.clone(),
        other => panic!("expected diff_request, got {:?}", other),
    };
    assert_ne!(first_diff, second_diff);

    // No file I/O happened on reject; exactly one diff is pending.
    assert_eq!(std::fs::read_to_string(ws.join("f.txt")).unwrap(), "original\n");
    let session = runtime.sessions().get(&SessionKey::new("s-reject")).unwrap();
    let state = session.state.lock().await;
    assert!(state.pending_diff.is_some());
    assert!(state.pending_diff.as_ref().unwrap().diff.contains("second attempt"));
    cleanup(&ws);
}

#[tokio::test]
async fn approve_without_pending_diff_fails_fast() {
    let ws = test_workspace();
    let mock = Arc::new(MockProvider::new());
    push_directive(&mock, json!({"type": "action", "tool": "write_file", "args": {"path": "x.txt", "content": "x"}}));
    let runtime = build_runtime(mock.clone(), RuntimeConfig::default());
    run_and_collect(&runtime, agent_request("s-nodiff", "go", Mode::Agent, &ws)).await;

    // Consume the pending diff with a reject first.
    push_directive(&mock, json!({"type": "final", "content": "ok"}));
    let (tx, _rx) = mpsc::channel(256);
    runtime
        .resume_with_decision("s-nodiff", Decision::Reject, tx, 50)
        .await
        .unwrap();

    // Session is gone after the final; approving again cannot find it.
    let (tx, _rx) = mpsc::channel(256);
    let err = runtime
        .resume_with_decision("s-nodiff", Decision::Approve, tx, 50)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("session not found"));
    cleanup(&ws);
}

#[tokio::test]
async fn decision_on_session_without_diff_is_rejected() {
    let ws = test_workspace();
    let mock = Arc::new(MockProvider::new());
    let runtime = build_runtime(mock.clone(), RuntimeConfig::default());

    // An active session with no pending diff: seed one directly.
    let (session, _) = runtime.sessions().open_or_get(
        &SessionKey::new("s-active"),
        Mode::Agent,
        ws.clone(),
        Some("mock-model".into()),
    );
    session.state.lock().await.messages.push(Message::system("sys"));

    let (tx, _rx) = mpsc::channel(256);
    let err = runtime
        .resume_with_decision("s-active", Decision::Approve, tx, 50)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("no pending diff"));
    cleanup(&ws);
}

// ===========================================================================
// Scenario: stop mid-run
// ===========================================================================

#[tokio::test]
async fn stop_during_tool_execution() {
    let ws = test_workspace();
    let mock = Arc::new(MockProvider::new());
    push_directive(&mock, json!({"type": "thought", "content": "PLAN:\n1. wait\n2. more"}));
    push_directive(&mock, json!({"type": "action", "tool": "run_command", "args": {"command": "sleep 2"}}));
    // Would continue if not stopped:
    push_directive(&mock, json!({"type": "action", "tool": "list_files", "args": {}}));
    let runtime = Arc::new(build_runtime(mock.clone(), RuntimeConfig::default()));

    let (tx, mut rx) = mpsc::channel(256);
    let run = {
        let runtime = runtime.clone();
        let request = agent_request("s-stop", "do slow work", Mode::AgentPlus, &ws);
        tokio::spawn(async move { runtime.run_turn(request, tx).await })
    };

    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        let is_action = matches!(event, AgentEvent::Action { .. });
        events.push(event);
        if is_action {
            // The 2s sleep is still running; the stop lands before the
            // next step boundary.
            runtime.stop("s-stop").unwrap();
        }
    }
    run.await.unwrap();

    let types = event_types(&events);
    let action_count = types.iter().filter(|t| *t == "action").count();
    assert_eq!(action_count, 1, "no action may follow the stop: {:?}", types);
    match events.last() {
        Some(AgentEvent::Final { content }) => assert_eq!(content, "Agent stopped by user."),
        other => panic!("expected final, got {:?}", other),
    }
    assert!(runtime.sessions().get(&SessionKey::new("s-stop")).is_none());
    cleanup(&ws);
}

#[tokio::test]
async fn stop_on_missing_session_errors() {
    let ws = test_workspace();
    let runtime = build_runtime(Arc::new(MockProvider::new()), RuntimeConfig::default());
    assert!(runtime.stop("nope").is_err());
    cleanup(&ws);
}

// ===========================================================================
// Scenario: delegation with model fallback
// ===========================================================================

#[tokio::test]
async fn delegation_falls_back_to_second_model() {
    let ws = test_workspace();
    let mock = Arc::new(MockProvider::new());
    mock.set_models(&["alpha", "beta"]);
    mock.fail_model("alpha", "connection refused");

    push_directive(&mock, json!({"type": "delegate", "tasks": ["summarise the readme", "count the lines"]}));
    // Sub-agent finals (popped by whichever worker calls first), then the
    // outer final.
    push_directive(&mock, json!({"type": "final", "content": "subtask done"}));
    push_directive(&mock, json!({"type": "final", "content": "subtask done"}));
    push_directive(&mock, json!({"type": "final", "content": "all subtasks finished"}));

    let runtime = build_runtime(mock.clone(), RuntimeConfig::default());
    let events = run_and_collect(
        &runtime,
        agent_request("s-swarm", "do two things", Mode::AgentPlus, &ws),
    )
    .await;

    let observation = events
        .iter()
        .find_map(|e| match e {
            AgentEvent::Observation { content } => Some(content.clone()),
            _ => None,
        })
        .expect("delegation observation");
    let parsed: serde_json::Value = serde_json::from_str(&observation).unwrap();
    assert_eq!(parsed["swarm"], true);
    assert_eq!(parsed["results"], 2);
    let aggregated = parsed["content"].as_str().unwrap();
    assert!(aggregated.contains("[Subtask 1] subtask done"));
    assert!(aggregated.contains("[Subtask 2] subtask done"));

    // Both workers exhausted alpha's retries before succeeding on beta.
    let calls = mock.called_models();
    assert_eq!(calls.iter().filter(|m| *m == "alpha").count(), 6);
    assert_eq!(calls.iter().filter(|m| *m == "beta").count(), 2);

    match events.last() {
        Some(AgentEvent::Final { content }) => assert_eq!(content, "all subtasks finished"),
        other => panic!("expected final, got {:?}", other),
    }
    cleanup(&ws);
}

#[tokio::test]
async fn fatal_worker_error_disables_delegation() {
    let ws = test_workspace();
    let mock = Arc::new(MockProvider::new());
    mock.set_models(&["alpha"]);
    mock.fail_model("alpha", "ECONNRESET while reading body");

    push_directive(&mock, json!({"type": "delegate", "tasks": ["one task"]}));
    push_directive(&mock, json!({"type": "final", "content": "continuing alone"}));

    let runtime = build_runtime(mock.clone(), RuntimeConfig::default());
    let events = run_and_collect(
        &runtime,
        agent_request("s-fatal", "delegate something", Mode::AgentPlus, &ws),
    )
    .await;

    // No swarm observation; the run continues single-agent to final.
    assert!(!events.iter().any(|e| matches!(e, AgentEvent::Observation { content } if content.contains("swarm"))));
    match events.last() {
        Some(AgentEvent::Final { content }) => assert_eq!(content, "continuing alone"),
        other => panic!("expected final, got {:?}", other),
    }

    let record = isocode_agent::store::load_conversation(&ws, "s-fatal").unwrap();
    assert!(record
        .messages
        .iter()
        .any(|m| m.content.contains("Delegation failed")));
    cleanup(&ws);
}

#[tokio::test]
async fn delegate_in_agent_mode_falls_through_to_nudge() {
    let ws = test_workspace();
    let mock = Arc::new(MockProvider::new());
    push_directive(&mock, json!({"type": "delegate", "tasks": ["not allowed here"]}));
    push_directive(&mock, json!({"type": "final", "content": "done without delegation"}));

    let runtime = build_runtime(mock.clone(), RuntimeConfig::default());
    let events = run_and_collect(
        &runtime,
        agent_request("s-nodelegate", "try to delegate", Mode::Agent, &ws),
    )
    .await;

    assert!(events
        .iter()
        .all(|e| !matches!(e, AgentEvent::Observation { content } if content.contains("swarm"))));

    let record = isocode_agent::store::load_conversation(&ws, "s-nodelegate").unwrap();
    assert!(record
        .messages
        .iter()
        .any(|m| m.role == Role::User && m.content.contains("not a valid directive")));
    cleanup(&ws);
}

// ===========================================================================
// Scenario: path confinement
// ===========================================================================

#[tokio::test]
async fn write_outside_workspace_is_blocked() {
    let ws = test_workspace();
    let mock = Arc::new(MockProvider::new());
    push_directive(&mock, json!({"type": "action", "tool": "write_file", "args": {"path": "../../etc/passwd", "content": "pwned"}}));
    push_directive(&mock, json!({"type": "final", "content": "could not write there"}));

    let runtime = build_runtime(mock.clone(), RuntimeConfig::default());
    let events = run_and_collect(
        &runtime,
        agent_request("s-escape", "overwrite passwd", Mode::AgentPlus, &ws),
    )
    .await;

    let observation = events
        .iter()
        .find_map(|e| match e {
            AgentEvent::Observation { content } => Some(content.clone()),
            _ => None,
        })
        .expect("error observation");
    assert!(observation.contains("escapes"));
    cleanup(&ws);
}

// ===========================================================================
// Scenario: auto-compaction
// ===========================================================================

#[tokio::test]
async fn auto_compaction_shrinks_conversation() {
    let ws = test_workspace();
    std::fs::write(ws.join("t.txt"), "seed\n").unwrap();

    let mock = Arc::new(MockProvider::new());
    mock.set_summary_text("earlier work summarised");
    // The step after compaction proposes an edit, which parks the session
    // so its state can be inspected.
    push_directive(&mock, json!({"type": "action", "tool": "write_file", "args": {"path": "t.txt", "content": "edited\n"}}));

    let config = RuntimeConfig {
        context_budget: 2_000,
        ..RuntimeConfig::default()
    };
    let runtime = build_runtime(mock.clone(), config);

    let key = SessionKey::new("s-compact");
    let (session, created) =
        runtime
            .sessions()
            .open_or_get(&key, Mode::Agent, ws.clone(), Some("mock-model".into()));
    assert!(created);
    {
        let mut state = session.state.lock().await;
        state.messages.push(Message::system("you are an agent"));
        for i in 0..10 {
            state
                .messages
                .push(Message::user(format!("message {} {}", i, "pad ".repeat(125))));
        }
    }
    let before = session.state.lock().await.messages.len();

    let events = run_and_collect(
        &runtime,
        agent_request("s-compact", "keep going", Mode::Agent, &ws),
    )
    .await;
    // Compaction itself emits no client-visible event.
    assert_eq!(event_types(&events), vec!["diff_request"]);

    let state = session.state.lock().await;
    assert_eq!(state.compactions, 1);
    assert!(state.messages.len() < before);
    assert!(state
        .messages
        .iter()
        .any(|m| m.content.contains("earlier work summarised")));
    assert_eq!(state.messages[0].role, Role::System);
    assert!(ws.join(".isocode/checkpoints/s-compact.md").exists());
    cleanup(&ws);
}

// ===========================================================================
// Plan gating, nudges, and transcript invariants
// ===========================================================================

#[tokio::test]
async fn premature_final_is_nudged_while_plan_open() {
    let ws = test_workspace();
    let mock = Arc::new(MockProvider::new());
    push_directive(&mock, json!({"type": "thought", "content": "PLAN:\n1. first\n2. second"}));
    push_directive(&mock, json!({"type": "final", "content": "done early"}));
    push_directive(&mock, json!({"type": "thought", "content": "PROGRESS: Completed task 1"}));
    push_directive(&mock, json!({"type": "thought", "content": "PROGRESS: Completed task 2"}));
    push_directive(&mock, json!({"type": "final", "content": "actually done"}));

    let runtime = build_runtime(mock.clone(), RuntimeConfig::default());
    let events = run_and_collect(
        &runtime,
        agent_request("s-gate", "two-step job", Mode::Agent, &ws),
    )
    .await;

    // The early final never reaches the client; only the real one does.
    let finals: Vec<&str> = events
        .iter()
        .filter_map(|e| match e {
            AgentEvent::Final { content } => Some(content.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(finals, vec!["actually done"]);

    let record = isocode_agent::store::load_conversation(&ws, "s-gate").unwrap();
    assert!(record
        .messages
        .iter()
        .any(|m| m.content.contains("0/2 planned tasks")));
    cleanup(&ws);
}

#[tokio::test]
async fn transcript_invariants_hold() {
    let ws = test_workspace();
    std::fs::write(ws.join("inv.txt"), "data\n").unwrap();
    let mock = Arc::new(MockProvider::new());
    push_directive(&mock, json!({"type": "thought", "content": "PLAN:\n1. read the file"}));
    push_directive(&mock, json!({"type": "action", "tool": "read_file", "args": {"path": "inv.txt"}}));
    push_directive(&mock, json!({"type": "thought", "content": "PROGRESS: Completed task 1"}));
    push_directive(&mock, json!({"type": "final", "content": "read it"}));

    let runtime = build_runtime(mock.clone(), RuntimeConfig::default());
    run_and_collect(&runtime, agent_request("s-inv", "read inv.txt", Mode::Agent, &ws)).await;

    let record = isocode_agent::store::load_conversation(&ws, "s-inv").unwrap();
    let messages = &record.messages;
    assert_eq!(messages[0].role, Role::System);
    assert_eq!(messages[1].role, Role::User);

    for (i, message) in messages.iter().enumerate() {
        // Assistant messages are valid directive JSON.
        if message.role == Role::Assistant {
            assert!(
                Directive::parse_strict(&message.content).is_some(),
                "assistant message {} is not a directive: {}",
                i,
                message.content
            );
        }
        // Tool messages immediately follow an action.
        if message.role == Role::Tool {
            let previous = &messages[i - 1];
            assert_eq!(previous.role, Role::Assistant);
            assert!(matches!(
                Directive::parse_strict(&previous.content),
                Some(Directive::Action { .. })
            ));
        }
    }
    cleanup(&ws);
}

#[tokio::test]
async fn unparsable_reply_gets_json_nudge() {
    let ws = test_workspace();
    let mock = Arc::new(MockProvider::new());
    mock.push_text("complete gibberish with no directive at all 7198");
    push_directive(&mock, json!({"type": "final", "content": "recovered"}));

    let runtime = build_runtime(mock.clone(), RuntimeConfig::default());
    let events = run_and_collect(
        &runtime,
        agent_request("s-salvage", "hello", Mode::Agent, &ws),
    )
    .await;
    match events.last() {
        Some(AgentEvent::Final { content }) => assert_eq!(content, "recovered"),
        other => panic!("expected final, got {:?}", other),
    }

    let record = isocode_agent::store::load_conversation(&ws, "s-salvage").unwrap();
    assert!(record
        .messages
        .iter()
        .any(|m| m.role == Role::User && m.content.contains("not a valid directive")));
    cleanup(&ws);
}

// ===========================================================================
// Session-manager operations
// ===========================================================================

#[tokio::test]
async fn switch_model_compacts_long_conversations() {
    let ws = test_workspace();
    let mock = Arc::new(MockProvider::new());
    mock.set_summary_text("history digest");
    let runtime = build_runtime(mock.clone(), RuntimeConfig::default());

    let key = SessionKey::new("s-switch");
    let (session, _) =
        runtime
            .sessions()
            .open_or_get(&key, Mode::Agent, ws.clone(), Some("old-model".into()));
    {
        let mut state = session.state.lock().await;
        state.messages.push(Message::system("sys"));
        for i in 0..8 {
            state.messages.push(Message::user(format!("msg {}", i)));
        }
        state.compactions = 2;
    }

    runtime.switch_model("s-switch", "new-model").await.unwrap();

    let state = session.state.lock().await;
    assert_eq!(state.model.as_deref(), Some("new-model"));
    assert_eq!(state.compactions, 0, "switch resets the compaction counter");
    assert!(state
        .messages
        .iter()
        .any(|m| m.content.contains("Model switched from old-model to new-model")));
    cleanup(&ws);
}

#[tokio::test]
async fn manual_compact_reports_counts() {
    let ws = test_workspace();
    let mock = Arc::new(MockProvider::new());
    mock.set_summary_text("squashed");
    let runtime = build_runtime(mock.clone(), RuntimeConfig::default());

    let key = SessionKey::new("s-manual");
    let (session, _) =
        runtime
            .sessions()
            .open_or_get(&key, Mode::Agent, ws.clone(), Some("mock-model".into()));
    {
        let mut state = session.state.lock().await;
        state.messages.push(Message::system("sys"));
        for i in 0..9 {
            state.messages.push(Message::user(format!("msg {}", i)));
        }
    }

    let (before, after) = runtime.compact_session("s-manual", None).await.unwrap();
    assert_eq!(before, 10);
    assert!(after < before);
    // system + summary + last four
    assert_eq!(after, 6);
    cleanup(&ws);
}
