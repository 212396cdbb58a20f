//! Integration tests for the SELECT → BUILD → EXECUTE → DETECT cycle.

use backlog_core::testing::{
    MemoryProgressLog, MockTracker, ScriptedAgent, TestHarness, fast_config,
};
use backlog_core::{EngineConfig, ErrorStrategy, ExecutionEngine};
use backlog_proto::{
    DiffSummary, EngineEvent, FailureAction, IterationStatus, OutputStream, StopReason,
    SwitchReason, Task, TaskStatus,
};
use std::sync::{Arc, Mutex};

const MARKER: &str = "<promise>COMPLETE</promise>";

type Events = Arc<Mutex<Vec<EngineEvent>>>;

fn capture(engine: &ExecutionEngine) -> Events {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    engine.on(move |event| sink.lock().unwrap().push(event.clone()));
    events
}

fn count(events: &Mutex<Vec<EngineEvent>>, topic: &str) -> usize {
    events
        .lock()
        .unwrap()
        .iter()
        .filter(|e| e.topic() == topic)
        .count()
}

fn config_with(strategy: ErrorStrategy, max_retries: u32) -> EngineConfig {
    let mut config = fast_config();
    config.error_handling.strategy = strategy;
    config.error_handling.max_retries = max_retries;
    config
}

async fn run(
    harness: &TestHarness,
    config: EngineConfig,
) -> (ExecutionEngine, StopReason, Events) {
    let engine = harness.engine(config);
    engine.initialize().await.unwrap();
    let events = capture(&engine);
    let reason = engine.start().await.unwrap();
    (engine, reason, events)
}

#[tokio::test]
async fn test_completes_backlog_in_tracker_order() {
    let harness = TestHarness::new(MockTracker::with_tasks(vec![
        Task::new("a", "First"),
        Task::new("b", "Second").depends_on("a"),
    ]))
    .with_agent(
        ScriptedAgent::new("claude")
            .then_complete(MARKER)
            .then_complete(MARKER),
    );

    let (engine, reason, events) = run(&harness, fast_config()).await;

    assert_eq!(reason, StopReason::Complete);
    let state = engine.state();
    assert_eq!(state.tasks_completed, 2);
    let order: Vec<&str> = state
        .iterations
        .iter()
        .map(|r| r.task.as_ref().unwrap().id.as_str())
        .collect();
    assert_eq!(order, vec!["a", "b"]);
    assert!(state.iterations.iter().all(|r| r.task_completed && r.promise_complete));
    assert_eq!(count(&events, "task:completed"), 2);
    assert_eq!(count(&events, "all:complete"), 1);
    assert_eq!(
        harness.tracker.calls_to("complete_task"),
        vec!["complete_task:a", "complete_task:b"]
    );
}

#[tokio::test]
async fn test_exit_zero_without_marker_leaves_task_incomplete() {
    let harness = TestHarness::new(MockTracker::with_tasks(vec![Task::new("a", "A")]))
        .with_agent(ScriptedAgent::new("claude").then_exit(0, "did some work", ""));
    let mut config = fast_config();
    config.max_iterations = 1;

    let (engine, reason, events) = run(&harness, config).await;

    assert_eq!(reason, StopReason::MaxIterations);
    let result = &engine.state().iterations[0];
    assert_eq!(result.status, IterationStatus::Completed);
    assert!(!result.promise_complete);
    assert!(!result.task_completed);
    assert!(harness.tracker.calls_to("complete_task").is_empty());
    assert_eq!(harness.tracker.task("a").unwrap().status, TaskStatus::InProgress);
    assert_eq!(count(&events, "iteration:completed"), 1);
}

#[tokio::test]
async fn test_marker_with_nonzero_exit_is_a_failure() {
    let harness = TestHarness::new(MockTracker::with_tasks(vec![Task::new("a", "A")]))
        .with_agent(ScriptedAgent::new("claude").then_exit(2, MARKER, "boom"));

    let (engine, reason, _events) = run(&harness, config_with(ErrorStrategy::Abort, 0)).await;

    assert_eq!(reason, StopReason::Error);
    let result = &engine.state().iterations[0];
    assert_eq!(result.status, IterationStatus::Failed);
    assert!(result.promise_complete);
    assert!(!result.task_completed);
    assert_eq!(result.error.as_deref(), Some("Agent exited with code 2"));
}

#[tokio::test]
async fn test_timeout_under_abort_stops_with_error() {
    let harness = TestHarness::new(MockTracker::with_tasks(vec![Task::new("a", "A")]))
        .with_agent(ScriptedAgent::new("claude").then_hang());
    let mut config = config_with(ErrorStrategy::Abort, 0);
    config.iteration_timeout_secs = 1;

    let (engine, reason, events) = run(&harness, config).await;

    assert_eq!(reason, StopReason::Error);
    let result = &engine.state().iterations[0];
    assert_eq!(result.status, IterationStatus::Timeout);
    assert!(result.agent_result.as_ref().unwrap().interrupted);

    let events = events.lock().unwrap();
    assert!(events.iter().any(|e| matches!(
        e,
        EngineEvent::IterationFailed {
            action: FailureAction::Abort,
            ..
        }
    )));
    assert!(matches!(
        events.last(),
        Some(EngineEvent::EngineStopped {
            reason: StopReason::Error,
            ..
        })
    ));
}

#[tokio::test]
async fn test_skip_strategy_moves_to_next_task() {
    let harness = TestHarness::new(MockTracker::with_tasks(vec![
        Task::new("bad", "Bad"),
        Task::new("good", "Good"),
    ]))
    .with_agent(
        ScriptedAgent::new("claude")
            .then_exit(1, "", "compile error")
            .then_complete(MARKER),
    );

    let (engine, reason, events) = run(&harness, config_with(ErrorStrategy::Skip, 3)).await;

    // The skipped task is still open, so the backlog is not complete.
    assert_eq!(reason, StopReason::NoTasks);
    assert_eq!(engine.state().tasks_completed, 1);
    assert_eq!(harness.tracker.task("bad").unwrap().status, TaskStatus::Open);
    assert!(events.lock().unwrap().iter().any(|e| matches!(
        e,
        EngineEvent::IterationSkipped { task_id, .. } if task_id == "bad"
    )));
    assert_eq!(engine.state().failed_iterations(), 1);
}

#[tokio::test]
async fn test_retry_strategy_reruns_same_task() {
    let harness = TestHarness::new(MockTracker::with_tasks(vec![
        Task::new("flaky", "Flaky"),
        Task::new("other", "Other"),
    ]))
    .with_agent(
        ScriptedAgent::new("claude")
            .then_exit(1, "", "transient")
            .then_exit(1, "", "transient")
            .then_complete(MARKER)
            .then_complete(MARKER),
    );

    let (engine, reason, events) = run(&harness, config_with(ErrorStrategy::Retry, 2)).await;

    assert_eq!(reason, StopReason::Complete);
    let ids: Vec<String> = engine
        .state()
        .iterations
        .iter()
        .map(|r| r.task.as_ref().unwrap().id.clone())
        .collect();
    assert_eq!(ids, vec!["flaky", "flaky", "flaky", "other"]);

    let attempts: Vec<u32> = events
        .lock()
        .unwrap()
        .iter()
        .filter_map(|e| match e {
            EngineEvent::IterationRetrying { attempt, .. } => Some(*attempt),
            _ => None,
        })
        .collect();
    assert_eq!(attempts, vec![1, 2]);
}

#[tokio::test]
async fn test_retry_exhaustion_falls_back_to_skip() {
    let harness = TestHarness::new(MockTracker::with_tasks(vec![Task::new("broken", "Broken")]))
        .with_agent(
            ScriptedAgent::new("claude")
                .then_exit(1, "", "nope")
                .then_exit(1, "", "nope"),
        );

    let (engine, reason, events) = run(&harness, config_with(ErrorStrategy::Retry, 1)).await;

    assert_eq!(reason, StopReason::NoTasks);
    assert_eq!(engine.state().iterations.len(), 2);
    assert_eq!(count(&events, "iteration:retrying"), 1);
    assert_eq!(count(&events, "iteration:skipped"), 1);
}

#[tokio::test]
async fn test_rate_limit_retries_then_switches_to_fallback() {
    let harness = TestHarness::new(MockTracker::with_tasks(vec![
        Task::new("a", "A"),
        Task::new("b", "B"),
    ]))
    .with_agent(
        ScriptedAgent::new("claude")
            .then_rate_limited()
            .then_rate_limited()
            .then_complete(MARKER),
    )
    .with_agent(ScriptedAgent::new("codex").then_complete(MARKER));

    let mut config = fast_config();
    config.fallback_agents = vec!["codex".to_string()];
    config.rate_limit_handling.max_retries = 1;

    let (engine, reason, events) = run(&harness, config).await;

    assert_eq!(reason, StopReason::Complete);
    let agents: Vec<Option<String>> = engine
        .state()
        .iterations
        .iter()
        .map(|r| r.agent.clone())
        .collect();
    assert_eq!(
        agents,
        vec![Some("codex".to_string()), Some("claude".to_string())],
        "second iteration recovers the primary"
    );

    let events = events.lock().unwrap();
    let switches: Vec<(String, String, SwitchReason)> = events
        .iter()
        .filter_map(|e| match e {
            EngineEvent::AgentSwitched { from, to, reason } => {
                Some((from.clone(), to.clone(), *reason))
            }
            _ => None,
        })
        .collect();
    assert_eq!(
        switches,
        vec![
            ("claude".to_string(), "codex".to_string(), SwitchReason::RateLimit),
            ("codex".to_string(), "claude".to_string(), SwitchReason::PrimaryRecovery),
        ]
    );
    assert_eq!(
        events.iter().filter(|e| e.topic() == "agent:rate-limited").count(),
        2
    );
    assert_eq!(
        events.iter().filter(|e| e.topic() == "agent:recovery-attempted").count(),
        1
    );
}

#[tokio::test]
async fn test_all_agents_limited_fires_once_and_resets() {
    let harness = TestHarness::new(MockTracker::with_tasks(vec![Task::new("a", "A")]))
        .with_agent(ScriptedAgent::new("claude").then_rate_limited())
        .with_agent(ScriptedAgent::new("codex").then_rate_limited());

    let mut config = fast_config();
    config.max_iterations = 1;
    config.fallback_agents = vec!["codex".to_string()];
    config.rate_limit_handling.max_retries = 0;

    let (engine, reason, events) = run(&harness, config).await;

    assert_eq!(reason, StopReason::MaxIterations);
    assert_eq!(count(&events, "agent:all-limited"), 1);
    let state = engine.rate_limit_state().unwrap();
    assert!(state.rate_limited_agents.is_empty());
    assert_eq!(state.active_agent, "claude");

    let result = &engine.state().iterations[0];
    assert_eq!(result.status, IterationStatus::Failed);
    assert_eq!(result.error.as_deref(), Some("All agents rate-limited"));
    assert_eq!(harness.tracker.task("a").unwrap().status, TaskStatus::Open);
    assert!(events.lock().unwrap().iter().any(|e| matches!(
        e,
        EngineEvent::AgentAllLimited { tried_agents } if tried_agents == &["claude", "codex"]
    )));
}

#[tokio::test]
async fn test_rate_limits_are_plain_failures_when_disabled() {
    let harness = TestHarness::new(MockTracker::with_tasks(vec![Task::new("a", "A")]))
        .with_agent(ScriptedAgent::new("claude").then_rate_limited());
    let mut config = config_with(ErrorStrategy::Abort, 0);
    config.rate_limit_handling.enabled = false;

    let (_engine, reason, events) = run(&harness, config).await;

    assert_eq!(reason, StopReason::Error);
    assert_eq!(count(&events, "agent:rate-limited"), 0);
}

#[tokio::test]
async fn test_diff_context_feeds_later_prompts() {
    let harness = TestHarness::new(MockTracker::with_tasks(vec![
        Task::new("a", "A"),
        Task::new("b", "B"),
    ]))
    .with_agent(
        ScriptedAgent::new("claude")
            .then_complete(MARKER)
            .then_complete(MARKER),
    );
    harness.diffs.push(DiffSummary::new(
        vec!["src/new.rs".to_string()],
        vec!["src/lib.rs".to_string()],
        vec![],
    ));

    let (engine, _reason, _events) = run(&harness, fast_config()).await;

    let prompts = harness.agent("claude").prompts();
    assert!(!prompts[0].contains("### Iteration"));
    assert!(prompts[1].contains("### Iteration 1"));
    assert!(prompts[1].contains("src/new.rs"));
    assert_eq!(
        engine.state().iterations[0]
            .diff_summary
            .as_ref()
            .unwrap()
            .files_changed(),
        2
    );
}

#[tokio::test]
async fn test_diff_failure_does_not_fail_iteration() {
    let harness = TestHarness::new(MockTracker::with_tasks(vec![Task::new("a", "A")]))
        .with_agent(ScriptedAgent::new("claude").then_complete(MARKER));
    harness.diffs.push_failure("not a git repository");

    let (engine, reason, _events) = run(&harness, fast_config()).await;

    assert_eq!(reason, StopReason::Complete);
    let result = &engine.state().iterations[0];
    assert_eq!(result.status, IterationStatus::Completed);
    assert!(result.task_completed);
    assert!(result.diff_summary.is_none());
}

#[tokio::test]
async fn test_auto_commit_runs_after_diff_capture() {
    let harness = TestHarness::new(MockTracker::with_tasks(vec![
        Task::new("a", "A"),
        Task::new("b", "B"),
    ]))
    .with_agent(
        ScriptedAgent::new("claude")
            .then_complete(MARKER)
            .then_exit(0, "no marker", ""),
    );
    let mut config = fast_config();
    config.max_iterations = 2;
    let engine = harness.engine(config);
    engine.initialize().await.unwrap();
    engine.set_auto_commit(true);

    engine.start().await.unwrap();

    assert_eq!(harness.commits.commits(), vec!["a".to_string()]);
    assert_eq!(harness.diffs.calls(), 1, "diffs are only captured for completed tasks");
}

#[tokio::test]
async fn test_auto_commit_is_off_by_default() {
    let harness = TestHarness::new(MockTracker::with_tasks(vec![Task::new("a", "A")]))
        .with_agent(ScriptedAgent::new("claude").then_complete(MARKER));

    run(&harness, fast_config()).await;

    assert!(harness.commits.commits().is_empty());
}

#[tokio::test]
async fn test_selection_errors_do_not_consume_iterations() {
    let tracker = MockTracker::with_tasks(vec![Task::new("a", "A")]).failing_selects(1);
    let harness = TestHarness::new(tracker)
        .with_agent(ScriptedAgent::new("claude").then_complete(MARKER));

    let (engine, reason, events) = run(&harness, config_with(ErrorStrategy::Skip, 3)).await;

    assert_eq!(reason, StopReason::Complete);
    assert_eq!(engine.state().current_iteration, 1);
    assert!(events.lock().unwrap().iter().any(|e| matches!(
        e,
        EngineEvent::IterationFailed { iteration: 1, task: None, .. }
    )));
}

#[tokio::test]
async fn test_selection_errors_under_abort_stop_the_engine() {
    let tracker = MockTracker::with_tasks(vec![Task::new("a", "A")]).failing_selects(1);
    let harness = TestHarness::new(tracker)
        .with_agent(ScriptedAgent::new("claude"));

    let (engine, reason, _events) = run(&harness, config_with(ErrorStrategy::Abort, 0)).await;

    assert_eq!(reason, StopReason::Error);
    assert!(engine.state().iterations.is_empty());
}

#[tokio::test]
async fn test_prompt_includes_progress_and_patterns() {
    let harness = TestHarness::new(MockTracker::with_tasks(vec![
        Task::new("a", "A").with_description("Implement the parser"),
        Task::new("b", "B"),
    ]))
    .with_progress(MemoryProgressLog::default().with_patterns("- Use thiserror for errors"))
    .with_agent(
        ScriptedAgent::new("claude")
            .then_complete(MARKER)
            .then_complete(MARKER),
    );

    run(&harness, fast_config()).await;

    let prompts = harness.agent("claude").prompts();
    assert!(prompts[0].contains("Implement the parser"));
    assert!(prompts[0].contains("Use thiserror for errors"));
    assert!(prompts[0].contains(MARKER));
    assert!(prompts[1].contains("Iteration 1: a"));
}

#[tokio::test]
async fn test_agent_output_is_forwarded() {
    let harness = TestHarness::new(MockTracker::with_tasks(vec![Task::new("a", "A")]))
        .with_agent(ScriptedAgent::new("claude").then_exit(0, MARKER, "warning: unused"));

    let (_engine, _reason, events) = run(&harness, fast_config()).await;

    let events = events.lock().unwrap();
    let streams: Vec<OutputStream> = events
        .iter()
        .filter_map(|e| match e {
            EngineEvent::AgentOutput { iteration: 1, stream, .. } => Some(*stream),
            _ => None,
        })
        .collect();
    assert_eq!(streams, vec![OutputStream::Stdout, OutputStream::Stderr]);
}

#[tokio::test]
async fn test_iteration_logs_carry_agent_metadata() {
    let harness = TestHarness::new(MockTracker::with_tasks(vec![Task::new("a", "A")]))
        .with_agent(ScriptedAgent::new("claude").then_complete(MARKER));
    let mut config = fast_config();
    config.agents.insert(
        "claude".to_string(),
        backlog_proto::AgentConfig {
            model: Some("opus".to_string()),
            sandbox: Some("workspace-write".to_string()),
            ..Default::default()
        },
    );

    run(&harness, config).await;

    let entries = harness.logs.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].agent, "claude");
    assert_eq!(entries[0].model.as_deref(), Some("opus"));
    assert_eq!(entries[0].sandbox.as_deref(), Some("workspace-write"));
    assert_eq!(harness.progress.results().len(), 1);
}

#[tokio::test]
async fn test_epic_filter_limits_selection() {
    let harness = TestHarness::new(MockTracker::with_tasks(vec![
        Task::new("outside", "Outside"),
        Task::new("inside", "Inside").with_parent("epic-7"),
    ]))
    .with_agent(ScriptedAgent::new("claude").then_complete(MARKER));
    let mut config = fast_config();
    config.epic_id = Some("epic-7".to_string());

    let (engine, reason, _events) = run(&harness, config).await;

    assert_eq!(reason, StopReason::Complete);
    assert_eq!(engine.state().iterations.len(), 1);
    assert_eq!(harness.tracker.task("outside").unwrap().status, TaskStatus::Open);
}

#[tokio::test]
async fn test_iteration_numbers_increase_monotonically() {
    let harness = TestHarness::new(MockTracker::with_tasks(vec![Task::new("a", "A")]))
        .with_agent(ScriptedAgent::new("claude"));
    let mut config = fast_config();
    config.max_iterations = 3;

    let (engine, reason, events) = run(&harness, config).await;

    assert_eq!(reason, StopReason::MaxIterations);
    let started: Vec<u32> = events
        .lock()
        .unwrap()
        .iter()
        .filter_map(|e| match e {
            EngineEvent::IterationStarted { iteration, .. } => Some(*iteration),
            _ => None,
        })
        .collect();
    assert_eq!(started, vec![1, 2, 3]);
    assert_eq!(engine.iteration_info().current_iteration, 3);
}
