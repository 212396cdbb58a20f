//! The engine driving real subprocess agents.
#![cfg(unix)]

use backlog_adapters::CliAgentFactory;
use backlog_core::testing::{MockTracker, TestHarness, fast_config};
use backlog_core::{EngineConfig, ErrorStrategy, ExecutionEngine};
use backlog_proto::{
    AgentConfig, EngineEvent, IterationStatus, StopReason, Task, TaskStatus,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn bash(script: &str) -> AgentConfig {
    AgentConfig {
        command: Some("bash".to_string()),
        args: vec!["-c".to_string(), script.to_string()],
        ..AgentConfig::default()
    }
}

fn config_for(agents: &[(&str, &str)]) -> EngineConfig {
    let mut config = fast_config();
    config.agent = agents[0].0.to_string();
    config.fallback_agents = agents[1..].iter().map(|(id, _)| id.to_string()).collect();
    for (id, script) in agents {
        config.agents.insert(id.to_string(), bash(script));
    }
    config
}

fn engine(harness: &TestHarness, config: EngineConfig) -> ExecutionEngine {
    let mut deps = harness.deps();
    deps.agent_factory = Arc::new(CliAgentFactory::from_config(&config));
    ExecutionEngine::new(config, deps)
}

fn capture(engine: &ExecutionEngine) -> Arc<Mutex<Vec<EngineEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    engine.on(move |event| sink.lock().unwrap().push(event.clone()));
    events
}

#[tokio::test]
async fn test_subprocess_completion_marker_completes_task() {
    let harness = TestHarness::new(MockTracker::with_tasks(vec![Task::new("t1", "Do it")]));
    let config = config_for(&[(
        "worker",
        r#"cat > /dev/null; echo "done"; echo "<promise>COMPLETE</promise>""#,
    )]);
    let engine = engine(&harness, config);
    engine.initialize().await.unwrap();

    let events = capture(&engine);
    let reason = engine.start().await.unwrap();

    assert_eq!(reason, StopReason::Complete);
    let state = engine.state();
    assert_eq!(state.tasks_completed, 1);
    assert_eq!(state.iterations[0].status, IterationStatus::Completed);
    assert!(state.iterations[0].promise_complete);
    assert_eq!(harness.tracker.task("t1").unwrap().status, TaskStatus::Completed);

    let output: String = events
        .lock()
        .unwrap()
        .iter()
        .filter_map(|e| match e {
            EngineEvent::AgentOutput { data, .. } => Some(data.clone()),
            _ => None,
        })
        .collect();
    assert!(output.contains("done\n"));
}

#[tokio::test]
async fn test_iteration_timeout_kills_subprocess() {
    let harness = TestHarness::new(MockTracker::with_tasks(vec![Task::new("slow", "Slow")]));
    let mut config = config_for(&[("worker", "sleep 30")]);
    config.iteration_timeout_secs = 1;
    config.error_handling.strategy = ErrorStrategy::Abort;
    let engine = engine(&harness, config);
    engine.initialize().await.unwrap();

    let reason = tokio::time::timeout(Duration::from_secs(20), engine.start())
        .await
        .expect("timeout should stop the run")
        .unwrap();

    assert_eq!(reason, StopReason::Error);
    assert_eq!(engine.state().iterations[0].status, IterationStatus::Timeout);
    assert_eq!(harness.tracker.task("slow").unwrap().status, TaskStatus::Open);
}

#[tokio::test]
async fn test_stop_interrupts_running_subprocess() {
    let harness = TestHarness::new(MockTracker::with_tasks(vec![Task::new("long", "Long")]));
    let config = config_for(&[("worker", "echo started; sleep 30")]);
    let engine = Arc::new(engine(&harness, config));
    engine.initialize().await.unwrap();
    let events = capture(&engine);

    let runner = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.start().await })
    };

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !events
        .lock()
        .unwrap()
        .iter()
        .any(|e| e.topic() == "agent:output")
    {
        assert!(tokio::time::Instant::now() < deadline, "agent never produced output");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    tokio::time::timeout(Duration::from_secs(10), engine.stop())
        .await
        .expect("stop should return once the process is killed");
    let reason = runner.await.unwrap().unwrap();

    assert_eq!(reason, StopReason::Interrupted);
    assert_eq!(
        engine.state().iterations[0].status,
        IterationStatus::Interrupted
    );
    assert_eq!(harness.tracker.task("long").unwrap().status, TaskStatus::Open);
}

#[tokio::test]
async fn test_rate_limited_primary_falls_back_to_next_cli() {
    let harness = TestHarness::new(MockTracker::with_tasks(vec![Task::new("t1", "Do it")]));
    let config = config_for(&[
        (
            "primary",
            r#"cat > /dev/null; echo "Error: 429 Too Many Requests - rate limit exceeded" >&2; exit 1"#,
        ),
        (
            "backup",
            r#"cat > /dev/null; echo "<promise>COMPLETE</promise>""#,
        ),
    ]);
    let engine = engine(&harness, config);
    engine.initialize().await.unwrap();
    let events = capture(&engine);

    let reason = engine.start().await.unwrap();

    assert_eq!(reason, StopReason::Complete);
    let switched: Vec<(String, String)> = events
        .lock()
        .unwrap()
        .iter()
        .filter_map(|e| match e {
            EngineEvent::AgentSwitched { from, to, .. } => Some((from.clone(), to.clone())),
            _ => None,
        })
        .collect();
    assert_eq!(
        switched,
        vec![("primary".to_string(), "backup".to_string())]
    );
    assert_eq!(engine.state().iterations.len(), 1);
    assert_eq!(engine.state().iterations[0].agent.as_deref(), Some("backup"));
}

#[tokio::test]
async fn test_missing_primary_binary_fails_initialize() {
    let harness = TestHarness::new(MockTracker::new());
    let mut config = fast_config();
    config.agent = "ghost".to_string();
    config.agents.insert(
        "ghost".to_string(),
        AgentConfig {
            command: Some("backlog-no-such-agent-binary".to_string()),
            ..AgentConfig::default()
        },
    );
    let engine = engine(&harness, config);

    let err = engine.initialize().await.unwrap_err();
    assert!(err.to_string().contains("ghost"));
}
