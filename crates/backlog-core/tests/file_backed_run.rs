//! End-to-end run over the file-backed collaborators in a scratch workspace.

use backlog_core::testing::{ScriptedAgent, ScriptedAgentFactory};
use backlog_core::{
    EngineConfig, EngineDeps, EngineStatus, ExecutionEngine, FileSessionStore, JsonlTracker,
    JsonlTrackerFactory,
};
use backlog_proto::{StopReason, Task, TaskFilter, TaskStatus, Tracker};
use std::fs;
use std::sync::Arc;
use tempfile::TempDir;

const MARKER: &str = "<promise>COMPLETE</promise>";

fn workspace_config(dir: &TempDir) -> EngineConfig {
    let yaml = format!(
        r#"
agent: claude
max_iterations: 5
iteration_timeout_secs: 10
workspace_root: "{}"
error_handling:
  strategy: skip
"#,
        dir.path().display()
    );
    EngineConfig::parse_yaml(&yaml).unwrap()
}

async fn engine_for(
    dir: &TempDir,
    agent: ScriptedAgent,
) -> (ExecutionEngine, Arc<ScriptedAgent>) {
    let config = workspace_config(dir);
    let agents = ScriptedAgentFactory::default();
    let agent = agents.register(agent);

    let deps = EngineDeps::from_config(
        &config,
        Arc::new(JsonlTrackerFactory::new(config.resolve(&config.paths.tasks_file))),
        Arc::new(agents),
    )
    .unwrap();
    (ExecutionEngine::new(config, deps), agent)
}

#[tokio::test]
async fn test_run_persists_tasks_progress_logs_and_session() {
    let dir = TempDir::new().unwrap();
    let tasks_path = dir.path().join(".backlog/tasks.jsonl");
    JsonlTracker::create(
        &tasks_path,
        vec![
            Task::new("setup", "Set up the crate"),
            Task::new("parser", "Write the parser").depends_on("setup"),
        ],
    )
    .await
    .unwrap();

    let (engine, _agent) = engine_for(
        &dir,
        ScriptedAgent::new("claude")
            .then_complete(MARKER)
            .then_complete(MARKER),
    )
    .await;
    engine.initialize().await.unwrap();

    let reason = engine.start().await.unwrap();
    assert_eq!(reason, StopReason::Complete);

    // Tracker file reflects completion.
    let tracker = JsonlTracker::open(&tasks_path).await.unwrap();
    let tasks = tracker.get_tasks(&TaskFilter::any()).await.unwrap();
    assert!(tasks.iter().all(|t| t.status == TaskStatus::Completed));

    // Progress log has both entries under the header.
    let progress = fs::read_to_string(dir.path().join(".backlog/progress.md")).unwrap();
    assert!(progress.starts_with("# Progress Log"));
    assert!(progress.contains("Iteration 1: setup - Set up the crate"));
    assert!(progress.contains("Iteration 2: parser - Write the parser"));

    // One log file per iteration.
    let mut logs: Vec<String> = fs::read_dir(dir.path().join(".backlog/iterations"))
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .collect();
    logs.sort();
    assert_eq!(
        logs,
        vec!["iteration-001-setup.log", "iteration-002-parser.log"]
    );

    // Session ends idle with the stop reason.
    let session = FileSessionStore::new(dir.path().join(".backlog/session.json"))
        .load()
        .await
        .unwrap()
        .unwrap();
    assert_eq!(session.status, EngineStatus::Idle);
    assert_eq!(session.stop_reason, Some(StopReason::Complete));
    assert_eq!(session.tasks_completed, 2);
}

#[tokio::test]
async fn test_second_prompt_sees_first_progress_entry() {
    let dir = TempDir::new().unwrap();
    JsonlTracker::create(
        dir.path().join(".backlog/tasks.jsonl"),
        vec![Task::new("one", "One"), Task::new("two", "Two")],
    )
    .await
    .unwrap();

    let (engine, agent) = engine_for(
        &dir,
        ScriptedAgent::new("claude")
            .then_complete(MARKER)
            .then_complete(MARKER),
    )
    .await;
    engine.initialize().await.unwrap();
    engine.start().await.unwrap();

    let prompts = agent.prompts();
    assert!(!prompts[0].contains("## Recent Progress"));
    assert!(prompts[1].contains("## Recent Progress"));
    assert!(prompts[1].contains("Iteration 1: one - One"));
    assert!(engine.state().iterations[0].task_completed);
}

#[tokio::test]
async fn test_missing_tasks_file_is_an_empty_backlog() {
    let dir = TempDir::new().unwrap();
    let (engine, _agent) = engine_for(&dir, ScriptedAgent::new("claude")).await;
    engine.initialize().await.unwrap();

    assert_eq!(engine.start().await.unwrap(), StopReason::Complete);
    assert!(engine.state().iterations.is_empty());
}
