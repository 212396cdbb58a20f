//! In-memory collaborators for exercising the engine without a CLI, git, or disk.
//!
//! ```ignore
//! let harness = TestHarness::new(MockTracker::with_tasks(vec![Task::new("a", "A")]))
//!     .with_agent(ScriptedAgent::new("claude").then_complete("<promise>COMPLETE</promise>"));
//! let engine = harness.engine(EngineConfig::default());
//! ```

use crate::config::EngineConfig;
use crate::engine::{AgentFactory, EngineDeps, ExecutionEngine, TrackerFactory};
use crate::git_ops::{AutoCommitResult, AutoCommitter, DiffSummarizer, GitOpsError};
use crate::persistence::{
    IterationLogEntry, IterationLogger, PersistenceError, ProgressLog, SessionSnapshot,
    SessionStore,
};
use crate::prompt::TemplatePromptRenderer;
use async_trait::async_trait;
use backlog_proto::{
    Agent, AgentConfig, AgentError, AgentExecutionResult, AgentFile, DetectResult, DiffSummary,
    ExecuteOptions, ExecutionHandle, IterationResult, SubagentEvent, SyncResult, Task,
    TaskCompletionResult, TaskFilter, TaskStatus, Tracker, TrackerError, generate_execution_id,
};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Tracker
// ---------------------------------------------------------------------------

/// Tracker over a task list held in memory.
///
/// Selection prefers in-progress tasks, then open tasks whose dependencies
/// are completed, in list order. Every call is recorded.
#[derive(Debug, Default)]
pub struct MockTracker {
    tasks: Mutex<Vec<Task>>,
    complete_override: Mutex<Option<bool>>,
    select_errors: AtomicUsize,
    calls: Mutex<Vec<String>>,
}

impl MockTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tasks(tasks: Vec<Task>) -> Self {
        Self {
            tasks: Mutex::new(tasks),
            ..Self::default()
        }
    }

    /// Forces the answer of `is_complete`.
    pub fn with_complete(self, complete: bool) -> Self {
        *lock(&self.complete_override) = Some(complete);
        self
    }

    /// Makes the next `n` `get_next_task` calls fail.
    pub fn failing_selects(self, n: usize) -> Self {
        self.select_errors.store(n, Ordering::SeqCst);
        self
    }

    pub fn push(&self, task: Task) {
        lock(&self.tasks).push(task);
    }

    pub fn task(&self, id: &str) -> Option<Task> {
        lock(&self.tasks).iter().find(|t| t.id == id).cloned()
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    /// Calls whose name starts with `prefix`.
    pub fn calls_to(&self, prefix: &str) -> Vec<String> {
        lock(&self.calls)
            .iter()
            .filter(|c| c.starts_with(prefix))
            .cloned()
            .collect()
    }

    fn record(&self, call: String) {
        lock(&self.calls).push(call);
    }
}

#[async_trait]
impl Tracker for MockTracker {
    fn name(&self) -> &str {
        "mock"
    }

    async fn get_next_task(&self, filter: &TaskFilter) -> Result<Option<Task>, TrackerError> {
        self.record("get_next_task".to_string());
        let failing = self
            .select_errors
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(TrackerError::Backend("scripted selection failure".to_string()));
        }

        let tasks = lock(&self.tasks);
        let ready = |task: &&Task| {
            task.depends_on.iter().all(|dep| {
                tasks
                    .iter()
                    .any(|t| &t.id == dep && t.status == TaskStatus::Completed)
            })
        };
        let candidates = || tasks.iter().filter(|t| filter.matches(t));

        let next = candidates()
            .find(|t| t.status == TaskStatus::InProgress)
            .or_else(|| {
                candidates()
                    .filter(|t| t.status == TaskStatus::Open)
                    .find(ready)
            })
            .cloned();
        Ok(next)
    }

    async fn is_complete(&self, filter: &TaskFilter) -> Result<bool, TrackerError> {
        self.record("is_complete".to_string());
        if let Some(complete) = *lock(&self.complete_override) {
            return Ok(complete);
        }
        Ok(!lock(&self.tasks).iter().any(|t| {
            filter.matches(t)
                && matches!(
                    t.status,
                    TaskStatus::Open | TaskStatus::InProgress | TaskStatus::Blocked
                )
        }))
    }

    async fn get_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, TrackerError> {
        self.record("get_tasks".to_string());
        Ok(lock(&self.tasks)
            .iter()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect())
    }

    async fn update_task_status(
        &self,
        id: &str,
        status: TaskStatus,
    ) -> Result<Option<Task>, TrackerError> {
        self.record(format!("update_task_status:{id}:{status}"));
        let mut tasks = lock(&self.tasks);
        Ok(tasks.iter_mut().find(|t| t.id == id).map(|task| {
            task.status = status;
            task.clone()
        }))
    }

    async fn complete_task(
        &self,
        id: &str,
        _reason: Option<&str>,
    ) -> Result<TaskCompletionResult, TrackerError> {
        self.record(format!("complete_task:{id}"));
        let mut tasks = lock(&self.tasks);
        let Some(task) = tasks.iter_mut().find(|t| t.id == id) else {
            return Ok(TaskCompletionResult {
                success: false,
                message: format!("Task '{id}' not found"),
                task: None,
            });
        };
        task.status = TaskStatus::Completed;
        Ok(TaskCompletionResult {
            success: true,
            message: format!("Completed {id}"),
            task: Some(task.clone()),
        })
    }

    async fn sync(&self) -> Result<SyncResult, TrackerError> {
        self.record("sync".to_string());
        let task_count = lock(&self.tasks).len();
        Ok(SyncResult {
            success: true,
            message: "in-memory".to_string(),
            task_count,
        })
    }
}

/// Hands out the same shared [`MockTracker`].
pub struct MockTrackerFactory(pub Arc<MockTracker>);

#[async_trait]
impl TrackerFactory for MockTrackerFactory {
    async fn create(&self) -> Result<Arc<dyn Tracker>, TrackerError> {
        Ok(Arc::clone(&self.0) as Arc<dyn Tracker>)
    }
}

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

/// One scripted execution.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Exit {
        code: i32,
        stdout: String,
        stderr: String,
        delay: Duration,
    },
    /// Runs until interrupted.
    Hang,
}

impl ScriptStep {
    pub fn exit(code: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        ScriptStep::Exit {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
            delay: Duration::ZERO,
        }
    }
}

/// Agent that replays a queue of [`ScriptStep`]s, one per execution.
///
/// Once the queue is empty, every execution exits 0 with no output.
#[derive(Debug)]
pub struct ScriptedAgent {
    id: String,
    available: bool,
    script: Mutex<VecDeque<ScriptStep>>,
    subagent_events: Vec<SubagentEvent>,
    prompts: Mutex<Vec<String>>,
    initialized_with: Mutex<Option<AgentConfig>>,
    disposed: AtomicUsize,
}

impl ScriptedAgent {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            available: true,
            script: Mutex::new(VecDeque::new()),
            subagent_events: Vec::new(),
            prompts: Mutex::new(Vec::new()),
            initialized_with: Mutex::new(None),
            disposed: AtomicUsize::new(0),
        }
    }

    /// `detect()` reports the agent as missing.
    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    pub fn then(self, step: ScriptStep) -> Self {
        lock(&self.script).push_back(step);
        self
    }

    /// Exits 0 with `stdout` containing the completion marker.
    pub fn then_complete(self, marker: &str) -> Self {
        self.then(ScriptStep::exit(0, format!("Done.\n{marker}\n"), ""))
    }

    pub fn then_exit(self, code: i32, stdout: &str, stderr: &str) -> Self {
        self.then(ScriptStep::exit(code, stdout, stderr))
    }

    /// Exits 1 with a 429 on stderr.
    pub fn then_rate_limited(self) -> Self {
        self.then(ScriptStep::exit(
            1,
            "",
            "Error: 429 Too Many Requests - rate limit exceeded",
        ))
    }

    pub fn then_hang(self) -> Self {
        self.then(ScriptStep::Hang)
    }

    /// Reports these subagent events on every execution.
    pub fn with_subagents(mut self, events: Vec<SubagentEvent>) -> Self {
        self.subagent_events = events;
        self
    }

    pub fn prompts(&self) -> Vec<String> {
        lock(&self.prompts).clone()
    }

    pub fn executions(&self) -> usize {
        lock(&self.prompts).len()
    }

    pub fn initialized_with(&self) -> Option<AgentConfig> {
        lock(&self.initialized_with).clone()
    }

    pub fn dispose_count(&self) -> usize {
        self.disposed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn supports_subagent_tracing(&self) -> bool {
        !self.subagent_events.is_empty()
    }

    async fn detect(&self) -> DetectResult {
        if self.available {
            DetectResult::available(Some("1.0.0-scripted".to_string()))
        } else {
            DetectResult::unavailable(format!("{} not found on PATH", self.id))
        }
    }

    async fn initialize(&self, config: &AgentConfig) -> Result<(), AgentError> {
        *lock(&self.initialized_with) = Some(config.clone());
        Ok(())
    }

    async fn execute(
        &self,
        prompt: &str,
        _files: &[AgentFile],
        options: ExecuteOptions,
    ) -> Result<ExecutionHandle, AgentError> {
        lock(&self.prompts).push(prompt.to_string());
        let step = lock(&self.script)
            .pop_front()
            .unwrap_or_else(|| ScriptStep::exit(0, "", ""));
        let subagents = self.subagent_events.clone();

        let (handle, reporter) = ExecutionHandle::channel(generate_execution_id());
        options.emit_start(reporter.execution_id());

        tokio::spawn(async move {
            let id = reporter.execution_id().to_string();
            let started_at = reporter.started_at();
            let cancel = reporter.cancel_token();

            for event in &subagents {
                options.emit_subagent(event);
            }

            let result = match step {
                ScriptStep::Exit {
                    code,
                    stdout,
                    stderr,
                    delay,
                } => {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            AgentExecutionResult::interrupted(id, started_at, "Interrupted")
                        }
                        _ = tokio::time::sleep(delay) => {
                            if !stdout.is_empty() {
                                options.emit_stdout(&stdout);
                            }
                            if !stderr.is_empty() {
                                options.emit_stderr(&stderr);
                            }
                            AgentExecutionResult::exited(id, code, stdout, stderr, started_at)
                        }
                    }
                }
                ScriptStep::Hang => {
                    cancel.cancelled().await;
                    AgentExecutionResult::interrupted(id, started_at, "Interrupted")
                }
            };

            options.emit_end(&result);
            reporter.finish(result);
        });

        Ok(handle)
    }

    async fn dispose(&self) -> Result<(), AgentError> {
        self.disposed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Resolves agent ids to registered [`ScriptedAgent`]s.
#[derive(Debug, Default)]
pub struct ScriptedAgentFactory {
    agents: Mutex<HashMap<String, Arc<ScriptedAgent>>>,
}

impl ScriptedAgentFactory {
    pub fn register(&self, agent: ScriptedAgent) -> Arc<ScriptedAgent> {
        let agent = Arc::new(agent);
        lock(&self.agents).insert(agent.id.clone(), Arc::clone(&agent));
        agent
    }

    pub fn get(&self, id: &str) -> Option<Arc<ScriptedAgent>> {
        lock(&self.agents).get(id).cloned()
    }
}

#[async_trait]
impl AgentFactory for ScriptedAgentFactory {
    async fn create(&self, agent_id: &str) -> Result<Arc<dyn Agent>, AgentError> {
        self.get(agent_id)
            .map(|agent| agent as Arc<dyn Agent>)
            .ok_or_else(|| {
                AgentError::Unavailable(agent_id.to_string(), "no such agent".to_string())
            })
    }
}

// ---------------------------------------------------------------------------
// Persistence and git
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemorySessionStore {
    snapshots: Mutex<Vec<SessionSnapshot>>,
}

impl MemorySessionStore {
    pub fn snapshots(&self) -> Vec<SessionSnapshot> {
        lock(&self.snapshots).clone()
    }

    pub fn last(&self) -> Option<SessionSnapshot> {
        lock(&self.snapshots).last().cloned()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn save(&self, snapshot: &SessionSnapshot) -> Result<(), PersistenceError> {
        lock(&self.snapshots).push(snapshot.clone());
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryIterationLogger {
    entries: Mutex<Vec<IterationLogEntry>>,
}

impl MemoryIterationLogger {
    pub fn entries(&self) -> Vec<IterationLogEntry> {
        lock(&self.entries).clone()
    }
}

#[async_trait]
impl IterationLogger for MemoryIterationLogger {
    async fn log_iteration(&self, entry: &IterationLogEntry) -> Result<PathBuf, PersistenceError> {
        let mut entries = lock(&self.entries);
        entries.push(entry.clone());
        Ok(PathBuf::from(format!("memory://iteration-{}", entries.len())))
    }
}

/// Progress log that renders one line per recorded iteration.
#[derive(Debug, Default)]
pub struct MemoryProgressLog {
    results: Mutex<Vec<IterationResult>>,
    patterns: Mutex<Option<String>>,
}

impl MemoryProgressLog {
    pub fn with_patterns(self, patterns: impl Into<String>) -> Self {
        *lock(&self.patterns) = Some(patterns.into());
        self
    }

    pub fn results(&self) -> Vec<IterationResult> {
        lock(&self.results).clone()
    }
}

#[async_trait]
impl ProgressLog for MemoryProgressLog {
    async fn append(&self, result: &IterationResult) -> Result<(), PersistenceError> {
        lock(&self.results).push(result.clone());
        Ok(())
    }

    async fn recent(&self, n: usize) -> Result<Option<String>, PersistenceError> {
        let results = lock(&self.results);
        if results.is_empty() || n == 0 {
            return Ok(None);
        }
        let lines: Vec<String> = results
            .iter()
            .skip(results.len().saturating_sub(n))
            .map(|r| {
                let task = r.task.as_ref().map_or("-", |t| t.id.as_str());
                format!("- Iteration {}: {} ({})", r.iteration, task, r.status)
            })
            .collect();
        Ok(Some(lines.join("\n")))
    }

    async fn codebase_patterns(&self) -> Result<Option<String>, PersistenceError> {
        Ok(lock(&self.patterns).clone())
    }
}

/// Returns queued summaries in order, then empty ones. Can be told to fail.
#[derive(Debug, Default)]
pub struct StaticDiffSummarizer {
    queue: Mutex<VecDeque<Result<DiffSummary, String>>>,
    calls: AtomicUsize,
}

impl StaticDiffSummarizer {
    pub fn push(&self, summary: DiffSummary) {
        lock(&self.queue).push_back(Ok(summary));
    }

    pub fn push_failure(&self, message: impl Into<String>) {
        lock(&self.queue).push_back(Err(message.into()));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DiffSummarizer for StaticDiffSummarizer {
    async fn summarize(&self, _workspace: &Path) -> Result<DiffSummary, GitOpsError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match lock(&self.queue).pop_front() {
            Some(Ok(summary)) => Ok(summary),
            Some(Err(message)) => Err(GitOpsError::Git(message)),
            None => Ok(DiffSummary::default()),
        }
    }
}

/// Records commit requests instead of touching git.
#[derive(Debug, Default)]
pub struct RecordingCommitter {
    commits: Mutex<Vec<String>>,
}

impl RecordingCommitter {
    /// Ids of the tasks committed, in order.
    pub fn commits(&self) -> Vec<String> {
        lock(&self.commits).clone()
    }
}

#[async_trait]
impl AutoCommitter for RecordingCommitter {
    async fn commit_task(
        &self,
        _workspace: &Path,
        task: &Task,
    ) -> Result<AutoCommitResult, GitOpsError> {
        let mut commits = lock(&self.commits);
        commits.push(task.id.clone());
        Ok(AutoCommitResult {
            committed: true,
            commit_sha: Some(format!("{:07x}", commits.len())),
            files_staged: 1,
        })
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

/// Bundles the in-memory collaborators and keeps handles for assertions.
pub struct TestHarness {
    pub tracker: Arc<MockTracker>,
    pub agents: Arc<ScriptedAgentFactory>,
    pub sessions: Arc<MemorySessionStore>,
    pub logs: Arc<MemoryIterationLogger>,
    pub progress: Arc<MemoryProgressLog>,
    pub diffs: Arc<StaticDiffSummarizer>,
    pub commits: Arc<RecordingCommitter>,
}

impl TestHarness {
    pub fn new(tracker: MockTracker) -> Self {
        Self {
            tracker: Arc::new(tracker),
            agents: Arc::new(ScriptedAgentFactory::default()),
            sessions: Arc::new(MemorySessionStore::default()),
            logs: Arc::new(MemoryIterationLogger::default()),
            progress: Arc::new(MemoryProgressLog::default()),
            diffs: Arc::new(StaticDiffSummarizer::default()),
            commits: Arc::new(RecordingCommitter::default()),
        }
    }

    pub fn with_agent(self, agent: ScriptedAgent) -> Self {
        self.agents.register(agent);
        self
    }

    pub fn with_progress(mut self, progress: MemoryProgressLog) -> Self {
        self.progress = Arc::new(progress);
        self
    }

    pub fn agent(&self, id: &str) -> Arc<ScriptedAgent> {
        self.agents
            .get(id)
            .unwrap_or_else(|| panic!("agent '{id}' was not registered"))
    }

    pub fn deps(&self) -> EngineDeps {
        EngineDeps {
            tracker_factory: Arc::new(MockTrackerFactory(Arc::clone(&self.tracker))),
            agent_factory: Arc::clone(&self.agents) as Arc<dyn AgentFactory>,
            prompt_renderer: Arc::new(TemplatePromptRenderer::with_default_template()),
            diff_summarizer: Arc::clone(&self.diffs) as Arc<dyn DiffSummarizer>,
            auto_committer: Arc::clone(&self.commits) as Arc<dyn AutoCommitter>,
            session_store: Arc::clone(&self.sessions) as Arc<dyn SessionStore>,
            iteration_logger: Arc::clone(&self.logs) as Arc<dyn IterationLogger>,
            progress_log: Arc::clone(&self.progress) as Arc<dyn ProgressLog>,
        }
    }

    pub fn engine(&self, config: EngineConfig) -> ExecutionEngine {
        ExecutionEngine::new(config, self.deps())
    }
}

/// Config with no delays, suited to fast tests.
pub fn fast_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.error_handling.retry_delay_ms = 0;
    config.rate_limit_handling.base_backoff_ms = 1;
    config.iteration_timeout_secs = 5;
    config
}
