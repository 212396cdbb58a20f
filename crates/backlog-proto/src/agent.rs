//! The agent contract consumed by the engine.
//!
//! An agent drives one coding-assistant CLI. `execute` returns immediately with
//! an [`ExecutionHandle`]; the subprocess runs on its own and reports its
//! outcome through a oneshot channel. Interrupting the handle fires a
//! [`CancellationToken`] that the agent's subprocess wrapper watches.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Errors reported by an agent.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Agent '{0}' is not initialized")]
    NotInitialized(String),

    #[error("Agent '{0}' is not available: {1}")]
    Unavailable(String, String),

    #[error("Failed to spawn agent process: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Agent execution error: {0}")]
    Execution(String),
}

/// How the prompt reaches the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptMode {
    /// Pass the prompt as a command-line argument
    #[default]
    Arg,
    /// Write the prompt to the process's stdin
    Stdin,
}

/// Settings an agent is initialized with.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Executable to run. Agents fall back to their preset when unset.
    #[serde(default)]
    pub command: Option<String>,

    /// Extra arguments appended after the preset arguments.
    #[serde(default)]
    pub args: Vec<String>,

    /// Model name passed to the CLI, if it supports one.
    #[serde(default)]
    pub model: Option<String>,

    /// Sandbox mode label, recorded in iteration logs.
    #[serde(default)]
    pub sandbox: Option<String>,

    #[serde(default)]
    pub prompt_mode: Option<PromptMode>,

    /// Flag preceding the prompt in `arg` mode (e.g. `-p`).
    #[serde(default)]
    pub prompt_flag: Option<String>,

    /// Extra environment variables for the subprocess.
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Working directory for the subprocess.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

/// Outcome of [`Agent::detect`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectResult {
    pub available: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DetectResult {
    pub fn available(version: Option<String>) -> Self {
        Self {
            available: true,
            version,
            error: None,
        }
    }

    pub fn unavailable(error: impl Into<String>) -> Self {
        Self {
            available: false,
            version: None,
            error: Some(error.into()),
        }
    }
}

/// Outcome of [`Agent::preflight`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreflightResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// A file handed to the agent alongside the prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentFile {
    pub path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

/// Final state of an agent execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentExecutionStatus {
    Completed,
    Failed,
    Interrupted,
    Timeout,
}

/// Raw outcome of one agent execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentExecutionResult {
    pub execution_id: String,
    pub status: AgentExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    pub duration_ms: u64,
    #[serde(default)]
    pub interrupted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

impl AgentExecutionResult {
    /// Builds a result for a process that exited with `exit_code`.
    pub fn exited(
        execution_id: impl Into<String>,
        exit_code: i32,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
        started_at: DateTime<Utc>,
    ) -> Self {
        let ended_at = Utc::now();
        Self {
            execution_id: execution_id.into(),
            status: if exit_code == 0 {
                AgentExecutionStatus::Completed
            } else {
                AgentExecutionStatus::Failed
            },
            exit_code: Some(exit_code),
            stdout: stdout.into(),
            stderr: stderr.into(),
            duration_ms: elapsed_ms(started_at, ended_at),
            interrupted: false,
            error: None,
            started_at,
            ended_at,
        }
    }

    /// Builds a result for an execution cut short by cancellation.
    pub fn interrupted(
        execution_id: impl Into<String>,
        started_at: DateTime<Utc>,
        reason: impl Into<String>,
    ) -> Self {
        let ended_at = Utc::now();
        Self {
            execution_id: execution_id.into(),
            status: AgentExecutionStatus::Interrupted,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            duration_ms: elapsed_ms(started_at, ended_at),
            interrupted: true,
            error: Some(reason.into()),
            started_at,
            ended_at,
        }
    }

    /// Replaces the captured output.
    pub fn with_output(mut self, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        self.stdout = stdout.into();
        self.stderr = stderr.into();
        self
    }

    /// Marks the result as a timeout.
    pub fn into_timeout(mut self, after: Duration) -> Self {
        self.status = AgentExecutionStatus::Timeout;
        self.interrupted = true;
        self.error = Some(format!("Execution timed out after {}s", after.as_secs()));
        self
    }
}

fn elapsed_ms(start: DateTime<Utc>, end: DateTime<Utc>) -> u64 {
    u64::try_from((end - start).num_milliseconds()).unwrap_or(0)
}

/// Subagent lifecycle transitions reported by agents that support tracing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubagentStatus {
    Running,
    Completed,
    Failed,
}

/// One subagent lifecycle report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubagentEvent {
    pub id: String,
    pub status: SubagentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Last known state of a subagent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubagentInfo {
    pub id: String,
    pub status: SubagentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl SubagentInfo {
    /// Folds a lifecycle report into the tracked state.
    pub fn apply(&mut self, event: &SubagentEvent) {
        self.status = event.status;
        if event.agent_type.is_some() {
            self.agent_type.clone_from(&event.agent_type);
        }
        if event.description.is_some() {
            self.description.clone_from(&event.description);
        }
        if event.status != SubagentStatus::Running {
            self.ended_at = Some(Utc::now());
        }
    }
}

impl From<&SubagentEvent> for SubagentInfo {
    fn from(event: &SubagentEvent) -> Self {
        let mut info = Self {
            id: event.id.clone(),
            status: SubagentStatus::Running,
            agent_type: None,
            description: None,
            started_at: Utc::now(),
            ended_at: None,
        };
        info.apply(event);
        info
    }
}

pub type StartCallback = Arc<dyn Fn(&str) + Send + Sync>;
pub type OutputCallback = Arc<dyn Fn(&str) + Send + Sync>;
pub type EndCallback = Arc<dyn Fn(&AgentExecutionResult) + Send + Sync>;
pub type SubagentCallback = Arc<dyn Fn(&SubagentEvent) + Send + Sync>;

/// Per-execution options.
///
/// Callbacks run on the agent's reader tasks. A panicking callback is caught
/// and logged so the execution still resolves.
#[derive(Clone, Default)]
pub struct ExecuteOptions {
    /// Hard limit enforced by the agent itself. The engine races its own timeout too.
    pub timeout: Option<Duration>,
    pub working_dir: Option<PathBuf>,
    pub on_start: Option<StartCallback>,
    pub on_stdout: Option<OutputCallback>,
    pub on_stderr: Option<OutputCallback>,
    pub on_end: Option<EndCallback>,
    pub on_subagent: Option<SubagentCallback>,
}

impl std::fmt::Debug for ExecuteOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecuteOptions")
            .field("timeout", &self.timeout)
            .field("working_dir", &self.working_dir)
            .field("on_start", &self.on_start.is_some())
            .field("on_stdout", &self.on_stdout.is_some())
            .field("on_stderr", &self.on_stderr.is_some())
            .field("on_end", &self.on_end.is_some())
            .field("on_subagent", &self.on_subagent.is_some())
            .finish()
    }
}

impl ExecuteOptions {
    pub fn emit_start(&self, execution_id: &str) {
        if let Some(cb) = &self.on_start {
            guarded("on_start", || cb(execution_id));
        }
    }

    pub fn emit_stdout(&self, chunk: &str) {
        if let Some(cb) = &self.on_stdout {
            guarded("on_stdout", || cb(chunk));
        }
    }

    pub fn emit_stderr(&self, chunk: &str) {
        if let Some(cb) = &self.on_stderr {
            guarded("on_stderr", || cb(chunk));
        }
    }

    pub fn emit_end(&self, result: &AgentExecutionResult) {
        if let Some(cb) = &self.on_end {
            guarded("on_end", || cb(result));
        }
    }

    pub fn emit_subagent(&self, event: &SubagentEvent) {
        if let Some(cb) = &self.on_subagent {
            guarded("on_subagent", || cb(event));
        }
    }
}

fn guarded(name: &str, f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        warn!(callback = name, "Execution callback panicked; ignoring");
    }
}

/// Generates a unique execution ID: `exec-{secs}-{micros:04x}-{seq}`.
pub fn generate_execution_id() -> String {
    static SEQ: AtomicU64 = AtomicU64::new(0);
    let now = Utc::now();
    let seq = SEQ.fetch_add(1, Ordering::Relaxed);
    format!(
        "exec-{}-{:04x}-{}",
        now.timestamp(),
        now.timestamp_subsec_micros() % 0x10000,
        seq
    )
}

/// Handle to an in-flight execution.
#[derive(Debug)]
pub struct ExecutionHandle {
    execution_id: String,
    started_at: DateTime<Utc>,
    cancel: CancellationToken,
    result: oneshot::Receiver<AgentExecutionResult>,
    running: Arc<AtomicBool>,
    finished: Option<AgentExecutionResult>,
}

/// Agent-side half of an [`ExecutionHandle`].
#[derive(Debug)]
pub struct ExecutionReporter {
    execution_id: String,
    started_at: DateTime<Utc>,
    cancel: CancellationToken,
    sender: oneshot::Sender<AgentExecutionResult>,
    running: Arc<AtomicBool>,
}

impl ExecutionHandle {
    /// Creates a connected handle/reporter pair for a new execution.
    pub fn channel(execution_id: impl Into<String>) -> (ExecutionHandle, ExecutionReporter) {
        let execution_id = execution_id.into();
        let started_at = Utc::now();
        let cancel = CancellationToken::new();
        let running = Arc::new(AtomicBool::new(true));
        let (sender, result) = oneshot::channel();

        let handle = ExecutionHandle {
            execution_id: execution_id.clone(),
            started_at,
            cancel: cancel.clone(),
            result,
            running: Arc::clone(&running),
            finished: None,
        };
        let reporter = ExecutionReporter {
            execution_id,
            started_at,
            cancel,
            sender,
            running,
        };
        (handle, reporter)
    }

    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    /// Requests cancellation. Idempotent.
    pub fn interrupt(&self) {
        self.cancel.cancel();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Returns a clone of the cancellation token, so others can interrupt.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Waits for the execution to finish.
    ///
    /// Cancel-safe: dropping the future (e.g. when a timeout wins a race)
    /// leaves the handle waitable. Once resolved, later calls return the same
    /// result. If the agent drops its reporter without reporting, the
    /// execution resolves as interrupted.
    pub async fn wait(&mut self) -> AgentExecutionResult {
        if let Some(result) = &self.finished {
            return result.clone();
        }

        let result = match (&mut self.result).await {
            Ok(result) => result,
            Err(_) => AgentExecutionResult::interrupted(
                self.execution_id.clone(),
                self.started_at,
                "Execution ended without reporting a result",
            ),
        };
        self.running.store(false, Ordering::SeqCst);
        self.finished = Some(result.clone());
        result
    }
}

impl ExecutionReporter {
    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Token fired when the engine interrupts the execution.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Reports the final result and marks the execution as no longer running.
    pub fn finish(self, result: AgentExecutionResult) {
        self.running.store(false, Ordering::SeqCst);
        // The engine may have stopped waiting; a closed channel is fine.
        let _ = self.sender.send(result);
    }
}

/// A coding-assistant CLI driven by the engine.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Identifier the agent is configured under (e.g. "claude").
    fn id(&self) -> &str;

    /// Whether the agent reports subagent lifecycle through `on_subagent`.
    fn supports_subagent_tracing(&self) -> bool {
        false
    }

    /// Checks whether the CLI is installed and usable.
    async fn detect(&self) -> DetectResult;

    /// Applies configuration before the first execution.
    async fn initialize(&self, config: &AgentConfig) -> Result<(), AgentError>;

    /// Starts an execution and returns its handle without waiting for it.
    async fn execute(
        &self,
        prompt: &str,
        files: &[AgentFile],
        options: ExecuteOptions,
    ) -> Result<ExecutionHandle, AgentError>;

    /// Verifies the agent can actually answer a prompt.
    ///
    /// The default only checks availability.
    async fn preflight(&self, timeout: Duration) -> PreflightResult {
        let _ = timeout;
        let started = std::time::Instant::now();
        let detected = self.detect().await;
        PreflightResult {
            success: detected.available,
            error: detected.error,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }

    /// Releases resources held by the agent.
    async fn dispose(&self) -> Result<(), AgentError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[tokio::test]
    async fn test_handle_resolves_with_reported_result() {
        let (mut handle, reporter) = ExecutionHandle::channel("exec-1");
        assert!(handle.is_running());

        let started = reporter.started_at();
        reporter.finish(AgentExecutionResult::exited("exec-1", 0, "done", "", started));

        let result = handle.wait().await;
        assert_eq!(result.status, AgentExecutionStatus::Completed);
        assert_eq!(result.stdout, "done");
        assert!(!handle.is_running());

        // Waiting again returns the cached result.
        let again = handle.wait().await;
        assert_eq!(again.execution_id, "exec-1");
    }

    #[tokio::test]
    async fn test_dropped_reporter_resolves_as_interrupted() {
        let (mut handle, reporter) = ExecutionHandle::channel("exec-2");
        drop(reporter);

        let result = handle.wait().await;
        assert_eq!(result.status, AgentExecutionStatus::Interrupted);
        assert!(result.interrupted);
    }

    #[tokio::test]
    async fn test_interrupt_fires_reporter_token() {
        let (handle, reporter) = ExecutionHandle::channel("exec-3");
        let token = reporter.cancel_token();
        assert!(!token.is_cancelled());

        handle.interrupt();
        handle.interrupt();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_wait_is_cancel_safe_under_timeout() {
        let (mut handle, reporter) = ExecutionHandle::channel("exec-4");

        let timed_out = tokio::time::timeout(Duration::from_millis(10), handle.wait()).await;
        assert!(timed_out.is_err(), "nothing reported yet");

        let started = reporter.started_at();
        reporter.finish(AgentExecutionResult::exited("exec-4", 3, "", "boom", started));
        let result = handle.wait().await;
        assert_eq!(result.exit_code, Some(3));
        assert_eq!(result.status, AgentExecutionStatus::Failed);
    }

    #[test]
    fn test_panicking_callback_is_swallowed() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let options = ExecuteOptions {
            on_stdout: Some(Arc::new(|_chunk: &str| panic!("listener bug"))),
            on_stderr: Some(Arc::new(move |chunk: &str| {
                seen_clone.lock().unwrap().push(chunk.to_string());
            })),
            ..ExecuteOptions::default()
        };

        options.emit_stdout("hello");
        options.emit_stderr("warn");
        assert_eq!(*seen.lock().unwrap(), vec!["warn".to_string()]);
    }

    #[test]
    fn test_execution_ids_are_unique() {
        let a = generate_execution_id();
        let b = generate_execution_id();
        assert!(a.starts_with("exec-"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_subagent_info_tracks_completion() {
        let spawned = SubagentEvent {
            id: "sub-1".to_string(),
            status: SubagentStatus::Running,
            agent_type: Some("explore".to_string()),
            description: None,
        };
        let mut info = SubagentInfo::from(&spawned);
        assert!(info.ended_at.is_none());

        info.apply(&SubagentEvent {
            id: "sub-1".to_string(),
            status: SubagentStatus::Completed,
            agent_type: None,
            description: None,
        });
        assert_eq!(info.status, SubagentStatus::Completed);
        assert_eq!(info.agent_type.as_deref(), Some("explore"));
        assert!(info.ended_at.is_some());
    }
}
