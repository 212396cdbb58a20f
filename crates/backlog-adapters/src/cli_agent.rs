//! `Agent` implementation that runs a CLI backend as a subprocess.
//!
//! Each execution spawns the backend with piped stdio. Output is read line by
//! line on reader tasks and forwarded to the execution callbacks as it
//! arrives. A supervisor task waits for the process, the cancellation token
//! or the per-execution timeout, whichever comes first, kills the process
//! when it did not exit on its own, and reports the result.

use crate::cli_backend::{BackendError, CliBackend, OutputFormat};
use crate::stream_json::SubagentParser;
use async_trait::async_trait;
use backlog_core::{AgentFactory, EngineConfig};
use backlog_proto::{
    Agent, AgentConfig, AgentError, AgentExecutionResult, AgentExecutionStatus, AgentFile,
    DetectResult, ExecuteOptions, ExecutionHandle, ExecutionReporter, PreflightResult,
    generate_execution_id,
};
use std::borrow::Cow;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tempfile::NamedTempFile;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const DETECT_TIMEOUT: Duration = Duration::from_secs(10);

/// How long reader tasks may keep draining after the process is gone.
///
/// Background descendants can hold the pipes open indefinitely.
const READER_GRACE: Duration = Duration::from_secs(2);

/// Prompt sent by [`CliAgent::preflight`].
pub const PREFLIGHT_PROMPT: &str = "Reply with the single word OK and nothing else.";

impl From<BackendError> for AgentError {
    fn from(err: BackendError) -> Self {
        match &err {
            BackendError::UnknownAgent(id) => AgentError::Unavailable(id.clone(), err.to_string()),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone)]
struct Settings {
    backend: CliBackend,
    env: HashMap<String, String>,
    working_dir: Option<PathBuf>,
}

impl Settings {
    fn new(backend: CliBackend, config: &AgentConfig) -> Self {
        Self {
            backend,
            env: config.env.clone(),
            working_dir: config.working_dir.clone(),
        }
    }

    fn command(&self, program: &str) -> Command {
        let mut cmd = Command::new(program);
        cmd.envs(&self.env).kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

/// A coding-assistant CLI run as a subprocess.
#[derive(Debug)]
pub struct CliAgent {
    id: String,
    settings: Mutex<Settings>,
    initialized: AtomicBool,
}

impl CliAgent {
    /// Creates an agent whose backend is resolved from `config`.
    pub fn new(id: impl Into<String>, config: &AgentConfig) -> Result<Self, BackendError> {
        let id = id.into();
        let backend = CliBackend::from_agent_config(&id, config)?;
        Ok(Self::with_settings(id, Settings::new(backend, config)))
    }

    /// Creates an agent around an explicit backend.
    pub fn with_backend(id: impl Into<String>, backend: CliBackend) -> Self {
        Self::with_settings(id.into(), Settings::new(backend, &AgentConfig::default()))
    }

    fn with_settings(id: String, settings: Settings) -> Self {
        Self {
            id,
            settings: Mutex::new(settings),
            initialized: AtomicBool::new(false),
        }
    }

    /// The backend this agent currently runs.
    pub fn backend(&self) -> CliBackend {
        lock(&self.settings).backend.clone()
    }

    fn settings(&self) -> Settings {
        lock(&self.settings).clone()
    }
}

#[async_trait]
impl Agent for CliAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn supports_subagent_tracing(&self) -> bool {
        lock(&self.settings).backend.output_format == OutputFormat::StreamJson
    }

    async fn detect(&self) -> DetectResult {
        let settings = self.settings();
        let program = settings.backend.command.clone();
        let mut cmd = settings.command(&program);
        cmd.arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        match tokio::time::timeout(DETECT_TIMEOUT, cmd.output()).await {
            Err(_) => DetectResult::unavailable(format!("`{program} --version` timed out")),
            Ok(Err(e)) => DetectResult::unavailable(format!("Failed to run `{program}`: {e}")),
            Ok(Ok(output)) if output.status.success() => {
                let version = String::from_utf8_lossy(&output.stdout)
                    .lines()
                    .map(str::trim)
                    .find(|line| !line.is_empty())
                    .map(str::to_string);
                debug!(agent = %self.id, version = ?version, "Detected agent CLI");
                DetectResult::available(version)
            }
            Ok(Ok(output)) => DetectResult::unavailable(format!(
                "`{program} --version` failed ({}): {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )),
        }
    }

    async fn initialize(&self, config: &AgentConfig) -> Result<(), AgentError> {
        let backend = CliBackend::from_agent_config(&self.id, config)?;
        *lock(&self.settings) = Settings::new(backend, config);
        self.initialized.store(true, Ordering::SeqCst);
        debug!(agent = %self.id, model = ?config.model, "Agent initialized");
        Ok(())
    }

    async fn execute(
        &self,
        prompt: &str,
        files: &[AgentFile],
        options: ExecuteOptions,
    ) -> Result<ExecutionHandle, AgentError> {
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(AgentError::NotInitialized(self.id.clone()));
        }

        let settings = self.settings();
        let prompt = with_files(prompt, files);
        let built = settings.backend.build_command(&prompt);

        let mut cmd = settings.command(&built.command);
        if let Some(dir) = &options.working_dir {
            cmd.current_dir(dir);
        }
        cmd.args(&built.args)
            .stdin(if built.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let child = cmd.spawn()?;
        let (handle, reporter) = ExecutionHandle::channel(generate_execution_id());
        info!(
            agent = %self.id,
            execution_id = %handle.execution_id(),
            pid = ?child.id(),
            "Agent process started"
        );
        options.emit_start(handle.execution_id());

        let run = Run {
            agent: self.id.clone(),
            stdin: built.stdin,
            prompt_file: built.prompt_file,
            stream_json: settings.backend.output_format == OutputFormat::StreamJson,
            options,
        };
        tokio::spawn(run.supervise(child, reporter));
        Ok(handle)
    }

    /// Sends [`PREFLIGHT_PROMPT`] and expects a clean exit within `timeout`.
    async fn preflight(&self, timeout: Duration) -> PreflightResult {
        let started = Instant::now();
        let options = ExecuteOptions {
            timeout: Some(timeout),
            ..ExecuteOptions::default()
        };

        let outcome = match self.execute(PREFLIGHT_PROMPT, &[], options).await {
            Err(e) => Err(e.to_string()),
            Ok(mut handle) => {
                let result = handle.wait().await;
                if result.status == AgentExecutionStatus::Completed {
                    Ok(())
                } else {
                    Err(result.error.unwrap_or_else(|| {
                        format!("Preflight exited with code {}", result.exit_code.unwrap_or(-1))
                    }))
                }
            }
        };

        PreflightResult {
            success: outcome.is_ok(),
            error: outcome.err(),
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }

    async fn dispose(&self) -> Result<(), AgentError> {
        self.initialized.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// Appends attached files to the prompt.
fn with_files<'a>(prompt: &'a str, files: &[AgentFile]) -> Cow<'a, str> {
    if files.is_empty() {
        return Cow::Borrowed(prompt);
    }

    let mut out = String::from(prompt);
    out.push_str("\n\n## Attached Files\n");
    for file in files {
        out.push_str(&format!("\n### {}\n", file.path.display()));
        if let Some(content) = &file.content {
            out.push_str("```\n");
            out.push_str(content);
            if !content.ends_with('\n') {
                out.push('\n');
            }
            out.push_str("```\n");
        }
    }
    Cow::Owned(out)
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

enum Ending {
    Exited(std::io::Result<ExitStatus>),
    Cancelled,
    TimedOut(Duration),
}

/// State owned by one execution's supervisor task.
struct Run {
    agent: String,
    stdin: Option<String>,
    prompt_file: Option<NamedTempFile>,
    stream_json: bool,
    options: ExecuteOptions,
}

impl Run {
    async fn supervise(self, mut child: Child, reporter: ExecutionReporter) {
        let Run {
            agent,
            stdin,
            prompt_file,
            stream_json,
            options,
        } = self;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            // Written off the supervisor so a child that never reads cannot stall it.
            tokio::spawn(async move {
                if let Err(e) = pipe.write_all(input.as_bytes()).await {
                    debug!(error = %e, "Agent closed stdin before reading the prompt");
                }
                let _ = pipe.shutdown().await;
            });
        }

        let stdout = child.stdout.take().map(|pipe| {
            let parser = stream_json.then(SubagentParser::new);
            Reader::spawn(pipe, Stream::Stdout, options.clone(), parser)
        });
        let stderr = child
            .stderr
            .take()
            .map(|pipe| Reader::spawn(pipe, Stream::Stderr, options.clone(), None));

        let cancel = reporter.cancel_token();
        let ending = tokio::select! {
            status = child.wait() => Ending::Exited(status),
            () = cancel.cancelled() => Ending::Cancelled,
            after = sleep_for(options.timeout) => Ending::TimedOut(after),
        };

        if !matches!(ending, Ending::Exited(_)) {
            if let Err(e) = child.kill().await {
                warn!(agent = %agent, error = %e, "Failed to kill agent process");
            }
        }

        let stdout = match stdout {
            Some(reader) => reader.finish().await,
            None => String::new(),
        };
        let stderr = match stderr {
            Some(reader) => reader.finish().await,
            None => String::new(),
        };
        drop(prompt_file);

        let execution_id = reporter.execution_id().to_string();
        let started_at = reporter.started_at();
        let result = match ending {
            Ending::Exited(Ok(status)) => AgentExecutionResult::exited(
                execution_id,
                status.code().unwrap_or(-1),
                stdout,
                stderr,
                started_at,
            ),
            Ending::Exited(Err(e)) => {
                let mut result =
                    AgentExecutionResult::exited(execution_id, -1, stdout, stderr, started_at);
                result.error = Some(format!("Failed to wait for agent process: {e}"));
                result
            }
            Ending::Cancelled => {
                AgentExecutionResult::interrupted(execution_id, started_at, "Execution interrupted")
                    .with_output(stdout, stderr)
            }
            Ending::TimedOut(after) => AgentExecutionResult::interrupted(
                execution_id,
                started_at,
                "Execution timed out",
            )
            .with_output(stdout, stderr)
            .into_timeout(after),
        };

        info!(
            agent = %agent,
            execution_id = %result.execution_id,
            status = ?result.status,
            exit_code = ?result.exit_code,
            duration_ms = result.duration_ms,
            "Agent process finished"
        );
        options.emit_end(&result);
        reporter.finish(result);
    }
}

/// Resolves after `timeout`, or never.
async fn sleep_for(timeout: Option<Duration>) -> Duration {
    match timeout {
        Some(after) => {
            tokio::time::sleep(after).await;
            after
        }
        None => std::future::pending().await,
    }
}

/// Drains one output pipe into a shared buffer.
struct Reader {
    buffer: Arc<Mutex<String>>,
    task: JoinHandle<()>,
}

impl Reader {
    fn spawn<R>(
        pipe: R,
        stream: Stream,
        options: ExecuteOptions,
        mut parser: Option<SubagentParser>,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buffer = Arc::new(Mutex::new(String::new()));
        let sink = Arc::clone(&buffer);

        let task = tokio::spawn(async move {
            let mut reader = BufReader::new(pipe);
            let mut line = Vec::new();
            loop {
                line.clear();
                match reader.read_until(b'\n', &mut line).await {
                    Ok(0) => break,
                    Ok(_) => {
                        let chunk = String::from_utf8_lossy(&line);
                        lock(&sink).push_str(&chunk);
                        match stream {
                            Stream::Stdout => options.emit_stdout(&chunk),
                            Stream::Stderr => options.emit_stderr(&chunk),
                        }
                        if let Some(parser) = parser.as_mut() {
                            for event in parser.parse_line(&chunk) {
                                options.emit_subagent(&event);
                            }
                        }
                    }
                    Err(e) => {
                        debug!(stream = ?stream, error = %e, "Stopped reading agent output");
                        break;
                    }
                }
            }
        });

        Self { buffer, task }
    }

    async fn finish(mut self) -> String {
        if tokio::time::timeout(READER_GRACE, &mut self.task).await.is_err() {
            debug!("Agent output still open after exit; abandoning reader");
            self.task.abort();
        }
        std::mem::take(&mut *lock(&self.buffer))
    }
}

/// Builds [`CliAgent`]s from per-agent settings.
#[derive(Debug, Default, Clone)]
pub struct CliAgentFactory {
    configs: HashMap<String, AgentConfig>,
}

impl CliAgentFactory {
    /// A factory that knows only the built-in presets.
    pub fn new() -> Self {
        Self::default()
    }

    /// A factory for every agent `config` mentions.
    pub fn from_config(config: &EngineConfig) -> Self {
        let configs = config
            .configured_agents()
            .into_iter()
            .chain(config.agents.keys().cloned())
            .map(|id| {
                let settings = config.agent_config(&id);
                (id, settings)
            })
            .collect();
        Self { configs }
    }

    pub fn with_agent(mut self, id: impl Into<String>, config: AgentConfig) -> Self {
        self.configs.insert(id.into(), config);
        self
    }
}

#[async_trait]
impl AgentFactory for CliAgentFactory {
    async fn create(&self, agent_id: &str) -> Result<Arc<dyn Agent>, AgentError> {
        let config = self.configs.get(agent_id).cloned().unwrap_or_default();
        let agent = CliAgent::new(agent_id, &config)?;
        Ok(Arc::new(agent))
    }
}
