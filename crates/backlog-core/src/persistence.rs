//! Session, iteration-log and progress-log persistence.
//!
//! The engine treats all of these as fire-and-forget: a write failure is
//! logged and never fails an iteration.

use crate::engine::EngineStatus;
use async_trait::async_trait;
use backlog_proto::{AgentSwitch, IterationResult, StopReason};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Session state written after every status change and iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub status: EngineStatus,
    pub current_iteration: u32,
    pub max_iterations: u32,
    pub tasks_completed: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_task_id: Option<String>,
    pub active_agent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn save(&self, snapshot: &SessionSnapshot) -> Result<(), PersistenceError>;
}

/// Everything written to one iteration log file.
#[derive(Debug, Clone)]
pub struct IterationLogEntry {
    pub result: IterationResult,
    pub agent: String,
    pub model: Option<String>,
    pub sandbox: Option<String>,
    pub agent_switches: Vec<AgentSwitch>,
}

#[async_trait]
pub trait IterationLogger: Send + Sync {
    /// Writes the log and returns where it went.
    async fn log_iteration(&self, entry: &IterationLogEntry) -> Result<PathBuf, PersistenceError>;
}

/// Cross-iteration memory fed back into prompts.
#[async_trait]
pub trait ProgressLog: Send + Sync {
    async fn append(&self, result: &IterationResult) -> Result<(), PersistenceError>;

    /// The last `n` entries, oldest first, or `None` if there are none.
    async fn recent(&self, n: usize) -> Result<Option<String>, PersistenceError>;

    /// Body of the `## Codebase Patterns` section, if present and non-empty.
    async fn codebase_patterns(&self) -> Result<Option<String>, PersistenceError>;
}

async fn ensure_parent(path: &Path) -> Result<(), PersistenceError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent).await?;
    }
    Ok(())
}

/// [`SessionStore`] writing pretty JSON to a single file.
#[derive(Debug, Clone)]
pub struct FileSessionStore {
    path: PathBuf,
}

impl FileSessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the last saved snapshot, if any.
    pub async fn load(&self) -> Result<Option<SessionSnapshot>, PersistenceError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn save(&self, snapshot: &SessionSnapshot) -> Result<(), PersistenceError> {
        ensure_parent(&self.path).await?;
        let json = serde_json::to_string_pretty(snapshot)?;

        // Write-then-rename so readers never see a torn file.
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

/// [`IterationLogger`] writing one file per iteration.
#[derive(Debug, Clone)]
pub struct FileIterationLogger {
    dir: PathBuf,
}

impl FileIterationLogger {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn file_name(result: &IterationResult) -> String {
        let task = result.task.as_ref().map_or_else(
            || "no-task".to_string(),
            |t| {
                t.id.chars()
                    .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
                    .collect()
            },
        );
        format!("iteration-{:03}-{}.log", result.iteration, task)
    }
}

#[async_trait]
impl IterationLogger for FileIterationLogger {
    async fn log_iteration(&self, entry: &IterationLogEntry) -> Result<PathBuf, PersistenceError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.dir.join(Self::file_name(&entry.result));
        tokio::fs::write(&path, render_iteration_log(entry)).await?;
        Ok(path)
    }
}

/// Metadata header followed by the captured output.
pub fn render_iteration_log(entry: &IterationLogEntry) -> String {
    let result = &entry.result;
    let mut content = String::new();

    content.push_str(&format!("# Iteration {}\n\n", result.iteration));
    if let Some(task) = &result.task {
        content.push_str(&format!("**Task:** {} - {}\n", task.id, task.title));
    }
    content.push_str(&format!("**Agent:** {}\n", entry.agent));
    content.push_str(&format!(
        "**Model:** {}\n",
        entry.model.as_deref().unwrap_or("default")
    ));
    content.push_str(&format!(
        "**Sandbox:** {}\n",
        entry.sandbox.as_deref().unwrap_or("none")
    ));
    content.push_str(&format!("**Status:** {}\n", result.status));
    content.push_str(&format!(
        "**Task completed:** {}\n",
        if result.task_completed { "Yes" } else { "No" }
    ));
    content.push_str(&format!(
        "**Completion marker:** {}\n",
        if result.promise_complete {
            "Detected"
        } else {
            "Not detected"
        }
    ));
    content.push_str(&format!("**Started:** {}\n", result.started_at.to_rfc3339()));
    content.push_str(&format!("**Ended:** {}\n", result.ended_at.to_rfc3339()));
    content.push_str(&format!(
        "**Duration:** {}\n",
        format_duration(Duration::from_millis(result.duration_ms))
    ));
    if let Some(error) = &result.error {
        content.push_str(&format!("**Error:** {error}\n"));
    }
    if let Some(diff) = &result.diff_summary {
        content.push_str(&format!("**Changes:** {}\n", diff.summary));
    }

    if !entry.agent_switches.is_empty() {
        content.push_str("\n## Agent Switches\n\n");
        for switch in &entry.agent_switches {
            content.push_str(&format!(
                "- {} {} -> {} ({})\n",
                switch.at.to_rfc3339(),
                switch.from,
                switch.to,
                match switch.reason {
                    backlog_proto::SwitchReason::RateLimit => "rate limit",
                    backlog_proto::SwitchReason::PrimaryRecovery => "primary recovery",
                }
            ));
        }
    }

    if let Some(agent_result) = &result.agent_result {
        content.push_str("\n## Stdout\n\n```\n");
        content.push_str(&agent_result.stdout);
        if !agent_result.stdout.ends_with('\n') {
            content.push('\n');
        }
        content.push_str("```\n");

        if !agent_result.stderr.is_empty() {
            content.push_str("\n## Stderr\n\n```\n");
            content.push_str(&agent_result.stderr);
            if !agent_result.stderr.ends_with('\n') {
                content.push('\n');
            }
            content.push_str("```\n");
        }
    }

    content
}

const PATTERNS_HEADING: &str = "## Codebase Patterns";
const ENTRY_PREFIX: &str = "## [";

/// [`ProgressLog`] over a markdown file.
///
/// Entries are `## [timestamp] Iteration N: ...` blocks appended at the end.
/// Agents and humans may curate a `## Codebase Patterns` section anywhere in
/// the file.
#[derive(Debug)]
pub struct MarkdownProgressLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl MarkdownProgressLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&self) -> Result<String, PersistenceError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e.into()),
        }
    }
}

fn render_progress_entry(result: &IterationResult) -> String {
    let mut entry = String::new();
    let task = result
        .task
        .as_ref()
        .map_or_else(|| "(no task)".to_string(), |t| format!("{} - {}", t.id, t.title));
    entry.push_str(&format!(
        "{ENTRY_PREFIX}{}] Iteration {}: {task}\n",
        result.ended_at.format("%Y-%m-%d %H:%M:%S"),
        result.iteration
    ));
    entry.push_str(&format!(
        "- Status: {}{}\n",
        result.status,
        if result.task_completed {
            " (task completed)"
        } else {
            ""
        }
    ));
    if let Some(agent) = &result.agent {
        entry.push_str(&format!("- Agent: {agent}\n"));
    }
    if let Some(diff) = &result.diff_summary {
        entry.push_str(&format!("- Changes: {}\n", diff.summary));
    }
    if let Some(error) = &result.error {
        entry.push_str(&format!("- Error: {error}\n"));
    }
    entry
}

/// Splits the log into entry blocks, skipping the patterns section.
fn progress_entries(content: &str) -> Vec<String> {
    let mut entries = Vec::new();
    let mut current: Option<String> = None;

    for line in content.lines() {
        if line.starts_with("## ") {
            if let Some(done) = current.take() {
                entries.push(done.trim_end().to_string());
            }
            if line.starts_with(ENTRY_PREFIX) {
                current = Some(format!("{line}\n"));
            }
            continue;
        }
        if let Some(block) = current.as_mut() {
            block.push_str(line);
            block.push('\n');
        }
    }
    if let Some(done) = current {
        entries.push(done.trim_end().to_string());
    }
    entries
}

fn patterns_section(content: &str) -> Option<String> {
    let start = content.find(PATTERNS_HEADING)? + PATTERNS_HEADING.len();
    let rest = &content[start..];
    let end = rest
        .find("\n## ")
        .into_iter()
        .chain(rest.find("\n---"))
        .min()
        .unwrap_or(rest.len());
    let body = rest[..end].trim();
    (!body.is_empty()).then(|| body.to_string())
}

#[async_trait]
impl ProgressLog for MarkdownProgressLog {
    async fn append(&self, result: &IterationResult) -> Result<(), PersistenceError> {
        let _guard = self.write_lock.lock().await;
        ensure_parent(&self.path).await?;

        let exists = tokio::fs::try_exists(&self.path).await?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;

        let mut text = String::new();
        if !exists {
            text.push_str("# Progress Log\n\n");
            text.push_str(PATTERNS_HEADING);
            text.push_str("\n\n---\n\n");
        }
        text.push_str(&render_progress_entry(result));
        text.push('\n');

        // Single write so concurrent readers never see a partial entry.
        file.write_all(text.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn recent(&self, n: usize) -> Result<Option<String>, PersistenceError> {
        if n == 0 {
            return Ok(None);
        }
        let entries = progress_entries(&self.read().await?);
        let start = entries.len().saturating_sub(n);
        let recent = &entries[start..];
        Ok((!recent.is_empty()).then(|| recent.join("\n\n")))
    }

    async fn codebase_patterns(&self) -> Result<Option<String>, PersistenceError> {
        Ok(patterns_section(&self.read().await?))
    }
}

/// Formats a duration as human-readable string (e.g., "23m 45s" or "1h 5m 30s").
pub fn format_duration(d: Duration) -> String {
    let total_secs = d.as_secs();
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}
