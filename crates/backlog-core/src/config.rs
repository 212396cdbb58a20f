//! Configuration types for the backlog engine.
//!
//! Every field has a default, so an empty YAML document is a valid config:
//!
//! ```yaml
//! agent: claude
//! fallback_agents: [codex]
//! max_iterations: 20
//! error_handling:
//!   strategy: retry
//!   max_retries: 2
//! ```

use backlog_proto::AgentConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Primary agent id.
    #[serde(default = "default_agent")]
    pub agent: String,

    /// Agents tried in order when the primary is rate-limited.
    #[serde(default)]
    pub fallback_agents: Vec<String>,

    /// Per-agent settings keyed by agent id.
    #[serde(default)]
    pub agents: HashMap<String, AgentConfig>,

    /// Iteration budget. 0 means unlimited.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Pause between iterations.
    #[serde(default)]
    pub iteration_delay_ms: u64,

    /// How long EXECUTE waits for the agent. 0 disables the timeout.
    #[serde(default = "default_iteration_timeout")]
    pub iteration_timeout_secs: u64,

    /// Text the agent prints when it considers the task done.
    #[serde(default = "default_completion_marker")]
    pub completion_marker: String,

    /// Commit the working tree after each completed task.
    #[serde(default)]
    pub auto_commit: bool,

    #[serde(default = "default_workspace_root")]
    pub workspace_root: PathBuf,

    /// Number of recent diff summaries fed back into prompts.
    #[serde(default = "default_diff_context_window")]
    pub diff_context_window: usize,

    /// Number of progress log entries fed back into prompts.
    #[serde(default = "default_progress_summary_entries")]
    pub progress_summary_entries: usize,

    /// Restrict task selection to children of this epic.
    #[serde(default)]
    pub epic_id: Option<String>,

    /// Inline prompt template; the embedded default is used when unset.
    #[serde(default)]
    pub prompt_template: Option<String>,

    #[serde(default)]
    pub error_handling: ErrorHandlingConfig,

    #[serde(default)]
    pub rate_limit_handling: RateLimitHandlingConfig,

    #[serde(default)]
    pub paths: PathsConfig,

    /// Run the agent preflight during `initialize()`.
    #[serde(default)]
    pub preflight_on_initialize: bool,
}

fn default_agent() -> String {
    "claude".to_string()
}

fn default_max_iterations() -> u32 {
    10
}

fn default_iteration_timeout() -> u64 {
    1800 // 30 minutes
}

fn default_completion_marker() -> String {
    "<promise>COMPLETE</promise>".to_string()
}

fn default_workspace_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_diff_context_window() -> usize {
    5
}

fn default_progress_summary_entries() -> usize {
    5
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            agent: default_agent(),
            fallback_agents: Vec::new(),
            agents: HashMap::new(),
            max_iterations: default_max_iterations(),
            iteration_delay_ms: 0,
            iteration_timeout_secs: default_iteration_timeout(),
            completion_marker: default_completion_marker(),
            auto_commit: false,
            workspace_root: default_workspace_root(),
            diff_context_window: default_diff_context_window(),
            progress_summary_entries: default_progress_summary_entries(),
            epic_id: None,
            prompt_template: None,
            error_handling: ErrorHandlingConfig::default(),
            rate_limit_handling: RateLimitHandlingConfig::default(),
            paths: PathsConfig::default(),
            preflight_on_initialize: false,
        }
    }
}

impl EngineConfig {
    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        debug!(path = %path_ref.display(), "Loading configuration from file");
        let content = std::fs::read_to_string(path_ref)?;
        Self::parse_yaml(&content)
    }

    /// Parses configuration from a YAML string.
    pub fn parse_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(content)?;
        debug!(
            agent = %config.agent,
            fallbacks = config.fallback_agents.len(),
            max_iterations = config.max_iterations,
            "Configuration loaded"
        );
        Ok(config)
    }

    /// Checks for hard errors and returns soft warnings.
    pub fn validate(&self) -> Result<Vec<ConfigWarning>, ConfigError> {
        let mut warnings = Vec::new();

        if self.agent.trim().is_empty() {
            return Err(ConfigError::MissingAgent);
        }

        let mut seen = vec![self.agent.as_str()];
        for fallback in &self.fallback_agents {
            if seen.contains(&fallback.as_str()) {
                return Err(ConfigError::DuplicateAgent {
                    agent: fallback.clone(),
                });
            }
            seen.push(fallback.as_str());
        }

        if self.error_handling.strategy == ErrorStrategy::Retry
            && self.error_handling.max_retries == 0
        {
            warnings.push(ConfigWarning::InvalidValue {
                field: "error_handling.max_retries".to_string(),
                message: "retry strategy with max_retries 0 behaves like skip".to_string(),
            });
        }

        if self.diff_context_window > MAX_DIFF_CONTEXT_WINDOW {
            warnings.push(ConfigWarning::InvalidValue {
                field: "diff_context_window".to_string(),
                message: format!("capped at {MAX_DIFF_CONTEXT_WINDOW}"),
            });
        }

        if self.auto_commit && !self.workspace_root.join(".git").exists() {
            warnings.push(ConfigWarning::InvalidValue {
                field: "auto_commit".to_string(),
                message: "workspace_root does not look like a git repository".to_string(),
            });
        }

        Ok(warnings)
    }

    /// Primary agent followed by fallbacks, in trial order.
    pub fn configured_agents(&self) -> Vec<String> {
        std::iter::once(self.agent.clone())
            .chain(self.fallback_agents.iter().cloned())
            .collect()
    }

    /// Settings for an agent, defaulting when none are configured.
    pub fn agent_config(&self, agent_id: &str) -> AgentConfig {
        let mut config = self.agents.get(agent_id).cloned().unwrap_or_default();
        if config.working_dir.is_none() {
            config.working_dir = Some(self.workspace_root.clone());
        }
        config
    }

    /// EXECUTE timeout, if any.
    pub fn iteration_timeout(&self) -> Option<Duration> {
        (self.iteration_timeout_secs > 0).then(|| Duration::from_secs(self.iteration_timeout_secs))
    }

    /// Diff context window clamped to its cap.
    pub fn effective_diff_window(&self) -> usize {
        self.diff_context_window.min(MAX_DIFF_CONTEXT_WINDOW)
    }

    /// Resolves a configured path against the workspace root.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.workspace_root.join(path)
        }
    }
}

/// Upper bound on the diff context window.
pub const MAX_DIFF_CONTEXT_WINDOW: usize = 5;

/// What to do with a failed or timed-out iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorStrategy {
    /// Stop the run loop with reason `error`.
    Abort,
    /// Leave the task and move on.
    #[default]
    Skip,
    /// Re-attempt the same task before skipping it.
    Retry,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorHandlingConfig {
    #[serde(default)]
    pub strategy: ErrorStrategy,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    5000
}

impl Default for ErrorHandlingConfig {
    fn default() -> Self {
        Self {
            strategy: ErrorStrategy::default(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

impl ErrorHandlingConfig {
    /// Strategy after normalization: `retry` with no retries is `skip`.
    pub fn effective_strategy(&self) -> ErrorStrategy {
        match self.strategy {
            ErrorStrategy::Retry if self.max_retries == 0 => ErrorStrategy::Skip,
            other => other,
        }
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitHandlingConfig {
    /// When false, rate limits are ordinary failures.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Retries against the same agent before switching.
    #[serde(default = "default_rate_limit_retries")]
    pub max_retries: u32,

    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,

    /// Try the primary again at the start of each iteration while on a fallback.
    #[serde(default = "default_true")]
    pub recover_primary_between_iterations: bool,

    /// Sleep after every agent has been rate-limited. 0 retries immediately.
    #[serde(default)]
    pub all_limited_cooldown_ms: u64,
}

fn default_true() -> bool {
    true
}

fn default_rate_limit_retries() -> u32 {
    3
}

fn default_base_backoff_ms() -> u64 {
    5000
}

impl Default for RateLimitHandlingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: default_rate_limit_retries(),
            base_backoff_ms: default_base_backoff_ms(),
            recover_primary_between_iterations: true,
            all_limited_cooldown_ms: 0,
        }
    }
}

/// Locations of persisted state, relative to `workspace_root` unless absolute.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    #[serde(default = "default_session_file")]
    pub session_file: PathBuf,

    #[serde(default = "default_iterations_dir")]
    pub iterations_dir: PathBuf,

    #[serde(default = "default_progress_file")]
    pub progress_file: PathBuf,

    #[serde(default = "default_tasks_file")]
    pub tasks_file: PathBuf,
}

fn default_session_file() -> PathBuf {
    PathBuf::from(".backlog/session.json")
}

fn default_iterations_dir() -> PathBuf {
    PathBuf::from(".backlog/iterations")
}

fn default_progress_file() -> PathBuf {
    PathBuf::from(".backlog/progress.md")
}

fn default_tasks_file() -> PathBuf {
    PathBuf::from(".backlog/tasks.jsonl")
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            session_file: default_session_file(),
            iterations_dir: default_iterations_dir(),
            progress_file: default_progress_file(),
            tasks_file: default_tasks_file(),
        }
    }
}

/// Configuration warnings emitted during validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    /// Field has a questionable value that was normalized.
    InvalidValue { field: String, message: String },
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigWarning::InvalidValue { field, message } => {
                write!(f, "Warning [{field}]: {message}")
            }
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("No primary agent configured - set 'agent' in config")]
    MissingAgent,

    #[error("Agent '{agent}' is listed more than once across 'agent' and 'fallback_agents'")]
    DuplicateAgent { agent: String },
}
