//! # backlog-core
//!
//! The execution engine that drives a coding agent through a tracked backlog.
//!
//! This crate provides:
//! - `ExecutionEngine`, the lifecycle state machine and SELECT → BUILD →
//!   EXECUTE → DETECT run loop
//! - `IterationBudget` and `AgentFallbackCoordinator`, the budget and
//!   rate-limit bookkeeping the loop consults
//! - `RateLimitDetector`, the output classifier
//! - File, git and template collaborators (`JsonlTracker`, `MarkdownProgressLog`,
//!   `GitDiffSummarizer`, `TemplatePromptRenderer`, ...)
//! - Configuration types (`EngineConfig`)

pub mod budget;
pub mod config;
pub mod engine;
pub mod fallback;
pub mod git_ops;
pub mod persistence;
pub mod prompt;
pub mod rate_limit;
pub mod testing;
pub mod tracker;

pub use budget::{BudgetChange, IterationBudget, IterationInfo};
pub use config::{
    ConfigError, ConfigWarning, EngineConfig, ErrorHandlingConfig, ErrorStrategy,
    MAX_DIFF_CONTEXT_WINDOW, PathsConfig, RateLimitHandlingConfig,
};
pub use engine::{
    AgentFactory, EngineDeps, EngineError, EngineState, EngineStatus, EventBus, ExecutionEngine,
    Listener, Subscription, TrackerFactory,
};
pub use fallback::{AgentFallbackCoordinator, RateLimitDecision, RecoveryAttempt};
pub use git_ops::{
    AutoCommitResult, AutoCommitter, DiffSummarizer, GitAutoCommitter, GitDiffSummarizer,
    GitOpsError, auto_commit_changes, get_head_sha, has_uncommitted_changes, summarize_changes,
};
pub use persistence::{
    FileIterationLogger, FileSessionStore, IterationLogEntry, IterationLogger,
    MarkdownProgressLog, PersistenceError, ProgressLog, SessionSnapshot, SessionStore,
    format_duration,
};
pub use prompt::{
    DEFAULT_PROMPT_TEMPLATE, PromptContext, PromptError, PromptRenderer, TemplatePromptRenderer,
    format_diff_context,
};
pub use rate_limit::{RateLimitDetection, RateLimitDetector};
pub use tracker::{JsonlTracker, JsonlTrackerFactory};
