//! # backlog-proto
//!
//! Contracts shared by the backlog engine and its collaborators.
//!
//! This crate provides:
//! - The task model (`Task`, `TaskStatus`, `TaskFilter`)
//! - The `Tracker` and `Agent` traits the engine consumes
//! - `ExecutionHandle`, the cancellable handle to an in-flight agent run
//! - `EngineEvent`, the closed set of events the engine emits

mod agent;
mod diff;
mod event;
mod iteration;
mod task;
mod tracker;

pub use agent::{
    Agent, AgentConfig, AgentError, AgentExecutionResult, AgentExecutionStatus, AgentFile,
    DetectResult, EndCallback, ExecuteOptions, ExecutionHandle, ExecutionReporter,
    OutputCallback, PreflightResult, PromptMode, StartCallback, SubagentCallback, SubagentEvent,
    SubagentInfo, SubagentStatus, generate_execution_id,
};
pub use diff::DiffSummary;
pub use event::{
    ActiveAgentInfo, ActiveAgentReason, AgentSwitch, EngineEvent, FailureAction, OutputStream,
    RateLimitState, StopReason, SwitchReason,
};
pub use iteration::{IterationResult, IterationStatus};
pub use task::{SyncResult, Task, TaskCompletionResult, TaskFilter, TaskStatus};
pub use tracker::{Tracker, TrackerError};
