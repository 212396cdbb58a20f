//! Engine events and the stop/agent snapshot types they carry.
//!
//! `EngineEvent` is a closed sum type: listeners match on the variant, and the
//! serialized form carries the topic name in a `type` field.

use crate::iteration::IterationResult;
use crate::task::Task;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Why the run loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The tracker reports no remaining work.
    Complete,
    /// Nothing is actionable but work remains (e.g. blocked tasks).
    NoTasks,
    /// The iteration budget was consumed.
    MaxIterations,
    /// An unrecoverable failure under the active error strategy.
    Error,
    /// `stop()` was called.
    Interrupted,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::Complete => "complete",
            StopReason::NoTasks => "no_tasks",
            StopReason::MaxIterations => "max_iterations",
            StopReason::Error => "error",
            StopReason::Interrupted => "interrupted",
        }
    }

    /// Returns true if the backlog was drained.
    pub fn is_success(&self) -> bool {
        matches!(self, StopReason::Complete)
    }
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the engine does after a failed iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureAction {
    Abort,
    Skip,
    Retry,
}

/// Why the active agent is the one it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActiveAgentReason {
    Primary,
    Fallback,
}

/// Why the coordinator changed agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwitchReason {
    RateLimit,
    PrimaryRecovery,
}

/// One agent change, kept for iteration log headers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSwitch {
    pub from: String,
    pub to: String,
    pub reason: SwitchReason,
    pub at: DateTime<Utc>,
}

/// Snapshot of the active agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveAgentInfo {
    pub agent: String,
    pub reason: ActiveAgentReason,
    pub since: DateTime<Utc>,
}

/// Snapshot of rate-limit bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitState {
    pub primary_agent: String,
    pub rate_limited_agents: BTreeSet<String>,
    pub active_agent: String,
    pub active_agent_reason: ActiveAgentReason,
}

/// Which stream a chunk of agent output came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Everything the engine tells its listeners.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EngineEvent {
    #[serde(rename = "engine:started")]
    EngineStarted {
        agent: String,
        max_iterations: u32,
        current_iteration: u32,
    },

    #[serde(rename = "engine:stopped")]
    EngineStopped {
        reason: StopReason,
        total_iterations: u32,
        tasks_completed: u32,
    },

    #[serde(rename = "engine:paused")]
    EnginePaused { current_iteration: u32 },

    #[serde(rename = "engine:resumed")]
    EngineResumed { current_iteration: u32 },

    #[serde(rename = "engine:iterations-added")]
    IterationsAdded {
        added: u32,
        previous_max: u32,
        new_max: u32,
        current_iteration: u32,
    },

    #[serde(rename = "engine:iterations-removed")]
    IterationsRemoved {
        removed: u32,
        previous_max: u32,
        new_max: u32,
        current_iteration: u32,
    },

    #[serde(rename = "iteration:started")]
    IterationStarted {
        iteration: u32,
        task: Task,
        agent: String,
    },

    #[serde(rename = "iteration:completed")]
    IterationCompleted { result: IterationResult },

    #[serde(rename = "iteration:failed")]
    IterationFailed {
        iteration: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        task: Option<Task>,
        error: String,
        action: FailureAction,
    },

    #[serde(rename = "iteration:retrying")]
    IterationRetrying {
        iteration: u32,
        task_id: String,
        attempt: u32,
        max_retries: u32,
        delay_ms: u64,
    },

    #[serde(rename = "iteration:skipped")]
    IterationSkipped {
        iteration: u32,
        task_id: String,
        reason: String,
    },

    #[serde(rename = "task:selected")]
    TaskSelected { iteration: u32, task: Task },

    #[serde(rename = "task:completed")]
    TaskCompleted { iteration: u32, task: Task },

    #[serde(rename = "tasks:refreshed")]
    TasksRefreshed { tasks: Vec<Task> },

    #[serde(rename = "agent:output")]
    AgentOutput {
        iteration: u32,
        stream: OutputStream,
        data: String,
    },

    #[serde(rename = "agent:rate-limited")]
    AgentRateLimited {
        iteration: u32,
        agent: String,
        attempt: u32,
        max_retries: u32,
        backoff_ms: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    #[serde(rename = "agent:switched")]
    AgentSwitched {
        from: String,
        to: String,
        reason: SwitchReason,
    },

    #[serde(rename = "agent:recovery-attempted")]
    AgentRecoveryAttempted { primary: String, fallback: String },

    #[serde(rename = "agent:all-limited")]
    AgentAllLimited { tried_agents: Vec<String> },

    #[serde(rename = "all:complete")]
    AllComplete {
        tasks_completed: u32,
        total_iterations: u32,
    },
}

impl EngineEvent {
    /// Topic name of the event, as it appears in the serialized `type` field.
    pub fn topic(&self) -> &'static str {
        match self {
            EngineEvent::EngineStarted { .. } => "engine:started",
            EngineEvent::EngineStopped { .. } => "engine:stopped",
            EngineEvent::EnginePaused { .. } => "engine:paused",
            EngineEvent::EngineResumed { .. } => "engine:resumed",
            EngineEvent::IterationsAdded { .. } => "engine:iterations-added",
            EngineEvent::IterationsRemoved { .. } => "engine:iterations-removed",
            EngineEvent::IterationStarted { .. } => "iteration:started",
            EngineEvent::IterationCompleted { .. } => "iteration:completed",
            EngineEvent::IterationFailed { .. } => "iteration:failed",
            EngineEvent::IterationRetrying { .. } => "iteration:retrying",
            EngineEvent::IterationSkipped { .. } => "iteration:skipped",
            EngineEvent::TaskSelected { .. } => "task:selected",
            EngineEvent::TaskCompleted { .. } => "task:completed",
            EngineEvent::TasksRefreshed { .. } => "tasks:refreshed",
            EngineEvent::AgentOutput { .. } => "agent:output",
            EngineEvent::AgentRateLimited { .. } => "agent:rate-limited",
            EngineEvent::AgentSwitched { .. } => "agent:switched",
            EngineEvent::AgentRecoveryAttempted { .. } => "agent:recovery-attempted",
            EngineEvent::AgentAllLimited { .. } => "agent:all-limited",
            EngineEvent::AllComplete { .. } => "all:complete",
        }
    }

    /// Returns true for `iteration:*` events.
    pub fn is_iteration_event(&self) -> bool {
        self.topic().starts_with("iteration:")
    }
}
