//! Per-iteration records.

use crate::agent::AgentExecutionResult;
use crate::diff::DiffSummary;
use crate::task::Task;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Classification of a finished iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IterationStatus {
    Completed,
    Failed,
    Timeout,
    /// Stopped mid-execution by `stop()`.
    Interrupted,
}

impl IterationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IterationStatus::Completed => "completed",
            IterationStatus::Failed => "failed",
            IterationStatus::Timeout => "timeout",
            IterationStatus::Interrupted => "interrupted",
        }
    }

    /// Returns true for statuses handled by the error strategy.
    pub fn is_failure(&self) -> bool {
        matches!(self, IterationStatus::Failed | IterationStatus::Timeout)
    }
}

impl std::fmt::Display for IterationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable record of one SELECT → BUILD → EXECUTE → DETECT pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationResult {
    pub iteration: u32,
    pub status: IterationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<Task>,
    pub task_completed: bool,
    /// Whether the output carried the completion marker, regardless of exit code.
    pub promise_complete: bool,
    pub duration_ms: u64,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    /// Agent that ran the iteration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    /// Absent when the iteration failed before EXECUTE.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_result: Option<AgentExecutionResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff_summary: Option<DiffSummary>,
}
