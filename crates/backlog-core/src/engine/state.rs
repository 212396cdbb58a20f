//! Engine state snapshots.

use backlog_proto::{IterationResult, StopReason, SubagentInfo, Task};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Engine lifecycle status.
///
/// `idle → running → {pausing → paused → running} → stopping → idle`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineStatus {
    #[default]
    Idle,
    Running,
    /// Pause requested; takes effect at the next iteration boundary.
    Pausing,
    Paused,
    Stopping,
}

impl EngineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineStatus::Idle => "idle",
            EngineStatus::Running => "running",
            EngineStatus::Pausing => "pausing",
            EngineStatus::Paused => "paused",
            EngineStatus::Stopping => "stopping",
        }
    }
}

impl std::fmt::Display for EngineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only view of the engine, returned by `ExecutionEngine::state`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineState {
    pub status: EngineStatus,
    /// Number of the last iteration started (1-indexed, 0 before the first).
    pub current_iteration: u32,
    /// 0 means unlimited.
    pub max_iterations: u32,
    pub tasks_completed: u32,
    pub current_task: Option<Task>,
    /// Append-only iteration history, in execution order.
    pub iterations: Vec<IterationResult>,
    /// Subagents of the current iteration, for agents that report them.
    pub subagents: HashMap<String, SubagentInfo>,
    /// When the current or last run started.
    pub started_at: Option<DateTime<Utc>>,
    pub last_stop_reason: Option<StopReason>,
}

impl EngineState {
    pub fn new(max_iterations: u32) -> Self {
        Self {
            max_iterations,
            ..Self::default()
        }
    }

    /// Iterations that failed or timed out.
    pub fn failed_iterations(&self) -> usize {
        self.iterations
            .iter()
            .filter(|r| r.status.is_failure())
            .count()
    }
}
