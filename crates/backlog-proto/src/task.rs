//! Task model shared between the engine and trackers.
//!
//! Tasks are owned by a tracker. The engine only reads them and asks the
//! tracker to change their status.

use serde::{Deserialize, Serialize};

/// Status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Not started
    Open,
    /// Being worked on
    InProgress,
    /// Done
    Completed,
    /// Waiting on something outside the backlog
    Blocked,
    /// Abandoned
    Cancelled,
}

impl TaskStatus {
    /// Returns true if this status is terminal (Completed or Cancelled).
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Cancelled)
    }

    /// Returns the wire name of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Open => "open",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of work tracked by a [`Tracker`](crate::Tracker).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Tracker-assigned identifier
    pub id: String,

    /// Short description
    pub title: String,

    /// Optional detailed description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Current state
    pub status: TaskStatus,

    /// Priority 0-4 (0 = highest)
    #[serde(default = "default_priority")]
    pub priority: u8,

    /// Free-form labels
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,

    /// Tasks that must complete before this one
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,

    /// Tasks waiting on this one
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocks: Vec<String>,

    /// Epic this task belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,

    /// Creation timestamp (ISO 8601)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,

    /// Completion timestamp (ISO 8601), if completed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
}

fn default_priority() -> u8 {
    2
}

impl Task {
    /// Creates an open task with default priority.
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: None,
            status: TaskStatus::Open,
            priority: default_priority(),
            labels: Vec::new(),
            depends_on: Vec::new(),
            blocks: Vec::new(),
            parent_id: None,
            created_at: Some(chrono::Utc::now().to_rfc3339()),
            completed_at: None,
        }
    }

    /// Sets the priority, clamped to 0-4.
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority.min(4);
        self
    }

    /// Sets the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Adds a dependency on another task.
    pub fn depends_on(mut self, task_id: impl Into<String>) -> Self {
        self.depends_on.push(task_id.into());
        self
    }

    /// Sets the parent epic.
    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    /// Sets the status.
    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = status;
        self
    }
}

/// Selection criteria passed to tracker queries.
///
/// Dependency readiness is not part of the filter: trackers decide which
/// tasks are actionable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskFilter {
    /// Accepted statuses. Empty accepts any status.
    #[serde(default)]
    pub statuses: Vec<TaskStatus>,

    /// Restrict to children of this epic.
    #[serde(default)]
    pub parent_id: Option<String>,

    /// Every listed label must be present on the task.
    #[serde(default)]
    pub labels: Vec<String>,

    /// Task IDs to leave out.
    #[serde(default)]
    pub exclude_ids: Vec<String>,
}

impl TaskFilter {
    /// Filter accepting every task.
    pub fn any() -> Self {
        Self::default()
    }

    /// Restricts the filter to the given epic.
    pub fn with_parent(mut self, parent_id: Option<String>) -> Self {
        self.parent_id = parent_id;
        self
    }

    /// Restricts the filter to the given statuses.
    pub fn with_statuses(mut self, statuses: &[TaskStatus]) -> Self {
        self.statuses = statuses.to_vec();
        self
    }

    /// Excludes the given task IDs.
    pub fn excluding<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude_ids.extend(ids.into_iter().map(Into::into));
        self
    }

    /// Returns true if the task passes the status, epic, label and exclusion criteria.
    pub fn matches(&self, task: &Task) -> bool {
        if !self.statuses.is_empty() && !self.statuses.contains(&task.status) {
            return false;
        }
        if let Some(parent) = &self.parent_id
            && task.parent_id.as_ref() != Some(parent)
        {
            return false;
        }
        if !self.labels.iter().all(|l| task.labels.contains(l)) {
            return false;
        }
        !self.exclude_ids.iter().any(|id| id == &task.id)
    }
}

/// Outcome of [`Tracker::complete_task`](crate::Tracker::complete_task).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskCompletionResult {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<Task>,
}

/// Outcome of [`Tracker::sync`](crate::Tracker::sync).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncResult {
    pub success: bool,
    pub message: String,
    /// Number of tasks known after the sync.
    pub task_count: usize,
}
