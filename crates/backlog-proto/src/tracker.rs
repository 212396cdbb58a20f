//! The tracker contract consumed by the engine.

use crate::task::{SyncResult, Task, TaskCompletionResult, TaskFilter, TaskStatus};
use async_trait::async_trait;

/// Errors reported by a tracker.
#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Task '{0}' not found")]
    TaskNotFound(String),

    #[error("Tracker backend error: {0}")]
    Backend(String),
}

/// Task storage and selection.
///
/// Dependency-aware ordering belongs to the tracker. The engine always asks
/// [`Tracker::get_next_task`] for work and never picks tasks itself.
#[async_trait]
pub trait Tracker: Send + Sync {
    /// Human-readable tracker name for logs.
    fn name(&self) -> &str;

    /// Returns the next actionable task, or `None` when nothing is ready.
    async fn get_next_task(&self, filter: &TaskFilter) -> Result<Option<Task>, TrackerError>;

    /// Returns true when no work remains for the filter.
    async fn is_complete(&self, filter: &TaskFilter) -> Result<bool, TrackerError>;

    /// Lists tasks matching the filter.
    async fn get_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, TrackerError>;

    /// Sets a task's status and returns the updated task if it exists.
    async fn update_task_status(
        &self,
        id: &str,
        status: TaskStatus,
    ) -> Result<Option<Task>, TrackerError>;

    /// Marks a task completed.
    async fn complete_task(
        &self,
        id: &str,
        reason: Option<&str>,
    ) -> Result<TaskCompletionResult, TrackerError>;

    /// Reconciles with the backing store.
    async fn sync(&self) -> Result<SyncResult, TrackerError>;
}
