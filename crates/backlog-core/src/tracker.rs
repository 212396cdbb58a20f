//! JSONL-backed tracker.
//!
//! Tasks live one JSON object per line (default `.backlog/tasks.jsonl`).
//! Malformed lines are skipped on load. Every mutation rewrites the file.

use async_trait::async_trait;
use backlog_proto::{
    SyncResult, Task, TaskCompletionResult, TaskFilter, TaskStatus, Tracker, TrackerError,
};
use crate::engine::TrackerFactory;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

pub struct JsonlTracker {
    path: PathBuf,
    tasks: Mutex<Vec<Task>>,
}

impl JsonlTracker {
    /// Loads tasks from the file. A missing file is an empty backlog.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, TrackerError> {
        let path = path.as_ref().to_path_buf();
        let tasks = load_tasks(&path).await?;
        debug!(path = %path.display(), count = tasks.len(), "Loaded tasks");
        Ok(Self {
            path,
            tasks: Mutex::new(tasks),
        })
    }

    /// Creates (or overwrites) the file with the given tasks.
    pub async fn create(path: impl AsRef<Path>, tasks: Vec<Task>) -> Result<Self, TrackerError> {
        let path = path.as_ref().to_path_buf();
        save_tasks(&path, &tasks).await?;
        Ok(Self {
            path,
            tasks: Mutex::new(tasks),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Adds a task and persists it.
    pub async fn add(&self, task: Task) -> Result<(), TrackerError> {
        let mut tasks = self.tasks.lock().await;
        tasks.push(task);
        save_tasks(&self.path, &tasks).await
    }
}

async fn load_tasks(path: &Path) -> Result<Vec<Task>, TrackerError> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Ok(content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

async fn save_tasks(path: &Path, tasks: &[Task]) -> Result<(), TrackerError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent).await?;
    }

    let mut content = String::new();
    for task in tasks {
        let line = serde_json::to_string(task)
            .map_err(|e| TrackerError::Backend(format!("failed to serialize task: {e}")))?;
        content.push_str(&line);
        content.push('\n');
    }
    tokio::fs::write(path, content).await?;
    Ok(())
}

/// True when every dependency is a known, completed task.
fn dependencies_met(task: &Task, all: &[Task]) -> bool {
    task.depends_on.iter().all(|dep| {
        all.iter()
            .any(|t| &t.id == dep && t.status == TaskStatus::Completed)
    })
}

fn is_pending(status: TaskStatus) -> bool {
    matches!(
        status,
        TaskStatus::Open | TaskStatus::InProgress | TaskStatus::Blocked
    )
}

#[async_trait]
impl Tracker for JsonlTracker {
    fn name(&self) -> &str {
        "jsonl"
    }

    async fn get_next_task(&self, filter: &TaskFilter) -> Result<Option<Task>, TrackerError> {
        let tasks = self.tasks.lock().await;

        let next = tasks
            .iter()
            .enumerate()
            .filter(|(_, task)| filter.matches(task))
            .filter_map(|(index, task)| {
                let rank = match task.status {
                    TaskStatus::InProgress => 0,
                    TaskStatus::Open if dependencies_met(task, &tasks) => 1,
                    _ => return None,
                };
                Some(((rank, task.priority, index), task))
            })
            .min_by_key(|(key, _)| *key)
            .map(|(_, task)| task.clone());

        Ok(next)
    }

    async fn is_complete(&self, filter: &TaskFilter) -> Result<bool, TrackerError> {
        let tasks = self.tasks.lock().await;
        Ok(!tasks
            .iter()
            .any(|task| filter.matches(task) && is_pending(task.status)))
    }

    async fn get_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, TrackerError> {
        let tasks = self.tasks.lock().await;
        Ok(tasks.iter().filter(|t| filter.matches(t)).cloned().collect())
    }

    async fn update_task_status(
        &self,
        id: &str,
        status: TaskStatus,
    ) -> Result<Option<Task>, TrackerError> {
        let mut tasks = self.tasks.lock().await;
        let Some(task) = tasks.iter_mut().find(|t| t.id == id) else {
            return Ok(None);
        };

        task.status = status;
        task.completed_at =
            (status == TaskStatus::Completed).then(|| chrono::Utc::now().to_rfc3339());
        let updated = task.clone();

        save_tasks(&self.path, &tasks).await?;
        debug!(task_id = %id, status = %status, "Task status updated");
        Ok(Some(updated))
    }

    async fn complete_task(
        &self,
        id: &str,
        reason: Option<&str>,
    ) -> Result<TaskCompletionResult, TrackerError> {
        let Some(task) = self.update_task_status(id, TaskStatus::Completed).await? else {
            return Ok(TaskCompletionResult {
                success: false,
                message: format!("Task '{id}' not found"),
                task: None,
            });
        };

        Ok(TaskCompletionResult {
            success: true,
            message: reason.map_or_else(
                || format!("Completed {id}"),
                |r| format!("Completed {id}: {r}"),
            ),
            task: Some(task),
        })
    }

    async fn sync(&self) -> Result<SyncResult, TrackerError> {
        let reloaded = load_tasks(&self.path).await?;
        let count = reloaded.len();
        *self.tasks.lock().await = reloaded;

        Ok(SyncResult {
            success: true,
            message: format!("Loaded {count} tasks from {}", self.path.display()),
            task_count: count,
        })
    }
}

/// Opens a [`JsonlTracker`] at a fixed path.
#[derive(Debug, Clone)]
pub struct JsonlTrackerFactory {
    path: PathBuf,
}

impl JsonlTrackerFactory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl TrackerFactory for JsonlTrackerFactory {
    async fn create(&self) -> Result<Arc<dyn Tracker>, TrackerError> {
        Ok(Arc::new(JsonlTracker::open(&self.path).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn tracker_with(tasks: Vec<Task>) -> (TempDir, JsonlTracker) {
        let dir = TempDir::new().unwrap();
        let tracker = JsonlTracker::create(dir.path().join("tasks.jsonl"), tasks)
            .await
            .unwrap();
        (dir, tracker)
    }

    #[tokio::test]
    async fn test_missing_file_is_empty_backlog() {
        let dir = TempDir::new().unwrap();
        let tracker = JsonlTracker::open(dir.path().join("nope.jsonl")).await.unwrap();
        assert!(tracker.get_next_task(&TaskFilter::any()).await.unwrap().is_none());
        assert!(tracker.is_complete(&TaskFilter::any()).await.unwrap());
    }

    #[tokio::test]
    async fn test_skips_malformed_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tasks.jsonl");
        std::fs::write(
            &path,
            "{\"id\":\"a\",\"title\":\"A\",\"status\":\"open\"}\nnot json\n\n",
        )
        .unwrap();

        let tracker = JsonlTracker::open(&path).await.unwrap();
        let tasks = tracker.get_tasks(&TaskFilter::any()).await.unwrap();
        assert_eq!(tasks.len(), 1);
    }

    #[tokio::test]
    async fn test_next_task_orders_by_priority_then_file_order() {
        let (_dir, tracker) = tracker_with(vec![
            Task::new("low", "Low").with_priority(3),
            Task::new("high-1", "High 1").with_priority(1),
            Task::new("high-2", "High 2").with_priority(1),
        ])
        .await;

        let next = tracker.get_next_task(&TaskFilter::any()).await.unwrap().unwrap();
        assert_eq!(next.id, "high-1");
    }

    #[tokio::test]
    async fn test_in_progress_task_comes_first() {
        let (_dir, tracker) = tracker_with(vec![
            Task::new("open", "Open").with_priority(0),
            Task::new("wip", "Wip")
                .with_priority(4)
                .with_status(TaskStatus::InProgress),
        ])
        .await;

        let next = tracker.get_next_task(&TaskFilter::any()).await.unwrap().unwrap();
        assert_eq!(next.id, "wip");
    }

    #[tokio::test]
    async fn test_dependencies_gate_selection() {
        let (_dir, tracker) = tracker_with(vec![
            Task::new("child", "Child").with_priority(0).depends_on("base"),
            Task::new("base", "Base").with_priority(4),
        ])
        .await;

        let next = tracker.get_next_task(&TaskFilter::any()).await.unwrap().unwrap();
        assert_eq!(next.id, "base", "child is blocked until base completes");

        tracker.complete_task("base", None).await.unwrap();
        let next = tracker.get_next_task(&TaskFilter::any()).await.unwrap().unwrap();
        assert_eq!(next.id, "child");
    }

    #[tokio::test]
    async fn test_blocked_backlog_is_not_complete() {
        let (_dir, tracker) = tracker_with(vec![
            Task::new("waiting", "Waiting").depends_on("missing"),
        ])
        .await;

        let filter = TaskFilter::any();
        assert!(tracker.get_next_task(&filter).await.unwrap().is_none());
        assert!(!tracker.is_complete(&filter).await.unwrap());
    }

    #[tokio::test]
    async fn test_exclusions_and_epic_filter() {
        let (_dir, tracker) = tracker_with(vec![
            Task::new("a", "A").with_parent("epic"),
            Task::new("b", "B").with_parent("epic"),
            Task::new("c", "C"),
        ])
        .await;

        let filter = TaskFilter::any()
            .with_parent(Some("epic".to_string()))
            .excluding(["a"]);
        let next = tracker.get_next_task(&filter).await.unwrap().unwrap();
        assert_eq!(next.id, "b");
    }

    #[tokio::test]
    async fn test_complete_task_persists() {
        let (dir, tracker) = tracker_with(vec![Task::new("a", "A")]).await;

        let result = tracker.complete_task("a", Some("done")).await.unwrap();
        assert!(result.success);
        assert!(result.message.contains("done"));
        assert!(result.task.unwrap().completed_at.is_some());

        let reopened = JsonlTracker::open(dir.path().join("tasks.jsonl")).await.unwrap();
        assert!(reopened.is_complete(&TaskFilter::any()).await.unwrap());
    }

    #[tokio::test]
    async fn test_complete_unknown_task() {
        let (_dir, tracker) = tracker_with(vec![]).await;
        let result = tracker.complete_task("ghost", None).await.unwrap();
        assert!(!result.success);
        assert!(result.task.is_none());
    }

    #[tokio::test]
    async fn test_update_status_clears_completion_on_reopen() {
        let (_dir, tracker) = tracker_with(vec![Task::new("a", "A")]).await;
        tracker.complete_task("a", None).await.unwrap();

        let reopened = tracker
            .update_task_status("a", TaskStatus::Open)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reopened.status, TaskStatus::Open);
        assert!(reopened.completed_at.is_none());
    }

    #[tokio::test]
    async fn test_sync_picks_up_external_edits() {
        let (dir, tracker) = tracker_with(vec![Task::new("a", "A")]).await;

        let other = JsonlTracker::open(dir.path().join("tasks.jsonl")).await.unwrap();
        other.add(Task::new("b", "B")).await.unwrap();

        let result = tracker.sync().await.unwrap();
        assert!(result.success);
        assert_eq!(result.task_count, 2);
    }
}
