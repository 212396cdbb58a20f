//! Git plumbing for the DETECT phase.
//!
//! The engine never runs git itself. It asks a [`DiffSummarizer`] for the
//! working-tree changes of a completed task, then an [`AutoCommitter`] to
//! commit them. The summary must be taken first: staging and committing
//! erase the diff it reads.

use async_trait::async_trait;
use backlog_proto::{DiffSummary, Task};
use std::io;
use std::path::Path;
use std::process::Command;
use tracing::debug;

/// Result of an auto-commit operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoCommitResult {
    /// Whether a commit was made.
    pub committed: bool,

    /// The commit SHA if a commit was made.
    pub commit_sha: Option<String>,

    /// Number of files that were staged.
    pub files_staged: usize,
}

impl AutoCommitResult {
    /// Create a result indicating no commit was made.
    pub fn no_commit() -> Self {
        Self {
            committed: false,
            commit_sha: None,
            files_staged: 0,
        }
    }
}

/// Errors that can occur during git operations.
#[derive(Debug, thiserror::Error)]
pub enum GitOpsError {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Git command failed.
    #[error("Git command failed: {0}")]
    Git(String),

    /// Git config is missing (user.name or user.email not set).
    #[error("Git config missing: {0}")]
    ConfigMissing(String),
}

/// Summarizes uncommitted changes in a workspace.
#[async_trait]
pub trait DiffSummarizer: Send + Sync {
    async fn summarize(&self, workspace: &Path) -> Result<DiffSummary, GitOpsError>;
}

/// Commits the work of a completed task.
#[async_trait]
pub trait AutoCommitter: Send + Sync {
    async fn commit_task(&self, workspace: &Path, task: &Task)
    -> Result<AutoCommitResult, GitOpsError>;
}

/// [`DiffSummarizer`] over `git status --porcelain`.
#[derive(Debug, Clone, Copy, Default)]
pub struct GitDiffSummarizer;

#[async_trait]
impl DiffSummarizer for GitDiffSummarizer {
    async fn summarize(&self, workspace: &Path) -> Result<DiffSummary, GitOpsError> {
        let workspace = workspace.to_path_buf();
        run_blocking(move || summarize_changes(&workspace)).await
    }
}

/// [`AutoCommitter`] committing everything as `feat: <id> - <title>`.
#[derive(Debug, Clone, Copy, Default)]
pub struct GitAutoCommitter;

#[async_trait]
impl AutoCommitter for GitAutoCommitter {
    async fn commit_task(
        &self,
        workspace: &Path,
        task: &Task,
    ) -> Result<AutoCommitResult, GitOpsError> {
        let workspace = workspace.to_path_buf();
        let message = commit_message(task);
        run_blocking(move || auto_commit_changes(&workspace, &message)).await
    }
}

async fn run_blocking<T, F>(f: F) -> Result<T, GitOpsError>
where
    F: FnOnce() -> Result<T, GitOpsError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| GitOpsError::Git(format!("git worker failed: {e}")))?
}

/// Commit message for a completed task.
pub fn commit_message(task: &Task) -> String {
    format!("feat: {} - {}", task.id, task.title)
}

/// Check if the working directory has uncommitted changes.
pub fn has_uncommitted_changes(path: impl AsRef<Path>) -> Result<bool, GitOpsError> {
    Ok(!porcelain_status(path.as_ref())?.trim().is_empty())
}

/// Classifies uncommitted changes into a [`DiffSummary`].
pub fn summarize_changes(path: impl AsRef<Path>) -> Result<DiffSummary, GitOpsError> {
    let status = porcelain_status(path.as_ref())?;
    Ok(parse_porcelain(&status))
}

fn porcelain_status(path: &Path) -> Result<String, GitOpsError> {
    let output = Command::new("git")
        .args(["status", "--porcelain", "--untracked-files=all"])
        .current_dir(path)
        .output()?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(GitOpsError::Git(stderr.to_string()));
    }

    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// Parses `git status --porcelain` (v1) output.
fn parse_porcelain(status: &str) -> DiffSummary {
    let mut added = Vec::new();
    let mut modified = Vec::new();
    let mut deleted = Vec::new();

    for line in status.lines() {
        if line.len() < 4 {
            continue;
        }
        let (code, path) = line.split_at(3);
        let code = code.trim_end();
        let path = unquote(path);

        if code == "??" || code.starts_with('A') {
            added.push(path);
        } else if code.starts_with('R') || code.starts_with('C') {
            match path.split_once(" -> ") {
                Some((from, to)) => {
                    if code.starts_with('R') {
                        deleted.push(unquote(from));
                    }
                    added.push(unquote(to));
                }
                None => modified.push(path),
            }
        } else if code.contains('D') {
            deleted.push(path);
        } else {
            modified.push(path);
        }
    }

    DiffSummary::new(added, modified, deleted)
}

fn unquote(path: &str) -> String {
    path.trim().trim_matches('"').to_string()
}

/// Stage everything and commit with `message`. A clean tree is a no-op.
pub fn auto_commit_changes(
    path: impl AsRef<Path>,
    message: &str,
) -> Result<AutoCommitResult, GitOpsError> {
    let path = path.as_ref();

    if !has_uncommitted_changes(path)? {
        return Ok(AutoCommitResult::no_commit());
    }

    let output = Command::new("git")
        .args(["add", "-A"])
        .current_dir(path)
        .output()?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(GitOpsError::Git(format!(
            "Failed to stage changes: {}",
            stderr
        )));
    }

    let files_staged = count_staged_files(path)?;
    if files_staged == 0 {
        return Ok(AutoCommitResult::no_commit());
    }

    let output = Command::new("git")
        .args(["commit", "-m", message])
        .current_dir(path)
        .output()?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);

        if stderr.contains("user.email") || stderr.contains("user.name") {
            return Err(GitOpsError::ConfigMissing(
                "user.name or user.email not configured".to_string(),
            ));
        }

        return Err(GitOpsError::Git(format!("Failed to commit: {}", stderr)));
    }

    let commit_sha = get_head_sha(path)?;
    debug!(sha = %commit_sha, files = files_staged, "Auto-committed task changes");

    Ok(AutoCommitResult {
        committed: true,
        commit_sha: Some(commit_sha),
        files_staged,
    })
}

fn count_staged_files(path: &Path) -> Result<usize, GitOpsError> {
    let output = Command::new("git")
        .args(["diff", "--cached", "--name-only"])
        .current_dir(path)
        .output()?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(GitOpsError::Git(stderr.to_string()));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(stdout.lines().filter(|line| !line.is_empty()).count())
}

/// Get the HEAD commit SHA.
pub fn get_head_sha(path: impl AsRef<Path>) -> Result<String, GitOpsError> {
    let output = Command::new("git")
        .args(["rev-parse", "HEAD"])
        .current_dir(path.as_ref())
        .output()?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(GitOpsError::Git(stderr.to_string()));
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn init_git_repo(dir: &Path) {
        let setup: [&[&str]; 3] = [
            &["init", "--initial-branch=main"],
            &["config", "user.email", "test@test.local"],
            &["config", "user.name", "Test User"],
        ];
        for args in setup {
            Command::new("git")
                .args(args)
                .current_dir(dir)
                .output()
                .unwrap();
        }

        fs::write(dir.join("README.md"), "# Test").unwrap();
        fs::write(dir.join("old.txt"), "old").unwrap();
        Command::new("git")
            .args(["add", "-A"])
            .current_dir(dir)
            .output()
            .unwrap();
        Command::new("git")
            .args(["commit", "-m", "Initial commit"])
            .current_dir(dir)
            .output()
            .unwrap();
    }

    #[test]
    fn test_parse_porcelain_classifies_changes() {
        let status = " M src/lib.rs\n?? src/new.rs\nA  staged.rs\n D gone.rs\nR  a.rs -> b.rs\n";
        let diff = parse_porcelain(status);
        assert_eq!(diff.files_added, vec!["src/new.rs", "staged.rs", "b.rs"]);
        assert_eq!(diff.files_modified, vec!["src/lib.rs"]);
        assert_eq!(diff.files_deleted, vec!["gone.rs", "a.rs"]);
        assert_eq!(diff.summary, "3 added, 1 modified, 2 deleted");
    }

    #[test]
    fn test_commit_message_format() {
        let task = Task::new("bd-42", "Add retry button");
        assert_eq!(commit_message(&task), "feat: bd-42 - Add retry button");
    }

    #[test]
    fn test_summarize_changes_in_repo() {
        let temp = TempDir::new().unwrap();
        init_git_repo(temp.path());

        fs::write(temp.path().join("README.md"), "# Changed").unwrap();
        fs::write(temp.path().join("added.rs"), "fn main() {}").unwrap();
        fs::remove_file(temp.path().join("old.txt")).unwrap();

        let diff = summarize_changes(temp.path()).unwrap();
        assert_eq!(diff.files_added, vec!["added.rs"]);
        assert_eq!(diff.files_modified, vec!["README.md"]);
        assert_eq!(diff.files_deleted, vec!["old.txt"]);
    }

    #[test]
    fn test_auto_commit_clean_tree_is_noop() {
        let temp = TempDir::new().unwrap();
        init_git_repo(temp.path());

        let result = auto_commit_changes(temp.path(), "feat: x - y").unwrap();
        assert_eq!(result, AutoCommitResult::no_commit());
    }

    #[tokio::test]
    async fn test_git_auto_committer_commits_task() {
        let temp = TempDir::new().unwrap();
        init_git_repo(temp.path());
        fs::write(temp.path().join("feature.rs"), "pub fn f() {}").unwrap();

        let task = Task::new("t-7", "Add feature");
        let result = GitAutoCommitter
            .commit_task(temp.path(), &task)
            .await
            .unwrap();
        assert!(result.committed);
        assert_eq!(result.files_staged, 1);
        assert!(!has_uncommitted_changes(temp.path()).unwrap());

        let log = Command::new("git")
            .args(["log", "-1", "--pretty=%s"])
            .current_dir(temp.path())
            .output()
            .unwrap();
        assert_eq!(
            String::from_utf8_lossy(&log.stdout).trim(),
            "feat: t-7 - Add feature"
        );
    }

    #[tokio::test]
    async fn test_summary_taken_before_commit_sees_changes() {
        let temp = TempDir::new().unwrap();
        init_git_repo(temp.path());
        fs::write(temp.path().join("feature.rs"), "pub fn f() {}").unwrap();

        let before = GitDiffSummarizer.summarize(temp.path()).await.unwrap();
        GitAutoCommitter
            .commit_task(temp.path(), &Task::new("t-1", "Feature"))
            .await
            .unwrap();
        let after = GitDiffSummarizer.summarize(temp.path()).await.unwrap();

        assert_eq!(before.files_added, vec!["feature.rs"]);
        assert!(after.is_empty());
    }

    #[test]
    fn test_summarize_outside_repo_fails() {
        let temp = TempDir::new().unwrap();
        assert!(matches!(
            summarize_changes(temp.path()),
            Err(GitOpsError::Git(_))
        ));
    }
}
