//! Structured summaries of working-tree changes.

use serde::{Deserialize, Serialize};

/// Files touched by one iteration, captured before any auto-commit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary {
    #[serde(default)]
    pub files_added: Vec<String>,
    #[serde(default)]
    pub files_modified: Vec<String>,
    #[serde(default)]
    pub files_deleted: Vec<String>,
    /// One-line human summary, e.g. "2 added, 1 modified".
    pub summary: String,
}

impl DiffSummary {
    /// Builds a summary and derives the one-line text from the file lists.
    pub fn new(added: Vec<String>, modified: Vec<String>, deleted: Vec<String>) -> Self {
        let mut parts = Vec::new();
        if !added.is_empty() {
            parts.push(format!("{} added", added.len()));
        }
        if !modified.is_empty() {
            parts.push(format!("{} modified", modified.len()));
        }
        if !deleted.is_empty() {
            parts.push(format!("{} deleted", deleted.len()));
        }
        let summary = if parts.is_empty() {
            "no changes".to_string()
        } else {
            parts.join(", ")
        };

        Self {
            files_added: added,
            files_modified: modified,
            files_deleted: deleted,
            summary,
        }
    }

    /// Total number of files touched.
    pub fn files_changed(&self) -> usize {
        self.files_added.len() + self.files_modified.len() + self.files_deleted.len()
    }

    /// Returns true if nothing changed.
    pub fn is_empty(&self) -> bool {
        self.files_changed() == 0
    }
}
