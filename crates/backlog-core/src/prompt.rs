//! Prompt rendering for the BUILD phase.

use backlog_proto::{DiffSummary, Task};
use minijinja::Environment;
use serde::Serialize;
use std::fmt::Write as _;

/// Default prompt template.
///
/// Embedded from `data/default-prompt.md.j2` at compile time.
pub const DEFAULT_PROMPT_TEMPLATE: &str = include_str!("../data/default-prompt.md.j2");

const TEMPLATE_NAME: &str = "prompt";

#[derive(Debug, thiserror::Error)]
pub enum PromptError {
    #[error("Template error: {0}")]
    Template(#[from] minijinja::Error),
}

/// Everything a prompt template can reference.
#[derive(Debug, Clone, Serialize)]
pub struct PromptContext {
    pub task: Task,
    pub iteration: u32,
    /// 0 when unlimited.
    pub max_iterations: u32,
    pub completion_marker: String,
    pub epic_id: Option<String>,
    pub recent_progress: Option<String>,
    pub codebase_patterns: Option<String>,
    /// Pre-formatted "### Iteration k" list, see [`format_diff_context`].
    pub diff_context: Option<String>,
}

/// Renders the agent prompt for one iteration.
pub trait PromptRenderer: Send + Sync {
    fn render(&self, context: &PromptContext) -> Result<String, PromptError>;
}

/// `minijinja`-backed renderer.
#[derive(Debug, Clone)]
pub struct TemplatePromptRenderer {
    source: String,
}

impl TemplatePromptRenderer {
    /// Compiles a custom template, failing early on syntax errors.
    pub fn new(source: impl Into<String>) -> Result<Self, PromptError> {
        let source = source.into();
        let mut env = Environment::new();
        env.add_template(TEMPLATE_NAME, &source)?;
        Ok(Self { source })
    }

    /// Renderer using the embedded default template.
    pub fn with_default_template() -> Self {
        Self {
            source: DEFAULT_PROMPT_TEMPLATE.to_string(),
        }
    }
}

impl Default for TemplatePromptRenderer {
    fn default() -> Self {
        Self::with_default_template()
    }
}

impl PromptRenderer for TemplatePromptRenderer {
    fn render(&self, context: &PromptContext) -> Result<String, PromptError> {
        let mut env = Environment::new();
        env.add_template(TEMPLATE_NAME, &self.source)?;
        let template = env.get_template(TEMPLATE_NAME)?;
        Ok(template.render(context)?)
    }
}

/// Formats the most recent `window` diff summaries, oldest first.
///
/// Returns `None` when there is nothing to show.
pub fn format_diff_context(entries: &[(u32, DiffSummary)], window: usize) -> Option<String> {
    let start = entries.len().saturating_sub(window);
    let recent = &entries[start..];
    if recent.is_empty() {
        return None;
    }

    let mut out = String::new();
    for (iteration, diff) in recent {
        let _ = writeln!(out, "### Iteration {iteration}");
        let _ = writeln!(out, "{}", diff.summary);
        for (label, files) in [
            ("Added", &diff.files_added),
            ("Modified", &diff.files_modified),
            ("Deleted", &diff.files_deleted),
        ] {
            if !files.is_empty() {
                let _ = writeln!(out, "- {label}: {}", files.join(", "));
            }
        }
        out.push('\n');
    }
    Some(out.trim_end().to_string())
}
