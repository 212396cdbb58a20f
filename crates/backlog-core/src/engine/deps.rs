//! Collaborators injected into the engine.

use crate::config::EngineConfig;
use crate::git_ops::{AutoCommitter, DiffSummarizer, GitAutoCommitter, GitDiffSummarizer};
use crate::persistence::{
    FileIterationLogger, FileSessionStore, IterationLogger, MarkdownProgressLog, ProgressLog,
    SessionStore,
};
use crate::prompt::{PromptError, PromptRenderer, TemplatePromptRenderer};
use async_trait::async_trait;
use backlog_proto::{Agent, AgentError, Tracker, TrackerError};
use std::sync::Arc;

/// Produces the tracker during `initialize()`.
#[async_trait]
pub trait TrackerFactory: Send + Sync {
    async fn create(&self) -> Result<Arc<dyn Tracker>, TrackerError>;
}

/// Produces agents by configured id during `initialize()`.
#[async_trait]
pub trait AgentFactory: Send + Sync {
    async fn create(&self, agent_id: &str) -> Result<Arc<dyn Agent>, AgentError>;
}

/// Everything the engine talks to besides its own state.
#[derive(Clone)]
pub struct EngineDeps {
    pub tracker_factory: Arc<dyn TrackerFactory>,
    pub agent_factory: Arc<dyn AgentFactory>,
    pub prompt_renderer: Arc<dyn PromptRenderer>,
    pub diff_summarizer: Arc<dyn DiffSummarizer>,
    pub auto_committer: Arc<dyn AutoCommitter>,
    pub session_store: Arc<dyn SessionStore>,
    pub iteration_logger: Arc<dyn IterationLogger>,
    pub progress_log: Arc<dyn ProgressLog>,
}

impl EngineDeps {
    /// Git-, file- and template-backed collaborators laid out per `config.paths`.
    pub fn from_config(
        config: &EngineConfig,
        tracker_factory: Arc<dyn TrackerFactory>,
        agent_factory: Arc<dyn AgentFactory>,
    ) -> Result<Self, PromptError> {
        let prompt_renderer = match &config.prompt_template {
            Some(template) => TemplatePromptRenderer::new(template.clone())?,
            None => TemplatePromptRenderer::with_default_template(),
        };

        Ok(Self {
            tracker_factory,
            agent_factory,
            prompt_renderer: Arc::new(prompt_renderer),
            diff_summarizer: Arc::new(GitDiffSummarizer),
            auto_committer: Arc::new(GitAutoCommitter),
            session_store: Arc::new(FileSessionStore::new(
                config.resolve(&config.paths.session_file),
            )),
            iteration_logger: Arc::new(FileIterationLogger::new(
                config.resolve(&config.paths.iterations_dir),
            )),
            progress_log: Arc::new(MarkdownProgressLog::new(
                config.resolve(&config.paths.progress_file),
            )),
        })
    }

    pub fn with_prompt_renderer(mut self, renderer: Arc<dyn PromptRenderer>) -> Self {
        self.prompt_renderer = renderer;
        self
    }

    pub fn with_diff_summarizer(mut self, summarizer: Arc<dyn DiffSummarizer>) -> Self {
        self.diff_summarizer = summarizer;
        self
    }

    pub fn with_auto_committer(mut self, committer: Arc<dyn AutoCommitter>) -> Self {
        self.auto_committer = committer;
        self
    }

    pub fn with_session_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.session_store = store;
        self
    }

    pub fn with_iteration_logger(mut self, logger: Arc<dyn IterationLogger>) -> Self {
        self.iteration_logger = logger;
        self
    }

    pub fn with_progress_log(mut self, log: Arc<dyn ProgressLog>) -> Self {
        self.progress_log = log;
        self
    }
}
