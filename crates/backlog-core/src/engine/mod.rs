//! The execution engine.
//!
//! `ExecutionEngine` owns the lifecycle state machine and the run loop. Each
//! loop pass runs one SELECT → BUILD → EXECUTE → DETECT iteration (see
//! `iteration.rs`) against one tracker task until the backlog is drained,
//! the budget is spent, or an unrecoverable failure stops it.
//!
//! The engine is meant to be shared as `Arc<ExecutionEngine>`: `start()` runs
//! the loop to completion while other tasks call `pause`, `resume`, `stop`
//! or adjust the budget.

mod bus;
mod deps;
mod iteration;
mod state;

pub use bus::{EventBus, Listener, Subscription};
pub use deps::{AgentFactory, EngineDeps, TrackerFactory};
pub use state::{EngineState, EngineStatus};

use crate::budget::{IterationBudget, IterationInfo};
use crate::config::{ConfigError, EngineConfig};
use crate::fallback::AgentFallbackCoordinator;
use crate::persistence::SessionSnapshot;
use backlog_proto::{
    ActiveAgentInfo, Agent, AgentError, DiffSummary, EngineEvent, RateLimitState, StopReason,
    Task, TaskFilter, TaskStatus, Tracker, TrackerError,
};
use chrono::Utc;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{Notify, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Engine-fatal errors surfaced to the caller.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Engine not initialized - call initialize() before start()")]
    NotInitialized,

    #[error("Cannot start engine in {status} state")]
    AlreadyRunning { status: EngineStatus },

    #[error("Agent '{agent}' is not available: {reason}")]
    AgentUnavailable { agent: String, reason: String },

    #[error("Agent '{agent}' failed preflight: {reason}")]
    PreflightFailed { agent: String, reason: String },

    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Tracker error: {0}")]
    Tracker(#[from] TrackerError),

    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),
}

/// Tracker and agent handles acquired by `initialize()`.
pub(crate) struct Collaborators {
    pub(crate) tracker: Arc<dyn Tracker>,
    pub(crate) agents: HashMap<String, Arc<dyn Agent>>,
}

/// Mutable engine state. Guarded by a std mutex that is never held across an await.
pub(crate) struct Inner {
    pub(crate) state: EngineState,
    pub(crate) budget: IterationBudget,
    pub(crate) collaborators: Option<Arc<Collaborators>>,
    pub(crate) coordinator: Option<AgentFallbackCoordinator>,
    /// Tasks skipped during this engine's lifetime; excluded from SELECT.
    pub(crate) skipped: BTreeSet<String>,
    pub(crate) retry_counts: HashMap<String, u32>,
    /// Task to re-run on the next iteration under the retry strategy.
    pub(crate) pending_retry: Option<Task>,
    pub(crate) select_failures: u32,
    pub(crate) auto_commit: bool,
    pub(crate) run_token: CancellationToken,
    pub(crate) current_execution: Option<CancellationToken>,
    pub(crate) diff_history: VecDeque<(u32, DiffSummary)>,
}

impl Inner {
    fn new(config: &EngineConfig) -> Self {
        Self {
            state: EngineState::new(config.max_iterations),
            budget: IterationBudget::new(config.max_iterations),
            collaborators: None,
            coordinator: None,
            skipped: BTreeSet::new(),
            retry_counts: HashMap::new(),
            pending_retry: None,
            select_failures: 0,
            auto_commit: config.auto_commit,
            run_token: CancellationToken::new(),
            current_execution: None,
            diff_history: VecDeque::new(),
        }
    }

    fn snapshot(&self) -> EngineState {
        let mut state = self.state.clone();
        state.current_iteration = self.budget.current();
        state.max_iterations = self.budget.max();
        state
    }

    pub(crate) fn stop_requested(&self) -> bool {
        self.state.status == EngineStatus::Stopping
    }
}

/// Drives an agent through a tracked backlog.
pub struct ExecutionEngine {
    config: EngineConfig,
    deps: EngineDeps,
    inner: Arc<Mutex<Inner>>,
    bus: Arc<EventBus>,
    status_tx: watch::Sender<EngineStatus>,
    resume: Notify,
}

impl ExecutionEngine {
    pub fn new(config: EngineConfig, deps: EngineDeps) -> Self {
        let inner = Inner::new(&config);
        let (status_tx, _) = watch::channel(EngineStatus::Idle);
        Self {
            config,
            deps,
            inner: Arc::new(Mutex::new(inner)),
            bus: Arc::new(EventBus::new()),
            status_tx,
            resume: Notify::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Inner> {
        lock_inner(&self.inner)
    }

    pub(crate) fn set_status(&self, inner: &mut Inner, status: EngineStatus) {
        if inner.state.status != status {
            debug!(from = %inner.state.status, to = %status, "Engine status change");
        }
        inner.state.status = status;
        self.status_tx.send_replace(status);
    }

    /// A finishing run stays busy until it publishes Idle.
    fn busy_status(&self, inner: &Inner) -> Option<EngineStatus> {
        let published = *self.status_tx.borrow();
        if inner.state.status != EngineStatus::Idle {
            Some(inner.state.status)
        } else if published != EngineStatus::Idle {
            Some(published)
        } else {
            None
        }
    }

    pub(crate) fn emit(&self, event: EngineEvent) {
        self.bus.emit(&event);
    }

    /// Registers a listener for every engine event.
    pub fn on<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&EngineEvent) + Send + Sync + 'static,
    {
        self.bus.subscribe(Arc::new(listener))
    }

    /// Acquires the tracker and agents. Must succeed before `start()`.
    pub async fn initialize(&self) -> Result<(), EngineError> {
        {
            let inner = self.lock();
            if let Some(status) = self.busy_status(&inner) {
                return Err(EngineError::AlreadyRunning { status });
            }
        }

        for warning in self.config.validate()? {
            warn!("{warning}");
        }

        let tracker = self.deps.tracker_factory.create().await?;
        debug!(tracker = tracker.name(), "Tracker ready");

        let mut agents: HashMap<String, Arc<dyn Agent>> = HashMap::new();
        let mut fallbacks = Vec::new();
        for agent_id in self.config.configured_agents() {
            let is_primary = agent_id == self.config.agent;
            match self.acquire_agent(&agent_id).await {
                Ok(agent) => {
                    if !is_primary {
                        fallbacks.push(agent_id.clone());
                    }
                    agents.insert(agent_id, agent);
                }
                Err(e) if is_primary => return Err(e),
                Err(e) => {
                    warn!(agent = %agent_id, error = %e, "Fallback agent unavailable; skipping");
                }
            }
        }

        if self.config.preflight_on_initialize
            && let Some(primary) = agents.get(&self.config.agent)
        {
            let timeout = self
                .config
                .iteration_timeout()
                .unwrap_or(Duration::from_secs(60));
            let result = primary.preflight(timeout).await;
            if !result.success {
                return Err(EngineError::PreflightFailed {
                    agent: self.config.agent.clone(),
                    reason: result.error.unwrap_or_else(|| "unknown error".to_string()),
                });
            }
            debug!(
                agent = %self.config.agent,
                duration_ms = result.duration_ms,
                "Preflight passed"
            );
        }

        let coordinator = AgentFallbackCoordinator::new(
            self.config.agent.clone(),
            fallbacks,
            self.config.rate_limit_handling.clone(),
        );

        let mut inner = self.lock();
        inner.collaborators = Some(Arc::new(Collaborators { tracker, agents }));
        inner.coordinator = Some(coordinator);
        info!(agent = %self.config.agent, "Engine initialized");
        Ok(())
    }

    async fn acquire_agent(&self, agent_id: &str) -> Result<Arc<dyn Agent>, EngineError> {
        let agent = self.deps.agent_factory.create(agent_id).await?;
        let detected = agent.detect().await;
        if !detected.available {
            return Err(EngineError::AgentUnavailable {
                agent: agent_id.to_string(),
                reason: detected
                    .error
                    .unwrap_or_else(|| "not detected".to_string()),
            });
        }
        agent.initialize(&self.config.agent_config(agent_id)).await?;
        debug!(agent = %agent_id, version = ?detected.version, "Agent ready");
        Ok(agent)
    }

    /// Runs the loop until a stop condition fires and returns why it stopped.
    ///
    /// Iteration failures never surface here; only misuse (not initialized,
    /// already running) is an error.
    pub async fn start(&self) -> Result<StopReason, EngineError> {
        let (collaborators, agent, max_iterations, current_iteration) = {
            let mut inner = self.lock();
            let Some(collaborators) = inner.collaborators.clone() else {
                return Err(EngineError::NotInitialized);
            };
            if let Some(status) = self.busy_status(&inner) {
                return Err(EngineError::AlreadyRunning { status });
            }

            self.set_status(&mut inner, EngineStatus::Running);
            inner.run_token = CancellationToken::new();
            inner.select_failures = 0;
            inner.state.started_at = Some(Utc::now());
            inner.state.last_stop_reason = None;
            let agent = inner
                .coordinator
                .as_ref()
                .map_or_else(|| self.config.agent.clone(), |c| c.active_agent().to_string());
            (
                collaborators,
                agent,
                inner.budget.max(),
                inner.budget.current(),
            )
        };

        info!(agent = %agent, max_iterations, "Engine started");
        self.emit(EngineEvent::EngineStarted {
            agent,
            max_iterations,
            current_iteration,
        });
        self.save_session().await;

        let reason = self.run_loop(&collaborators).await;

        let (total_iterations, tasks_completed) = {
            let mut inner = self.lock();
            inner.state.last_stop_reason = Some(reason);
            inner.state.current_task = None;
            inner.current_execution = None;
            debug!(from = %inner.state.status, to = %EngineStatus::Idle, "Engine status change");
            inner.state.status = EngineStatus::Idle;
            (inner.budget.current(), inner.state.tasks_completed)
        };

        info!(reason = %reason, total_iterations, tasks_completed, "Engine stopped");
        self.emit(EngineEvent::EngineStopped {
            reason,
            total_iterations,
            tasks_completed,
        });
        self.save_session().await;

        // Waiters in stop() and dispose() resume only after the epilogue.
        self.status_tx.send_replace(EngineStatus::Idle);

        Ok(reason)
    }

    /// Requests a pause at the next iteration boundary. Only meaningful while running.
    pub fn pause(&self) {
        let mut inner = self.lock();
        if inner.state.status == EngineStatus::Running {
            self.set_status(&mut inner, EngineStatus::Pausing);
            info!("Pause requested");
        }
    }

    /// Cancels a pending pause or leaves the paused state. No-op otherwise.
    pub fn resume(&self) {
        let was_paused = {
            let mut inner = self.lock();
            match inner.state.status {
                EngineStatus::Pausing => {
                    self.set_status(&mut inner, EngineStatus::Running);
                    false
                }
                EngineStatus::Paused => {
                    self.set_status(&mut inner, EngineStatus::Running);
                    true
                }
                _ => return,
            }
        };

        self.resume.notify_one();
        if was_paused {
            let current_iteration = self.lock().budget.current();
            info!(current_iteration, "Engine resumed");
            self.emit(EngineEvent::EngineResumed { current_iteration });
        }
    }

    /// Interrupts any in-flight execution and waits for the loop to go idle.
    ///
    /// Safe to call at any time, including when already idle.
    pub async fn stop(&self) {
        let mut status_rx = self.status_tx.subscribe();
        let requested = {
            let mut inner = self.lock();
            match inner.state.status {
                EngineStatus::Idle | EngineStatus::Stopping => false,
                _ => {
                    info!("Stop requested");
                    self.set_status(&mut inner, EngineStatus::Stopping);
                    inner.run_token.cancel();
                    if let Some(execution) = &inner.current_execution {
                        execution.cancel();
                    }
                    true
                }
            }
        };
        if requested {
            self.resume.notify_one();
        }

        // Idle is published only once the run has emitted engine:stopped and
        // saved its session, so an idle engine returns at once.
        let _ = status_rx.wait_for(|status| *status == EngineStatus::Idle).await;
    }

    /// Stops the engine, releases collaborators and listeners, and resets state.
    pub async fn dispose(&self) {
        self.stop().await;

        let collaborators = {
            let mut inner = self.lock();
            let collaborators = inner.collaborators.take();
            *inner = Inner::new(&self.config);
            collaborators
        };

        if let Some(collaborators) = collaborators {
            for (id, agent) in &collaborators.agents {
                if let Err(e) = agent.dispose().await {
                    warn!(agent = %id, error = %e, "Agent dispose failed");
                }
            }
        }
        self.bus.clear();
        debug!("Engine disposed");
    }

    pub fn status(&self) -> EngineStatus {
        self.lock().state.status
    }

    pub fn is_pausing(&self) -> bool {
        self.status() == EngineStatus::Pausing
    }

    pub fn is_paused(&self) -> bool {
        self.status() == EngineStatus::Paused
    }

    /// Snapshot of the engine state.
    pub fn state(&self) -> EngineState {
        self.lock().snapshot()
    }

    pub fn iteration_info(&self) -> IterationInfo {
        self.lock().budget.info()
    }

    /// Raises the budget.
    ///
    /// Returns true when the engine is idle because it had exhausted its
    /// budget, so the caller may `start()` again.
    pub fn add_iterations(&self, n: u32) -> bool {
        let (change, restartable) = {
            let mut inner = self.lock();
            let Some(change) = inner.budget.add(n) else {
                return false;
            };
            let restartable = inner.state.status == EngineStatus::Idle
                && inner.state.last_stop_reason == Some(StopReason::MaxIterations);
            inner.state.max_iterations = change.new_max;
            (change, restartable)
        };

        info!(added = change.delta, new_max = change.new_max, "Iterations added");
        self.emit(EngineEvent::IterationsAdded {
            added: change.delta,
            previous_max: change.previous_max,
            new_max: change.new_max,
            current_iteration: self.lock().budget.current(),
        });
        restartable
    }

    /// Lowers the budget, never below 1. Returns false for a no-op.
    pub fn remove_iterations(&self, n: u32) -> bool {
        let (change, current_iteration) = {
            let mut inner = self.lock();
            let Some(change) = inner.budget.remove(n) else {
                return false;
            };
            inner.state.max_iterations = change.new_max;
            (change, inner.budget.current())
        };

        info!(removed = change.delta, new_max = change.new_max, "Iterations removed");
        self.emit(EngineEvent::IterationsRemoved {
            removed: change.delta,
            previous_max: change.previous_max,
            new_max: change.new_max,
            current_iteration,
        });
        true
    }

    /// Re-syncs the tracker and publishes the current task list.
    pub async fn refresh_tasks(&self) -> Result<Vec<Task>, EngineError> {
        let collaborators = self.collaborators()?;
        let sync = collaborators.tracker.sync().await?;
        debug!(task_count = sync.task_count, message = %sync.message, "Tracker synced");

        let tasks = collaborators.tracker.get_tasks(&self.base_filter()).await?;
        self.emit(EngineEvent::TasksRefreshed {
            tasks: tasks.clone(),
        });
        Ok(tasks)
    }

    /// Puts tasks back to open and makes them selectable again.
    ///
    /// Returns how many tasks the tracker actually updated.
    pub async fn reset_tasks_to_open(&self, ids: &[String]) -> Result<usize, EngineError> {
        let collaborators = self.collaborators()?;
        {
            let mut inner = self.lock();
            for id in ids {
                inner.skipped.remove(id);
                inner.retry_counts.remove(id);
            }
        }

        let mut updated = 0;
        for id in ids {
            if collaborators
                .tracker
                .update_task_status(id, TaskStatus::Open)
                .await?
                .is_some()
            {
                updated += 1;
            }
        }
        info!(requested = ids.len(), updated, "Tasks reset to open");
        Ok(updated)
    }

    pub fn set_auto_commit(&self, enabled: bool) {
        self.lock().auto_commit = enabled;
        debug!(enabled, "Auto-commit toggled");
    }

    pub fn active_agent_info(&self) -> Option<ActiveAgentInfo> {
        self.lock()
            .coordinator
            .as_ref()
            .map(AgentFallbackCoordinator::active_agent_info)
    }

    pub fn rate_limit_state(&self) -> Option<RateLimitState> {
        self.lock()
            .coordinator
            .as_ref()
            .map(AgentFallbackCoordinator::rate_limit_state)
    }

    fn collaborators(&self) -> Result<Arc<Collaborators>, EngineError> {
        self.lock()
            .collaborators
            .clone()
            .ok_or(EngineError::NotInitialized)
    }

    /// Epic restriction without per-run exclusions.
    pub(crate) fn base_filter(&self) -> TaskFilter {
        TaskFilter::any().with_parent(self.config.epic_id.clone())
    }

    pub(crate) async fn save_session(&self) {
        let snapshot = {
            let inner = self.lock();
            SessionSnapshot {
                status: inner.state.status,
                current_iteration: inner.budget.current(),
                max_iterations: inner.budget.max(),
                tasks_completed: inner.state.tasks_completed,
                current_task_id: inner.state.current_task.as_ref().map(|t| t.id.clone()),
                active_agent: inner
                    .coordinator
                    .as_ref()
                    .map_or_else(|| self.config.agent.clone(), |c| c.active_agent().to_string()),
                stop_reason: inner.state.last_stop_reason,
                updated_at: Utc::now(),
            }
        };
        if let Err(e) = self.deps.session_store.save(&snapshot).await {
            warn!(error = %e, "Failed to save session");
        }
    }
}

pub(crate) fn lock_inner(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}
