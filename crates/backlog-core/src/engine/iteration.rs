//! The run loop and the SELECT → BUILD → EXECUTE → DETECT phases.

use super::{Collaborators, EngineStatus, ExecutionEngine, lock_inner};
use crate::config::{ErrorStrategy, MAX_DIFF_CONTEXT_WINDOW};
use crate::fallback::RateLimitDecision;
use crate::persistence::IterationLogEntry;
use crate::prompt::{PromptContext, PromptError, format_diff_context};
use crate::rate_limit::RateLimitDetector;
use backlog_proto::{
    Agent, AgentError, AgentExecutionResult, AgentExecutionStatus, DiffSummary, EngineEvent,
    ExecuteOptions, FailureAction, IterationResult, IterationStatus, OutputCallback, OutputStream,
    StopReason, SubagentCallback, SubagentEvent, SubagentInfo, SwitchReason, Task, TaskFilter,
    TaskStatus,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const ALL_LIMITED_ERROR: &str = "All agents rate-limited";

/// What the run loop does after an iteration.
enum Flow {
    Continue,
    Stop(StopReason),
}

/// Outcome of EXECUTE before classification.
enum Executed {
    Ran {
        agent: String,
        result: AgentExecutionResult,
    },
    /// The agent could not be started at all.
    Unavailable { agent: String, error: String },
    AllLimited { agent: String },
}

impl ExecutionEngine {
    pub(super) async fn run_loop(&self, collaborators: &Collaborators) -> StopReason {
        loop {
            if let Some(reason) = self.wait_at_boundary().await {
                return reason;
            }

            {
                let inner = self.lock();
                if inner.budget.is_exhausted() {
                    info!(
                        max_iterations = inner.budget.max(),
                        "Iteration budget exhausted"
                    );
                    return StopReason::MaxIterations;
                }
            }

            if let Flow::Stop(reason) = self.run_iteration(collaborators).await {
                return reason;
            }

            let delay = Duration::from_millis(self.config.iteration_delay_ms);
            if !self.sleep_unless_stopped(delay).await {
                return StopReason::Interrupted;
            }
        }
    }

    /// Applies a pending pause. Returns a stop reason if the engine is stopping.
    async fn wait_at_boundary(&self) -> Option<StopReason> {
        loop {
            let notified = self.resume.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let paused_at = {
                let mut inner = self.lock();
                match inner.state.status {
                    EngineStatus::Running => return None,
                    EngineStatus::Stopping | EngineStatus::Idle => {
                        return Some(StopReason::Interrupted);
                    }
                    EngineStatus::Pausing => {
                        self.set_status(&mut inner, EngineStatus::Paused);
                        Some(inner.budget.current())
                    }
                    EngineStatus::Paused => None,
                }
            };

            if let Some(current_iteration) = paused_at {
                info!(current_iteration, "Engine paused");
                self.emit(EngineEvent::EnginePaused { current_iteration });
                self.save_session().await;
            }

            notified.await;
        }
    }

    /// Sleeps unless a stop arrives first. Returns false when stopped.
    async fn sleep_unless_stopped(&self, duration: Duration) -> bool {
        let token = {
            let inner = self.lock();
            if inner.stop_requested() {
                return false;
            }
            inner.run_token.clone()
        };
        if duration.is_zero() {
            return true;
        }

        tokio::select! {
            _ = token.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    /// Tracker filter for SELECT: the epic, minus tasks skipped this run.
    fn selection_filter(&self) -> TaskFilter {
        let skipped: Vec<String> = self.lock().skipped.iter().cloned().collect();
        self.base_filter().excluding(skipped)
    }

    async fn run_iteration(&self, collaborators: &Collaborators) -> Flow {
        // SELECT
        let pending = self.lock().pending_retry.take();
        let selected = match pending {
            Some(task) => Ok(Some(task)),
            None => {
                collaborators
                    .tracker
                    .get_next_task(&self.selection_filter())
                    .await
            }
        };

        let task = match selected {
            Ok(Some(task)) => {
                self.lock().select_failures = 0;
                task
            }
            Ok(None) => return self.finish_without_task(collaborators).await,
            Err(e) => return self.handle_select_error(e.to_string()).await,
        };

        let (iteration, agent) = self.begin_iteration(collaborators, &task).await;
        let started_at = Utc::now();

        // BUILD
        let prompt = match self.build_prompt(&task, iteration).await {
            Ok(prompt) => prompt,
            Err(e) => {
                let mut result =
                    self.iteration_result(iteration, &task, IterationStatus::Failed, started_at);
                result.agent = Some(agent.clone());
                result.error = Some(format!("Failed to render prompt: {e}"));
                return self
                    .handle_failure(collaborators, &task, &agent, result)
                    .await;
            }
        };

        // EXECUTE
        let (agent, agent_result) = match self.execute(collaborators, iteration, &prompt).await {
            Executed::Ran { agent, result } => (agent, result),
            Executed::Unavailable { agent, error } => {
                let mut result =
                    self.iteration_result(iteration, &task, IterationStatus::Failed, started_at);
                result.agent = Some(agent.clone());
                result.error = Some(error);
                return self
                    .handle_failure(collaborators, &task, &agent, result)
                    .await;
            }
            Executed::AllLimited { agent } => {
                return self
                    .handle_all_limited(collaborators, &task, &agent, iteration, started_at)
                    .await;
            }
        };

        // DETECT
        let result = self
            .detect(collaborators, &task, &agent, iteration, started_at, agent_result)
            .await;

        match result.status {
            IterationStatus::Completed => {
                self.lock().retry_counts.remove(&task.id);
                self.record(&agent, result, None).await;
                Flow::Continue
            }
            IterationStatus::Interrupted => {
                self.record(&agent, result, Some(FailureAction::Abort)).await;
                self.reset_task(collaborators, &task).await;
                Flow::Stop(StopReason::Interrupted)
            }
            IterationStatus::Failed | IterationStatus::Timeout => {
                self.handle_failure(collaborators, &task, &agent, result)
                    .await
            }
        }
    }

    async fn finish_without_task(&self, collaborators: &Collaborators) -> Flow {
        match collaborators.tracker.is_complete(&self.base_filter()).await {
            Ok(true) => {
                let (tasks_completed, total_iterations) = {
                    let inner = self.lock();
                    (inner.state.tasks_completed, inner.budget.current())
                };
                info!(tasks_completed, "All tasks complete");
                self.emit(EngineEvent::AllComplete {
                    tasks_completed,
                    total_iterations,
                });
                Flow::Stop(StopReason::Complete)
            }
            Ok(false) => {
                info!("No selectable tasks remain");
                Flow::Stop(StopReason::NoTasks)
            }
            Err(e) => self.handle_select_error(e.to_string()).await,
        }
    }

    /// Tracker failures during SELECT do not consume an iteration.
    async fn handle_select_error(&self, error: String) -> Flow {
        let settings = &self.config.error_handling;
        let strategy = settings.effective_strategy();
        let (iteration, failures) = {
            let mut inner = self.lock();
            inner.select_failures += 1;
            (inner.budget.current() + 1, inner.select_failures)
        };
        let give_up = strategy == ErrorStrategy::Abort || failures > settings.max_retries;

        warn!(error = %error, failures, "Task selection failed");
        self.emit(EngineEvent::IterationFailed {
            iteration,
            task: None,
            error,
            action: if give_up {
                FailureAction::Abort
            } else {
                FailureAction::Retry
            },
        });

        if give_up {
            return Flow::Stop(StopReason::Error);
        }
        if !self.sleep_unless_stopped(settings.retry_delay()).await {
            return Flow::Stop(StopReason::Interrupted);
        }
        Flow::Continue
    }

    /// Advances the budget and announces the iteration. Returns its number and agent.
    async fn begin_iteration(&self, collaborators: &Collaborators, task: &Task) -> (u32, String) {
        let (iteration, agent, recovery) = {
            let mut inner = self.lock();
            let iteration = inner.budget.advance();
            inner.state.current_task = Some(task.clone());
            inner.state.subagents.clear();
            let (agent, recovery) = match inner.coordinator.as_mut() {
                Some(coordinator) => {
                    let recovery = coordinator.begin_iteration();
                    (coordinator.active_agent().to_string(), recovery)
                }
                None => (self.config.agent.clone(), None),
            };
            (iteration, agent, recovery)
        };

        if let Some(recovery) = recovery {
            self.emit(EngineEvent::AgentSwitched {
                from: recovery.fallback.clone(),
                to: recovery.primary.clone(),
                reason: SwitchReason::PrimaryRecovery,
            });
            self.emit(EngineEvent::AgentRecoveryAttempted {
                primary: recovery.primary,
                fallback: recovery.fallback,
            });
        }

        info!(iteration, task_id = %task.id, agent = %agent, "Iteration started");
        self.emit(EngineEvent::TaskSelected {
            iteration,
            task: task.clone(),
        });

        if task.status != TaskStatus::InProgress
            && let Err(e) = collaborators
                .tracker
                .update_task_status(&task.id, TaskStatus::InProgress)
                .await
        {
            warn!(task_id = %task.id, error = %e, "Failed to mark task in progress");
        }

        self.emit(EngineEvent::IterationStarted {
            iteration,
            task: task.clone(),
            agent: agent.clone(),
        });
        self.save_session().await;

        (iteration, agent)
    }

    async fn build_prompt(&self, task: &Task, iteration: u32) -> Result<String, PromptError> {
        let progress = &self.deps.progress_log;
        let recent_progress = progress
            .recent(self.config.progress_summary_entries)
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "Failed to read progress log");
                None
            });
        let codebase_patterns = progress.codebase_patterns().await.unwrap_or_else(|e| {
            warn!(error = %e, "Failed to read codebase patterns");
            None
        });

        let (diff_history, max_iterations) = {
            let inner = self.lock();
            let history: Vec<(u32, DiffSummary)> = inner.diff_history.iter().cloned().collect();
            (history, inner.budget.max())
        };

        let context = PromptContext {
            task: task.clone(),
            iteration,
            max_iterations,
            completion_marker: self.config.completion_marker.clone(),
            epic_id: self.config.epic_id.clone(),
            recent_progress,
            codebase_patterns,
            diff_context: format_diff_context(&diff_history, self.config.effective_diff_window()),
        };

        self.deps.prompt_renderer.render(&context)
    }

    /// Runs the active agent, absorbing rate limits through the fallback coordinator.
    async fn execute(
        &self,
        collaborators: &Collaborators,
        iteration: u32,
        prompt: &str,
    ) -> Executed {
        let settings = &self.config.rate_limit_handling;
        let detector = RateLimitDetector::new();

        loop {
            let agent_id = self.active_agent();
            let Some(agent) = collaborators.agents.get(&agent_id) else {
                return Executed::Unavailable {
                    error: format!("Agent '{agent_id}' is not initialized"),
                    agent: agent_id,
                };
            };

            let result = match self.run_agent(agent, iteration, prompt).await {
                Ok(result) => result,
                Err(e) => {
                    return Executed::Unavailable {
                        agent: agent_id,
                        error: e.to_string(),
                    };
                }
            };

            let finished = matches!(
                result.status,
                AgentExecutionStatus::Completed | AgentExecutionStatus::Failed
            );
            let detection = if settings.enabled && finished {
                detector.detect(&result.stdout, &result.stderr, result.exit_code)
            } else {
                Default::default()
            };

            let decision = {
                let mut inner = self.lock();
                let Some(coordinator) = inner.coordinator.as_mut() else {
                    return Executed::Ran {
                        agent: agent_id,
                        result,
                    };
                };
                if !detection.is_rate_limit {
                    coordinator.on_success();
                    return Executed::Ran {
                        agent: agent_id,
                        result,
                    };
                }
                coordinator.on_rate_limited(detection.retry_after)
            };

            match decision {
                RateLimitDecision::RetrySameAgent { attempt, backoff } => {
                    warn!(
                        agent = %agent_id,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        "Agent rate-limited; backing off"
                    );
                    self.emit(EngineEvent::AgentRateLimited {
                        iteration,
                        agent: agent_id.clone(),
                        attempt,
                        max_retries: settings.max_retries,
                        backoff_ms: backoff.as_millis() as u64,
                        message: detection.message,
                    });
                    if !self.sleep_unless_stopped(backoff).await {
                        let interrupted = AgentExecutionResult::interrupted(
                            result.execution_id,
                            result.started_at,
                            "Stopped during rate-limit backoff",
                        );
                        return Executed::Ran {
                            agent: agent_id,
                            result: interrupted,
                        };
                    }
                }
                RateLimitDecision::SwitchTo { from, to } => {
                    self.emit(EngineEvent::AgentRateLimited {
                        iteration,
                        agent: from.clone(),
                        attempt: settings.max_retries,
                        max_retries: settings.max_retries,
                        backoff_ms: 0,
                        message: detection.message,
                    });
                    self.emit(EngineEvent::AgentSwitched {
                        from,
                        to,
                        reason: SwitchReason::RateLimit,
                    });
                }
                RateLimitDecision::AllLimited { tried_agents } => {
                    self.emit(EngineEvent::AgentAllLimited { tried_agents });
                    return Executed::AllLimited { agent: agent_id };
                }
            }
        }
    }

    fn active_agent(&self) -> String {
        self.lock()
            .coordinator
            .as_ref()
            .map_or_else(|| self.config.agent.clone(), |c| c.active_agent().to_string())
    }

    /// One agent execution, raced against the iteration timeout.
    async fn run_agent(
        &self,
        agent: &Arc<dyn Agent>,
        iteration: u32,
        prompt: &str,
    ) -> Result<AgentExecutionResult, AgentError> {
        let options = self.execute_options(iteration, agent.supports_subagent_tracing());
        let mut handle = agent.execute(prompt, &[], options).await?;
        debug!(
            agent = agent.id(),
            execution_id = handle.execution_id(),
            "Agent execution started"
        );

        {
            let mut inner = self.lock();
            let token = handle.cancel_token();
            if inner.stop_requested() {
                token.cancel();
            }
            inner.current_execution = Some(token);
        }

        let result = match self.config.iteration_timeout() {
            Some(limit) => {
                let waited = tokio::time::timeout(limit, handle.wait()).await;
                match waited {
                    Ok(result) => result,
                    Err(_) => {
                        warn!(
                            agent = agent.id(),
                            timeout_secs = limit.as_secs(),
                            "Agent execution timed out"
                        );
                        handle.interrupt();
                        handle.wait().await.into_timeout(limit)
                    }
                }
            }
            None => handle.wait().await,
        };

        self.lock().current_execution = None;
        Ok(result)
    }

    fn execute_options(&self, iteration: u32, track_subagents: bool) -> ExecuteOptions {
        let on_subagent = track_subagents.then(|| {
            let inner = Arc::clone(&self.inner);
            let callback: SubagentCallback = Arc::new(move |event: &SubagentEvent| {
                lock_inner(&inner)
                    .state
                    .subagents
                    .entry(event.id.clone())
                    .and_modify(|info| info.apply(event))
                    .or_insert_with(|| SubagentInfo::from(event));
            });
            callback
        });

        ExecuteOptions {
            timeout: self.config.iteration_timeout(),
            working_dir: Some(self.config.workspace_root.clone()),
            on_stdout: Some(self.output_forwarder(iteration, OutputStream::Stdout)),
            on_stderr: Some(self.output_forwarder(iteration, OutputStream::Stderr)),
            on_subagent,
            ..ExecuteOptions::default()
        }
    }

    /// Re-emits agent output as `agent:output` events.
    fn output_forwarder(&self, iteration: u32, stream: OutputStream) -> OutputCallback {
        let bus = Arc::clone(&self.bus);
        Arc::new(move |chunk: &str| {
            bus.emit(&EngineEvent::AgentOutput {
                iteration,
                stream,
                data: chunk.to_string(),
            });
        })
    }

    /// Classifies the execution and applies tracker and git side effects.
    async fn detect(
        &self,
        collaborators: &Collaborators,
        task: &Task,
        agent: &str,
        iteration: u32,
        started_at: DateTime<Utc>,
        agent_result: AgentExecutionResult,
    ) -> IterationResult {
        let marker = self.config.completion_marker.as_str();
        let promise_complete = !marker.is_empty() && agent_result.stdout.contains(marker);

        let status = match agent_result.status {
            AgentExecutionStatus::Completed => IterationStatus::Completed,
            AgentExecutionStatus::Failed => IterationStatus::Failed,
            AgentExecutionStatus::Timeout => IterationStatus::Timeout,
            AgentExecutionStatus::Interrupted => IterationStatus::Interrupted,
        };

        let mut result = self.iteration_result(iteration, task, status, started_at);
        result.agent = Some(agent.to_string());
        result.promise_complete = promise_complete;
        result.error = match status {
            IterationStatus::Failed if agent_result.error.is_none() => {
                Some(agent_result.exit_code.map_or_else(
                    || "Agent failed".to_string(),
                    |code| format!("Agent exited with code {code}"),
                ))
            }
            _ => agent_result.error.clone(),
        };

        if status == IterationStatus::Completed && promise_complete {
            result.task_completed = self.complete_task(collaborators, task, iteration).await;
            if result.task_completed {
                result.diff_summary = self.capture_diff(iteration).await;
                self.auto_commit(task).await;
            }
        } else if status == IterationStatus::Completed {
            debug!(task_id = %task.id, "Agent finished without completion marker");
        }

        result.agent_result = Some(agent_result);
        result.ended_at = Utc::now();
        result.duration_ms = elapsed_ms(result.started_at, result.ended_at);
        result
    }

    async fn complete_task(
        &self,
        collaborators: &Collaborators,
        task: &Task,
        iteration: u32,
    ) -> bool {
        let completion = collaborators
            .tracker
            .complete_task(&task.id, Some("Completion marker detected"))
            .await;

        match completion {
            Ok(completion) if completion.success => {
                self.lock().state.tasks_completed += 1;
                info!(task_id = %task.id, iteration, "Task completed");
                self.emit(EngineEvent::TaskCompleted {
                    iteration,
                    task: completion.task.unwrap_or_else(|| task.clone()),
                });
                true
            }
            Ok(completion) => {
                warn!(
                    task_id = %task.id,
                    message = %completion.message,
                    "Tracker refused completion"
                );
                false
            }
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "Failed to complete task");
                false
            }
        }
    }

    /// Records the working-tree changes. Must run before auto-commit.
    async fn capture_diff(&self, iteration: u32) -> Option<DiffSummary> {
        match self
            .deps
            .diff_summarizer
            .summarize(&self.config.workspace_root)
            .await
        {
            Ok(summary) => {
                if !summary.is_empty() {
                    let mut inner = self.lock();
                    inner.diff_history.push_back((iteration, summary.clone()));
                    while inner.diff_history.len() > MAX_DIFF_CONTEXT_WINDOW {
                        inner.diff_history.pop_front();
                    }
                }
                Some(summary)
            }
            Err(e) => {
                warn!(iteration, error = %e, "Failed to capture diff summary");
                None
            }
        }
    }

    async fn auto_commit(&self, task: &Task) {
        if !self.lock().auto_commit {
            return;
        }
        match self
            .deps
            .auto_committer
            .commit_task(&self.config.workspace_root, task)
            .await
        {
            Ok(result) if result.committed => {
                info!(
                    task_id = %task.id,
                    sha = ?result.commit_sha,
                    files = result.files_staged,
                    "Auto-committed task"
                );
            }
            Ok(_) => debug!(task_id = %task.id, "Nothing to auto-commit"),
            Err(e) => warn!(task_id = %task.id, error = %e, "Auto-commit failed"),
        }
    }

    /// Applies the error-handling strategy to a failed or timed-out iteration.
    async fn handle_failure(
        &self,
        collaborators: &Collaborators,
        task: &Task,
        agent: &str,
        result: IterationResult,
    ) -> Flow {
        let settings = &self.config.error_handling;
        let iteration = result.iteration;
        let error = result
            .error
            .clone()
            .unwrap_or_else(|| format!("Iteration {}", result.status));
        warn!(
            iteration,
            task_id = %task.id,
            status = %result.status,
            error = %error,
            "Iteration failed"
        );

        match settings.effective_strategy() {
            ErrorStrategy::Abort => {
                self.record(agent, result, Some(FailureAction::Abort)).await;
                self.reset_task(collaborators, task).await;
                return Flow::Stop(StopReason::Error);
            }
            ErrorStrategy::Retry => {
                let attempt = {
                    let mut inner = self.lock();
                    let count = inner.retry_counts.entry(task.id.clone()).or_default();
                    *count += 1;
                    *count
                };

                if attempt <= settings.max_retries {
                    self.record(agent, result, Some(FailureAction::Retry)).await;
                    let delay = settings.retry_delay();
                    self.emit(EngineEvent::IterationRetrying {
                        iteration,
                        task_id: task.id.clone(),
                        attempt,
                        max_retries: settings.max_retries,
                        delay_ms: delay.as_millis() as u64,
                    });
                    self.lock().pending_retry = Some(task.clone());

                    if !self.sleep_unless_stopped(delay).await {
                        self.lock().pending_retry = None;
                        self.reset_task(collaborators, task).await;
                        return Flow::Stop(StopReason::Interrupted);
                    }
                    return Flow::Continue;
                }
                debug!(task_id = %task.id, attempt, "Retries exhausted; skipping task");
            }
            ErrorStrategy::Skip => {}
        }

        self.record(agent, result, Some(FailureAction::Skip)).await;
        {
            let mut inner = self.lock();
            inner.skipped.insert(task.id.clone());
            inner.retry_counts.remove(&task.id);
        }
        self.reset_task(collaborators, task).await;
        self.emit(EngineEvent::IterationSkipped {
            iteration,
            task_id: task.id.clone(),
            reason: error,
        });
        Flow::Continue
    }

    /// Every agent is rate-limited: fail the iteration and retry the task after a cooldown.
    async fn handle_all_limited(
        &self,
        collaborators: &Collaborators,
        task: &Task,
        agent: &str,
        iteration: u32,
        started_at: DateTime<Utc>,
    ) -> Flow {
        let mut result =
            self.iteration_result(iteration, task, IterationStatus::Failed, started_at);
        result.agent = Some(agent.to_string());
        result.error = Some(ALL_LIMITED_ERROR.to_string());
        self.record(agent, result, Some(FailureAction::Retry)).await;
        self.reset_task(collaborators, task).await;

        let cooldown =
            Duration::from_millis(self.config.rate_limit_handling.all_limited_cooldown_ms);
        if !self.sleep_unless_stopped(cooldown).await {
            return Flow::Stop(StopReason::Interrupted);
        }
        Flow::Continue
    }

    async fn reset_task(&self, collaborators: &Collaborators, task: &Task) {
        if let Err(e) = collaborators
            .tracker
            .update_task_status(&task.id, TaskStatus::Open)
            .await
        {
            warn!(task_id = %task.id, error = %e, "Failed to reset task to open");
        }
    }

    fn iteration_result(
        &self,
        iteration: u32,
        task: &Task,
        status: IterationStatus,
        started_at: DateTime<Utc>,
    ) -> IterationResult {
        let ended_at = Utc::now();
        IterationResult {
            iteration,
            status,
            task: Some(task.clone()),
            task_completed: false,
            promise_complete: false,
            duration_ms: elapsed_ms(started_at, ended_at),
            started_at,
            ended_at,
            agent: None,
            agent_result: None,
            error: None,
            diff_summary: None,
        }
    }

    /// Appends to history, emits the outcome, and persists it.
    ///
    /// `action` is `None` for a completed iteration.
    async fn record(&self, agent: &str, result: IterationResult, action: Option<FailureAction>) {
        let switches = {
            let mut inner = self.lock();
            inner.state.iterations.push(result.clone());
            inner.state.current_task = None;
            inner
                .coordinator
                .as_ref()
                .map(|c| c.switch_history().to_vec())
                .unwrap_or_default()
        };

        match action {
            None => self.emit(EngineEvent::IterationCompleted {
                result: result.clone(),
            }),
            Some(action) => self.emit(EngineEvent::IterationFailed {
                iteration: result.iteration,
                task: result.task.clone(),
                error: result
                    .error
                    .clone()
                    .unwrap_or_else(|| format!("Iteration {}", result.status)),
                action,
            }),
        }

        if let Err(e) = self.deps.progress_log.append(&result).await {
            warn!(iteration = result.iteration, error = %e, "Failed to append progress log");
        }

        let agent_config = self.config.agent_config(agent);
        let entry = IterationLogEntry {
            result,
            agent: agent.to_string(),
            model: agent_config.model,
            sandbox: agent_config.sandbox,
            agent_switches: switches,
        };
        match self.deps.iteration_logger.log_iteration(&entry).await {
            Ok(path) => debug!(path = %path.display(), "Iteration log written"),
            Err(e) => warn!(
                iteration = entry.result.iteration,
                error = %e,
                "Failed to write iteration log"
            ),
        }

        self.save_session().await;
    }
}

fn elapsed_ms(start: DateTime<Utc>, end: DateTime<Utc>) -> u64 {
    u64::try_from((end - start).num_milliseconds()).unwrap_or(0)
}
