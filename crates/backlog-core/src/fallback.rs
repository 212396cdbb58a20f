//! Agent selection under rate limiting.
//!
//! The coordinator owns the primary agent, the ordered fallbacks, and the set
//! of agents currently known to be rate-limited. Callers report rate-limit
//! verdicts and act on the returned [`RateLimitDecision`].

use crate::config::RateLimitHandlingConfig;
use backlog_proto::{ActiveAgentInfo, ActiveAgentReason, AgentSwitch, RateLimitState, SwitchReason};
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Caps the exponent so the backoff cannot overflow.
const MAX_BACKOFF_EXPONENT: u32 = 16;

/// What to do after a rate-limit verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitDecision {
    /// Wait `backoff`, then run the same agent again. `attempt` is 1-based.
    RetrySameAgent { attempt: u32, backoff: Duration },
    /// The active agent is now rate-limited; continue with `to`.
    SwitchTo { from: String, to: String },
    /// Every configured agent was rate-limited. The limited set has been cleared.
    AllLimited { tried_agents: Vec<String> },
}

/// Primary agent recovery performed at an iteration boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryAttempt {
    pub primary: String,
    pub fallback: String,
}

#[derive(Debug, Clone)]
pub struct AgentFallbackCoordinator {
    primary: String,
    fallbacks: Vec<String>,
    settings: RateLimitHandlingConfig,
    rate_limited: BTreeSet<String>,
    active: String,
    active_reason: ActiveAgentReason,
    active_since: DateTime<Utc>,
    /// Retries spent on the active agent since its last success or switch.
    attempts: u32,
    switches: Vec<AgentSwitch>,
}

impl AgentFallbackCoordinator {
    pub fn new(
        primary: impl Into<String>,
        fallbacks: Vec<String>,
        settings: RateLimitHandlingConfig,
    ) -> Self {
        let primary = primary.into();
        Self {
            active: primary.clone(),
            primary,
            fallbacks,
            settings,
            rate_limited: BTreeSet::new(),
            active_reason: ActiveAgentReason::Primary,
            active_since: Utc::now(),
            attempts: 0,
            switches: Vec::new(),
        }
    }

    /// Agent to run the next execution with.
    pub fn active_agent(&self) -> &str {
        &self.active
    }

    pub fn primary_agent(&self) -> &str {
        &self.primary
    }

    /// Primary followed by fallbacks.
    pub fn agents(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.primary.as_str()).chain(self.fallbacks.iter().map(String::as_str))
    }

    pub fn active_agent_info(&self) -> ActiveAgentInfo {
        ActiveAgentInfo {
            agent: self.active.clone(),
            reason: self.active_reason,
            since: self.active_since,
        }
    }

    pub fn rate_limit_state(&self) -> RateLimitState {
        RateLimitState {
            primary_agent: self.primary.clone(),
            rate_limited_agents: self.rate_limited.clone(),
            active_agent: self.active.clone(),
            active_agent_reason: self.active_reason,
        }
    }

    /// Every agent change so far, oldest first.
    pub fn switch_history(&self) -> &[AgentSwitch] {
        &self.switches
    }

    /// Prepares for a new iteration.
    ///
    /// When running on a fallback and primary recovery is enabled, the primary
    /// is made active again. A renewed rate limit simply re-adds it.
    pub fn begin_iteration(&mut self) -> Option<RecoveryAttempt> {
        self.attempts = 0;

        if !self.settings.recover_primary_between_iterations
            || self.active_reason != ActiveAgentReason::Fallback
        {
            return None;
        }

        let fallback = self.active.clone();
        self.rate_limited.remove(&self.primary);
        let primary = self.primary.clone();
        self.switch_to(primary.clone(), SwitchReason::PrimaryRecovery);
        info!(primary = %primary, fallback = %fallback, "Attempting primary agent recovery");

        Some(RecoveryAttempt { primary, fallback })
    }

    /// Records a successful (not rate-limited) execution.
    pub fn on_success(&mut self) {
        self.attempts = 0;
    }

    /// Handles a rate-limit verdict for the active agent.
    pub fn on_rate_limited(&mut self, retry_after: Option<Duration>) -> RateLimitDecision {
        if self.attempts < self.settings.max_retries {
            let exponent = self.attempts.min(MAX_BACKOFF_EXPONENT);
            self.attempts += 1;
            let backoff = retry_after.unwrap_or_else(|| {
                Duration::from_millis(
                    self.settings
                        .base_backoff_ms
                        .saturating_mul(2u64.saturating_pow(exponent)),
                )
            });
            debug!(
                agent = %self.active,
                attempt = self.attempts,
                backoff_ms = backoff.as_millis() as u64,
                "Retrying rate-limited agent"
            );
            return RateLimitDecision::RetrySameAgent {
                attempt: self.attempts,
                backoff,
            };
        }

        self.attempts = 0;
        self.rate_limited.insert(self.active.clone());

        let next = self
            .agents()
            .find(|agent| !self.rate_limited.contains(*agent))
            .map(str::to_string);

        match next {
            Some(to) => {
                let from = self.active.clone();
                self.switch_to(to.clone(), SwitchReason::RateLimit);
                info!(from = %from, to = %to, "Switching agent after rate limit");
                RateLimitDecision::SwitchTo { from, to }
            }
            None => {
                let tried_agents: Vec<String> = self.agents().map(str::to_string).collect();
                warn!(agents = ?tried_agents, "All agents rate-limited; resetting");
                self.rate_limited.clear();
                if self.active != self.primary {
                    let primary = self.primary.clone();
                    self.switch_to(primary, SwitchReason::PrimaryRecovery);
                }
                RateLimitDecision::AllLimited { tried_agents }
            }
        }
    }

    fn switch_to(&mut self, agent: String, reason: SwitchReason) {
        if agent == self.active {
            return;
        }
        let now = Utc::now();
        self.switches.push(AgentSwitch {
            from: std::mem::replace(&mut self.active, agent),
            to: self.active.clone(),
            reason,
            at: now,
        });
        self.active_reason = if self.active == self.primary {
            ActiveAgentReason::Primary
        } else {
            ActiveAgentReason::Fallback
        };
        self.active_since = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(max_retries: u32, recover: bool) -> RateLimitHandlingConfig {
        RateLimitHandlingConfig {
            enabled: true,
            max_retries,
            base_backoff_ms: 100,
            recover_primary_between_iterations: recover,
            all_limited_cooldown_ms: 0,
        }
    }

    fn coordinator(max_retries: u32, recover: bool) -> AgentFallbackCoordinator {
        AgentFallbackCoordinator::new(
            "claude",
            vec!["codex".to_string(), "gemini".to_string()],
            settings(max_retries, recover),
        )
    }

    #[test]
    fn test_starts_on_primary() {
        let coordinator = coordinator(0, true);
        assert_eq!(coordinator.active_agent(), "claude");
        let info = coordinator.active_agent_info();
        assert_eq!(info.reason, ActiveAgentReason::Primary);
        assert!(coordinator.rate_limit_state().rate_limited_agents.is_empty());
    }

    #[test]
    fn test_retries_with_exponential_backoff() {
        let mut coordinator = coordinator(3, true);
        let backoffs: Vec<_> = (0..3)
            .map(|_| match coordinator.on_rate_limited(None) {
                RateLimitDecision::RetrySameAgent { backoff, .. } => backoff,
                other => panic!("expected retry, got {other:?}"),
            })
            .collect();
        assert_eq!(
            backoffs,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400)
            ]
        );

        // Fourth verdict exhausts retries and switches.
        assert_eq!(
            coordinator.on_rate_limited(None),
            RateLimitDecision::SwitchTo {
                from: "claude".to_string(),
                to: "codex".to_string()
            }
        );
    }

    #[test]
    fn test_retry_after_hint_wins() {
        let mut coordinator = coordinator(1, true);
        assert_eq!(
            coordinator.on_rate_limited(Some(Duration::from_secs(7))),
            RateLimitDecision::RetrySameAgent {
                attempt: 1,
                backoff: Duration::from_secs(7)
            }
        );
    }

    #[test]
    fn test_switches_through_fallbacks_in_order() {
        let mut coordinator = coordinator(0, false);

        coordinator.on_rate_limited(None);
        assert_eq!(coordinator.active_agent(), "codex");
        assert_eq!(
            coordinator.active_agent_info().reason,
            ActiveAgentReason::Fallback
        );

        coordinator.on_rate_limited(None);
        assert_eq!(coordinator.active_agent(), "gemini");

        let state = coordinator.rate_limit_state();
        assert!(state.rate_limited_agents.contains("claude"));
        assert!(state.rate_limited_agents.contains("codex"));
        assert_eq!(coordinator.switch_history().len(), 2);
    }

    #[test]
    fn test_all_limited_resets_set_once() {
        let mut coordinator = coordinator(0, false);

        let decisions: Vec<_> = (0..3).map(|_| coordinator.on_rate_limited(None)).collect();
        let all_limited = decisions
            .iter()
            .filter(|d| matches!(d, RateLimitDecision::AllLimited { .. }))
            .count();
        assert_eq!(all_limited, 1);
        assert_eq!(
            decisions[2],
            RateLimitDecision::AllLimited {
                tried_agents: vec![
                    "claude".to_string(),
                    "codex".to_string(),
                    "gemini".to_string()
                ]
            }
        );
        assert!(coordinator.rate_limit_state().rate_limited_agents.is_empty());
        assert_eq!(coordinator.active_agent(), "claude");
    }

    #[test]
    fn test_single_agent_all_limited_immediately() {
        let mut coordinator =
            AgentFallbackCoordinator::new("claude", Vec::new(), settings(0, true));
        assert!(matches!(
            coordinator.on_rate_limited(None),
            RateLimitDecision::AllLimited { .. }
        ));
        assert!(coordinator.switch_history().is_empty());
    }

    #[test]
    fn test_primary_recovery_between_iterations() {
        let mut coordinator = coordinator(0, true);
        coordinator.on_rate_limited(None);
        assert_eq!(coordinator.active_agent(), "codex");

        let recovery = coordinator.begin_iteration().unwrap();
        assert_eq!(recovery.primary, "claude");
        assert_eq!(recovery.fallback, "codex");
        assert_eq!(coordinator.active_agent(), "claude");
        assert!(
            !coordinator
                .rate_limit_state()
                .rate_limited_agents
                .contains("claude")
        );

        // On the primary already: nothing to recover.
        assert!(coordinator.begin_iteration().is_none());
    }

    #[test]
    fn test_no_recovery_when_disabled() {
        let mut coordinator = coordinator(0, false);
        coordinator.on_rate_limited(None);
        assert!(coordinator.begin_iteration().is_none());
        assert_eq!(coordinator.active_agent(), "codex");
    }

    #[test]
    fn test_success_resets_retry_count() {
        let mut coordinator = coordinator(1, true);
        assert!(matches!(
            coordinator.on_rate_limited(None),
            RateLimitDecision::RetrySameAgent { attempt: 1, .. }
        ));
        coordinator.on_success();
        assert!(matches!(
            coordinator.on_rate_limited(None),
            RateLimitDecision::RetrySameAgent { attempt: 1, .. }
        ));
    }
}
