//! Adjustable iteration budget.

use serde::{Deserialize, Serialize};

/// `{current_iteration, max_iterations}` snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IterationInfo {
    pub current_iteration: u32,
    /// 0 means unlimited.
    pub max_iterations: u32,
}

/// A change applied by [`IterationBudget::add`] or [`IterationBudget::remove`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BudgetChange {
    /// Amount actually applied (removal may be smaller than requested).
    pub delta: u32,
    pub previous_max: u32,
    pub new_max: u32,
}

/// Tracks the current iteration against an optional maximum.
///
/// `current` only ever increases. A `max` of 0 is the unlimited sentinel and
/// cannot be adjusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IterationBudget {
    current: u32,
    max: u32,
}

impl IterationBudget {
    pub fn new(max_iterations: u32) -> Self {
        Self {
            current: 0,
            max: max_iterations,
        }
    }

    pub fn current(&self) -> u32 {
        self.current
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    pub fn is_unlimited(&self) -> bool {
        self.max == 0
    }

    /// Returns true when no further iteration may start.
    pub fn is_exhausted(&self) -> bool {
        !self.is_unlimited() && self.current >= self.max
    }

    /// Advances to the next iteration and returns its 1-based number.
    pub fn advance(&mut self) -> u32 {
        self.current = self.current.saturating_add(1);
        self.current
    }

    pub fn info(&self) -> IterationInfo {
        IterationInfo {
            current_iteration: self.current,
            max_iterations: self.max,
        }
    }

    /// Raises the maximum. No-op for `n == 0` or an unlimited budget.
    pub fn add(&mut self, n: u32) -> Option<BudgetChange> {
        if n == 0 || self.is_unlimited() {
            return None;
        }
        let previous_max = self.max;
        self.max = self.max.saturating_add(n);
        Some(BudgetChange {
            delta: self.max - previous_max,
            previous_max,
            new_max: self.max,
        })
    }

    /// Lowers the maximum, never below 1. No-op for `n == 0` or an unlimited budget.
    pub fn remove(&mut self, n: u32) -> Option<BudgetChange> {
        if n == 0 || self.is_unlimited() {
            return None;
        }
        let previous_max = self.max;
        self.max = self.max.saturating_sub(n).max(1);
        Some(BudgetChange {
            delta: previous_max - self.max,
            previous_max,
            new_max: self.max,
        })
    }
}
