//! Pure retry decisions for the execute/repair loop.
//!
//! Nothing here performs I/O: decisions depend only on the attempt history and
//! the configured budgets, so the same history always yields the same answer.

use crate::core::types::{AttemptRecord, ExitStatus};

/// Why the loop stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Success,
    Exhausted,
}

/// Verdict after an execution attempt has been recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Stop(StopReason),
    Continue,
}

/// Verdict for a sub-budget (infrastructure retries, repair requests).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubBudget {
    /// Try again; the value is the number of failures so far.
    Retry(u32),
    /// The sub-budget is spent; the run is fatal.
    Spent,
}

/// Identity of the next execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NextAttempt {
    pub index: u32,
    pub revision: u32,
}

/// Decide from the attempt history whether to stop or request a repair.
///
/// - `Stop(Success)`: latest result exited successfully with no classification.
/// - `Stop(Exhausted)`: latest result failed and `max_attempts` were used.
/// - `Continue`: nothing executed yet, or failed with budget remaining.
pub fn decide(attempts: &[AttemptRecord], max_attempts: u32) -> Decision {
    let Some(last) = attempts.last() else {
        return Decision::Continue;
    };
    match last.result.status {
        ExitStatus::Success if last.result.classification.is_none() => {
            Decision::Stop(StopReason::Success)
        }
        ExitStatus::Success
        | ExitStatus::NonZeroExit { .. }
        | ExitStatus::Timeout
        | ExitStatus::InfrastructureFailure { .. }
        | ExitStatus::Cancelled => {
            if attempts.len() as u64 >= u64::from(max_attempts) {
                Decision::Stop(StopReason::Exhausted)
            } else {
                Decision::Continue
            }
        }
    }
}

/// Budgets for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum execution attempts (>= 1).
    pub max_attempts: u32,
    /// Repair requests allowed per failing attempt before the run is fatal.
    pub repair_budget: u32,
    /// Immediate re-executions allowed after infrastructure failures.
    pub infra_retry_limit: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            repair_budget: 2,
            infra_retry_limit: 2,
        }
    }
}

impl RetryPolicy {
    pub fn decide(&self, attempts: &[AttemptRecord]) -> Decision {
        decide(attempts, self.max_attempts)
    }

    /// Called after the `failures`-th consecutive infrastructure failure.
    pub fn after_infra_failure(&self, failures: u32) -> SubBudget {
        if failures > self.infra_retry_limit {
            SubBudget::Spent
        } else {
            SubBudget::Retry(failures)
        }
    }

    /// Called after the `failures`-th failed repair request for one attempt.
    pub fn after_repair_failure(&self, failures: u32) -> SubBudget {
        if failures >= self.repair_budget {
            SubBudget::Spent
        } else {
            SubBudget::Retry(failures)
        }
    }

    /// Attempt index follows the history length; the revision is supplied by
    /// the merger.
    pub fn next_attempt(&self, attempts: &[AttemptRecord], next_revision: u32) -> NextAttempt {
        NextAttempt {
            index: attempts.len() as u32,
            revision: next_revision,
        }
    }
}
