//! Scheduler lifecycle and per-cycle accounting.

use serde::Serialize;

use crate::filter::AccountReport;

/// Where the scheduler loop is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    /// Constructed, `run` not called yet.
    Idle,
    /// Inside a cycle.
    Running,
    /// Waiting for the next cycle.
    Sleeping,
    /// `run` has returned.
    Stopped,
}

impl std::fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Sleeping => "sleeping",
            Self::Stopped => "stopped",
        };
        write!(f, "{s}")
    }
}

/// Totals for one cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    /// Work groups found in the rule set.
    pub accounts: usize,
    pub completed: usize,
    /// Aborted by a mailbox error or a panic.
    pub failed: usize,
    pub cancelled: usize,
    /// Killed as hung or after the shutdown grace period.
    pub killed: usize,
    /// Not started because a worker for the account was still registered.
    pub skipped: usize,
    pub moved: usize,
}

impl CycleReport {
    pub(crate) fn record(&mut self, account: &AccountReport) {
        self.moved += account.moved;
        if account.error.is_some() {
            self.failed += 1;
        } else if account.cancelled {
            self.cancelled += 1;
        } else {
            self.completed += 1;
        }
    }
}
