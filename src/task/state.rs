//! Task state machine.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// State of a worker task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Built but not yet started.
    Created,
    /// Body is executing.
    Running,
    /// Body returned without a cancel request.
    Completed,
    /// Body returned after a cancel request.
    Cancelled,
    /// Forcibly terminated by the supervisor.
    Killed,
}

impl TaskState {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: TaskState) -> bool {
        use TaskState::*;

        matches!(
            (self, target),
            (Created, Running)
                | (Running, Completed)
                | (Running, Cancelled)
                | (Running, Killed)
        )
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Killed)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Killed => "killed",
        };
        write!(f, "{s}")
    }
}

/// Point-in-time view of a registered task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSnapshot {
    pub name: String,
    pub state: TaskState,
    pub started_at: Option<DateTime<Utc>>,
    pub elapsed: Duration,
    pub cancel_requested: bool,
}
