/// Task and item state definitions for tracking crawl progress
///
/// Transitions are table-driven so the resume and completion rules can be
/// checked without any I/O.
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a crawler task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    // ===== Active States =====
    /// Task has not started in this run
    Pending,

    /// Task is executing
    Running,

    // ===== Terminal States =====
    /// Every known item reached completed, failed, or skipped
    Completed,

    /// An unrecoverable task-level error (the listing itself could not be fetched)
    Failed,

    /// Task was completed in a previous run and is not re-executed
    Skipped,
}

/// Allowed transitions, `(from, to)`
const TRANSITIONS: &[(TaskStatus, TaskStatus)] = &[
    (TaskStatus::Pending, TaskStatus::Running),
    (TaskStatus::Pending, TaskStatus::Skipped),
    (TaskStatus::Running, TaskStatus::Completed),
    (TaskStatus::Running, TaskStatus::Failed),
];

impl TaskStatus {
    /// Returns true if the transition `self -> to` is allowed
    pub fn can_transition_to(&self, to: TaskStatus) -> bool {
        TRANSITIONS.contains(&(*self, to))
    }

    /// Returns true if this is a terminal state (no further processing in this run)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    /// Returns true if the task's output is complete (done now or in an earlier run)
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }

    /// Status a task is given when restored from a checkpoint
    ///
    /// Completed tasks are skipped; anything else starts over as Pending and
    /// resumes from its cursor.
    pub fn restored(persisted: TaskStatus) -> TaskStatus {
        match persisted {
            Self::Completed | Self::Skipped => Self::Skipped,
            Self::Pending | Self::Running | Self::Failed => Self::Pending,
        }
    }

    /// Stable lowercase name, used in logs and summaries
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Terminal outcome of a single work item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemOutcome {
    /// Fetched and handed to the data sink
    Completed,

    /// Retries exhausted or the payload was unusable
    Failed,

    /// The remote reported the resource as absent or permanently invalid
    Skipped,
}

impl ItemOutcome {
    /// Whether an item with this outcome is left alone on resume
    ///
    /// Failed items get another chance in the next run.
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }

    pub(crate) fn to_code(self) -> u8 {
        match self {
            Self::Completed => 1,
            Self::Failed => 2,
            Self::Skipped => 3,
        }
    }

    pub(crate) fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Completed),
            2 => Some(Self::Failed),
            3 => Some(Self::Skipped),
            _ => None,
        }
    }
}

impl fmt::Display for ItemOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        write!(f, "{}", s)
    }
}
