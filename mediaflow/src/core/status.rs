//! Stage and run status enums.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The status of one stage within a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// Stage is waiting for its dependencies.
    #[default]
    Pending,
    /// Stage output already existed; the stage did not run.
    Skipped,
    /// Stage is currently running.
    Running,
    /// Stage completed successfully.
    Completed,
    /// Stage ran and failed.
    Failed,
    /// Stage never ran because a dependency failed or was blocked.
    Blocked,
    /// Stage never ran because the run was cancelled.
    Cancelled,
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Skipped => write!(f, "skipped"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Blocked => write!(f, "blocked"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl StageStatus {
    /// Returns true if the status will not change again during the run.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }

    /// Returns true if downstream stages may consume this stage's output.
    #[must_use]
    pub fn is_satisfied(&self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }

    /// Returns true if downstream stages can never run in this pass.
    #[must_use]
    pub fn blocks_dependents(&self) -> bool {
        matches!(self, Self::Failed | Self::Blocked | Self::Cancelled)
    }
}

/// The overall status of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// The run has not started.
    #[default]
    Pending,
    /// Stages are being scheduled.
    Running,
    /// Every requested stage completed or was skipped.
    Completed,
    /// At least one stage failed.
    Failed,
    /// The run was cancelled between stages.
    Cancelled,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}
