//! What a run reports back.

use crate::core::{RunStatus, StageId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Why an entry sits in [`PipelineResult::errors`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageErrorKind {
    /// The stage ran and failed.
    Failed,
    /// Recording progress in the run state or manifest failed. Non-fatal.
    State,
}

impl fmt::Display for StageErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed => write!(f, "failed"),
            Self::State => write!(f, "state"),
        }
    }
}

/// A failure recorded during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageError {
    /// The stage concerned, when the error belongs to one.
    pub stage: Option<StageId>,
    /// What kind of failure this is.
    pub kind: StageErrorKind,
    /// Human-readable description.
    pub message: String,
}

impl StageError {
    pub(crate) fn failed(stage: StageId, message: impl Into<String>) -> Self {
        Self {
            stage: Some(stage),
            kind: StageErrorKind::Failed,
            message: message.into(),
        }
    }

    pub(crate) fn state(stage: Option<StageId>, message: impl Into<String>) -> Self {
        Self {
            stage,
            kind: StageErrorKind::State,
            message: message.into(),
        }
    }

    /// Returns true if this error failed the run.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        self.kind == StageErrorKind::Failed
    }
}

impl fmt::Display for StageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.stage {
            Some(stage) => write!(f, "[{stage}] {}", self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

/// A stage that never ran because an upstream stage failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockedStage {
    /// The stage that did not run.
    pub stage: StageId,
    /// The failed stage at the root of the block.
    pub blocked_by: StageId,
}

/// Outcome of one pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineResult {
    /// Working directory of the run.
    pub workdir: PathBuf,
    /// Final status.
    pub status: RunStatus,
    /// Stages that ran and completed, in completion order.
    pub steps_completed: Vec<StageId>,
    /// Stages whose output already existed.
    pub steps_skipped: Vec<StageId>,
    /// Stages that never ran because a dependency failed.
    pub steps_blocked: Vec<BlockedStage>,
    /// Artifact of every completed or skipped stage.
    pub artifacts: BTreeMap<StageId, PathBuf>,
    /// Wall-clock time of the run.
    #[serde(with = "duration_seconds")]
    pub duration: Duration,
    /// Stage failures and non-fatal state errors.
    pub errors: Vec<StageError>,
}

impl PipelineResult {
    pub(crate) fn new(workdir: PathBuf) -> Self {
        Self {
            workdir,
            status: RunStatus::Pending,
            steps_completed: Vec::new(),
            steps_skipped: Vec::new(),
            steps_blocked: Vec::new(),
            artifacts: BTreeMap::new(),
            duration: Duration::ZERO,
            errors: Vec::new(),
        }
    }

    /// Returns true if the run completed.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Completed
    }

    /// Stages that ran and failed.
    #[must_use]
    pub fn failed_stages(&self) -> Vec<StageId> {
        self.errors
            .iter()
            .filter(|e| e.is_fatal())
            .filter_map(|e| e.stage)
            .collect()
    }

    /// Stage failures only, without non-fatal state errors.
    pub fn failures(&self) -> impl Iterator<Item = &StageError> {
        self.errors.iter().filter(|e| e.is_fatal())
    }
}

mod duration_seconds {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(duration.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let seconds = f64::deserialize(deserializer)?;
        Ok(Duration::try_from_secs_f64(seconds).unwrap_or_default())
    }
}
