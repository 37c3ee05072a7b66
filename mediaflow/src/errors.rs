//! Error types for mediaflow.
//!
//! Configuration errors fail a run before any stage starts. Stage errors are
//! caught at the executor boundary and carried in the run result. State and
//! manifest errors are recovered from on load and reported as non-fatal on
//! save.

use crate::core::StageId;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// The main error type for mediaflow operations.
#[derive(Debug, Error)]
pub enum MediaflowError {
    /// The pipeline configuration is invalid.
    #[error("{0}")]
    Config(#[from] ConfigError),

    /// The run state store failed.
    #[error("{0}")]
    State(#[from] StateError),

    /// The manifest failed.
    #[error("{0}")]
    Manifest(#[from] ManifestError),

    /// A stage failed.
    #[error("{0}")]
    Step(#[from] StepError),

    /// The run or batch was cancelled before this unit started.
    #[error("Pipeline cancelled: {0}")]
    Cancelled(String),

    /// A generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Raised when a `PipelineConfig` or `EngineSettings` is invalid.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Neither a show nor a URL was given.
    #[error("No source selected: provide a show name or a URL")]
    MissingSource,

    /// Both a show and a URL were given.
    #[error("Conflicting sources: show '{show}' and url '{url}' are mutually exclusive")]
    ConflictingSources {
        /// The show name.
        show: String,
        /// The URL.
        url: String,
    },

    /// A date or title filter was given without a show to filter.
    #[error("The {0} filter requires a show name")]
    FilterWithoutShow(&'static str),

    /// Both a date and a title filter were given.
    #[error("Date and title filters are mutually exclusive")]
    ConflictingFilters,

    /// The date filter could not be parsed.
    #[error("Invalid date '{value}': {reason}")]
    InvalidDate {
        /// The raw value.
        value: String,
        /// Why parsing failed.
        reason: String,
    },

    /// A required parameter was empty.
    #[error("Parameter '{0}' must not be empty")]
    EmptyParameter(&'static str),

    /// Publish was requested without a destination.
    #[error("Publish requested without a destination")]
    MissingPublishDestination,

    /// Export was requested without any format.
    #[error("Export requested without any format")]
    NoExportFormats,

    /// No stage was requested.
    #[error("No stages requested")]
    NoStages,

    /// A stage name did not match any known stage.
    #[error("Unknown stage '{0}'")]
    UnknownStage(String),

    /// An engine setting could not be parsed.
    #[error("Invalid setting {key}='{value}': {reason}")]
    InvalidSetting {
        /// The setting key (environment variable name).
        key: String,
        /// The raw value.
        value: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A concurrency ceiling of zero was requested.
    #[error("Concurrency ceiling must be at least 1")]
    ZeroConcurrency,
}

/// Raised by the run state store.
#[derive(Debug, Error)]
pub enum StateError {
    /// Reading or writing the state file failed.
    #[error("Run state IO error at {}: {source}", path.display())]
    Io {
        /// The state file path.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },
}

/// Raised by the manifest manager.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// Reading or writing the manifest failed.
    #[error("Manifest IO error at {}: {source}", path.display())]
    Io {
        /// The manifest path.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// No episode with this id is tracked.
    #[error("Episode not found: {0}")]
    EpisodeNotFound(String),

    /// No session with this id exists.
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// The session was already completed or failed.
    #[error("Session {id} already finished with status {status}")]
    SessionFinished {
        /// The session id.
        id: String,
        /// Its final status.
        status: String,
    },

    /// The stage index is outside the session's stage list.
    #[error("Session {id} has {len} stages; index {index} is out of range")]
    StageIndexOutOfRange {
        /// The session id.
        id: String,
        /// The requested index.
        index: usize,
        /// Number of stages in the session.
        len: usize,
    },
}

/// What a stage unit reported when it did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UnitFailure {
    /// Process exit code, when the unit is a process that exited.
    pub exit_code: Option<i32>,
    /// Captured diagnostic output.
    pub stderr: String,
    /// Whether the unit was stopped for exceeding its timeout.
    pub timed_out: bool,
}

impl UnitFailure {
    /// A failure with an exit code and diagnostics.
    #[must_use]
    pub fn exited(exit_code: Option<i32>, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stderr: stderr.into(),
            timed_out: false,
        }
    }

    /// A failure caused by the unit's timeout.
    #[must_use]
    pub fn timeout(stderr: impl Into<String>) -> Self {
        Self {
            exit_code: None,
            stderr: stderr.into(),
            timed_out: true,
        }
    }
}

impl fmt::Display for UnitFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.timed_out {
            write!(f, "timed out")?;
        } else {
            match self.exit_code {
                Some(code) => write!(f, "exit code {code}")?,
                None => write!(f, "terminated")?,
            }
        }
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            write!(f, ": {stderr}")?;
        }
        Ok(())
    }
}

/// Raised when a single stage fails to execute.
#[derive(Debug, Error)]
pub enum StepError {
    /// The stage unit completed unsuccessfully.
    #[error("Stage '{stage}' failed ({failure})")]
    Unit {
        /// The stage.
        stage: StageId,
        /// What the unit reported.
        failure: UnitFailure,
    },

    /// The unit's output did not match the stage's expected shape.
    #[error("Stage '{stage}' produced unreadable output: {reason}")]
    Decode {
        /// The stage.
        stage: StageId,
        /// The parse error.
        reason: String,
    },

    /// The stage input could not be serialized.
    #[error("Stage '{stage}' input could not be serialized: {reason}")]
    Encode {
        /// The stage.
        stage: StageId,
        /// The serialization error.
        reason: String,
    },

    /// Persisting the stage artifact failed.
    #[error("Stage '{stage}' could not write {}: {source}", path.display())]
    Io {
        /// The stage.
        stage: StageId,
        /// The artifact path.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// A stage that cannot run without upstream output found none.
    #[error("Stage '{stage}' requires output from '{needs}', which is not available")]
    MissingInput {
        /// The stage.
        stage: StageId,
        /// The upstream stage whose output is missing.
        needs: StageId,
    },

    /// A fan-out worker panicked.
    #[error("Stage '{stage}' worker panicked: {reason}")]
    Panicked {
        /// The stage.
        stage: StageId,
        /// The panic payload, when it was a string.
        reason: String,
    },
}

impl StepError {
    /// The stage that failed.
    #[must_use]
    pub fn stage(&self) -> StageId {
        match self {
            Self::Unit { stage, .. }
            | Self::Decode { stage, .. }
            | Self::Encode { stage, .. }
            | Self::Io { stage, .. }
            | Self::MissingInput { stage, .. }
            | Self::Panicked { stage, .. } => *stage,
        }
    }

    /// The unit's exit code, when the failure came from a process.
    #[must_use]
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Unit { failure, .. } => failure.exit_code,
            _ => None,
        }
    }

    /// Returns true if the unit exceeded its timeout.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Unit { failure, .. } if failure.timed_out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_failure_display() {
        let failure = UnitFailure::exited(Some(2), "model not found\n");
        assert_eq!(failure.to_string(), "exit code 2: model not found");

        let timeout = UnitFailure::timeout("");
        assert_eq!(timeout.to_string(), "timed out");
    }

    #[test]
    fn test_step_error_accessors() {
        let err = StepError::Unit {
            stage: StageId::Transcribe,
            failure: UnitFailure::exited(Some(1), "boom"),
        };

        assert_eq!(err.stage(), StageId::Transcribe);
        assert_eq!(err.exit_code(), Some(1));
        assert!(!err.is_timeout());
        assert!(err.to_string().contains("transcribe"));
    }

    #[test]
    fn test_missing_input_message() {
        let err = StepError::MissingInput {
            stage: StageId::Publish,
            needs: StageId::Analyze,
        };
        assert_eq!(
            err.to_string(),
            "Stage 'publish' requires output from 'analyze', which is not available"
        );
    }

    #[test]
    fn test_config_error_converts() {
        let err: MediaflowError = ConfigError::MissingSource.into();
        assert!(matches!(err, MediaflowError::Config(ConfigError::MissingSource)));
    }
}
