//! # Mediaflow
//!
//! Resumable, dependency-ordered orchestration for long-running media
//! processing stages.
//!
//! A run turns one episode (a show episode or a URL) into transcripts,
//! analyses, exports and published posts by driving a fixed graph of stages:
//!
//! - **Resumable execution**: stages whose artifacts already exist are skipped
//! - **Dependency ordering**: a stage starts only after everything it needs
//! - **Partial failure**: a failed stage blocks its dependents, not its siblings
//! - **Run state and manifest**: per-workdir state plus a library-wide manifest
//! - **Batches**: many episodes under a concurrency ceiling
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use mediaflow::prelude::*;
//!
//! let settings = EngineSettings::from_env()?;
//! let config = PipelineConfig::builder_from(&settings)
//!     .show("My Show")
//!     .date("2024-01-15")
//!     .stages([StageId::Transcribe, StageId::Align, StageId::Analyze])
//!     .build()?;
//!
//! let table = CommandTable::new()
//!     .with(StageId::Transcribe, CommandSpec::new("transcribe-worker"))
//!     .with(StageId::Align, CommandSpec::new("align-worker"))
//!     .with(StageId::Analyze, CommandSpec::new("analyze-worker"));
//! let unit = Arc::new(CommandUnit::from_settings(table, &settings));
//! let result = PipelineService::new(unit)
//!     .with_settings(&settings)
//!     .execute(&config)?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod artifacts;
pub mod cancellation;
pub mod config;
pub mod core;
pub mod errors;
pub mod executor;
pub mod manifest;
pub mod observability;
pub mod pipeline;
pub mod progress;
pub mod state;
pub mod testing;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::artifacts::{ArtifactDetector, DetectedArtifacts};
    pub use crate::cancellation::CancellationToken;
    pub use crate::config::{ComputePrecision, EngineSettings, PipelineConfig};
    pub use crate::core::{RunStatus, StageGraph, StageId, StageStatus};
    pub use crate::errors::{ConfigError, MediaflowError, StepError};
    pub use crate::executor::{
        AsyncStageUnit, CommandSpec, CommandTable, CommandUnit, StageUnit, UnitProgress,
        UnitRequest,
    };
    pub use crate::manifest::{EpisodeInfo, ManifestManager};
    pub use crate::pipeline::{
        AsyncPipelineService, ExecutionPlan, PipelineResult, PipelineService, StageError,
    };
    pub use crate::progress::{ConsoleReporter, EventQueueReporter, ProgressReporter};
    pub use crate::state::RunStateStore;
    pub use crate::utils::{now_utc, Timestamp};
}
