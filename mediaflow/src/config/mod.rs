//! Run configuration.
//!
//! `PipelineConfig` describes one desired run and is validated once at
//! construction. `EngineSettings` carries process-level knobs with
//! environment overrides.

mod pipeline;
mod settings;

pub use pipeline::{
    AnalysisParams, ComputePrecision, EpisodeFilter, ExportParams, PipelineConfig,
    PipelineConfigBuilder, PublishParams, SourceSelector, TranscriptionParams,
};
pub use settings::{
    EngineSettings, ENV_EVENT_BUFFER, ENV_MAX_CONCURRENCY, ENV_OUTPUT_ROOT, ENV_STAGE_TIMEOUT,
};

pub(crate) use pipeline::to_params;
