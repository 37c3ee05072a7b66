//! Core domain model types for mediaflow.
//!
//! This module contains the fundamental types used throughout the crate:
//! - Stage identifiers, the static stage graph, and per-stage maps
//! - Stage and run status enums
//! - Progress events
//! - Typed stage documents exchanged with stage units

mod event;
mod outputs;
mod stage;
mod status;

pub use event::{ProgressEvent, ProgressEventType};
pub use outputs::{
    AnalysisReport, AudioMeta, EpisodeMeta, ExportManifest, PublishReceipt, Segment, Transcript,
    Word,
};
pub use stage::{StageDefinition, StageGraph, StageId, StageMap, STAGE_DEFINITIONS};
pub use status::{RunStatus, StageStatus};
