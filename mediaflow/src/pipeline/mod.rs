//! Pipeline planning and execution.
//!
//! This module provides:
//! - The execution planner (skips, waves of concurrent siblings)
//! - Blocking and async pipeline services with batch processing
//! - The run result shape both services share

mod async_service;
mod plan;
mod result;
mod run;
mod service;


pub use async_service::AsyncPipelineService;
pub use plan::ExecutionPlan;
pub use result::{BlockedStage, PipelineResult, StageError, StageErrorKind};
pub use run::StageObserver;
pub use service::PipelineService;
