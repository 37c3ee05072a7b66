//! Stage execution.
//!
//! A stage is run by handing a [`UnitRequest`] to a stage unit, decoding the
//! JSON answer into the stage's typed document, and persisting it as the
//! stage artifact. [`StepExecutor`] does this on the calling thread,
//! [`AsyncStepExecutor`] on the calling task.

mod async_step;
mod command;
mod inputs;
mod step;
mod unit;

pub use async_step::AsyncStepExecutor;
pub use command::{CommandSpec, CommandTable, CommandUnit, PROGRESS_PREFIX};
pub use inputs::{StageInputs, StageOutput};
pub use step::{StageProgressHook, StepExecutor, StepOutcome};
pub use unit::{AsyncStageUnit, StageUnit, UnitProgress, UnitRequest};
