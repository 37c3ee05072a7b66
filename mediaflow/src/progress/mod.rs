//! Progress reporting.
//!
//! Stage code talks only to the [`ProgressReporter`] trait. Which sink sits
//! behind it (a terminal, an event queue drained by a web layer, a recorder
//! in tests) is the caller's choice.

mod console;
mod queue;
mod sinks;

pub use console::ConsoleReporter;
pub use queue::{EventQueueReporter, DEFAULT_EVENT_CAPACITY};
pub use sinks::{CallbackReporter, LoggingReporter, NoOpReporter};

use crate::core::{ProgressEvent, ProgressEventType};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

/// Receives progress from running stages.
///
/// Implementations must never fail or block for long; a reporter problem is
/// not a stage problem.
pub trait ProgressReporter: Send + Sync {
    /// A task (usually a stage) started.
    fn start_task(&self, name: &str, total_steps: Option<usize>);

    /// A step within the current task advanced.
    fn update_step(&self, message: &str, step: Option<usize>, progress: Option<f64>);

    /// A step finished.
    fn complete_step(&self, message: &str, duration: Option<Duration>);

    /// The task finished.
    fn complete_task(&self, message: &str, duration: Option<Duration>);

    /// Something failed. `detail` carries diagnostics such as captured stderr.
    fn error(&self, message: &str, detail: Option<&str>);
}

impl<R: ProgressReporter + ?Sized> ProgressReporter for Arc<R> {
    fn start_task(&self, name: &str, total_steps: Option<usize>) {
        (**self).start_task(name, total_steps);
    }

    fn update_step(&self, message: &str, step: Option<usize>, progress: Option<f64>) {
        (**self).update_step(message, step, progress);
    }

    fn complete_step(&self, message: &str, duration: Option<Duration>) {
        (**self).complete_step(message, duration);
    }

    fn complete_task(&self, message: &str, duration: Option<Duration>) {
        (**self).complete_task(message, duration);
    }

    fn error(&self, message: &str, detail: Option<&str>) {
        (**self).error(message, detail);
    }
}

/// One reporter invocation, as recorded or converted to an event.
#[derive(Debug, Clone, PartialEq)]
pub enum ReporterCall {
    /// `start_task`.
    StartTask {
        /// Task name.
        name: String,
        /// Expected number of steps.
        total_steps: Option<usize>,
    },
    /// `update_step`.
    UpdateStep {
        /// Message.
        message: String,
        /// Step number.
        step: Option<usize>,
        /// Fractional progress.
        progress: Option<f64>,
    },
    /// `complete_step`.
    CompleteStep {
        /// Message.
        message: String,
        /// Step duration.
        duration: Option<Duration>,
    },
    /// `complete_task`.
    CompleteTask {
        /// Message.
        message: String,
        /// Task duration.
        duration: Option<Duration>,
    },
    /// `error`.
    Error {
        /// Message.
        message: String,
        /// Diagnostics.
        detail: Option<String>,
    },
}

impl ReporterCall {
    /// Converts the call into a timestamped progress event.
    #[must_use]
    pub fn to_event(&self) -> ProgressEvent {
        match self {
            Self::StartTask { name, total_steps } => {
                let event = ProgressEvent::new(ProgressEventType::Start, name.clone());
                match total_steps {
                    Some(total) => event.with_data(json!({ "total_steps": total })),
                    None => event,
                }
            }
            Self::UpdateStep {
                message,
                step,
                progress,
            } => ProgressEvent::new(ProgressEventType::Update, message.clone())
                .with_step(*step)
                .with_progress(*progress),
            Self::CompleteStep { message, duration } => with_duration(
                ProgressEvent::new(ProgressEventType::Complete, message.clone()),
                *duration,
            ),
            Self::CompleteTask { message, duration } => with_duration(
                ProgressEvent::new(ProgressEventType::Complete, message.clone())
                    .with_progress(Some(1.0)),
                *duration,
            ),
            Self::Error { message, detail } => {
                let event = ProgressEvent::new(ProgressEventType::Error, message.clone());
                match detail {
                    Some(detail) => event.with_data(json!({ "detail": detail })),
                    None => event,
                }
            }
        }
    }
}

fn with_duration(event: ProgressEvent, duration: Option<Duration>) -> ProgressEvent {
    match duration {
        Some(d) => event.with_data(json!({ "duration_seconds": d.as_secs_f64() })),
        None => event,
    }
}
