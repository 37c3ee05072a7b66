//! Small reporters: no-op/recording, tracing, and callback adapters.

use super::{ProgressReporter, ReporterCall};
use crate::core::ProgressEvent;
use parking_lot::Mutex;
use std::fmt;
use std::time::Duration;
use tracing::{debug, error, info};

/// Discards everything, optionally keeping a log of calls.
#[derive(Debug, Default)]
pub struct NoOpReporter {
    calls: Option<Mutex<Vec<ReporterCall>>>,
}

impl NoOpReporter {
    /// A reporter that discards all calls.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A reporter that records every call for later inspection.
    #[must_use]
    pub fn recording() -> Self {
        Self {
            calls: Some(Mutex::new(Vec::new())),
        }
    }

    /// Recorded calls. Empty unless created with [`NoOpReporter::recording`].
    #[must_use]
    pub fn calls(&self) -> Vec<ReporterCall> {
        self.calls.as_ref().map(|c| c.lock().clone()).unwrap_or_default()
    }

    /// Clears recorded calls.
    pub fn clear(&self) {
        if let Some(calls) = &self.calls {
            calls.lock().clear();
        }
    }

    fn record(&self, call: impl FnOnce() -> ReporterCall) {
        if let Some(calls) = &self.calls {
            calls.lock().push(call());
        }
    }
}

impl ProgressReporter for NoOpReporter {
    fn start_task(&self, name: &str, total_steps: Option<usize>) {
        self.record(|| ReporterCall::StartTask {
            name: name.to_string(),
            total_steps,
        });
    }

    fn update_step(&self, message: &str, step: Option<usize>, progress: Option<f64>) {
        self.record(|| ReporterCall::UpdateStep {
            message: message.to_string(),
            step,
            progress,
        });
    }

    fn complete_step(&self, message: &str, duration: Option<Duration>) {
        self.record(|| ReporterCall::CompleteStep {
            message: message.to_string(),
            duration,
        });
    }

    fn complete_task(&self, message: &str, duration: Option<Duration>) {
        self.record(|| ReporterCall::CompleteTask {
            message: message.to_string(),
            duration,
        });
    }

    fn error(&self, message: &str, detail: Option<&str>) {
        self.record(|| ReporterCall::Error {
            message: message.to_string(),
            detail: detail.map(str::to_string),
        });
    }
}

/// Forwards progress to `tracing`.
///
/// Step updates go to `debug`, so the default filter keeps only task
/// boundaries and errors.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingReporter;

impl ProgressReporter for LoggingReporter {
    fn start_task(&self, name: &str, total_steps: Option<usize>) {
        info!(task = %name, total_steps = ?total_steps, "Task started");
    }

    fn update_step(&self, message: &str, step: Option<usize>, progress: Option<f64>) {
        debug!(step = ?step, progress = ?progress, "{message}");
    }

    fn complete_step(&self, message: &str, duration: Option<Duration>) {
        debug!(duration = ?duration, "{message}");
    }

    fn complete_task(&self, message: &str, duration: Option<Duration>) {
        info!(duration = ?duration, "{message}");
    }

    fn error(&self, message: &str, detail: Option<&str>) {
        error!(detail = detail.unwrap_or_default(), "{message}");
    }
}

/// Adapts a bare event callback to the reporter trait.
pub struct CallbackReporter {
    callback: Box<dyn Fn(&ProgressEvent) + Send + Sync>,
}

impl CallbackReporter {
    /// Wraps `callback`; every reporter call becomes one event.
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(&ProgressEvent) + Send + Sync + 'static,
    {
        Self {
            callback: Box::new(callback),
        }
    }

    fn emit(&self, call: &ReporterCall) {
        (self.callback)(&call.to_event());
    }
}

impl fmt::Debug for CallbackReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackReporter").finish_non_exhaustive()
    }
}

impl ProgressReporter for CallbackReporter {
    fn start_task(&self, name: &str, total_steps: Option<usize>) {
        self.emit(&ReporterCall::StartTask {
            name: name.to_string(),
            total_steps,
        });
    }

    fn update_step(&self, message: &str, step: Option<usize>, progress: Option<f64>) {
        self.emit(&ReporterCall::UpdateStep {
            message: message.to_string(),
            step,
            progress,
        });
    }

    fn complete_step(&self, message: &str, duration: Option<Duration>) {
        self.emit(&ReporterCall::CompleteStep {
            message: message.to_string(),
            duration,
        });
    }

    fn complete_task(&self, message: &str, duration: Option<Duration>) {
        self.emit(&ReporterCall::CompleteTask {
            message: message.to_string(),
            duration,
        });
    }

    fn error(&self, message: &str, detail: Option<&str>) {
        self.emit(&ReporterCall::Error {
            message: message.to_string(),
            detail: detail.map(str::to_string),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ProgressEventType;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    #[test]
    fn test_noop_discards() {
        let reporter = NoOpReporter::new();
        reporter.start_task("fetch", None);
        reporter.error("boom", None);
        assert!(reporter.calls().is_empty());
    }

    #[test]
    fn test_recording_keeps_order() {
        let reporter = NoOpReporter::recording();
        reporter.start_task("align", Some(2));
        reporter.update_step("loading model", Some(1), Some(0.5));
        reporter.complete_task("aligned", None);

        assert_eq!(
            reporter.calls(),
            vec![
                ReporterCall::StartTask {
                    name: "align".to_string(),
                    total_steps: Some(2)
                },
                ReporterCall::UpdateStep {
                    message: "loading model".to_string(),
                    step: Some(1),
                    progress: Some(0.5)
                },
                ReporterCall::CompleteTask {
                    message: "aligned".to_string(),
                    duration: None
                },
            ]
        );

        reporter.clear();
        assert!(reporter.calls().is_empty());
    }

    #[test]
    fn test_logging_reporter_does_not_panic() {
        let reporter = LoggingReporter;
        reporter.start_task("export", Some(3));
        reporter.update_step("writing srt", Some(1), None);
        reporter.complete_step("srt", Some(Duration::from_millis(5)));
        reporter.complete_task("exported", None);
        reporter.error("failed", Some("disk full"));
    }

    #[test]
    fn test_callback_adapter() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let reporter = CallbackReporter::new(move |event| sink.lock().push(event.clone()));

        reporter.start_task("analyze", None);
        reporter.update_step("prompting", None, Some(2.0));
        reporter.error("model error", Some("rate limited"));

        let events = seen.lock();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].event_type, ProgressEventType::Start);
        assert_eq!(events[1].progress, Some(1.0));
        assert_eq!(events[2].event_type, ProgressEventType::Error);
    }
}
