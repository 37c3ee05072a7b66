//! A scripted stage unit for tests and dry runs.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use super::fixtures::sample_output;
use crate::core::{StageId, StageMap};
use crate::errors::UnitFailure;
use crate::executor::{AsyncStageUnit, StageUnit, UnitProgress, UnitRequest};

/// A stage unit that answers from a script instead of doing real work.
///
/// Every stage succeeds with a plausible document unless the script says
/// otherwise. All requests are recorded, and the unit tracks how many
/// invocations overlapped.
#[derive(Debug, Default)]
pub struct ScriptedUnit {
    responses: StageMap<Option<Value>>,
    failures: StageMap<Option<UnitFailure>>,
    delays: StageMap<Option<Duration>>,
    progress: StageMap<Vec<f64>>,
    panics: StageMap<bool>,
    requests: Mutex<Vec<UnitRequest>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedUnit {
    /// Creates a unit where every stage succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `stage` exit with `code` and the given diagnostics.
    #[must_use]
    pub fn fail(mut self, stage: StageId, code: i32, stderr: impl Into<String>) -> Self {
        self.failures[stage] = Some(UnitFailure::exited(Some(code), stderr));
        self
    }

    /// Makes `stage` report a timeout.
    #[must_use]
    pub fn time_out(mut self, stage: StageId) -> Self {
        self.failures[stage] = Some(UnitFailure::timeout(""));
        self
    }

    /// Makes `stage` return `value` verbatim.
    #[must_use]
    pub fn respond(mut self, stage: StageId, value: Value) -> Self {
        self.responses[stage] = Some(value);
        self
    }

    /// Makes `stage` take `delay` before answering.
    #[must_use]
    pub fn delay(mut self, stage: StageId, delay: Duration) -> Self {
        self.delays[stage] = Some(delay);
        self
    }

    /// Makes `stage` report each of `fractions` before answering.
    #[must_use]
    pub fn report_progress(mut self, stage: StageId, fractions: &[f64]) -> Self {
        self.progress[stage] = fractions.to_vec();
        self
    }

    /// Makes `stage` panic when invoked.
    #[must_use]
    pub fn panic_on(mut self, stage: StageId) -> Self {
        self.panics[stage] = true;
        self
    }

    /// Stages invoked so far, in invocation order.
    #[must_use]
    pub fn invocations(&self) -> Vec<StageId> {
        self.requests.lock().iter().map(|r| r.stage).collect()
    }

    /// Requests received so far, in invocation order.
    #[must_use]
    pub fn requests(&self) -> Vec<UnitRequest> {
        self.requests.lock().clone()
    }

    /// How many times `stage` was invoked.
    #[must_use]
    pub fn count(&self, stage: StageId) -> usize {
        self.requests.lock().iter().filter(|r| r.stage == stage).count()
    }

    /// The highest number of invocations that were in progress at once.
    #[must_use]
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn enter(&self, request: &UnitRequest) -> Option<Duration> {
        self.requests.lock().push(request.clone());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.delays[request.stage]
    }

    fn answer(&self, request: &UnitRequest, progress: &UnitProgress<'_>) -> Result<Value, UnitFailure> {
        for &fraction in &self.progress[request.stage] {
            progress(fraction);
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if self.panics[request.stage] {
            panic!("scripted panic in {}", request.stage);
        }
        if let Some(failure) = &self.failures[request.stage] {
            return Err(failure.clone());
        }
        Ok(self.responses[request.stage]
            .clone()
            .unwrap_or_else(|| sample_output(request)))
    }
}

impl StageUnit for ScriptedUnit {
    fn invoke(&self, request: &UnitRequest, progress: &UnitProgress<'_>) -> Result<Value, UnitFailure> {
        if let Some(delay) = self.enter(request) {
            thread::sleep(delay);
        }
        self.answer(request, progress)
    }
}

#[async_trait]
impl AsyncStageUnit for ScriptedUnit {
    async fn invoke(
        &self,
        request: &UnitRequest,
        progress: &UnitProgress<'_>,
    ) -> Result<Value, UnitFailure> {
        if let Some(delay) = self.enter(request) {
            tokio::time::sleep(delay).await;
        }
        self.answer(request, progress)
    }
}

/// A unit whose every stage fails the same way; handy for error paths.
#[derive(Debug, Clone)]
pub struct FailingUnit {
    failure: UnitFailure,
}

impl FailingUnit {
    /// Creates a unit that always exits with `code`.
    #[must_use]
    pub fn new(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            failure: UnitFailure::exited(Some(code), stderr),
        }
    }
}

impl StageUnit for FailingUnit {
    fn invoke(
        &self,
        _request: &UnitRequest,
        _progress: &UnitProgress<'_>,
    ) -> Result<Value, UnitFailure> {
        Err(self.failure.clone())
    }
}

#[async_trait]
impl AsyncStageUnit for FailingUnit {
    async fn invoke(
        &self,
        _request: &UnitRequest,
        _progress: &UnitProgress<'_>,
    ) -> Result<Value, UnitFailure> {
        Err(self.failure.clone())
    }
}
