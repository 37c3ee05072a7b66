//! Stage duration measurement.

use crate::core::StageId;
use std::time::{Duration, Instant};
use tracing::debug;

/// Measures one stage invocation.
#[derive(Debug)]
pub struct StageTimer {
    start: Instant,
    stage: StageId,
}

impl StageTimer {
    /// Starts timing `stage`.
    #[must_use]
    pub fn start(stage: StageId) -> Self {
        Self {
            start: Instant::now(),
            stage,
        }
    }

    /// Time elapsed so far.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// The stage being timed.
    #[must_use]
    pub fn stage(&self) -> StageId {
        self.stage
    }

    /// Stops the timer and returns the duration.
    #[must_use]
    pub fn finish(self) -> Duration {
        let elapsed = self.elapsed();
        debug!(
            stage = %self.stage,
            elapsed_ms = elapsed.as_secs_f64() * 1000.0,
            "Stage timer finished"
        );
        elapsed
    }
}
