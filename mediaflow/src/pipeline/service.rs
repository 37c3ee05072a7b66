//! The blocking pipeline service.

use super::result::PipelineResult;
use super::run::{manifest_progress, Run, StageObserver};
use crate::cancellation::CancellationToken;
use crate::config::{EngineSettings, PipelineConfig};
use crate::core::{StageId, StageStatus};
use crate::errors::MediaflowError;
use crate::executor::{StageUnit, StepExecutor};
use crate::manifest::ManifestManager;
use crate::progress::{NoOpReporter, ProgressReporter};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{debug, info};

/// Runs pipelines on the calling thread, fanning concurrent stages out to
/// scoped worker threads.
#[derive(Clone)]
pub struct PipelineService {
    unit: Arc<dyn StageUnit>,
    reporter: Arc<dyn ProgressReporter>,
    manifest: Option<Arc<ManifestManager>>,
    cancellation: CancellationToken,
    observer: Option<StageObserver>,
    max_concurrency: usize,
}

impl std::fmt::Debug for PipelineService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineService")
            .field("manifest", &self.manifest.as_ref().map(|m| m.path().to_path_buf()))
            .field("cancelled", &self.cancellation.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl PipelineService {
    /// A service invoking stages through `unit`.
    #[must_use]
    pub fn new(unit: Arc<dyn StageUnit>) -> Self {
        Self {
            unit,
            reporter: Arc::new(NoOpReporter::new()),
            manifest: None,
            cancellation: CancellationToken::new(),
            observer: None,
            max_concurrency: EngineSettings::default().max_concurrency,
        }
    }

    /// Takes the batch concurrency ceiling from `settings`.
    #[must_use]
    pub fn with_settings(mut self, settings: &EngineSettings) -> Self {
        self.max_concurrency = settings.max_concurrency;
        self
    }

    /// Sends stage progress to `reporter`.
    #[must_use]
    pub fn with_reporter(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Records episodes and sessions in `manifest`.
    #[must_use]
    pub fn with_manifest(mut self, manifest: Arc<ManifestManager>) -> Self {
        self.manifest = Some(manifest);
        self
    }

    /// Stops between stages once `token` is cancelled.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Calls `observer` on every stage status change.
    #[must_use]
    pub fn with_stage_observer(
        mut self,
        observer: impl Fn(StageId, StageStatus) + Send + Sync + 'static,
    ) -> Self {
        self.observer = Some(Arc::new(observer));
        self
    }

    /// The cancellation token runs check.
    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Runs `config` to completion.
    ///
    /// Stage failures are reported in the result, never as `Err`. An error
    /// means the run could not start, e.g. the working directory could not
    /// be created.
    pub fn execute(&self, config: &PipelineConfig) -> Result<PipelineResult, MediaflowError> {
        let observer = |stage: StageId, status: StageStatus| self.notify(stage, status);
        self.execute_observed(config, &observer)
    }

    /// Runs `configs` with at most `max_concurrency` pipelines in flight.
    ///
    /// Results come back in submission order. `callback` receives the
    /// config's index with every stage status change. Once cancelled, units
    /// not yet started report [`MediaflowError::Cancelled`].
    pub fn process_batch<F>(
        &self,
        configs: &[PipelineConfig],
        max_concurrency: usize,
        callback: F,
    ) -> Vec<Result<PipelineResult, MediaflowError>>
    where
        F: Fn(usize, StageId, StageStatus) + Send + Sync,
    {
        let workers = max_concurrency.max(1).min(configs.len());
        info!(units = configs.len(), workers, "Starting batch");
        let next = AtomicUsize::new(0);
        let slots: Vec<Mutex<Option<Result<PipelineResult, MediaflowError>>>> =
            configs.iter().map(|_| Mutex::new(None)).collect();

        thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| loop {
                    let index = next.fetch_add(1, Ordering::SeqCst);
                    let Some(config) = configs.get(index) else {
                        break;
                    };
                    let outcome = match self.cancellation.check() {
                        Ok(()) => {
                            debug!(
                                index,
                                workdir = %config.workdir().display(),
                                "Batch unit started"
                            );
                            let observer = |stage: StageId, status: StageStatus| {
                                self.notify(stage, status);
                                callback(index, stage, status);
                            };
                            self.execute_observed(config, &observer)
                        }
                        Err(cancelled) => Err(cancelled),
                    };
                    *slots[index].lock() = Some(outcome);
                });
            }
        });

        slots
            .into_iter()
            .map(|slot| {
                slot.into_inner().unwrap_or_else(|| {
                    Err(MediaflowError::Internal("batch unit produced no result".to_string()))
                })
            })
            .collect()
    }

    /// Runs `configs` with the concurrency ceiling from the service's
    /// settings. See [`Self::process_batch`].
    pub fn process_all<F>(
        &self,
        configs: &[PipelineConfig],
        callback: F,
    ) -> Vec<Result<PipelineResult, MediaflowError>>
    where
        F: Fn(usize, StageId, StageStatus) + Send + Sync,
    {
        self.process_batch(configs, self.max_concurrency, callback)
    }

    fn execute_observed(
        &self,
        config: &PipelineConfig,
        observer: &(dyn Fn(StageId, StageStatus) + Send + Sync),
    ) -> Result<PipelineResult, MediaflowError> {
        let mut run = Run::begin(
            config,
            self.manifest.as_deref(),
            observer,
            self.reporter.as_ref(),
        )?;
        let hook = manifest_progress(self.manifest.clone(), config.episode_id());
        let executor =
            StepExecutor::new(self.unit.clone(), self.reporter.clone()).with_progress_hook(hook);

        for wave in run.waves() {
            if self.cancellation.is_cancelled() {
                run.cancel_remaining(&self.cancellation.reason().unwrap_or_default());
                break;
            }
            let ready = run.admit(&wave);
            if ready.is_empty() {
                continue;
            }
            let inputs = run.inputs();
            let jobs = ready
                .iter()
                .map(|&stage| {
                    let executor = &executor;
                    (stage, move || executor.run_stage(stage, config, inputs))
                })
                .collect();
            let outcomes = StepExecutor::fan_out(jobs);
            for (stage, outcome) in ready.into_iter().zip(outcomes) {
                run.record(stage, outcome);
            }
        }

        Ok(run.finish())
    }

    fn notify(&self, stage: StageId, status: StageStatus) {
        if let Some(observer) = &self.observer {
            observer(stage, status);
        }
    }
}
