//! The async pipeline service.

use super::result::PipelineResult;
use super::run::{manifest_progress, Run, StageObserver};
use crate::cancellation::CancellationToken;
use crate::config::{EngineSettings, PipelineConfig};
use crate::core::{StageId, StageStatus};
use crate::errors::MediaflowError;
use crate::executor::{AsyncStageUnit, AsyncStepExecutor};
use crate::manifest::ManifestManager;
use crate::progress::{NoOpReporter, ProgressReporter};
use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info};

/// Runs pipelines on the calling task.
///
/// Nothing is spawned: concurrent stages and batch units are joined on the
/// caller's task and interleave only while awaiting a stage unit.
#[derive(Clone)]
pub struct AsyncPipelineService {
    unit: Arc<dyn AsyncStageUnit>,
    reporter: Arc<dyn ProgressReporter>,
    manifest: Option<Arc<ManifestManager>>,
    cancellation: CancellationToken,
    observer: Option<StageObserver>,
    max_concurrency: usize,
}

impl std::fmt::Debug for AsyncPipelineService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncPipelineService")
            .field("manifest", &self.manifest.as_ref().map(|m| m.path().to_path_buf()))
            .field("cancelled", &self.cancellation.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl AsyncPipelineService {
    /// A service invoking stages through `unit`.
    #[must_use]
    pub fn new(unit: Arc<dyn AsyncStageUnit>) -> Self {
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

    /// Runs `config` to completion. See [`super::PipelineService::execute`].
    pub async fn execute(&self, config: &PipelineConfig) -> Result<PipelineResult, MediaflowError> {
        let observer = |stage: StageId, status: StageStatus| self.notify(stage, status);
        self.execute_observed(config, &observer).await
    }

    /// Runs `configs` with at most `max_concurrency` pipelines in flight,
    /// gated by a semaphore. See [`super::PipelineService::process_batch`].
    pub async fn process_batch<F>(
        &self,
        configs: &[PipelineConfig],
        max_concurrency: usize,
        callback: F,
    ) -> Vec<Result<PipelineResult, MediaflowError>>
    where
        F: Fn(usize, StageId, StageStatus) + Send + Sync,
    {
        let permits = max_concurrency.max(1);
        info!(units = configs.len(), permits, "Starting batch");
        let semaphore = Semaphore::new(permits);
        let semaphore = &semaphore;
        let callback = &callback;

        join_all(configs.iter().enumerate().map(|(index, config)| async move {
            let _permit = semaphore
                .acquire()
                .await
                .map_err(|e| MediaflowError::Internal(e.to_string()))?;
            self.cancellation.check()?;
            debug!(index, workdir = %config.workdir().display(), "Batch unit started");
            let observer = move |stage: StageId, status: StageStatus| {
                self.notify(stage, status);
                callback(index, stage, status);
            };
            self.execute_observed(config, &observer).await
        }))
        .await
    }

    /// Runs `configs` with the concurrency ceiling from the service's
    /// settings. See [`Self::process_batch`].
    pub async fn process_all<F>(
        &self,
        configs: &[PipelineConfig],
        callback: F,
    ) -> Vec<Result<PipelineResult, MediaflowError>>
    where
        F: Fn(usize, StageId, StageStatus) + Send + Sync,
    {
        self.process_batch(configs, self.max_concurrency, callback).await
    }

    async fn execute_observed(
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
        let executor = AsyncStepExecutor::new(self.unit.clone(), self.reporter.clone())
            .with_progress_hook(hook);

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
                .map(|&stage| (stage, executor.run_stage(stage, config, inputs)))
                .collect();
            let outcomes = AsyncStepExecutor::fan_out(jobs).await;
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
