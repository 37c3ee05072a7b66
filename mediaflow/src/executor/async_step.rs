//! Non-blocking step executor.

use super::inputs::{StageInputs, StageOutput};
use super::step::{
    finish, forward_progress, panic_reason, prepare, publish_input, require, StageProgressHook,
    StepOutcome,
};
use super::unit::AsyncStageUnit;
use crate::config::{
    to_params, AnalysisParams, ExportParams, PipelineConfig, PublishParams, SourceSelector,
    TranscriptionParams,
};
use crate::core::{
    AnalysisReport, AudioMeta, EpisodeMeta, ExportManifest, PublishReceipt, StageId, Transcript,
};
use crate::errors::StepError;
use crate::progress::ProgressReporter;
use futures::future::join_all;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;

/// Runs stages through an [`AsyncStageUnit`] on the calling task.
#[derive(Clone)]
pub struct AsyncStepExecutor {
    unit: Arc<dyn AsyncStageUnit>,
    reporter: Arc<dyn ProgressReporter>,
    hook: Option<StageProgressHook>,
}

impl std::fmt::Debug for AsyncStepExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncStepExecutor").finish_non_exhaustive()
    }
}

impl AsyncStepExecutor {
    /// An executor invoking `unit` and reporting to `reporter`.
    #[must_use]
    pub fn new(unit: Arc<dyn AsyncStageUnit>, reporter: Arc<dyn ProgressReporter>) -> Self {
        Self {
            unit,
            reporter,
            hook: None,
        }
    }

    /// Also hands every unit progress report to `hook`.
    #[must_use]
    pub fn with_progress_hook(mut self, hook: Option<StageProgressHook>) -> Self {
        self.hook = hook;
        self
    }

    async fn run<I, T>(
        &self,
        stage: StageId,
        workdir: &Path,
        variant: Option<&str>,
        input: Option<&I>,
        params: Value,
    ) -> Result<StepOutcome<T>, StepError>
    where
        I: Serialize + ?Sized + Sync,
        T: DeserializeOwned + Serialize,
    {
        let reporter = self.reporter.as_ref();
        let prepared = prepare(reporter, stage, workdir, variant, input, params)?;
        let sink = |fraction: f64| forward_progress(reporter, self.hook.as_ref(), stage, fraction);
        let result = self.unit.invoke(&prepared.request, &sink).await;
        finish(reporter, prepared, result)
    }

    /// Acquires the source episode.
    pub async fn fetch(
        &self,
        workdir: &Path,
        source: &SourceSelector,
    ) -> Result<StepOutcome<EpisodeMeta>, StepError> {
        self.run(StageId::Fetch, workdir, None, None::<&Value>, json!({ "source": source }))
            .await
    }

    /// Normalizes the fetched audio.
    pub async fn normalize(
        &self,
        workdir: &Path,
        episode: Option<&EpisodeMeta>,
    ) -> Result<StepOutcome<AudioMeta>, StepError> {
        self.run(StageId::Normalize, workdir, None, episode, json!({})).await
    }

    /// Runs speech-to-text.
    pub async fn transcribe(
        &self,
        workdir: &Path,
        params: &TranscriptionParams,
        audio: Option<&AudioMeta>,
    ) -> Result<StepOutcome<Transcript>, StepError> {
        let variant = params.artifact_variant();
        self.run(StageId::Transcribe, workdir, Some(&variant), audio, to_params(params))
            .await
    }

    /// Adds word timings to a transcript.
    pub async fn align(
        &self,
        workdir: &Path,
        params: &TranscriptionParams,
        transcript: Option<&Transcript>,
    ) -> Result<StepOutcome<Transcript>, StepError> {
        let transcript = require(self.reporter.as_ref(), StageId::Align, transcript)?;
        let variant = params.artifact_variant();
        self.run(StageId::Align, workdir, Some(&variant), Some(transcript), to_params(params))
            .await
    }

    /// Labels speakers.
    pub async fn diarize(
        &self,
        workdir: &Path,
        params: &TranscriptionParams,
        transcript: Option<&Transcript>,
    ) -> Result<StepOutcome<Transcript>, StepError> {
        let transcript = require(self.reporter.as_ref(), StageId::Diarize, transcript)?;
        let variant = params.artifact_variant();
        self.run(StageId::Diarize, workdir, Some(&variant), Some(transcript), to_params(params))
            .await
    }

    /// Cleans up and restores the transcript text.
    pub async fn restore(
        &self,
        workdir: &Path,
        params: &TranscriptionParams,
        transcript: Option<&Transcript>,
    ) -> Result<StepOutcome<Transcript>, StepError> {
        let transcript = require(self.reporter.as_ref(), StageId::Restore, transcript)?;
        let variant = params.artifact_variant();
        self.run(StageId::Restore, workdir, Some(&variant), Some(transcript), to_params(params))
            .await
    }

    /// Analyzes the transcript with a language model.
    pub async fn analyze(
        &self,
        workdir: &Path,
        params: &AnalysisParams,
        transcript: Option<&Transcript>,
    ) -> Result<StepOutcome<AnalysisReport>, StepError> {
        let transcript = require(self.reporter.as_ref(), StageId::Analyze, transcript)?;
        let variant = params.artifact_variant();
        self.run(StageId::Analyze, workdir, Some(&variant), Some(transcript), to_params(params))
            .await
    }

    /// Exports the transcript to file formats.
    pub async fn export(
        &self,
        workdir: &Path,
        params: &ExportParams,
        transcript: Option<&Transcript>,
    ) -> Result<StepOutcome<ExportManifest>, StepError> {
        let transcript = require(self.reporter.as_ref(), StageId::Export, transcript)?;
        self.run(StageId::Export, workdir, None, Some(transcript), to_params(params))
            .await
    }

    /// Publishes the analysis and exports.
    pub async fn publish(
        &self,
        workdir: &Path,
        params: &PublishParams,
        analysis: Option<&AnalysisReport>,
        export: Option<&ExportManifest>,
    ) -> Result<StepOutcome<PublishReceipt>, StepError> {
        let input = publish_input(self.reporter.as_ref(), analysis, export)?;
        self.run(StageId::Publish, workdir, None, Some(&input), to_params(params))
            .await
    }

    /// Runs `stage` for `config`, taking upstream output from `inputs`.
    pub async fn run_stage(
        &self,
        stage: StageId,
        config: &PipelineConfig,
        inputs: &StageInputs,
    ) -> Result<StepOutcome<StageOutput>, StepError> {
        let workdir = config.workdir();
        match stage {
            StageId::Fetch => self
                .fetch(workdir, config.source())
                .await
                .map(|o| o.map(StageOutput::Episode)),
            StageId::Normalize => self
                .normalize(workdir, inputs.episode())
                .await
                .map(|o| o.map(StageOutput::Audio)),
            StageId::Transcribe => self
                .transcribe(workdir, config.transcription(), inputs.audio())
                .await
                .map(|o| o.map(StageOutput::Transcript)),
            StageId::Align => self
                .align(workdir, config.transcription(), inputs.transcript_before(stage))
                .await
                .map(|o| o.map(StageOutput::Transcript)),
            StageId::Diarize => self
                .diarize(workdir, config.transcription(), inputs.transcript_before(stage))
                .await
                .map(|o| o.map(StageOutput::Transcript)),
            StageId::Restore => self
                .restore(workdir, config.transcription(), inputs.transcript_before(stage))
                .await
                .map(|o| o.map(StageOutput::Transcript)),
            StageId::Analyze => self
                .analyze(workdir, config.analysis(), inputs.transcript_before(stage))
                .await
                .map(|o| o.map(StageOutput::Analysis)),
            StageId::Export => self
                .export(workdir, config.export(), inputs.transcript_before(stage))
                .await
                .map(|o| o.map(StageOutput::Export)),
            StageId::Publish => self
                .publish(workdir, config.publish(), inputs.analysis(), inputs.export())
                .await
                .map(|o| o.map(StageOutput::Publish)),
        }
    }

    /// Drives independent jobs concurrently on the calling task.
    ///
    /// Nothing is spawned. Results come back in submission order, and a
    /// failing or panicking job never hides its siblings' results.
    pub async fn fan_out<T, Fut>(jobs: Vec<(StageId, Fut)>) -> Vec<Result<T, StepError>>
    where
        Fut: Future<Output = Result<T, StepError>>,
    {
        join_all(jobs.into_iter().map(|(stage, job)| async move {
            AssertUnwindSafe(job)
                .catch_unwind()
                .await
                .unwrap_or_else(|payload| {
                    Err(StepError::Panicked {
                        stage,
                        reason: panic_reason(payload.as_ref()),
                    })
                })
        }))
        .await
    }
}
