//! Blocking step executor and the pieces shared with the async one.

use super::inputs::{StageInputs, StageOutput};
use super::unit::{StageUnit, UnitRequest};
use crate::artifacts::artifact_path;
use crate::config::{
    to_params, AnalysisParams, ExportParams, PipelineConfig, PublishParams, SourceSelector,
    TranscriptionParams,
};
use crate::core::{
    AnalysisReport, AudioMeta, EpisodeMeta, ExportManifest, PublishReceipt, StageId, Transcript,
};
use crate::errors::{StepError, UnitFailure};
use crate::observability::StageTimer;
use crate::progress::ProgressReporter;
use crate::utils::atomic_write_json;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::debug;

/// A successful stage run.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome<T> {
    /// Typed output.
    pub output: T,
    /// Where the output was persisted.
    pub artifact: PathBuf,
    /// Wall-clock time of the invocation.
    pub duration: Duration,
}

impl<T> StepOutcome<T> {
    /// Maps the output, keeping artifact and duration.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> StepOutcome<U> {
        StepOutcome {
            output: f(self.output),
            artifact: self.artifact,
            duration: self.duration,
        }
    }
}

/// A request ready to hand to a unit, plus what is needed to finish it.
pub(crate) struct Prepared {
    pub(crate) request: UnitRequest,
    artifact: PathBuf,
    timer: StageTimer,
}

pub(crate) fn prepare<I: Serialize + ?Sized>(
    reporter: &dyn ProgressReporter,
    stage: StageId,
    workdir: &Path,
    variant: Option<&str>,
    input: Option<&I>,
    params: Value,
) -> Result<Prepared, StepError> {
    reporter.start_task(stage.as_str(), None);
    let input = match input {
        Some(input) => serde_json::to_value(input).map_err(|e| {
            report(
                reporter,
                StepError::Encode {
                    stage,
                    reason: e.to_string(),
                },
            )
        })?,
        None => Value::Null,
    };
    debug!(
        stage = %stage,
        workdir = %workdir.display(),
        has_input = !input.is_null(),
        "Invoking stage unit"
    );
    Ok(Prepared {
        request: UnitRequest {
            stage,
            workdir: workdir.to_path_buf(),
            input,
            params,
        },
        artifact: artifact_path(workdir, stage, variant),
        timer: StageTimer::start(stage),
    })
}

pub(crate) fn finish<T: DeserializeOwned + Serialize>(
    reporter: &dyn ProgressReporter,
    prepared: Prepared,
    result: Result<Value, UnitFailure>,
) -> Result<StepOutcome<T>, StepError> {
    let stage = prepared.request.stage;
    let value = result.map_err(|failure| report(reporter, StepError::Unit { stage, failure }))?;
    let output: T = serde_json::from_value(value).map_err(|e| {
        report(
            reporter,
            StepError::Decode {
                stage,
                reason: e.to_string(),
            },
        )
    })?;
    atomic_write_json(&prepared.artifact, &output).map_err(|source| {
        report(
            reporter,
            StepError::Io {
                stage,
                path: prepared.artifact.clone(),
                source,
            },
        )
    })?;

    let duration = prepared.timer.finish();
    reporter.complete_task(&format!("{stage} completed"), Some(duration));
    Ok(StepOutcome {
        output,
        artifact: prepared.artifact,
        duration,
    })
}

pub(crate) fn report(reporter: &dyn ProgressReporter, err: StepError) -> StepError {
    let detail = match &err {
        StepError::Unit { failure, .. } if !failure.stderr.trim().is_empty() => {
            Some(failure.stderr.trim().to_string())
        }
        _ => None,
    };
    reporter.error(&err.to_string(), detail.as_deref());
    err
}

/// Fails a transcript consumer that found no transcript.
pub(crate) fn require<'a, T>(
    reporter: &dyn ProgressReporter,
    stage: StageId,
    input: Option<&'a T>,
) -> Result<&'a T, StepError> {
    input.ok_or_else(|| {
        report(
            reporter,
            StepError::MissingInput {
                stage,
                needs: StageId::Transcribe,
            },
        )
    })
}

pub(crate) fn publish_input(
    reporter: &dyn ProgressReporter,
    analysis: Option<&AnalysisReport>,
    export: Option<&ExportManifest>,
) -> Result<Value, StepError> {
    if analysis.is_none() && export.is_none() {
        return Err(report(
            reporter,
            StepError::MissingInput {
                stage: StageId::Publish,
                needs: StageId::Analyze,
            },
        ));
    }
    Ok(json!({ "analysis": analysis, "export": export }))
}

/// Forwards a stage's unit progress somewhere besides the reporter, such as
/// the manifest.
pub type StageProgressHook = Arc<dyn Fn(StageId, f64) + Send + Sync>;

pub(crate) fn forward_progress(
    reporter: &dyn ProgressReporter,
    hook: Option<&StageProgressHook>,
    stage: StageId,
    fraction: f64,
) {
    let fraction = if fraction.is_nan() {
        0.0
    } else {
        fraction.clamp(0.0, 1.0)
    };
    reporter.update_step(stage.as_str(), None, Some(fraction));
    if let Some(hook) = hook {
        hook(stage, fraction);
    }
}

pub(crate) fn panic_reason(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

/// Runs stages through a blocking [`StageUnit`].
#[derive(Clone)]
pub struct StepExecutor {
    unit: Arc<dyn StageUnit>,
    reporter: Arc<dyn ProgressReporter>,
    hook: Option<StageProgressHook>,
}

impl std::fmt::Debug for StepExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepExecutor").finish_non_exhaustive()
    }
}

impl StepExecutor {
    /// An executor invoking `unit` and reporting to `reporter`.
    #[must_use]
    pub fn new(unit: Arc<dyn StageUnit>, reporter: Arc<dyn ProgressReporter>) -> Self {
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

    fn run<I, T>(
        &self,
        stage: StageId,
        workdir: &Path,
        variant: Option<&str>,
        input: Option<&I>,
        params: Value,
    ) -> Result<StepOutcome<T>, StepError>
    where
        I: Serialize + ?Sized,
        T: DeserializeOwned + Serialize,
    {
        let reporter = self.reporter.as_ref();
        let prepared = prepare(reporter, stage, workdir, variant, input, params)?;
        let sink = |fraction: f64| forward_progress(reporter, self.hook.as_ref(), stage, fraction);
        let result = self.unit.invoke(&prepared.request, &sink);
        finish(reporter, prepared, result)
    }

    /// Acquires the source episode.
    pub fn fetch(
        &self,
        workdir: &Path,
        source: &SourceSelector,
    ) -> Result<StepOutcome<EpisodeMeta>, StepError> {
        self.run(StageId::Fetch, workdir, None, None::<&Value>, json!({ "source": source }))
    }

    /// Normalizes the fetched audio. Without episode metadata the unit
    /// locates the media in the working directory.
    pub fn normalize(
        &self,
        workdir: &Path,
        episode: Option<&EpisodeMeta>,
    ) -> Result<StepOutcome<AudioMeta>, StepError> {
        self.run(StageId::Normalize, workdir, None, episode, json!({}))
    }

    /// Runs speech-to-text.
    pub fn transcribe(
        &self,
        workdir: &Path,
        params: &TranscriptionParams,
        audio: Option<&AudioMeta>,
    ) -> Result<StepOutcome<Transcript>, StepError> {
        let variant = params.artifact_variant();
        self.run(StageId::Transcribe, workdir, Some(&variant), audio, to_params(params))
    }

    /// Adds word timings to a transcript.
    pub fn align(
        &self,
        workdir: &Path,
        params: &TranscriptionParams,
        transcript: Option<&Transcript>,
    ) -> Result<StepOutcome<Transcript>, StepError> {
        let transcript = require(self.reporter.as_ref(), StageId::Align, transcript)?;
        let variant = params.artifact_variant();
        self.run(StageId::Align, workdir, Some(&variant), Some(transcript), to_params(params))
    }

    /// Labels speakers.
    pub fn diarize(
        &self,
        workdir: &Path,
        params: &TranscriptionParams,
        transcript: Option<&Transcript>,
    ) -> Result<StepOutcome<Transcript>, StepError> {
        let transcript = require(self.reporter.as_ref(), StageId::Diarize, transcript)?;
        let variant = params.artifact_variant();
        self.run(StageId::Diarize, workdir, Some(&variant), Some(transcript), to_params(params))
    }

    /// Cleans up and restores the transcript text.
    pub fn restore(
        &self,
        workdir: &Path,
        params: &TranscriptionParams,
        transcript: Option<&Transcript>,
    ) -> Result<StepOutcome<Transcript>, StepError> {
        let transcript = require(self.reporter.as_ref(), StageId::Restore, transcript)?;
        let variant = params.artifact_variant();
        self.run(StageId::Restore, workdir, Some(&variant), Some(transcript), to_params(params))
    }

    /// Analyzes the transcript with a language model.
    pub fn analyze(
        &self,
        workdir: &Path,
        params: &AnalysisParams,
        transcript: Option<&Transcript>,
    ) -> Result<StepOutcome<AnalysisReport>, StepError> {
        let transcript = require(self.reporter.as_ref(), StageId::Analyze, transcript)?;
        let variant = params.artifact_variant();
        self.run(StageId::Analyze, workdir, Some(&variant), Some(transcript), to_params(params))
    }

    /// Exports the transcript to file formats.
    pub fn export(
        &self,
        workdir: &Path,
        params: &ExportParams,
        transcript: Option<&Transcript>,
    ) -> Result<StepOutcome<ExportManifest>, StepError> {
        let transcript = require(self.reporter.as_ref(), StageId::Export, transcript)?;
        self.run(StageId::Export, workdir, None, Some(transcript), to_params(params))
    }

    /// Publishes the analysis and exports.
    pub fn publish(
        &self,
        workdir: &Path,
        params: &PublishParams,
        analysis: Option<&AnalysisReport>,
        export: Option<&ExportManifest>,
    ) -> Result<StepOutcome<PublishReceipt>, StepError> {
        let input = publish_input(self.reporter.as_ref(), analysis, export)?;
        self.run(StageId::Publish, workdir, None, Some(&input), to_params(params))
    }

    /// Runs `stage` for `config`, taking upstream output from `inputs`.
    pub fn run_stage(
        &self,
        stage: StageId,
        config: &PipelineConfig,
        inputs: &StageInputs,
    ) -> Result<StepOutcome<StageOutput>, StepError> {
        let workdir = config.workdir();
        match stage {
            StageId::Fetch => self
                .fetch(workdir, config.source())
                .map(|o| o.map(StageOutput::Episode)),
            StageId::Normalize => self
                .normalize(workdir, inputs.episode())
                .map(|o| o.map(StageOutput::Audio)),
            StageId::Transcribe => self
                .transcribe(workdir, config.transcription(), inputs.audio())
                .map(|o| o.map(StageOutput::Transcript)),
            StageId::Align => self
                .align(workdir, config.transcription(), inputs.transcript_before(stage))
                .map(|o| o.map(StageOutput::Transcript)),
            StageId::Diarize => self
                .diarize(workdir, config.transcription(), inputs.transcript_before(stage))
                .map(|o| o.map(StageOutput::Transcript)),
            StageId::Restore => self
                .restore(workdir, config.transcription(), inputs.transcript_before(stage))
                .map(|o| o.map(StageOutput::Transcript)),
            StageId::Analyze => self
                .analyze(workdir, config.analysis(), inputs.transcript_before(stage))
                .map(|o| o.map(StageOutput::Analysis)),
            StageId::Export => self
                .export(workdir, config.export(), inputs.transcript_before(stage))
                .map(|o| o.map(StageOutput::Export)),
            StageId::Publish => self
                .publish(workdir, config.publish(), inputs.analysis(), inputs.export())
                .map(|o| o.map(StageOutput::Publish)),
        }
    }

    /// Runs independent jobs on scoped threads.
    ///
    /// Results come back in submission order. A failing or panicking job
    /// never hides its siblings' results.
    pub fn fan_out<T, F>(jobs: Vec<(StageId, F)>) -> Vec<Result<T, StepError>>
    where
        T: Send,
        F: FnOnce() -> Result<T, StepError> + Send,
    {
        if jobs.len() <= 1 {
            return jobs
                .into_iter()
                .map(|(stage, job)| {
                    panic::catch_unwind(AssertUnwindSafe(job)).unwrap_or_else(|payload| {
                        Err(StepError::Panicked {
                            stage,
                            reason: panic_reason(payload.as_ref()),
                        })
                    })
                })
                .collect();
        }
        thread::scope(|scope| {
            let handles: Vec<_> = jobs
                .into_iter()
                .map(|(stage, job)| (stage, scope.spawn(job)))
                .collect();
            handles
                .into_iter()
                .map(|(stage, handle)| {
                    handle.join().unwrap_or_else(|payload| {
                        Err(StepError::Panicked {
                            stage,
                            reason: panic_reason(payload.as_ref()),
                        })
                    })
                })
                .collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::{NoOpReporter, ReporterCall};
    use crate::testing::ScriptedUnit;
    use pretty_assertions::assert_eq;
    use std::time::Instant;
    use tempfile::TempDir;

    fn executor(unit: &Arc<ScriptedUnit>, reporter: &Arc<NoOpReporter>) -> StepExecutor {
        StepExecutor::new(unit.clone(), reporter.clone())
    }

    #[test]
    fn test_transcribe_persists_artifact() {
        let dir = TempDir::new().unwrap();
        let unit = Arc::new(ScriptedUnit::new());
        let reporter = Arc::new(NoOpReporter::recording());

        let outcome = executor(&unit, &reporter)
            .transcribe(dir.path(), &TranscriptionParams::default(), None)
            .unwrap();

        assert_eq!(outcome.artifact, dir.path().join("transcript-large-v3.json"));
        assert!(outcome.artifact.exists());
        assert!(!outcome.output.segments.is_empty());

        let calls = reporter.calls();
        assert!(matches!(&calls[0], ReporterCall::StartTask { name, .. } if name == "transcribe"));
        assert!(matches!(calls.last(), Some(ReporterCall::CompleteTask { .. })));
    }

    #[test]
    fn test_unit_progress_is_clamped_and_forwarded() {
        let dir = TempDir::new().unwrap();
        let unit = Arc::new(
            ScriptedUnit::new().report_progress(StageId::Transcribe, &[-0.5, 0.4, 2.0]),
        );
        let reporter = Arc::new(NoOpReporter::recording());
        let hooked = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = hooked.clone();
        let hook: StageProgressHook =
            Arc::new(move |stage, fraction| sink.lock().push((stage, fraction)));

        executor(&unit, &reporter)
            .with_progress_hook(Some(hook))
            .transcribe(dir.path(), &TranscriptionParams::default(), None)
            .unwrap();

        let reported: Vec<Option<f64>> = reporter
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                ReporterCall::UpdateStep {
                    message,
                    step: None,
                    progress,
                } if message == "transcribe" => Some(progress),
                _ => None,
            })
            .collect();
        assert_eq!(reported, vec![Some(0.0), Some(0.4), Some(1.0)]);
        assert_eq!(
            *hooked.lock(),
            vec![
                (StageId::Transcribe, 0.0),
                (StageId::Transcribe, 0.4),
                (StageId::Transcribe, 1.0),
            ]
        );
    }

    #[test]
    fn test_unit_failure_is_step_error() {
        let dir = TempDir::new().unwrap();
        let unit = Arc::new(ScriptedUnit::new().fail(StageId::Transcribe, 2, "cuda out of memory"));
        let reporter = Arc::new(NoOpReporter::recording());

        let err = executor(&unit, &reporter)
            .transcribe(dir.path(), &TranscriptionParams::default(), None)
            .unwrap_err();

        assert_eq!(err.stage(), StageId::Transcribe);
        assert_eq!(err.exit_code(), Some(2));
        assert!(!dir.path().join("transcript-large-v3.json").exists());
        assert!(matches!(
            reporter.calls().last(),
            Some(ReporterCall::Error { detail: Some(d), .. }) if d == "cuda out of memory"
        ));
    }

    #[test]
    fn test_missing_transcript_fails_before_invoking() {
        let dir = TempDir::new().unwrap();
        let unit = Arc::new(ScriptedUnit::new());
        let reporter = Arc::new(NoOpReporter::new());

        let err = executor(&unit, &reporter)
            .align(dir.path(), &TranscriptionParams::default(), None)
            .unwrap_err();

        assert!(matches!(
            err,
            StepError::MissingInput {
                stage: StageId::Align,
                needs: StageId::Transcribe
            }
        ));
        assert!(unit.invocations().is_empty());
    }

    #[test]
    fn test_malformed_output_is_decode_error() {
        let dir = TempDir::new().unwrap();
        let unit =
            Arc::new(ScriptedUnit::new().respond(StageId::Fetch, json!({"unexpected": true})));
        let reporter = Arc::new(NoOpReporter::new());

        let source = SourceSelector::Url("https://example.com/a.mp3".to_string());
        let err = executor(&unit, &reporter).fetch(dir.path(), &source).unwrap_err();
        assert!(matches!(err, StepError::Decode { stage: StageId::Fetch, .. }));
    }

    #[test]
    fn test_request_carries_input_and_params() {
        let dir = TempDir::new().unwrap();
        let unit = Arc::new(ScriptedUnit::new());
        let reporter = Arc::new(NoOpReporter::new());
        let exec = executor(&unit, &reporter);

        let params = TranscriptionParams::default();
        let transcript = exec.transcribe(dir.path(), &params, None).unwrap().output;
        exec.align(dir.path(), &params, Some(&transcript)).unwrap();

        let requests = unit.requests();
        assert_eq!(requests[0].input, Value::Null);
        assert_eq!(requests[1].stage, StageId::Align);
        assert_eq!(requests[1].input, serde_json::to_value(&transcript).unwrap());
        assert_eq!(requests[1].params["model"], "large-v3");
    }

    #[test]
    fn test_fan_out_keeps_order_and_siblings() {
        type Job = Box<dyn FnOnce() -> Result<i32, StepError> + Send>;
        let analyze: Job = Box::new(|| {
            thread::sleep(Duration::from_millis(50));
            Ok(1)
        });
        let export: Job = Box::new(|| {
            thread::sleep(Duration::from_millis(50));
            Err(StepError::MissingInput {
                stage: StageId::Export,
                needs: StageId::Transcribe,
            })
        });
        let publish: Job = Box::new(|| -> Result<i32, StepError> { panic!("worker exploded") });

        let start = Instant::now();
        let results = StepExecutor::fan_out(vec![
            (StageId::Analyze, analyze),
            (StageId::Export, export),
            (StageId::Publish, publish),
        ]);

        assert!(start.elapsed() < Duration::from_millis(140));
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].as_ref().unwrap(), &1);
        assert!(matches!(results[1], Err(StepError::MissingInput { .. })));
        assert!(matches!(
            &results[2],
            Err(StepError::Panicked { reason, .. }) if reason == "worker exploded"
        ));
    }
}
