//! Bookkeeping shared by the blocking and async services.
//!
//! A [`Run`] owns everything about one execution except invoking stages:
//! planning, the run state, the manifest session, blocking, cancellation,
//! and assembling the result. The services only decide how stage units are
//! driven.

use super::plan::ExecutionPlan;
use super::result::{BlockedStage, PipelineResult, StageError};
use crate::artifacts::{ArtifactDetector, DetectedArtifacts};
use crate::config::{EpisodeFilter, PipelineConfig, SourceSelector};
use crate::core::{RunStatus, StageId, StageMap, StageStatus};
use crate::errors::{MediaflowError, StepError};
use crate::executor::{StageInputs, StageOutput, StageProgressHook, StepOutcome};
use crate::manifest::{EpisodeInfo, ManifestManager};
use crate::progress::ProgressReporter;
use crate::state::{hash_parameters, RunStateStore};
use std::fs;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Called on every stage status change of a run.
pub type StageObserver = Arc<dyn Fn(StageId, StageStatus) + Send + Sync>;

pub(crate) struct Run<'a> {
    config: &'a PipelineConfig,
    manifest: Option<&'a ManifestManager>,
    observer: &'a (dyn Fn(StageId, StageStatus) + Send + Sync),
    reporter: &'a dyn ProgressReporter,
    state: RunStateStore,
    plan: ExecutionPlan,
    inputs: StageInputs,
    statuses: StageMap<StageStatus>,
    blocked_by: StageMap<Option<StageId>>,
    episode_id: String,
    session: Option<String>,
    session_index: StageMap<Option<usize>>,
    finished: usize,
    result: PipelineResult,
    started: Instant,
}

impl<'a> Run<'a> {
    /// Prepares the working directory, plans the run, and records skips.
    pub(crate) fn begin(
        config: &'a PipelineConfig,
        manifest: Option<&'a ManifestManager>,
        observer: &'a (dyn Fn(StageId, StageStatus) + Send + Sync),
        reporter: &'a dyn ProgressReporter,
    ) -> Result<Self, MediaflowError> {
        let started = Instant::now();
        let workdir = config.workdir();
        fs::create_dir_all(workdir)?;

        let variants = config.artifact_variants();
        let detected = ArtifactDetector::scan_with(workdir, &variants);
        let state = RunStateStore::load(workdir);
        let plan = ExecutionPlan::for_config(config, &detected, &state);

        let mut run = Self {
            config,
            manifest,
            observer,
            reporter,
            inputs: StageInputs::from_disk(workdir, &variants),
            state,
            statuses: StageMap::default(),
            blocked_by: StageMap::default(),
            episode_id: config.episode_id(),
            session: None,
            session_index: StageMap::default(),
            finished: 0,
            result: PipelineResult::new(workdir.to_path_buf()),
            started,
            plan,
        };
        run.result.status = RunStatus::Running;
        info!(
            workdir = %workdir.display(),
            episode = %run.episode_id,
            stages = run.plan.to_run().len(),
            skipped = run.plan.skipped().len(),
            "Starting pipeline run"
        );
        reporter.start_task(&run.episode_id, Some(run.plan.to_run().len()));

        run.open_manifest_session();
        for stage in run.plan.skipped().to_vec() {
            run.skip(stage, &detected);
        }
        Ok(run)
    }

    pub(crate) fn waves(&self) -> Vec<Vec<StageId>> {
        self.plan.waves().to_vec()
    }

    pub(crate) fn inputs(&self) -> &StageInputs {
        &self.inputs
    }

    /// Filters `wave` down to stages whose dependencies all succeeded,
    /// marks the rest blocked, and records the start of the runnable ones.
    pub(crate) fn admit(&mut self, wave: &[StageId]) -> Vec<StageId> {
        let mut ready = Vec::with_capacity(wave.len());
        for &stage in wave {
            match self.blocker(stage) {
                Some(root) => self.block(stage, root),
                None => ready.push(stage),
            }
        }
        for &stage in &ready {
            self.start(stage);
        }
        ready
    }

    /// Records the outcome of a stage that ran.
    pub(crate) fn record(
        &mut self,
        stage: StageId,
        outcome: Result<StepOutcome<StageOutput>, StepError>,
    ) {
        match outcome {
            Ok(outcome) => self.complete(stage, outcome),
            Err(err) => self.fail(stage, &err),
        }
    }

    /// Marks every stage that has not finished as cancelled.
    pub(crate) fn cancel_remaining(&mut self, reason: &str) {
        info!(workdir = %self.config.workdir().display(), reason, "Pipeline cancelled");
        for stage in self.plan.to_run() {
            if !self.statuses[stage].is_terminal() {
                self.set_status(stage, StageStatus::Cancelled);
            }
        }
        self.result.status = RunStatus::Cancelled;
    }

    /// Closes the session, cleans intermediates, and returns the result.
    pub(crate) fn finish(mut self) -> PipelineResult {
        let failed = !self.result.failed_stages().is_empty();
        if failed {
            self.result.status = RunStatus::Failed;
        } else if self.result.status != RunStatus::Cancelled {
            self.result.status = RunStatus::Completed;
        }

        if self.result.status == RunStatus::Completed && self.config.clean_intermediates() {
            self.clean_intermediates();
        }
        self.close_manifest_session();

        self.result.duration = self.started.elapsed();
        info!(
            workdir = %self.result.workdir.display(),
            status = %self.result.status,
            completed = self.result.steps_completed.len(),
            skipped = self.result.steps_skipped.len(),
            blocked = self.result.steps_blocked.len(),
            duration = ?self.result.duration,
            "Pipeline run finished"
        );
        self.reporter.complete_task(
            &format!("{} {}", self.episode_id, self.result.status),
            Some(self.result.duration),
        );
        self.result
    }

    /// The failed stage at the root of whatever blocks `stage`, if any.
    fn blocker(&self, stage: StageId) -> Option<StageId> {
        self.plan.dependencies(stage).iter().find_map(|&dep| {
            match self.statuses[dep] {
                StageStatus::Failed => Some(dep),
                StageStatus::Blocked | StageStatus::Cancelled => {
                    Some(self.blocked_by[dep].unwrap_or(dep))
                }
                _ => None,
            }
        })
    }

    fn skip(&mut self, stage: StageId, detected: &DetectedArtifacts) {
        debug!(stage = %stage, "Skipping satisfied stage");
        self.result.steps_skipped.push(stage);
        if let Some(found) = detected.get(stage) {
            self.result.artifacts.insert(stage, found.path.clone());
        }
        let evidence = detected.evidence(stage).map(|a| a.path.clone());
        if let (Some(manifest), Some(path)) = (self.manifest, evidence) {
            let tracked = manifest
                .episode(&self.episode_id)
                .is_some_and(|e| e.is_completed(stage));
            if !tracked {
                if let Err(e) = manifest.complete_stage(&self.episode_id, stage, vec![path]) {
                    self.state_error(Some(stage), &e);
                }
            }
        }
        self.set_status(stage, StageStatus::Skipped);
    }

    fn start(&mut self, stage: StageId) {
        info!(stage = %stage, "Stage started");
        let hash = hash_parameters(&self.config.stage_params(stage));
        if let Err(e) = self.state.start_stage(stage, Some(hash)) {
            self.state_error(Some(stage), &e);
        }
        if let Some(manifest) = self.manifest {
            if let Err(e) =
                manifest.start_stage(&self.episode_id, stage, self.config.model_for(stage))
            {
                self.state_error(Some(stage), &e);
            }
        }
        self.set_status(stage, StageStatus::Running);
    }

    fn complete(&mut self, stage: StageId, outcome: StepOutcome<StageOutput>) {
        info!(
            stage = %stage,
            duration = ?outcome.duration,
            artifact = %outcome.artifact.display(),
            "Stage completed"
        );
        self.reporter.complete_step(stage.as_str(), Some(outcome.duration));
        if let Err(e) = self.state.complete_stage(stage) {
            self.state_error(Some(stage), &e);
        }
        if let Some(manifest) = self.manifest {
            if let Err(e) =
                manifest.complete_stage(&self.episode_id, stage, vec![outcome.artifact.clone()])
            {
                self.state_error(Some(stage), &e);
            }
        }
        self.result.steps_completed.push(stage);
        self.result.artifacts.insert(stage, outcome.artifact);
        self.inputs.insert(stage, outcome.output);
        self.set_status(stage, StageStatus::Completed);
    }

    fn fail(&mut self, stage: StageId, err: &StepError) {
        let message = err.to_string();
        error!(stage = %stage, error = %message, "Stage failed");
        if let Err(e) = self.state.fail_stage(stage, message.clone()) {
            self.state_error(Some(stage), &e);
        }
        if let Some(manifest) = self.manifest {
            if let Err(e) = manifest.fail_stage(&self.episode_id, stage, &message) {
                self.state_error(Some(stage), &e);
            }
        }
        self.result.errors.push(StageError::failed(stage, message));
        self.set_status(stage, StageStatus::Failed);
    }

    fn block(&mut self, stage: StageId, root: StageId) {
        warn!(stage = %stage, blocked_by = %root, "Stage blocked by failed dependency");
        self.blocked_by[stage] = Some(root);
        self.result.steps_blocked.push(BlockedStage {
            stage,
            blocked_by: root,
        });
        self.set_status(stage, StageStatus::Blocked);
    }

    fn set_status(&mut self, stage: StageId, status: StageStatus) {
        self.statuses[stage] = status;
        if let (Some(manifest), Some(session), Some(index)) =
            (self.manifest, &self.session, self.session_index[stage])
        {
            if let Err(e) = manifest.update_session_stage(session, index, status) {
                warn!(session = %session, error = %e, "Could not update session");
                self.result.errors.push(StageError::state(Some(stage), e.to_string()));
            }
        }
        if status.is_terminal() && status != StageStatus::Skipped {
            self.advance(stage, status);
        }
        (self.observer)(stage, status);
    }

    /// Reports one more planned stage as finished, whatever its outcome.
    fn advance(&mut self, stage: StageId, status: StageStatus) {
        let total = self.plan.to_run().len();
        self.finished += 1;
        let fraction = if total == 0 {
            1.0
        } else {
            self.finished as f64 / total as f64
        };
        self.reporter.update_step(
            &format!("{stage} {status}"),
            Some(self.finished),
            Some(fraction.min(1.0)),
        );
    }

    fn state_error(&mut self, stage: Option<StageId>, err: &dyn std::fmt::Display) {
        warn!(stage = ?stage, error = %err, "Could not record progress");
        self.result.errors.push(StageError::state(stage, err.to_string()));
    }

    fn open_manifest_session(&mut self) {
        let Some(manifest) = self.manifest else {
            return;
        };
        if let Err(e) = manifest.add_or_update_episode(episode_info(self.config)) {
            self.state_error(None, &e);
            return;
        }
        let stages = self.plan.to_run();
        for (index, &stage) in stages.iter().enumerate() {
            self.session_index[stage] = Some(index);
        }
        match manifest.create_session(&self.episode_id, stages) {
            Ok(session) => self.session = Some(session.id),
            Err(e) => self.state_error(None, &e),
        }
    }

    fn close_manifest_session(&mut self) {
        let (Some(manifest), Some(session)) = (self.manifest, self.session.clone()) else {
            return;
        };
        let closed = match self.result.status {
            RunStatus::Completed => manifest.complete_session(&session),
            RunStatus::Cancelled => manifest.fail_session(&session, Some("cancelled")),
            _ => {
                let summary: Vec<String> =
                    self.result.failures().map(ToString::to_string).collect();
                manifest.fail_session(&session, Some(&summary.join("; ")))
            }
        };
        if let Err(e) = closed {
            self.state_error(None, &e);
        }
    }

    fn clean_intermediates(&mut self) {
        let scan =
            ArtifactDetector::scan_with(self.config.workdir(), &self.config.artifact_variants());
        for path in scan.superseded() {
            match fs::remove_file(&path) {
                Ok(()) => {
                    debug!(path = %path.display(), "Removed intermediate artifact");
                    self.result.artifacts.retain(|_, kept| *kept != path);
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Could not remove intermediate");
                }
            }
        }
    }
}

/// Mirrors unit progress reports into the manifest's stage records.
pub(crate) fn manifest_progress(
    manifest: Option<Arc<ManifestManager>>,
    episode_id: String,
) -> Option<StageProgressHook> {
    let manifest = manifest?;
    Some(Arc::new(move |stage: StageId, fraction: f64| {
        if let Err(e) = manifest.update_stage_progress(&episode_id, stage, fraction) {
            warn!(stage = %stage, error = %e, "Could not record stage progress");
        }
    }))
}

fn episode_info(config: &PipelineConfig) -> EpisodeInfo {
    let path = config.workdir().to_path_buf();
    match config.source() {
        SourceSelector::Show { name, filter } => {
            let info = EpisodeInfo::new(config.episode_id(), name.clone(), path);
            match filter {
                EpisodeFilter::Latest => info,
                EpisodeFilter::Date(date) => info.with_date(date.to_string()),
                EpisodeFilter::Title(title) => info.with_title(title.clone()),
            }
        }
        SourceSelector::Url(url) => EpisodeInfo::new(config.episode_id(), url.clone(), path),
    }
}
