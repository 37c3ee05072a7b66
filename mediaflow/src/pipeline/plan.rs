//! Deciding what a run does before it does anything.

use crate::artifacts::{ArtifactDetector, DetectedArtifacts};
use crate::config::PipelineConfig;
use crate::core::{StageGraph, StageId, StageMap};
use crate::state::{hash_parameters, RunStateStore};
use std::collections::BTreeSet;
use tracing::debug;

/// The stages a run will skip and the waves it will execute.
///
/// Each wave runs after the previous one finishes. A wave of more than one
/// stage holds concurrency-eligible siblings with no dependency on each
/// other; every other wave holds exactly one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPlan {
    requested: BTreeSet<StageId>,
    skipped: Vec<StageId>,
    waves: Vec<Vec<StageId>>,
    dependencies: StageMap<BTreeSet<StageId>>,
}

impl ExecutionPlan {
    /// Plans `requested`, skipping the stages in `satisfied`.
    ///
    /// A satisfied stage still runs when one of its dependencies runs, so
    /// outputs never go stale behind a re-run upstream stage.
    #[must_use]
    pub fn build(requested: &BTreeSet<StageId>, satisfied: &BTreeSet<StageId>) -> Self {
        let dependencies =
            StageMap::from_fn(|stage| StageGraph::effective_dependencies(stage, requested));

        let mut skipped = Vec::new();
        let mut pending = BTreeSet::new();
        for stage in StageGraph::topological_order(requested) {
            let upstream_runs = dependencies[stage].iter().any(|dep| pending.contains(dep));
            if satisfied.contains(&stage) && !upstream_runs {
                skipped.push(stage);
            } else {
                pending.insert(stage);
            }
        }

        let mut waves = Vec::new();
        let mut done: BTreeSet<StageId> = skipped.iter().copied().collect();
        while !pending.is_empty() {
            let ready: Vec<StageId> = pending
                .iter()
                .copied()
                .filter(|stage| dependencies[*stage].iter().all(|dep| done.contains(dep)))
                .collect();
            let concurrent: Vec<StageId> =
                ready.iter().copied().filter(|s| s.is_concurrent()).collect();
            let wave = if concurrent.len() > 1 {
                concurrent
            } else {
                // The graph is acyclic, so something is always ready.
                ready.into_iter().take(1).collect()
            };
            if wave.is_empty() {
                break;
            }
            for stage in &wave {
                pending.remove(stage);
                done.insert(*stage);
            }
            waves.push(wave);
        }

        Self {
            requested: requested.clone(),
            skipped,
            waves,
            dependencies,
        }
    }

    /// Plans `config` against what its working directory already holds.
    ///
    /// A requested stage is satisfied when a well-formed artifact proves it
    /// complete under the config's variant, directly or through a downstream
    /// artifact that implies it, and the run state does not show it last ran
    /// with different parameters. The run state alone never satisfies a
    /// stage. With `skip_completed` off nothing is satisfied.
    #[must_use]
    pub fn for_config(
        config: &PipelineConfig,
        detected: &DetectedArtifacts,
        state: &RunStateStore,
    ) -> Self {
        let satisfied: BTreeSet<StageId> = if config.skip_completed() {
            let found = detected.stages();
            config
                .stages()
                .iter()
                .copied()
                .filter(|&stage| {
                    let hash = hash_parameters(&config.stage_params(stage));
                    found.contains(&stage) && !state.params_changed(stage, &hash)
                })
                .collect()
        } else {
            BTreeSet::new()
        };

        let plan = Self::build(config.stages(), &satisfied);
        debug!(
            workdir = %config.workdir().display(),
            skipped = ?plan.skipped,
            waves = ?plan.waves,
            "Planned run"
        );
        plan
    }

    /// Plans `config` by scanning its working directory.
    #[must_use]
    pub fn scan(config: &PipelineConfig) -> Self {
        let detected = ArtifactDetector::scan_with(config.workdir(), &config.artifact_variants());
        let state = RunStateStore::load(config.workdir());
        Self::for_config(config, &detected, &state)
    }

    /// Every requested stage.
    #[must_use]
    pub fn requested(&self) -> &BTreeSet<StageId> {
        &self.requested
    }

    /// Stages that will not run, in dependency order.
    #[must_use]
    pub fn skipped(&self) -> &[StageId] {
        &self.skipped
    }

    /// Waves to execute, in order.
    #[must_use]
    pub fn waves(&self) -> &[Vec<StageId>] {
        &self.waves
    }

    /// Stages that will run, in execution order.
    #[must_use]
    pub fn to_run(&self) -> Vec<StageId> {
        self.waves.iter().flatten().copied().collect()
    }

    /// Dependencies of `stage` among the requested stages.
    #[must_use]
    pub fn dependencies(&self, stage: StageId) -> &BTreeSet<StageId> {
        &self.dependencies[stage]
    }

    /// Returns true if nothing needs to run.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.waves.is_empty()
    }
}
