//! Typed stage outputs and the upstream view handed to each stage.

use crate::artifacts::{ArtifactDetector, VariantPreferences};
use crate::core::{
    AnalysisReport, AudioMeta, EpisodeMeta, ExportManifest, PublishReceipt, StageId, StageMap,
    Transcript,
};
use std::path::Path;

/// The typed output of any stage.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutput {
    /// From fetch.
    Episode(EpisodeMeta),
    /// From normalize.
    Audio(AudioMeta),
    /// From transcribe, align, diarize, or restore.
    Transcript(Transcript),
    /// From analyze.
    Analysis(AnalysisReport),
    /// From export.
    Export(ExportManifest),
    /// From publish.
    Publish(PublishReceipt),
}

#[derive(Debug, Clone)]
struct Slot {
    output: StageOutput,
    fresh: bool,
}

const TRANSCRIPT_STAGES: [StageId; 4] = [
    StageId::Restore,
    StageId::Diarize,
    StageId::Align,
    StageId::Transcribe,
];

/// Upstream outputs available to stages of one run.
///
/// Outputs produced during this run take precedence over artifacts loaded
/// from disk.
#[derive(Debug, Clone, Default)]
pub struct StageInputs {
    slots: StageMap<Option<Slot>>,
}

impl StageInputs {
    /// Empty inputs.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads every artifact present in `workdir` matching `variants`.
    #[must_use]
    pub fn from_disk(workdir: &Path, variants: &VariantPreferences) -> Self {
        let mut inputs = Self::new();
        for stage in StageId::ALL {
            let loaded = match stage {
                StageId::Fetch => ArtifactDetector::load_with(workdir, stage, variants)
                    .map(|(v, _)| StageOutput::Episode(v)),
                StageId::Normalize => ArtifactDetector::load_with(workdir, stage, variants)
                    .map(|(v, _)| StageOutput::Audio(v)),
                StageId::Transcribe | StageId::Align | StageId::Diarize | StageId::Restore => {
                    ArtifactDetector::load_with(workdir, stage, variants)
                        .map(|(v, _)| StageOutput::Transcript(v))
                }
                StageId::Analyze => ArtifactDetector::load_with(workdir, stage, variants)
                    .map(|(v, _)| StageOutput::Analysis(v)),
                StageId::Export => ArtifactDetector::load_with(workdir, stage, variants)
                    .map(|(v, _)| StageOutput::Export(v)),
                StageId::Publish => ArtifactDetector::load_with(workdir, stage, variants)
                    .map(|(v, _)| StageOutput::Publish(v)),
            };
            if let Some(output) = loaded {
                inputs.slots[stage] = Some(Slot {
                    output,
                    fresh: false,
                });
            }
        }
        inputs
    }

    /// Records the output `stage` produced in this run.
    pub fn insert(&mut self, stage: StageId, output: StageOutput) {
        self.slots[stage] = Some(Slot { output, fresh: true });
    }

    /// The output recorded for `stage`.
    #[must_use]
    pub fn get(&self, stage: StageId) -> Option<&StageOutput> {
        self.slots[stage].as_ref().map(|slot| &slot.output)
    }

    /// The fetched episode metadata.
    #[must_use]
    pub fn episode(&self) -> Option<&EpisodeMeta> {
        match self.get(StageId::Fetch) {
            Some(StageOutput::Episode(meta)) => Some(meta),
            _ => None,
        }
    }

    /// The normalized audio metadata.
    #[must_use]
    pub fn audio(&self) -> Option<&AudioMeta> {
        match self.get(StageId::Normalize) {
            Some(StageOutput::Audio(meta)) => Some(meta),
            _ => None,
        }
    }

    /// The most refined transcript produced before `stage`.
    ///
    /// A transcript from this run beats any on disk, so a forced re-run
    /// never feeds a stale downstream file into a fresh stage.
    #[must_use]
    pub fn transcript_before(&self, stage: StageId) -> Option<&Transcript> {
        self.transcript_slots(stage)
            .find(|slot| slot.fresh)
            .or_else(|| self.transcript_slots(stage).next())
            .and_then(|slot| match &slot.output {
                StageOutput::Transcript(t) => Some(t),
                _ => None,
            })
    }

    fn transcript_slots(&self, stage: StageId) -> impl Iterator<Item = &Slot> + '_ {
        TRANSCRIPT_STAGES
            .iter()
            .filter(move |s| **s < stage)
            .filter_map(move |s| self.slots[*s].as_ref())
    }

    /// The analysis report.
    #[must_use]
    pub fn analysis(&self) -> Option<&AnalysisReport> {
        match self.get(StageId::Analyze) {
            Some(StageOutput::Analysis(report)) => Some(report),
            _ => None,
        }
    }

    /// The export manifest.
    #[must_use]
    pub fn export(&self) -> Option<&ExportManifest> {
        match self.get(StageId::Export) {
            Some(StageOutput::Export(manifest)) => Some(manifest),
            _ => None,
        }
    }
}
