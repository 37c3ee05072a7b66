//! On-disk naming conventions for stage artifacts.

use crate::core::StageId;
use std::path::{Path, PathBuf};

/// How a stage names its primary artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactNaming {
    /// A single fixed file name.
    Fixed(&'static str),
    /// `<prefix><variant>.json`, where the variant is a model or template slug.
    Variant(&'static str),
}

/// Where a stage's output lives and what its presence implies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArtifactConvention {
    /// The stage that writes this artifact.
    pub stage: StageId,
    /// Primary naming scheme.
    pub naming: ArtifactNaming,
    /// Older names still recognized, lower priority than the primary name.
    pub legacy: &'static [&'static str],
    /// Stages whose completion the presence of this artifact proves.
    pub implies: &'static [StageId],
}

/// Conventions for every stage, indexed by `StageId::index`.
pub static CONVENTIONS: [ArtifactConvention; StageId::COUNT] = [
    ArtifactConvention {
        stage: StageId::Fetch,
        naming: ArtifactNaming::Fixed("episode-meta.json"),
        legacy: &["episode.json"],
        implies: &[],
    },
    ArtifactConvention {
        stage: StageId::Normalize,
        naming: ArtifactNaming::Fixed("audio-meta.json"),
        legacy: &[],
        implies: &[],
    },
    ArtifactConvention {
        stage: StageId::Transcribe,
        naming: ArtifactNaming::Variant("transcript-"),
        legacy: &["transcript.json"],
        implies: &[],
    },
    ArtifactConvention {
        stage: StageId::Align,
        naming: ArtifactNaming::Variant("transcript-aligned-"),
        legacy: &["aligned-transcript.json"],
        implies: &[StageId::Transcribe],
    },
    ArtifactConvention {
        stage: StageId::Diarize,
        naming: ArtifactNaming::Variant("transcript-diarized-"),
        legacy: &["diarized-transcript.json"],
        implies: &[StageId::Align, StageId::Transcribe],
    },
    ArtifactConvention {
        stage: StageId::Restore,
        naming: ArtifactNaming::Variant("transcript-restored-"),
        legacy: &["transcript-preprocessed.json"],
        implies: &[StageId::Transcribe],
    },
    ArtifactConvention {
        stage: StageId::Analyze,
        naming: ArtifactNaming::Variant("analysis-"),
        legacy: &["deepcast.json"],
        implies: &[],
    },
    ArtifactConvention {
        stage: StageId::Export,
        naming: ArtifactNaming::Fixed("export-manifest.json"),
        legacy: &[],
        implies: &[],
    },
    ArtifactConvention {
        stage: StageId::Publish,
        naming: ArtifactNaming::Fixed("publish-receipt.json"),
        legacy: &[],
        implies: &[],
    },
];

/// The artifact convention for `stage`.
#[must_use]
pub fn convention(stage: StageId) -> &'static ArtifactConvention {
    &CONVENTIONS[stage.index()]
}

/// The file a stage writes in `workdir` for the given variant.
///
/// Variant-named stages without a variant fall back to their first legacy
/// name.
#[must_use]
pub fn artifact_path(workdir: &Path, stage: StageId, variant: Option<&str>) -> PathBuf {
    let conv = convention(stage);
    let name = match (conv.naming, variant) {
        (ArtifactNaming::Fixed(name), _) => name.to_string(),
        (ArtifactNaming::Variant(prefix), Some(variant)) => format!("{prefix}{variant}.json"),
        (ArtifactNaming::Variant(prefix), None) => conv
            .legacy
            .first()
            .map_or_else(|| format!("{prefix}default.json"), |legacy| (*legacy).to_string()),
    };
    workdir.join(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conventions_indexed_by_stage() {
        for (i, conv) in CONVENTIONS.iter().enumerate() {
            assert_eq!(conv.stage.index(), i);
        }
    }

    #[test]
    fn test_artifact_path() {
        let dir = Path::new("/work");
        assert_eq!(
            artifact_path(dir, StageId::Align, Some("large-v3")),
            PathBuf::from("/work/transcript-aligned-large-v3.json")
        );
        assert_eq!(
            artifact_path(dir, StageId::Transcribe, None),
            PathBuf::from("/work/transcript.json")
        );
        assert_eq!(
            artifact_path(dir, StageId::Publish, Some("ignored")),
            PathBuf::from("/work/publish-receipt.json")
        );
    }

    #[test]
    fn test_diarize_implies_align() {
        assert!(convention(StageId::Diarize).implies.contains(&StageId::Align));
    }
}
