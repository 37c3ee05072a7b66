//! Read-only scan of a working directory for stage artifacts.

use super::conventions::{convention, ArtifactNaming, CONVENTIONS};
use crate::core::{
    AnalysisReport, AudioMeta, EpisodeMeta, ExportManifest, PublishReceipt, StageId, StageMap,
    Transcript,
};
use regex::Regex;
use serde::de::DeserializeOwned;
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::SystemTime;
use tracing::debug;

/// Per-stage variant the current configuration writes.
///
/// When a stage has a preferred variant, only files of that variant (or
/// legacy names) count for it.
pub type VariantPreferences = StageMap<Option<String>>;

/// Variant-named conventions, most specific prefix first, so
/// `transcript-aligned-x.json` is never read as a transcribe variant.
static VARIANT_PATTERNS: LazyLock<Vec<(StageId, Regex)>> = LazyLock::new(|| {
    let mut patterns: Vec<(StageId, &'static str)> = CONVENTIONS
        .iter()
        .filter_map(|conv| match conv.naming {
            ArtifactNaming::Variant(prefix) => Some((conv.stage, prefix)),
            ArtifactNaming::Fixed(_) => None,
        })
        .collect();
    patterns.sort_by(|a, b| b.1.len().cmp(&a.1.len()));
    patterns
        .into_iter()
        .filter_map(|(stage, prefix)| {
            Regex::new(&format!(r"^{}([A-Za-z0-9][A-Za-z0-9._-]*)\.json$", regex::escape(prefix)))
                .ok()
                .map(|re| (stage, re))
        })
        .collect()
});

/// A validated artifact found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedArtifact {
    /// Stage that produced it.
    pub stage: StageId,
    /// Full path.
    pub path: PathBuf,
    /// Model or template slug, for variant-named artifacts.
    pub variant: Option<String>,
    /// Whether the file uses a legacy name.
    pub legacy: bool,
    /// Last modification time.
    pub modified: SystemTime,
}

impl DetectedArtifact {
    /// Ranks two candidates for the same stage: primary names beat legacy
    /// names, then newer beats older, then name order for determinism.
    fn preference(&self, other: &Self) -> Ordering {
        other
            .legacy
            .cmp(&self.legacy)
            .then(self.modified.cmp(&other.modified))
            .then(other.path.cmp(&self.path))
    }
}

/// Best artifact per stage, plus every stage proven complete.
#[derive(Debug, Clone, Default)]
pub struct DetectedArtifacts {
    best: StageMap<Option<DetectedArtifact>>,
    candidates: Vec<DetectedArtifact>,
}

impl DetectedArtifacts {
    /// The preferred artifact for `stage`, if any file of its own exists.
    #[must_use]
    pub fn get(&self, stage: StageId) -> Option<&DetectedArtifact> {
        self.best[stage].as_ref()
    }

    /// The artifact proving `stage` complete: its own file, or else the
    /// first downstream artifact that implies it.
    #[must_use]
    pub fn evidence(&self, stage: StageId) -> Option<&DetectedArtifact> {
        self.get(stage).or_else(|| {
            self.iter()
                .find(|found| convention(found.stage).implies.contains(&stage))
        })
    }

    /// Every stage proven complete, including stages implied by a
    /// downstream artifact.
    #[must_use]
    pub fn stages(&self) -> BTreeSet<StageId> {
        let mut stages = BTreeSet::new();
        for (stage, found) in self.best.iter() {
            if found.is_some() {
                stages.insert(stage);
                stages.extend(convention(stage).implies.iter().copied());
            }
        }
        stages
    }

    /// Returns true if `stage` is proven complete.
    #[must_use]
    pub fn contains(&self, stage: StageId) -> bool {
        self.stages().contains(&stage)
    }

    /// The preferred artifacts, in stage order.
    pub fn iter(&self) -> impl Iterator<Item = &DetectedArtifact> {
        self.best.iter().filter_map(|(_, found)| found.as_ref())
    }

    /// Files made redundant by a downstream artifact that implies their
    /// stage. Deleting them keeps the stage detectable through `implies`.
    #[must_use]
    pub fn superseded(&self) -> Vec<PathBuf> {
        let implied: BTreeSet<StageId> = self
            .iter()
            .flat_map(|found| convention(found.stage).implies.iter().copied())
            .collect();
        self.candidates
            .iter()
            .filter(|c| implied.contains(&c.stage))
            .map(|c| c.path.clone())
            .collect()
    }

    /// Returns true if no artifact was found.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}

/// Finds and validates stage artifacts in a working directory.
#[derive(Debug, Clone, Copy, Default)]
pub struct ArtifactDetector;

impl ArtifactDetector {
    /// Stages whose output exists in `workdir`, any variant.
    #[must_use]
    pub fn detect(workdir: &Path) -> BTreeSet<StageId> {
        Self::scan(workdir).stages()
    }

    /// Stages whose output exists in `workdir`, restricted to `variants`.
    #[must_use]
    pub fn detect_with(workdir: &Path, variants: &VariantPreferences) -> BTreeSet<StageId> {
        Self::scan_with(workdir, variants).stages()
    }

    /// Scans `workdir`, accepting any variant.
    #[must_use]
    pub fn scan(workdir: &Path) -> DetectedArtifacts {
        Self::scan_with(workdir, &VariantPreferences::default())
    }

    /// Scans `workdir`, accepting only the preferred variant per stage.
    ///
    /// Missing or unreadable directories, zero-byte files, and files that do
    /// not match their stage's shape are ignored.
    #[must_use]
    pub fn scan_with(workdir: &Path, variants: &VariantPreferences) -> DetectedArtifacts {
        let mut result = DetectedArtifacts::default();

        let Ok(entries) = fs::read_dir(workdir) else {
            return result;
        };

        for entry in entries.flatten() {
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            if !meta.is_file() || meta.len() == 0 {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let Some((stage, variant, legacy)) = classify(name) else {
                continue;
            };
            if let (Some(wanted), Some(found)) = (variants[stage].as_deref(), variant.as_deref()) {
                if wanted != found {
                    debug!(stage = %stage, file = name, "Ignoring artifact of another variant");
                    continue;
                }
            }
            let path = entry.path();
            if !is_valid(stage, &path) {
                debug!(stage = %stage, file = name, "Ignoring malformed artifact");
                continue;
            }

            let candidate = DetectedArtifact {
                stage,
                path,
                variant,
                legacy,
                modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            };
            let replace = result.best[stage]
                .as_ref()
                .map_or(true, |current| candidate.preference(current) == Ordering::Greater);
            if replace {
                result.best[stage] = Some(candidate.clone());
            }
            result.candidates.push(candidate);
        }

        result
    }

    /// Loads the preferred artifact for `stage` as `T`.
    #[must_use]
    pub fn load<T: DeserializeOwned>(workdir: &Path, stage: StageId) -> Option<(T, PathBuf)> {
        Self::load_with(workdir, stage, &VariantPreferences::default())
    }

    /// Loads the preferred artifact for `stage` as `T`, honoring `variants`.
    #[must_use]
    pub fn load_with<T: DeserializeOwned>(
        workdir: &Path,
        stage: StageId,
        variants: &VariantPreferences,
    ) -> Option<(T, PathBuf)> {
        let scan = Self::scan_with(workdir, variants);
        let found = scan.get(stage)?;
        let value = read_json(&found.path)?;
        Some((value, found.path.clone()))
    }
}

fn classify(name: &str) -> Option<(StageId, Option<String>, bool)> {
    for conv in &CONVENTIONS {
        if let ArtifactNaming::Fixed(fixed) = conv.naming {
            if fixed == name {
                return Some((conv.stage, None, false));
            }
        }
        if conv.legacy.contains(&name) {
            return Some((conv.stage, None, true));
        }
    }
    VARIANT_PATTERNS.iter().find_map(|(stage, re)| {
        re.captures(name)
            .and_then(|caps| caps.get(1))
            .map(|m| (*stage, Some(m.as_str().to_string()), false))
    })
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let bytes = fs::read(path).ok()?;
    serde_json::from_slice(&bytes).ok()
}

fn is_valid(stage: StageId, path: &Path) -> bool {
    match stage {
        StageId::Fetch => read_json::<EpisodeMeta>(path).is_some(),
        StageId::Normalize => read_json::<AudioMeta>(path).is_some(),
        StageId::Transcribe | StageId::Restore => read_json::<Transcript>(path).is_some(),
        StageId::Align => read_json::<Transcript>(path).is_some_and(|t| t.is_aligned()),
        StageId::Diarize => read_json::<Transcript>(path).is_some_and(|t| t.has_speakers()),
        StageId::Analyze => read_json::<AnalysisReport>(path).is_some(),
        StageId::Export => read_json::<ExportManifest>(path).is_some(),
        StageId::Publish => read_json::<PublishReceipt>(path).is_some(),
    }
}
