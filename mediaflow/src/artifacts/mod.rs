//! Artifact detection.
//!
//! Stages leave conventional files in the working directory. The detector
//! reads those files (never writes) to decide which stages are already done
//! and to hydrate the typed output of skipped stages.

mod conventions;
mod detector;

pub use conventions::{artifact_path, convention, ArtifactConvention, ArtifactNaming, CONVENTIONS};
pub use detector::{ArtifactDetector, DetectedArtifact, DetectedArtifacts, VariantPreferences};
