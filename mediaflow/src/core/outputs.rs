//! Typed documents exchanged with stage units.
//!
//! Each stage unit consumes and produces JSON. These types pin down the
//! fields the orchestrator relies on; anything else a unit emits is kept in
//! `extra` and written back untouched.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;

/// Output of the fetch stage: which episode was acquired.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeMeta {
    /// Show (feed) name.
    pub show: String,
    /// Episode title.
    pub title: String,
    /// Publication date as reported by the source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    /// Where the media was fetched from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_url: Option<String>,
    /// Where the media was stored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_path: Option<PathBuf>,
    /// Unit-specific fields.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Output of the normalize stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioMeta {
    /// Path of the normalized audio file.
    pub audio_path: PathBuf,
    /// Sample rate in Hz.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_rate: Option<u32>,
    /// Channel count.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u16>,
    /// Duration in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
    /// Unit-specific fields.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A word with timestamps, produced by alignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Word {
    /// The word text.
    pub word: String,
    /// Start time in seconds.
    pub start: f64,
    /// End time in seconds.
    pub end: f64,
    /// Alignment confidence.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

/// A transcript segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    /// Start time in seconds.
    pub start: f64,
    /// End time in seconds.
    pub end: f64,
    /// Segment text.
    pub text: String,
    /// Speaker label, once diarized.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speaker: Option<String>,
    /// Word timings, once aligned.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub words: Vec<Word>,
}

/// A transcript, as produced by transcribe and refined by align, diarize,
/// and restore.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    /// Ordered segments.
    pub segments: Vec<Segment>,
    /// Detected or requested language.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    /// Recognition model that produced the transcript.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Unit-specific fields.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Transcript {
    /// True when every segment carries word timings.
    #[must_use]
    pub fn is_aligned(&self) -> bool {
        !self.segments.is_empty() && self.segments.iter().all(|s| !s.words.is_empty())
    }

    /// True when at least one segment carries a speaker label.
    #[must_use]
    pub fn has_speakers(&self) -> bool {
        self.segments.iter().any(|s| s.speaker.is_some())
    }
}

/// Output of the analyze stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisReport {
    /// Analysis template used.
    pub template: String,
    /// Rendered analysis.
    pub markdown: String,
    /// Model that produced the analysis.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Unit-specific fields.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Output of the export stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportManifest {
    /// Files written by the exporter.
    pub files: Vec<PathBuf>,
    /// Formats exported.
    #[serde(default)]
    pub formats: Vec<String>,
    /// Unit-specific fields.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Output of the publish stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishReceipt {
    /// Where the content was published.
    pub destination: String,
    /// Public URL, when the destination provides one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Destination-side identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Unit-specific fields.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}
