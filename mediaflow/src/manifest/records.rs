//! Records kept in the manifest document.

use crate::core::{StageId, StageStatus};
use crate::utils::{now_utc, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;

/// Schema version written into every record.
pub const SCHEMA_VERSION: u32 = 1;

fn default_schema_version() -> u32 {
    SCHEMA_VERSION
}

/// Progress of one stage of one episode.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageProgress {
    /// Whether the stage finished successfully.
    #[serde(default)]
    pub completed: bool,
    /// Fraction done, always within `[0, 1]`.
    #[serde(default)]
    pub progress: f64,
    /// Last known status.
    #[serde(default)]
    pub status: StageStatus,
    /// When the last attempt started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<Timestamp>,
    /// When the stage completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<Timestamp>,
    /// Model the stage ran with, when it has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Files the stage wrote.
    #[serde(default)]
    pub output_files: Vec<PathBuf>,
    /// Free-form details, including the last error.
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl StageProgress {
    pub(crate) fn set_progress(&mut self, progress: f64) {
        self.progress = if progress.is_nan() {
            0.0
        } else {
            progress.clamp(0.0, 1.0)
        };
    }

    pub(crate) fn mark_completed(&mut self, output_files: Vec<PathBuf>) {
        self.completed = true;
        self.status = StageStatus::Completed;
        self.set_progress(1.0);
        self.completed_at = Some(now_utc());
        self.output_files = output_files;
        self.metadata.remove("error");
    }

    pub(crate) fn invalidate(&mut self) {
        self.completed = false;
        self.status = StageStatus::Pending;
        self.set_progress(0.0);
        self.completed_at = None;
        self.output_files.clear();
    }
}

/// Identity of an episode, as given to `add_or_update_episode`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpisodeInfo {
    /// Stable id, `<show-slug>/<leaf>` for show sources.
    pub id: String,
    /// Show name.
    pub show: String,
    /// Working directory.
    pub path: PathBuf,
    /// Publication date.
    pub date: Option<String>,
    /// Episode title.
    pub title: Option<String>,
}

impl EpisodeInfo {
    /// An episode with no date or title yet.
    #[must_use]
    pub fn new(id: impl Into<String>, show: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            show: show.into(),
            path: path.into(),
            date: None,
            title: None,
        }
    }

    /// Sets the publication date.
    #[must_use]
    pub fn with_date(mut self, date: impl Into<String>) -> Self {
        self.date = Some(date.into());
        self
    }

    /// Sets the title.
    #[must_use]
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }
}

/// One tracked episode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeRecord {
    /// Record schema version.
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    /// Episode id.
    pub id: String,
    /// Show name.
    pub show: String,
    /// Publication date.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    /// Episode title.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Working directory.
    pub path: PathBuf,
    /// When the episode was first tracked.
    pub created_at: Timestamp,
    /// When any field last changed.
    pub updated_at: Timestamp,
    /// Per-stage progress.
    #[serde(default)]
    pub stages: BTreeMap<StageId, StageProgress>,
}

impl EpisodeRecord {
    pub(crate) fn from_info(info: EpisodeInfo) -> Self {
        let now = now_utc();
        Self {
            schema_version: SCHEMA_VERSION,
            id: info.id,
            show: info.show,
            date: info.date,
            title: info.title,
            path: info.path,
            created_at: now,
            updated_at: now,
            stages: BTreeMap::new(),
        }
    }

    pub(crate) fn merge(&mut self, info: EpisodeInfo) {
        self.show = info.show;
        self.path = info.path;
        if info.date.is_some() {
            self.date = info.date;
        }
        if info.title.is_some() {
            self.title = info.title;
        }
        self.touch();
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = now_utc();
    }

    /// Returns true if `stage` is recorded as completed.
    #[must_use]
    pub fn is_completed(&self, stage: StageId) -> bool {
        self.stages.get(&stage).is_some_and(|p| p.completed)
    }

    /// Stages recorded as completed.
    #[must_use]
    pub fn completed_stages(&self) -> BTreeSet<StageId> {
        self.stages
            .iter()
            .filter(|(_, p)| p.completed)
            .map(|(stage, _)| *stage)
            .collect()
    }
}

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Stages are still being worked through.
    Running,
    /// Every stage finished.
    Completed,
    /// The session stopped on an error.
    Failed,
}

impl SessionStatus {
    /// Returns true once the session can no longer change.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// A tracked multi-stage run over one episode, with a resumable cursor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Record schema version.
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    /// Session id (UUID v4).
    pub id: String,
    /// Episode the session works on.
    pub episode_id: String,
    /// Stages in execution order.
    pub stages: Vec<StageId>,
    /// Status of each stage, parallel to `stages`.
    pub stage_statuses: Vec<StageStatus>,
    /// Index of the first stage not yet finished.
    pub current_index: usize,
    /// Session lifecycle.
    pub status: SessionStatus,
    /// When the session was created.
    pub started_at: Timestamp,
    /// When the session completed or failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<Timestamp>,
    /// Why the session failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Session {
    pub(crate) fn new(episode_id: impl Into<String>, stages: Vec<StageId>) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            id: uuid::Uuid::new_v4().to_string(),
            episode_id: episode_id.into(),
            stage_statuses: vec![StageStatus::Pending; stages.len()],
            stages,
            current_index: 0,
            status: SessionStatus::Running,
            started_at: now_utc(),
            ended_at: None,
            error: None,
        }
    }

    /// The stage the cursor points at, if any remain.
    #[must_use]
    pub fn current_stage(&self) -> Option<StageId> {
        self.stages.get(self.current_index).copied()
    }

    /// Stages not yet finished, in order.
    #[must_use]
    pub fn remaining_stages(&self) -> Vec<StageId> {
        self.stages
            .iter()
            .zip(&self.stage_statuses)
            .filter(|(_, status)| !status.is_terminal())
            .map(|(stage, _)| *stage)
            .collect()
    }
}

/// The whole manifest document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestDocument {
    /// Document format version.
    #[serde(default = "default_schema_version")]
    pub version: u32,
    /// Tracked episodes.
    #[serde(default)]
    pub episodes: Vec<EpisodeRecord>,
    /// Sessions, oldest first.
    #[serde(default)]
    pub sessions: Vec<Session>,
}

impl Default for ManifestDocument {
    fn default() -> Self {
        Self {
            version: SCHEMA_VERSION,
            episodes: Vec::new(),
            sessions: Vec::new(),
        }
    }
}

impl ManifestDocument {
    pub(crate) fn episode_mut(&mut self, id: &str) -> Option<&mut EpisodeRecord> {
        self.episodes.iter_mut().find(|e| e.id == id)
    }

    pub(crate) fn session_mut(&mut self, id: &str) -> Option<&mut Session> {
        self.sessions.iter_mut().find(|s| s.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_progress_is_clamped() {
        let mut progress = StageProgress::default();
        progress.set_progress(1.7);
        assert_eq!(progress.progress, 1.0);
        progress.set_progress(-0.2);
        assert_eq!(progress.progress, 0.0);
        progress.set_progress(f64::NAN);
        assert_eq!(progress.progress, 0.0);
    }

    #[test]
    fn test_new_session_cursor() {
        let session = Session::new("show/ep", vec![StageId::Transcribe, StageId::Align]);
        assert_eq!(session.current_stage(), Some(StageId::Transcribe));
        assert_eq!(session.stage_statuses, vec![StageStatus::Pending; 2]);
        assert_eq!(session.remaining_stages(), vec![StageId::Transcribe, StageId::Align]);
        assert!(uuid::Uuid::parse_str(&session.id).is_ok());
    }

    #[test]
    fn test_document_defaults_missing_fields() {
        let doc: ManifestDocument = serde_json::from_str(r#"{"episodes": []}"#).unwrap();
        assert_eq!(doc.version, SCHEMA_VERSION);
        assert!(doc.sessions.is_empty());
    }
}
