//! The manifest manager.

use super::records::{
    EpisodeInfo, EpisodeRecord, ManifestDocument, Session, SessionStatus, StageProgress,
};
use crate::artifacts::ArtifactDetector;
use crate::core::{StageId, StageStatus};
use crate::errors::ManifestError;
use crate::utils::{atomic_write_json, now_utc};
use parking_lot::Mutex;
use serde_json::Value;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Name of the manifest file under the working-tree root.
pub const MANIFEST_FILE_NAME: &str = "mediaflow-manifest.json";

/// What `scan_and_sync` changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Episodes discovered on disk and added.
    pub added: usize,
    /// Stages marked complete because their artifacts exist.
    pub healed: usize,
    /// Stages marked incomplete because their artifacts are gone.
    pub invalidated: usize,
}

impl SyncReport {
    /// Returns true if the manifest already matched the filesystem.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.added == 0 && self.healed == 0 && self.invalidated == 0
    }
}

/// Handle over one manifest document.
///
/// Every operation reads the document, applies its change, and writes the
/// whole document back through a temp file and a rename. Operations on one
/// handle are serialized; separate processes get last-writer-wins.
#[derive(Debug)]
pub struct ManifestManager {
    root: PathBuf,
    path: PathBuf,
    lock: Mutex<()>,
}

impl ManifestManager {
    /// Opens the manifest of the working tree rooted at `root`.
    ///
    /// Nothing is read or created until the first operation.
    #[must_use]
    pub fn open(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            path: root.join(MANIFEST_FILE_NAME),
            root,
            lock: Mutex::new(()),
        }
    }

    /// The working-tree root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the manifest file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A copy of the current document.
    #[must_use]
    pub fn document(&self) -> ManifestDocument {
        let _guard = self.lock.lock();
        self.read()
    }

    /// Every tracked episode.
    #[must_use]
    pub fn episodes(&self) -> Vec<EpisodeRecord> {
        self.document().episodes
    }

    /// The episode with `id`, if tracked.
    #[must_use]
    pub fn episode(&self, id: &str) -> Option<EpisodeRecord> {
        self.document().episodes.into_iter().find(|e| e.id == id)
    }

    /// The session with `id`, if any.
    #[must_use]
    pub fn session(&self, id: &str) -> Option<Session> {
        self.document().sessions.into_iter().find(|s| s.id == id)
    }

    /// Tracks a new episode or refreshes an existing one's identity.
    ///
    /// Stage progress of an existing episode is kept.
    pub fn add_or_update_episode(&self, info: EpisodeInfo) -> Result<EpisodeRecord, ManifestError> {
        self.update(|doc| {
            let record = match doc.episode_mut(&info.id) {
                Some(existing) => {
                    existing.merge(info);
                    existing.clone()
                }
                None => {
                    debug!(episode = %info.id, "Tracking new episode");
                    let record = EpisodeRecord::from_info(info);
                    doc.episodes.push(record.clone());
                    record
                }
            };
            Ok(record)
        })
    }

    /// Marks `stage` of `episode_id` as running.
    pub fn start_stage(
        &self,
        episode_id: &str,
        stage: StageId,
        model: Option<&str>,
    ) -> Result<(), ManifestError> {
        self.update_stage(episode_id, stage, |progress| {
            progress.completed = false;
            progress.status = StageStatus::Running;
            progress.set_progress(0.0);
            progress.started_at = Some(now_utc());
            progress.completed_at = None;
            progress.model = model.map(str::to_string);
            progress.metadata.remove("error");
        })
    }

    /// Records partial progress of a running stage, clamped to `[0, 1]`.
    pub fn update_stage_progress(
        &self,
        episode_id: &str,
        stage: StageId,
        progress: f64,
    ) -> Result<(), ManifestError> {
        self.update_stage(episode_id, stage, |entry| entry.set_progress(progress))
    }

    /// Marks `stage` complete with the files it wrote.
    pub fn complete_stage(
        &self,
        episode_id: &str,
        stage: StageId,
        output_files: Vec<PathBuf>,
    ) -> Result<(), ManifestError> {
        self.update_stage(episode_id, stage, |progress| progress.mark_completed(output_files))
    }

    /// Marks `stage` failed.
    pub fn fail_stage(
        &self,
        episode_id: &str,
        stage: StageId,
        error: &str,
    ) -> Result<(), ManifestError> {
        self.update_stage(episode_id, stage, |progress| {
            progress.completed = false;
            progress.status = StageStatus::Failed;
            progress.completed_at = None;
            progress
                .metadata
                .insert("error".to_string(), Value::String(error.to_string()));
        })
    }

    /// Starts a session over `stages`, in the order they will run.
    pub fn create_session(
        &self,
        episode_id: &str,
        stages: Vec<StageId>,
    ) -> Result<Session, ManifestError> {
        self.update(|doc| {
            let session = Session::new(episode_id, stages);
            info!(
                session = %session.id,
                episode = %episode_id,
                stages = session.stages.len(),
                "Created session"
            );
            doc.sessions.push(session.clone());
            Ok(session)
        })
    }

    /// Sets the status of the stage at `index`; a terminal status moves the
    /// cursor past it.
    pub fn update_session_stage(
        &self,
        session_id: &str,
        index: usize,
        status: StageStatus,
    ) -> Result<Session, ManifestError> {
        self.update_session(session_id, |session| {
            let len = session.stages.len();
            if index >= len {
                return Err(ManifestError::StageIndexOutOfRange {
                    id: session.id.clone(),
                    index,
                    len,
                });
            }
            session.stage_statuses[index] = status;
            if status.is_terminal() {
                session.current_index = session.current_index.max(index + 1);
            }
            Ok(())
        })
    }

    /// Marks the session completed.
    pub fn complete_session(&self, session_id: &str) -> Result<Session, ManifestError> {
        self.update_session(session_id, |session| {
            session.status = SessionStatus::Completed;
            session.ended_at = Some(now_utc());
            Ok(())
        })
    }

    /// Marks the session failed.
    pub fn fail_session(
        &self,
        session_id: &str,
        error: Option<&str>,
    ) -> Result<Session, ManifestError> {
        self.update_session(session_id, |session| {
            session.status = SessionStatus::Failed;
            session.ended_at = Some(now_utc());
            session.error = error.map(str::to_string);
            Ok(())
        })
    }

    /// Sessions still running, oldest first.
    #[must_use]
    pub fn get_incomplete_sessions(&self) -> Vec<Session> {
        self.document()
            .sessions
            .into_iter()
            .filter(|s| s.status == SessionStatus::Running)
            .collect()
    }

    /// Episodes whose `stage` is (or, with `completed == false`, is not yet)
    /// complete.
    #[must_use]
    pub fn get_episodes_by_stage(&self, stage: StageId, completed: bool) -> Vec<EpisodeRecord> {
        self.document()
            .episodes
            .into_iter()
            .filter(|e| e.is_completed(stage) == completed)
            .collect()
    }

    /// Reconciles the manifest with the artifacts on disk.
    ///
    /// Episode directories are discovered two levels below the root
    /// (`<show>/<episode>`). Stages with artifacts are marked complete;
    /// completed stages whose artifacts are gone are marked incomplete.
    pub fn scan_and_sync(&self) -> Result<SyncReport, ManifestError> {
        let discovered = self.discover_episode_dirs();
        self.update(|doc| {
            let mut report = SyncReport::default();

            for (show, id, path) in discovered {
                let tracked = doc.episodes.iter().any(|e| e.id == id || e.path == path);
                if !tracked {
                    doc.episodes
                        .push(EpisodeRecord::from_info(EpisodeInfo::new(id, show, path)));
                    report.added += 1;
                }
            }

            for episode in &mut doc.episodes {
                let scan = ArtifactDetector::scan(&episode.path);
                let present = scan.stages();
                let mut changed = false;

                for &stage in &present {
                    if !episode.is_completed(stage) {
                        let files = scan
                            .get(stage)
                            .map(|a| vec![a.path.clone()])
                            .unwrap_or_default();
                        episode.stages.entry(stage).or_default().mark_completed(files);
                        report.healed += 1;
                        changed = true;
                    }
                }

                for (stage, progress) in episode.stages.iter_mut() {
                    if progress.completed && !present.contains(stage) {
                        progress.invalidate();
                        report.invalidated += 1;
                        changed = true;
                    }
                }

                if changed {
                    episode.touch();
                }
            }

            info!(
                added = report.added,
                healed = report.healed,
                invalidated = report.invalidated,
                "Manifest synced with filesystem"
            );
            Ok(report)
        })
    }

    /// `(show, id, path)` of every directory two levels down holding at
    /// least one artifact.
    fn discover_episode_dirs(&self) -> Vec<(String, String, PathBuf)> {
        let mut found = Vec::new();
        for show_dir in subdirectories(&self.root) {
            let Some(show) = dir_name(&show_dir) else {
                continue;
            };
            for episode_dir in subdirectories(&show_dir) {
                let Some(leaf) = dir_name(&episode_dir) else {
                    continue;
                };
                if ArtifactDetector::scan(&episode_dir).is_empty() {
                    continue;
                }
                found.push((show.clone(), format!("{show}/{leaf}"), episode_dir));
            }
        }
        found.sort();
        found
    }

    fn update_stage(
        &self,
        episode_id: &str,
        stage: StageId,
        f: impl FnOnce(&mut StageProgress),
    ) -> Result<(), ManifestError> {
        self.update(|doc| {
            let episode = doc
                .episode_mut(episode_id)
                .ok_or_else(|| ManifestError::EpisodeNotFound(episode_id.to_string()))?;
            f(episode.stages.entry(stage).or_default());
            episode.touch();
            Ok(())
        })
    }

    fn update_session(
        &self,
        session_id: &str,
        f: impl FnOnce(&mut Session) -> Result<(), ManifestError>,
    ) -> Result<Session, ManifestError> {
        self.update(|doc| {
            let session = doc
                .session_mut(session_id)
                .ok_or_else(|| ManifestError::SessionNotFound(session_id.to_string()))?;
            if session.status.is_terminal() {
                return Err(ManifestError::SessionFinished {
                    id: session.id.clone(),
                    status: session.status.to_string(),
                });
            }
            f(session)?;
            Ok(session.clone())
        })
    }

    fn update<T>(
        &self,
        f: impl FnOnce(&mut ManifestDocument) -> Result<T, ManifestError>,
    ) -> Result<T, ManifestError> {
        let _guard = self.lock.lock();
        let mut doc = self.read();
        let out = f(&mut doc)?;
        atomic_write_json(&self.path, &doc).map_err(|source| ManifestError::Io {
            path: self.path.clone(),
            source,
        })?;
        Ok(out)
    }

    fn read(&self) -> ManifestDocument {
        match fs::read(&self.path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!(path = %self.path.display(), error = %e, "Corrupt manifest, starting empty");
                ManifestDocument::default()
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => ManifestDocument::default(),
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Unreadable manifest, starting empty"
                );
                ManifestDocument::default()
            }
        }
    }
}

fn subdirectories(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut dirs: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_ok_and(|t| t.is_dir()))
        .map(|entry| entry.path())
        .filter(|path| dir_name(path).is_some_and(|name| !name.starts_with('.')))
        .collect();
    dirs.sort();
    dirs
}

fn dir_name(path: &Path) -> Option<String> {
    path.file_name().and_then(|n| n.to_str()).map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::seed_artifact;
    use std::collections::BTreeSet;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn manager_with_episode(dir: &TempDir) -> ManifestManager {
        let manager = ManifestManager::open(dir.path());
        let info = EpisodeInfo::new("show/ep1", "Show", dir.path().join("show/ep1"));
        manager.add_or_update_episode(info).unwrap();
        manager
    }

    #[test]
    fn test_missing_manifest_is_empty() {
        let dir = TempDir::new().unwrap();
        let manager = ManifestManager::open(dir.path());
        assert!(manager.episodes().is_empty());
        assert!(!manager.path().exists());
    }

    #[test]
    fn test_corrupt_manifest_is_empty_and_rewritten() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(MANIFEST_FILE_NAME), "{ not json").unwrap();

        let manager = manager_with_episode(&dir);
        assert_eq!(manager.episodes().len(), 1);
        let raw: Value = serde_json::from_slice(&fs::read(manager.path()).unwrap()).unwrap();
        assert_eq!(raw["version"], 1);
    }

    #[test]
    fn test_update_episode_keeps_stages() {
        let dir = TempDir::new().unwrap();
        let manager = manager_with_episode(&dir);
        manager.start_stage("show/ep1", StageId::Fetch, None).unwrap();
        manager.complete_stage("show/ep1", StageId::Fetch, vec![]).unwrap();

        let updated = manager
            .add_or_update_episode(
                EpisodeInfo::new("show/ep1", "Show", dir.path().join("show/ep1"))
                    .with_title("Pilot"),
            )
            .unwrap();

        assert_eq!(updated.title.as_deref(), Some("Pilot"));
        assert!(updated.is_completed(StageId::Fetch));
        assert_eq!(manager.episodes().len(), 1);
    }

    #[test]
    fn test_stage_lifecycle() {
        let dir = TempDir::new().unwrap();
        let manager = manager_with_episode(&dir);

        manager.start_stage("show/ep1", StageId::Transcribe, Some("large-v3")).unwrap();
        manager.update_stage_progress("show/ep1", StageId::Transcribe, 2.5).unwrap();
        let running = manager.episode("show/ep1").unwrap().stages[&StageId::Transcribe].clone();
        assert_eq!(running.status, StageStatus::Running);
        assert_eq!(running.progress, 1.0);
        assert!(!running.completed);

        manager.fail_stage("show/ep1", StageId::Transcribe, "oom").unwrap();
        let failed = manager.episode("show/ep1").unwrap().stages[&StageId::Transcribe].clone();
        assert_eq!(failed.status, StageStatus::Failed);
        assert_eq!(failed.metadata["error"], "oom");

        let out = dir.path().join("show/ep1/transcript-large-v3.json");
        manager
            .complete_stage("show/ep1", StageId::Transcribe, vec![out.clone()])
            .unwrap();
        let done = manager.episode("show/ep1").unwrap().stages[&StageId::Transcribe].clone();
        assert!(done.completed);
        assert_eq!(done.progress, 1.0);
        assert_eq!(done.model.as_deref(), Some("large-v3"));
        assert_eq!(done.output_files, vec![out]);
        assert!(!done.metadata.contains_key("error"));
    }

    #[test]
    fn test_stage_on_unknown_episode() {
        let dir = TempDir::new().unwrap();
        let manager = ManifestManager::open(dir.path());
        let err = manager.start_stage("nope", StageId::Fetch, None).unwrap_err();
        assert!(matches!(err, ManifestError::EpisodeNotFound(id) if id == "nope"));
    }

    #[test]
    fn test_session_cursor_and_completion() {
        let dir = TempDir::new().unwrap();
        let manager = manager_with_episode(&dir);
        let session = manager
            .create_session("show/ep1", vec![StageId::Transcribe, StageId::Align])
            .unwrap();

        let updated = manager
            .update_session_stage(&session.id, 0, StageStatus::Running)
            .unwrap();
        assert_eq!(updated.current_index, 0);
        let updated = manager
            .update_session_stage(&session.id, 0, StageStatus::Completed)
            .unwrap();
        assert_eq!(updated.current_index, 1);
        assert_eq!(updated.current_stage(), Some(StageId::Align));

        assert_eq!(manager.get_incomplete_sessions().len(), 1);
        manager.complete_session(&session.id).unwrap();
        assert!(manager.get_incomplete_sessions().is_empty());

        let err = manager.fail_session(&session.id, Some("late")).unwrap_err();
        assert!(matches!(err, ManifestError::SessionFinished { .. }));
    }

    #[test]
    fn test_session_index_out_of_range() {
        let dir = TempDir::new().unwrap();
        let manager = manager_with_episode(&dir);
        let session = manager.create_session("show/ep1", vec![StageId::Fetch]).unwrap();

        let err = manager
            .update_session_stage(&session.id, 3, StageStatus::Completed)
            .unwrap_err();
        assert!(matches!(err, ManifestError::StageIndexOutOfRange { index: 3, len: 1, .. }));
    }

    #[test]
    fn test_failed_session_records_error() {
        let dir = TempDir::new().unwrap();
        let manager = manager_with_episode(&dir);
        let session = manager.create_session("show/ep1", vec![StageId::Fetch]).unwrap();

        let failed = manager.fail_session(&session.id, Some("fetch failed")).unwrap();
        assert_eq!(failed.status, SessionStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("fetch failed"));
        assert!(failed.ended_at.is_some());
    }

    #[test]
    fn test_episodes_by_stage() {
        let dir = TempDir::new().unwrap();
        let manager = manager_with_episode(&dir);
        let info = EpisodeInfo::new("show/ep2", "Show", dir.path().join("show/ep2"));
        manager.add_or_update_episode(info).unwrap();
        manager.complete_stage("show/ep1", StageId::Fetch, vec![]).unwrap();

        let done: Vec<String> = manager
            .get_episodes_by_stage(StageId::Fetch, true)
            .into_iter()
            .map(|e| e.id)
            .collect();
        let pending: Vec<String> = manager
            .get_episodes_by_stage(StageId::Fetch, false)
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(done, vec!["show/ep1"]);
        assert_eq!(pending, vec!["show/ep2"]);
    }

    #[test]
    fn test_scan_and_sync_discovers_and_heals() {
        let dir = TempDir::new().unwrap();
        let episode = dir.path().join("my-show/2024-01-15");
        seed_artifact(&episode, StageId::Fetch, None).unwrap();
        seed_artifact(&episode, StageId::Align, Some("large-v3")).unwrap();
        fs::create_dir_all(dir.path().join("my-show/empty")).unwrap();

        let manager = ManifestManager::open(dir.path());
        let report = manager.scan_and_sync().unwrap();

        assert_eq!(report.added, 1);
        assert_eq!(report.healed, 3);
        let record = manager.episode("my-show/2024-01-15").unwrap();
        assert_eq!(
            record.completed_stages(),
            BTreeSet::from([StageId::Fetch, StageId::Transcribe, StageId::Align])
        );

        assert!(manager.scan_and_sync().unwrap().is_clean());
    }

    #[test]
    fn test_scan_and_sync_invalidates_deleted_artifact() {
        let dir = TempDir::new().unwrap();
        let episode = dir.path().join("show/ep1");
        let fetch = seed_artifact(&episode, StageId::Fetch, None).unwrap();
        let transcript = seed_artifact(&episode, StageId::Transcribe, Some("large-v3")).unwrap();

        let manager = manager_with_episode(&dir);
        manager.complete_stage("show/ep1", StageId::Fetch, vec![fetch]).unwrap();
        manager
            .complete_stage("show/ep1", StageId::Transcribe, vec![transcript.clone()])
            .unwrap();

        fs::remove_file(&transcript).unwrap();
        let report = manager.scan_and_sync().unwrap();

        assert_eq!(report.invalidated, 1);
        let record = manager.episode("show/ep1").unwrap();
        assert!(record.is_completed(StageId::Fetch));
        assert!(!record.is_completed(StageId::Transcribe));
        assert_eq!(record.stages[&StageId::Transcribe].progress, 0.0);
    }
}
