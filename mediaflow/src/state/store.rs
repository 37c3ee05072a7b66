//! The run state file and its store.

use crate::core::StageId;
use crate::errors::StateError;
use crate::utils::{atomic_write_json, now_utc, Timestamp};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Name of the state file inside a working directory.
pub const STATE_FILE_NAME: &str = ".mediaflow-state.json";

const STATE_VERSION: u32 = 1;

fn default_version() -> u32 {
    STATE_VERSION
}

/// What is known about one stage of one working directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRecord {
    /// Whether the stage finished successfully.
    #[serde(default)]
    pub completed: bool,
    /// When the last attempt started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<Timestamp>,
    /// When the stage completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<Timestamp>,
    /// Error message of the last failed attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Hash of the parameters the stage last ran with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params_hash: Option<String>,
}

/// Contents of the state file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunState {
    /// File format version.
    #[serde(default = "default_version")]
    pub version: u32,
    /// Per-stage records.
    #[serde(default)]
    pub stages: BTreeMap<StageId, StageRecord>,
}

impl Default for RunState {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            stages: BTreeMap::new(),
        }
    }
}

impl RunState {
    /// Stages recorded as completed.
    #[must_use]
    pub fn completed_stages(&self) -> BTreeSet<StageId> {
        self.stages
            .iter()
            .filter(|(_, record)| record.completed)
            .map(|(stage, _)| *stage)
            .collect()
    }
}

/// Owns one working directory's state file.
///
/// Every mutation is persisted before it returns. Mutations are serialized
/// behind a mutex so sibling stages can share one store.
#[derive(Debug)]
pub struct RunStateStore {
    path: PathBuf,
    state: Mutex<RunState>,
}

impl RunStateStore {
    /// Loads the state of `workdir`.
    ///
    /// A missing file yields empty state. A corrupt or unreadable file is
    /// logged and also yields empty state; it is overwritten on the next
    /// mutation.
    #[must_use]
    pub fn load(workdir: &Path) -> Self {
        let path = workdir.join(STATE_FILE_NAME);
        let state = match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<RunState>(&bytes) {
                Ok(state) => state,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Corrupt run state, starting empty");
                    RunState::default()
                }
            },
            Err(e) if e.kind() == ErrorKind::NotFound => RunState::default(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Unreadable run state, starting empty");
                RunState::default()
            }
        };

        Self {
            path,
            state: Mutex::new(state),
        }
    }

    /// Path of the state file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records that `stage` started with parameters hashing to `params_hash`.
    pub fn start_stage(
        &self,
        stage: StageId,
        params_hash: Option<String>,
    ) -> Result<(), StateError> {
        self.mutate(|state| {
            let record = state.stages.entry(stage).or_default();
            record.completed = false;
            record.started_at = Some(now_utc());
            record.completed_at = None;
            record.error = None;
            record.params_hash = params_hash;
        })
    }

    /// Records that `stage` completed.
    pub fn complete_stage(&self, stage: StageId) -> Result<(), StateError> {
        self.mutate(|state| {
            let record = state.stages.entry(stage).or_default();
            record.completed = true;
            record.completed_at = Some(now_utc());
            record.error = None;
        })
    }

    /// Records that `stage` failed with `error`.
    pub fn fail_stage(&self, stage: StageId, error: impl Into<String>) -> Result<(), StateError> {
        let error = error.into();
        self.mutate(|state| {
            let record = state.stages.entry(stage).or_default();
            record.completed = false;
            record.completed_at = None;
            record.error = Some(error);
        })
    }

    /// Writes the current state to disk.
    pub fn save(&self) -> Result<(), StateError> {
        let state = self.state.lock();
        self.write(&state)
    }

    /// A copy of the current state.
    #[must_use]
    pub fn snapshot(&self) -> RunState {
        self.state.lock().clone()
    }

    /// Whether `stage` completed with parameters matching `params_hash`.
    ///
    /// Records without a stored hash are trusted.
    #[must_use]
    pub fn is_satisfied(&self, stage: StageId, params_hash: Option<&str>) -> bool {
        let state = self.state.lock();
        state.stages.get(&stage).is_some_and(|record| {
            record.completed
                && match (record.params_hash.as_deref(), params_hash) {
                    (Some(stored), Some(current)) => stored == current,
                    _ => true,
                }
        })
    }

    /// Whether `stage` last ran with parameters other than `params_hash`.
    #[must_use]
    pub fn params_changed(&self, stage: StageId, params_hash: &str) -> bool {
        let state = self.state.lock();
        state
            .stages
            .get(&stage)
            .and_then(|record| record.params_hash.as_deref())
            .is_some_and(|stored| stored != params_hash)
    }

    /// Forgets every record and removes the state file.
    pub fn reset(&self) -> Result<(), StateError> {
        let mut state = self.state.lock();
        *state = RunState::default();
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StateError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }

    fn mutate(&self, f: impl FnOnce(&mut RunState)) -> Result<(), StateError> {
        let mut state = self.state.lock();
        f(&mut state);
        self.write(&state)
    }

    fn write(&self, state: &RunState) -> Result<(), StateError> {
        atomic_write_json(&self.path, state).map_err(|source| StateError::Io {
            path: self.path.clone(),
            source,
        })?;
        debug!(path = %self.path.display(), "Saved run state");
        Ok(())
    }
}

/// Stable hash of a stage's parameters.
///
/// `serde_json` maps are ordered, so equal parameters always hash equally.
#[must_use]
pub fn hash_parameters(params: &serde_json::Value) -> String {
    let json = serde_json::to_string(params).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(json.as_bytes());
    let result = hasher.finalize();
    hex::encode(&result[..16])
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = RunStateStore::load(dir.path());
        assert_eq!(store.snapshot(), RunState::default());
        assert!(!store.path().exists());
    }

    #[test]
    fn test_corrupt_file_is_empty() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(STATE_FILE_NAME), b"{\"stages\": [oops").unwrap();

        let store = RunStateStore::load(dir.path());
        assert!(store.snapshot().stages.is_empty());

        store.complete_stage(StageId::Fetch).unwrap();
        let reloaded = RunStateStore::load(dir.path());
        assert!(reloaded.is_satisfied(StageId::Fetch, None));
    }

    #[test]
    fn test_mutations_persist_immediately() {
        let dir = TempDir::new().unwrap();
        let store = RunStateStore::load(dir.path());

        store.start_stage(StageId::Transcribe, Some("abc".to_string())).unwrap();
        let mid = RunStateStore::load(dir.path()).snapshot();
        let record = &mid.stages[&StageId::Transcribe];
        assert!(!record.completed);
        assert!(record.started_at.is_some());

        store.complete_stage(StageId::Transcribe).unwrap();
        let done = RunStateStore::load(dir.path()).snapshot();
        let completed: Vec<StageId> = done.completed_stages().into_iter().collect();
        assert_eq!(completed, vec![StageId::Transcribe]);
    }

    #[test]
    fn test_fail_clears_completion() {
        let dir = TempDir::new().unwrap();
        let store = RunStateStore::load(dir.path());

        store.complete_stage(StageId::Align).unwrap();
        store.fail_stage(StageId::Align, "exit code 1").unwrap();

        let snapshot = store.snapshot();
        let record = &snapshot.stages[&StageId::Align];
        assert!(!record.completed);
        assert_eq!(record.error.as_deref(), Some("exit code 1"));
    }

    #[test]
    fn test_params_hash_gates_satisfaction() {
        let dir = TempDir::new().unwrap();
        let store = RunStateStore::load(dir.path());

        let base = hash_parameters(&json!({"model": "base"}));
        let large = hash_parameters(&json!({"model": "large-v3"}));
        store.start_stage(StageId::Transcribe, Some(base.clone())).unwrap();
        store.complete_stage(StageId::Transcribe).unwrap();

        assert!(store.is_satisfied(StageId::Transcribe, Some(&base)));
        assert!(!store.is_satisfied(StageId::Transcribe, Some(&large)));
        assert!(store.is_satisfied(StageId::Transcribe, None));
    }

    #[test]
    fn test_record_without_hash_is_trusted() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join(STATE_FILE_NAME),
            br#"{"stages": {"fetch": {"completed": true}}}"#,
        )
        .unwrap();

        let store = RunStateStore::load(dir.path());
        assert!(store.is_satisfied(StageId::Fetch, Some("anything")));
        assert_eq!(store.snapshot().version, 1);
    }

    #[test]
    fn test_params_changed_needs_stored_hash() {
        let dir = TempDir::new().unwrap();
        let store = RunStateStore::load(dir.path());
        assert!(!store.params_changed(StageId::Analyze, "abc"));

        store.start_stage(StageId::Analyze, Some("abc".to_string())).unwrap();
        assert!(!store.params_changed(StageId::Analyze, "abc"));
        assert!(store.params_changed(StageId::Analyze, "def"));
    }

    #[test]
    fn test_reset_removes_file() {
        let dir = TempDir::new().unwrap();
        let store = RunStateStore::load(dir.path());
        store.complete_stage(StageId::Fetch).unwrap();
        assert!(store.path().exists());

        store.reset().unwrap();
        assert!(!store.path().exists());
        assert!(!store.is_satisfied(StageId::Fetch, None));
        store.reset().unwrap();
    }

    #[test]
    fn test_hash_is_order_independent() {
        let a = hash_parameters(&json!({"model": "base", "language": "en"}));
        let b = hash_parameters(&json!({"language": "en", "model": "base"}));
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
    }
}
