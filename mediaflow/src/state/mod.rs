//! Per-working-directory run state.
//!
//! Records which stages started, completed, or failed so an interrupted run
//! resumes where it stopped. Artifacts on disk remain the primary evidence;
//! the state file covers stages whose output is not a detectable file.

mod store;

pub use store::{hash_parameters, RunState, RunStateStore, StageRecord, STATE_FILE_NAME};
