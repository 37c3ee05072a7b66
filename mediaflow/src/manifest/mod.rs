//! The manifest: a ledger of episodes and sessions under one working tree.
//!
//! One JSON document per root, `{"version": 1, "episodes": [...],
//! "sessions": [...]}`. [`ManifestManager`] is the only writer.

mod manager;
mod records;

pub use manager::{ManifestManager, SyncReport, MANIFEST_FILE_NAME};
pub use records::{
    EpisodeInfo, EpisodeRecord, ManifestDocument, Session, SessionStatus, StageProgress,
    SCHEMA_VERSION,
};
