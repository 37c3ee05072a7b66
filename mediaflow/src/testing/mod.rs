//! Testing utilities for mediaflow pipelines.
//!
//! This module provides:
//! - A scripted stage unit usable from both executors
//! - Sample stage documents and artifact seeding helpers

mod fixtures;
mod scripted;

pub use fixtures::{sample_document, sample_output, seed_artifact, write_artifact};
pub use scripted::{FailingUnit, ScriptedUnit};
