//! Progress events emitted while stages run.

use crate::utils::{now_utc, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The kind of a progress event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressEventType {
    /// A task started.
    Start,
    /// A step within a task advanced.
    Update,
    /// A step or task completed.
    Complete,
    /// Something failed.
    Error,
}

impl fmt::Display for ProgressEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start => write!(f, "start"),
            Self::Update => write!(f, "update"),
            Self::Complete => write!(f, "complete"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// A timestamped progress record, as forwarded to front ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// The event type.
    #[serde(rename = "type")]
    pub event_type: ProgressEventType,

    /// Human-readable message.
    pub message: String,

    /// Step number within the current task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<usize>,

    /// Fractional progress in `[0, 1]`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,

    /// When the event was created (UTC).
    pub timestamp: Timestamp,

    /// Optional structured payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ProgressEvent {
    /// Creates an event stamped with the current time.
    #[must_use]
    pub fn new(event_type: ProgressEventType, message: impl Into<String>) -> Self {
        Self {
            event_type,
            message: message.into(),
            step: None,
            progress: None,
            timestamp: now_utc(),
            data: None,
        }
    }

    /// Sets the step number.
    #[must_use]
    pub fn with_step(mut self, step: Option<usize>) -> Self {
        self.step = step;
        self
    }

    /// Sets the fractional progress, clamped to `[0, 1]`.
    #[must_use]
    pub fn with_progress(mut self, progress: Option<f64>) -> Self {
        self.progress = progress.map(|p| p.clamp(0.0, 1.0));
        self
    }

    /// Attaches a structured payload.
    #[must_use]
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}
