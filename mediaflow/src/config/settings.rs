//! Process-level engine settings.

use crate::errors::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Environment variable overriding [`EngineSettings::output_root`].
pub const ENV_OUTPUT_ROOT: &str = "MEDIAFLOW_OUTPUT_ROOT";
/// Environment variable overriding [`EngineSettings::max_concurrency`].
pub const ENV_MAX_CONCURRENCY: &str = "MEDIAFLOW_MAX_CONCURRENCY";
/// Environment variable overriding [`EngineSettings::stage_timeout_seconds`].
pub const ENV_STAGE_TIMEOUT: &str = "MEDIAFLOW_STAGE_TIMEOUT_SECS";
/// Environment variable overriding [`EngineSettings::event_buffer_size`].
pub const ENV_EVENT_BUFFER: &str = "MEDIAFLOW_EVENT_BUFFER";

/// Knobs shared by every run in a process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Root under which working directories are derived.
    #[serde(default = "default_output_root")]
    pub output_root: PathBuf,
    /// Batch concurrency ceiling.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Per-stage timeout for external stage units; none when absent.
    #[serde(default)]
    pub stage_timeout_seconds: Option<f64>,
    /// Capacity of the event-queue reporter.
    #[serde(default = "default_event_buffer_size")]
    pub event_buffer_size: usize,
}

fn default_output_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_max_concurrency() -> usize {
    2
}

fn default_event_buffer_size() -> usize {
    1000
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            output_root: default_output_root(),
            max_concurrency: default_max_concurrency(),
            stage_timeout_seconds: None,
            event_buffer_size: default_event_buffer_size(),
        }
    }
}

impl EngineSettings {
    /// Defaults overlaid with `MEDIAFLOW_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidSetting` for a value that does not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().overlay(|key| std::env::var(key).ok())
    }

    /// Overlays values produced by `lookup` onto these settings.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidSetting` for a value that does not parse.
    pub fn overlay(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        if let Some(root) = lookup(ENV_OUTPUT_ROOT).filter(|v| !v.trim().is_empty()) {
            self.output_root = PathBuf::from(root.trim());
        }
        if let Some(raw) = lookup(ENV_MAX_CONCURRENCY) {
            self.max_concurrency = parse_setting(ENV_MAX_CONCURRENCY, &raw)?;
        }
        if let Some(raw) = lookup(ENV_STAGE_TIMEOUT) {
            let seconds: f64 = parse_setting(ENV_STAGE_TIMEOUT, &raw)?;
            if !seconds.is_finite() || seconds <= 0.0 {
                return Err(ConfigError::InvalidSetting {
                    key: ENV_STAGE_TIMEOUT.to_string(),
                    value: raw,
                    reason: "must be a positive number of seconds".to_string(),
                });
            }
            self.stage_timeout_seconds = Some(seconds);
        }
        if let Some(raw) = lookup(ENV_EVENT_BUFFER) {
            self.event_buffer_size = parse_setting(ENV_EVENT_BUFFER, &raw)?;
        }
        self.validate()?;
        Ok(self)
    }

    /// Checks invariants that serde defaults cannot express.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ZeroConcurrency` or `ConfigError::InvalidSetting`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrency == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        if self.event_buffer_size == 0 {
            return Err(ConfigError::InvalidSetting {
                key: ENV_EVENT_BUFFER.to_string(),
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// Sets the output root.
    #[must_use]
    pub fn with_output_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.output_root = root.into();
        self
    }

    /// Sets the batch concurrency ceiling.
    #[must_use]
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max;
        self
    }

    /// Sets the per-stage timeout.
    #[must_use]
    pub fn with_stage_timeout(mut self, seconds: f64) -> Self {
        self.stage_timeout_seconds = Some(seconds);
        self
    }

    /// Gets the stage timeout as a Duration.
    #[must_use]
    pub fn stage_timeout(&self) -> Option<Duration> {
        self.stage_timeout_seconds.map(Duration::from_secs_f64)
    }
}

fn parse_setting<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidSetting {
        key: key.to_string(),
        value: raw.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_from_empty_json() {
        let settings: EngineSettings = serde_json::from_str("{}").unwrap();
        assert_eq!(settings, EngineSettings::default());
        assert_eq!(settings.max_concurrency, 2);
        assert_eq!(settings.stage_timeout(), None);
    }

    #[test]
    fn test_overlay_parses_values() {
        let settings = EngineSettings::default()
            .overlay(lookup(&[
                (ENV_OUTPUT_ROOT, "/srv/media"),
                (ENV_MAX_CONCURRENCY, "4"),
                (ENV_STAGE_TIMEOUT, "90"),
                (ENV_EVENT_BUFFER, "50"),
            ]))
            .unwrap();

        assert_eq!(settings.output_root, PathBuf::from("/srv/media"));
        assert_eq!(settings.max_concurrency, 4);
        assert_eq!(settings.stage_timeout(), Some(Duration::from_secs(90)));
        assert_eq!(settings.event_buffer_size, 50);
    }

    #[test]
    fn test_overlay_rejects_garbage() {
        let err = EngineSettings::default()
            .overlay(lookup(&[(ENV_MAX_CONCURRENCY, "many")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidSetting { ref key, .. } if key == ENV_MAX_CONCURRENCY
        ));
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let err = EngineSettings::default()
            .overlay(lookup(&[(ENV_MAX_CONCURRENCY, "0")]))
            .unwrap_err();
        assert_eq!(err, ConfigError::ZeroConcurrency);
    }

    #[test]
    fn test_negative_timeout_rejected() {
        let err = EngineSettings::default()
            .overlay(lookup(&[(ENV_STAGE_TIMEOUT, "-3")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidSetting { .. }));
    }
}
