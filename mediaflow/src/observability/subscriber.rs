//! `tracing` subscriber initialization for binaries and services embedding
//! the engine.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing_subscriber::{
    fmt as layer_fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

/// Environment variable consulted before `RUST_LOG`.
pub const LOG_ENV_VAR: &str = "MEDIAFLOW_LOG";

/// Log line format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Json => write!(f, "json"),
        }
    }
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format '{other}'")),
        }
    }
}

/// Installs a global subscriber writing to stderr.
///
/// The filter comes from `MEDIAFLOW_LOG`, then `RUST_LOG`, then defaults to
/// `info` (`mediaflow=debug` when verbose). Returns false if a global
/// subscriber was already installed, which leaves that subscriber in place.
pub fn init_tracing(format: LogFormat, verbose: bool) -> bool {
    let default_directive = if verbose { "info,mediaflow=debug" } else { "info" };
    let filter = EnvFilter::try_from_env(LOG_ENV_VAR)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    let registry = tracing_subscriber::registry().with(filter);
    let installed = match format {
        LogFormat::Text => registry
            .with(layer_fmt::layer().with_writer(std::io::stderr).with_target(verbose))
            .try_init(),
        LogFormat::Json => registry
            .with(layer_fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
    };
    installed.is_ok()
}
