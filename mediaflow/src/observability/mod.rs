//! Logging setup and stage timing.

mod subscriber;
mod timer;

pub use subscriber::{init_tracing, LogFormat, LOG_ENV_VAR};
pub use timer::StageTimer;
