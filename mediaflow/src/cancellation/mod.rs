//! Cooperative cancellation.
//!
//! Runs check the token between stages; batches check it before launching
//! each unit. In-flight stage units are never interrupted.

mod token;

pub use token::CancellationToken;
