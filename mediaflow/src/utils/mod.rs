//! Utility functions for timestamps, episode dates, slugs, and atomic file writes.

mod fs;
pub mod timestamps;

pub use fs::{atomic_write_file, atomic_write_json};
pub use timestamps::{now_utc, parse_episode_date, Timestamp, TimestampError};

/// Turns free text into a filesystem-safe, lowercase, dash-separated slug.
///
/// Returns `"untitled"` when nothing usable remains.
#[must_use]
pub fn slugify(input: &str) -> String {
    let mut slug = String::with_capacity(input.len());
    let mut pending_dash = false;

    for ch in input.chars() {
        if ch.is_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.extend(ch.to_lowercase());
        } else {
            pending_dash = true;
        }
    }

    if slug.is_empty() {
        "untitled".to_string()
    } else {
        slug
    }
}
