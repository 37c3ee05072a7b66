//! Timestamp helpers and lenient episode-date parsing.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use thiserror::Error;

/// Represents a timestamp that can be serialized/deserialized.
pub type Timestamp = DateTime<Utc>;

/// Errors that can occur during date parsing.
#[derive(Debug, Error)]
pub enum TimestampError {
    /// The date string is empty.
    #[error("Empty date string")]
    EmptyString,

    /// The date value is invalid.
    #[error("Invalid date: {0}")]
    InvalidFormat(String),
}

/// Returns the current UTC timestamp.
#[must_use]
pub fn now_utc() -> Timestamp {
    Utc::now()
}

/// Parses an episode date as users type it into a source filter.
///
/// Supports ISO dates (`2024-03-05`), full timestamps (the date part is kept),
/// and the common human-readable forms feeds use (`March 5, 2024`,
/// `5 Mar 2024`, `2024/03/05`).
///
/// # Errors
///
/// Returns `TimestampError` if no supported format matches.
pub fn parse_episode_date(input: &str) -> Result<NaiveDate, TimestampError> {
    let trimmed = input.trim();

    if trimmed.is_empty() {
        return Err(TimestampError::EmptyString);
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(dt.with_timezone(&Utc).date_naive());
    }

    if let Ok(dt) = DateTime::parse_from_rfc2822(trimmed) {
        return Ok(dt.with_timezone(&Utc).date_naive());
    }

    let datetime_formats = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"];
    for fmt in datetime_formats {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, fmt) {
            return Ok(naive.date());
        }
    }

    let date_formats = [
        "%Y-%m-%d",  // 2023-10-05
        "%Y/%m/%d",  // 2023/10/05
        "%Y%m%d",    // 20231005
        "%B %d, %Y", // October 5, 2023
        "%b %d, %Y", // Oct 5, 2023
        "%d %B %Y",  // 5 October 2023
        "%d %b %Y",  // 5 Oct 2023
    ];
    for fmt in date_formats {
        if let Ok(date) = NaiveDate::parse_from_str(trimmed, fmt) {
            return Ok(date);
        }
    }

    Err(TimestampError::InvalidFormat(trimmed.to_string()))
}
