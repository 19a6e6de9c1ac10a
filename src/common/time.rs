//! Wall-clock helpers. All persisted timestamps are UTC.

use std::time::Instant;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};

use crate::common::error::{DeltaError, DeltaResult};

pub type Timestamp = DateTime<Utc>;

pub fn now() -> Timestamp {
    Utc::now()
}

/// Parse RFC 3339 or the `YYYY-MM-DD HH:MM:SS` form used by event tables (read as UTC).
pub fn parse(raw: &str) -> DeltaResult<Timestamp> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .map(|naive| Utc.from_utc_datetime(&naive))
        .map_err(|_| DeltaError::invalid(format!("unparseable timestamp `{raw}`")))
}

/// Milliseconds elapsed since `start`, for `dur_ms` log fields.
pub fn elapsed_ms(start: Instant) -> u128 {
    start.elapsed().as_millis()
}
