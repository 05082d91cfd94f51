//! Time helpers.
//!
//! All persisted timestamps are UTC epoch milliseconds (`i64`) so a single
//! set of models decodes on both database dialects. RFC3339 only appears at
//! log and event boundaries.

use chrono::{DateTime, Utc};

/// Current time as UTC epoch milliseconds.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// RFC3339 rendering of an epoch-milliseconds timestamp.
pub fn ms_to_rfc3339(ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_default()
}

/// Today's date in `YYYY-MM-DD` form (UTC), for effective-date gating.
pub fn today_utc() -> String {
    Utc::now().format("%Y-%m-%d").to_string()
}
