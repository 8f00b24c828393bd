//! Timestamp helpers for the database layer.
//!
//! Wall-clock columns are stored as second-precision UTC text
//! (`YYYY-MM-DD HH:MM:SS`), which keeps `strftime()` truncation and lexical
//! comparison working for partial-date filters. Ledger ordering uses a
//! separate integer key with millisecond precision.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};

use crate::{Error, Result};

/// Text format of every timestamp column.
pub const DB_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Epoch (Unix seconds) of the ledger ordering key. Keeps the key small.
pub const ORDERING_EPOCH_SECS: i64 = 1_270_000_000;

/// Current time in UTC, truncated to what the text columns can hold.
pub fn now() -> DateTime<Utc> {
    let now = Utc::now();
    Utc.timestamp_opt(now.timestamp(), 0).single().unwrap_or(now)
}

/// Format a timestamp for a text column.
#[inline]
pub fn to_db_text(dt: DateTime<Utc>) -> String {
    dt.format(DB_TIME_FORMAT).to_string()
}

/// Parse a text column back into UTC.
pub fn from_db_text(text: &str) -> Result<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(text, DB_TIME_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|e| Error::Database(format!("invalid timestamp '{text}' in database: {e}")))
}

/// Millisecond ordering key of a ledger record.
#[inline]
pub fn status_time_order(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis() - ORDERING_EPOCH_SECS * 1000
}

/// Unix seconds (with fractional milliseconds) of an ordering key.
#[inline]
pub fn order_to_unix_secs(order: i64) -> f64 {
    order as f64 / 1000.0 + ORDERING_EPOCH_SECS as f64
}

/// Unix seconds (with fractional milliseconds) of a timestamp.
#[inline]
pub fn unix_secs(dt: DateTime<Utc>) -> f64 {
    dt.timestamp_millis() as f64 / 1000.0
}

/// Parse a caller-supplied status time.
///
/// The value must carry an explicit offset (`Z`, `+02:00`, ...). Naive
/// timestamps are rejected rather than guessed.
pub fn parse_status_time(value: &str) -> Result<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f%:z", "%Y-%m-%d %H:%M:%S%.f%z"] {
        if let Ok(dt) = DateTime::parse_from_str(value, format) {
            return Ok(dt.with_timezone(&Utc));
        }
    }
    if NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f").is_ok()
        || NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f").is_ok()
    {
        return Err(Error::validation(format!(
            "Timestamp {value} is not timezone aware"
        )));
    }
    Err(Error::validation(format!("Invalid timestamp: {value}")))
}
