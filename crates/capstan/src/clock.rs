//! Wall-clock timestamps and exponential backoff math.
//!
//! Every timestamp the queue persists is a canonical RFC 3339 string in UTC
//! with microsecond precision and a `Z` suffix, e.g.
//! `2026-08-01T12:34:56.123456Z`. Comparisons always happen as *time*
//! comparisons (SQLite `datetime()` over the TEXT columns), never lexically,
//! so the canonical form only has to be unambiguous, not sortable.
//!
//! The whole system runs on wall-clock time. Lease durations are whole
//! seconds and tolerate skew, so there is no monotonic-clock requirement.

use chrono::{DateTime, Duration, NaiveDateTime, SecondsFormat, Utc};

use crate::error::QueueError;

/// Current wall-clock time.
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Render a timestamp in the canonical persisted form.
pub fn to_canonical(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a canonical timestamp back out of the store.
pub fn parse_canonical(raw: &str) -> Result<DateTime<Utc>, QueueError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| QueueError::Input(format!("invalid timestamp {raw:?}: {e}")))
}

/// Parse a user-supplied timestamp (`run_at` on submission).
///
/// Accepts the canonical form plus the naive `YYYY-MM-DDTHH:MM:SS[.ffffff]`
/// form, which is interpreted as UTC.
pub fn parse_user_timestamp(raw: &str) -> Result<DateTime<Utc>, QueueError> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Ok(naive.and_utc());
        }
    }
    Err(QueueError::Input(format!("invalid timestamp {raw:?}")))
}

/// Exponential backoff in seconds: `min(base^attempts, max_backoff)`.
///
/// `attempts` is the post-increment count of executions begun, so the first
/// retry waits `base^1` seconds. The exponent saturates at the cap instead of
/// overflowing.
pub fn backoff_seconds(attempts: i64, base: i64, max_backoff: i64) -> i64 {
    let exponent = u32::try_from(attempts.max(0)).unwrap_or(u32::MAX);
    base.max(1)
        .checked_pow(exponent)
        .unwrap_or(max_backoff)
        .min(max_backoff)
}

/// The instant a failed job becomes eligible to run again.
pub fn retry_time(
    now: DateTime<Utc>,
    attempts: i64,
    base: i64,
    max_backoff: i64,
) -> DateTime<Utc> {
    now + Duration::seconds(backoff_seconds(attempts, base, max_backoff))
}
