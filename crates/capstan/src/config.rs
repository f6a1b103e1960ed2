//! The five kernel-tunable knobs.
//!
//! Values live in the store's config table as strings and are parsed into
//! this record once per consumer. The kernel consults exactly these keys;
//! unknown keys in the table are stored and listed but otherwise ignored.

use std::collections::BTreeMap;

use crate::error::{QueueError, Result};

/// Default retry budget for newly-enqueued jobs lacking an explicit value.
pub const MAX_RETRIES: &str = "max_retries";
/// Base of the exponential backoff.
pub const BACKOFF_BASE: &str = "backoff_base";
/// Cap on the backoff interval, in seconds.
pub const MAX_BACKOFF_SECONDS: &str = "max_backoff_seconds";
/// Lease duration before a claimed job may be stolen, in seconds.
pub const LOCK_LEASE_SECONDS: &str = "lock_lease_seconds";
/// Hard timeout handed to the command runner, in seconds.
pub const JOB_TIMEOUT_SECONDS: &str = "job_timeout_seconds";

/// Every key the kernel consumes, paired with its default value.
pub const DEFAULTS: &[(&str, &str)] = &[
    (MAX_RETRIES, "3"),
    (BACKOFF_BASE, "2"),
    (MAX_BACKOFF_SECONDS, "300"),
    (LOCK_LEASE_SECONDS, "300"),
    (JOB_TIMEOUT_SECONDS, "3600"),
];

/// The parsed configuration record, populated once at startup from the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    pub max_retries: i64,
    pub backoff_base: i64,
    pub max_backoff_seconds: i64,
    pub lock_lease_seconds: i64,
    pub job_timeout_seconds: i64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base: 2,
            max_backoff_seconds: 300,
            lock_lease_seconds: 300,
            job_timeout_seconds: 3600,
        }
    }
}

impl QueueConfig {
    /// Build the record from the stored string map.
    ///
    /// Absent keys take their defaults. A value that fails to parse or falls
    /// out of range is a fatal [`QueueError::Config`].
    pub fn from_map(map: &BTreeMap<String, String>) -> Result<Self> {
        Ok(Self {
            max_retries: parse_key(map, MAX_RETRIES, 3, 0)?,
            backoff_base: parse_key(map, BACKOFF_BASE, 2, 1)?,
            max_backoff_seconds: parse_key(map, MAX_BACKOFF_SECONDS, 300, 1)?,
            lock_lease_seconds: parse_key(map, LOCK_LEASE_SECONDS, 300, 1)?,
            job_timeout_seconds: parse_key(map, JOB_TIMEOUT_SECONDS, 3600, 1)?,
        })
    }

    /// Whether `key` is one of the five kernel keys.
    pub fn is_kernel_key(key: &str) -> bool {
        DEFAULTS.iter().any(|(k, _)| *k == key)
    }
}

fn parse_key(map: &BTreeMap<String, String>, key: &str, default: i64, min: i64) -> Result<i64> {
    let Some(raw) = map.get(key) else {
        return Ok(default);
    };
    let value: i64 = raw
        .trim()
        .parse()
        .map_err(|_| QueueError::Config(format!("{key} must be an integer, got {raw:?}")))?;
    if value < min {
        return Err(QueueError::Config(format!(
            "{key} must be at least {min}, got {value}"
        )));
    }
    Ok(value)
}
