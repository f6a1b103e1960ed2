//! Pattern-matchable error kinds for queue operations.
//!
//! The kernel distinguishes caller mistakes (`Input`, `NotFound`, `Conflict`),
//! fatal misconfiguration (`Config`), and store trouble (`Store`). Command
//! failure is deliberately *not* an error kind: a non-zero exit code, a
//! timeout, or a spawn failure is data that feeds the retry/dead decision.
//!
//! `anyhow` stays internal transport: it only appears as the opaque payload of
//! [`QueueError::Store`], never as a return type on the trait surface.

use thiserror::Error;

/// Convenience alias used throughout the kernel.
pub type Result<T> = std::result::Result<T, QueueError>;

/// Everything a queue operation can fail with.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Malformed submission or argument (bad JSON, missing command, priority
    /// out of range, unparseable timestamp). Surfaced to the caller; no state
    /// change.
    #[error("invalid input: {0}")]
    Input(String),

    /// A lookup by id missed. Surfaced; no state change.
    #[error("not found: {0}")]
    NotFound(String),

    /// Insert with an existing id, requeue of a non-dead job, or a state
    /// transition refused by the store's predicates (zero rows updated, which
    /// callers treat as a concurrent-modification signal).
    #[error("conflict: {0}")]
    Conflict(String),

    /// An unparseable or out-of-range configuration value. Fatal at load
    /// time; the process should not continue with a half-read config.
    #[error("invalid config: {0}")]
    Config(String),

    /// Contention or temporary store unavailability. The worker loop absorbs
    /// these with a short sleep; they are never surfaced to submitters.
    #[error("store error: {0}")]
    Store(anyhow::Error),
}

impl QueueError {
    /// True for errors the worker loop should absorb and retry rather than
    /// attribute to the job it is currently holding.
    pub fn is_transient(&self) -> bool {
        matches!(self, QueueError::Store(_))
    }
}

impl From<anyhow::Error> for QueueError {
    fn from(err: anyhow::Error) -> Self {
        QueueError::Store(err)
    }
}
