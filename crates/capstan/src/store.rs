//! The store seam: everything the kernel needs from durable storage.
//!
//! The store owns "ready" semantics (scheduling windows, retry eligibility,
//! lock-lease freshness) so workers stay dumb: they claim, run, and report.
//! All mutual exclusion across worker processes comes from the store's own
//! write-transaction discipline; the kernel holds no in-process locks.
//!
//! # Implementer Notes
//!
//! - `claim` must perform select-and-update under a serializable boundary so
//!   two concurrent callers can never claim the same row.
//! - Outcome transitions guard on the current state in their WHERE clause;
//!   zero rows updated is reported as [`QueueError::Conflict`], which callers
//!   treat as a concurrent-modification signal.
//! - The maintenance operations must each be a single atomic statement so
//!   they are safe to run concurrently with claimers.
//!
//! [`QueueError::Conflict`]: crate::error::QueueError::Conflict

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::config::QueueConfig;
use crate::error::Result;
use crate::job::{DeadLetter, EnqueueRequest, Job, JobOutput, JobState};
use crate::runner::RunOutput;

/// Durable persistence of jobs, dead-letter entries, and configuration.
#[async_trait::async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new `pending` job with zero attempts.
    ///
    /// A request without an explicit retry budget takes the configured
    /// default. Reuse of an id is a conflict.
    async fn enqueue(&self, request: &EnqueueRequest) -> Result<Job>;

    async fn get_job(&self, job_id: &str) -> Result<Job>;

    /// Jobs, optionally filtered by state, most-recently-created first.
    async fn list_jobs(&self, state: Option<JobState>, limit: i64) -> Result<Vec<Job>>;

    /// Aggregate count of jobs grouped by state.
    async fn job_counts(&self) -> Result<BTreeMap<JobState, i64>>;

    /// Administrative delete, along with any dead-letter entry for the job.
    /// Returns false when the id is unknown.
    async fn delete_job(&self, job_id: &str) -> Result<bool>;

    /// Atomically pick the highest-priority eligible job and transition it to
    /// `processing` under `worker_id`'s lock.
    ///
    /// Eligible means: `pending`, past any `run_at` and `retry_at` window,
    /// and unlocked or holding a lock older than `lease_seconds`. Ordering:
    /// urgent rows (`priority > 0`) first, then priority descending, then
    /// FIFO on `created_at`. Runs the maintenance pass (retry promotion,
    /// lease reclamation) before claiming.
    async fn claim(&self, worker_id: i64, lease_seconds: i64) -> Result<Option<Job>>;

    /// Count an execution as begun: `attempts += 1`, in its own transaction,
    /// called exactly once per claim before the runner is invoked.
    async fn begin_attempt(&self, job_id: &str) -> Result<()>;

    /// Persist the captured output of the most recent attempt, overwriting
    /// the previous attempt's captures.
    async fn record_output(&self, job_id: &str, output: &RunOutput) -> Result<()>;

    /// `processing -> completed`: clears the lock, stamps `completed_at`.
    async fn mark_succeeded(&self, job_id: &str) -> Result<()>;

    /// `processing -> pending` with a retry eligibility time and the failing
    /// attempt's error recorded.
    async fn schedule_retry(
        &self,
        job_id: &str,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<()>;

    /// `processing -> dead`: writes the dead-letter entry (reason plus a
    /// frozen snapshot) in the same transaction. A job already dead is left
    /// untouched.
    async fn move_to_dead(&self, job_id: &str, reason: &str) -> Result<()>;

    /// Clear `retry_at` and any lock remnants on pending rows whose retry
    /// time has passed. Idempotent; returns the promoted row count.
    async fn promote_retry_ready(&self) -> Result<u64>;

    /// Return `processing` rows with expired leases to `pending`, clearing
    /// their locks. The consumed attempt stays counted (at-least-once).
    /// Idempotent; returns the reclaimed row count.
    async fn reclaim_expired_locks(&self, lease_seconds: i64) -> Result<u64>;

    /// The most recent dead-letter entries, newest move first.
    async fn list_dead(&self, limit: i64) -> Result<Vec<DeadLetter>>;

    /// `dead -> pending` with a fresh retry budget: zero attempts, cleared
    /// `retry_at` and lock fields, dead-letter entry deleted. True when an
    /// entry existed; false otherwise.
    async fn requeue_from_dead(&self, job_id: &str) -> Result<bool>;

    /// Stored stdout/stderr/exit code/completion time for a job.
    async fn get_output(&self, job_id: &str) -> Result<JobOutput>;

    /// Stored value for `key`, falling back to the kernel default for the
    /// five kernel keys.
    async fn config_get(&self, key: &str) -> Result<Option<String>>;

    async fn config_set(&self, key: &str, value: &str) -> Result<()>;

    /// The whole stored map, with defaults filled in for absent kernel keys.
    async fn config_all(&self) -> Result<BTreeMap<String, String>>;

    /// Parse the five kernel knobs out of the stored map. A malformed value
    /// is fatal here rather than at the point of use.
    async fn load_config(&self) -> Result<QueueConfig> {
        let map = self.config_all().await?;
        QueueConfig::from_map(&map)
    }
}
