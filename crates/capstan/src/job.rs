//! Job rows, dead-letter entries, and submission validation.
//!
//! The state machine lives in two places by design: [`JobState`] describes
//! which transitions are legal, and the store enforces them with WHERE-clause
//! predicates so an illegal transition surfaces as zero rows updated rather
//! than corrupt state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{QueueError, Result};

/// Lowest accepted job priority.
pub const MIN_PRIORITY: i64 = 0;
/// Highest accepted job priority.
pub const MAX_PRIORITY: i64 = 10;

/// Durable job states.
///
/// `Failed` is reserved in the schema for compatibility; no transition in the
/// state machine produces it, but introspection of a hand-edited store must
/// not choke on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Processing,
    Completed,
    Failed,
    Dead,
}

impl JobState {
    /// Every state, in lifecycle order. Used for exhaustive count displays.
    pub const ALL: [JobState; 5] = [
        JobState::Pending,
        JobState::Processing,
        JobState::Completed,
        JobState::Failed,
        JobState::Dead,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Dead => "dead",
        }
    }

    /// `Completed` is terminal forever; `Dead` is terminal until an explicit
    /// requeue.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Dead)
    }

    /// Whether the single-row state machine permits `self -> next`.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        matches!(
            (*self, next),
            // claim
            (JobState::Pending, JobState::Processing)
            // success
            | (JobState::Processing, JobState::Completed)
            // retry, or lease-expiry reclamation
            | (JobState::Processing, JobState::Pending)
            // dead-letter move
            | (JobState::Processing, JobState::Dead)
            // requeue
            | (JobState::Dead, JobState::Pending)
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobState {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(JobState::Pending),
            "processing" => Ok(JobState::Processing),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "dead" => Ok(JobState::Dead),
            other => Err(QueueError::Input(format!("unknown job state {other:?}"))),
        }
    }
}

/// One unit of work: a shell command plus its scheduling and outcome state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Caller-supplied, globally unique.
    pub id: String,
    /// Opaque string interpreted by the command runner.
    pub command: String,
    pub state: JobState,
    /// Executions begun, successful or not. Incremented pre-run.
    pub attempts: i64,
    /// Additional attempts allowed after the first.
    pub max_retries: i64,
    /// Higher is more urgent; [`MIN_PRIORITY`]..=[`MAX_PRIORITY`].
    pub priority: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Earliest time a retry-scheduled job is eligible to be picked.
    pub retry_at: Option<DateTime<Utc>>,
    /// Earliest time a newly-enqueued job becomes eligible at all.
    pub run_at: Option<DateTime<Utc>>,
    /// PID of the worker currently holding the lock.
    pub locked_by: Option<i64>,
    /// Instant the current lock was taken.
    pub locked_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Captured output of the most recent attempt; overwritten per attempt.
    pub stdout_log: Option<String>,
    pub stderr_log: Option<String>,
    pub exit_code: Option<i64>,
}

/// A dead-letter entry: exactly one per job currently in [`JobState::Dead`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: String,
    pub job_id: String,
    pub moved_at: DateTime<Utc>,
    pub reason: String,
    /// Frozen copy of the job row at the moment of the move. Forensic only;
    /// discarded on requeue.
    pub snapshot: serde_json::Value,
}

/// Stored output of a job's most recent attempt.
#[derive(Debug, Clone, Default)]
pub struct JobOutput {
    pub stdout_log: Option<String>,
    pub stderr_log: Option<String>,
    pub exit_code: Option<i64>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A submission, validated before it reaches the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueRequest {
    pub id: String,
    pub command: String,
    /// `None` takes the configured default budget.
    pub max_retries: Option<i64>,
    #[serde(default)]
    pub priority: i64,
    pub run_at: Option<DateTime<Utc>>,
}

impl EnqueueRequest {
    pub fn new(id: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            command: command.into(),
            max_retries: None,
            priority: 0,
            run_at: None,
        }
    }

    /// Reject out-of-range submissions. Out-of-range priority is an error,
    /// not a clamp.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(QueueError::Input("job id must not be empty".into()));
        }
        if self.command.trim().is_empty() {
            return Err(QueueError::Input("command must not be empty".into()));
        }
        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&self.priority) {
            return Err(QueueError::Input(format!(
                "priority must be within {MIN_PRIORITY}..={MAX_PRIORITY}, got {}",
                self.priority
            )));
        }
        if let Some(max_retries) = self.max_retries {
            if max_retries < 0 {
                return Err(QueueError::Input(format!(
                    "max_retries must not be negative, got {max_retries}"
                )));
            }
        }
        Ok(())
    }
}

/// What to do with a job whose attempt just failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Budget remains: schedule a retry with backoff.
    Retry,
    /// Budget exhausted: move to the dead-letter area.
    Dead,
}

/// Decide retry-vs-dead from the freshly incremented attempt count.
///
/// `attempts` counts executions begun including the one that just failed, and
/// `max_retries` is the budget of *additional* attempts after the first, so a
/// job keeps retrying while `attempts <= max_retries` and dies on the attempt
/// after that, so at most `max_retries + 1` executions ever begin.
pub fn failure_disposition(attempts: i64, max_retries: i64) -> FailureDisposition {
    if attempts <= max_retries {
        FailureDisposition::Retry
    } else {
        FailureDisposition::Dead
    }
}
