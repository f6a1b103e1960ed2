//! # Capstan
//!
//! A durable, single-host background job queue. Submitters insert work items
//! describing a shell command; long-running worker processes atomically claim
//! items, execute them, record outcomes, and retry failures with exponential
//! backoff until the per-job budget runs out, at which point the item moves
//! to a dead-letter area it can be manually requeued from.
//!
//! ## Architecture
//!
//! ```text
//! capstan enqueue ──▶ ┌─────────────────────┐ ◀── capstan status / list / dlq
//!                     │   durable store     │
//!                     │ (jobs, dead letters,│
//!                     │   config map)       │
//!                     └─────────────────────┘
//!                        ▲               │
//!           claim (BEGIN IMMEDIATE)      │ outcome: success / retry / dead
//!                        │               ▼
//!             capstan worker run ── sh -c <command>   (× N processes)
//! ```
//!
//! ## Key Invariants
//!
//! 1. **One owner per job** - the atomic claim guarantees at most one worker
//!    ever holds a job in `processing`.
//! 2. **Locks mirror state** - `locked_by` and `locked_at` are set together,
//!    non-null exactly while a job is `processing`, and never survive into a
//!    terminal state.
//! 3. **Attempts are begun executions** - incremented pre-run, never
//!    decremented, so a job executes at most `max_retries + 1` times.
//! 4. **Dead means one entry** - every `dead` job has exactly one dead-letter
//!    entry; requeue deletes it and grants a fresh budget.
//! 5. **At-least-once** - a lease that expires mid-run lets another worker
//!    steal the job; the kernel never cancels a running command.
//!
//! ## Guarantees
//!
//! - **No broker, no daemon**: the store file is the only shared resource;
//!   workers coordinate exclusively through its write transactions.
//! - **No intra-worker concurrency**: a worker processes one job at a time,
//!   to completion, and answers signals between iterations.
//!
//! The store implementation lives in the `capstan-store-sqlite` crate; the
//! `capstan` binary in `capstan-cli` wires both together.

// Clock & backoff math
pub mod clock;

// The five kernel-tunable knobs
pub mod config;

// Pattern-matchable error kinds
pub mod error;

// Job rows, dead-letter entries, state machine
pub mod job;

// Opaque command execution
pub mod runner;

// The store seam
pub mod store;

// The claim/execute/record loop
pub mod worker;

// Re-export the kernel surface
pub use crate::config::QueueConfig;
pub use crate::error::{QueueError, Result};
pub use crate::job::{
    failure_disposition, DeadLetter, EnqueueRequest, FailureDisposition, Job, JobOutput, JobState,
    MAX_PRIORITY, MIN_PRIORITY,
};
pub use crate::runner::{CommandRunner, RunOutput, ShellRunner};
pub use crate::store::JobStore;
pub use crate::worker::Worker;

// Re-export commonly used external types
pub use async_trait::async_trait;
