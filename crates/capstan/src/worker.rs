//! The long-running claim/execute/record loop.
//!
//! One [`Worker`] per OS process. Within a worker everything is
//! single-threaded and cooperative: the loop body runs to completion,
//! including a potentially long command execution, before the next
//! iteration. Shutdown is signal-driven and checked between iterations; a
//! command that is already running is never cancelled, which is the
//! at-least-once price.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::clock;
use crate::config::QueueConfig;
use crate::error::Result;
use crate::job::{failure_disposition, FailureDisposition, Job};
use crate::runner::CommandRunner;
use crate::store::JobStore;

/// How long an idle worker sleeps between claim attempts.
pub const IDLE_POLL: Duration = Duration::from_millis(500);

/// Pause after an unexpected loop error before trying again.
const ERROR_PAUSE: Duration = Duration::from_secs(1);

/// A worker process's claim/execute/record loop.
pub struct Worker<S, R> {
    store: Arc<S>,
    runner: R,
    worker_id: i64,
    shutdown: Arc<AtomicBool>,
}

impl<S: JobStore, R: CommandRunner> Worker<S, R> {
    /// `worker_id` is the process id (or equivalent unique integer); it is
    /// what ends up in `locked_by`.
    pub fn new(store: Arc<S>, runner: R, worker_id: i64) -> Self {
        Self {
            store,
            runner,
            worker_id,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The flag checked between loop iterations. Setting it stops the worker
    /// after the current iteration without cancelling a running command.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Install SIGTERM and SIGINT handlers that request a shutdown.
    #[cfg(unix)]
    pub fn listen_for_shutdown(&self) -> std::io::Result<()> {
        use tokio::signal::unix::{signal, SignalKind};

        let flag = self.shutdown.clone();
        let mut term = signal(SignalKind::terminate())?;
        let mut int = signal(SignalKind::interrupt())?;
        tokio::spawn(async move {
            tokio::select! {
                _ = term.recv() => {}
                _ = int.recv() => {}
            }
            info!("shutdown signal received");
            flag.store(true, Ordering::Relaxed);
        });
        Ok(())
    }

    /// Install a Ctrl-C handler that requests a shutdown.
    #[cfg(not(unix))]
    pub fn listen_for_shutdown(&self) -> std::io::Result<()> {
        let flag = self.shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
                flag.store(true, Ordering::Relaxed);
            }
        });
        Ok(())
    }

    /// Run until shutdown is requested.
    ///
    /// Loop errors never terminate the worker: anything unexpected is logged
    /// and absorbed after a short pause, so only a signal ends the loop.
    pub async fn run(&self) {
        info!(worker_id = self.worker_id, "worker started");
        while !self.shutdown.load(Ordering::Relaxed) {
            match self.poll_once().await {
                Ok(true) => {}
                Ok(false) => tokio::time::sleep(IDLE_POLL).await,
                Err(e) => {
                    error!(worker_id = self.worker_id, error = %e, "worker loop error");
                    tokio::time::sleep(ERROR_PAUSE).await;
                }
            }
        }
        info!(worker_id = self.worker_id, "worker shutting down");
    }

    /// Claim and process at most one job. Returns whether a job was claimed.
    pub async fn poll_once(&self) -> Result<bool> {
        let config = self.store.load_config().await?;
        let Some(job) = self
            .store
            .claim(self.worker_id, config.lock_lease_seconds)
            .await?
        else {
            return Ok(false);
        };

        info!(worker_id = self.worker_id, job_id = %job.id, "claimed job");
        if let Err(e) = self.execute(&job, &config).await {
            // A claimed job must never be left stuck in `processing`: any
            // error inside the body becomes a failure outcome for that job.
            warn!(job_id = %job.id, error = %e, "attempt failed outside the command");
            self.dispose_failure(&job.id, &e.to_string(), &config)
                .await?;
            tokio::time::sleep(ERROR_PAUSE).await;
        }
        Ok(true)
    }

    async fn execute(&self, job: &Job, config: &QueueConfig) -> Result<()> {
        self.store.begin_attempt(&job.id).await?;

        let timeout = Duration::from_secs(config.job_timeout_seconds.max(1) as u64);
        let output = self.runner.run(&job.command, timeout).await;
        self.store.record_output(&job.id, &output).await?;

        if output.success() {
            self.store.mark_succeeded(&job.id).await?;
            info!(job_id = %job.id, "job completed");
        } else {
            let message = format!("Exit code {}: {}", output.exit_code, output.stderr);
            self.dispose_failure(&job.id, &message, config).await?;
        }
        Ok(())
    }

    /// Retry or dead-letter, decided from the freshly persisted attempt
    /// count rather than the claim-time snapshot.
    async fn dispose_failure(&self, job_id: &str, error: &str, config: &QueueConfig) -> Result<()> {
        let job = self.store.get_job(job_id).await?;
        match failure_disposition(job.attempts, job.max_retries) {
            FailureDisposition::Retry => {
                let retry_at = clock::retry_time(
                    clock::now(),
                    job.attempts,
                    config.backoff_base,
                    config.max_backoff_seconds,
                );
                self.store.schedule_retry(job_id, error, retry_at).await?;
                info!(
                    job_id,
                    attempt = job.attempts,
                    max_retries = job.max_retries,
                    retry_at = %clock::to_canonical(retry_at),
                    "retry scheduled"
                );
            }
            FailureDisposition::Dead => {
                self.store
                    .move_to_dead(job_id, &format!("Max retries exceeded: {error}"))
                    .await?;
                warn!(job_id, attempts = job.attempts, "job moved to dead letter");
            }
        }
        Ok(())
    }
}
