//! `capstan` - the command-line front-end for the job queue.
//!
//! Every command opens the store (creating the schema on first use), does
//! one thing through the kernel surface, and exits 0 on success or 1 on any
//! user-visible error. Worker processes are children of `worker start`,
//! recorded in a plain-text PID file and stopped with SIGTERM.

mod pidfile;

use std::path::PathBuf;
use std::process::{ExitCode, Stdio};
use std::sync::Arc;

use anyhow::{bail, Context};
use capstan::clock;
use capstan::config::QueueConfig;
use capstan::{EnqueueRequest, JobState, JobStore, ShellRunner, Worker};
use capstan_store_sqlite::SqliteJobStore;
use clap::{Parser, Subcommand};
use serde::Deserialize;

/// Durable single-host background job queue.
#[derive(Debug, Parser)]
#[command(name = "capstan", version, about)]
struct Cli {
    /// Path to the queue database.
    #[arg(long, global = true, default_value = "capstan.db")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Enqueue a job described as a JSON object: {"id"?, "command", ...}.
    Enqueue {
        /// JSON object with at least a "command" field; a missing "id" is
        /// synthesized.
        job: String,
        /// Retry budget, overriding the JSON field and the configured
        /// default.
        #[arg(long)]
        max_retries: Option<i64>,
        /// Priority 0-10 (higher is more urgent), overriding the JSON field.
        #[arg(long)]
        priority: Option<i64>,
        /// Earliest run time (RFC 3339, or naive UTC), overriding the JSON
        /// field.
        #[arg(long)]
        run_at: Option<String>,
    },
    /// List jobs, most recently created first.
    List {
        /// Filter by state (pending, processing, completed, failed, dead).
        #[arg(long)]
        state: Option<String>,
        #[arg(long, default_value_t = 100)]
        limit: i64,
    },
    /// Per-state job counts and recorded workers.
    Status,
    /// Stored output of a job's most recent attempt.
    #[command(subcommand)]
    Output(OutputCommand),
    /// Dead-letter queue administration.
    #[command(subcommand)]
    Dlq(DlqCommand),
    /// Configuration keys.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Worker process management.
    #[command(subcommand)]
    Worker(WorkerCommand),
    /// Delete a job outright, along with any dead-letter entry.
    Remove { id: String },
}

#[derive(Debug, Subcommand)]
enum OutputCommand {
    /// Print captured stdout/stderr/exit code for a job.
    Get { id: String },
}

#[derive(Debug, Subcommand)]
enum DlqCommand {
    /// List dead-letter entries, most recent move first.
    List {
        #[arg(long, default_value_t = 100)]
        limit: i64,
    },
    /// Return a dead job to pending with a fresh retry budget.
    Requeue { job_id: String },
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    Get { key: String },
    Set { key: String, value: String },
    /// Print the whole map, defaults included.
    List,
}

#[derive(Debug, Subcommand)]
enum WorkerCommand {
    /// Spawn worker processes and record their PIDs.
    Start {
        #[arg(long, default_value_t = 1)]
        count: u32,
    },
    /// SIGTERM every recorded worker and clear the PID file.
    Stop,
    /// Run the worker loop in this process (what `start` spawns).
    Run {
        /// Override the worker id; defaults to this process's PID.
        #[arg(long, hide = true)]
        worker_id: Option<i64>,
    },
}

/// The JSON payload accepted by `enqueue`.
#[derive(Debug, Deserialize)]
struct EnqueuePayload {
    id: Option<String>,
    command: Option<String>,
    max_retries: Option<i64>,
    priority: Option<i64>,
    run_at: Option<String>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let store = Arc::new(SqliteJobStore::open(&cli.db).await?);

    match cli.command {
        Command::Enqueue {
            job,
            max_retries,
            priority,
            run_at,
        } => enqueue(&*store, &job, max_retries, priority, run_at).await,
        Command::List { state, limit } => list(&*store, state, limit).await,
        Command::Status => status(&*store).await,
        Command::Output(OutputCommand::Get { id }) => output(&*store, &id).await,
        Command::Dlq(command) => dlq(&*store, command).await,
        Command::Config(command) => config(&*store, command).await,
        Command::Worker(command) => worker(store, &cli.db, command).await,
        Command::Remove { id } => {
            if !store.delete_job(&id).await? {
                bail!("job {id:?} not found");
            }
            println!("Removed job {id}");
            Ok(())
        }
    }
}

async fn enqueue(
    store: &SqliteJobStore,
    job_json: &str,
    max_retries: Option<i64>,
    priority: Option<i64>,
    run_at: Option<String>,
) -> anyhow::Result<()> {
    let payload: EnqueuePayload =
        serde_json::from_str(job_json).context("invalid job JSON")?;
    let command = match payload.command {
        Some(command) => command,
        None => bail!("invalid input: job JSON must include \"command\""),
    };

    let mut request = EnqueueRequest::new(
        payload
            .id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        command,
    );
    request.max_retries = max_retries.or(payload.max_retries);
    request.priority = priority.or(payload.priority).unwrap_or(0);
    request.run_at = run_at
        .or(payload.run_at)
        .as_deref()
        .map(clock::parse_user_timestamp)
        .transpose()?;

    let job = store.enqueue(&request).await?;
    match job.run_at {
        Some(at) => println!(
            "Enqueued job {} (priority {}, scheduled for {})",
            job.id,
            job.priority,
            clock::to_canonical(at)
        ),
        None => println!("Enqueued job {} (priority {})", job.id, job.priority),
    }
    Ok(())
}

async fn list(store: &SqliteJobStore, state: Option<String>, limit: i64) -> anyhow::Result<()> {
    let state = state.as_deref().map(str::parse::<JobState>).transpose()?;
    let jobs = store.list_jobs(state, limit).await?;
    if jobs.is_empty() {
        println!("No jobs.");
        return Ok(());
    }

    println!(
        "{:<38} {:<11} {:>8} {:>4}  {}",
        "ID", "STATE", "ATTEMPTS", "PRI", "COMMAND"
    );
    for job in jobs {
        println!(
            "{:<38} {:<11} {:>5}/{:<2} {:>4}  {}",
            job.id,
            job.state,
            job.attempts,
            job.max_retries,
            job.priority,
            ellipsize(&job.command, 48)
        );
    }
    Ok(())
}

async fn status(store: &SqliteJobStore) -> anyhow::Result<()> {
    // The on-demand maintenance pass: wake retries, free stale locks.
    let config = store.load_config().await?;
    store.promote_retry_ready().await?;
    store
        .reclaim_expired_locks(config.lock_lease_seconds)
        .await?;

    let counts = store.job_counts().await?;
    println!("Jobs:");
    for state in JobState::ALL {
        println!(
            "  {:<11} {}",
            state,
            counts.get(&state).copied().unwrap_or(0)
        );
    }

    let pids = pidfile::read(std::path::Path::new(pidfile::PID_FILE))?;
    if pids.is_empty() {
        println!("Workers: none recorded");
    } else {
        println!("Workers:");
        for pid in pids {
            let liveness = if pidfile::is_alive(pid) { "alive" } else { "dead" };
            println!("  {pid:<8} {liveness}");
        }
    }
    Ok(())
}

async fn output(store: &SqliteJobStore, id: &str) -> anyhow::Result<()> {
    let output = store.get_output(id).await?;
    println!("=== STDOUT ===");
    println!("{}", output.stdout_log.unwrap_or_default());
    println!("=== STDERR ===");
    println!("{}", output.stderr_log.unwrap_or_default());
    println!("=== EXIT CODE ===");
    match output.exit_code {
        Some(code) => println!("{code}"),
        None => println!("(no attempt recorded)"),
    }
    if let Some(at) = output.completed_at {
        println!("=== COMPLETED AT ===");
        println!("{}", clock::to_canonical(at));
    }
    Ok(())
}

async fn dlq(store: &SqliteJobStore, command: DlqCommand) -> anyhow::Result<()> {
    match command {
        DlqCommand::List { limit } => {
            let entries = store.list_dead(limit).await?;
            if entries.is_empty() {
                println!("Dead letter queue is empty.");
                return Ok(());
            }
            println!("{:<38} {:<28} {}", "JOB ID", "MOVED AT", "REASON");
            for entry in entries {
                println!(
                    "{:<38} {:<28} {}",
                    entry.job_id,
                    clock::to_canonical(entry.moved_at),
                    ellipsize(&entry.reason, 60)
                );
            }
        }
        DlqCommand::Requeue { job_id } => {
            if !store.requeue_from_dead(&job_id).await? {
                bail!("job {job_id:?} is not in the dead letter queue");
            }
            println!("Requeued job {job_id}");
        }
    }
    Ok(())
}

async fn config(store: &SqliteJobStore, command: ConfigCommand) -> anyhow::Result<()> {
    match command {
        ConfigCommand::Get { key } => match store.config_get(&key).await? {
            Some(value) => println!("{value}"),
            None => bail!("config key {key:?} is not set"),
        },
        ConfigCommand::Set { key, value } => {
            if QueueConfig::is_kernel_key(&key) {
                // Catch a bad value now instead of fatally at worker startup.
                let map = std::collections::BTreeMap::from([(key.clone(), value.clone())]);
                QueueConfig::from_map(&map)?;
            }
            store.config_set(&key, &value).await?;
            println!("{key} = {value}");
        }
        ConfigCommand::List => {
            for (key, value) in store.config_all().await? {
                println!("{key} = {value}");
            }
        }
    }
    Ok(())
}

async fn worker(
    store: Arc<SqliteJobStore>,
    db: &std::path::Path,
    command: WorkerCommand,
) -> anyhow::Result<()> {
    let pid_path = PathBuf::from(pidfile::PID_FILE);
    match command {
        WorkerCommand::Start { count } => {
            if count == 0 {
                bail!("worker count must be at least 1");
            }
            let exe = std::env::current_exe().context("cannot locate the capstan binary")?;
            let mut pids = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let child = std::process::Command::new(&exe)
                    .arg("--db")
                    .arg(db)
                    .args(["worker", "run"])
                    .stdin(Stdio::null())
                    .spawn()
                    .context("failed to spawn worker process")?;
                pids.push(child.id());
            }
            pidfile::append(&pid_path, &pids)?;
            println!(
                "Started {count} worker(s): {}",
                pids.iter()
                    .map(u32::to_string)
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }
        WorkerCommand::Stop => {
            let pids = pidfile::read(&pid_path)?;
            if pids.is_empty() {
                println!("No workers recorded.");
                return Ok(());
            }
            let mut stopped = 0;
            for pid in &pids {
                if pidfile::terminate(*pid) {
                    stopped += 1;
                }
            }
            pidfile::clear(&pid_path)?;
            println!("Stopped {stopped} of {} recorded worker(s)", pids.len());
        }
        WorkerCommand::Run { worker_id } => {
            let worker_id = worker_id.unwrap_or_else(|| i64::from(std::process::id()));
            let worker = Worker::new(store, ShellRunner, worker_id);
            worker.listen_for_shutdown()?;
            worker.run().await;
        }
    }
    Ok(())
}

/// Trim long free-form strings for one-line table cells.
fn ellipsize(text: &str, max_chars: usize) -> String {
    let flat = text.replace(['\n', '\r'], " ");
    if flat.chars().count() <= max_chars {
        flat
    } else {
        let mut out: String = flat.chars().take(max_chars.saturating_sub(1)).collect();
        out.push('…');
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn enqueue_payload_accepts_minimal_json() {
        let payload: EnqueuePayload = serde_json::from_str(r#"{"command": "echo hi"}"#).unwrap();
        assert!(payload.id.is_none());
        assert_eq!(payload.command.as_deref(), Some("echo hi"));
        assert!(payload.max_retries.is_none());
        assert!(payload.priority.is_none());
        assert!(payload.run_at.is_none());
    }

    #[test]
    fn ellipsize_flattens_and_bounds() {
        assert_eq!(ellipsize("short", 10), "short");
        assert_eq!(ellipsize("one\ntwo", 10), "one two");
        let long = ellipsize(&"x".repeat(100), 10);
        assert_eq!(long.chars().count(), 10);
        assert!(long.ends_with('…'));
    }
}
