//! SQLite implementation of the capstan job store.
//!
//! # Features
//!
//! - Atomic claim under a `BEGIN IMMEDIATE` write transaction
//! - Exponential-backoff retry scheduling
//! - Dead-letter table with frozen job snapshots
//! - Lease-based reclamation of jobs held by dead workers
//! - WAL journal mode with a busy timeout for multi-process access
//!
//! # Database Schema
//!
//! ```sql
//! CREATE TABLE jobs (
//!     id TEXT PRIMARY KEY,
//!     command TEXT NOT NULL,
//!     state TEXT NOT NULL DEFAULT 'pending',
//!
//!     -- Execution
//!     attempts INTEGER NOT NULL DEFAULT 0,
//!     max_retries INTEGER NOT NULL DEFAULT 3,
//!
//!     -- Scheduling
//!     priority INTEGER NOT NULL DEFAULT 0,
//!     run_at TEXT,
//!     retry_at TEXT,
//!
//!     -- Worker tracking
//!     locked_by INTEGER,
//!     locked_at TEXT,
//!
//!     -- Outcome
//!     last_error TEXT,
//!     stdout_log TEXT,
//!     stderr_log TEXT,
//!     exit_code INTEGER,
//!
//!     -- Timestamps (canonical UTC strings)
//!     created_at TEXT NOT NULL,
//!     updated_at TEXT NOT NULL,
//!     completed_at TEXT
//! );
//!
//! CREATE TABLE dead_letters (
//!     id TEXT PRIMARY KEY,
//!     job_id TEXT NOT NULL UNIQUE,
//!     moved_at TEXT NOT NULL,
//!     reason TEXT NOT NULL,
//!     snapshot TEXT NOT NULL
//! );
//!
//! CREATE TABLE config (key TEXT PRIMARY KEY, value TEXT NOT NULL);
//! ```
//!
//! The `UNIQUE` constraint on `dead_letters.job_id` is what enforces the
//! one-entry-per-dead-job invariant at the storage layer.
//!
//! # Usage
//!
//! ```rust,ignore
//! use capstan_store_sqlite::SqliteJobStore;
//!
//! let store = SqliteJobStore::open("capstan.db").await?;
//! let job = store.claim(worker_pid, 300).await?;
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use capstan::clock;
use capstan::config;
use capstan::{
    DeadLetter, EnqueueRequest, Job, JobOutput, JobState, JobStore, QueueError, Result, RunOutput,
};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info, warn};
use uuid::Uuid;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id TEXT PRIMARY KEY,
    command TEXT NOT NULL,
    state TEXT NOT NULL DEFAULT 'pending',
    attempts INTEGER NOT NULL DEFAULT 0,
    max_retries INTEGER NOT NULL DEFAULT 3,
    priority INTEGER NOT NULL DEFAULT 0,
    run_at TEXT,
    retry_at TEXT,
    locked_by INTEGER,
    locked_at TEXT,
    last_error TEXT,
    stdout_log TEXT,
    stderr_log TEXT,
    exit_code INTEGER,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    completed_at TEXT,
    CHECK (state IN ('pending', 'processing', 'completed', 'failed', 'dead')),
    CHECK (priority >= 0 AND priority <= 10)
);

CREATE INDEX IF NOT EXISTS idx_jobs_claim ON jobs (state, priority, created_at);

CREATE TABLE IF NOT EXISTS dead_letters (
    id TEXT PRIMARY KEY,
    job_id TEXT NOT NULL UNIQUE,
    moved_at TEXT NOT NULL,
    reason TEXT NOT NULL,
    snapshot TEXT NOT NULL,
    FOREIGN KEY (job_id) REFERENCES jobs (id)
);

CREATE TABLE IF NOT EXISTS config (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// SQLite job store.
///
/// One store handle per process; it owns a single-connection pool, so every
/// statement from this process is serialized and no connection ever crosses
/// a thread boundary mid-use. Cross-process exclusion comes from SQLite's
/// own write locking.
pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    /// Open (or create) the store at `path` and initialize the schema.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(db_err)?;

        sqlx::raw_sql(SCHEMA).execute(&pool).await.map_err(db_err)?;
        debug!("store schema initialized");

        Ok(Self { pool })
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn db_err(err: sqlx::Error) -> QueueError {
    QueueError::Store(err.into())
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

fn required_ts(row: &SqliteRow, column: &str) -> Result<DateTime<Utc>> {
    let raw: String = row.try_get(column).map_err(db_err)?;
    clock::parse_canonical(&raw)
}

fn optional_ts(row: &SqliteRow, column: &str) -> Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.try_get(column).map_err(db_err)?;
    raw.as_deref().map(clock::parse_canonical).transpose()
}

fn job_from_row(row: &SqliteRow) -> Result<Job> {
    let state: String = row.try_get("state").map_err(db_err)?;
    Ok(Job {
        id: row.try_get("id").map_err(db_err)?,
        command: row.try_get("command").map_err(db_err)?,
        state: state.parse()?,
        attempts: row.try_get("attempts").map_err(db_err)?,
        max_retries: row.try_get("max_retries").map_err(db_err)?,
        priority: row.try_get("priority").map_err(db_err)?,
        created_at: required_ts(row, "created_at")?,
        updated_at: required_ts(row, "updated_at")?,
        completed_at: optional_ts(row, "completed_at")?,
        retry_at: optional_ts(row, "retry_at")?,
        run_at: optional_ts(row, "run_at")?,
        locked_by: row.try_get("locked_by").map_err(db_err)?,
        locked_at: optional_ts(row, "locked_at")?,
        last_error: row.try_get("last_error").map_err(db_err)?,
        stdout_log: row.try_get("stdout_log").map_err(db_err)?,
        stderr_log: row.try_get("stderr_log").map_err(db_err)?,
        exit_code: row.try_get("exit_code").map_err(db_err)?,
    })
}

fn dead_letter_from_row(row: &SqliteRow) -> Result<DeadLetter> {
    let snapshot: String = row.try_get("snapshot").map_err(db_err)?;
    Ok(DeadLetter {
        id: row.try_get("id").map_err(db_err)?,
        job_id: row.try_get("job_id").map_err(db_err)?,
        moved_at: required_ts(row, "moved_at")?,
        reason: row.try_get("reason").map_err(db_err)?,
        snapshot: serde_json::from_str(&snapshot)
            .map_err(|e| QueueError::Store(anyhow::Error::new(e)))?,
    })
}

#[async_trait::async_trait]
impl JobStore for SqliteJobStore {
    async fn enqueue(&self, request: &EnqueueRequest) -> Result<Job> {
        request.validate()?;

        let max_retries = match request.max_retries {
            Some(value) => value,
            None => self.load_config().await?.max_retries,
        };
        let now = clock::to_canonical(clock::now());

        let inserted = sqlx::query(
            r#"
            INSERT INTO jobs (id, command, state, attempts, max_retries, priority, run_at, created_at, updated_at)
            VALUES (?, ?, 'pending', 0, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&request.id)
        .bind(&request.command)
        .bind(max_retries)
        .bind(request.priority)
        .bind(request.run_at.map(clock::to_canonical))
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => {
                info!(job_id = %request.id, priority = request.priority, "job enqueued");
                self.get_job(&request.id).await
            }
            Err(e) if is_unique_violation(&e) => Err(QueueError::Conflict(format!(
                "job id {:?} already exists",
                request.id
            ))),
            Err(e) => Err(db_err(e)),
        }
    }

    async fn get_job(&self, job_id: &str) -> Result<Job> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        match row {
            Some(row) => job_from_row(&row),
            None => Err(QueueError::NotFound(format!("job {job_id:?}"))),
        }
    }

    async fn list_jobs(&self, state: Option<JobState>, limit: i64) -> Result<Vec<Job>> {
        let rows = match state {
            Some(state) => {
                sqlx::query(
                    "SELECT * FROM jobs WHERE state = ? \
                     ORDER BY datetime(created_at) DESC, id DESC LIMIT ?",
                )
                .bind(state.as_str())
                .bind(limit)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(
                    "SELECT * FROM jobs \
                     ORDER BY datetime(created_at) DESC, id DESC LIMIT ?",
                )
                .bind(limit)
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(db_err)?;

        rows.iter().map(job_from_row).collect()
    }

    async fn job_counts(&self) -> Result<BTreeMap<JobState, i64>> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS count FROM jobs GROUP BY state")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        let mut counts = BTreeMap::new();
        for row in rows {
            let state: String = row.try_get("state").map_err(db_err)?;
            let count: i64 = row.try_get("count").map_err(db_err)?;
            counts.insert(state.parse::<JobState>()?, count);
        }
        Ok(counts)
    }

    async fn delete_job(&self, job_id: &str) -> Result<bool> {
        let mut tx = self
            .pool
            .begin_with("BEGIN IMMEDIATE")
            .await
            .map_err(db_err)?;
        sqlx::query("DELETE FROM dead_letters WHERE job_id = ?")
            .bind(job_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        let deleted = sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(job_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(deleted.rows_affected() > 0)
    }

    async fn claim(&self, worker_id: i64, lease_seconds: i64) -> Result<Option<Job>> {
        // On-demand maintenance: wake sleeping retries, reclaim dead workers'
        // jobs. Each is a single atomic statement, safe against other
        // claimers.
        self.promote_retry_ready().await?;
        self.reclaim_expired_locks(lease_seconds).await?;

        let now = clock::to_canonical(clock::now());
        let mut tx = self
            .pool
            .begin_with("BEGIN IMMEDIATE")
            .await
            .map_err(db_err)?;

        // Urgent jobs (priority > 0) jump the queue in priority order; the
        // rest run FIFO. The stale-lock arm duplicates the reclamation
        // predicate so a claim can steal without a prior maintenance pass.
        let candidate = sqlx::query(
            r#"
            SELECT id FROM jobs
            WHERE state = 'pending'
              AND (run_at IS NULL OR datetime(run_at) <= datetime(?1))
              AND (retry_at IS NULL OR datetime(retry_at) <= datetime(?1))
              AND (
                  locked_by IS NULL
                  OR (locked_at IS NOT NULL
                      AND datetime(locked_at) < datetime(?1, '-' || ?2 || ' seconds'))
              )
            ORDER BY
                CASE WHEN priority > 0 THEN 0 ELSE 1 END,
                priority DESC,
                datetime(created_at) ASC,
                id ASC
            LIMIT 1
            "#,
        )
        .bind(&now)
        .bind(lease_seconds)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;

        let Some(row) = candidate else {
            tx.commit().await.map_err(db_err)?;
            return Ok(None);
        };
        let job_id: String = row.try_get("id").map_err(db_err)?;

        sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'processing', locked_by = ?, locked_at = ?, retry_at = NULL, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(worker_id)
        .bind(&now)
        .bind(&now)
        .bind(&job_id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(&job_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_err)?;
        let job = job_from_row(&row)?;
        tx.commit().await.map_err(db_err)?;

        debug!(job_id = %job.id, worker_id, "job claimed");
        Ok(Some(job))
    }

    async fn begin_attempt(&self, job_id: &str) -> Result<()> {
        let updated = sqlx::query("UPDATE jobs SET attempts = attempts + 1, updated_at = ? WHERE id = ?")
            .bind(clock::to_canonical(clock::now()))
            .bind(job_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        if updated.rows_affected() == 0 {
            return Err(QueueError::NotFound(format!("job {job_id:?}")));
        }
        Ok(())
    }

    async fn record_output(&self, job_id: &str, output: &RunOutput) -> Result<()> {
        let updated = sqlx::query(
            r#"
            UPDATE jobs
            SET stdout_log = ?, stderr_log = ?, exit_code = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&output.stdout)
        .bind(&output.stderr)
        .bind(output.exit_code)
        .bind(clock::to_canonical(clock::now()))
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if updated.rows_affected() == 0 {
            return Err(QueueError::NotFound(format!("job {job_id:?}")));
        }
        Ok(())
    }

    async fn mark_succeeded(&self, job_id: &str) -> Result<()> {
        let now = clock::to_canonical(clock::now());
        let updated = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'completed', completed_at = ?, locked_by = NULL, locked_at = NULL, updated_at = ?
            WHERE id = ? AND state = 'processing'
            "#,
        )
        .bind(&now)
        .bind(&now)
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if updated.rows_affected() == 0 {
            return Err(QueueError::Conflict(format!(
                "job {job_id:?} is not processing"
            )));
        }
        info!(job_id, "job completed");
        Ok(())
    }

    async fn schedule_retry(
        &self,
        job_id: &str,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<()> {
        let updated = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'pending', retry_at = ?, last_error = ?, locked_by = NULL, locked_at = NULL, updated_at = ?
            WHERE id = ? AND state = 'processing'
            "#,
        )
        .bind(clock::to_canonical(retry_at))
        .bind(error)
        .bind(clock::to_canonical(clock::now()))
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if updated.rows_affected() == 0 {
            return Err(QueueError::Conflict(format!(
                "job {job_id:?} is not processing"
            )));
        }
        info!(job_id, retry_at = %clock::to_canonical(retry_at), "retry scheduled");
        Ok(())
    }

    async fn move_to_dead(&self, job_id: &str, reason: &str) -> Result<()> {
        let mut tx = self
            .pool
            .begin_with("BEGIN IMMEDIATE")
            .await
            .map_err(db_err)?;

        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(job_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?;
        let Some(row) = row else {
            return Err(QueueError::NotFound(format!("job {job_id:?}")));
        };
        let job = job_from_row(&row)?;

        if job.state == JobState::Dead {
            // Not moved again; the existing entry stands.
            tx.commit().await.map_err(db_err)?;
            return Ok(());
        }

        let now = clock::to_canonical(clock::now());
        let snapshot = serde_json::to_string(&job)
            .map_err(|e| QueueError::Store(anyhow::Error::new(e)))?;

        sqlx::query(
            "INSERT INTO dead_letters (id, job_id, moved_at, reason, snapshot) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(job_id)
        .bind(&now)
        .bind(reason)
        .bind(&snapshot)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        let updated = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'dead', locked_by = NULL, locked_at = NULL, updated_at = ?
            WHERE id = ? AND state = 'processing'
            "#,
        )
        .bind(&now)
        .bind(job_id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        if updated.rows_affected() == 0 {
            tx.rollback().await.map_err(db_err)?;
            return Err(QueueError::Conflict(format!(
                "job {job_id:?} is not processing"
            )));
        }

        tx.commit().await.map_err(db_err)?;
        warn!(job_id, reason, "job moved to dead letter");
        Ok(())
    }

    async fn promote_retry_ready(&self) -> Result<u64> {
        let now = clock::to_canonical(clock::now());
        let updated = sqlx::query(
            r#"
            UPDATE jobs
            SET retry_at = NULL, locked_by = NULL, locked_at = NULL, updated_at = ?1
            WHERE state = 'pending'
              AND retry_at IS NOT NULL
              AND datetime(retry_at) <= datetime(?1)
            "#,
        )
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        let count = updated.rows_affected();
        if count > 0 {
            debug!(count, "promoted retry-ready jobs");
        }
        Ok(count)
    }

    async fn reclaim_expired_locks(&self, lease_seconds: i64) -> Result<u64> {
        let now = clock::to_canonical(clock::now());
        let updated = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'pending', locked_by = NULL, locked_at = NULL, updated_at = ?1
            WHERE state = 'processing'
              AND locked_at IS NOT NULL
              AND datetime(locked_at) < datetime(?1, '-' || ?2 || ' seconds')
            "#,
        )
        .bind(&now)
        .bind(lease_seconds)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        let count = updated.rows_affected();
        if count > 0 {
            info!(count, "reclaimed expired locks");
        }
        Ok(count)
    }

    async fn list_dead(&self, limit: i64) -> Result<Vec<DeadLetter>> {
        let rows = sqlx::query(
            "SELECT * FROM dead_letters ORDER BY datetime(moved_at) DESC, id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(dead_letter_from_row).collect()
    }

    async fn requeue_from_dead(&self, job_id: &str) -> Result<bool> {
        let mut tx = self
            .pool
            .begin_with("BEGIN IMMEDIATE")
            .await
            .map_err(db_err)?;

        let removed = sqlx::query("DELETE FROM dead_letters WHERE job_id = ?")
            .bind(job_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        if removed.rows_affected() == 0 {
            tx.commit().await.map_err(db_err)?;
            return Ok(false);
        }

        sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'pending', attempts = 0, retry_at = NULL,
                locked_by = NULL, locked_at = NULL, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(clock::to_canonical(clock::now()))
        .bind(job_id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        info!(job_id, "job requeued from dead letter");
        Ok(true)
    }

    async fn get_output(&self, job_id: &str) -> Result<JobOutput> {
        let row = sqlx::query(
            "SELECT stdout_log, stderr_log, exit_code, completed_at FROM jobs WHERE id = ?",
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        let Some(row) = row else {
            return Err(QueueError::NotFound(format!("job {job_id:?}")));
        };
        Ok(JobOutput {
            stdout_log: row.try_get("stdout_log").map_err(db_err)?,
            stderr_log: row.try_get("stderr_log").map_err(db_err)?,
            exit_code: row.try_get("exit_code").map_err(db_err)?,
            completed_at: optional_ts(&row, "completed_at")?,
        })
    }

    async fn config_get(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM config WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        if let Some(row) = row {
            return Ok(Some(row.try_get("value").map_err(db_err)?));
        }
        Ok(config::DEFAULTS
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.to_string()))
    }

    async fn config_set(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO config (key, value) VALUES (?, ?) \
             ON CONFLICT (key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        info!(key, value, "config updated");
        Ok(())
    }

    async fn config_all(&self) -> Result<BTreeMap<String, String>> {
        let rows = sqlx::query("SELECT key, value FROM config")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        let mut map = BTreeMap::new();
        for row in rows {
            let key: String = row.try_get("key").map_err(db_err)?;
            let value: String = row.try_get("value").map_err(db_err)?;
            map.insert(key, value);
        }
        for (key, value) in config::DEFAULTS {
            map.entry(key.to_string())
                .or_insert_with(|| value.to_string());
        }
        Ok(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use tempfile::TempDir;

    async fn open_store() -> (TempDir, SqliteJobStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteJobStore::open(dir.path().join("queue.db"))
            .await
            .unwrap();
        (dir, store)
    }

    fn request(id: &str, command: &str) -> EnqueueRequest {
        EnqueueRequest::new(id, command)
    }

    /// Rewind a timestamp column so lease/retry windows expire without
    /// sleeping through them.
    async fn backdate(store: &SqliteJobStore, column: &str, id: &str, seconds: i64) {
        let past = clock::to_canonical(clock::now() - ChronoDuration::seconds(seconds));
        sqlx::query(&format!("UPDATE jobs SET {column} = ? WHERE id = ?"))
            .bind(past)
            .bind(id)
            .execute(store.pool())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn enqueue_and_get_round_trip() {
        let (_dir, store) = open_store().await;
        let mut req = request("a", "echo hello");
        req.max_retries = Some(2);
        req.priority = 4;
        store.enqueue(&req).await.unwrap();

        let job = store.get_job("a").await.unwrap();
        assert_eq!(job.id, "a");
        assert_eq!(job.command, "echo hello");
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.max_retries, 2);
        assert_eq!(job.priority, 4);
        assert!(job.run_at.is_none());
        assert!(job.locked_by.is_none() && job.locked_at.is_none());
    }

    #[tokio::test]
    async fn enqueue_rejects_duplicate_ids() {
        let (_dir, store) = open_store().await;
        store.enqueue(&request("a", "true")).await.unwrap();
        let err = store.enqueue(&request("a", "false")).await.unwrap_err();
        assert!(matches!(err, QueueError::Conflict(_)));
    }

    #[tokio::test]
    async fn enqueue_applies_configured_default_budget() {
        let (_dir, store) = open_store().await;
        store.config_set("max_retries", "7").await.unwrap();
        let job = store.enqueue(&request("a", "true")).await.unwrap();
        assert_eq!(job.max_retries, 7);

        let mut explicit = request("b", "true");
        explicit.max_retries = Some(1);
        let job = store.enqueue(&explicit).await.unwrap();
        assert_eq!(job.max_retries, 1);
    }

    #[tokio::test]
    async fn enqueue_validates_input() {
        let (_dir, store) = open_store().await;
        assert!(matches!(
            store.enqueue(&request("a", "  ")).await,
            Err(QueueError::Input(_))
        ));
        let mut req = request("a", "true");
        req.priority = 11;
        assert!(matches!(
            store.enqueue(&req).await,
            Err(QueueError::Input(_))
        ));
    }

    #[tokio::test]
    async fn missing_job_is_not_found() {
        let (_dir, store) = open_store().await;
        assert!(matches!(
            store.get_job("ghost").await,
            Err(QueueError::NotFound(_))
        ));
        assert!(matches!(
            store.get_output("ghost").await,
            Err(QueueError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn claim_locks_and_transitions() {
        let (_dir, store) = open_store().await;
        store.enqueue(&request("a", "true")).await.unwrap();

        let job = store.claim(41, 300).await.unwrap().unwrap();
        assert_eq!(job.id, "a");
        assert_eq!(job.state, JobState::Processing);
        assert_eq!(job.locked_by, Some(41));
        assert!(job.locked_at.is_some());

        // Nothing left: the claimed job is invisible to further claims.
        assert!(store.claim(42, 300).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_on_empty_store_returns_none() {
        let (_dir, store) = open_store().await;
        assert!(store.claim(1, 300).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_orders_by_urgency_priority_then_fifo() {
        let (_dir, store) = open_store().await;
        store.enqueue(&request("first-fifo", "true")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        store.enqueue(&request("second-fifo", "true")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let mut urgent = request("urgent", "true");
        urgent.priority = 10;
        store.enqueue(&urgent).await.unwrap();
        let mut medium = request("medium", "true");
        medium.priority = 5;
        store.enqueue(&medium).await.unwrap();

        let order: Vec<String> = [
            store.claim(1, 300).await.unwrap().unwrap().id,
            store.claim(1, 300).await.unwrap().unwrap().id,
            store.claim(1, 300).await.unwrap().unwrap().id,
            store.claim(1, 300).await.unwrap().unwrap().id,
        ]
        .into();
        assert_eq!(order, ["urgent", "medium", "first-fifo", "second-fifo"]);
    }

    #[tokio::test]
    async fn future_run_at_is_invisible() {
        let (_dir, store) = open_store().await;
        let mut req = request("later", "true");
        req.run_at = Some(clock::now() + ChronoDuration::hours(1));
        store.enqueue(&req).await.unwrap();

        assert!(store.claim(1, 300).await.unwrap().is_none());

        backdate(&store, "run_at", "later", 10).await;
        let job = store.claim(1, 300).await.unwrap().unwrap();
        assert_eq!(job.id, "later");
    }

    #[tokio::test]
    async fn sleeping_retry_is_not_claimable() {
        let (_dir, store) = open_store().await;
        store.enqueue(&request("a", "false")).await.unwrap();

        store.claim(1, 300).await.unwrap().unwrap();
        store.begin_attempt("a").await.unwrap();
        store
            .schedule_retry("a", "Exit code 1: boom", clock::now() + ChronoDuration::hours(1))
            .await
            .unwrap();

        assert!(store.claim(1, 300).await.unwrap().is_none());

        backdate(&store, "retry_at", "a", 10).await;
        let job = store.claim(2, 300).await.unwrap().unwrap();
        assert_eq!(job.id, "a");
        assert!(job.retry_at.is_none(), "claim clears retry_at");
        assert_eq!(job.last_error.as_deref(), Some("Exit code 1: boom"));
    }

    #[tokio::test]
    async fn promote_retry_ready_clears_retry_state() {
        let (_dir, store) = open_store().await;
        store.enqueue(&request("a", "false")).await.unwrap();
        store.claim(1, 300).await.unwrap().unwrap();
        store.begin_attempt("a").await.unwrap();
        store
            .schedule_retry("a", "boom", clock::now() + ChronoDuration::seconds(3600))
            .await
            .unwrap();

        // Not ready yet.
        assert_eq!(store.promote_retry_ready().await.unwrap(), 0);

        backdate(&store, "retry_at", "a", 10).await;
        assert_eq!(store.promote_retry_ready().await.unwrap(), 1);

        let job = store.get_job("a").await.unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert!(job.retry_at.is_none());
        assert!(job.locked_by.is_none() && job.locked_at.is_none());

        // Idempotent.
        assert_eq!(store.promote_retry_ready().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn reclaim_returns_stale_processing_jobs() {
        let (_dir, store) = open_store().await;
        store.enqueue(&request("a", "sleep 60")).await.unwrap();
        store.claim(99, 300).await.unwrap().unwrap();
        store.begin_attempt("a").await.unwrap();

        // Lease still fresh.
        assert_eq!(store.reclaim_expired_locks(300).await.unwrap(), 0);

        backdate(&store, "locked_at", "a", 1000).await;
        assert_eq!(store.reclaim_expired_locks(300).await.unwrap(), 1);

        let job = store.get_job("a").await.unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert!(job.locked_by.is_none() && job.locked_at.is_none());
        // The interrupted attempt stays counted.
        assert_eq!(job.attempts, 1);
    }

    #[tokio::test]
    async fn stale_lock_is_stolen_by_next_claim() {
        let (_dir, store) = open_store().await;
        store.enqueue(&request("a", "sleep 60")).await.unwrap();
        store.claim(99, 300).await.unwrap().unwrap();
        backdate(&store, "locked_at", "a", 1000).await;

        let job = store.claim(7, 300).await.unwrap().unwrap();
        assert_eq!(job.id, "a");
        assert_eq!(job.locked_by, Some(7));
        assert_eq!(job.state, JobState::Processing);
    }

    #[tokio::test]
    async fn mark_succeeded_finalizes_the_row() {
        let (_dir, store) = open_store().await;
        store.enqueue(&request("a", "echo hi")).await.unwrap();
        store.claim(1, 300).await.unwrap().unwrap();
        store.begin_attempt("a").await.unwrap();
        store
            .record_output(
                "a",
                &RunOutput {
                    exit_code: 0,
                    stdout: "hi\n".into(),
                    stderr: String::new(),
                },
            )
            .await
            .unwrap();
        store.mark_succeeded("a").await.unwrap();

        let job = store.get_job("a").await.unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert!(job.completed_at.is_some());
        assert!(job.locked_by.is_none() && job.locked_at.is_none());
        assert_eq!(job.exit_code, Some(0));

        let output = store.get_output("a").await.unwrap();
        assert_eq!(output.stdout_log.as_deref(), Some("hi\n"));
        assert_eq!(output.exit_code, Some(0));
        assert!(output.completed_at.is_some());
    }

    #[tokio::test]
    async fn completed_is_terminal() {
        let (_dir, store) = open_store().await;
        store.enqueue(&request("a", "true")).await.unwrap();
        store.claim(1, 300).await.unwrap().unwrap();
        store.mark_succeeded("a").await.unwrap();

        // Every further transition is refused as a conflict.
        assert!(matches!(
            store.mark_succeeded("a").await,
            Err(QueueError::Conflict(_))
        ));
        assert!(matches!(
            store.schedule_retry("a", "x", clock::now()).await,
            Err(QueueError::Conflict(_))
        ));
        assert!(matches!(
            store.move_to_dead("a", "x").await,
            Err(QueueError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn dead_letter_move_and_requeue_round_trip() {
        let (_dir, store) = open_store().await;
        store.enqueue(&request("d", "false")).await.unwrap();
        store.claim(1, 300).await.unwrap().unwrap();
        store.begin_attempt("d").await.unwrap();
        store
            .move_to_dead("d", "Max retries exceeded: Exit code 1: ")
            .await
            .unwrap();

        let job = store.get_job("d").await.unwrap();
        assert_eq!(job.state, JobState::Dead);
        assert!(job.locked_by.is_none());

        let dead = store.list_dead(10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].job_id, "d");
        assert!(dead[0].reason.starts_with("Max retries exceeded:"));
        // The snapshot froze the pre-move row.
        assert_eq!(dead[0].snapshot["state"], "processing");
        assert_eq!(dead[0].snapshot["command"], "false");

        assert!(store.requeue_from_dead("d").await.unwrap());
        let job = store.get_job("d").await.unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.attempts, 0);
        assert!(job.retry_at.is_none());
        assert!(job.locked_by.is_none());
        assert!(store.list_dead(10).await.unwrap().is_empty());

        // A second requeue finds nothing.
        assert!(!store.requeue_from_dead("d").await.unwrap());
    }

    #[tokio::test]
    async fn move_to_dead_twice_is_a_noop() {
        let (_dir, store) = open_store().await;
        store.enqueue(&request("d", "false")).await.unwrap();
        store.claim(1, 300).await.unwrap().unwrap();
        store.move_to_dead("d", "first").await.unwrap();
        store.move_to_dead("d", "second").await.unwrap();

        let dead = store.list_dead(10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].reason, "first");
    }

    #[tokio::test]
    async fn job_counts_group_by_state() {
        let (_dir, store) = open_store().await;
        store.enqueue(&request("a", "true")).await.unwrap();
        store.enqueue(&request("b", "true")).await.unwrap();
        store.enqueue(&request("c", "true")).await.unwrap();
        store.claim(1, 300).await.unwrap().unwrap();

        let counts = store.job_counts().await.unwrap();
        assert_eq!(counts.get(&JobState::Pending), Some(&2));
        assert_eq!(counts.get(&JobState::Processing), Some(&1));
        assert_eq!(counts.get(&JobState::Completed), None);
    }

    #[tokio::test]
    async fn list_jobs_filters_and_orders_newest_first() {
        let (_dir, store) = open_store().await;
        store.enqueue(&request("old", "true")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        store.enqueue(&request("mid", "true")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        store.enqueue(&request("new", "true")).await.unwrap();

        let jobs = store.list_jobs(None, 2).await.unwrap();
        let ids: Vec<&str> = jobs.iter().map(|j| j.id.as_str()).collect();
        assert_eq!(ids, ["new", "mid"]);

        store.claim(1, 300).await.unwrap().unwrap();
        let pending = store.list_jobs(Some(JobState::Pending), 10).await.unwrap();
        assert_eq!(pending.len(), 2);
        let processing = store
            .list_jobs(Some(JobState::Processing), 10)
            .await
            .unwrap();
        assert_eq!(processing.len(), 1);
        assert_eq!(processing[0].id, "old");
    }

    #[tokio::test]
    async fn delete_job_takes_the_dead_letter_entry_with_it() {
        let (_dir, store) = open_store().await;
        store.enqueue(&request("d", "false")).await.unwrap();
        store.claim(1, 300).await.unwrap().unwrap();
        store.move_to_dead("d", "gone").await.unwrap();

        assert!(store.delete_job("d").await.unwrap());
        assert!(store.list_dead(10).await.unwrap().is_empty());
        assert!(matches!(
            store.get_job("d").await,
            Err(QueueError::NotFound(_))
        ));

        assert!(!store.delete_job("d").await.unwrap());
    }

    #[tokio::test]
    async fn config_round_trip_with_defaults() {
        let (_dir, store) = open_store().await;

        // Absent kernel keys fall back to their defaults.
        assert_eq!(
            store.config_get("max_retries").await.unwrap().as_deref(),
            Some("3")
        );
        assert_eq!(store.config_get("no_such_key").await.unwrap(), None);

        store.config_set("max_retries", "5").await.unwrap();
        store.config_set("custom_key", "custom").await.unwrap();
        assert_eq!(
            store.config_get("max_retries").await.unwrap().as_deref(),
            Some("5")
        );
        assert_eq!(
            store.config_get("custom_key").await.unwrap().as_deref(),
            Some("custom")
        );

        let all = store.config_all().await.unwrap();
        assert_eq!(all.get("max_retries").map(String::as_str), Some("5"));
        assert_eq!(all.get("backoff_base").map(String::as_str), Some("2"));
        assert_eq!(all.get("custom_key").map(String::as_str), Some("custom"));

        let config = store.load_config().await.unwrap();
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.lock_lease_seconds, 300);
    }

    #[tokio::test]
    async fn malformed_config_is_fatal_at_load() {
        let (_dir, store) = open_store().await;
        store.config_set("backoff_base", "two").await.unwrap();
        assert!(matches!(
            store.load_config().await,
            Err(QueueError::Config(_))
        ));
    }
}
