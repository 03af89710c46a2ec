//! SQLite driver for the drudge job queue.
//!
//! Single-writer relational backend. The logical schema is
//! column-compatible with the Postgres driver; dialect differences are
//! TEXT/INTEGER column types (timestamps as unix milliseconds) and the
//! claim algorithm: SQLite has no `FOR UPDATE SKIP LOCKED`, so claims run
//! as an optimistic read-then-conditional-update retry loop relying on the
//! engine's serialized writes.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use drudge_sqlite::SqliteDriver;
//! use drudge_core::Client;
//!
//! #[tokio::main]
//! async fn main() -> drudge_core::Result<()> {
//!     let driver = SqliteDriver::new("sqlite:jobs.db").await?;
//!     let client = Client::new(driver);
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::time::Duration;

use drudge_core::{
    from_millis, to_millis, BackoffKind, CancelOutcome, Capabilities, ClaimedJob, Driver,
    EnqueueOutcome, FailureKind, FailureReport, Job, JobId, JobStatus, LockToken, NewJob,
    ProgressUpdate, QueueError, QueueStats, Result, ScheduleSpec, Stage,
};

/// Bound on the optimistic claim loop; each iteration re-selects a
/// candidate, so exhaustion just means heavy contention right now.
const CLAIM_RETRIES: usize = 5;

/// Message surfaced to the next claimant of an expired lock.
const LOCK_EXPIRED_MESSAGE: &str = "job lock expired before completion";

/// SQLite driver for job queue storage.
#[derive(Clone)]
pub struct SqliteDriver {
    pool: SqlitePool,
}

impl SqliteDriver {
    /// Create a new SQLite driver.
    ///
    /// The URL is `sqlite:path/to/db.sqlite` or `sqlite::memory:`.
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1) // SQLite works best with a single write connection
            .connect(database_url)
            .await
            .map_err(|e| QueueError::Connection(format!("Failed to connect to SQLite: {}", e)))?;

        let driver = Self { pool };
        driver.init_tables().await?;
        Ok(driver)
    }

    /// Create an in-memory driver (useful for testing).
    pub async fn in_memory() -> Result<Self> {
        Self::new("sqlite::memory:").await
    }

    async fn init_tables(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS drudge_jobs (
                id TEXT PRIMARY KEY,
                queue TEXT NOT NULL,
                key TEXT,
                data TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                priority INTEGER NOT NULL DEFAULT 0,
                scheduled_for INTEGER,
                attempts INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL DEFAULT 3,
                next_retry_at INTEGER,
                backoff_ms INTEGER NOT NULL DEFAULT 10000,
                backoff_kind TEXT NOT NULL DEFAULT 'exponential',
                locked_by TEXT,
                locked_at INTEGER,
                expires_at INTEGER,
                lock_token TEXT,
                error_message TEXT,
                error_details TEXT,
                stages TEXT NOT NULL DEFAULT '[]',
                current_stage TEXT,
                overall_progress REAL NOT NULL DEFAULT 0,
                metadata TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                completed_at INTEGER
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| QueueError::Driver(format!("Failed to create jobs table: {}", e)))?;

        // Idempotency: one live job per (queue, key).
        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_drudge_jobs_queue_key
            ON drudge_jobs (queue, key)
            WHERE key IS NOT NULL AND status IN ('pending', 'processing', 'retry_pending')
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| QueueError::Driver(format!("Failed to create key index: {}", e)))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_drudge_jobs_claim ON drudge_jobs (queue, status, priority, created_at)",
        )
        .execute(&self.pool)
        .await
        .ok();

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS drudge_schedules (
                id TEXT PRIMARY KEY,
                queue TEXT NOT NULL,
                cron TEXT NOT NULL,
                payload TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                next_run_at INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| QueueError::Driver(format!("Failed to create schedules table: {}", e)))?;

        Ok(())
    }

    async fn fetch_job(&self, id: &JobId) -> Result<Option<Job>> {
        let row = sqlx::query("SELECT * FROM drudge_jobs WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| QueueError::Driver(format!("Failed to fetch job: {}", e)))?;

        row.map(|r| row_to_job(&r)).transpose()
    }
}

fn driver_err(context: &str, e: sqlx::Error) -> QueueError {
    QueueError::Driver(format!("{}: {}", context, e))
}

fn row_to_job(row: &SqliteRow) -> Result<Job> {
    let get = |e: sqlx::Error| QueueError::Driver(format!("Bad job row: {}", e));

    let status: String = row.try_get("status").map_err(get)?;
    let backoff_kind: String = row.try_get("backoff_kind").map_err(get)?;
    let data: String = row.try_get("data").map_err(get)?;
    let stages: String = row.try_get("stages").map_err(get)?;
    let error_details: Option<String> = row.try_get("error_details").map_err(get)?;
    let metadata: Option<String> = row.try_get("metadata").map_err(get)?;
    let lock_token: Option<String> = row.try_get("lock_token").map_err(get)?;
    let id: String = row.try_get("id").map_err(get)?;

    let opt_millis = |col: &str| -> Result<Option<DateTime<Utc>>> {
        let ms: Option<i64> = row.try_get(col).map_err(get)?;
        Ok(ms.map(from_millis))
    };

    Ok(Job {
        id: JobId::parse(&id)?,
        queue: row.try_get("queue").map_err(get)?,
        key: row.try_get("key").map_err(get)?,
        data: serde_json::from_str(&data)?,
        status: JobStatus::parse(&status)?,
        priority: row.try_get::<i64, _>("priority").map_err(get)? as i32,
        scheduled_for: opt_millis("scheduled_for")?,
        attempts: row.try_get::<i64, _>("attempts").map_err(get)? as u32,
        max_attempts: row.try_get::<i64, _>("max_attempts").map_err(get)? as u32,
        next_retry_at: opt_millis("next_retry_at")?,
        backoff_ms: row.try_get::<i64, _>("backoff_ms").map_err(get)? as u64,
        backoff_kind: BackoffKind::parse(&backoff_kind)?,
        locked_by: row.try_get("locked_by").map_err(get)?,
        locked_at: opt_millis("locked_at")?,
        expires_at: opt_millis("expires_at")?,
        lock_token: lock_token
            .map(|t| uuid::Uuid::parse_str(&t))
            .transpose()
            .map_err(|e| QueueError::Driver(format!("Bad lock token: {}", e)))?
            .map(LockToken),
        error_message: row.try_get("error_message").map_err(get)?,
        error_details: error_details.map(|d| serde_json::from_str(&d)).transpose()?,
        stages: serde_json::from_str::<Vec<Stage>>(&stages)?,
        current_stage: row.try_get("current_stage").map_err(get)?,
        overall_progress: row.try_get::<f64, _>("overall_progress").map_err(get)? as f32,
        metadata: metadata.map(|m| serde_json::from_str(&m)).transpose()?,
        created_at: from_millis(row.try_get("created_at").map_err(get)?),
        updated_at: from_millis(row.try_get("updated_at").map_err(get)?),
        completed_at: opt_millis("completed_at")?,
    })
}

#[async_trait]
impl Driver for SqliteDriver {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            skip_locked: false,
            notify: false,
            jsonb: false,
            persistent_schedules: true,
            durable_retry_visibility: true,
        }
    }

    async fn enqueue(&self, job: NewJob) -> Result<EnqueueOutcome> {
        // Idempotency check: a colliding key on a live job short-circuits.
        if let Some(key) = &job.key {
            let existing: Option<(String,)> = sqlx::query_as(
                r#"
                SELECT id FROM drudge_jobs
                WHERE queue = ?1 AND key = ?2
                  AND status IN ('pending', 'processing', 'retry_pending')
                "#,
            )
            .bind(&job.queue)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| driver_err("Failed to check idempotency key", e))?;

            if let Some((id,)) = existing {
                return Ok(EnqueueOutcome::Deduplicated(JobId::parse(&id)?));
            }
        }

        let id = job.id.clone();
        let now_ms = to_millis(job.created_at);
        let result = sqlx::query(
            r#"
            INSERT INTO drudge_jobs
                (id, queue, key, data, status, priority, scheduled_for,
                 attempts, max_attempts, backoff_ms, backoff_kind,
                 stages, overall_progress, metadata, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?6, 0, ?7, ?8, ?9, '[]', 0, ?10, ?11, ?11)
            "#,
        )
        .bind(id.to_string())
        .bind(&job.queue)
        .bind(&job.key)
        .bind(serde_json::to_string(&job.data)?)
        .bind(job.priority as i64)
        .bind(job.scheduled_for.map(to_millis))
        .bind(job.max_attempts as i64)
        .bind(job.backoff_ms as i64)
        .bind(job.backoff_kind.as_str())
        .bind(
            job.metadata
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .bind(now_ms)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(EnqueueOutcome::Created(id)),
            // A concurrent writer won the unique (queue, key) race.
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() && job.key.is_some() => {
                let (existing,): (String,) = sqlx::query_as(
                    r#"
                    SELECT id FROM drudge_jobs
                    WHERE queue = ?1 AND key = ?2
                      AND status IN ('pending', 'processing', 'retry_pending')
                    "#,
                )
                .bind(&job.queue)
                .bind(&job.key)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| driver_err("Failed to resolve key collision", e))?;
                Ok(EnqueueOutcome::Deduplicated(JobId::parse(&existing)?))
            }
            Err(e) => Err(driver_err("Failed to enqueue job", e)),
        }
    }

    async fn claim(
        &self,
        queue: &str,
        worker_id: &str,
        lock_duration: Duration,
    ) -> Result<Option<ClaimedJob>> {
        // Expired locks with no attempts left cannot be re-handed out; bury
        // them here so they reach a terminal status instead of sitting in
        // `processing` forever.
        sqlx::query(
            r#"
            UPDATE drudge_jobs SET
                status = 'failed',
                error_message = ?1,
                completed_at = ?2,
                updated_at = ?2,
                locked_by = NULL, locked_at = NULL, expires_at = NULL, lock_token = NULL
            WHERE queue = ?3 AND status = 'processing' AND expires_at < ?2
                  AND attempts >= max_attempts
            "#,
        )
        .bind(LOCK_EXPIRED_MESSAGE)
        .bind(to_millis(Utc::now()))
        .bind(queue)
        .execute(&self.pool)
        .await
        .map_err(|e| driver_err("Failed to bury expired jobs", e))?;

        for _ in 0..CLAIM_RETRIES {
            let now = Utc::now();
            let now_ms = to_millis(now);

            // Best eligible candidate: expired processing first, then
            // priority, then age.
            let candidate: Option<(String, String, i64)> = sqlx::query_as(
                r#"
                SELECT id, status, attempts FROM drudge_jobs
                WHERE queue = ?1 AND (
                    (status = 'pending' AND (scheduled_for IS NULL OR scheduled_for <= ?2))
                    OR (status = 'retry_pending' AND (next_retry_at IS NULL OR next_retry_at <= ?2))
                    OR (status = 'processing' AND expires_at < ?2 AND attempts < max_attempts)
                )
                ORDER BY CASE WHEN status = 'processing' THEN 0 ELSE 1 END,
                         priority DESC, created_at ASC
                LIMIT 1
                "#,
            )
            .bind(queue)
            .bind(now_ms)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| driver_err("Failed to select claim candidate", e))?;

            let (id, observed_status, observed_attempts) = match candidate {
                Some(c) => c,
                None => return Ok(None),
            };

            let token = LockToken::mint();
            let expires_ms = to_millis(
                now + chrono::Duration::from_std(lock_duration).unwrap_or_default(),
            );

            // Conditional update guarded by the observed status and attempt
            // count; a concurrent claimant changes either and we retry.
            let updated = sqlx::query(
                r#"
                UPDATE drudge_jobs SET
                    status = 'processing',
                    locked_by = ?1,
                    locked_at = ?2,
                    expires_at = ?3,
                    lock_token = ?4,
                    attempts = attempts + 1,
                    updated_at = ?2,
                    error_message = CASE WHEN status = 'processing'
                                         THEN ?5 ELSE error_message END
                WHERE id = ?6 AND status = ?7 AND attempts = ?8
                "#,
            )
            .bind(worker_id)
            .bind(now_ms)
            .bind(expires_ms)
            .bind(token.to_string())
            .bind(LOCK_EXPIRED_MESSAGE)
            .bind(&id)
            .bind(&observed_status)
            .bind(observed_attempts)
            .execute(&self.pool)
            .await
            .map_err(|e| driver_err("Failed to claim job", e))?;

            if updated.rows_affected() == 0 {
                continue; // lost the race, re-select
            }

            let job = self
                .fetch_job(&JobId::parse(&id)?)
                .await?
                .ok_or_else(|| QueueError::JobNotFound(id))?;
            return Ok(Some(ClaimedJob { job, token }));
        }

        tracing::debug!(queue = %queue, "Claim contention exhausted retries");
        Ok(None)
    }

    async fn extend_lock(
        &self,
        id: &JobId,
        token: &LockToken,
        until: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE drudge_jobs SET expires_at = ?1, updated_at = ?2
            WHERE id = ?3 AND lock_token = ?4 AND status = 'processing'
            "#,
        )
        .bind(to_millis(until))
        .bind(to_millis(Utc::now()))
        .bind(id.to_string())
        .bind(token.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| driver_err("Failed to extend lock", e))?;
        Ok(result.rows_affected() == 1)
    }

    async fn complete(&self, id: &JobId, token: &LockToken) -> Result<bool> {
        let now_ms = to_millis(Utc::now());
        let result = sqlx::query(
            r#"
            UPDATE drudge_jobs SET
                status = 'completed',
                completed_at = ?1,
                updated_at = ?1,
                overall_progress = 100.0,
                locked_by = NULL, locked_at = NULL, expires_at = NULL, lock_token = NULL
            WHERE id = ?2 AND lock_token = ?3 AND status = 'processing'
            "#,
        )
        .bind(now_ms)
        .bind(id.to_string())
        .bind(token.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| driver_err("Failed to complete job", e))?;
        Ok(result.rows_affected() == 1)
    }

    async fn fail(&self, id: &JobId, token: &LockToken, report: FailureReport) -> Result<bool> {
        let now_ms = to_millis(Utc::now());
        let details = report
            .details
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let result = match report.kind {
            FailureKind::Retry { at } => {
                sqlx::query(
                    r#"
                    UPDATE drudge_jobs SET
                        status = 'retry_pending',
                        next_retry_at = ?1,
                        error_message = ?2,
                        error_details = ?3,
                        updated_at = ?4,
                        locked_by = NULL, locked_at = NULL, expires_at = NULL, lock_token = NULL
                    WHERE id = ?5 AND lock_token = ?6 AND status = 'processing'
                    "#,
                )
                .bind(to_millis(at))
                .bind(&report.message)
                .bind(&details)
                .bind(now_ms)
                .bind(id.to_string())
                .bind(token.to_string())
                .execute(&self.pool)
                .await
            }
            FailureKind::Discard => {
                sqlx::query(
                    r#"
                    UPDATE drudge_jobs SET
                        status = 'failed',
                        error_message = ?1,
                        error_details = ?2,
                        updated_at = ?3,
                        completed_at = ?3,
                        locked_by = NULL, locked_at = NULL, expires_at = NULL, lock_token = NULL
                    WHERE id = ?4 AND lock_token = ?5 AND status = 'processing'
                    "#,
                )
                .bind(&report.message)
                .bind(&details)
                .bind(now_ms)
                .bind(id.to_string())
                .bind(token.to_string())
                .execute(&self.pool)
                .await
            }
            // Rate-limit path: the attempt is given back.
            FailureKind::Requeue { at } => {
                sqlx::query(
                    r#"
                    UPDATE drudge_jobs SET
                        status = 'pending',
                        scheduled_for = ?1,
                        attempts = MAX(attempts - 1, 0),
                        error_message = ?2,
                        error_details = ?3,
                        updated_at = ?4,
                        locked_by = NULL, locked_at = NULL, expires_at = NULL, lock_token = NULL
                    WHERE id = ?5 AND lock_token = ?6 AND status = 'processing'
                    "#,
                )
                .bind(at.map(to_millis))
                .bind(&report.message)
                .bind(&details)
                .bind(now_ms)
                .bind(id.to_string())
                .bind(token.to_string())
                .execute(&self.pool)
                .await
            }
        }
        .map_err(|e| driver_err("Failed to record job failure", e))?;

        Ok(result.rows_affected() == 1)
    }

    async fn record_progress(
        &self,
        id: &JobId,
        token: &LockToken,
        update: ProgressUpdate,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE drudge_jobs SET
                stages = ?1, current_stage = ?2, overall_progress = ?3, updated_at = ?4
            WHERE id = ?5 AND lock_token = ?6 AND status = 'processing'
            "#,
        )
        .bind(serde_json::to_string(&update.stages)?)
        .bind(&update.current_stage)
        .bind(update.overall_progress as f64)
        .bind(to_millis(Utc::now()))
        .bind(id.to_string())
        .bind(token.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| driver_err("Failed to record progress", e))?;
        Ok(result.rows_affected() == 1)
    }

    async fn get_job(&self, id: &JobId) -> Result<Option<Job>> {
        self.fetch_job(id).await
    }

    async fn cancel(&self, id: &JobId) -> Result<CancelOutcome> {
        let result = sqlx::query(
            r#"
            UPDATE drudge_jobs SET
                status = 'failed',
                error_message = 'cancelled',
                error_details = '{"cancelled":true}',
                updated_at = ?1,
                completed_at = ?1
            WHERE id = ?2 AND status = 'pending'
            "#,
        )
        .bind(to_millis(Utc::now()))
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| driver_err("Failed to cancel job", e))?;

        if result.rows_affected() == 1 {
            return Ok(CancelOutcome::Cancelled);
        }

        match self.fetch_job(id).await? {
            None => Ok(CancelOutcome::NotFound),
            Some(job) if job.is_terminal() => Ok(CancelOutcome::AlreadyFinished),
            Some(_) => Ok(CancelOutcome::AlreadyClaimed),
        }
    }

    async fn resurrect(&self, id: &JobId) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE drudge_jobs SET
                status = 'pending',
                attempts = 0,
                next_retry_at = NULL,
                scheduled_for = NULL,
                error_message = NULL,
                error_details = NULL,
                completed_at = NULL,
                updated_at = ?1
            WHERE id = ?2 AND status = 'failed'
            "#,
        )
        .bind(to_millis(Utc::now()))
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| driver_err("Failed to resurrect job", e))?;
        Ok(result.rows_affected() == 1)
    }

    async fn stats(&self, queue: Option<&str>) -> Result<QueueStats> {
        let rows: Vec<(String, i64)> = match queue {
            Some(queue) => {
                sqlx::query_as(
                    "SELECT status, COUNT(*) FROM drudge_jobs WHERE queue = ?1 GROUP BY status",
                )
                .bind(queue)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query_as("SELECT status, COUNT(*) FROM drudge_jobs GROUP BY status")
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(|e| driver_err("Failed to aggregate stats", e))?;

        let mut stats = QueueStats::default();
        for (status, count) in rows {
            let count = count as u64;
            match JobStatus::parse(&status)? {
                JobStatus::Pending => stats.pending = count,
                JobStatus::Processing => stats.processing = count,
                JobStatus::RetryPending => stats.retry_pending = count,
                JobStatus::Completed => stats.completed = count,
                JobStatus::Failed => stats.failed = count,
            }
        }
        Ok(stats)
    }

    async fn next_wakeup(&self, queue: &str) -> Result<Option<DateTime<Utc>>> {
        let now_ms = to_millis(Utc::now());
        let row: (Option<i64>,) = sqlx::query_as(
            r#"
            SELECT MIN(at) FROM (
                SELECT scheduled_for AS at FROM drudge_jobs
                WHERE queue = ?1 AND status = 'pending' AND scheduled_for > ?2
                UNION ALL
                SELECT next_retry_at FROM drudge_jobs
                WHERE queue = ?1 AND status = 'retry_pending' AND next_retry_at > ?2
                UNION ALL
                SELECT expires_at FROM drudge_jobs
                WHERE queue = ?1 AND status = 'processing' AND expires_at > ?2
                      AND attempts < max_attempts
            )
            "#,
        )
        .bind(queue)
        .bind(now_ms)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| driver_err("Failed to compute next wakeup", e))?;

        Ok(row.0.map(from_millis))
    }

    async fn put_schedule(&self, spec: ScheduleSpec) -> Result<()> {
        let now_ms = to_millis(Utc::now());
        sqlx::query(
            r#"
            INSERT INTO drudge_schedules (id, queue, cron, payload, enabled, next_run_at, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
            ON CONFLICT (id) DO UPDATE SET
                queue = excluded.queue,
                cron = excluded.cron,
                payload = excluded.payload,
                enabled = excluded.enabled,
                next_run_at = excluded.next_run_at,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&spec.id)
        .bind(&spec.queue)
        .bind(&spec.cron)
        .bind(serde_json::to_string(&spec.payload)?)
        .bind(spec.enabled)
        .bind(to_millis(spec.next_run_at))
        .bind(now_ms)
        .execute(&self.pool)
        .await
        .map_err(|e| driver_err("Failed to put schedule", e))?;
        Ok(())
    }

    async fn due_schedules(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<ScheduleSpec>> {
        let rows: Vec<(String, String, String, String, i64)> = sqlx::query_as(
            r#"
            SELECT id, queue, cron, payload, next_run_at FROM drudge_schedules
            WHERE enabled = 1 AND next_run_at <= ?1
            ORDER BY next_run_at ASC
            LIMIT ?2
            "#,
        )
        .bind(to_millis(now))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| driver_err("Failed to list due schedules", e))?;

        rows.into_iter()
            .map(|(id, queue, cron, payload, next_run_at)| {
                Ok(ScheduleSpec {
                    id,
                    queue,
                    cron,
                    payload: serde_json::from_str(&payload)?,
                    enabled: true,
                    next_run_at: from_millis(next_run_at),
                })
            })
            .collect()
    }

    async fn advance_schedule(
        &self,
        id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE drudge_schedules SET next_run_at = ?1, updated_at = ?2
            WHERE id = ?3 AND next_run_at = ?4
            "#,
        )
        .bind(to_millis(to))
        .bind(to_millis(Utc::now()))
        .bind(id)
        .bind(to_millis(from))
        .execute(&self.pool)
        .await
        .map_err(|e| driver_err("Failed to advance schedule", e))?;
        Ok(result.rows_affected() == 1)
    }

    async fn remove_schedule(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM drudge_schedules WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| driver_err("Failed to remove schedule", e))?;
        Ok(result.rows_affected() == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drudge_core::EnqueueOptions;
    use serde_json::json;

    #[tokio::test]
    async fn test_capabilities() {
        let driver = SqliteDriver::in_memory().await.unwrap();
        let caps = driver.capabilities();
        assert!(!caps.skip_locked);
        assert!(!caps.notify);
        assert!(caps.persistent_schedules);
        assert!(caps.durable_retry_visibility);
    }

    #[tokio::test]
    async fn test_enqueue_claim_roundtrip() {
        let driver = SqliteDriver::in_memory().await.unwrap();
        let job = NewJob::build("q", json!({"n": 1}), EnqueueOptions::new());
        let id = job.id.clone();
        driver.enqueue(job).await.unwrap();

        let claimed = driver
            .claim("q", "w1", Duration::from_secs(30))
            .await
            .unwrap()
            .expect("job claimed");
        assert_eq!(claimed.job.id, id);
        assert_eq!(claimed.job.status, JobStatus::Processing);
        assert_eq!(claimed.job.attempts, 1);
        assert_eq!(claimed.job.locked_by.as_deref(), Some("w1"));
        assert!(claimed.job.expires_at.is_some());

        // Queue drained.
        assert!(driver
            .claim("q", "w2", Duration::from_secs(30))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_claim_respects_scheduled_for() {
        let driver = SqliteDriver::in_memory().await.unwrap();
        let job = NewJob::build(
            "q",
            json!({}),
            EnqueueOptions::new().delay(Duration::from_secs(3600)),
        );
        driver.enqueue(job).await.unwrap();
        assert!(driver
            .claim("q", "w1", Duration::from_secs(30))
            .await
            .unwrap()
            .is_none());

        let wakeup = driver.next_wakeup("q").await.unwrap().expect("wakeup");
        assert!(wakeup > Utc::now());
    }

    #[tokio::test]
    async fn test_claim_priority_then_age() {
        let driver = SqliteDriver::in_memory().await.unwrap();
        let low = NewJob::build("q", json!({"p": "low"}), EnqueueOptions::new());
        let high = NewJob::build("q", json!({"p": "high"}), EnqueueOptions::new().priority(5));
        let high_id = high.id.clone();
        driver.enqueue(low).await.unwrap();
        driver.enqueue(high).await.unwrap();

        let first = driver
            .claim("q", "w1", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.job.id, high_id);
    }

    #[tokio::test]
    async fn test_stale_token_is_noop() {
        let driver = SqliteDriver::in_memory().await.unwrap();
        let job = NewJob::build("q", json!({}), EnqueueOptions::new());
        let id = job.id.clone();
        driver.enqueue(job).await.unwrap();

        let claimed = driver
            .claim("q", "w1", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        let stale = LockToken::mint();
        assert!(!driver.complete(&id, &stale).await.unwrap());
        assert!(driver.complete(&id, &claimed.token).await.unwrap());

        let job = driver.get_job(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_expired_lock_is_reclaimable() {
        let driver = SqliteDriver::in_memory().await.unwrap();
        let job = NewJob::build("q", json!({}), EnqueueOptions::new());
        let id = job.id.clone();
        driver.enqueue(job).await.unwrap();

        let first = driver
            .claim("q", "w1", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let second = driver
            .claim("q", "w2", Duration::from_secs(30))
            .await
            .unwrap()
            .expect("expired lock reclaimed");
        assert_eq!(second.job.id, id);
        assert_eq!(second.job.attempts, 2);
        assert_eq!(
            second.job.error_message.as_deref(),
            Some(LOCK_EXPIRED_MESSAGE)
        );

        // The first claimant's token is now stale.
        assert!(!driver.complete(&id, &first.token).await.unwrap());
    }

    #[tokio::test]
    async fn test_exhausted_expired_lock_is_buried() {
        let driver = SqliteDriver::in_memory().await.unwrap();
        let job = NewJob::build("q", json!({}), EnqueueOptions::new().max_attempts(1));
        let id = job.id.clone();
        driver.enqueue(job).await.unwrap();

        // Final attempt, then the worker "crashes" and the lock lapses.
        let claimed = driver
            .claim("q", "w1", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(driver
            .claim("q", "w2", Duration::from_secs(30))
            .await
            .unwrap()
            .is_none());

        let job = driver.get_job(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_message.as_deref(), Some(LOCK_EXPIRED_MESSAGE));
        assert!(job.completed_at.is_some());
        assert!(driver.next_wakeup("q").await.unwrap().is_none());

        // The dead claimant's token is gone too.
        assert!(!driver.complete(&id, &claimed.token).await.unwrap());
    }

    #[tokio::test]
    async fn test_cancel_only_while_pending() {
        let driver = SqliteDriver::in_memory().await.unwrap();
        let job = NewJob::build("q", json!({}), EnqueueOptions::new());
        let id = job.id.clone();
        driver.enqueue(job).await.unwrap();

        assert_eq!(driver.cancel(&id).await.unwrap(), CancelOutcome::Cancelled);
        assert_eq!(
            driver.cancel(&id).await.unwrap(),
            CancelOutcome::AlreadyFinished
        );

        let job = driver.get_job(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_message.as_deref(), Some("cancelled"));

        assert_eq!(
            driver.cancel(&JobId::new()).await.unwrap(),
            CancelOutcome::NotFound
        );
    }

    #[tokio::test]
    async fn test_resurrect_failed_job() {
        let driver = SqliteDriver::in_memory().await.unwrap();
        let job = NewJob::build("q", json!({}), EnqueueOptions::new());
        let id = job.id.clone();
        driver.enqueue(job).await.unwrap();
        driver.cancel(&id).await.unwrap();

        assert!(driver.resurrect(&id).await.unwrap());
        let job = driver.get_job(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 0);
        assert!(job.error_message.is_none());

        // Only failed jobs can be resurrected.
        assert!(!driver.resurrect(&id).await.unwrap());
    }

    #[tokio::test]
    async fn test_schedule_advance_is_guarded() {
        let driver = SqliteDriver::in_memory().await.unwrap();
        let spec = ScheduleSpec::new("s1", "q", "0 0 * * * *", json!({"kind": "cleanup"})).unwrap();
        let observed = spec.next_run_at;
        driver.put_schedule(spec).await.unwrap();

        let next = observed + chrono::Duration::hours(1);
        assert!(driver.advance_schedule("s1", observed, next).await.unwrap());
        // Second instance observing the old tick loses.
        assert!(!driver.advance_schedule("s1", observed, next).await.unwrap());
    }

    #[tokio::test]
    async fn test_due_schedules_only_enabled_and_due() {
        let driver = SqliteDriver::in_memory().await.unwrap();
        let mut due = ScheduleSpec::new("due", "q", "0 * * * * *", json!({})).unwrap();
        due.next_run_at = Utc::now() - chrono::Duration::minutes(1);
        let future = ScheduleSpec::new("future", "q", "0 0 0 1 1 *", json!({})).unwrap();
        driver.put_schedule(due).await.unwrap();
        driver.put_schedule(future).await.unwrap();

        let found = driver.due_schedules(Utc::now(), 10).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "due");
    }
}
