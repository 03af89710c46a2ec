//! PostgreSQL driver for the drudge job queue.
//!
//! The reference multi-writer backend: claims are a single
//! `UPDATE ... WHERE id = (SELECT ... FOR UPDATE SKIP LOCKED) RETURNING`
//! statement, so any number of worker processes can poll the same queue
//! without handing out a job twice and without blocking each other.
//! Payloads and progress state live in JSONB, and enqueues fan out over
//! LISTEN/NOTIFY so idle workers wake without waiting out their poll
//! interval.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use drudge_postgres::{PgDriver, PgWakeupListener};
//! use drudge_core::Client;
//!
//! #[tokio::main]
//! async fn main() -> drudge_core::Result<()> {
//!     let driver = PgDriver::new("postgres://localhost/drudge").await?;
//!     let client = Client::new(driver);
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgListener, PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use drudge_core::{
    BackoffKind, CancelOutcome, Capabilities, ClaimedJob, Driver, EnqueueOutcome, FailureKind,
    FailureReport, InProcessWakeup, Job, JobId, JobStatus, LockToken, NewJob, ProgressUpdate,
    QueueError, QueueStats, Result, ScheduleSpec, Stage, Wakeup, WakeupListener,
};

/// NOTIFY channel carrying queue names as payload.
const NOTIFY_CHANNEL: &str = "drudge_wakeup";

/// Message surfaced to the next claimant of an expired lock.
const LOCK_EXPIRED_MESSAGE: &str = "job lock expired before completion";

/// PostgreSQL driver for job queue storage.
#[derive(Clone)]
pub struct PgDriver {
    pool: PgPool,
}

impl PgDriver {
    /// Connect and ensure the schema exists.
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| QueueError::Connection(format!("Failed to connect to Postgres: {}", e)))?;

        let driver = Self { pool };
        driver.init_tables().await?;
        Ok(driver)
    }

    /// Wrap an existing pool (schema must already exist or be created via
    /// [`PgDriver::init_tables`]).
    pub fn with_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn init_tables(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS drudge_jobs (
                id UUID PRIMARY KEY,
                queue TEXT NOT NULL,
                key TEXT,
                data JSONB NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                priority INTEGER NOT NULL DEFAULT 0,
                scheduled_for TIMESTAMPTZ,
                attempts INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL DEFAULT 3,
                next_retry_at TIMESTAMPTZ,
                backoff_ms BIGINT NOT NULL DEFAULT 10000,
                backoff_kind TEXT NOT NULL DEFAULT 'exponential',
                locked_by TEXT,
                locked_at TIMESTAMPTZ,
                expires_at TIMESTAMPTZ,
                lock_token UUID,
                error_message TEXT,
                error_details JSONB,
                stages JSONB NOT NULL DEFAULT '[]'::jsonb,
                current_stage TEXT,
                overall_progress REAL NOT NULL DEFAULT 0,
                metadata JSONB,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL,
                completed_at TIMESTAMPTZ
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
            r#"
            CREATE INDEX IF NOT EXISTS idx_drudge_jobs_claim
            ON drudge_jobs (queue, status, priority DESC, created_at ASC)
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| QueueError::Driver(format!("Failed to create claim index: {}", e)))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS drudge_schedules (
                id TEXT PRIMARY KEY,
                queue TEXT NOT NULL,
                cron TEXT NOT NULL,
                payload JSONB NOT NULL,
                enabled BOOLEAN NOT NULL DEFAULT TRUE,
                next_run_at TIMESTAMPTZ NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| QueueError::Driver(format!("Failed to create schedules table: {}", e)))?;

        Ok(())
    }
}

fn driver_err(context: &str, e: sqlx::Error) -> QueueError {
    QueueError::Driver(format!("{}: {}", context, e))
}

fn row_to_job(row: &PgRow) -> Result<Job> {
    let get = |e: sqlx::Error| QueueError::Driver(format!("Bad job row: {}", e));

    let status: String = row.try_get("status").map_err(get)?;
    let backoff_kind: String = row.try_get("backoff_kind").map_err(get)?;
    let stages: serde_json::Value = row.try_get("stages").map_err(get)?;

    Ok(Job {
        id: JobId(row.try_get::<Uuid, _>("id").map_err(get)?),
        queue: row.try_get("queue").map_err(get)?,
        key: row.try_get("key").map_err(get)?,
        data: row.try_get("data").map_err(get)?,
        status: JobStatus::parse(&status)?,
        priority: row.try_get("priority").map_err(get)?,
        scheduled_for: row.try_get("scheduled_for").map_err(get)?,
        attempts: row.try_get::<i32, _>("attempts").map_err(get)? as u32,
        max_attempts: row.try_get::<i32, _>("max_attempts").map_err(get)? as u32,
        next_retry_at: row.try_get("next_retry_at").map_err(get)?,
        backoff_ms: row.try_get::<i64, _>("backoff_ms").map_err(get)? as u64,
        backoff_kind: BackoffKind::parse(&backoff_kind)?,
        locked_by: row.try_get("locked_by").map_err(get)?,
        locked_at: row.try_get("locked_at").map_err(get)?,
        expires_at: row.try_get("expires_at").map_err(get)?,
        lock_token: row
            .try_get::<Option<Uuid>, _>("lock_token")
            .map_err(get)?
            .map(LockToken),
        error_message: row.try_get("error_message").map_err(get)?,
        error_details: row.try_get("error_details").map_err(get)?,
        stages: serde_json::from_value::<Vec<Stage>>(stages)?,
        current_stage: row.try_get("current_stage").map_err(get)?,
        overall_progress: row.try_get::<f32, _>("overall_progress").map_err(get)?,
        metadata: row.try_get("metadata").map_err(get)?,
        created_at: row.try_get("created_at").map_err(get)?,
        updated_at: row.try_get("updated_at").map_err(get)?,
        completed_at: row.try_get("completed_at").map_err(get)?,
    })
}

#[async_trait]
impl Driver for PgDriver {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            skip_locked: true,
            notify: true,
            jsonb: true,
            persistent_schedules: true,
            durable_retry_visibility: true,
        }
    }

    async fn enqueue(&self, job: NewJob) -> Result<EnqueueOutcome> {
        let id = job.id.clone();
        let result = sqlx::query(
            r#"
            INSERT INTO drudge_jobs
                (id, queue, key, data, status, priority, scheduled_for,
                 attempts, max_attempts, backoff_ms, backoff_kind,
                 stages, overall_progress, metadata, created_at, updated_at)
            VALUES ($1, $2, $3, $4, 'pending', $5, $6, 0, $7, $8, $9,
                    '[]'::jsonb, 0, $10, $11, $11)
            ON CONFLICT (queue, key)
                WHERE key IS NOT NULL AND status IN ('pending', 'processing', 'retry_pending')
                DO NOTHING
            "#,
        )
        .bind(id.0)
        .bind(&job.queue)
        .bind(&job.key)
        .bind(&job.data)
        .bind(job.priority)
        .bind(job.scheduled_for)
        .bind(job.max_attempts as i32)
        .bind(job.backoff_ms as i64)
        .bind(job.backoff_kind.as_str())
        .bind(&job.metadata)
        .bind(job.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| driver_err("Failed to enqueue job", e))?;

        if result.rows_affected() == 1 {
            // Wake one idle worker in any connected process.
            sqlx::query("SELECT pg_notify($1, $2)")
                .bind(NOTIFY_CHANNEL)
                .bind(&job.queue)
                .execute(&self.pool)
                .await
                .map_err(|e| driver_err("Failed to notify", e))?;
            return Ok(EnqueueOutcome::Created(id));
        }

        let (existing,): (Uuid,) = sqlx::query_as(
            r#"
            SELECT id FROM drudge_jobs
            WHERE queue = $1 AND key = $2
              AND status IN ('pending', 'processing', 'retry_pending')
            "#,
        )
        .bind(&job.queue)
        .bind(&job.key)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| driver_err("Failed to resolve key collision", e))?;
        Ok(EnqueueOutcome::Deduplicated(JobId(existing)))
    }

    async fn claim(
        &self,
        queue: &str,
        worker_id: &str,
        lock_duration: Duration,
    ) -> Result<Option<ClaimedJob>> {
        let token = LockToken::mint();
        let expires_at =
            Utc::now() + chrono::Duration::from_std(lock_duration).unwrap_or_default();

        // Expired locks with no attempts left cannot be re-handed out; bury
        // them here so they reach a terminal status instead of sitting in
        // `processing` forever.
        sqlx::query(
            r#"
            UPDATE drudge_jobs SET
                status = 'failed',
                error_message = $2,
                completed_at = NOW(),
                updated_at = NOW(),
                locked_by = NULL, locked_at = NULL, expires_at = NULL, lock_token = NULL
            WHERE queue = $1 AND status = 'processing' AND expires_at < NOW()
                  AND attempts >= max_attempts
            "#,
        )
        .bind(queue)
        .bind(LOCK_EXPIRED_MESSAGE)
        .execute(&self.pool)
        .await
        .map_err(|e| driver_err("Failed to bury expired jobs", e))?;

        // One atomic statement: eligibility, ordering, lock stamping, and
        // attempt increment. SKIP LOCKED makes concurrent claimants pass
        // over rows another transaction is claiming right now.
        let row = sqlx::query(
            r#"
            UPDATE drudge_jobs SET
                status = 'processing',
                locked_by = $2,
                locked_at = NOW(),
                expires_at = $3,
                lock_token = $4,
                attempts = drudge_jobs.attempts + 1,
                updated_at = NOW(),
                error_message = CASE WHEN drudge_jobs.status = 'processing'
                                     THEN $5 ELSE drudge_jobs.error_message END
            WHERE id = (
                SELECT id FROM drudge_jobs
                WHERE queue = $1 AND (
                    (status = 'pending' AND (scheduled_for IS NULL OR scheduled_for <= NOW()))
                    OR (status = 'retry_pending' AND (next_retry_at IS NULL OR next_retry_at <= NOW()))
                    OR (status = 'processing' AND expires_at < NOW() AND attempts < max_attempts)
                )
                ORDER BY (status = 'processing') DESC, priority DESC, created_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#,
        )
        .bind(queue)
        .bind(worker_id)
        .bind(expires_at)
        .bind(token.0)
        .bind(LOCK_EXPIRED_MESSAGE)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| driver_err("Failed to claim job", e))?;

        match row {
            Some(row) => Ok(Some(ClaimedJob {
                job: row_to_job(&row)?,
                token,
            })),
            None => Ok(None),
        }
    }

    async fn extend_lock(
        &self,
        id: &JobId,
        token: &LockToken,
        until: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE drudge_jobs SET expires_at = $1, updated_at = NOW()
            WHERE id = $2 AND lock_token = $3 AND status = 'processing'
            "#,
        )
        .bind(until)
        .bind(id.0)
        .bind(token.0)
        .execute(&self.pool)
        .await
        .map_err(|e| driver_err("Failed to extend lock", e))?;
        Ok(result.rows_affected() == 1)
    }

    async fn complete(&self, id: &JobId, token: &LockToken) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE drudge_jobs SET
                status = 'completed',
                completed_at = NOW(),
                updated_at = NOW(),
                overall_progress = 100,
                locked_by = NULL, locked_at = NULL, expires_at = NULL, lock_token = NULL
            WHERE id = $1 AND lock_token = $2 AND status = 'processing'
            "#,
        )
        .bind(id.0)
        .bind(token.0)
        .execute(&self.pool)
        .await
        .map_err(|e| driver_err("Failed to complete job", e))?;
        Ok(result.rows_affected() == 1)
    }

    async fn fail(&self, id: &JobId, token: &LockToken, report: FailureReport) -> Result<bool> {
        let result = match report.kind {
            FailureKind::Retry { at } => {
                sqlx::query(
                    r#"
                    UPDATE drudge_jobs SET
                        status = 'retry_pending',
                        next_retry_at = $1,
                        error_message = $2,
                        error_details = $3,
                        updated_at = NOW(),
                        locked_by = NULL, locked_at = NULL, expires_at = NULL, lock_token = NULL
                    WHERE id = $4 AND lock_token = $5 AND status = 'processing'
                    "#,
                )
                .bind(at)
                .bind(&report.message)
                .bind(&report.details)
                .bind(id.0)
                .bind(token.0)
                .execute(&self.pool)
                .await
            }
            FailureKind::Discard => {
                sqlx::query(
                    r#"
                    UPDATE drudge_jobs SET
                        status = 'failed',
                        error_message = $1,
                        error_details = $2,
                        updated_at = NOW(),
                        completed_at = NOW(),
                        locked_by = NULL, locked_at = NULL, expires_at = NULL, lock_token = NULL
                    WHERE id = $3 AND lock_token = $4 AND status = 'processing'
                    "#,
                )
                .bind(&report.message)
                .bind(&report.details)
                .bind(id.0)
                .bind(token.0)
                .execute(&self.pool)
                .await
            }
            // Rate-limit path: the attempt is given back.
            FailureKind::Requeue { at } => {
                sqlx::query(
                    r#"
                    UPDATE drudge_jobs SET
                        status = 'pending',
                        scheduled_for = $1,
                        attempts = GREATEST(attempts - 1, 0),
                        error_message = $2,
                        error_details = $3,
                        updated_at = NOW(),
                        locked_by = NULL, locked_at = NULL, expires_at = NULL, lock_token = NULL
                    WHERE id = $4 AND lock_token = $5 AND status = 'processing'
                    "#,
                )
                .bind(at)
                .bind(&report.message)
                .bind(&report.details)
                .bind(id.0)
                .bind(token.0)
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
                stages = $1, current_stage = $2, overall_progress = $3, updated_at = NOW()
            WHERE id = $4 AND lock_token = $5 AND status = 'processing'
            "#,
        )
        .bind(serde_json::to_value(&update.stages)?)
        .bind(&update.current_stage)
        .bind(update.overall_progress)
        .bind(id.0)
        .bind(token.0)
        .execute(&self.pool)
        .await
        .map_err(|e| driver_err("Failed to record progress", e))?;
        Ok(result.rows_affected() == 1)
    }

    async fn get_job(&self, id: &JobId) -> Result<Option<Job>> {
        let row = sqlx::query("SELECT * FROM drudge_jobs WHERE id = $1")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| driver_err("Failed to fetch job", e))?;
        row.map(|r| row_to_job(&r)).transpose()
    }

    async fn cancel(&self, id: &JobId) -> Result<CancelOutcome> {
        let result = sqlx::query(
            r#"
            UPDATE drudge_jobs SET
                status = 'failed',
                error_message = 'cancelled',
                error_details = '{"cancelled":true}'::jsonb,
                updated_at = NOW(),
                completed_at = NOW()
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id.0)
        .execute(&self.pool)
        .await
        .map_err(|e| driver_err("Failed to cancel job", e))?;

        if result.rows_affected() == 1 {
            return Ok(CancelOutcome::Cancelled);
        }

        match self.get_job(id).await? {
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
                updated_at = NOW()
            WHERE id = $1 AND status = 'failed'
            "#,
        )
        .bind(id.0)
        .execute(&self.pool)
        .await
        .map_err(|e| driver_err("Failed to resurrect job", e))?;
        Ok(result.rows_affected() == 1)
    }

    async fn stats(&self, queue: Option<&str>) -> Result<QueueStats> {
        let rows: Vec<(String, i64)> = match queue {
            Some(queue) => {
                sqlx::query_as(
                    "SELECT status, COUNT(*) FROM drudge_jobs WHERE queue = $1 GROUP BY status",
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
        let row: (Option<DateTime<Utc>>,) = sqlx::query_as(
            r#"
            SELECT MIN(at) FROM (
                SELECT scheduled_for AS at FROM drudge_jobs
                WHERE queue = $1 AND status = 'pending' AND scheduled_for > NOW()
                UNION ALL
                SELECT next_retry_at FROM drudge_jobs
                WHERE queue = $1 AND status = 'retry_pending' AND next_retry_at > NOW()
                UNION ALL
                SELECT expires_at FROM drudge_jobs
                WHERE queue = $1 AND status = 'processing' AND expires_at > NOW()
                      AND attempts < max_attempts
            ) eligible
            "#,
        )
        .bind(queue)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| driver_err("Failed to compute next wakeup", e))?;
        Ok(row.0)
    }

    async fn put_schedule(&self, spec: ScheduleSpec) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO drudge_schedules (id, queue, cron, payload, enabled, next_run_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, NOW(), NOW())
            ON CONFLICT (id) DO UPDATE SET
                queue = EXCLUDED.queue,
                cron = EXCLUDED.cron,
                payload = EXCLUDED.payload,
                enabled = EXCLUDED.enabled,
                next_run_at = EXCLUDED.next_run_at,
                updated_at = NOW()
            "#,
        )
        .bind(&spec.id)
        .bind(&spec.queue)
        .bind(&spec.cron)
        .bind(&spec.payload)
        .bind(spec.enabled)
        .bind(spec.next_run_at)
        .execute(&self.pool)
        .await
        .map_err(|e| driver_err("Failed to put schedule", e))?;
        Ok(())
    }

    async fn due_schedules(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<ScheduleSpec>> {
        let rows: Vec<(String, String, String, serde_json::Value, DateTime<Utc>)> = sqlx::query_as(
            r#"
            SELECT id, queue, cron, payload, next_run_at FROM drudge_schedules
            WHERE enabled AND next_run_at <= $1
            ORDER BY next_run_at ASC
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| driver_err("Failed to list due schedules", e))?;

        Ok(rows
            .into_iter()
            .map(|(id, queue, cron, payload, next_run_at)| ScheduleSpec {
                id,
                queue,
                cron,
                payload,
                enabled: true,
                next_run_at,
            })
            .collect())
    }

    async fn advance_schedule(
        &self,
        id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE drudge_schedules SET next_run_at = $1, updated_at = NOW()
            WHERE id = $2 AND next_run_at = $3
            "#,
        )
        .bind(to)
        .bind(id)
        .bind(from)
        .execute(&self.pool)
        .await
        .map_err(|e| driver_err("Failed to advance schedule", e))?;
        Ok(result.rows_affected() == 1)
    }

    async fn remove_schedule(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM drudge_schedules WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| driver_err("Failed to remove schedule", e))?;
        Ok(result.rows_affected() == 1)
    }
}

/// LISTEN/NOTIFY wakeup listener.
///
/// Holds a dedicated listening connection and fans incoming notifications
/// out to per-queue in-process channels, so any number of workers in this
/// process can share one database connection.
pub struct PgWakeupListener {
    wakeup: Arc<InProcessWakeup>,
    handle: tokio::task::JoinHandle<()>,
}

impl PgWakeupListener {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let mut listener = PgListener::connect(database_url)
            .await
            .map_err(|e| QueueError::Connection(format!("Failed to open LISTEN connection: {}", e)))?;
        listener
            .listen(NOTIFY_CHANNEL)
            .await
            .map_err(|e| QueueError::Connection(format!("Failed to LISTEN: {}", e)))?;

        let wakeup = Arc::new(InProcessWakeup::new());
        let fanout = wakeup.clone();
        let handle = tokio::spawn(async move {
            loop {
                match listener.recv().await {
                    Ok(notification) => {
                        use drudge_core::WakeupEmitter;
                        fanout.notify(notification.payload());
                    }
                    Err(e) => {
                        // PgListener reconnects internally; back off before
                        // the next recv so a dead server does not spin us.
                        tracing::warn!(error = %e, "NOTIFY stream interrupted");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        Ok(Self { wakeup, handle })
    }
}

#[async_trait]
impl WakeupListener for PgWakeupListener {
    async fn wait(&self, queue: &str, timeout: Duration) -> Wakeup {
        self.wakeup.wait(queue, timeout).await
    }
}

impl Drop for PgWakeupListener {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
