//! Driver abstraction for job queue storage.
//!
//! A `Driver` implements the claim, commit, and lookup contract over one
//! storage backend. Differences between backends are exposed through a
//! [`Capabilities`] descriptor chosen at construction time; calling code
//! branches on capability, never on driver identity.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{QueueError, Result};
use crate::job::{Job, JobId, LockToken, NewJob, Stage};

/// What a driver can and cannot do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Concurrent claimants skip rows locked by in-flight claims instead of
    /// blocking (single-statement atomic claim).
    pub skip_locked: bool,
    /// Native publish/subscribe wakeups (e.g. LISTEN/NOTIFY).
    pub notify: bool,
    /// Payloads stored as queryable JSON rather than opaque text.
    pub jsonb: bool,
    /// Recurring schedules survive process restarts.
    pub persistent_schedules: bool,
    /// `retry_pending` is observable as its own status; when false, retries
    /// are collapsed into delayed work and reported under `pending`.
    pub durable_retry_visibility: bool,
}

/// A job handed to exactly one worker, together with its fencing token.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub job: Job,
    pub token: LockToken,
}

/// Per-status job counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: u64,
    pub processing: u64,
    pub retry_pending: u64,
    pub completed: u64,
    pub failed: u64,
}

impl QueueStats {
    /// Total jobs observed across all statuses.
    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.retry_pending + self.completed + self.failed
    }
}

/// Outcome of an idempotent enqueue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// A new job row was created.
    Created(JobId),
    /// The key matched an existing non-terminal job; no row was created.
    Deduplicated(JobId),
}

impl EnqueueOutcome {
    pub fn id(&self) -> &JobId {
        match self {
            Self::Created(id) | Self::Deduplicated(id) => id,
        }
    }
}

/// How a failed handler invocation is committed.
#[derive(Debug, Clone)]
pub enum FailureKind {
    /// Consume the attempt and re-run at `at` (`retry_pending`).
    Retry { at: DateTime<Utc> },
    /// Terminal failure.
    Discard,
    /// Give the attempt back and re-queue as `pending`, optionally delayed
    /// (rate-limit path).
    Requeue { at: Option<DateTime<Utc>> },
}

/// Failure details persisted for inspection.
#[derive(Debug, Clone)]
pub struct FailureReport {
    pub kind: FailureKind,
    pub message: String,
    pub details: Option<Value>,
}

/// Outcome of a cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The pending job was cancelled (now `failed` with a cancel marker).
    Cancelled,
    /// The job was already claimed; cancellation is pre-claim only.
    AlreadyClaimed,
    /// The job already reached a terminal status.
    AlreadyFinished,
    NotFound,
}

/// Stage/progress snapshot written through the driver.
#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    pub stages: Vec<Stage>,
    pub current_stage: Option<String>,
    pub overall_progress: f32,
}

/// A recurring-job template evaluated by the Scheduler.
#[derive(Debug, Clone)]
pub struct ScheduleSpec {
    pub id: String,
    pub queue: String,
    pub cron: String,
    pub payload: Value,
    pub enabled: bool,
    pub next_run_at: DateTime<Utc>,
}

impl ScheduleSpec {
    /// Build a schedule, validating the cron expression and computing the
    /// first occurrence.
    pub fn new(
        id: impl Into<String>,
        queue: impl Into<String>,
        cron: impl Into<String>,
        payload: Value,
    ) -> Result<Self> {
        let cron = cron.into();
        let next_run_at = crate::backoff::next_cron_after(&cron, Utc::now())?
            .ok_or_else(|| QueueError::InvalidCron(cron.clone(), "no future occurrence".into()))?;
        Ok(Self {
            id: id.into(),
            queue: queue.into(),
            cron,
            payload,
            enabled: true,
            next_run_at,
        })
    }
}

/// Storage contract shared by all backends.
///
/// Mutating writes after a claim (`extend_lock`, `complete`, `fail`,
/// `record_progress`) are fenced: they return `Ok(false)` without touching
/// the job when the presented token is stale.
#[async_trait]
pub trait Driver: Send + Sync {
    fn capabilities(&self) -> Capabilities;

    // ========== Producer side ==========

    /// Insert a pending job. When `job.key` collides with an existing
    /// non-terminal job in the same queue, no row is created and the
    /// existing id is returned.
    async fn enqueue(&self, job: NewJob) -> Result<EnqueueOutcome>;

    // ========== Claim protocol ==========

    /// Atomically take ownership of the best eligible job.
    ///
    /// Eligible: `pending` whose `scheduled_for` has passed, `retry_pending`
    /// whose `next_retry_at` has passed, or `processing` whose lock expired
    /// with attempts remaining. Ordering: expired `processing` first, then
    /// `priority DESC`, then `created_at ASC`. The claim transitions the job
    /// to `processing`, stamps the worker and lock deadline, mints a fresh
    /// token, and increments `attempts`, all in one atomic step.
    async fn claim(
        &self,
        queue: &str,
        worker_id: &str,
        lock_duration: Duration,
    ) -> Result<Option<ClaimedJob>>;

    /// Push the lock deadline to `until`. Returns false if the lock was lost.
    async fn extend_lock(&self, id: &JobId, token: &LockToken, until: DateTime<Utc>)
        -> Result<bool>;

    /// Commit success. Returns false if the token is stale.
    async fn complete(&self, id: &JobId, token: &LockToken) -> Result<bool>;

    /// Commit a classified failure. Returns false if the token is stale.
    async fn fail(&self, id: &JobId, token: &LockToken, report: FailureReport) -> Result<bool>;

    /// Persist a stage/progress snapshot. Returns false if the token is stale.
    async fn record_progress(
        &self,
        id: &JobId,
        token: &LockToken,
        update: ProgressUpdate,
    ) -> Result<bool>;

    // ========== Lookup / management ==========

    async fn get_job(&self, id: &JobId) -> Result<Option<Job>>;

    /// Cancel a job. Permitted only while `pending`.
    async fn cancel(&self, id: &JobId) -> Result<CancelOutcome>;

    /// Flip a terminal `failed` job back to `pending` with attempts reset.
    /// Returns false if the job is missing or not `failed`.
    async fn resurrect(&self, id: &JobId) -> Result<bool>;

    /// Per-status counts, across all queues when `queue` is `None`.
    async fn stats(&self, queue: Option<&str>) -> Result<QueueStats>;

    /// Earliest future instant at which a currently ineligible job in this
    /// queue becomes eligible, if any.
    async fn next_wakeup(&self, queue: &str) -> Result<Option<DateTime<Utc>>>;

    // ========== Recurring schedules ==========

    /// Create or replace a recurring schedule.
    async fn put_schedule(&self, _spec: ScheduleSpec) -> Result<()> {
        Err(QueueError::Unsupported("persistent schedules"))
    }

    /// Enabled schedules whose `next_run_at` has passed.
    async fn due_schedules(&self, _now: DateTime<Utc>, _limit: usize) -> Result<Vec<ScheduleSpec>> {
        Err(QueueError::Unsupported("persistent schedules"))
    }

    /// Advance `next_run_at` from the observed value to the next occurrence.
    /// Returns false when another scheduler instance already advanced it, in
    /// which case the caller must not enqueue for this tick.
    async fn advance_schedule(
        &self,
        _id: &str,
        _from: DateTime<Utc>,
        _to: DateTime<Utc>,
    ) -> Result<bool> {
        Err(QueueError::Unsupported("persistent schedules"))
    }

    async fn remove_schedule(&self, _id: &str) -> Result<bool> {
        Err(QueueError::Unsupported("persistent schedules"))
    }
}

/// A type-erased driver shared across workers and clients.
pub type DynDriver = Arc<dyn Driver>;
