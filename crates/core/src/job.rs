//! Job definition and related types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{QueueError, Result};

/// Unique identifier for a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Generate a new random JobId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a JobId from its string form.
    pub fn parse(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| QueueError::JobNotFound(format!("{} ({})", s, e)))
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Single-use fencing token minted at claim time.
///
/// Every completion, failure, progress, or lock-extension write must present
/// the token the job was claimed with; writes with a stale token are no-ops.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockToken(pub Uuid);

impl LockToken {
    /// Mint a fresh token.
    pub fn mint() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for LockToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Eligible for claiming (immediately or once `scheduled_for` passes).
    Pending,
    /// Claimed by a worker holding a live lock.
    Processing,
    /// Failed with attempts remaining; eligible again at `next_retry_at`.
    RetryPending,
    /// Finished successfully. Terminal.
    Completed,
    /// Exhausted retries, failed permanently, or cancelled. Terminal.
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::RetryPending => "retry_pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "retry_pending" => Ok(Self::RetryPending),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(QueueError::Driver(format!("unknown job status '{}'", other))),
        }
    }

    /// Terminal statuses never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backoff policy applied before a retried job becomes eligible again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    /// Constant delay.
    Fixed,
    /// Delay grows by a constant increment per attempt.
    Linear,
    /// Delay doubles per attempt.
    Exponential,
}

impl BackoffKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fixed => "fixed",
            Self::Linear => "linear",
            Self::Exponential => "exponential",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "fixed" => Ok(Self::Fixed),
            "linear" => Ok(Self::Linear),
            "exponential" => Ok(Self::Exponential),
            other => Err(QueueError::Driver(format!(
                "unknown backoff kind '{}'",
                other
            ))),
        }
    }
}

/// Status of one named sub-phase of a job's execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// A named sub-phase of a job, independently tracked for progress reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    pub name: String,
    pub status: StageStatus,
    /// 0.0 to 100.0.
    pub progress: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifacts: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Stage {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: StageStatus::Pending,
            progress: 0.0,
            artifacts: None,
            error: None,
            started_at: None,
            completed_at: None,
        }
    }
}

/// A job with its payload and full tracking state.
///
/// The payload is an opaque JSON value; the queue core never inspects its
/// shape. Use [`Job::decode`] to deserialize it at the handler boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub queue: String,
    /// Optional idempotency key, unique per queue among non-terminal jobs.
    pub key: Option<String>,
    pub data: Value,
    pub status: JobStatus,
    /// Higher priority is claimed first.
    pub priority: i32,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub backoff_ms: u64,
    pub backoff_kind: BackoffKind,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    /// Lock deadline; a `processing` row past this instant is reclaimable.
    pub expires_at: Option<DateTime<Utc>>,
    pub lock_token: Option<LockToken>,
    pub error_message: Option<String>,
    pub error_details: Option<Value>,
    pub stages: Vec<Stage>,
    pub current_stage: Option<String>,
    /// 0.0 to 100.0 across all stages.
    pub overall_progress: f32,
    pub metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Deserialize the opaque payload into a caller-supplied shape.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.data.clone())?)
    }

    /// Whether another retry attempt is allowed.
    pub fn can_retry(&self) -> bool {
        self.attempts < self.max_attempts
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Base backoff delay configured for this job.
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

/// Options accepted by `Client::enqueue`.
#[derive(Debug, Clone)]
pub struct EnqueueOptions {
    pub key: Option<String>,
    pub priority: i32,
    pub delay: Option<Duration>,
    pub run_at: Option<DateTime<Utc>>,
    pub max_attempts: u32,
    pub backoff: Duration,
    pub backoff_kind: BackoffKind,
    pub metadata: Option<Value>,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            key: None,
            priority: 0,
            delay: None,
            run_at: None,
            max_attempts: 3,
            backoff: Duration::from_secs(10),
            backoff_kind: BackoffKind::Exponential,
            metadata: None,
        }
    }
}

impl EnqueueOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the idempotency key.
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Set the claim priority (higher first).
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Delay eligibility by a duration from enqueue time.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Delay eligibility until a specific instant.
    pub fn run_at(mut self, at: DateTime<Utc>) -> Self {
        self.run_at = Some(at);
        self
    }

    pub fn max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = max;
        self
    }

    /// Set the backoff base delay and policy.
    pub fn backoff(mut self, base: Duration, kind: BackoffKind) -> Self {
        self.backoff = base;
        self.backoff_kind = kind;
        self
    }

    pub fn metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// A fully specified job ready for insertion, minted by the Client so all
/// drivers share id and timestamp semantics.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub id: JobId,
    pub queue: String,
    pub key: Option<String>,
    pub data: Value,
    pub priority: i32,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub max_attempts: u32,
    pub backoff_ms: u64,
    pub backoff_kind: BackoffKind,
    pub metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
}

impl NewJob {
    /// Build a NewJob from enqueue inputs.
    pub fn build(queue: impl Into<String>, data: Value, options: EnqueueOptions) -> Self {
        let now = Utc::now();
        let scheduled_for = options
            .run_at
            .or_else(|| options.delay.map(|d| now + chrono::Duration::from_std(d).unwrap_or_default()));

        Self {
            id: JobId::new(),
            queue: queue.into(),
            key: options.key,
            data,
            priority: options.priority,
            scheduled_for,
            max_attempts: options.max_attempts,
            backoff_ms: options.backoff.as_millis() as u64,
            backoff_kind: options.backoff_kind,
            metadata: options.metadata,
            created_at: now,
        }
    }

    /// Materialize the pending job row this NewJob describes.
    pub fn into_job(self) -> Job {
        Job {
            id: self.id,
            queue: self.queue,
            key: self.key,
            data: self.data,
            status: JobStatus::Pending,
            priority: self.priority,
            scheduled_for: self.scheduled_for,
            attempts: 0,
            max_attempts: self.max_attempts,
            next_retry_at: None,
            backoff_ms: self.backoff_ms,
            backoff_kind: self.backoff_kind,
            locked_by: None,
            locked_at: None,
            expires_at: None,
            lock_token: None,
            error_message: None,
            error_details: None,
            stages: Vec::new(),
            current_stage: None,
            overall_progress: 0.0,
            metadata: self.metadata,
            created_at: self.created_at,
            updated_at: self.created_at,
            completed_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_id_uniqueness() {
        assert_ne!(JobId::new(), JobId::new());
    }

    #[test]
    fn test_job_id_parse_roundtrip() {
        let id = JobId::new();
        let parsed = JobId::parse(&id.to_string()).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_job_id_parse_invalid() {
        assert!(JobId::parse("not-a-uuid").is_err());
    }

    #[test]
    fn test_lock_token_single_use_shape() {
        assert_ne!(LockToken::mint(), LockToken::mint());
    }

    #[test]
    fn test_status_roundtrip() {
        for status in [
            JobStatus::Pending,
            JobStatus::Processing,
            JobStatus::RetryPending,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()).unwrap(), status);
        }
    }

    #[test]
    fn test_status_terminal() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::RetryPending.is_terminal());
    }

    #[test]
    fn test_backoff_kind_roundtrip() {
        for kind in [BackoffKind::Fixed, BackoffKind::Linear, BackoffKind::Exponential] {
            assert_eq!(BackoffKind::parse(kind.as_str()).unwrap(), kind);
        }
    }

    #[test]
    fn test_new_job_defaults() {
        let job = NewJob::build("emails", serde_json::json!({"to": "a@b.c"}), EnqueueOptions::new())
            .into_job();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.max_attempts, 3);
        assert!(job.scheduled_for.is_none());
        assert!(job.lock_token.is_none());
    }

    #[test]
    fn test_new_job_delay_sets_scheduled_for() {
        let before = Utc::now();
        let job = NewJob::build(
            "emails",
            Value::Null,
            EnqueueOptions::new().delay(Duration::from_secs(3600)),
        );
        let at = job.scheduled_for.expect("scheduled_for set");
        assert!(at >= before + chrono::Duration::seconds(3599));
        assert!(at <= Utc::now() + chrono::Duration::seconds(3601));
    }

    #[test]
    fn test_job_decode() {
        #[derive(serde::Deserialize)]
        struct Payload {
            url: String,
        }
        let job = NewJob::build(
            "bookmarks",
            serde_json::json!({"url": "https://example.com"}),
            EnqueueOptions::new(),
        )
        .into_job();
        let payload: Payload = job.decode().unwrap();
        assert_eq!(payload.url, "https://example.com");
    }

    #[test]
    fn test_job_can_retry() {
        let mut job = NewJob::build("q", Value::Null, EnqueueOptions::new().max_attempts(2)).into_job();
        assert!(job.can_retry());
        job.attempts = 2;
        assert!(!job.can_retry());
    }

    #[test]
    fn test_job_serialization_roundtrip() {
        let job = NewJob::build("q", serde_json::json!({"n": 1}), EnqueueOptions::new()).into_job();
        let json = serde_json::to_string(&job).unwrap();
        let back: Job = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, job.id);
        assert_eq!(back.status, JobStatus::Pending);
    }
}
