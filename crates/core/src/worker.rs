//! Worker loop: claim, execute, classify, commit.

use chrono::Utc;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::backoff::backoff_delay;
use crate::config::WorkerConfig;
use crate::context::{JobContext, StageCallback};
use crate::driver::{ClaimedJob, DynDriver, FailureKind, FailureReport};
use crate::error::JobError;
use crate::heartbeat::HeartbeatGuard;
use crate::job::Job;
use crate::notify::WakeupListener;

/// Result type for job handlers.
pub type JobResult = std::result::Result<(), JobError>;

/// A single worker running its own independent poll-or-wait loop.
///
/// Mutual exclusion between workers is entirely a property of the claim
/// protocol against the shared store; workers never coordinate directly and
/// never cache job state across poll cycles.
pub struct Worker<F, Fut>
where
    F: Fn(JobContext) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = JobResult> + Send + 'static,
{
    driver: DynDriver,
    config: WorkerConfig,
    handler: F,
    listener: Option<Arc<dyn WakeupListener>>,
    callback: Option<StageCallback>,
    running: Arc<AtomicBool>,
    stop_notify: Arc<Notify>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl<F, Fut> Worker<F, Fut>
where
    F: Fn(JobContext) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = JobResult> + Send + 'static,
{
    pub fn new(driver: DynDriver, config: WorkerConfig, handler: F) -> Self {
        Self {
            driver,
            config,
            handler,
            listener: None,
            callback: None,
            running: Arc::new(AtomicBool::new(false)),
            stop_notify: Arc::new(Notify::new()),
            handle: Mutex::new(None),
        }
    }

    /// Block on this listener while idle instead of sleeping out the poll
    /// interval; the worker still polls at `poll_interval` as a fallback.
    pub fn listener(mut self, listener: Arc<dyn WakeupListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Invoke this callback on every stage start/progress/completion/failure.
    pub fn on_stage_event(mut self, callback: StageCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Spawn the poll-or-wait loop. Idempotent while running.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let driver = self.driver.clone();
        let config = self.config.clone();
        let handler = self.handler.clone();
        let listener = self.listener.clone();
        let callback = self.callback.clone();
        let running = self.running.clone();
        let stop_notify = self.stop_notify.clone();

        let handle = tokio::spawn(async move {
            run_loop(driver, config, handler, listener, callback, running, stop_notify).await;
        });
        *self.handle.lock().expect("worker handle poisoned") = Some(handle);
    }

    /// Cooperative stop: exit after the current claim cycle, awaiting any
    /// in-flight handler up to `shutdown_timeout`.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.stop_notify.notify_waiters();

        let handle = self.handle.lock().expect("worker handle poisoned").take();
        if let Some(handle) = handle {
            let abort = handle.abort_handle();
            if tokio::time::timeout(self.config.shutdown_timeout, handle)
                .await
                .is_err()
            {
                tracing::warn!(
                    worker_id = %self.config.worker_id,
                    "Shutdown timeout reached, aborting worker loop"
                );
                abort.abort();
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_loop<F, Fut>(
    driver: DynDriver,
    config: WorkerConfig,
    handler: F,
    listener: Option<Arc<dyn WakeupListener>>,
    callback: Option<StageCallback>,
    running: Arc<AtomicBool>,
    stop_notify: Arc<Notify>,
) where
    F: Fn(JobContext) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = JobResult> + Send + 'static,
{
    tracing::info!(queue = %config.queue, worker_id = %config.worker_id, "Worker started");

    while running.load(Ordering::SeqCst) {
        match driver
            .claim(&config.queue, &config.worker_id, config.lock_duration)
            .await
        {
            Ok(Some(claimed)) => {
                process_one(&driver, &config, claimed, &handler, callback.clone()).await;
            }
            Ok(None) => {
                // Idle: block on the listener (wakes immediately on notify)
                // or plain-sleep the poll interval.
                match &listener {
                    Some(listener) => {
                        tokio::select! {
                            _ = listener.wait(&config.queue, config.poll_interval) => {}
                            _ = stop_notify.notified() => {}
                        }
                    }
                    None => {
                        tokio::select! {
                            _ = tokio::time::sleep(config.poll_interval) => {}
                            _ = stop_notify.notified() => {}
                        }
                    }
                }
            }
            Err(e) => {
                // Store unreachable: log and retry the poll cycle.
                tracing::error!(
                    queue = %config.queue,
                    worker_id = %config.worker_id,
                    error = %e,
                    "Claim failed"
                );
                tokio::select! {
                    _ = tokio::time::sleep(config.error_backoff) => {}
                    _ = stop_notify.notified() => {}
                }
            }
        }
    }

    tracing::info!(queue = %config.queue, worker_id = %config.worker_id, "Worker stopped");
}

async fn process_one<F, Fut>(
    driver: &DynDriver,
    config: &WorkerConfig,
    claimed: ClaimedJob,
    handler: &F,
    callback: Option<StageCallback>,
) where
    F: Fn(JobContext) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = JobResult> + Send + 'static,
{
    let ClaimedJob { job, token } = claimed;
    let job_id = job.id.clone();

    tracing::debug!(
        job_id = %job_id,
        queue = %job.queue,
        attempt = job.attempts,
        worker_id = %config.worker_id,
        "Processing job"
    );

    let ctx = JobContext::new(job.clone(), token.clone(), driver.clone(), callback);

    // The guard renews the lock on its own timer and is cancelled on every
    // exit path below, including handler errors.
    let heartbeat = HeartbeatGuard::spawn(
        driver.clone(),
        job_id.clone(),
        token.clone(),
        config.lock_duration,
        config.heartbeat_interval,
    );

    let result = (handler)(ctx).await;
    drop(heartbeat);

    let commit = match result {
        Ok(()) => {
            tracing::debug!(job_id = %job_id, "Job completed");
            driver.complete(&job_id, &token).await
        }
        Err(err) => {
            let report = classify_failure(&job, &err);
            match &report.kind {
                FailureKind::Retry { at } => {
                    tracing::debug!(
                        job_id = %job_id,
                        attempt = job.attempts,
                        retry_at = %at,
                        error = %err,
                        "Job scheduled for retry"
                    );
                }
                FailureKind::Discard => {
                    tracing::warn!(job_id = %job_id, error = %err, "Job failed permanently");
                }
                FailureKind::Requeue { at } => {
                    tracing::debug!(
                        job_id = %job_id,
                        requeue_at = ?at,
                        "Job rate limited, re-queued without consuming an attempt"
                    );
                }
            }
            driver.fail(&job_id, &token, report).await
        }
    };

    match commit {
        Ok(true) => {}
        Ok(false) => {
            // The lock expired and the job was reclaimed; the fencing token
            // made our write a safe no-op.
            tracing::warn!(job_id = %job_id, "Commit dropped, lock token is stale");
        }
        Err(e) => {
            tracing::error!(job_id = %job_id, error = %e, "Failed to commit job outcome");
        }
    }
}

/// Map a classified handler error onto the state to commit. `attempts` was
/// already incremented by the claim.
fn classify_failure(job: &Job, err: &JobError) -> FailureReport {
    let details = serde_json::json!({
        "attempt": job.attempts,
        "max_attempts": job.max_attempts,
    });

    match err {
        JobError::RateLimited {
            message,
            retry_after,
        } => FailureReport {
            kind: FailureKind::Requeue {
                at: Some(Utc::now() + chrono::Duration::from_std(*retry_after).unwrap_or_default()),
            },
            message: message.clone(),
            details: Some(details),
        },
        JobError::Permanent { message } => FailureReport {
            kind: FailureKind::Discard,
            message: message.clone(),
            details: Some(details),
        },
        JobError::Retryable { message } => {
            let kind = if job.can_retry() {
                let delay = backoff_delay(job.backoff_kind, job.backoff_base(), job.attempts);
                FailureKind::Retry {
                    at: Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default(),
                }
            } else {
                FailureKind::Discard
            };
            FailureReport {
                kind,
                message: message.clone(),
                details: Some(details),
            }
        }
    }
}
