//! Client for enqueueing and inspecting jobs.

use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;

use crate::driver::{CancelOutcome, Driver, DynDriver, EnqueueOutcome, QueueStats};
use crate::error::Result;
use crate::job::{EnqueueOptions, Job, JobId, NewJob};
use crate::notify::WakeupEmitter;

/// Result of an enqueue call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueResult {
    pub id: JobId,
    /// True when the idempotency key matched an existing non-terminal job.
    pub deduplicated: bool,
}

/// Producer-side handle to a queue.
#[derive(Clone)]
pub struct Client {
    driver: DynDriver,
    emitter: Option<Arc<dyn WakeupEmitter>>,
}

impl Client {
    pub fn new(driver: impl Driver + 'static) -> Self {
        Self {
            driver: Arc::new(driver),
            emitter: None,
        }
    }

    pub fn with_driver(driver: DynDriver) -> Self {
        Self {
            driver,
            emitter: None,
        }
    }

    /// Wire a wakeup emitter so same-process workers are signalled on
    /// enqueue instead of waiting out their poll interval.
    pub fn emitter(mut self, emitter: Arc<dyn WakeupEmitter>) -> Self {
        self.emitter = Some(emitter);
        self
    }

    pub fn driver(&self) -> &DynDriver {
        &self.driver
    }

    /// Insert a job in `pending`. Idempotent by `options.key`: a colliding
    /// key on a still-live job returns that job's id with no new row.
    pub async fn enqueue(
        &self,
        queue: &str,
        data: Value,
        options: EnqueueOptions,
    ) -> Result<EnqueueResult> {
        let job = NewJob::build(queue, data, options);
        let scheduled_for = job.scheduled_for;
        let outcome = self.driver.enqueue(job).await?;

        let result = match outcome {
            EnqueueOutcome::Created(id) => {
                tracing::debug!(job_id = %id, queue = %queue, "Job enqueued");
                if let Some(emitter) = &self.emitter {
                    match scheduled_for {
                        Some(at) if at > Utc::now() => emitter.notify_at(queue, at),
                        _ => emitter.notify(queue),
                    }
                }
                EnqueueResult {
                    id,
                    deduplicated: false,
                }
            }
            EnqueueOutcome::Deduplicated(id) => {
                tracing::debug!(job_id = %id, queue = %queue, "Enqueue deduplicated by key");
                EnqueueResult {
                    id,
                    deduplicated: true,
                }
            }
        };
        Ok(result)
    }

    /// Per-status counts, across all queues when `queue` is `None`.
    pub async fn stats(&self, queue: Option<&str>) -> Result<QueueStats> {
        self.driver.stats(queue).await
    }

    /// Point lookup.
    pub async fn get_job(&self, id: &JobId) -> Result<Option<Job>> {
        self.driver.get_job(id).await
    }

    /// Cancel a pending job. Reports, rather than errors, when the job has
    /// already been claimed or finished.
    pub async fn cancel(&self, id: &JobId) -> Result<CancelOutcome> {
        let outcome = self.driver.cancel(id).await?;
        match outcome {
            CancelOutcome::Cancelled => {
                tracing::info!(job_id = %id, "Job cancelled");
            }
            CancelOutcome::AlreadyClaimed => {
                tracing::debug!(job_id = %id, "Cancel refused, job already claimed");
            }
            _ => {}
        }
        Ok(outcome)
    }

    /// Operator intervention: move a terminal `failed` job back to `pending`
    /// with attempts reset.
    pub async fn resurrect(&self, id: &JobId) -> Result<bool> {
        self.driver.resurrect(id).await
    }
}
