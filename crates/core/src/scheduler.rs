//! Scheduler for recurring jobs.
//!
//! Evaluates enabled schedules against their cron expressions and enqueues
//! one job per due tick. Safe under concurrent scheduler instances: the
//! guarded `advance_schedule` step elects a single winner per tick, and the
//! per-tick idempotency key is a second line of defense.

use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time;

use crate::backoff::next_cron_after;
use crate::client::Client;
use crate::driver::{DynDriver, ScheduleSpec};
use crate::error::{QueueError, Result};
use crate::job::EnqueueOptions;

/// Scheduler that enqueues jobs from recurring schedule templates.
pub struct Scheduler {
    driver: DynDriver,
    client: Client,
    interval: Duration,
    batch_size: usize,
    running: Arc<AtomicBool>,
}

impl Scheduler {
    pub fn new(
        driver: DynDriver,
        interval: Duration,
        batch_size: usize,
        running: Arc<AtomicBool>,
    ) -> Self {
        let client = Client::with_driver(driver.clone());
        Self {
            driver,
            client,
            interval,
            batch_size,
            running,
        }
    }

    /// Run the scheduler loop until the running flag clears.
    pub async fn run(&self) -> Result<()> {
        if !self.driver.capabilities().persistent_schedules {
            return Err(QueueError::Unsupported("persistent schedules"));
        }

        tracing::info!("Scheduler started");

        while self.running.load(Ordering::SeqCst) {
            if let Err(e) = self.tick().await {
                tracing::error!(error = %e, "Scheduler tick failed");
            }
            time::sleep(self.interval).await;
        }

        tracing::info!("Scheduler stopped");
        Ok(())
    }

    /// Process one tick: enqueue every due schedule and advance it past now.
    pub async fn tick(&self) -> Result<()> {
        let now = Utc::now();
        let due = self.driver.due_schedules(now, self.batch_size).await?;

        for spec in due {
            if let Err(e) = self.fire(&spec).await {
                tracing::error!(schedule_id = %spec.id, error = %e, "Failed to fire schedule");
            }
        }
        Ok(())
    }

    async fn fire(&self, spec: &ScheduleSpec) -> Result<()> {
        let now = Utc::now();
        let next = match next_cron_after(&spec.cron, now)? {
            Some(next) => next,
            None => {
                tracing::warn!(
                    schedule_id = %spec.id,
                    cron = %spec.cron,
                    "Schedule has no future occurrence, leaving as-is"
                );
                return Ok(());
            }
        };

        // Advancing next_run_at and enqueueing must be one atomic step under
        // concurrent schedulers; only the instance that wins the guarded
        // update enqueues this tick.
        if !self
            .driver
            .advance_schedule(&spec.id, spec.next_run_at, next)
            .await?
        {
            tracing::debug!(schedule_id = %spec.id, "Tick already taken by another scheduler");
            return Ok(());
        }

        let key = format!("sched:{}:{}", spec.id, spec.next_run_at.timestamp());
        let result = self
            .client
            .enqueue(
                &spec.queue,
                spec.payload.clone(),
                EnqueueOptions::new().key(key),
            )
            .await?;

        tracing::debug!(
            schedule_id = %spec.id,
            job_id = %result.id,
            next_run_at = %next,
            "Schedule fired"
        );
        Ok(())
    }
}
