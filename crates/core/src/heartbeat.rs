//! Heartbeat lock renewal for claimed jobs.
//!
//! While a handler runs, a background task periodically pushes the job's
//! lock deadline forward. A crashed worker simply stops heartbeating and the
//! lock expires naturally, making the job reclaimable.

use chrono::Utc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::driver::DynDriver;
use crate::job::{JobId, LockToken};

/// Scoped lock renewal: the renewal task is aborted when the guard drops,
/// on every handler exit path including errors.
pub struct HeartbeatGuard {
    handle: JoinHandle<()>,
}

impl HeartbeatGuard {
    /// Spawn a renewal task extending the lock by `lock_duration` every
    /// `interval`.
    pub fn spawn(
        driver: DynDriver,
        id: JobId,
        token: LockToken,
        lock_duration: Duration,
        interval: Duration,
    ) -> Self {
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // First tick is immediate and harmless.
            loop {
                ticker.tick().await;
                let until = Utc::now()
                    + chrono::Duration::from_std(lock_duration).unwrap_or_default();
                match driver.extend_lock(&id, &token, until).await {
                    Ok(true) => {
                        tracing::trace!(job_id = %id, until = %until, "Lock renewed");
                    }
                    Ok(false) => {
                        tracing::warn!(
                            job_id = %id,
                            "Lock lost, job was reclaimed; stopping renewal"
                        );
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(job_id = %id, error = %e, "Failed to renew lock");
                    }
                }
            }
        });
        Self { handle }
    }
}

impl Drop for HeartbeatGuard {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Generate a unique worker identifier from host, pid, and a random suffix.
pub fn generate_worker_id() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let pid = std::process::id();
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}-{}", host, pid, &suffix[..8])
}
