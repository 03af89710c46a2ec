//! Configuration types for workers.

use std::time::Duration;

use crate::heartbeat::generate_worker_id;

/// Configuration for a Worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Logical channel this worker claims from.
    pub queue: String,
    /// Worker identifier stamped into `locked_by`.
    pub worker_id: String,
    /// How long to wait between claim attempts when idle. With a wakeup
    /// listener this is only an upper bound.
    pub poll_interval: Duration,
    /// Execution timeout per claim; the heartbeat must renew before it
    /// lapses.
    pub lock_duration: Duration,
    /// How often the heartbeat renews the lock.
    pub heartbeat_interval: Duration,
    /// How long `stop()` waits for the in-flight handler.
    pub shutdown_timeout: Duration,
    /// Pause after a store error before retrying the poll cycle.
    pub error_backoff: Duration,
}

impl WorkerConfig {
    /// Defaults for the given queue; heartbeat runs at a third of the lock
    /// duration.
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            worker_id: generate_worker_id(),
            poll_interval: Duration::from_secs(5),
            lock_duration: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(20),
            shutdown_timeout: Duration::from_secs(30),
            error_backoff: Duration::from_secs(1),
        }
    }

    pub fn builder(queue: impl Into<String>) -> WorkerConfigBuilder {
        WorkerConfigBuilder {
            config: Self::new(queue),
        }
    }
}

/// Builder for WorkerConfig.
#[derive(Debug)]
pub struct WorkerConfigBuilder {
    config: WorkerConfig,
}

impl WorkerConfigBuilder {
    pub fn worker_id(mut self, id: impl Into<String>) -> Self {
        self.config.worker_id = id.into();
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    /// Set the lock duration; the heartbeat interval follows at a third of
    /// it unless set explicitly afterwards.
    pub fn lock_duration(mut self, duration: Duration) -> Self {
        self.config.lock_duration = duration;
        self.config.heartbeat_interval = duration / 3;
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.heartbeat_interval = interval;
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_timeout = timeout;
        self
    }

    pub fn error_backoff(mut self, backoff: Duration) -> Self {
        self.config.error_backoff = backoff;
        self
    }

    pub fn build(self) -> WorkerConfig {
        self.config
    }
}
