//! Notify/wakeup subsystem.
//!
//! Idle workers block on a [`WakeupListener`] bounded by their poll interval
//! and wake immediately when work arrives instead of waiting out the tick.
//! Three interchangeable implementations share the contract: the database
//! LISTEN/NOTIFY listener (in the Postgres driver crate), the in-process
//! pair below, and a polling fallback.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

/// Why a wait returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wakeup {
    /// New work was signalled; retry claiming now.
    Notified,
    /// The timeout elapsed with no signal.
    TimedOut,
}

/// Producer side of the wakeup contract.
pub trait WakeupEmitter: Send + Sync {
    /// Signal that a job became eligible on `queue`.
    fn notify(&self, queue: &str);

    /// Signal that a job will become eligible on `queue` at `at`. Default
    /// no-op; the waitlist arms a timer from this.
    fn notify_at(&self, _queue: &str, _at: DateTime<Utc>) {}
}

/// Consumer side of the wakeup contract.
#[async_trait]
pub trait WakeupListener: Send + Sync {
    /// Block until notified or until `timeout` elapses.
    async fn wait(&self, queue: &str, timeout: Duration) -> Wakeup;
}

/// Zero-IPC emitter/listener pair for when the client and its workers share
/// one process. Notification is a direct task wakeup.
#[derive(Clone, Default)]
pub struct InProcessWakeup {
    channels: Arc<Mutex<HashMap<String, Arc<Notify>>>>,
}

impl InProcessWakeup {
    pub fn new() -> Self {
        Self::default()
    }

    fn channel(&self, queue: &str) -> Arc<Notify> {
        let mut channels = self.channels.lock().expect("wakeup registry poisoned");
        channels
            .entry(queue.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }
}

impl WakeupEmitter for InProcessWakeup {
    fn notify(&self, queue: &str) {
        // notify_one stores a permit, so a signal sent between two waits is
        // not lost.
        self.channel(queue).notify_one();
    }
}

#[async_trait]
impl WakeupListener for InProcessWakeup {
    async fn wait(&self, queue: &str, timeout: Duration) -> Wakeup {
        let channel = self.channel(queue);
        tokio::select! {
            _ = channel.notified() => Wakeup::Notified,
            _ = tokio::time::sleep(timeout) => Wakeup::TimedOut,
        }
    }
}

/// Fallback listener that fires on a fixed interval, for deployments where
/// neither native pub/sub nor a shared process is available.
#[derive(Clone)]
pub struct PollingListener {
    interval: Duration,
}

impl PollingListener {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

#[async_trait]
impl WakeupListener for PollingListener {
    async fn wait(&self, _queue: &str, timeout: Duration) -> Wakeup {
        tokio::time::sleep(self.interval.min(timeout)).await;
        Wakeup::Notified
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn test_in_process_wakeup_immediate() {
        let wakeup = InProcessWakeup::new();
        let listener = wakeup.clone();

        let waiter = tokio::spawn(async move {
            listener.wait("q", Duration::from_secs(10)).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let start = Instant::now();
        wakeup.notify("q");
        let result = waiter.await.unwrap();

        assert_eq!(result, Wakeup::Notified);
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_in_process_wakeup_permit_not_lost() {
        let wakeup = InProcessWakeup::new();
        wakeup.notify("q");
        // Signal arrived before the wait; the permit still wakes it.
        let result = wakeup.wait("q", Duration::from_millis(100)).await;
        assert_eq!(result, Wakeup::Notified);
    }

    #[tokio::test]
    async fn test_in_process_wakeup_times_out() {
        let wakeup = InProcessWakeup::new();
        let result = wakeup.wait("q", Duration::from_millis(20)).await;
        assert_eq!(result, Wakeup::TimedOut);
    }

    #[tokio::test]
    async fn test_in_process_wakeup_channels_are_independent() {
        let wakeup = InProcessWakeup::new();
        wakeup.notify("other");
        let result = wakeup.wait("q", Duration::from_millis(20)).await;
        assert_eq!(result, Wakeup::TimedOut);
    }

    #[tokio::test]
    async fn test_polling_listener_fires_on_interval() {
        let listener = PollingListener::new(Duration::from_millis(10));
        let start = Instant::now();
        let result = listener.wait("q", Duration::from_secs(10)).await;
        assert_eq!(result, Wakeup::Notified);
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
