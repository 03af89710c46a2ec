//! In-process waitlist for long-poll callers.
//!
//! Used by the relational drivers in single-process deployments so idle
//! workers avoid fixed-interval polling. Waiters are explicit arena records
//! (id, result channel, registration time); notification writes the channel
//! and drops the record. A resolved waiter receives only a retry signal,
//! never the job itself, so claiming stays race-free.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::driver::DynDriver;
use crate::notify::{Wakeup, WakeupEmitter, WakeupListener};

/// Timers are never armed further out than this, to avoid leaking
/// long-lived tasks for far-future jobs.
const MAX_WAKEUP_HORIZON: Duration = Duration::from_secs(24 * 60 * 60);

struct WaiterRecord {
    queue: String,
    tx: oneshot::Sender<Wakeup>,
    registered_at: std::time::Instant,
}

struct Timer {
    deadline: DateTime<Utc>,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    waiters: HashMap<u64, WaiterRecord>,
    order: HashMap<String, VecDeque<u64>>,
    /// One stored permit per queue so a signal sent between waits is kept.
    credits: HashMap<String, bool>,
    timers: HashMap<String, Timer>,
    closed: bool,
}

/// Push-based wakeup registry for one process.
#[derive(Clone)]
pub struct Waitlist {
    inner: Arc<Mutex<Inner>>,
    /// When present, `wait` arms a timer from the store's earliest future
    /// eligibility so delayed jobs are picked up close to on time.
    driver: Option<DynDriver>,
}

impl Default for Waitlist {
    fn default() -> Self {
        Self::new()
    }
}

impl Waitlist {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            driver: None,
        }
    }

    /// Attach a driver so waits arm store-derived wakeup timers.
    pub fn with_driver(driver: DynDriver) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            driver: Some(driver),
        }
    }

    /// Pop and resolve up to `n` waiters on `queue`. With no waiters
    /// registered, one permit is stored instead.
    pub fn notify_waiters(&self, queue: &str, n: usize) {
        let mut resolved = 0;
        let mut inner = self.inner.lock().expect("waitlist poisoned");
        if inner.closed {
            return;
        }
        while resolved < n {
            let id = match inner.order.get_mut(queue).and_then(VecDeque::pop_front) {
                Some(id) => id,
                None => break,
            };
            // Ids left behind by timed-out waiters are skipped.
            if let Some(record) = inner.waiters.remove(&id) {
                let _ = record.tx.send(Wakeup::Notified);
                resolved += 1;
            }
        }
        if resolved == 0 {
            inner.credits.insert(queue.to_string(), true);
        }
    }

    /// Arm a timer that wakes all waiters on `queue` at `at`, bounded to a
    /// 24h horizon. An already armed earlier timer is kept.
    pub fn schedule_wakeup(&self, queue: &str, at: DateTime<Utc>) {
        let now = Utc::now();
        let horizon = now + chrono::Duration::from_std(MAX_WAKEUP_HORIZON).unwrap_or_default();
        let deadline = at.min(horizon);
        let sleep = (deadline - now).to_std().unwrap_or(Duration::ZERO);

        let mut inner = self.inner.lock().expect("waitlist poisoned");
        if inner.closed {
            return;
        }
        if let Some(existing) = inner.timers.get(queue) {
            if existing.deadline <= deadline && !existing.handle.is_finished() {
                return;
            }
            existing.handle.abort();
        }

        let this = self.clone();
        let queue_name = queue.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(sleep).await;
            {
                let mut inner = this.inner.lock().expect("waitlist poisoned");
                inner.timers.remove(&queue_name);
            }
            this.notify_waiters(&queue_name, usize::MAX);
        });
        inner.timers.insert(queue.to_string(), Timer { deadline, handle });
    }

    /// Resolve every outstanding waiter with a "no job" signal and clear all
    /// timers. Callers never stay parked past close.
    pub fn close(&self) {
        let mut inner = self.inner.lock().expect("waitlist poisoned");
        inner.closed = true;
        for (_, record) in inner.waiters.drain() {
            let _ = record.tx.send(Wakeup::TimedOut);
        }
        inner.order.clear();
        inner.credits.clear();
        for (_, timer) in inner.timers.drain() {
            timer.handle.abort();
        }
    }

    /// Number of currently registered waiters (all queues).
    pub fn len(&self) -> usize {
        self.inner.lock().expect("waitlist poisoned").waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn arm_from_store(&self, queue: &str) {
        let driver = match &self.driver {
            Some(driver) => driver.clone(),
            None => return,
        };
        let already_armed = {
            let inner = self.inner.lock().expect("waitlist poisoned");
            inner.timers.contains_key(queue)
        };
        if already_armed {
            return;
        }
        match driver.next_wakeup(queue).await {
            Ok(Some(at)) => self.schedule_wakeup(queue, at),
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(queue = %queue, error = %e, "Failed to inspect store for next wakeup");
            }
        }
    }
}

impl WakeupEmitter for Waitlist {
    fn notify(&self, queue: &str) {
        self.notify_waiters(queue, 1);
    }

    fn notify_at(&self, queue: &str, at: DateTime<Utc>) {
        self.schedule_wakeup(queue, at);
    }
}

#[async_trait]
impl WakeupListener for Waitlist {
    async fn wait(&self, queue: &str, timeout: Duration) -> Wakeup {
        let rx = {
            let mut inner = self.inner.lock().expect("waitlist poisoned");
            if inner.closed {
                return Wakeup::TimedOut;
            }
            if inner.credits.remove(queue).is_some() {
                return Wakeup::Notified;
            }
            let id = inner.next_id;
            inner.next_id += 1;
            let (tx, rx) = oneshot::channel();
            inner.waiters.insert(
                id,
                WaiterRecord {
                    queue: queue.to_string(),
                    tx,
                    registered_at: std::time::Instant::now(),
                },
            );
            inner.order.entry(queue.to_string()).or_default().push_back(id);
            (id, rx)
        };
        let (id, rx) = rx;

        self.arm_from_store(queue).await;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(wakeup)) => wakeup,
            // Sender dropped during close teardown.
            Ok(Err(_)) => Wakeup::TimedOut,
            Err(_) => {
                let mut inner = self.inner.lock().expect("waitlist poisoned");
                if let Some(record) = inner.waiters.remove(&id) {
                    tracing::trace!(
                        queue = %record.queue,
                        waited_ms = record.registered_at.elapsed().as_millis() as u64,
                        "Waiter timed out"
                    );
                }
                Wakeup::TimedOut
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn test_notify_resolves_waiter() {
        let waitlist = Waitlist::new();
        let listener = waitlist.clone();
        let waiter =
            tokio::spawn(async move { listener.wait("q", Duration::from_secs(10)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let start = Instant::now();
        waitlist.notify_waiters("q", 1);
        assert_eq!(waiter.await.unwrap(), Wakeup::Notified);
        assert!(start.elapsed() < Duration::from_millis(500));
        assert!(waitlist.is_empty());
    }

    #[tokio::test]
    async fn test_notify_n_resolves_up_to_n() {
        let waitlist = Waitlist::new();
        let mut waiters = Vec::new();
        for _ in 0..3 {
            let listener = waitlist.clone();
            waiters.push(tokio::spawn(async move {
                listener.wait("q", Duration::from_secs(10)).await
            }));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(waitlist.len(), 3);

        waitlist.notify_waiters("q", 2);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(waitlist.len(), 1);

        waitlist.close();
        for waiter in waiters {
            waiter.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_wait_times_out_and_cleans_up() {
        let waitlist = Waitlist::new();
        let result = waitlist.wait("q", Duration::from_millis(20)).await;
        assert_eq!(result, Wakeup::TimedOut);
        assert!(waitlist.is_empty());
    }

    #[tokio::test]
    async fn test_credit_survives_between_waits() {
        let waitlist = Waitlist::new();
        waitlist.notify_waiters("q", 1);
        let result = waitlist.wait("q", Duration::from_millis(20)).await;
        assert_eq!(result, Wakeup::Notified);
    }

    #[tokio::test]
    async fn test_close_resolves_all_waiters() {
        let waitlist = Waitlist::new();
        let mut waiters = Vec::new();
        for _ in 0..4 {
            let listener = waitlist.clone();
            waiters.push(tokio::spawn(async move {
                listener.wait("q", Duration::from_secs(60)).await
            }));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        waitlist.close();
        for waiter in waiters {
            assert_eq!(waiter.await.unwrap(), Wakeup::TimedOut);
        }
        // A wait after close never parks.
        assert_eq!(
            waitlist.wait("q", Duration::from_secs(60)).await,
            Wakeup::TimedOut
        );
    }

    #[tokio::test]
    async fn test_scheduled_wakeup_fires() {
        let waitlist = Waitlist::new();
        waitlist.schedule_wakeup("q", Utc::now() + chrono::Duration::milliseconds(30));
        let start = Instant::now();
        let result = waitlist.wait("q", Duration::from_secs(10)).await;
        assert_eq!(result, Wakeup::Notified);
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
