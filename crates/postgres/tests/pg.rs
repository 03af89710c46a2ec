//! Integration tests against a live PostgreSQL server.
//!
//! Run with a scratch database:
//!
//! ```sh
//! DRUDGE_TEST_POSTGRES_URL=postgres://localhost/drudge_test \
//!     cargo test -p drudge-postgres -- --ignored
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;

use drudge_core::{
    Client, DynDriver, EnqueueOptions, FailureKind, FailureReport, JobStatus, LockToken, Wakeup,
    WakeupListener,
};
use drudge_postgres::{PgDriver, PgWakeupListener};

fn test_url() -> String {
    std::env::var("DRUDGE_TEST_POSTGRES_URL")
        .expect("set DRUDGE_TEST_POSTGRES_URL to run postgres integration tests")
}

async fn driver() -> DynDriver {
    Arc::new(PgDriver::new(&test_url()).await.unwrap())
}

/// Unique queue name per test so runs do not interfere.
fn queue(tag: &str) -> String {
    format!("{}-{}", tag, uuid::Uuid::new_v4())
}

#[tokio::test]
#[ignore]
async fn claim_is_exclusive_under_contention() {
    let driver = driver().await;
    let client = Client::with_driver(driver.clone());
    let q = queue("contend");

    for i in 0..20 {
        client
            .enqueue(&q, json!({ "n": i }), EnqueueOptions::new())
            .await
            .unwrap();
    }

    // Many concurrent claimants; every job must be handed out exactly once.
    let mut tasks = Vec::new();
    for w in 0..8 {
        let driver = driver.clone();
        let q = q.clone();
        tasks.push(tokio::spawn(async move {
            let worker_id = format!("w{}", w);
            let mut claimed = Vec::new();
            loop {
                match driver
                    .claim(&q, &worker_id, Duration::from_secs(30))
                    .await
                    .unwrap()
                {
                    Some(c) => claimed.push(c.job.id),
                    None => break,
                }
            }
            claimed
        }));
    }

    let mut all = Vec::new();
    for task in tasks {
        all.extend(task.await.unwrap());
    }
    all.sort_by_key(|id| id.to_string());
    all.dedup();
    assert_eq!(all.len(), 20, "a job was claimed twice or lost");
}

#[tokio::test]
#[ignore]
async fn stale_token_writes_are_noops() {
    let driver = driver().await;
    let client = Client::with_driver(driver.clone());
    let q = queue("fence");

    let result = client.enqueue(&q, json!({}), EnqueueOptions::new()).await.unwrap();
    let claimed = driver
        .claim(&q, "w1", Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();

    let stale = LockToken::mint();
    assert!(!driver.complete(&result.id, &stale).await.unwrap());
    assert!(!driver
        .fail(
            &result.id,
            &stale,
            FailureReport {
                kind: FailureKind::Discard,
                message: "nope".into(),
                details: None,
            },
        )
        .await
        .unwrap());

    assert!(driver.complete(&result.id, &claimed.token).await.unwrap());
    let job = driver.get_job(&result.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
}

#[tokio::test]
#[ignore]
async fn expired_lock_is_reclaimed_with_marker() {
    let driver = driver().await;
    let client = Client::with_driver(driver.clone());
    let q = queue("expire");

    let result = client.enqueue(&q, json!({}), EnqueueOptions::new()).await.unwrap();
    let first = driver
        .claim(&q, "w1", Duration::from_millis(50))
        .await
        .unwrap()
        .unwrap();
    tokio::time::sleep(Duration::from_millis(120)).await;

    let second = driver
        .claim(&q, "w2", Duration::from_secs(30))
        .await
        .unwrap()
        .expect("expired lock reclaimed");
    assert_eq!(second.job.id, result.id);
    assert_eq!(second.job.attempts, 2);
    assert_eq!(
        second.job.error_message.as_deref(),
        Some("job lock expired before completion")
    );
    assert!(!driver.complete(&result.id, &first.token).await.unwrap());
}

#[tokio::test]
#[ignore]
async fn exhausted_expired_lock_is_buried() {
    let driver = driver().await;
    let client = Client::with_driver(driver.clone());
    let q = queue("bury");

    let result = client
        .enqueue(&q, json!({}), EnqueueOptions::new().max_attempts(1))
        .await
        .unwrap();
    driver
        .claim(&q, "w1", Duration::from_millis(50))
        .await
        .unwrap()
        .unwrap();
    tokio::time::sleep(Duration::from_millis(120)).await;

    assert!(driver
        .claim(&q, "w2", Duration::from_secs(30))
        .await
        .unwrap()
        .is_none());

    let job = driver.get_job(&result.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(
        job.error_message.as_deref(),
        Some("job lock expired before completion")
    );
    assert!(job.completed_at.is_some());
}

#[tokio::test]
#[ignore]
async fn enqueue_key_dedupes_across_connections() {
    let driver = driver().await;
    let client = Client::with_driver(driver.clone());
    let q = queue("dedupe");
    let key = uuid::Uuid::new_v4().to_string();

    let first = client
        .enqueue(&q, json!({}), EnqueueOptions::new().key(&key))
        .await
        .unwrap();
    let second = client
        .enqueue(&q, json!({}), EnqueueOptions::new().key(&key))
        .await
        .unwrap();
    assert!(second.deduplicated);
    assert_eq!(first.id, second.id);
}

#[tokio::test]
#[ignore]
async fn listen_notify_wakes_waiting_listener() {
    let url = test_url();
    let driver: DynDriver = Arc::new(PgDriver::new(&url).await.unwrap());
    let client = Client::with_driver(driver.clone());
    let listener = PgWakeupListener::connect(&url).await.unwrap();
    let q = queue("notify");

    let waiting_q = q.clone();
    let waiter = tokio::spawn(async move {
        listener.wait(&waiting_q, Duration::from_secs(10)).await
    });
    tokio::time::sleep(Duration::from_millis(200)).await;

    let start = Instant::now();
    client.enqueue(&q, json!({}), EnqueueOptions::new()).await.unwrap();

    assert_eq!(waiter.await.unwrap(), Wakeup::Notified);
    assert!(start.elapsed() < Duration::from_millis(500));
}
