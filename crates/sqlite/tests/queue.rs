//! End-to-end tests running the queue core against the SQLite driver.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tokio::time::sleep;

use drudge_core::{
    Client, DynDriver, EnqueueOptions, JobError, JobId, JobStatus, ScheduleSpec, Scheduler,
    StageStatus, Waitlist, Worker, WorkerConfig,
};
use drudge_sqlite::SqliteDriver;

async fn driver() -> DynDriver {
    Arc::new(SqliteDriver::in_memory().await.unwrap())
}

/// Poll until the job reaches `status` or the deadline passes.
async fn wait_for_status(driver: &DynDriver, id: &JobId, status: JobStatus, deadline: Duration) {
    let start = Instant::now();
    loop {
        let job = driver.get_job(id).await.unwrap().expect("job exists");
        if job.status == status {
            return;
        }
        if start.elapsed() > deadline {
            panic!(
                "job {} stuck in {:?}, wanted {:?}",
                id, job.status, status
            );
        }
        sleep(Duration::from_millis(10)).await;
    }
}

fn fast_config(queue: &str) -> WorkerConfig {
    WorkerConfig::builder(queue)
        .poll_interval(Duration::from_millis(20))
        .lock_duration(Duration::from_secs(5))
        .shutdown_timeout(Duration::from_secs(2))
        .build()
}

#[tokio::test]
async fn worker_completes_enqueued_job() {
    let driver = driver().await;
    let client = Client::with_driver(driver.clone());

    let worker = Worker::new(driver.clone(), fast_config("emails"), |ctx| async move {
        let n: i64 = ctx.decode().unwrap();
        assert_eq!(n, 7);
        Ok(())
    });
    worker.start();

    let result = client
        .enqueue("emails", json!(7), EnqueueOptions::new())
        .await
        .unwrap();
    assert!(!result.deduplicated);

    wait_for_status(&driver, &result.id, JobStatus::Completed, Duration::from_secs(5)).await;
    worker.stop().await;

    let job = driver.get_job(&result.id).await.unwrap().unwrap();
    assert_eq!(job.attempts, 1);
    assert!(job.completed_at.is_some());
    assert_eq!(job.overall_progress, 100.0);
}

#[tokio::test]
async fn two_workers_process_each_job_exactly_once() {
    use std::collections::HashMap;
    use std::sync::Mutex;

    let driver = driver().await;
    let client = Client::with_driver(driver.clone());
    // Executions recorded per claiming worker, as stamped into locked_by.
    let executions: Arc<Mutex<HashMap<String, u32>>> = Arc::new(Mutex::new(HashMap::new()));

    let make_worker = |id: &str| {
        let executions = executions.clone();
        Worker::new(
            driver.clone(),
            WorkerConfig::builder("bulk")
                .worker_id(id)
                .poll_interval(Duration::from_millis(10))
                .lock_duration(Duration::from_secs(5))
                .build(),
            move |ctx| {
                let executions = executions.clone();
                async move {
                    sleep(Duration::from_millis(20)).await;
                    let claimant = ctx.job().locked_by.clone().expect("locked_by stamped");
                    *executions.lock().unwrap().entry(claimant).or_insert(0) += 1;
                    Ok(())
                }
            },
        )
    };

    let a = make_worker("worker-a");
    let b = make_worker("worker-b");
    a.start();
    b.start();

    let mut ids = Vec::new();
    for i in 0..50 {
        let result = client
            .enqueue("bulk", json!({ "n": i }), EnqueueOptions::new())
            .await
            .unwrap();
        ids.push(result.id);
    }

    let start = Instant::now();
    loop {
        let stats = client.stats(Some("bulk")).await.unwrap();
        if stats.completed == 50 {
            break;
        }
        assert!(start.elapsed() < Duration::from_secs(20), "jobs stalled: {:?}", stats);
        sleep(Duration::from_millis(25)).await;
    }
    a.stop().await;
    b.stop().await;

    // Exactly one execution per job, and both workers pulled work.
    let counts = executions.lock().unwrap();
    assert_eq!(counts.values().sum::<u32>(), 50);
    assert!(counts.get("worker-a").copied().unwrap_or(0) >= 1, "worker-a never claimed");
    assert!(counts.get("worker-b").copied().unwrap_or(0) >= 1, "worker-b never claimed");
    drop(counts);
    for id in &ids {
        let job = driver.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.attempts, 1);
    }
}

#[tokio::test]
async fn permanent_error_fails_without_retry() {
    let driver = driver().await;
    let client = Client::with_driver(driver.clone());

    let worker = Worker::new(driver.clone(), fast_config("strict"), |_ctx| async move {
        Err(JobError::permanent("payload failed validation"))
    });
    worker.start();

    let result = client
        .enqueue("strict", json!({}), EnqueueOptions::new().max_attempts(5))
        .await
        .unwrap();

    wait_for_status(&driver, &result.id, JobStatus::Failed, Duration::from_secs(5)).await;
    worker.stop().await;

    let job = driver.get_job(&result.id).await.unwrap().unwrap();
    assert_eq!(job.attempts, 1);
    assert_eq!(
        job.error_message.as_deref(),
        Some("payload failed validation")
    );
}

#[tokio::test]
async fn retryable_error_exhausts_max_attempts() {
    let driver = driver().await;
    let client = Client::with_driver(driver.clone());
    let attempts_seen = Arc::new(AtomicU32::new(0));

    let seen = attempts_seen.clone();
    let worker = Worker::new(driver.clone(), fast_config("flaky"), move |_ctx| {
        let seen = seen.clone();
        async move {
            seen.fetch_add(1, Ordering::SeqCst);
            Err(JobError::retryable("still down"))
        }
    });
    worker.start();

    let result = client
        .enqueue(
            "flaky",
            json!({}),
            EnqueueOptions::new()
                .max_attempts(3)
                .backoff(Duration::from_millis(10), drudge_core::BackoffKind::Fixed),
        )
        .await
        .unwrap();

    wait_for_status(&driver, &result.id, JobStatus::Failed, Duration::from_secs(10)).await;
    worker.stop().await;

    assert_eq!(attempts_seen.load(Ordering::SeqCst), 3);
    let job = driver.get_job(&result.id).await.unwrap().unwrap();
    assert_eq!(job.attempts, 3);
    assert_eq!(job.error_message.as_deref(), Some("still down"));
    let details = job.error_details.unwrap();
    assert_eq!(details["attempt"], 3);
    assert_eq!(details["max_attempts"], 3);
}

#[tokio::test]
async fn transient_failure_then_success() {
    let driver = driver().await;
    let client = Client::with_driver(driver.clone());
    let calls = Arc::new(AtomicU32::new(0));

    let counter = calls.clone();
    let worker = Worker::new(driver.clone(), fast_config("recovers"), move |_ctx| {
        let counter = counter.clone();
        async move {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(JobError::retryable("first try flakes"))
            } else {
                Ok(())
            }
        }
    });
    worker.start();

    let result = client
        .enqueue(
            "recovers",
            json!({}),
            EnqueueOptions::new().backoff(Duration::from_millis(10), drudge_core::BackoffKind::Fixed),
        )
        .await
        .unwrap();

    wait_for_status(&driver, &result.id, JobStatus::Completed, Duration::from_secs(5)).await;
    worker.stop().await;

    let job = driver.get_job(&result.id).await.unwrap().unwrap();
    assert_eq!(job.attempts, 2);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn rate_limited_requeue_gives_the_attempt_back() {
    let driver = driver().await;
    let client = Client::with_driver(driver.clone());
    let calls = Arc::new(AtomicU32::new(0));

    let counter = calls.clone();
    let worker = Worker::new(driver.clone(), fast_config("throttled"), move |_ctx| {
        let counter = counter.clone();
        async move {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(JobError::rate_limited("429", Duration::from_millis(30)))
            } else {
                Ok(())
            }
        }
    });
    worker.start();

    let result = client
        .enqueue("throttled", json!({}), EnqueueOptions::new().max_attempts(1))
        .await
        .unwrap();

    // With max_attempts 1 the job only completes if the rate-limit path
    // returned the attempt; a consumed attempt would leave it failed.
    wait_for_status(&driver, &result.id, JobStatus::Completed, Duration::from_secs(5)).await;
    worker.stop().await;

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    let job = driver.get_job(&result.id).await.unwrap().unwrap();
    assert_eq!(job.attempts, 1);
}

#[tokio::test]
async fn heartbeat_keeps_long_handler_locked() {
    let driver = driver().await;
    let client = Client::with_driver(driver.clone());

    let config = WorkerConfig::builder("slow")
        .poll_interval(Duration::from_millis(20))
        .lock_duration(Duration::from_millis(150))
        .build();
    // Handler runs well past the lock duration; only heartbeat renewal
    // keeps the job from being reclaimed.
    let worker = Worker::new(driver.clone(), config, |_ctx| async move {
        sleep(Duration::from_millis(600)).await;
        Ok(())
    });
    worker.start();

    let result = client
        .enqueue("slow", json!({}), EnqueueOptions::new())
        .await
        .unwrap();

    wait_for_status(&driver, &result.id, JobStatus::Completed, Duration::from_secs(5)).await;
    worker.stop().await;

    let job = driver.get_job(&result.id).await.unwrap().unwrap();
    assert_eq!(job.attempts, 1, "job was reclaimed mid-handler");
}

#[tokio::test]
async fn waitlist_wakes_idle_worker_before_poll_interval() {
    let driver = driver().await;
    let waitlist = Arc::new(Waitlist::with_driver(driver.clone()));
    let client = Client::with_driver(driver.clone()).emitter(waitlist.clone());

    // Poll interval far beyond the asserted latency; only the wakeup can
    // make this pass.
    let config = WorkerConfig::builder("pushy")
        .poll_interval(Duration::from_secs(10))
        .lock_duration(Duration::from_secs(5))
        .build();
    let worker = Worker::new(driver.clone(), config, |_ctx| async move { Ok(()) })
        .listener(waitlist.clone());
    worker.start();

    // Let the worker drain its first claim attempt and park on the waitlist.
    sleep(Duration::from_millis(100)).await;

    let enqueued_at = Instant::now();
    let result = client
        .enqueue("pushy", json!({}), EnqueueOptions::new())
        .await
        .unwrap();
    wait_for_status(&driver, &result.id, JobStatus::Completed, Duration::from_millis(500)).await;
    assert!(enqueued_at.elapsed() < Duration::from_millis(500));

    worker.stop().await;
    waitlist.close();
}

#[tokio::test]
async fn enqueue_key_is_idempotent_until_terminal() {
    let driver = driver().await;
    let client = Client::with_driver(driver.clone());

    let opts = || EnqueueOptions::new().key("import:42");
    let first = client.enqueue("imports", json!({}), opts()).await.unwrap();
    let second = client.enqueue("imports", json!({}), opts()).await.unwrap();
    assert!(!first.deduplicated);
    assert!(second.deduplicated);
    assert_eq!(first.id, second.id);
    assert_eq!(client.stats(Some("imports")).await.unwrap().total(), 1);

    // Once the job is terminal the key is reusable.
    driver.cancel(&first.id).await.unwrap();
    let third = client.enqueue("imports", json!({}), opts()).await.unwrap();
    assert!(!third.deduplicated);
    assert_ne!(third.id, first.id);
}

#[tokio::test]
async fn cancelled_job_is_never_claimed() {
    let driver = driver().await;
    let client = Client::with_driver(driver.clone());

    let result = client
        .enqueue("doomed", json!({}), EnqueueOptions::new())
        .await
        .unwrap();
    client.cancel(&result.id).await.unwrap();

    assert!(driver
        .claim("doomed", "w1", Duration::from_secs(5))
        .await
        .unwrap()
        .is_none());

    // Resurrection brings it back as claimable.
    assert!(client.resurrect(&result.id).await.unwrap());
    let claimed = driver
        .claim("doomed", "w1", Duration::from_secs(5))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claimed.job.id, result.id);
    assert_eq!(claimed.job.attempts, 1);
}

#[tokio::test]
async fn stage_progress_survives_completion() {
    let driver = driver().await;
    let client = Client::with_driver(driver.clone());

    let worker = Worker::new(driver.clone(), fast_config("staged"), |ctx| async move {
        ctx.init_stages(&["fetch", "process"]).await.unwrap();
        ctx.start_stage("fetch").await.unwrap();
        ctx.update_stage_progress("fetch", 50.0).await.unwrap();
        ctx.complete_stage("fetch", Some(json!({"bytes": 1024}))).await.unwrap();
        ctx.start_stage("process").await.unwrap();
        ctx.complete_stage("process", None).await.unwrap();
        Ok(())
    });
    worker.start();

    let result = client
        .enqueue("staged", json!({}), EnqueueOptions::new())
        .await
        .unwrap();
    wait_for_status(&driver, &result.id, JobStatus::Completed, Duration::from_secs(5)).await;
    worker.stop().await;

    let job = driver.get_job(&result.id).await.unwrap().unwrap();
    assert_eq!(job.stages.len(), 2);
    assert!(job.stages.iter().all(|s| s.status == StageStatus::Completed));
    assert_eq!(job.stages[0].artifacts, Some(json!({"bytes": 1024})));
    assert!(job.stages[0].started_at.is_some());
    assert!(job.stages[0].completed_at.is_some());
}

#[tokio::test]
async fn stats_account_for_every_job() {
    let driver = driver().await;
    let client = Client::with_driver(driver.clone());

    for _ in 0..3 {
        client.enqueue("a", json!({}), EnqueueOptions::new()).await.unwrap();
    }
    client
        .enqueue("a", json!({}), EnqueueOptions::new().delay(Duration::from_secs(3600)))
        .await
        .unwrap();
    let to_fail = client.enqueue("a", json!({}), EnqueueOptions::new()).await.unwrap();
    client.cancel(&to_fail.id).await.unwrap();
    driver.claim("a", "w1", Duration::from_secs(30)).await.unwrap();

    let stats = client.stats(Some("a")).await.unwrap();
    assert_eq!(stats.total(), 5);
    assert_eq!(stats.pending, 3);
    assert_eq!(stats.processing, 1);
    assert_eq!(stats.failed, 1);

    // Other queues do not leak in.
    client.enqueue("b", json!({}), EnqueueOptions::new()).await.unwrap();
    assert_eq!(client.stats(Some("a")).await.unwrap().total(), 5);
    assert_eq!(client.stats(None).await.unwrap().total(), 6);
}

#[tokio::test]
async fn scheduler_tick_fires_due_schedules_once() {
    use std::sync::atomic::AtomicBool;

    let driver = driver().await;
    let client = Client::with_driver(driver.clone());

    let mut spec = ScheduleSpec::new("nightly", "maintenance", "0 0 3 * * *", json!({"task": "prune"}))
        .unwrap();
    spec.next_run_at = chrono::Utc::now() - chrono::Duration::minutes(5);
    driver.put_schedule(spec).await.unwrap();

    let scheduler = Scheduler::new(
        driver.clone(),
        Duration::from_secs(60),
        100,
        Arc::new(AtomicBool::new(true)),
    );
    scheduler.tick().await.unwrap();
    assert_eq!(client.stats(Some("maintenance")).await.unwrap().pending, 1);

    // The schedule was advanced past now; a second tick enqueues nothing.
    scheduler.tick().await.unwrap();
    assert_eq!(client.stats(Some("maintenance")).await.unwrap().pending, 1);
}
