//! # drudge-core - Core types and traits for the drudge job queue
//!
//! This crate provides the core abstractions for the drudge job queue engine:
//! - `Driver` trait and `Capabilities` descriptor for storage backends
//! - `Job`, `JobId`, `JobStatus`, `LockToken`, `EnqueueOptions` types
//! - `Client` for enqueueing, stats, lookup, and cancellation
//! - `Worker` poll-or-wait loop with heartbeat lock renewal
//! - `JobContext` with stage/progress tracking
//! - `Scheduler` for cron-based recurring jobs
//! - Notify/wakeup subsystem and the in-process `Waitlist`
//! - Error taxonomy

mod backoff;
mod client;
mod config;
mod context;
mod driver;
mod error;
mod heartbeat;
mod job;
mod notify;
mod scheduler;
mod waitlist;
mod worker;

pub use backoff::{backoff_delay, from_millis, next_cron_after, to_millis, validate_cron, MAX_BACKOFF};
pub use client::{Client, EnqueueResult};
pub use config::{WorkerConfig, WorkerConfigBuilder};
pub use context::{JobContext, StageCallback, StageEvent, StageEventKind};
pub use driver::{
    CancelOutcome, Capabilities, ClaimedJob, Driver, DynDriver, EnqueueOutcome, FailureKind,
    FailureReport, ProgressUpdate, QueueStats, ScheduleSpec,
};
pub use error::{JobError, QueueError, Result};
pub use heartbeat::{generate_worker_id, HeartbeatGuard};
pub use job::{
    BackoffKind, EnqueueOptions, Job, JobId, JobStatus, LockToken, NewJob, Stage, StageStatus,
};
pub use notify::{InProcessWakeup, PollingListener, Wakeup, WakeupEmitter, WakeupListener};
pub use scheduler::Scheduler;
pub use waitlist::Waitlist;
pub use worker::{JobResult, Worker};
