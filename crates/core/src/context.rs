//! Per-job execution context handed to handlers.

use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::driver::{DynDriver, ProgressUpdate};
use crate::error::{QueueError, Result};
use crate::job::{Job, JobId, LockToken, Stage, StageStatus};

/// Kind of a stage lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageEventKind {
    Started,
    Progress,
    Completed,
    Failed,
}

/// Event emitted on every stage transition; the sole feed for out-of-process
/// progress consumers (e.g. a server-push stream).
#[derive(Debug, Clone)]
pub struct StageEvent {
    pub job_id: JobId,
    pub queue: String,
    pub stage: String,
    pub kind: StageEventKind,
    /// 0.0 to 100.0 across all stages.
    pub overall_progress: f32,
}

/// Synchronous callback invoked on stage events.
pub type StageCallback = Arc<dyn Fn(StageEvent) + Send + Sync>;

struct StageState {
    stages: Vec<Stage>,
    current: Option<String>,
    overall: f32,
}

struct ContextInner {
    job: Job,
    token: LockToken,
    driver: DynDriver,
    state: Mutex<StageState>,
    callback: Option<StageCallback>,
}

/// Handle through which a handler reads its job and reports stage progress.
///
/// Cheap to clone; all clones share the same stage state. Every stage write
/// is persisted through the driver fenced by the claim's lock token, so a
/// handler that outlived its lock cannot corrupt a reclaimed job.
#[derive(Clone)]
pub struct JobContext {
    inner: Arc<ContextInner>,
}

impl JobContext {
    pub fn new(
        job: Job,
        token: LockToken,
        driver: DynDriver,
        callback: Option<StageCallback>,
    ) -> Self {
        let state = StageState {
            stages: job.stages.clone(),
            current: job.current_stage.clone(),
            overall: job.overall_progress,
        };
        Self {
            inner: Arc::new(ContextInner {
                job,
                token,
                driver,
                state: Mutex::new(state),
                callback,
            }),
        }
    }

    /// The claimed job, as of claim time.
    pub fn job(&self) -> &Job {
        &self.inner.job
    }

    /// The fencing token this claim holds.
    pub fn token(&self) -> &LockToken {
        &self.inner.token
    }

    /// Deserialize the opaque payload into a caller-supplied shape.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        self.inner.job.decode()
    }

    /// Declare the ordered set of named sub-phases up front.
    pub async fn init_stages(&self, names: &[&str]) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        state.stages = names.iter().copied().map(Stage::new).collect();
        state.current = None;
        state.overall = 0.0;
        self.persist(&state).await
    }

    /// Mark a stage running and make it current.
    pub async fn start_stage(&self, name: &str) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        {
            let stage = find_stage(&mut state.stages, name)?;
            stage.status = StageStatus::Running;
            stage.started_at = Some(Utc::now());
        }
        state.current = Some(name.to_string());
        state.overall = overall_progress(&state.stages);
        self.persist(&state).await?;
        self.emit(name, StageEventKind::Started, state.overall);
        Ok(())
    }

    /// Report progress within a running stage (0.0 to 100.0).
    pub async fn update_stage_progress(&self, name: &str, pct: f32) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        {
            let stage = find_stage(&mut state.stages, name)?;
            stage.progress = pct.clamp(0.0, 100.0);
        }
        state.overall = overall_progress(&state.stages);
        self.persist(&state).await?;
        self.emit(name, StageEventKind::Progress, state.overall);
        Ok(())
    }

    /// Mark a stage complete, optionally attaching produced artifacts.
    pub async fn complete_stage(&self, name: &str, artifacts: Option<Value>) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        {
            let stage = find_stage(&mut state.stages, name)?;
            stage.status = StageStatus::Completed;
            stage.progress = 100.0;
            stage.artifacts = artifacts;
            stage.completed_at = Some(Utc::now());
        }
        if state.current.as_deref() == Some(name) {
            state.current = None;
        }
        state.overall = overall_progress(&state.stages);
        self.persist(&state).await?;
        self.emit(name, StageEventKind::Completed, state.overall);
        Ok(())
    }

    /// Record a stage failure. The job-level outcome is still decided by the
    /// handler's returned error.
    pub async fn fail_stage(&self, name: &str, error: &str) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        {
            let stage = find_stage(&mut state.stages, name)?;
            stage.status = StageStatus::Failed;
            stage.error = Some(error.to_string());
            stage.completed_at = Some(Utc::now());
        }
        state.overall = overall_progress(&state.stages);
        self.persist(&state).await?;
        self.emit(name, StageEventKind::Failed, state.overall);
        Ok(())
    }

    async fn persist(&self, state: &StageState) -> Result<()> {
        let applied = self
            .inner
            .driver
            .record_progress(
                &self.inner.job.id,
                &self.inner.token,
                ProgressUpdate {
                    stages: state.stages.clone(),
                    current_stage: state.current.clone(),
                    overall_progress: state.overall,
                },
            )
            .await?;
        if !applied {
            tracing::warn!(
                job_id = %self.inner.job.id,
                "Progress write dropped, lock token is stale"
            );
        }
        Ok(())
    }

    fn emit(&self, stage: &str, kind: StageEventKind, overall: f32) {
        if let Some(callback) = &self.inner.callback {
            callback(StageEvent {
                job_id: self.inner.job.id.clone(),
                queue: self.inner.job.queue.clone(),
                stage: stage.to_string(),
                kind,
                overall_progress: overall,
            });
        }
    }
}

fn find_stage<'a>(stages: &'a mut [Stage], name: &str) -> Result<&'a mut Stage> {
    stages
        .iter_mut()
        .find(|s| s.name == name)
        .ok_or_else(|| QueueError::Config(format!("unknown stage '{}'", name)))
}

/// Average per-stage progress; completed stages count as 100.
fn overall_progress(stages: &[Stage]) -> f32 {
    if stages.is_empty() {
        return 0.0;
    }
    let sum: f32 = stages
        .iter()
        .map(|s| match s.status {
            StageStatus::Completed => 100.0,
            _ => s.progress,
        })
        .sum();
    sum / stages.len() as f32
}
