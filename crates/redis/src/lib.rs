//! Redis driver for the drudge job queue.
//!
//! List-style backend: jobs live in per-id hashes, and eligibility is
//! tracked in three per-queue sorted sets. `pending` is scored so that a
//! single `ZPOPMIN` yields the highest-priority oldest job, `delayed`
//! collapses future `scheduled_for` and retry visibility into one set
//! scored by eligible-at time, and `processing` is scored by lock expiry.
//! All post-claim writes go through Lua scripts that check the fencing
//! token before touching anything, which gives the same stale-write
//! guarantees as the relational drivers without transactions.
//!
//! Keys are built dynamically inside the scripts, so this driver assumes a
//! single Redis node (no cluster slot constraints).
//!
//! Retries are not observable as their own status here: a retrying job sits
//! in `delayed` and is reported under `pending`
//! (`durable_retry_visibility: false`). Recurring schedules are not
//! persisted (`persistent_schedules: false`).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

use drudge_core::{
    from_millis, to_millis, BackoffKind, CancelOutcome, Capabilities, ClaimedJob, Driver,
    EnqueueOutcome, FailureKind, FailureReport, Job, JobId, JobStatus, LockToken, NewJob,
    ProgressUpdate, QueueError, QueueStats, Result, Stage,
};

/// Message surfaced to the next claimant of an expired lock.
const LOCK_EXPIRED_MESSAGE: &str = "job lock expired before completion";

/// Priority spreads claims apart by ~31 years of created-at millis, so
/// ordering is priority first and age second. Kept well inside f64's exact
/// integer range.
const PRIORITY_WEIGHT: f64 = 1e12;

/// Reclaimed expired jobs sort ahead of all fresh work.
const RECLAIM_BOOST: f64 = 1e15;

mod keys {
    pub fn job(prefix: &str, id: &str) -> String {
        format!("{}:job:{}", prefix, id)
    }

    pub fn job_prefix(prefix: &str) -> String {
        format!("{}:job:", prefix)
    }

    pub fn pending(prefix: &str, queue: &str) -> String {
        format!("{}:pending:{}", prefix, queue)
    }

    pub fn delayed(prefix: &str, queue: &str) -> String {
        format!("{}:delayed:{}", prefix, queue)
    }

    pub fn processing(prefix: &str, queue: &str) -> String {
        format!("{}:processing:{}", prefix, queue)
    }

    pub fn dedupe(prefix: &str, queue: &str, key: &str) -> String {
        format!("{}:key:{}:{}", prefix, queue, key)
    }

    pub fn completed_counter(prefix: &str, queue: &str) -> String {
        format!("{}:done:{}", prefix, queue)
    }

    pub fn failed_counter(prefix: &str, queue: &str) -> String {
        format!("{}:dead:{}", prefix, queue)
    }

    pub fn queues(prefix: &str) -> String {
        format!("{}:queues", prefix)
    }
}

/// Claim ordering score: smaller pops first.
fn pending_score(created_at_ms: i64, priority: i32) -> f64 {
    created_at_ms as f64 - priority as f64 * PRIORITY_WEIGHT
}

/// Shared Lua helper reproducing [`pending_score`] from hash fields.
const SCORE_HELPER: &str = r#"
local function pending_score(jkey)
    local created = tonumber(redis.call('HGET', jkey, 'created_at_ms')) or 0
    local priority = tonumber(redis.call('HGET', jkey, 'priority')) or 0
    return created - priority * 1e12
end
local function drop_dedupe(jkey, base)
    local dkey = redis.call('HGET', jkey, 'key')
    if dkey then
        local queue = redis.call('HGET', jkey, 'queue')
        redis.call('DEL', base .. ':key:' .. queue .. ':' .. dkey)
    end
end
"#;

/// Redis driver for job queue storage.
#[derive(Clone)]
pub struct RedisDriver {
    conn: ConnectionManager,
    prefix: String,
    enqueue_script: Script,
    claim_script: Script,
    extend_script: Script,
    complete_script: Script,
    fail_script: Script,
    progress_script: Script,
    cancel_script: Script,
    resurrect_script: Script,
}

impl RedisDriver {
    /// Connect with the default `drudge` key prefix.
    pub async fn new(redis_url: &str) -> Result<Self> {
        Self::with_prefix(redis_url, "drudge").await
    }

    pub async fn with_prefix(redis_url: &str, prefix: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| QueueError::Connection(format!("Invalid Redis URL: {}", e)))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| QueueError::Connection(format!("Failed to connect to Redis: {}", e)))?;

        Ok(Self {
            conn,
            prefix: prefix.to_string(),
            enqueue_script: Script::new(ENQUEUE_LUA),
            claim_script: Script::new(&format!("{}{}", SCORE_HELPER, CLAIM_LUA)),
            extend_script: Script::new(EXTEND_LUA),
            complete_script: Script::new(&format!("{}{}", SCORE_HELPER, COMPLETE_LUA)),
            fail_script: Script::new(&format!("{}{}", SCORE_HELPER, FAIL_LUA)),
            progress_script: Script::new(PROGRESS_LUA),
            cancel_script: Script::new(&format!("{}{}", SCORE_HELPER, CANCEL_LUA)),
            resurrect_script: Script::new(&format!("{}{}", SCORE_HELPER, RESURRECT_LUA)),
        })
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }

    /// The queue a job belongs to, from its hash. `None` when the job is
    /// gone.
    async fn job_queue(&self, id: &JobId) -> Result<Option<String>> {
        let mut conn = self.conn();
        let queue: Option<String> = conn
            .hget(keys::job(&self.prefix, &id.to_string()), "queue")
            .await
            .map_err(redis_err)?;
        Ok(queue)
    }
}

fn redis_err(e: redis::RedisError) -> QueueError {
    QueueError::Driver(format!("Redis command failed: {}", e))
}

fn job_fields(job: &NewJob) -> Result<Vec<(String, String)>> {
    let mut fields = vec![
        ("id".into(), job.id.to_string()),
        ("queue".into(), job.queue.clone()),
        ("data".into(), serde_json::to_string(&job.data)?),
        ("status".into(), "pending".into()),
        ("priority".into(), job.priority.to_string()),
        ("attempts".into(), "0".into()),
        ("max_attempts".into(), job.max_attempts.to_string()),
        ("backoff_ms".into(), job.backoff_ms.to_string()),
        ("backoff_kind".into(), job.backoff_kind.as_str().into()),
        ("stages".into(), "[]".into()),
        ("overall_progress".into(), "0".into()),
        ("created_at_ms".into(), to_millis(job.created_at).to_string()),
        ("updated_at_ms".into(), to_millis(job.created_at).to_string()),
    ];
    if let Some(key) = &job.key {
        fields.push(("key".into(), key.clone()));
    }
    if let Some(at) = job.scheduled_for {
        fields.push(("scheduled_for_ms".into(), to_millis(at).to_string()));
    }
    if let Some(metadata) = &job.metadata {
        fields.push(("metadata".into(), serde_json::to_string(metadata)?));
    }
    Ok(fields)
}

fn map_to_job(map: HashMap<String, String>) -> Result<Job> {
    let bad = |field: &str| QueueError::Driver(format!("Job hash missing field '{}'", field));
    let req = |field: &str| map.get(field).cloned().ok_or_else(|| bad(field));
    let opt_ms = |field: &str| -> Result<Option<DateTime<Utc>>> {
        map.get(field)
            .map(|v| {
                v.parse::<i64>()
                    .map(from_millis)
                    .map_err(|e| QueueError::Driver(format!("Bad '{}' field: {}", field, e)))
            })
            .transpose()
    };
    let num = |field: &str| -> Result<i64> {
        req(field)?
            .parse::<i64>()
            .map_err(|e| QueueError::Driver(format!("Bad '{}' field: {}", field, e)))
    };

    Ok(Job {
        id: JobId::parse(&req("id")?)?,
        queue: req("queue")?,
        key: map.get("key").cloned(),
        data: serde_json::from_str(&req("data")?)?,
        status: JobStatus::parse(&req("status")?)?,
        priority: num("priority")? as i32,
        scheduled_for: opt_ms("scheduled_for_ms")?,
        attempts: num("attempts")? as u32,
        max_attempts: num("max_attempts")? as u32,
        next_retry_at: opt_ms("next_retry_at_ms")?,
        backoff_ms: num("backoff_ms")? as u64,
        backoff_kind: BackoffKind::parse(&req("backoff_kind")?)?,
        locked_by: map.get("locked_by").cloned(),
        locked_at: opt_ms("locked_at_ms")?,
        expires_at: opt_ms("expires_at_ms")?,
        lock_token: map
            .get("lock_token")
            .map(|t| Uuid::parse_str(t))
            .transpose()
            .map_err(|e| QueueError::Driver(format!("Bad lock token: {}", e)))?
            .map(LockToken),
        error_message: map.get("error_message").cloned(),
        error_details: map
            .get("error_details")
            .map(|d| serde_json::from_str(d))
            .transpose()?,
        stages: serde_json::from_str::<Vec<Stage>>(&req("stages")?)?,
        current_stage: map.get("current_stage").cloned(),
        overall_progress: req("overall_progress")?
            .parse::<f32>()
            .map_err(|e| QueueError::Driver(format!("Bad 'overall_progress' field: {}", e)))?,
        metadata: map
            .get("metadata")
            .map(|m| serde_json::from_str(m))
            .transpose()?,
        created_at: from_millis(num("created_at_ms")?),
        updated_at: from_millis(num("updated_at_ms")?),
        completed_at: opt_ms("completed_at_ms")?,
    })
}

// KEYS: dedupe, job, pending, delayed, queues set.
// ARGV: use_key flag, id, pending score, delayed eligible-at ms
//       (0 = immediate), queue, job prefix, then hash field/value pairs.
// Dedupe check and job creation are one atomic step, so two producers
// racing on the same key can never both create a live job. Returns the
// live holder's id on a key collision, false after creating.
const ENQUEUE_LUA: &str = r#"
if ARGV[1] == '1' then
    local existing = redis.call('GET', KEYS[1])
    if existing then
        local status = redis.call('HGET', ARGV[6] .. existing, 'status')
        if status and status ~= 'completed' and status ~= 'failed' then
            return existing
        end
    end
    redis.call('SET', KEYS[1], ARGV[2])
end
for i = 7, #ARGV, 2 do
    redis.call('HSET', KEYS[2], ARGV[i], ARGV[i + 1])
end
local at = tonumber(ARGV[4])
if at > 0 then
    redis.call('ZADD', KEYS[4], at, ARGV[2])
else
    redis.call('ZADD', KEYS[3], tonumber(ARGV[3]), ARGV[2])
end
redis.call('SADD', KEYS[5], ARGV[5])
return false
"#;

// KEYS: pending, delayed, processing, failed counter.
// ARGV: now_ms, worker_id, token, expires_ms, job prefix, base prefix,
//       lock-expired message.
// Returns the claimed job id, or false when the queue is drained.
const CLAIM_LUA: &str = r#"
local now = tonumber(ARGV[1])
local jp = ARGV[5]

local due = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', now, 'LIMIT', 0, 100)
for _, id in ipairs(due) do
    redis.call('ZREM', KEYS[2], id)
    if redis.call('EXISTS', jp .. id) == 1 then
        redis.call('ZADD', KEYS[1], pending_score(jp .. id), id)
    end
end

local expired = redis.call('ZRANGEBYSCORE', KEYS[3], '-inf', now, 'LIMIT', 0, 100)
for _, id in ipairs(expired) do
    redis.call('ZREM', KEYS[3], id)
    local jkey = jp .. id
    if redis.call('EXISTS', jkey) == 1 then
        redis.call('HDEL', jkey, 'locked_by', 'locked_at_ms', 'expires_at_ms', 'lock_token')
        redis.call('HSET', jkey, 'error_message', ARGV[7], 'updated_at_ms', now)
        local attempts = tonumber(redis.call('HGET', jkey, 'attempts')) or 0
        local max_attempts = tonumber(redis.call('HGET', jkey, 'max_attempts')) or 0
        if attempts < max_attempts then
            redis.call('HSET', jkey, 'status', 'pending')
            redis.call('ZADD', KEYS[1], pending_score(jkey) - 1e15, id)
        else
            redis.call('HSET', jkey, 'status', 'failed', 'completed_at_ms', now)
            redis.call('INCR', KEYS[4])
            drop_dedupe(jkey, ARGV[6])
        end
    end
end

local popped = redis.call('ZPOPMIN', KEYS[1])
if #popped == 0 then
    return false
end
local id = popped[1]
local jkey = jp .. id
if redis.call('EXISTS', jkey) == 0 then
    return false
end
redis.call('HSET', jkey, 'status', 'processing',
    'locked_by', ARGV[2], 'locked_at_ms', now,
    'expires_at_ms', ARGV[4], 'lock_token', ARGV[3], 'updated_at_ms', now)
redis.call('HINCRBY', jkey, 'attempts', 1)
redis.call('ZADD', KEYS[3], tonumber(ARGV[4]), id)
return id
"#;

// KEYS: job, processing. ARGV: token, until_ms, now_ms.
const EXTEND_LUA: &str = r#"
if redis.call('HGET', KEYS[1], 'lock_token') ~= ARGV[1] then return 0 end
if redis.call('HGET', KEYS[1], 'status') ~= 'processing' then return 0 end
redis.call('HSET', KEYS[1], 'expires_at_ms', ARGV[2], 'updated_at_ms', ARGV[3])
redis.call('ZADD', KEYS[2], tonumber(ARGV[2]), redis.call('HGET', KEYS[1], 'id'))
return 1
"#;

// KEYS: job, processing, completed counter. ARGV: token, now_ms, base prefix.
const COMPLETE_LUA: &str = r#"
if redis.call('HGET', KEYS[1], 'lock_token') ~= ARGV[1] then return 0 end
if redis.call('HGET', KEYS[1], 'status') ~= 'processing' then return 0 end
redis.call('ZREM', KEYS[2], redis.call('HGET', KEYS[1], 'id'))
redis.call('HSET', KEYS[1], 'status', 'completed',
    'completed_at_ms', ARGV[2], 'updated_at_ms', ARGV[2], 'overall_progress', '100')
redis.call('HDEL', KEYS[1], 'locked_by', 'locked_at_ms', 'expires_at_ms', 'lock_token')
redis.call('INCR', KEYS[3])
drop_dedupe(KEYS[1], ARGV[3])
return 1
"#;

// KEYS: job, processing, pending, delayed, failed counter.
// ARGV: token, kind, at_ms (0 = immediate), message, details json ('' = none),
//       now_ms, base prefix.
const FAIL_LUA: &str = r#"
if redis.call('HGET', KEYS[1], 'lock_token') ~= ARGV[1] then return 0 end
if redis.call('HGET', KEYS[1], 'status') ~= 'processing' then return 0 end
local id = redis.call('HGET', KEYS[1], 'id')
redis.call('ZREM', KEYS[2], id)
redis.call('HDEL', KEYS[1], 'locked_by', 'locked_at_ms', 'expires_at_ms', 'lock_token')
redis.call('HSET', KEYS[1], 'error_message', ARGV[4], 'updated_at_ms', ARGV[6])
if ARGV[5] ~= '' then
    redis.call('HSET', KEYS[1], 'error_details', ARGV[5])
end
local at = tonumber(ARGV[3])
if ARGV[2] == 'retry' then
    redis.call('HSET', KEYS[1], 'status', 'pending', 'next_retry_at_ms', ARGV[3])
    redis.call('ZADD', KEYS[4], at, id)
elseif ARGV[2] == 'discard' then
    redis.call('HSET', KEYS[1], 'status', 'failed', 'completed_at_ms', ARGV[6])
    redis.call('INCR', KEYS[5])
    drop_dedupe(KEYS[1], ARGV[7])
else
    local attempts = tonumber(redis.call('HGET', KEYS[1], 'attempts')) or 0
    if attempts > 0 then
        redis.call('HSET', KEYS[1], 'attempts', attempts - 1)
    end
    redis.call('HSET', KEYS[1], 'status', 'pending')
    if at > 0 then
        redis.call('HSET', KEYS[1], 'scheduled_for_ms', ARGV[3])
        redis.call('ZADD', KEYS[4], at, id)
    else
        redis.call('ZADD', KEYS[3], pending_score(KEYS[1]), id)
    end
end
return 1
"#;

// KEYS: job. ARGV: token, stages json, overall, current stage ('' = none),
//       now_ms.
const PROGRESS_LUA: &str = r#"
if redis.call('HGET', KEYS[1], 'lock_token') ~= ARGV[1] then return 0 end
if redis.call('HGET', KEYS[1], 'status') ~= 'processing' then return 0 end
redis.call('HSET', KEYS[1], 'stages', ARGV[2],
    'overall_progress', ARGV[3], 'updated_at_ms', ARGV[5])
if ARGV[4] == '' then
    redis.call('HDEL', KEYS[1], 'current_stage')
else
    redis.call('HSET', KEYS[1], 'current_stage', ARGV[4])
end
return 1
"#;

// KEYS: job, pending, delayed, failed counter. ARGV: now_ms, base prefix.
// Returns 0 not found, 1 cancelled, 2 already finished, 3 already claimed.
const CANCEL_LUA: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then return 0 end
local status = redis.call('HGET', KEYS[1], 'status')
if status == 'completed' or status == 'failed' then return 2 end
if status ~= 'pending' then return 3 end
local id = redis.call('HGET', KEYS[1], 'id')
redis.call('ZREM', KEYS[2], id)
redis.call('ZREM', KEYS[3], id)
redis.call('HSET', KEYS[1], 'status', 'failed', 'error_message', 'cancelled',
    'error_details', '{"cancelled":true}',
    'completed_at_ms', ARGV[1], 'updated_at_ms', ARGV[1])
redis.call('INCR', KEYS[4])
drop_dedupe(KEYS[1], ARGV[2])
return 1
"#;

// KEYS: job, pending, failed counter. ARGV: now_ms, base prefix.
const RESURRECT_LUA: &str = r#"
if redis.call('HGET', KEYS[1], 'status') ~= 'failed' then return 0 end
redis.call('HSET', KEYS[1], 'status', 'pending', 'attempts', '0', 'updated_at_ms', ARGV[1])
redis.call('HDEL', KEYS[1], 'error_message', 'error_details',
    'next_retry_at_ms', 'scheduled_for_ms', 'completed_at_ms')
local id = redis.call('HGET', KEYS[1], 'id')
redis.call('ZADD', KEYS[2], pending_score(KEYS[1]), id)
redis.call('DECR', KEYS[3])
local dkey = redis.call('HGET', KEYS[1], 'key')
if dkey then
    local queue = redis.call('HGET', KEYS[1], 'queue')
    -- NX: a newer live holder keeps the key
    redis.call('SET', ARGV[2] .. ':key:' .. queue .. ':' .. dkey, id, 'NX')
end
return 1
"#;

#[async_trait]
impl Driver for RedisDriver {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            skip_locked: true,
            notify: false,
            jsonb: false,
            persistent_schedules: false,
            durable_retry_visibility: false,
        }
    }

    async fn enqueue(&self, job: NewJob) -> Result<EnqueueOutcome> {
        let mut conn = self.conn();
        let id = job.id.clone();

        // The dedupe key is only read when the job carries one; an empty
        // placeholder keeps the script's key list fixed.
        let dedupe_key = keys::dedupe(&self.prefix, &job.queue, job.key.as_deref().unwrap_or(""));
        let delayed_ms = match job.scheduled_for {
            Some(at) if at > job.created_at => to_millis(at),
            _ => 0,
        };

        let mut invocation = self.enqueue_script.prepare_invoke();
        invocation
            .key(dedupe_key)
            .key(keys::job(&self.prefix, &id.to_string()))
            .key(keys::pending(&self.prefix, &job.queue))
            .key(keys::delayed(&self.prefix, &job.queue))
            .key(keys::queues(&self.prefix))
            .arg(if job.key.is_some() { "1" } else { "0" })
            .arg(id.to_string())
            .arg(pending_score(to_millis(job.created_at), job.priority))
            .arg(delayed_ms)
            .arg(&job.queue)
            .arg(keys::job_prefix(&self.prefix));
        for (field, value) in job_fields(&job)? {
            invocation.arg(field).arg(value);
        }

        let existing: Option<String> =
            invocation.invoke_async(&mut conn).await.map_err(redis_err)?;
        match existing {
            Some(existing) => Ok(EnqueueOutcome::Deduplicated(JobId::parse(&existing)?)),
            None => Ok(EnqueueOutcome::Created(id)),
        }
    }

    async fn claim(
        &self,
        queue: &str,
        worker_id: &str,
        lock_duration: Duration,
    ) -> Result<Option<ClaimedJob>> {
        let mut conn = self.conn();
        let now = Utc::now();
        let token = LockToken::mint();
        let expires_ms =
            to_millis(now + chrono::Duration::from_std(lock_duration).unwrap_or_default());

        let id: Option<String> = self
            .claim_script
            .key(keys::pending(&self.prefix, queue))
            .key(keys::delayed(&self.prefix, queue))
            .key(keys::processing(&self.prefix, queue))
            .key(keys::failed_counter(&self.prefix, queue))
            .arg(to_millis(now))
            .arg(worker_id)
            .arg(token.to_string())
            .arg(expires_ms)
            .arg(keys::job_prefix(&self.prefix))
            .arg(&self.prefix)
            .arg(LOCK_EXPIRED_MESSAGE)
            .invoke_async(&mut conn)
            .await
            .map_err(redis_err)?;

        let id = match id {
            Some(id) => id,
            None => return Ok(None),
        };

        let map: HashMap<String, String> = conn
            .hgetall(keys::job(&self.prefix, &id))
            .await
            .map_err(redis_err)?;
        if map.is_empty() {
            // The hash was deleted between the pop and the read.
            tracing::warn!(queue = %queue, job_id = %id, "Claimed job hash vanished");
            return Ok(None);
        }
        Ok(Some(ClaimedJob {
            job: map_to_job(map)?,
            token,
        }))
    }

    async fn extend_lock(
        &self,
        id: &JobId,
        token: &LockToken,
        until: DateTime<Utc>,
    ) -> Result<bool> {
        let queue = match self.job_queue(id).await? {
            Some(queue) => queue,
            None => return Ok(false),
        };
        let mut conn = self.conn();
        let applied: i64 = self
            .extend_script
            .key(keys::job(&self.prefix, &id.to_string()))
            .key(keys::processing(&self.prefix, &queue))
            .arg(token.to_string())
            .arg(to_millis(until))
            .arg(to_millis(Utc::now()))
            .invoke_async(&mut conn)
            .await
            .map_err(redis_err)?;
        Ok(applied == 1)
    }

    async fn complete(&self, id: &JobId, token: &LockToken) -> Result<bool> {
        let queue = match self.job_queue(id).await? {
            Some(queue) => queue,
            None => return Ok(false),
        };
        let mut conn = self.conn();
        let applied: i64 = self
            .complete_script
            .key(keys::job(&self.prefix, &id.to_string()))
            .key(keys::processing(&self.prefix, &queue))
            .key(keys::completed_counter(&self.prefix, &queue))
            .arg(token.to_string())
            .arg(to_millis(Utc::now()))
            .arg(&self.prefix)
            .invoke_async(&mut conn)
            .await
            .map_err(redis_err)?;
        Ok(applied == 1)
    }

    async fn fail(&self, id: &JobId, token: &LockToken, report: FailureReport) -> Result<bool> {
        let queue = match self.job_queue(id).await? {
            Some(queue) => queue,
            None => return Ok(false),
        };

        let (kind, at_ms) = match report.kind {
            FailureKind::Retry { at } => ("retry", to_millis(at)),
            FailureKind::Discard => ("discard", 0),
            FailureKind::Requeue { at } => ("requeue", at.map(to_millis).unwrap_or(0)),
        };
        let details = report
            .details
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?
            .unwrap_or_default();

        let mut conn = self.conn();
        let applied: i64 = self
            .fail_script
            .key(keys::job(&self.prefix, &id.to_string()))
            .key(keys::processing(&self.prefix, &queue))
            .key(keys::pending(&self.prefix, &queue))
            .key(keys::delayed(&self.prefix, &queue))
            .key(keys::failed_counter(&self.prefix, &queue))
            .arg(token.to_string())
            .arg(kind)
            .arg(at_ms)
            .arg(&report.message)
            .arg(details)
            .arg(to_millis(Utc::now()))
            .arg(&self.prefix)
            .invoke_async(&mut conn)
            .await
            .map_err(redis_err)?;
        Ok(applied == 1)
    }

    async fn record_progress(
        &self,
        id: &JobId,
        token: &LockToken,
        update: ProgressUpdate,
    ) -> Result<bool> {
        let mut conn = self.conn();
        let applied: i64 = self
            .progress_script
            .key(keys::job(&self.prefix, &id.to_string()))
            .arg(token.to_string())
            .arg(serde_json::to_string(&update.stages)?)
            .arg(update.overall_progress)
            .arg(update.current_stage.unwrap_or_default())
            .arg(to_millis(Utc::now()))
            .invoke_async(&mut conn)
            .await
            .map_err(redis_err)?;
        Ok(applied == 1)
    }

    async fn get_job(&self, id: &JobId) -> Result<Option<Job>> {
        let mut conn = self.conn();
        let map: HashMap<String, String> = conn
            .hgetall(keys::job(&self.prefix, &id.to_string()))
            .await
            .map_err(redis_err)?;
        if map.is_empty() {
            return Ok(None);
        }
        Ok(Some(map_to_job(map)?))
    }

    async fn cancel(&self, id: &JobId) -> Result<CancelOutcome> {
        let queue = match self.job_queue(id).await? {
            Some(queue) => queue,
            None => return Ok(CancelOutcome::NotFound),
        };
        let mut conn = self.conn();
        let code: i64 = self
            .cancel_script
            .key(keys::job(&self.prefix, &id.to_string()))
            .key(keys::pending(&self.prefix, &queue))
            .key(keys::delayed(&self.prefix, &queue))
            .key(keys::failed_counter(&self.prefix, &queue))
            .arg(to_millis(Utc::now()))
            .arg(&self.prefix)
            .invoke_async(&mut conn)
            .await
            .map_err(redis_err)?;
        Ok(match code {
            1 => CancelOutcome::Cancelled,
            2 => CancelOutcome::AlreadyFinished,
            3 => CancelOutcome::AlreadyClaimed,
            _ => CancelOutcome::NotFound,
        })
    }

    async fn resurrect(&self, id: &JobId) -> Result<bool> {
        let queue = match self.job_queue(id).await? {
            Some(queue) => queue,
            None => return Ok(false),
        };
        let mut conn = self.conn();
        let applied: i64 = self
            .resurrect_script
            .key(keys::job(&self.prefix, &id.to_string()))
            .key(keys::pending(&self.prefix, &queue))
            .key(keys::failed_counter(&self.prefix, &queue))
            .arg(to_millis(Utc::now()))
            .arg(&self.prefix)
            .invoke_async(&mut conn)
            .await
            .map_err(redis_err)?;
        Ok(applied == 1)
    }

    async fn stats(&self, queue: Option<&str>) -> Result<QueueStats> {
        let mut conn = self.conn();
        let queues: Vec<String> = match queue {
            Some(queue) => vec![queue.to_string()],
            None => conn
                .smembers(keys::queues(&self.prefix))
                .await
                .map_err(redis_err)?,
        };

        let mut stats = QueueStats::default();
        for queue in &queues {
            let (pending, delayed, processing, completed, failed): (
                u64,
                u64,
                u64,
                Option<u64>,
                Option<u64>,
            ) = redis::pipe()
                .zcard(keys::pending(&self.prefix, queue))
                .zcard(keys::delayed(&self.prefix, queue))
                .zcard(keys::processing(&self.prefix, queue))
                .get(keys::completed_counter(&self.prefix, queue))
                .get(keys::failed_counter(&self.prefix, queue))
                .query_async(&mut conn)
                .await
                .map_err(redis_err)?;

            // Delayed covers both future-scheduled and retrying jobs; both
            // are reported under pending here.
            stats.pending += pending + delayed;
            stats.processing += processing;
            stats.completed += completed.unwrap_or(0);
            stats.failed += failed.unwrap_or(0);
        }
        Ok(stats)
    }

    async fn next_wakeup(&self, queue: &str) -> Result<Option<DateTime<Utc>>> {
        let mut conn = self.conn();
        let now_ms = to_millis(Utc::now());

        let mut earliest: Option<i64> = None;
        for key in [
            keys::delayed(&self.prefix, queue),
            keys::processing(&self.prefix, queue),
        ] {
            let entries: Vec<(String, i64)> = redis::cmd("ZRANGEBYSCORE")
                .arg(&key)
                .arg(format!("({}", now_ms))
                .arg("+inf")
                .arg("WITHSCORES")
                .arg("LIMIT")
                .arg(0)
                .arg(1)
                .query_async(&mut conn)
                .await
                .map_err(redis_err)?;
            if let Some((_, score)) = entries.first() {
                earliest = Some(earliest.map_or(*score, |e| e.min(*score)));
            }
        }
        Ok(earliest.map(from_millis))
    }
}
