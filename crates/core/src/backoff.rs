//! Backoff, cron, and time utilities.

use chrono::{DateTime, TimeZone, Utc};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{QueueError, Result};
use crate::job::BackoffKind;

/// Delays never grow past this horizon.
pub const MAX_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);

/// Compute the delay before the next attempt.
///
/// `attempt` is the number of attempts already consumed, so the first retry
/// passes 1. Fixed backoff is constant, linear grows by `base` per attempt,
/// exponential doubles per attempt. All results are capped at [`MAX_BACKOFF`].
pub fn backoff_delay(kind: BackoffKind, base: Duration, attempt: u32) -> Duration {
    let attempt = attempt.max(1);
    let base_ms = base.as_millis() as u64;

    let ms = match kind {
        BackoffKind::Fixed => base_ms,
        BackoffKind::Linear => base_ms.saturating_mul(attempt as u64),
        BackoffKind::Exponential => {
            let shift = (attempt - 1).min(40);
            base_ms.saturating_mul(1u64 << shift)
        }
    };

    Duration::from_millis(ms).min(MAX_BACKOFF)
}

/// Validate a cron expression without evaluating it.
pub fn validate_cron(expr: &str) -> Result<()> {
    cron::Schedule::from_str(expr)
        .map(|_| ())
        .map_err(|e| QueueError::InvalidCron(expr.to_string(), e.to_string()))
}

/// Next cron occurrence strictly after `after`, or `None` if the schedule
/// has no future occurrences.
pub fn next_cron_after(expr: &str, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
    let schedule = cron::Schedule::from_str(expr)
        .map_err(|e| QueueError::InvalidCron(expr.to_string(), e.to_string()))?;
    Ok(schedule.after(&after).next())
}

/// Unix milliseconds for storage in dialects without native timestamps.
pub fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

/// Inverse of [`to_millis`].
pub fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or_else(Utc::now)
}
