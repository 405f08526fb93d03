//! Database schema definitions.
//!
//! This module contains the row types stored in the embedded job database.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;

/// A persisted unit of deferred work.
///
/// Timestamps (`created`, `failed`, `next_valid_time`) are integer
/// milliseconds since the Unix epoch; `timeout` and `retry_delay` are
/// millisecond durations.
#[derive(Debug, Clone, FromRow)]
pub struct Job {
    /// Unique identifier (UUID v4), assigned at creation.
    pub id: String,
    /// Worker name this job routes to.
    pub name: String,
    /// JSON-encoded payload, opaque to the queue and decoded for handlers.
    pub payload: String,
    /// JSON-encoded attempt bookkeeping, managed by the queue.
    pub data: String,
    /// Scheduling priority; higher runs first.
    pub priority: i64,
    /// True while the job is claimed by a processing loop.
    pub active: bool,
    /// Per-attempt timeout in milliseconds; `0` disables the timeout.
    pub timeout: i64,
    /// Creation timestamp; breaks priority ties (earlier first).
    pub created: i64,
    /// Set once the job has exhausted its attempts; the row is kept for
    /// inspection.
    pub failed: Option<i64>,
    /// Earliest time the job may be claimed again (retry gating).
    pub next_valid_time: i64,
    /// Delay added to `next_valid_time` after each failed attempt.
    pub retry_delay: i64,
}

impl Job {
    /// Decode the handler-facing payload.
    pub fn json_payload(&self) -> Result<Value, serde_json::Error> {
        serde_json::from_str(&self.payload)
    }

    /// Decode the queue-managed attempt bookkeeping.
    pub fn job_data(&self) -> Result<JobData, serde_json::Error> {
        serde_json::from_str(&self.data)
    }
}

/// Attempt bookkeeping stored in a job's `data` column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobData {
    /// Total attempts the job is allowed.
    pub attempts: i64,
    /// Attempts that have failed so far; absent until the first failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_attempts: Option<i64>,
    /// One message per failed attempt, oldest first.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<String>>,
}

impl JobData {
    pub(crate) fn new(attempts: i64) -> Self {
        Self {
            attempts,
            failed_attempts: None,
            errors: None,
        }
    }
}
