/*!
 * # Capture Queue
 *
 * Durable delayed-job queue contract used to defer payment capture. Every
 * order owns at most one job at a time: the job id is derived from the order
 * id, so re-scheduling must cancel the pending job before adding a new one.
 *
 * Job lifecycle:
 *
 * ```text
 * schedule ──► delayed ──(due)──► active ──► completed (removed)
 *    │            │                  │
 *    │         cancel             fail ──► delayed (retry) | failed
 *    └─ delay 0 ─► waiting ──────────┘
 * ```
 */

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use strum::{Display, EnumString};
use thiserror::Error;

/// Default number of attempts a capture job gets before it is parked as failed.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default linear backoff step between attempts.
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 5_000;

/// Capture queue errors
#[derive(Error, Debug)]
pub enum QueueError {
    /// No backend is configured; callers decide whether that is fatal.
    #[error("Capture queue backend is not configured")]
    NotConfigured,
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Capture job {job_id} already exists in state {state}")]
    DuplicateJob { job_id: String, state: JobState },
}

impl QueueError {
    /// True for broker hiccups worth retrying, as opposed to configuration
    /// or contract errors.
    pub fn is_transient(&self) -> bool {
        matches!(self, QueueError::Connection(_) | QueueError::Redis(_))
    }
}

/// Why a capture job was enqueued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobSource {
    /// Scheduled at checkout, fires when the editing window closes.
    Normal,
    /// Enqueued on early fulfillment with zero delay.
    Immediate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobState {
    Delayed,
    Waiting,
    Active,
    Completed,
    Failed,
}

impl JobState {
    /// Pending jobs have not been picked up by a worker and can be cancelled.
    pub fn is_pending(&self) -> bool {
        matches!(self, JobState::Delayed | JobState::Waiting)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureJob {
    pub id: String,
    pub order_id: String,
    pub payment_intent_id: String,
    /// Epoch milliseconds at enqueue time.
    pub scheduled_at: i64,
    /// Epoch milliseconds at which the job becomes executable.
    pub run_at: i64,
    pub delay_ms: u64,
    pub source: JobSource,
    pub state: JobState,
    pub attempts: u32,
    pub max_attempts: u32,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl CaptureJob {
    pub fn new(
        order_id: &str,
        payment_intent_id: &str,
        delay_ms: u64,
        options: &ScheduleOptions,
        now_ms: i64,
    ) -> Self {
        let delay = i64::try_from(delay_ms).unwrap_or(i64::MAX);
        Self {
            id: capture_job_id(order_id),
            order_id: order_id.to_string(),
            payment_intent_id: payment_intent_id.to_string(),
            scheduled_at: now_ms,
            run_at: now_ms.saturating_add(delay),
            delay_ms,
            source: options.source,
            state: if delay_ms == 0 {
                JobState::Waiting
            } else {
                JobState::Delayed
            },
            attempts: 0,
            max_attempts: options.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS).max(1),
            last_error: None,
        }
    }

    pub fn idempotency_key(&self) -> String {
        capture_idempotency_key(&self.order_id, &self.payment_intent_id)
    }

    /// Order lock holder for the current attempt. Every claim bumps
    /// `attempts`, so a retry or a stall recovery never shares a holder with
    /// the attempt it replaced.
    pub fn lock_holder(&self) -> String {
        format!("{}:{}", self.id, self.attempts)
    }

    pub fn attempts_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleOptions {
    pub source: JobSource,
    /// Overrides the queue's default attempt budget.
    pub max_attempts: Option<u32>,
}

impl ScheduleOptions {
    pub fn normal() -> Self {
        Self {
            source: JobSource::Normal,
            max_attempts: None,
        }
    }

    pub fn immediate() -> Self {
        Self {
            source: JobSource::Immediate,
            max_attempts: None,
        }
    }
}

impl Default for ScheduleOptions {
    fn default() -> Self {
        Self::normal()
    }
}

/// Outcome of reporting a failed attempt back to the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobDisposition {
    /// Job was re-delayed and becomes due again at `run_at`.
    Retrying { run_at: i64 },
    /// Attempt budget exhausted; job parked in the failed set.
    Failed,
}

/// Retry policy shared by queue backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    /// Linear backoff: the n-th retry waits n * backoff.
    pub fn next_run_at(&self, attempts: u32, now_ms: i64) -> i64 {
        let step = i64::try_from(self.backoff.as_millis()).unwrap_or(i64::MAX);
        now_ms.saturating_add(step.saturating_mul(i64::from(attempts.max(1))))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: Duration::from_millis(DEFAULT_RETRY_BACKOFF_MS),
        }
    }
}

/// Delayed-job queue holding at most one capture job per order.
#[async_trait]
pub trait CaptureQueue: Send + Sync {
    /// Enqueues a capture job for `order_id`.
    ///
    /// Fails with [`QueueError::DuplicateJob`] when the order already has a
    /// job; callers re-scheduling must [`cancel`](Self::cancel) first.
    async fn schedule(
        &self,
        order_id: &str,
        payment_intent_id: &str,
        delay_ms: u64,
        options: ScheduleOptions,
    ) -> Result<CaptureJob, QueueError>;

    /// Removes the order's pending job. Returns `false` when there was no
    /// pending job, including when the job is already active.
    async fn cancel(&self, order_id: &str) -> Result<bool, QueueError>;

    async fn get_job(&self, order_id: &str) -> Result<Option<CaptureJob>, QueueError>;

    /// Claims up to `limit` due jobs, marking them active.
    async fn reserve_due(&self, limit: usize) -> Result<Vec<CaptureJob>, QueueError>;

    /// Marks an active job done and frees the order's job id.
    async fn complete(&self, job: &CaptureJob) -> Result<(), QueueError>;

    async fn fail(&self, job: &CaptureJob, reason: &str) -> Result<JobDisposition, QueueError>;

    /// Returns active jobs claimed longer than `stalled_for` ago to the
    /// delayed index. Returns the number of jobs recovered.
    async fn recover_stalled(&self, stalled_for: Duration) -> Result<usize, QueueError>;
}

/// Deterministic job id; one job per order.
pub fn capture_job_id(order_id: &str) -> String {
    format!("capture:{}", order_id)
}

/// Idempotency key handed to the payment gateway for a capture.
pub fn capture_idempotency_key(order_id: &str, payment_intent_id: &str) -> String {
    format!("capture_{}_{}", order_id, payment_intent_id)
}

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
