/*!
 * # Redis Capture Queue
 *
 * Durable backend for [`CaptureQueue`]. Layout under the configured
 * namespace:
 *
 * - `{ns}:job:{job_id}`: JSON-encoded [`CaptureJob`]
 * - `{ns}:delayed`: sorted set of pending job ids scored by `run_at`
 * - `{ns}:active`: sorted set of claimed job ids scored by claim time
 * - `{ns}:failed`: list of JSON-encoded jobs that exhausted their attempts
 *
 * Schedule, cancel and claim run as Lua scripts so the one-job-per-order
 * invariant and "only pending jobs can be cancelled" hold across workers.
 */

use async_trait::async_trait;
use lazy_static::lazy_static;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use super::queue::{
    capture_job_id, now_ms, CaptureJob, CaptureQueue, JobDisposition, JobState, QueueError,
    RetryPolicy, ScheduleOptions,
};

pub const DEFAULT_NAMESPACE: &str = "capture";

lazy_static! {
    static ref SCHEDULE_SCRIPT: Script = Script::new(
        r#"
        local existing = redis.call('GET', KEYS[1])
        if existing then
            return existing
        end
        redis.call('SET', KEYS[1], ARGV[1])
        redis.call('ZADD', KEYS[2], ARGV[2], ARGV[3])
        return false
        "#
    );
    static ref CANCEL_SCRIPT: Script = Script::new(
        r#"
        if redis.call('ZREM', KEYS[1], ARGV[1]) == 1 then
            redis.call('DEL', KEYS[2])
            return 1
        end
        return 0
        "#
    );
    static ref RESERVE_SCRIPT: Script = Script::new(
        r#"
        local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, tonumber(ARGV[2]))
        for _, id in ipairs(ids) do
            redis.call('ZREM', KEYS[1], id)
            redis.call('ZADD', KEYS[2], ARGV[1], id)
        end
        return ids
        "#
    );
    static ref RECOVER_SCRIPT: Script = Script::new(
        r#"
        local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
        for _, id in ipairs(ids) do
            redis.call('ZREM', KEYS[1], id)
            redis.call('ZADD', KEYS[2], ARGV[2], id)
        end
        return ids
        "#
    );
}

#[derive(Clone)]
pub struct RedisCaptureQueue {
    conn: ConnectionManager,
    namespace: String,
    retry: RetryPolicy,
}

impl std::fmt::Debug for RedisCaptureQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCaptureQueue")
            .field("namespace", &self.namespace)
            .field("retry", &self.retry)
            .finish()
    }
}

impl RedisCaptureQueue {
    /// Connects to the queue backend at `redis_url`.
    ///
    /// A missing or blank URL yields [`QueueError::NotConfigured`] so the
    /// loader can treat the feature as disabled instead of crashing.
    pub async fn connect(
        redis_url: Option<&str>,
        namespace: impl Into<String>,
        retry: RetryPolicy,
    ) -> Result<Self, QueueError> {
        let url = redis_url
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .ok_or(QueueError::NotConfigured)?;

        let client = redis::Client::open(url)
            .map_err(|e| QueueError::Connection(format!("invalid redis url: {}", e)))?;
        Self::from_client(Arc::new(client), namespace, retry).await
    }

    pub async fn from_client(
        client: Arc<redis::Client>,
        namespace: impl Into<String>,
        retry: RetryPolicy,
    ) -> Result<Self, QueueError> {
        let conn = ConnectionManager::new((*client).clone())
            .await
            .map_err(|e| QueueError::Connection(e.to_string()))?;
        let namespace = namespace.into();
        info!(namespace = %namespace, "Connected Redis capture queue");
        Ok(Self {
            conn,
            namespace,
            retry,
        })
    }

    pub async fn ping(&self) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        redis::cmd("PING").query_async::<_, String>(&mut conn).await?;
        Ok(())
    }

    fn job_key(&self, job_id: &str) -> String {
        format!("{}:job:{}", self.namespace, job_id)
    }

    fn delayed_key(&self) -> String {
        format!("{}:delayed", self.namespace)
    }

    fn active_key(&self) -> String {
        format!("{}:active", self.namespace)
    }

    fn failed_key(&self) -> String {
        format!("{}:failed", self.namespace)
    }

    /// Rewrites stored jobs for `ids` into `state`, returning the updated jobs.
    async fn transition(
        &self,
        ids: &[String],
        state: JobState,
        claim: bool,
    ) -> Result<Vec<CaptureJob>, QueueError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let keys: Vec<String> = ids.iter().map(|id| self.job_key(id)).collect();
        let raw: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&keys)
            .query_async(&mut conn)
            .await?;

        let mut jobs = Vec::with_capacity(ids.len());
        let mut pipe = redis::pipe();
        pipe.atomic();
        for (id, raw) in ids.iter().zip(raw) {
            let Some(raw) = raw else {
                // Index entry without a payload; drop it.
                warn!(job_id = %id, "capture job payload missing, discarding index entry");
                pipe.zrem(self.active_key(), id)
                    .ignore()
                    .zrem(self.delayed_key(), id)
                    .ignore();
                continue;
            };
            let mut job: CaptureJob = serde_json::from_str(&raw)?;
            job.state = state;
            if claim {
                job.attempts += 1;
            }
            pipe.set(self.job_key(id), serde_json::to_string(&job)?)
                .ignore();
            jobs.push(job);
        }
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(jobs)
    }
}

#[async_trait]
impl CaptureQueue for RedisCaptureQueue {
    #[instrument(skip(self, options), fields(source = %options.source))]
    async fn schedule(
        &self,
        order_id: &str,
        payment_intent_id: &str,
        delay_ms: u64,
        mut options: ScheduleOptions,
    ) -> Result<CaptureJob, QueueError> {
        options.max_attempts.get_or_insert(self.retry.max_attempts);
        let job = CaptureJob::new(order_id, payment_intent_id, delay_ms, &options, now_ms());
        let payload = serde_json::to_string(&job)?;

        let mut conn = self.conn.clone();
        let existing: Option<String> = SCHEDULE_SCRIPT
            .key(self.job_key(&job.id))
            .key(self.delayed_key())
            .arg(payload)
            .arg(job.run_at)
            .arg(&job.id)
            .invoke_async(&mut conn)
            .await?;

        if let Some(existing) = existing {
            let existing: CaptureJob = serde_json::from_str(&existing)?;
            return Err(QueueError::DuplicateJob {
                job_id: existing.id,
                state: existing.state,
            });
        }

        debug!(job_id = %job.id, run_at = job.run_at, "capture job scheduled");
        Ok(job)
    }

    #[instrument(skip(self))]
    async fn cancel(&self, order_id: &str) -> Result<bool, QueueError> {
        let job_id = capture_job_id(order_id);
        let mut conn = self.conn.clone();
        let removed: i32 = CANCEL_SCRIPT
            .key(self.delayed_key())
            .key(self.job_key(&job_id))
            .arg(&job_id)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed == 1)
    }

    async fn get_job(&self, order_id: &str) -> Result<Option<CaptureJob>, QueueError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(self.job_key(&capture_job_id(order_id))).await?;
        raw.map(|raw| serde_json::from_str(&raw).map_err(QueueError::from))
            .transpose()
    }

    async fn reserve_due(&self, limit: usize) -> Result<Vec<CaptureJob>, QueueError> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = RESERVE_SCRIPT
            .key(self.delayed_key())
            .key(self.active_key())
            .arg(now_ms())
            .arg(limit)
            .invoke_async(&mut conn)
            .await?;
        self.transition(&ids, JobState::Active, true).await
    }

    async fn complete(&self, job: &CaptureJob) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .del(self.job_key(&job.id))
            .ignore()
            .zrem(self.active_key(), &job.id)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn fail(&self, job: &CaptureJob, reason: &str) -> Result<JobDisposition, QueueError> {
        let mut conn = self.conn.clone();
        let mut job = job.clone();
        job.last_error = Some(reason.to_string());

        if job.attempts_exhausted() {
            job.state = JobState::Failed;
            redis::pipe()
                .atomic()
                .rpush(self.failed_key(), serde_json::to_string(&job)?)
                .ignore()
                .del(self.job_key(&job.id))
                .ignore()
                .zrem(self.active_key(), &job.id)
                .ignore()
                .query_async::<_, ()>(&mut conn)
                .await?;
            return Ok(JobDisposition::Failed);
        }

        job.state = JobState::Delayed;
        job.run_at = self.retry.next_run_at(job.attempts, now_ms());
        redis::pipe()
            .atomic()
            .set(self.job_key(&job.id), serde_json::to_string(&job)?)
            .ignore()
            .zrem(self.active_key(), &job.id)
            .ignore()
            .zadd(self.delayed_key(), &job.id, job.run_at)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(JobDisposition::Retrying { run_at: job.run_at })
    }

    async fn recover_stalled(&self, stalled_for: Duration) -> Result<usize, QueueError> {
        let now = now_ms();
        let cutoff = now - i64::try_from(stalled_for.as_millis()).unwrap_or(i64::MAX);
        let mut conn = self.conn.clone();
        let ids: Vec<String> = RECOVER_SCRIPT
            .key(self.active_key())
            .key(self.delayed_key())
            .arg(cutoff)
            .arg(now)
            .invoke_async(&mut conn)
            .await?;

        if !ids.is_empty() {
            warn!(count = ids.len(), "Recovered stalled capture jobs");
        }
        Ok(self.transition(&ids, JobState::Waiting, false).await?.len())
    }
}
