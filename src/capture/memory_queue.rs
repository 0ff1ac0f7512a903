use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::queue::{
    capture_job_id, now_ms, CaptureJob, CaptureQueue, JobDisposition, JobState, QueueError,
    RetryPolicy, ScheduleOptions,
};

/// In-process capture queue.
///
/// Not durable; intended for tests and single-node development where Redis
/// is unavailable.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCaptureQueue {
    jobs: Arc<DashMap<String, CaptureJob>>,
    claimed_at: Arc<DashMap<String, i64>>,
    failed: Arc<DashMap<String, CaptureJob>>,
    retry: RetryPolicy,
}

impl InMemoryCaptureQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retry_policy(retry: RetryPolicy) -> Self {
        Self {
            retry,
            ..Self::default()
        }
    }

    /// Jobs that exhausted their attempts.
    pub fn failed_jobs(&self) -> Vec<CaptureJob> {
        self.failed.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

#[async_trait]
impl CaptureQueue for InMemoryCaptureQueue {
    async fn schedule(
        &self,
        order_id: &str,
        payment_intent_id: &str,
        delay_ms: u64,
        mut options: ScheduleOptions,
    ) -> Result<CaptureJob, QueueError> {
        options.max_attempts.get_or_insert(self.retry.max_attempts);
        let job = CaptureJob::new(order_id, payment_intent_id, delay_ms, &options, now_ms());

        match self.jobs.entry(job.id.clone()) {
            Entry::Occupied(existing) => Err(QueueError::DuplicateJob {
                job_id: existing.key().clone(),
                state: existing.get().state,
            }),
            Entry::Vacant(slot) => {
                slot.insert(job.clone());
                debug!(job_id = %job.id, run_at = job.run_at, "capture job scheduled");
                Ok(job)
            }
        }
    }

    async fn cancel(&self, order_id: &str) -> Result<bool, QueueError> {
        let removed = self
            .jobs
            .remove_if(&capture_job_id(order_id), |_, job| job.state.is_pending());
        Ok(removed.is_some())
    }

    async fn get_job(&self, order_id: &str) -> Result<Option<CaptureJob>, QueueError> {
        Ok(self
            .jobs
            .get(&capture_job_id(order_id))
            .map(|job| job.value().clone()))
    }

    async fn reserve_due(&self, limit: usize) -> Result<Vec<CaptureJob>, QueueError> {
        let now = now_ms();
        let mut due: Vec<(i64, String)> = self
            .jobs
            .iter()
            .filter(|job| job.state.is_pending() && job.run_at <= now)
            .map(|job| (job.run_at, job.id.clone()))
            .collect();
        due.sort();

        let mut reserved = Vec::new();
        for (_, id) in due.into_iter() {
            if reserved.len() >= limit {
                break;
            }
            // Re-check under the shard lock; a concurrent cancel may have won.
            if let Some(mut job) = self.jobs.get_mut(&id) {
                if !job.state.is_pending() {
                    continue;
                }
                job.state = JobState::Active;
                job.attempts += 1;
                self.claimed_at.insert(id.clone(), now);
                reserved.push(job.clone());
            }
        }
        Ok(reserved)
    }

    async fn complete(&self, job: &CaptureJob) -> Result<(), QueueError> {
        self.jobs
            .remove_if(&job.id, |_, stored| stored.state == JobState::Active);
        self.claimed_at.remove(&job.id);
        Ok(())
    }

    async fn fail(&self, job: &CaptureJob, reason: &str) -> Result<JobDisposition, QueueError> {
        self.claimed_at.remove(&job.id);

        let Entry::Occupied(mut stored) = self.jobs.entry(job.id.clone()) else {
            return Ok(JobDisposition::Failed);
        };

        stored.get_mut().last_error = Some(reason.to_string());
        if stored.get().attempts_exhausted() {
            let mut parked = stored.remove();
            parked.state = JobState::Failed;
            self.failed.insert(parked.id.clone(), parked);
            return Ok(JobDisposition::Failed);
        }

        let run_at = self.retry.next_run_at(stored.get().attempts, now_ms());
        let job = stored.get_mut();
        job.state = JobState::Delayed;
        job.run_at = run_at;
        Ok(JobDisposition::Retrying { run_at })
    }

    async fn recover_stalled(&self, stalled_for: Duration) -> Result<usize, QueueError> {
        let cutoff = now_ms() - i64::try_from(stalled_for.as_millis()).unwrap_or(i64::MAX);
        let stalled: Vec<String> = self
            .claimed_at
            .iter()
            .filter(|entry| *entry.value() <= cutoff)
            .map(|entry| entry.key().clone())
            .collect();

        let mut recovered = 0;
        for id in stalled {
            self.claimed_at.remove(&id);
            if let Some(mut job) = self.jobs.get_mut(&id) {
                if job.state == JobState::Active {
                    job.state = JobState::Waiting;
                    job.run_at = now_ms();
                    recovered += 1;
                }
            }
        }
        Ok(recovered)
    }
}
