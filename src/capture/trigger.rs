use serde::Serialize;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use super::queue::{
    capture_idempotency_key, CaptureJob, CaptureQueue, JobState, QueueError, ScheduleOptions,
};
use crate::errors::ServiceError;
use crate::metrics::CAPTURE_JOBS_SCHEDULED;

/// What the immediate-capture trigger did for an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TriggerOutcome {
    pub order_id: String,
    pub payment_intent_id: String,
    pub idempotency_key: String,
    /// A pending delayed job was found and removed.
    pub fallback_removed: bool,
    /// The job that will perform the capture. `None` when a capture for the
    /// order was already executing.
    pub job: Option<CaptureJob>,
}

/// Captures early when an order is fulfilled before its edit window closes.
#[derive(Clone)]
pub struct ImmediateCaptureTrigger {
    queue: Arc<dyn CaptureQueue>,
}

impl ImmediateCaptureTrigger {
    pub fn new(queue: Arc<dyn CaptureQueue>) -> Self {
        Self { queue }
    }

    /// Replaces the order's delayed capture with a zero-delay one.
    ///
    /// Cancellation problems are logged and never block scheduling. A
    /// scheduling failure is returned: without it the payment would never be
    /// captured.
    #[instrument(skip(self))]
    pub async fn trigger(
        &self,
        order_id: &str,
        payment_intent_id: &str,
    ) -> Result<TriggerOutcome, ServiceError> {
        let fallback_removed = match self.queue.cancel(order_id).await {
            Ok(true) => {
                info!(order_id = %order_id, "fallback job removed");
                true
            }
            Ok(false) => {
                info!(order_id = %order_id, "fallback job not found");
                false
            }
            Err(e) => {
                warn!(
                    order_id = %order_id,
                    error = %e,
                    "Failed to cancel delayed capture job; scheduling immediate capture anyway"
                );
                false
            }
        };

        let idempotency_key = capture_idempotency_key(order_id, payment_intent_id);
        info!(
            order_id = %order_id,
            payment_intent_id = %payment_intent_id,
            idempotency_key = %idempotency_key,
            "Scheduling immediate capture"
        );

        let job = match self
            .queue
            .schedule(order_id, payment_intent_id, 0, ScheduleOptions::immediate())
            .await
        {
            Ok(job) => {
                CAPTURE_JOBS_SCHEDULED.with_label_values(&["immediate"]).inc();
                Some(job)
            }
            // The delayed job already fired; the capture is underway.
            Err(QueueError::DuplicateJob {
                state: JobState::Active,
                job_id,
            }) => {
                info!(order_id = %order_id, job_id = %job_id, "Capture already in progress");
                None
            }
            Err(e) => return Err(e.into()),
        };

        Ok(TriggerOutcome {
            order_id: order_id.to_string(),
            payment_intent_id: payment_intent_id.to_string(),
            idempotency_key,
            fallback_removed,
            job,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::memory_queue::InMemoryCaptureQueue;
    use crate::capture::queue::{JobDisposition, JobSource};
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use mockall::{mock, Sequence};
    use std::time::Duration;

    mock! {
        pub Queue {}

        #[async_trait]
        impl CaptureQueue for Queue {
            async fn schedule(
                &self,
                order_id: &str,
                payment_intent_id: &str,
                delay_ms: u64,
                options: ScheduleOptions,
            ) -> Result<CaptureJob, QueueError>;
            async fn cancel(&self, order_id: &str) -> Result<bool, QueueError>;
            async fn get_job(&self, order_id: &str) -> Result<Option<CaptureJob>, QueueError>;
            async fn reserve_due(&self, limit: usize) -> Result<Vec<CaptureJob>, QueueError>;
            async fn complete(&self, job: &CaptureJob) -> Result<(), QueueError>;
            async fn fail(&self, job: &CaptureJob, reason: &str) -> Result<JobDisposition, QueueError>;
            async fn recover_stalled(&self, stalled_for: Duration) -> Result<usize, QueueError>;
        }
    }

    fn immediate_job(order_id: &str, payment_intent_id: &str) -> CaptureJob {
        CaptureJob::new(order_id, payment_intent_id, 0, &ScheduleOptions::immediate(), 0)
    }

    #[tokio::test]
    async fn cancels_then_schedules_with_zero_delay() {
        for found in [true, false] {
            let mut seq = Sequence::new();
            let mut queue = MockQueue::new();
            queue
                .expect_cancel()
                .withf(|order_id| order_id == "ord_1")
                .times(1)
                .in_sequence(&mut seq)
                .returning(move |_| Ok(found));
            queue
                .expect_schedule()
                .withf(|order_id, payment_intent_id, delay_ms, options| {
                    order_id == "ord_1"
                        && payment_intent_id == "pi_1"
                        && *delay_ms == 0
                        && options.source == JobSource::Immediate
                })
                .times(1)
                .in_sequence(&mut seq)
                .returning(|order_id, payment_intent_id, _, _| {
                    Ok(immediate_job(order_id, payment_intent_id))
                });

            let outcome = ImmediateCaptureTrigger::new(Arc::new(queue))
                .trigger("ord_1", "pi_1")
                .await
                .unwrap();

            assert_eq!(outcome.idempotency_key, "capture_ord_1_pi_1");
            assert_eq!(outcome.fallback_removed, found);
            assert_eq!(outcome.job.unwrap().delay_ms, 0);
        }
    }

    #[tokio::test]
    async fn cancel_failure_does_not_block_scheduling() {
        let mut queue = MockQueue::new();
        queue
            .expect_cancel()
            .returning(|_| Err(QueueError::Connection("broker unavailable".into())));
        queue
            .expect_schedule()
            .times(1)
            .returning(|order_id, payment_intent_id, _, _| {
                Ok(immediate_job(order_id, payment_intent_id))
            });

        let outcome = ImmediateCaptureTrigger::new(Arc::new(queue))
            .trigger("ord_1", "pi_1")
            .await
            .unwrap();

        assert!(!outcome.fallback_removed);
        assert!(outcome.job.is_some());
    }

    #[tokio::test]
    async fn schedule_failure_is_propagated() {
        let mut queue = MockQueue::new();
        queue.expect_cancel().returning(|_| Ok(false));
        queue
            .expect_schedule()
            .returning(|_, _, _, _| Err(QueueError::Connection("refused".into())));

        let err = ImmediateCaptureTrigger::new(Arc::new(queue))
            .trigger("ord_1", "pi_1")
            .await
            .unwrap_err();

        assert_matches!(err, ServiceError::QueueError(QueueError::Connection(_)));
    }

    #[tokio::test]
    async fn active_capture_is_left_to_finish() {
        let queue = Arc::new(InMemoryCaptureQueue::new());
        queue
            .schedule("ord_1", "pi_1", 0, ScheduleOptions::normal())
            .await
            .unwrap();
        queue.reserve_due(1).await.unwrap();

        let outcome = ImmediateCaptureTrigger::new(queue.clone())
            .trigger("ord_1", "pi_1")
            .await
            .unwrap();

        assert!(!outcome.fallback_removed);
        assert!(outcome.job.is_none());
    }

    #[tokio::test]
    async fn pending_delayed_job_is_replaced() {
        let queue = Arc::new(InMemoryCaptureQueue::new());
        queue
            .schedule("ord_1", "pi_1", 3_570_000, ScheduleOptions::normal())
            .await
            .unwrap();

        let outcome = ImmediateCaptureTrigger::new(queue.clone())
            .trigger("ord_1", "pi_1")
            .await
            .unwrap();

        assert!(outcome.fallback_removed);
        let job = queue.get_job("ord_1").await.unwrap().unwrap();
        assert_eq!(job.source, JobSource::Immediate);
        assert_eq!(job.state, JobState::Waiting);
    }
}
