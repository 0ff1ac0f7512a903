use std::sync::Arc;
use tracing::{error, info, instrument, warn};

use super::delay::DelayPolicy;
use super::queue::{CaptureJob, CaptureQueue, ScheduleOptions};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::metrics::CAPTURE_JOBS_SCHEDULED;

/// Checkout-side entry points into the capture queue.
#[derive(Clone)]
pub struct CaptureScheduler {
    queue: Arc<dyn CaptureQueue>,
    policy: DelayPolicy,
    event_sender: Option<Arc<EventSender>>,
}

impl CaptureScheduler {
    pub fn new(queue: Arc<dyn CaptureQueue>, policy: DelayPolicy) -> Self {
        Self {
            queue,
            policy,
            event_sender: None,
        }
    }

    pub fn with_event_sender(mut self, event_sender: Arc<EventSender>) -> Self {
        self.event_sender = Some(event_sender);
        self
    }

    pub fn policy(&self) -> DelayPolicy {
        self.policy
    }

    /// Schedules the deferred capture at checkout completion.
    ///
    /// Errors are returned to the checkout flow: an order must not proceed
    /// without a scheduled capture.
    #[instrument(skip(self))]
    pub async fn schedule_deferred_capture(
        &self,
        order_id: &str,
        payment_intent_id: &str,
    ) -> Result<CaptureJob, ServiceError> {
        let delay_ms = self.policy.capture_delay_ms();
        let job = self
            .queue
            .schedule(order_id, payment_intent_id, delay_ms, ScheduleOptions::normal())
            .await
            .map_err(|e| {
                error!(order_id = %order_id, error = %e, "Failed to schedule payment capture");
                ServiceError::from(e)
            })?;

        CAPTURE_JOBS_SCHEDULED.with_label_values(&["normal"]).inc();
        info!(
            order_id = %order_id,
            job_id = %job.id,
            delay_ms,
            "Payment capture scheduled"
        );

        if let Some(sender) = &self.event_sender {
            let event = Event::PaymentCaptureScheduled {
                order_id: job.order_id.clone(),
                job_id: job.id.clone(),
                source: job.source,
                run_at: job.run_at,
            };
            if let Err(e) = sender.send(event).await {
                warn!(error = %e, "Failed to send capture scheduled event");
            }
        }

        Ok(job)
    }

    /// Removes the pending capture of a cancelled order. Never fails the
    /// cancellation; returns whether a job was removed.
    #[instrument(skip(self))]
    pub async fn cancel_scheduled_capture(&self, order_id: &str) -> bool {
        match self.queue.cancel(order_id).await {
            Ok(true) => {
                info!(order_id = %order_id, "Scheduled capture removed");
                true
            }
            Ok(false) => {
                info!(order_id = %order_id, "No pending capture to remove");
                false
            }
            Err(e) => {
                warn!(order_id = %order_id, error = %e, "Failed to remove scheduled capture");
                false
            }
        }
    }
}
