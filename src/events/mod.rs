use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::capture::queue::JobSource;

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Creates a sender together with its receiving end.
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(buffer);
        (Self::new(tx), rx)
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }
}

/// Domain events emitted by the capture scheduler and the order edit path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    PaymentCaptureScheduled {
        order_id: String,
        job_id: String,
        source: JobSource,
        run_at: i64,
    },
    PaymentCaptured {
        order_id: String,
        payment_intent_id: String,
        amount: i64,
        currency_code: String,
        captured_at: DateTime<Utc>,
    },
    PaymentCaptureFailed {
        order_id: String,
        payment_intent_id: String,
        reason: String,
    },
    OrderEditRejected {
        order_id: String,
        reason: String,
    },
    OrderItemAdded {
        order_id: String,
        item_id: String,
    },
    OrderItemUpdated {
        order_id: String,
        item_id: String,
    },
    OrderCancelled(String),
}

impl Event {
    pub fn order_id(&self) -> &str {
        match self {
            Event::PaymentCaptureScheduled { order_id, .. }
            | Event::PaymentCaptured { order_id, .. }
            | Event::PaymentCaptureFailed { order_id, .. }
            | Event::OrderEditRejected { order_id, .. }
            | Event::OrderItemAdded { order_id, .. }
            | Event::OrderItemUpdated { order_id, .. }
            | Event::OrderCancelled(order_id) => order_id,
        }
    }
}

/// Drains the event channel into the payment audit log.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        match &event {
            Event::PaymentCaptured {
                order_id,
                payment_intent_id,
                amount,
                currency_code,
                captured_at,
            } => {
                info!(
                    target: "payment_audit",
                    order_id = %order_id,
                    payment_intent_id = %payment_intent_id,
                    amount = *amount,
                    currency = %currency_code,
                    captured_at = %captured_at,
                    "payment captured"
                );
            }
            Event::PaymentCaptureFailed {
                order_id,
                payment_intent_id,
                reason,
            } => {
                warn!(
                    target: "payment_audit",
                    order_id = %order_id,
                    payment_intent_id = %payment_intent_id,
                    reason = %reason,
                    "payment capture failed"
                );
            }
            Event::PaymentCaptureScheduled {
                order_id,
                job_id,
                source,
                run_at,
            } => {
                info!(
                    target: "payment_audit",
                    order_id = %order_id,
                    job_id = %job_id,
                    source = %source,
                    run_at = *run_at,
                    "payment capture scheduled"
                );
            }
            other => {
                info!(order_id = %other.order_id(), event = ?other, "Received event");
            }
        }
    }

    info!("Event processing loop stopped");
}
