use super::{commit_order_edit, edit_failure_label, load_editable_order, report_edit_rejection, OrderChanges};
use crate::{
    capture::guard::EditGuard,
    commands::Command,
    db::DbPool,
    entities::order::OrderStatus,
    errors::ServiceError,
    events::{Event, EventSender},
    metrics::{ORDER_CANCELLATIONS, ORDER_CANCELLATION_FAILURES},
};
use sea_orm::DatabaseConnection;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use validator::Validate;

/// Cancels an order. Cancellation is an edit and is refused while the order
/// is locked for capture; removing the pending capture job is the caller's
/// follow-up once this succeeds.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CancelOrderCommand {
    #[validate(length(min = 1, message = "Order id is required"))]
    pub order_id: String,
    #[validate(length(
        min = 1,
        max = 500,
        message = "Reason must be between 1 and 500 characters"
    ))]
    pub reason: String,
    pub version: i32, // For optimistic locking
    #[serde(skip)]
    pub guard: EditGuard,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelOrderResult {
    pub id: String,
    pub status: String,
    pub version: i32,
    pub cancellation_reason: String,
}

#[async_trait::async_trait]
impl Command for CancelOrderCommand {
    type Result = CancelOrderResult;

    #[instrument(skip(self, db_pool, event_sender), fields(order_id = %self.order_id))]
    async fn execute(
        &self,
        db_pool: Arc<DbPool>,
        event_sender: Arc<EventSender>,
    ) -> Result<Self::Result, ServiceError> {
        self.validate().map_err(|e| {
            ORDER_CANCELLATION_FAILURES
                .with_label_values(&["validation_error"])
                .inc();
            let msg = format!("Invalid input: {}", e);
            error!("{}", msg);
            ServiceError::ValidationError(msg)
        })?;

        let version = match self.cancel_order_in_db(db_pool.as_ref()).await {
            Ok(version) => version,
            Err(e) => {
                ORDER_CANCELLATION_FAILURES
                    .with_label_values(&[edit_failure_label(&e)])
                    .inc();
                report_edit_rejection(&event_sender, &self.order_id, &e).await;
                return Err(e);
            }
        };

        info!(reason = %self.reason, "Order cancelled");
        if let Err(e) = event_sender
            .send(Event::OrderCancelled(self.order_id.clone()))
            .await
        {
            warn!(error = %e, "Failed to send order cancelled event");
        }

        ORDER_CANCELLATIONS.inc();
        Ok(CancelOrderResult {
            id: self.order_id.clone(),
            status: OrderStatus::Canceled.to_string(),
            version,
            cancellation_reason: self.reason.clone(),
        })
    }
}

impl CancelOrderCommand {
    pub fn new(order_id: impl Into<String>, reason: impl Into<String>, version: i32) -> Self {
        Self {
            order_id: order_id.into(),
            reason: reason.into(),
            version,
            guard: EditGuard::default(),
        }
    }

    pub fn with_guard(mut self, guard: EditGuard) -> Self {
        self.guard = guard;
        self
    }

    async fn cancel_order_in_db(&self, db: &DatabaseConnection) -> Result<i32, ServiceError> {
        load_editable_order(db, &self.order_id, &self.guard).await?;
        commit_order_edit(
            db,
            &self.order_id,
            self.version,
            &self.guard,
            OrderChanges {
                status: Some(OrderStatus::Canceled),
                ..Default::default()
            },
        )
        .await
    }
}
