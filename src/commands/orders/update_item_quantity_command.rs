use super::{
    commit_order_edit, edit_failure_label, load_editable_order, order_items_total,
    report_edit_rejection, OrderChanges,
};
use crate::{
    capture::guard::EditGuard,
    commands::Command,
    db::DbPool,
    entities::order_item::{self, Entity as OrderItem},
    errors::ServiceError,
    events::{Event, EventSender},
    metrics::{ORDER_ITEMS_UPDATED, ORDER_ITEM_UPDATE_FAILURES},
};
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, DatabaseConnection, EntityTrait, IntoActiveModel, Set, TransactionError,
    TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use validator::Validate;

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct UpdateItemQuantityCommand {
    #[validate(length(min = 1, message = "Order id is required"))]
    pub order_id: String,
    #[validate(length(min = 1, message = "Item id is required"))]
    pub item_id: String,
    #[validate(range(min = 1, max = 10000, message = "Quantity must be between 1 and 10000"))]
    pub quantity: i32,
    pub version: i32,
    #[serde(skip)]
    pub guard: EditGuard,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateItemQuantityResult {
    pub item_id: String,
    pub order_id: String,
    pub quantity: i32,
    pub order_total: Decimal,
    pub version: i32,
}

#[async_trait::async_trait]
impl Command for UpdateItemQuantityCommand {
    type Result = UpdateItemQuantityResult;

    #[instrument(skip(self, db_pool, event_sender), fields(order_id = %self.order_id, item_id = %self.item_id))]
    async fn execute(
        &self,
        db_pool: Arc<DbPool>,
        event_sender: Arc<EventSender>,
    ) -> Result<Self::Result, ServiceError> {
        self.validate().map_err(|e| {
            ORDER_ITEM_UPDATE_FAILURES
                .with_label_values(&["validation_error"])
                .inc();
            let msg = format!("Invalid input: {}", e);
            error!("{}", msg);
            ServiceError::ValidationError(msg)
        })?;

        let result = match self.update_quantity(db_pool.as_ref()).await {
            Ok(result) => result,
            Err(e) => {
                ORDER_ITEM_UPDATE_FAILURES
                    .with_label_values(&[edit_failure_label(&e)])
                    .inc();
                report_edit_rejection(&event_sender, &self.order_id, &e).await;
                return Err(e);
            }
        };

        info!(
            quantity = result.quantity,
            order_total = %result.order_total,
            "Order item quantity updated"
        );

        if let Err(e) = event_sender
            .send(Event::OrderItemUpdated {
                order_id: result.order_id.clone(),
                item_id: result.item_id.clone(),
            })
            .await
        {
            warn!(error = %e, "Failed to send order item updated event");
        }

        ORDER_ITEMS_UPDATED.inc();
        Ok(result)
    }
}

impl UpdateItemQuantityCommand {
    pub fn new(
        order_id: impl Into<String>,
        item_id: impl Into<String>,
        quantity: i32,
        version: i32,
    ) -> Self {
        Self {
            order_id: order_id.into(),
            item_id: item_id.into(),
            quantity,
            version,
            guard: EditGuard::default(),
        }
    }

    pub fn with_guard(mut self, guard: EditGuard) -> Self {
        self.guard = guard;
        self
    }

    async fn update_quantity(
        &self,
        db: &DatabaseConnection,
    ) -> Result<UpdateItemQuantityResult, ServiceError> {
        load_editable_order(db, &self.order_id, &self.guard).await?;

        let command = self.clone();
        db.transaction::<_, UpdateItemQuantityResult, ServiceError>(move |txn| {
            Box::pin(async move {
                let item = OrderItem::find_by_id(command.item_id.clone())
                    .one(txn)
                    .await?
                    .filter(|item| item.order_id == command.order_id)
                    .ok_or_else(|| {
                        ServiceError::NotFound(format!(
                            "Item {} not found on order {}",
                            command.item_id, command.order_id
                        ))
                    })?;

                let mut item: order_item::ActiveModel = item.into_active_model();
                item.quantity = Set(command.quantity);
                item.updated_at = Set(Utc::now());
                let item = item.update(txn).await?;

                let order_total = order_items_total(txn, &command.order_id).await?;
                let version = commit_order_edit(
                    txn,
                    &command.order_id,
                    command.version,
                    &command.guard,
                    OrderChanges {
                        total: Some(order_total),
                        ..Default::default()
                    },
                )
                .await?;

                Ok(UpdateItemQuantityResult {
                    item_id: item.id,
                    order_id: item.order_id,
                    quantity: item.quantity,
                    order_total,
                    version,
                })
            })
        })
        .await
        .map_err(|e| match e {
            TransactionError::Connection(db_err) => ServiceError::DatabaseError(db_err),
            TransactionError::Transaction(service_err) => service_err,
        })
    }
}
