use super::{
    commit_order_edit, edit_failure_label, load_editable_order, order_items_total,
    report_edit_rejection, OrderChanges,
};
use crate::{
    capture::guard::EditGuard,
    commands::Command,
    db::DbPool,
    entities::order_item,
    errors::ServiceError,
    events::{Event, EventSender},
    metrics::{ORDER_ITEMS_ADDED, ORDER_ITEM_ADD_FAILURES},
};
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, DatabaseConnection, Set, TransactionError, TransactionTrait};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;
use validator::{Validate, ValidationError};

pub(crate) fn validate_unit_price(unit_price: &Decimal) -> Result<(), ValidationError> {
    if unit_price.is_sign_negative() {
        return Err(ValidationError::new("unit_price_negative"));
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct AddItemToOrderCommand {
    #[validate(length(min = 1, message = "Order id is required"))]
    pub order_id: String,
    #[validate(length(min = 1, max = 100, message = "SKU must be between 1 and 100 characters"))]
    pub sku: String,
    #[validate(range(min = 1, message = "Quantity must be at least 1"))]
    pub quantity: i32,
    #[validate(custom = "validate_unit_price")]
    pub unit_price: Decimal,
    /// Version the caller last read; used for optimistic locking.
    pub version: i32,
    #[serde(skip)]
    pub guard: EditGuard,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddItemToOrderResult {
    pub item_id: String,
    pub order_id: String,
    pub sku: String,
    pub quantity: i32,
    pub unit_price: Decimal,
    pub order_total: Decimal,
    pub version: i32,
}

#[async_trait::async_trait]
impl Command for AddItemToOrderCommand {
    type Result = AddItemToOrderResult;

    #[instrument(skip(self, db_pool, event_sender), fields(order_id = %self.order_id))]
    async fn execute(
        &self,
        db_pool: Arc<DbPool>,
        event_sender: Arc<EventSender>,
    ) -> Result<Self::Result, ServiceError> {
        self.validate().map_err(|e| {
            ORDER_ITEM_ADD_FAILURES
                .with_label_values(&["validation_error"])
                .inc();
            let msg = format!("Invalid input: {}", e);
            error!("{}", msg);
            ServiceError::ValidationError(msg)
        })?;

        let result = match self.add_item(db_pool.as_ref()).await {
            Ok(result) => result,
            Err(e) => {
                ORDER_ITEM_ADD_FAILURES
                    .with_label_values(&[edit_failure_label(&e)])
                    .inc();
                report_edit_rejection(&event_sender, &self.order_id, &e).await;
                return Err(e);
            }
        };

        info!(
            order_id = %self.order_id,
            item_id = %result.item_id,
            quantity = self.quantity,
            order_total = %result.order_total,
            "Item added to order"
        );

        if let Err(e) = event_sender
            .send(Event::OrderItemAdded {
                order_id: result.order_id.clone(),
                item_id: result.item_id.clone(),
            })
            .await
        {
            warn!(error = %e, "Failed to send order item added event");
        }

        ORDER_ITEMS_ADDED.inc();
        Ok(result)
    }
}

impl AddItemToOrderCommand {
    pub fn new(
        order_id: impl Into<String>,
        sku: impl Into<String>,
        quantity: i32,
        unit_price: Decimal,
        version: i32,
    ) -> Self {
        Self {
            order_id: order_id.into(),
            sku: sku.into(),
            quantity,
            unit_price,
            version,
            guard: EditGuard::default(),
        }
    }

    pub fn with_guard(mut self, guard: EditGuard) -> Self {
        self.guard = guard;
        self
    }

    async fn add_item(
        &self,
        db: &DatabaseConnection,
    ) -> Result<AddItemToOrderResult, ServiceError> {
        load_editable_order(db, &self.order_id, &self.guard).await?;

        let command = self.clone();
        db.transaction::<_, AddItemToOrderResult, ServiceError>(move |txn| {
            Box::pin(async move {
                let now = Utc::now();
                let item = order_item::ActiveModel {
                    id: Set(format!("item_{}", Uuid::new_v4().simple())),
                    order_id: Set(command.order_id.clone()),
                    sku: Set(command.sku.clone()),
                    quantity: Set(command.quantity),
                    unit_price: Set(command.unit_price),
                    created_at: Set(now),
                    updated_at: Set(now),
                }
                .insert(txn)
                .await?;

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

                Ok(AddItemToOrderResult {
                    item_id: item.id,
                    order_id: item.order_id,
                    sku: item.sku,
                    quantity: item.quantity,
                    unit_price: item.unit_price,
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
