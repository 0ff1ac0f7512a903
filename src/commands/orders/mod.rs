//! Order-modification workflows.
//!
//! Every command here runs the capture-lock precondition before touching the
//! order and commits through [`commit_order_edit`], which re-checks the lock
//! in the same conditional update that bumps the order version.

pub mod add_item_to_order_command;
pub mod cancel_order_command;
pub mod update_item_quantity_command;

pub use add_item_to_order_command::AddItemToOrderCommand;
pub use cancel_order_command::CancelOrderCommand;
pub use update_item_quantity_command::UpdateItemQuantityCommand;

use crate::{
    capture::{guard::EditGuard, lock::EditStatus},
    entities::{
        order::{self, Entity as Order, OrderStatus},
        order_item::{self, Entity as OrderItem},
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::orders::OrderSnapshot,
};
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{sea_query::Expr, ColumnTrait, Condition, ConnectionTrait, EntityTrait, QueryFilter};
use tracing::{instrument, warn};

/// Column changes applied together with the version bump.
#[derive(Debug, Default, Clone, PartialEq)]
pub(crate) struct OrderChanges {
    pub total: Option<Decimal>,
    pub status: Option<OrderStatus>,
}

/// Loads `order_id` and runs the edit guard against it.
pub(crate) async fn load_editable_order<C: ConnectionTrait>(
    conn: &C,
    order_id: &str,
    guard: &EditGuard,
) -> Result<order::Model, ServiceError> {
    let order = Order::find_by_id(order_id.to_string())
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

    guard.validate_preconditions(&OrderSnapshot::from_models(order.clone(), Vec::new()))?;

    let status = order.status.parse::<OrderStatus>().ok();
    if matches!(status, Some(OrderStatus::Canceled | OrderStatus::Archived)) {
        return Err(ServiceError::InvalidStatus(format!(
            "Order {} is {} and cannot be edited",
            order_id, order.status
        )));
    }

    Ok(order)
}

/// Applies `changes` and increments the version, but only while the order is
/// still at `expected_version` and not locked for capture.
///
/// Returns the new version. When nothing was updated the order is re-read to
/// tell a capture lock (`OrderLocked`) from a concurrent edit (`Conflict`).
#[instrument(skip(conn, guard, changes))]
pub(crate) async fn commit_order_edit<C: ConnectionTrait>(
    conn: &C,
    order_id: &str,
    expected_version: i32,
    guard: &EditGuard,
    changes: OrderChanges,
) -> Result<i32, ServiceError> {
    let now = Utc::now();
    let mut update = Order::update_many()
        .col_expr(order::Column::Version, Expr::value(expected_version + 1))
        .col_expr(order::Column::UpdatedAt, Expr::value(now));
    if let Some(total) = changes.total {
        update = update.col_expr(order::Column::Total, Expr::value(total));
    }
    if let Some(status) = changes.status {
        update = update.col_expr(order::Column::Status, Expr::value(status.to_string()));
    }

    let result = update
        .filter(order::Column::Id.eq(order_id))
        .filter(order::Column::Version.eq(expected_version))
        .filter(
            Condition::any()
                .add(order::Column::EditStatus.ne(EditStatus::LockedForCapture.to_string()))
                .add(order::Column::LockedAt.lt(guard.stale_before(now))),
        )
        .exec(conn)
        .await?;

    if result.rows_affected == 1 {
        return Ok(expected_version + 1);
    }

    let current = Order::find_by_id(order_id.to_string())
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;
    guard.validate_preconditions(&OrderSnapshot::from_models(current.clone(), Vec::new()))?;

    warn!(
        order_id = %order_id,
        expected_version,
        current_version = current.version,
        "Concurrent modification detected"
    );
    Err(ServiceError::Conflict(format!(
        "Order {} was modified concurrently (expected version {}, found {})",
        order_id, expected_version, current.version
    )))
}

/// Sum of all line totals currently stored for the order.
pub(crate) async fn order_items_total<C: ConnectionTrait>(
    conn: &C,
    order_id: &str,
) -> Result<Decimal, ServiceError> {
    let items = OrderItem::find()
        .filter(order_item::Column::OrderId.eq(order_id))
        .all(conn)
        .await?;
    Ok(items.iter().map(order_item::Model::line_total).sum())
}

/// Metric label for a failed edit.
pub(crate) fn edit_failure_label(err: &ServiceError) -> &'static str {
    match err {
        ServiceError::OrderLocked(_) => "order_locked",
        ServiceError::Conflict(_) => "concurrent_modification",
        ServiceError::NotFound(_) => "not_found",
        ServiceError::InvalidStatus(_) => "invalid_status",
        ServiceError::DatabaseError(_) => "database_error",
        _ => "other",
    }
}

/// Publishes an audit event when an edit was refused because of a capture lock.
pub(crate) async fn report_edit_rejection(
    event_sender: &EventSender,
    order_id: &str,
    err: &ServiceError,
) {
    if let ServiceError::OrderLocked(locked) = err {
        let event = Event::OrderEditRejected {
            order_id: order_id.to_string(),
            reason: locked.message.clone(),
        };
        if let Err(e) = event_sender.send(event).await {
            warn!(order_id = %order_id, error = %e, "Failed to send edit rejection event");
        }
    }
}
