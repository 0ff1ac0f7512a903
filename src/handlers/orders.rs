use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::{
    commands::{
        orders::{AddItemToOrderCommand, CancelOrderCommand, UpdateItemQuantityCommand},
        Command,
    },
    errors::ServiceError,
    handlers::{ApiResponse, AppState},
    services::orders::OrderSnapshot,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddOrderItemRequest {
    pub sku: String,
    pub quantity: i32,
    pub unit_price: Decimal,
    pub version: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateOrderItemRequest {
    pub quantity: i32,
    pub version: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelOrderRequest {
    #[serde(default)]
    pub reason: Option<String>,
    pub version: i32,
}

/// Authorization the capture will be taken against.
fn capturable_payment_reference(order: &OrderSnapshot) -> Result<String, ServiceError> {
    if order.is_canceled() {
        return Err(ServiceError::InvalidStatus(format!(
            "Order {} is canceled",
            order.id
        )));
    }
    order
        .capturable_payment()
        .map(|payment| payment.provider_reference.clone())
        .ok_or_else(|| {
            ServiceError::InvalidOperation(format!(
                "Order {} has no authorized payment to capture",
                order.id
            ))
        })
}

pub async fn get_order(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ServiceError> {
    let order = state.orders.retrieve_order(&id).await?;
    Ok(Json(ApiResponse::success(order)))
}

pub async fn add_order_item(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<AddOrderItemRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let result = AddItemToOrderCommand::new(
        id,
        request.sku,
        request.quantity,
        request.unit_price,
        request.version,
    )
    .with_guard(state.edit_guard())
    .execute(state.db.clone(), state.event_sender.clone())
    .await?;

    Ok((StatusCode::CREATED, Json(ApiResponse::success(result))))
}

pub async fn update_order_item(
    State(state): State<AppState>,
    Path((id, item_id)): Path<(String, String)>,
    Json(request): Json<UpdateOrderItemRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let result = UpdateItemQuantityCommand::new(id, item_id, request.quantity, request.version)
        .with_guard(state.edit_guard())
        .execute(state.db.clone(), state.event_sender.clone())
        .await?;

    Ok(Json(ApiResponse::success(result)))
}

/// Cancels the order, then drops its pending capture job. Job removal is
/// best effort and never fails the request.
pub async fn cancel_order(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<CancelOrderRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let reason = request
        .reason
        .unwrap_or_else(|| "Customer request".to_string());
    let result = CancelOrderCommand::new(id.clone(), reason, request.version)
        .with_guard(state.edit_guard())
        .execute(state.db.clone(), state.event_sender.clone())
        .await?;

    let capture_job_removed = match &state.capture {
        Some(capture) => capture.scheduler.cancel_scheduled_capture(&id).await,
        None => false,
    };

    Ok(Json(ApiResponse::success(json!({
        "order": result,
        "capture_job_removed": capture_job_removed,
    }))))
}

/// Checkout completion: schedules the deferred capture for the order's
/// authorized payment.
pub async fn complete_order(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ServiceError> {
    let capture = state.capture()?;
    let order = state.orders.retrieve_order(&id).await?;
    let payment_intent_id = capturable_payment_reference(&order)?;

    let job = capture
        .scheduler
        .schedule_deferred_capture(&order.id, &payment_intent_id)
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(ApiResponse::success(job).with_message("Payment capture scheduled")),
    ))
}

/// Fulfillment created before the edit window closed: capture now.
pub async fn fulfill_order(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ServiceError> {
    let capture = state.capture()?;
    let order = state.orders.retrieve_order(&id).await?;
    let payment_intent_id = capturable_payment_reference(&order)?;

    let outcome = capture.trigger.trigger(&order.id, &payment_intent_id).await?;
    info!(
        fallback_removed = outcome.fallback_removed,
        order_id = %id,
        "Immediate capture requested on fulfillment"
    );

    Ok((StatusCode::ACCEPTED, Json(ApiResponse::success(outcome))))
}

/// Current capture job for the order, if any.
pub async fn get_capture_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ServiceError> {
    let job = state
        .capture()?
        .queue()
        .get_job(&id)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("No capture job for order {}", id)))?;

    Ok(Json(ApiResponse::success(job)))
}

pub fn order_routes() -> Router<AppState> {
    Router::new()
        .route("/orders/:id", get(get_order))
        .route("/orders/:id/items", post(add_order_item))
        .route("/orders/:id/items/:item_id", put(update_order_item))
        .route("/orders/:id/cancel", post(cancel_order))
        .route("/orders/:id/complete", post(complete_order))
        .route("/orders/:id/fulfillment", post(fulfill_order))
        .route("/orders/:id/capture", get(get_capture_job))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn canceled_order_has_no_capturable_payment() {
        let mut order = OrderSnapshot::new("ord_1", dec!(10.00), "usd").with_authorized_payment("pi_1");
        order.status = "canceled".to_string();
        assert!(matches!(
            capturable_payment_reference(&order),
            Err(ServiceError::InvalidStatus(_))
        ));
    }

    #[test]
    fn authorized_payment_reference_is_used() {
        let order = OrderSnapshot::new("ord_1", dec!(10.00), "usd").with_authorized_payment("pi_1");
        assert_eq!(capturable_payment_reference(&order).unwrap(), "pi_1");
    }

    #[test]
    fn order_without_payment_cannot_be_captured() {
        let order = OrderSnapshot::new("ord_1", dec!(10.00), "usd");
        assert!(matches!(
            capturable_payment_reference(&order),
            Err(ServiceError::InvalidOperation(_))
        ));
    }
}
