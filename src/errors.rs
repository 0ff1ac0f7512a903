use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use sea_orm::error::DbErr;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::capture::queue::QueueError;

/// Machine-readable code carried by the locked-order conflict.
pub const ORDER_LOCKED_CODE: &str = "ORDER_LOCKED";

/// Human-readable message carried by the locked-order conflict.
pub const ORDER_LOCKED_MESSAGE: &str = "Order is processing and cannot be edited";

/// Standard error body returned by the HTTP layer.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// HTTP status category (e.g., "Not Found", "Conflict")
    pub error: String,
    /// Human-readable error description
    pub message: String,
    /// Additional error details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    /// ISO 8601 timestamp when error occurred
    pub timestamp: String,
}

/// Raised by the edit-path guard when an order is locked for payment capture.
///
/// The HTTP layer renders it verbatim as a 409 with
/// `{ "code": "ORDER_LOCKED", "error": "...", "order_id": "..." }`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message} (order {order_id})")]
pub struct OrderLockedError {
    pub order_id: String,
    pub message: String,
}

impl OrderLockedError {
    pub fn new(order_id: impl Into<String>) -> Self {
        Self {
            order_id: order_id.into(),
            message: ORDER_LOCKED_MESSAGE.to_string(),
        }
    }

    pub fn code(&self) -> &'static str {
        ORDER_LOCKED_CODE
    }

    pub fn http_status(&self) -> StatusCode {
        StatusCode::CONFLICT
    }

    pub fn body(&self) -> serde_json::Value {
        json!({
            "code": self.code(),
            "error": self.message,
            "order_id": self.order_id,
        })
    }
}

impl IntoResponse for OrderLockedError {
    fn into_response(self) -> Response {
        (self.http_status(), Json(self.body())).into_response()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] DbErr),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Invalid status: {0}")]
    InvalidStatus(String),

    #[error(transparent)]
    OrderLocked(#[from] OrderLockedError),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error(
        "Capture amount {amount_due} exceeds authorized amount {authorized} for order {order_id}"
    )]
    AuthorizationExceeded {
        order_id: String,
        amount_due: i64,
        authorized: i64,
    },

    #[error("Payment failed: {0}")]
    PaymentFailed(String),

    #[error("External service error: {0}")]
    ExternalServiceError(String),

    #[error("Queue error: {0}")]
    QueueError(#[from] QueueError),

    #[error("Event error: {0}")]
    EventError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::ValidationError(err.to_string())
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(err: serde_json::Error) -> Self {
        ServiceError::SerializationError(err.to_string())
    }
}

impl ServiceError {
    /// Returns the HTTP status code for this error.
    /// This is the single source of truth for error-to-status mapping.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::ValidationError(_) | Self::InvalidOperation(_) | Self::InvalidStatus(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::OrderLocked(err) => err.http_status(),
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::AuthorizationExceeded { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::PaymentFailed(_) => StatusCode::PAYMENT_REQUIRED,
            Self::ExternalServiceError(_) => StatusCode::BAD_GATEWAY,
            Self::QueueError(QueueError::NotConfigured) | Self::ServiceUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::DatabaseError(_)
            | Self::QueueError(_)
            | Self::EventError(_)
            | Self::SerializationError(_)
            | Self::InternalError(_)
            | Self::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns the error message suitable for HTTP responses.
    /// Internal errors return generic messages to avoid leaking implementation details.
    pub fn response_message(&self) -> String {
        match self {
            Self::DatabaseError(_) => "Database error".to_string(),
            Self::QueueError(QueueError::NotConfigured) => {
                "Payment capture queue is not configured".to_string()
            }
            Self::QueueError(_)
            | Self::EventError(_)
            | Self::SerializationError(_)
            | Self::InternalError(_)
            | Self::Other(_) => "Internal server error".to_string(),
            Self::OrderLocked(err) => err.message.clone(),
            _ => self.to_string(),
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        if let ServiceError::OrderLocked(err) = self {
            return err.into_response();
        }

        let status = self.status_code();
        let err = ErrorResponse {
            error: status.canonical_reason().unwrap_or("Error").to_string(),
            message: self.response_message(),
            details: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        };

        (status, Json(err)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    #[test]
    fn order_locked_error_carries_conflict_contract() {
        let err = OrderLockedError::new("ord_test");

        assert_eq!(err.code(), "ORDER_LOCKED");
        assert_eq!(err.http_status(), StatusCode::CONFLICT);
        assert_eq!(err.http_status().as_u16(), 409);
        assert!(err.message.contains("cannot be edited"));
        assert_eq!(err.order_id, "ord_test");
    }

    #[tokio::test]
    async fn order_locked_response_is_rendered_verbatim() {
        let response = ServiceError::from(OrderLockedError::new("ord_123")).into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let payload: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(payload["code"], "ORDER_LOCKED");
        assert_eq!(payload["error"], "Order is processing and cannot be edited");
        assert_eq!(payload["order_id"], "ord_123");
    }

    #[test]
    fn service_error_status_code_mapping() {
        assert_eq!(
            ServiceError::NotFound("x".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ServiceError::Conflict("x".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ServiceError::AuthorizationExceeded {
                order_id: "o".into(),
                amount_due: 6000,
                authorized: 5000,
            }
            .status_code(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            ServiceError::QueueError(QueueError::NotConfigured).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ServiceError::QueueError(QueueError::Connection("refused".into())).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            ServiceError::ExternalServiceError("x".into()).status_code(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn service_error_response_message_hides_internal_details() {
        assert_eq!(
            ServiceError::QueueError(QueueError::Connection("10.0.0.3 refused".into()))
                .response_message(),
            "Internal server error"
        );
        assert_eq!(
            ServiceError::NotFound("Order ord_1 not found".into()).response_message(),
            "Not found: Order ord_1 not found"
        );
    }
}
