pub mod health;
pub mod orders;

use axum::{http::StatusCode, response::IntoResponse, routing::get, Router};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::{
    capture::{guard::EditGuard, runtime::CaptureHandle, queue::QueueError},
    config::AppConfig,
    db::DbPool,
    errors::ServiceError,
    events::EventSender,
    services::orders::OrderDataService,
};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DbPool>,
    pub config: AppConfig,
    pub event_sender: Arc<EventSender>,
    pub orders: Arc<dyn OrderDataService>,
    /// `None` when the capture queue is not configured.
    pub capture: Option<CaptureHandle>,
}

impl AppState {
    pub fn capture(&self) -> Result<&CaptureHandle, ServiceError> {
        self.capture
            .as_ref()
            .ok_or(ServiceError::QueueError(QueueError::NotConfigured))
    }

    pub fn edit_guard(&self) -> EditGuard {
        EditGuard::new(self.config.lock_ttl())
    }
}

// Common response wrapper
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub timestamp: String,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
            timestamp: Utc::now().to_rfc3339(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

async fn metrics_handler() -> impl IntoResponse {
    match crate::metrics::export_metrics() {
        Ok(body) => (StatusCode::OK, body),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

/// Builds the full application router.
pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(|| async { "capture-scheduler up" }))
        .route("/metrics", get(metrics_handler))
        .nest("/health", health::health_routes())
        .nest("/api/v1", orders::order_routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
