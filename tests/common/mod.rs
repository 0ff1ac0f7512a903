#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::{
    body::{self, Body},
    http::{Method, Request, StatusCode},
    Router,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, EntityTrait, IntoActiveModel, Set};
use serde_json::{json, Value};
use tower::ServiceExt;

use capture_scheduler::{
    capture::{
        delay::DelayPolicy, lock::EditStatus, memory_queue::InMemoryCaptureQueue,
        runtime::CaptureHandle, worker::CaptureWorker,
    },
    config::AppConfig,
    db::{self, DbConfig, DbPool},
    entities::{
        order::{self, Entity as OrderEntity, OrderStatus},
        payment::{self, PaymentStatus},
        payment_collection::{self, PaymentCollectionStatus},
    },
    errors::ServiceError,
    events::{self, EventSender},
    services::{
        orders::{OrderDataService, SeaOrmOrderService},
        payments::{AuthorizationStatus, CaptureRequest, PaymentAuthorization, PaymentGateway},
    },
    AppState,
};

/// Gateway double holding authorizations in memory.
#[derive(Debug, Default)]
pub struct FakeGateway {
    authorizations: DashMap<String, PaymentAuthorization>,
    captures: Mutex<Vec<CaptureRequest>>,
}

impl FakeGateway {
    pub fn authorize(&self, payment_intent_id: &str, amount: i64, currency: &str) {
        self.authorizations.insert(
            payment_intent_id.to_string(),
            PaymentAuthorization {
                id: payment_intent_id.to_string(),
                status: AuthorizationStatus::RequiresCapture,
                amount,
                currency: currency.to_string(),
                amount_received: 0,
            },
        );
    }

    pub fn captures(&self) -> Vec<CaptureRequest> {
        self.captures.lock().unwrap().clone()
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    async fn retrieve_authorization(
        &self,
        payment_intent_id: &str,
    ) -> Result<PaymentAuthorization, ServiceError> {
        self.authorizations
            .get(payment_intent_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ServiceError::NotFound(format!("{} not found", payment_intent_id)))
    }

    async fn capture(&self, request: &CaptureRequest) -> Result<PaymentAuthorization, ServiceError> {
        let mut authorization = self
            .authorizations
            .get_mut(&request.payment_intent_id)
            .ok_or_else(|| ServiceError::NotFound(request.payment_intent_id.clone()))?;
        authorization.status = AuthorizationStatus::Succeeded;
        authorization.amount_received = request.amount;
        self.captures.lock().unwrap().push(request.clone());
        Ok(authorization.clone())
    }
}

/// Application wired to an in-memory SQLite database and an in-memory queue.
pub struct TestApp {
    router: Router,
    pub state: AppState,
    pub db: Arc<DbPool>,
    pub queue: Arc<InMemoryCaptureQueue>,
    pub gateway: Arc<FakeGateway>,
    pub orders: Arc<SeaOrmOrderService>,
    _event_task: tokio::task::JoinHandle<()>,
}

impl TestApp {
    pub async fn new() -> Self {
        let cfg = AppConfig::new(
            "sqlite::memory:".to_string(),
            "127.0.0.1".to_string(),
            18_080,
            "test".to_string(),
        );

        let pool = db::establish_connection(&DbConfig::from(&cfg))
            .await
            .expect("failed to create test database");
        db::ensure_schema(&pool).await.expect("failed to create schema");
        let db = Arc::new(pool);

        let (event_sender, event_rx) = EventSender::channel(256);
        let event_sender = Arc::new(event_sender);
        let event_task = tokio::spawn(events::process_events(event_rx));

        let queue = Arc::new(InMemoryCaptureQueue::new());
        let orders = Arc::new(SeaOrmOrderService::new(db.clone()));
        let capture = CaptureHandle::new(queue.clone(), DelayPolicy::default(), None);

        let state = AppState {
            db: db.clone(),
            config: cfg,
            event_sender,
            orders: orders.clone(),
            capture: Some(capture),
        };

        Self {
            router: capture_scheduler::app_router(state.clone()),
            state,
            db,
            queue,
            gateway: Arc::new(FakeGateway::default()),
            orders,
            _event_task: event_task,
        }
    }

    /// Same application with the capture queue disabled.
    pub async fn without_capture() -> Self {
        let mut app = Self::new().await;
        app.state.capture = None;
        app.router = capture_scheduler::app_router(app.state.clone());
        app
    }

    pub fn worker(&self) -> CaptureWorker {
        let orders: Arc<dyn OrderDataService> = self.orders.clone();
        CaptureWorker::new(orders, self.gateway.clone(), self.state.config.lock_ttl())
    }

    /// Inserts an order with one authorized payment for `payment_intent_id`.
    pub async fn seed_order(
        &self,
        order_id: &str,
        total: Decimal,
        currency_code: &str,
        payment_intent_id: &str,
    ) -> order::Model {
        let now = Utc::now();
        let order = order::ActiveModel {
            id: Set(order_id.to_string()),
            status: Set(OrderStatus::Pending.to_string()),
            total: Set(total),
            currency_code: Set(currency_code.to_string()),
            edit_status: Set(EditStatus::Editable.to_string()),
            lock_holder: Set(None),
            locked_at: Set(None),
            metadata: Set(Some(json!({}))),
            version: Set(1),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(self.db.as_ref())
        .await
        .expect("insert order");

        let collection_id = format!("paycol_{}", order_id);
        payment_collection::ActiveModel {
            id: Set(collection_id.clone()),
            order_id: Set(order_id.to_string()),
            status: Set(PaymentCollectionStatus::Authorized.to_string()),
            amount: Set(total),
            currency_code: Set(currency_code.to_string()),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(self.db.as_ref())
        .await
        .expect("insert payment collection");

        payment::ActiveModel {
            id: Set(format!("pay_{}", order_id)),
            payment_collection_id: Set(collection_id),
            provider_id: Set("stripe".to_string()),
            provider_reference: Set(payment_intent_id.to_string()),
            amount: Set(total),
            currency_code: Set(currency_code.to_string()),
            status: Set(PaymentStatus::Authorized.to_string()),
            captured_amount: Set(None),
            captured_at: Set(None),
            created_at: Set(now),
        }
        .insert(self.db.as_ref())
        .await
        .expect("insert payment");

        order
    }

    /// Writes a capture lock directly onto the order row.
    pub async fn lock_order(&self, order_id: &str, holder: &str, locked_at: DateTime<Utc>) {
        let mut order = self
            .find_order(order_id)
            .await
            .into_active_model();
        order.edit_status = Set(EditStatus::LockedForCapture.to_string());
        order.lock_holder = Set(Some(holder.to_string()));
        order.locked_at = Set(Some(locked_at));
        order.update(self.db.as_ref()).await.expect("lock order");
    }

    pub async fn find_order(&self, order_id: &str) -> order::Model {
        OrderEntity::find_by_id(order_id.to_string())
            .one(self.db.as_ref())
            .await
            .expect("query order")
            .expect("order exists")
    }

    pub async fn request(&self, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json");
        let request = match body {
            Some(body) => builder.body(Body::from(body.to_string())),
            None => builder.body(Body::empty()),
        }
        .expect("build request");

        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("router response");
        let status = response.status();
        let bytes = body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("read response body");
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or_else(|_| {
                Value::String(String::from_utf8_lossy(&bytes).into_owned())
            })
        };
        (status, value)
    }
}
