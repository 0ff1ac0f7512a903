use crate::{
    capture::currency::from_minor_units,
    capture::lock::{EditStatus, OrderLock},
    db::DbPool,
    entities::{
        order::{self, Entity as OrderEntity},
        payment::{self, Entity as PaymentEntity, PaymentStatus},
        payment_collection::{self, Entity as PaymentCollectionEntity, PaymentCollectionStatus},
    },
    errors::ServiceError,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, Condition, EntityTrait, IntoActiveModel,
    QueryFilter, Set, TransactionError, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error, info, instrument};

/// Metadata key stamped on the order once its payment has been captured.
pub const PAYMENT_CAPTURED_AT_KEY: &str = "payment_captured_at";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentSnapshot {
    pub id: String,
    /// Gateway authorization id.
    pub provider_reference: String,
    pub status: String,
    pub amount: Decimal,
    pub currency_code: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentCollectionSnapshot {
    pub id: String,
    pub status: String,
    pub payments: Vec<PaymentSnapshot>,
}

/// Authoritative view of an order as read by the capture path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderSnapshot {
    pub id: String,
    pub status: String,
    /// Major currency units.
    pub total: Decimal,
    pub currency_code: String,
    pub lock: OrderLock,
    pub metadata: serde_json::Value,
    pub version: i32,
    pub payment_collections: Vec<PaymentCollectionSnapshot>,
}

impl OrderSnapshot {
    pub fn new(id: impl Into<String>, total: Decimal, currency_code: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: order::OrderStatus::Pending.to_string(),
            total,
            currency_code: currency_code.into(),
            lock: OrderLock::default(),
            metadata: json!({}),
            version: 1,
            payment_collections: Vec::new(),
        }
    }

    /// Adds an authorized payment for `payment_intent_id` in its own collection.
    pub fn with_authorized_payment(mut self, payment_intent_id: impl Into<String>) -> Self {
        let index = self.payment_collections.len() + 1;
        self.payment_collections.push(PaymentCollectionSnapshot {
            id: format!("paycol_{}_{}", self.id, index),
            status: PaymentCollectionStatus::Authorized.to_string(),
            payments: vec![PaymentSnapshot {
                id: format!("pay_{}_{}", self.id, index),
                provider_reference: payment_intent_id.into(),
                status: PaymentStatus::Authorized.to_string(),
                amount: self.total,
                currency_code: self.currency_code.clone(),
            }],
        });
        self
    }

    pub fn from_models(
        order: order::Model,
        collections: Vec<(payment_collection::Model, Vec<payment::Model>)>,
    ) -> Self {
        let lock = OrderLock {
            status: order.edit_status.parse().unwrap_or_default(),
            holder: order.lock_holder,
            locked_at: order.locked_at,
        };
        Self {
            id: order.id,
            status: order.status,
            total: order.total,
            currency_code: order.currency_code,
            lock,
            metadata: order.metadata.unwrap_or_else(|| json!({})),
            version: order.version,
            payment_collections: collections
                .into_iter()
                .map(|(collection, payments)| PaymentCollectionSnapshot {
                    id: collection.id,
                    status: collection.status,
                    payments: payments
                        .into_iter()
                        .map(|p| PaymentSnapshot {
                            id: p.id,
                            provider_reference: p.provider_reference,
                            status: p.status,
                            amount: p.amount,
                            currency_code: p.currency_code,
                        })
                        .collect(),
                })
                .collect(),
        }
    }

    /// First payment still holding an uncaptured authorization.
    pub fn capturable_payment(&self) -> Option<&PaymentSnapshot> {
        self.payment_collections
            .iter()
            .flat_map(|collection| collection.payments.iter())
            .find(|payment| payment.status == PaymentStatus::Authorized.as_ref())
    }

    pub fn is_canceled(&self) -> bool {
        self.status == order::OrderStatus::Canceled.as_ref()
    }
}

/// Result of a successful gateway capture, persisted against the order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureRecord {
    pub order_id: String,
    pub payment_intent_id: String,
    /// Minor currency units.
    pub amount: i64,
    pub currency_code: String,
    pub captured_at: DateTime<Utc>,
}

/// Order storage as seen by the capture scheduler.
#[async_trait]
pub trait OrderDataService: Send + Sync {
    async fn retrieve_order(&self, order_id: &str) -> Result<OrderSnapshot, ServiceError>;

    /// Conditionally marks the order `locked_for_capture` for `holder`.
    ///
    /// Succeeds only when the order is unlocked or its lock was taken before
    /// `stale_before`. Returns whether this caller now holds the lock.
    async fn try_lock_for_capture(
        &self,
        order_id: &str,
        holder: &str,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, ServiceError>;

    /// Sets the order back to `idle` if `holder` still owns the lock.
    async fn release_capture_lock(&self, order_id: &str, holder: &str)
        -> Result<bool, ServiceError>;

    async fn record_capture(&self, capture: &CaptureRecord) -> Result<(), ServiceError>;
}

/// sea-orm backed order data service.
#[derive(Clone)]
pub struct SeaOrmOrderService {
    db_pool: Arc<DbPool>,
}

impl SeaOrmOrderService {
    pub fn new(db_pool: Arc<DbPool>) -> Self {
        Self { db_pool }
    }
}

#[async_trait]
impl OrderDataService for SeaOrmOrderService {
    #[instrument(skip(self))]
    async fn retrieve_order(&self, order_id: &str) -> Result<OrderSnapshot, ServiceError> {
        let db = &*self.db_pool;
        let order = OrderEntity::find_by_id(order_id.to_string())
            .one(db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

        let collections = PaymentCollectionEntity::find()
            .filter(payment_collection::Column::OrderId.eq(order_id))
            .find_with_related(PaymentEntity)
            .all(db)
            .await?;

        Ok(OrderSnapshot::from_models(order, collections))
    }

    #[instrument(skip(self))]
    async fn try_lock_for_capture(
        &self,
        order_id: &str,
        holder: &str,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, ServiceError> {
        let now = Utc::now();
        let result = OrderEntity::update_many()
            .col_expr(
                order::Column::EditStatus,
                Expr::value(EditStatus::LockedForCapture.to_string()),
            )
            .col_expr(order::Column::LockHolder, Expr::value(Some(holder.to_string())))
            .col_expr(order::Column::LockedAt, Expr::value(Some(now)))
            .col_expr(order::Column::UpdatedAt, Expr::value(now))
            .filter(order::Column::Id.eq(order_id))
            .filter(
                Condition::any()
                    .add(order::Column::EditStatus.ne(EditStatus::LockedForCapture.to_string()))
                    .add(order::Column::LockedAt.lt(stale_before)),
            )
            .exec(&*self.db_pool)
            .await?;

        Ok(result.rows_affected == 1)
    }

    #[instrument(skip(self))]
    async fn release_capture_lock(
        &self,
        order_id: &str,
        holder: &str,
    ) -> Result<bool, ServiceError> {
        let result = OrderEntity::update_many()
            .col_expr(order::Column::EditStatus, Expr::value(EditStatus::Idle.to_string()))
            .col_expr(order::Column::LockHolder, Expr::value(Option::<String>::None))
            .col_expr(
                order::Column::LockedAt,
                Expr::value(Option::<DateTime<Utc>>::None),
            )
            .col_expr(order::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(order::Column::Id.eq(order_id))
            .filter(order::Column::EditStatus.eq(EditStatus::LockedForCapture.to_string()))
            .filter(order::Column::LockHolder.eq(holder))
            .exec(&*self.db_pool)
            .await?;

        Ok(result.rows_affected == 1)
    }

    #[instrument(skip(self, capture), fields(order_id = %capture.order_id, payment_intent_id = %capture.payment_intent_id))]
    async fn record_capture(&self, capture: &CaptureRecord) -> Result<(), ServiceError> {
        let capture = capture.clone();
        self.db_pool
            .transaction::<_, (), ServiceError>(|txn| {
                Box::pin(async move {
                    let collections = PaymentCollectionEntity::find()
                        .filter(payment_collection::Column::OrderId.eq(capture.order_id.as_str()))
                        .find_with_related(PaymentEntity)
                        .all(txn)
                        .await?;

                    let (collection, payment) = collections
                        .into_iter()
                        .find_map(|(collection, payments)| {
                            payments
                                .into_iter()
                                .find(|p| p.provider_reference == capture.payment_intent_id)
                                .map(|p| (collection, p))
                        })
                        .ok_or_else(|| {
                            ServiceError::NotFound(format!(
                                "Payment {} not found on order {}",
                                capture.payment_intent_id, capture.order_id
                            ))
                        })?;

                    let mut payment = payment.into_active_model();
                    payment.status = Set(PaymentStatus::Captured.to_string());
                    payment.captured_amount = Set(Some(from_minor_units(
                        capture.amount,
                        &capture.currency_code,
                    )));
                    payment.captured_at = Set(Some(capture.captured_at));
                    payment.update(txn).await?;

                    let mut collection = collection.into_active_model();
                    collection.status = Set(PaymentCollectionStatus::Completed.to_string());
                    collection.updated_at = Set(capture.captured_at);
                    collection.update(txn).await?;

                    let order = OrderEntity::find_by_id(capture.order_id.clone())
                        .one(txn)
                        .await?
                        .ok_or_else(|| {
                            ServiceError::NotFound(format!("Order {} not found", capture.order_id))
                        })?;
                    let metadata =
                        stamp_captured_at(order.metadata.clone(), capture.captured_at);
                    let mut order = order.into_active_model();
                    order.metadata = Set(Some(metadata));
                    order.update(txn).await?;

                    Ok(())
                })
            })
            .await
            .map_err(|e| match e {
                TransactionError::Connection(db_err) => ServiceError::DatabaseError(db_err),
                TransactionError::Transaction(service_err) => service_err,
            })?;

        debug!("Capture recorded");
        Ok(())
    }
}

fn stamp_captured_at(
    metadata: Option<serde_json::Value>,
    captured_at: DateTime<Utc>,
) -> serde_json::Value {
    let mut metadata = match metadata {
        Some(serde_json::Value::Object(map)) => map,
        _ => serde_json::Map::new(),
    };
    metadata.insert(
        PAYMENT_CAPTURED_AT_KEY.to_string(),
        json!(captured_at.to_rfc3339()),
    );
    serde_json::Value::Object(metadata)
}

/// In-process order store. Records every lock transition so callers can
/// assert on the order of `edit_status` writes.
#[derive(Debug, Clone, Default)]
pub struct InMemoryOrderService {
    orders: Arc<DashMap<String, OrderSnapshot>>,
    edit_status_history: Arc<DashMap<String, Vec<EditStatus>>>,
    captures: Arc<DashMap<String, CaptureRecord>>,
}

impl InMemoryOrderService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, order: OrderSnapshot) {
        self.orders.insert(order.id.clone(), order);
    }

    pub fn get(&self, order_id: &str) -> Option<OrderSnapshot> {
        self.orders.get(order_id).map(|entry| entry.value().clone())
    }

    /// Replaces the order total, as an edit committed outside the lock would.
    pub fn set_total(&self, order_id: &str, total: Decimal) {
        if let Some(mut order) = self.orders.get_mut(order_id) {
            order.total = total;
            order.version += 1;
        }
    }

    pub fn edit_status_history(&self, order_id: &str) -> Vec<EditStatus> {
        self.edit_status_history
            .get(order_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    pub fn capture_for(&self, order_id: &str) -> Option<CaptureRecord> {
        self.captures.get(order_id).map(|entry| entry.value().clone())
    }

    fn push_history(&self, order_id: &str, status: EditStatus) {
        self.edit_status_history
            .entry(order_id.to_string())
            .or_default()
            .push(status);
    }
}

#[async_trait]
impl OrderDataService for InMemoryOrderService {
    async fn retrieve_order(&self, order_id: &str) -> Result<OrderSnapshot, ServiceError> {
        self.get(order_id)
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))
    }

    async fn try_lock_for_capture(
        &self,
        order_id: &str,
        holder: &str,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, ServiceError> {
        let Some(mut order) = self.orders.get_mut(order_id) else {
            return Ok(false);
        };
        let available = !order.lock.is_locked()
            || order.lock.locked_at.is_some_and(|at| at < stale_before);
        if !available {
            return Ok(false);
        }
        order.lock = OrderLock::held_by(holder, Utc::now());
        drop(order);

        self.push_history(order_id, EditStatus::LockedForCapture);
        Ok(true)
    }

    async fn release_capture_lock(
        &self,
        order_id: &str,
        holder: &str,
    ) -> Result<bool, ServiceError> {
        let Some(mut order) = self.orders.get_mut(order_id) else {
            return Ok(false);
        };
        if !order.lock.is_locked() || order.lock.holder.as_deref() != Some(holder) {
            return Ok(false);
        }
        order.lock = OrderLock::released();
        drop(order);

        self.push_history(order_id, EditStatus::Idle);
        Ok(true)
    }

    async fn record_capture(&self, capture: &CaptureRecord) -> Result<(), ServiceError> {
        let mut order = self.orders.get_mut(&capture.order_id).ok_or_else(|| {
            ServiceError::NotFound(format!("Order {} not found", capture.order_id))
        })?;

        let mut found = false;
        for collection in order.payment_collections.iter_mut() {
            for payment in collection.payments.iter_mut() {
                if payment.provider_reference == capture.payment_intent_id {
                    payment.status = PaymentStatus::Captured.to_string();
                    collection.status = PaymentCollectionStatus::Completed.to_string();
                    found = true;
                }
            }
        }
        if !found {
            error!(
                order_id = %capture.order_id,
                payment_intent_id = %capture.payment_intent_id,
                "Captured payment not attached to order"
            );
            return Err(ServiceError::NotFound(format!(
                "Payment {} not found on order {}",
                capture.payment_intent_id, capture.order_id
            )));
        }
        order.metadata = stamp_captured_at(Some(order.metadata.clone()), capture.captured_at);
        drop(order);

        self.captures
            .insert(capture.order_id.clone(), capture.clone());
        info!(order_id = %capture.order_id, amount = capture.amount, "Capture recorded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn in_memory_lock_is_exclusive_until_released() {
        let orders = InMemoryOrderService::new();
        orders.insert(OrderSnapshot::new("ord_1", dec!(10.00), "usd"));
        let stale_before = Utc::now() - Duration::minutes(5);

        assert!(orders
            .try_lock_for_capture("ord_1", "job_a", stale_before)
            .await
            .unwrap());
        assert!(!orders
            .try_lock_for_capture("ord_1", "job_b", stale_before)
            .await
            .unwrap());

        // Only the holder may release.
        assert!(!orders.release_capture_lock("ord_1", "job_b").await.unwrap());
        assert!(orders.release_capture_lock("ord_1", "job_a").await.unwrap());

        assert_eq!(
            orders.edit_status_history("ord_1"),
            vec![EditStatus::LockedForCapture, EditStatus::Idle]
        );
    }

    #[tokio::test]
    async fn stale_lock_can_be_taken_over() {
        let orders = InMemoryOrderService::new();
        orders.insert(OrderSnapshot::new("ord_1", dec!(10.00), "usd"));

        assert!(orders
            .try_lock_for_capture("ord_1", "job_a", Utc::now())
            .await
            .unwrap());
        let later = Utc::now() + Duration::seconds(1);
        assert!(orders
            .try_lock_for_capture("ord_1", "job_b", later)
            .await
            .unwrap());
        assert_eq!(
            orders.get("ord_1").unwrap().lock.holder.as_deref(),
            Some("job_b")
        );
    }

    #[tokio::test]
    async fn stale_attempt_cannot_release_its_successors_lock() {
        let orders = InMemoryOrderService::new();
        orders.insert(OrderSnapshot::new("ord_1", dec!(10.00), "usd"));

        assert!(orders
            .try_lock_for_capture("ord_1", "capture:ord_1:1", Utc::now())
            .await
            .unwrap());
        let later = Utc::now() + Duration::seconds(1);
        assert!(orders
            .try_lock_for_capture("ord_1", "capture:ord_1:2", later)
            .await
            .unwrap());

        assert!(!orders
            .release_capture_lock("ord_1", "capture:ord_1:1")
            .await
            .unwrap());
        let order = orders.get("ord_1").unwrap();
        assert_eq!(order.lock.status, EditStatus::LockedForCapture);
        assert_eq!(order.lock.holder.as_deref(), Some("capture:ord_1:2"));
    }

    #[tokio::test]
    async fn record_capture_marks_payment_and_stamps_metadata() {
        let orders = InMemoryOrderService::new();
        orders.insert(OrderSnapshot::new("ord_1", dec!(50.00), "usd").with_authorized_payment("pi_1"));

        let captured_at = Utc::now();
        orders
            .record_capture(&CaptureRecord {
                order_id: "ord_1".into(),
                payment_intent_id: "pi_1".into(),
                amount: 5000,
                currency_code: "usd".into(),
                captured_at,
            })
            .await
            .unwrap();

        let order = orders.get("ord_1").unwrap();
        assert!(order.capturable_payment().is_none());
        assert_eq!(order.payment_collections[0].status, "completed");
        assert_eq!(
            order.metadata[PAYMENT_CAPTURED_AT_KEY],
            json!(captured_at.to_rfc3339())
        );
    }

    #[test]
    fn stamp_preserves_existing_metadata() {
        let now = Utc::now();
        let stamped = stamp_captured_at(Some(json!({"gift": true})), now);
        assert_eq!(stamped["gift"], json!(true));
        assert!(stamped.get(PAYMENT_CAPTURED_AT_KEY).is_some());
    }
}
