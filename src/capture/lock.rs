/*!
 * # Order Lock
 *
 * Mutual exclusion between capture execution and order edits. The lock lives
 * on the order row (`edit_status`, `lock_holder`, `locked_at`) and is taken
 * with a conditional update, so two workers cannot both believe they hold it.
 *
 * ```text
 * editable ──acquire──► locked_for_capture ──release──► idle ──acquire──► ...
 * ```
 */

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use strum::{AsRefStr, Display, EnumString};
use tracing::{debug, error, info, warn};

use crate::errors::ServiceError;
use crate::metrics::CAPTURE_LOCKS_HELD;
use crate::services::orders::OrderDataService;

pub const DEFAULT_LOCK_TTL_SECS: u64 = 300;

#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EditStatus {
    #[default]
    Editable,
    LockedForCapture,
    /// Written on release. Unlocked, same as `Editable`.
    Idle,
}

/// Lock state of a single order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLock {
    pub status: EditStatus,
    pub holder: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
}

impl OrderLock {
    pub fn held_by(holder: impl Into<String>, locked_at: DateTime<Utc>) -> Self {
        Self {
            status: EditStatus::LockedForCapture,
            holder: Some(holder.into()),
            locked_at: Some(locked_at),
        }
    }

    pub fn released() -> Self {
        Self {
            status: EditStatus::Idle,
            holder: None,
            locked_at: None,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.status == EditStatus::LockedForCapture
    }

    /// True while the lock is held and younger than `ttl`. A lock without a
    /// timestamp never expires.
    pub fn is_held_at(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        if !self.is_locked() {
            return false;
        }
        match (self.locked_at, chrono::Duration::from_std(ttl)) {
            (Some(locked_at), Ok(ttl)) => locked_at + ttl > now,
            _ => true,
        }
    }
}

/// Acquires and releases capture locks through the order data service.
#[derive(Clone)]
pub struct OrderLockManager {
    orders: Arc<dyn OrderDataService>,
    ttl: Duration,
}

impl OrderLockManager {
    pub fn new(orders: Arc<dyn OrderDataService>, ttl: Duration) -> Self {
        Self { orders, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Attempts to lock `order_id` for `holder`. Returns `false` when another
    /// holder has a live lock.
    pub async fn try_acquire(&self, order_id: &str, holder: &str) -> Result<bool, ServiceError> {
        let stale_before = Utc::now()
            - chrono::Duration::from_std(self.ttl)
                .map_err(|e| ServiceError::InternalError(format!("invalid lock ttl: {}", e)))?;

        let acquired = self
            .orders
            .try_lock_for_capture(order_id, holder, stale_before)
            .await?;
        if acquired {
            CAPTURE_LOCKS_HELD.inc();
            info!(order_id = %order_id, holder = %holder, "Order locked for capture");
        } else {
            debug!(order_id = %order_id, holder = %holder, "Order lock held elsewhere");
        }
        Ok(acquired)
    }

    pub async fn release(&self, order_id: &str, holder: &str) -> Result<(), ServiceError> {
        if self.orders.release_capture_lock(order_id, holder).await? {
            CAPTURE_LOCKS_HELD.dec();
            info!(order_id = %order_id, holder = %holder, "Order capture lock released");
        } else {
            warn!(
                order_id = %order_id,
                holder = %holder,
                "Capture lock was no longer held by this holder"
            );
        }
        Ok(())
    }

    /// Runs `critical` while holding the order lock.
    ///
    /// The lock is released after `critical` finishes, whether it returned
    /// `Ok`, returned `Err` or panicked; the original outcome is then handed
    /// back unchanged. A failed release is logged and left to expire by TTL.
    /// Losing the acquire race yields [`ServiceError::Conflict`] without
    /// running `critical`.
    pub async fn with_lock<T, F, Fut>(
        &self,
        order_id: &str,
        holder: &str,
        critical: F,
    ) -> Result<T, ServiceError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        if !self.try_acquire(order_id, holder).await? {
            return Err(ServiceError::Conflict(format!(
                "Order {} is already locked for capture",
                order_id
            )));
        }

        let outcome = AssertUnwindSafe(critical()).catch_unwind().await;

        if let Err(e) = self.release(order_id, holder).await {
            error!(
                order_id = %order_id,
                holder = %holder,
                error = %e,
                "Failed to release capture lock"
            );
        }

        match outcome {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}
