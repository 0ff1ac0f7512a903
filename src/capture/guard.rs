use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::warn;

use super::lock::DEFAULT_LOCK_TTL_SECS;
use crate::errors::OrderLockedError;
use crate::metrics::ORDER_EDIT_REJECTIONS;
use crate::services::orders::OrderSnapshot;

/// Precondition check run by every order-modification workflow.
#[derive(Debug, Clone, Copy)]
pub struct EditGuard {
    lock_ttl: Duration,
}

impl EditGuard {
    pub fn new(lock_ttl: Duration) -> Self {
        Self { lock_ttl }
    }

    pub fn lock_ttl(&self) -> Duration {
        self.lock_ttl
    }

    /// Locks taken before this instant are expired.
    pub fn stale_before(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match chrono::Duration::from_std(self.lock_ttl) {
            Ok(ttl) => now - ttl,
            Err(_) => DateTime::<Utc>::MIN_UTC,
        }
    }

    /// Rejects the edit while the order is locked for capture.
    ///
    /// A lock older than the TTL belongs to a crashed worker and does not
    /// block edits.
    pub fn validate_preconditions(&self, order: &OrderSnapshot) -> Result<(), OrderLockedError> {
        if !order.lock.is_held_at(Utc::now(), self.lock_ttl) {
            return Ok(());
        }

        ORDER_EDIT_REJECTIONS.inc();
        let err = OrderLockedError::new(order.id.clone());
        warn!(
            order_id = %order.id,
            lock_holder = order.lock.holder.as_deref().unwrap_or("unknown"),
            reason = %err.message,
            "Order edit rejected: order is locked for capture"
        );
        Err(err)
    }
}

impl Default for EditGuard {
    fn default() -> Self {
        Self::new(Duration::from_secs(DEFAULT_LOCK_TTL_SECS))
    }
}
