/*!
 * # Metrics Module
 *
 * Prometheus metrics for the capture scheduler, exposed in text format at
 * `/metrics`.
 *
 * - Capture jobs completed / failed
 * - Capture locks currently held by this process
 * - Order edits rejected because the order was locked
 * - Order edit commands applied / failed, by command
 */

use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("Failed to export metrics: {0}")]
    ExportError(String),
}

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref CAPTURE_JOBS_COMPLETED: IntCounter = IntCounter::new(
        "capture_jobs_completed_total",
        "Total number of payment captures completed"
    )
    .expect("metric can be created");
    pub static ref CAPTURE_JOBS_FAILED: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "capture_jobs_failed_total",
            "Total number of failed payment capture attempts"
        ),
        &["reason"]
    )
    .expect("metric can be created");
    pub static ref CAPTURE_JOBS_SCHEDULED: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "capture_jobs_scheduled_total",
            "Total number of payment capture jobs scheduled"
        ),
        &["source"]
    )
    .expect("metric can be created");
    pub static ref CAPTURE_LOCKS_HELD: IntGauge = IntGauge::new(
        "capture_locks_held",
        "Order capture locks currently held by this process"
    )
    .expect("metric can be created");
    pub static ref ORDER_EDIT_REJECTIONS: IntCounter = IntCounter::new(
        "order_edit_rejections_total",
        "Total number of order edits rejected because the order was locked for capture"
    )
    .expect("metric can be created");
    pub static ref ORDER_ITEMS_ADDED: IntCounter = IntCounter::new(
        "order_items_added_total",
        "Total number of items added to orders"
    )
    .expect("metric can be created");
    pub static ref ORDER_ITEM_ADD_FAILURES: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "order_item_add_failures_total",
            "Total number of failed item additions to orders"
        ),
        &["error_type"]
    )
    .expect("metric can be created");
    pub static ref ORDER_ITEMS_UPDATED: IntCounter = IntCounter::new(
        "order_items_updated_total",
        "Total number of order item quantity changes"
    )
    .expect("metric can be created");
    pub static ref ORDER_ITEM_UPDATE_FAILURES: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "order_item_update_failures_total",
            "Total number of failed order item quantity changes"
        ),
        &["error_type"]
    )
    .expect("metric can be created");
    pub static ref ORDER_CANCELLATIONS: IntCounter = IntCounter::new(
        "order_cancellations_total",
        "Total number of order cancellations"
    )
    .expect("metric can be created");
    pub static ref ORDER_CANCELLATION_FAILURES: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "order_cancellation_failures_total",
            "Total number of failed order cancellations"
        ),
        &["error_type"]
    )
    .expect("metric can be created");
}

/// Registers the capture and order edit metrics with [`REGISTRY`]. Safe to call more than once.
pub fn register_metrics() {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(CAPTURE_JOBS_COMPLETED.clone()),
        Box::new(CAPTURE_JOBS_FAILED.clone()),
        Box::new(CAPTURE_JOBS_SCHEDULED.clone()),
        Box::new(CAPTURE_LOCKS_HELD.clone()),
        Box::new(ORDER_EDIT_REJECTIONS.clone()),
        Box::new(ORDER_ITEMS_ADDED.clone()),
        Box::new(ORDER_ITEM_ADD_FAILURES.clone()),
        Box::new(ORDER_ITEMS_UPDATED.clone()),
        Box::new(ORDER_ITEM_UPDATE_FAILURES.clone()),
        Box::new(ORDER_CANCELLATIONS.clone()),
        Box::new(ORDER_CANCELLATION_FAILURES.clone()),
    ];
    for collector in collectors {
        // AlreadyReg on repeated calls is expected.
        let _ = REGISTRY.register(collector);
    }
}

/// Renders all registered metrics in the Prometheus text format.
pub fn export_metrics() -> Result<String, MetricsError> {
    register_metrics();
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&REGISTRY.gather(), &mut buffer)
        .map_err(|e| MetricsError::ExportError(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| MetricsError::ExportError(e.to_string()))
}
