/*!
 * # Capture Worker
 *
 * Executes due capture jobs. Each attempt re-reads the order, takes the
 * order lock, re-validates the live authorization, captures and records the
 * result. The lock is released on every exit path and the attempt's error is
 * handed back to the queue for retry bookkeeping.
 */

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{error, info, instrument, warn};

use super::currency::to_minor_units;
use super::lock::OrderLockManager;
use super::queue::{CaptureJob, CaptureQueue, JobDisposition, QueueError};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::metrics::{CAPTURE_JOBS_COMPLETED, CAPTURE_JOBS_FAILED};
use crate::services::orders::{CaptureRecord, OrderDataService, OrderSnapshot};
use crate::services::payments::{AuthorizationStatus, CaptureRequest, PaymentGateway};

pub const DEFAULT_WORKER_CONCURRENCY: usize = 4;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 500;
pub const DEFAULT_STALL_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CaptureOutcome {
    pub order_id: String,
    pub payment_intent_id: String,
    /// Minor units.
    pub amount: i64,
    pub currency_code: String,
    pub captured_at: DateTime<Utc>,
    /// The authorization had already been captured by an earlier attempt.
    pub already_captured: bool,
}

#[derive(Clone)]
pub struct CaptureWorker {
    orders: Arc<dyn OrderDataService>,
    gateway: Arc<dyn PaymentGateway>,
    locks: OrderLockManager,
    event_sender: Option<Arc<EventSender>>,
}

impl CaptureWorker {
    pub fn new(
        orders: Arc<dyn OrderDataService>,
        gateway: Arc<dyn PaymentGateway>,
        lock_ttl: Duration,
    ) -> Self {
        Self {
            locks: OrderLockManager::new(orders.clone(), lock_ttl),
            orders,
            gateway,
            event_sender: None,
        }
    }

    pub fn with_event_sender(mut self, event_sender: Arc<EventSender>) -> Self {
        self.event_sender = Some(event_sender);
        self
    }

    /// Runs one capture attempt for `job`.
    #[instrument(
        skip(self, job),
        fields(
            job_id = %job.id,
            order_id = %job.order_id,
            payment_intent_id = %job.payment_intent_id,
            source = %job.source,
            attempt = job.attempts
        )
    )]
    pub async fn process_payment_capture(
        &self,
        job: &CaptureJob,
    ) -> Result<CaptureOutcome, ServiceError> {
        let result = self.run(job).await;

        match &result {
            Ok(outcome) => {
                CAPTURE_JOBS_COMPLETED.inc();
                info!(
                    amount = outcome.amount,
                    currency = %outcome.currency_code,
                    already_captured = outcome.already_captured,
                    "Payment captured"
                );
                self.emit(Event::PaymentCaptured {
                    order_id: outcome.order_id.clone(),
                    payment_intent_id: outcome.payment_intent_id.clone(),
                    amount: outcome.amount,
                    currency_code: outcome.currency_code.clone(),
                    captured_at: outcome.captured_at,
                })
                .await;
            }
            Err(e) => {
                CAPTURE_JOBS_FAILED
                    .with_label_values(&[failure_reason(e)])
                    .inc();
                error!(error = %e, "Payment capture failed");
                self.emit(Event::PaymentCaptureFailed {
                    order_id: job.order_id.clone(),
                    payment_intent_id: job.payment_intent_id.clone(),
                    reason: e.to_string(),
                })
                .await;
            }
        }

        result
    }

    async fn run(&self, job: &CaptureJob) -> Result<CaptureOutcome, ServiceError> {
        let order = self.orders.retrieve_order(&job.order_id).await?;
        if order.is_canceled() {
            return Err(ServiceError::InvalidStatus(format!(
                "Order {} is canceled",
                order.id
            )));
        }

        let holder = job.lock_holder();
        self.locks
            .with_lock(&job.order_id, &holder, || self.capture_locked(job))
            .await
    }

    async fn capture_locked(&self, job: &CaptureJob) -> Result<CaptureOutcome, ServiceError> {
        // Edits committed before the lock was taken are only visible on a fresh read.
        let order = self.orders.retrieve_order(&job.order_id).await?;
        if order.is_canceled() {
            return Err(ServiceError::InvalidStatus(format!(
                "Order {} was canceled before capture",
                order.id
            )));
        }

        let authorization = self
            .gateway
            .retrieve_authorization(&job.payment_intent_id)
            .await?;

        if authorization.status == AuthorizationStatus::Succeeded
            && authorization.amount_received > 0
        {
            info!("Authorization already captured; recording result");
            return self
                .record(&order, job, authorization.amount_received, true)
                .await;
        }

        if authorization.status != AuthorizationStatus::RequiresCapture {
            return Err(ServiceError::InvalidStatus(format!(
                "Payment intent {} is {}, expected requires_capture",
                authorization.id, authorization.status
            )));
        }

        if !authorization
            .currency
            .eq_ignore_ascii_case(&order.currency_code)
        {
            return Err(ServiceError::InvalidOperation(format!(
                "Order {} currency {} does not match authorization currency {}",
                order.id, order.currency_code, authorization.currency
            )));
        }

        let amount_due = to_minor_units(order.total, &order.currency_code)?;
        if amount_due > authorization.amount {
            return Err(ServiceError::AuthorizationExceeded {
                order_id: order.id.clone(),
                amount_due,
                authorized: authorization.amount,
            });
        }

        self.gateway
            .capture(&CaptureRequest {
                payment_intent_id: job.payment_intent_id.clone(),
                amount: amount_due,
                idempotency_key: job.idempotency_key(),
            })
            .await?;

        self.record(&order, job, amount_due, false).await
    }

    async fn record(
        &self,
        order: &OrderSnapshot,
        job: &CaptureJob,
        amount: i64,
        already_captured: bool,
    ) -> Result<CaptureOutcome, ServiceError> {
        let record = CaptureRecord {
            order_id: order.id.clone(),
            payment_intent_id: job.payment_intent_id.clone(),
            amount,
            currency_code: order.currency_code.clone(),
            captured_at: Utc::now(),
        };
        self.orders.record_capture(&record).await?;

        Ok(CaptureOutcome {
            order_id: record.order_id,
            payment_intent_id: record.payment_intent_id,
            amount: record.amount,
            currency_code: record.currency_code,
            captured_at: record.captured_at,
            already_captured,
        })
    }

    async fn emit(&self, event: Event) {
        if let Some(sender) = &self.event_sender {
            if let Err(e) = sender.send(event).await {
                warn!(error = %e, "Failed to send capture event");
            }
        }
    }
}

fn failure_reason(err: &ServiceError) -> &'static str {
    match err {
        ServiceError::AuthorizationExceeded { .. } => "amount_exceeds_authorization",
        ServiceError::InvalidStatus(_) => "invalid_status",
        ServiceError::InvalidOperation(_) => "invalid_operation",
        ServiceError::Conflict(_) => "locked",
        ServiceError::NotFound(_) => "not_found",
        ServiceError::PaymentFailed(_) | ServiceError::ExternalServiceError(_) => "gateway",
        _ => "internal",
    }
}

/// Runs one capture job and reports its outcome to the queue.
pub async fn execute_job(queue: &dyn CaptureQueue, worker: &CaptureWorker, job: CaptureJob) {
    match worker.process_payment_capture(&job).await {
        Ok(_) => {
            if let Err(e) = queue.complete(&job).await {
                error!(job_id = %job.id, error = %e, "Failed to mark capture job completed");
            }
        }
        Err(err) => match queue.fail(&job, &err.to_string()).await {
            Ok(JobDisposition::Retrying { run_at }) => {
                warn!(
                    job_id = %job.id,
                    attempt = job.attempts,
                    run_at,
                    "Capture attempt failed; retry scheduled"
                );
            }
            Ok(JobDisposition::Failed) => {
                error!(
                    job_id = %job.id,
                    attempts = job.attempts,
                    error = %err,
                    "Capture job failed permanently"
                );
            }
            Err(e) => {
                error!(job_id = %job.id, error = %e, "Failed to record capture job failure");
            }
        },
    }
}

/// Claims every due job (up to `limit`) and runs them one after another.
/// Returns the number of jobs executed.
pub async fn run_due_jobs(
    queue: &dyn CaptureQueue,
    worker: &CaptureWorker,
    limit: usize,
) -> Result<usize, QueueError> {
    let jobs = queue.reserve_due(limit).await?;
    let count = jobs.len();
    for job in jobs {
        execute_job(queue, worker, job).await;
    }
    Ok(count)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSettings {
    pub concurrency: usize,
    pub poll_interval: Duration,
    pub stall_timeout: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_WORKER_CONCURRENCY,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            stall_timeout: Duration::from_secs(DEFAULT_STALL_TIMEOUT_SECS),
        }
    }
}

/// Owning handle for a running worker pool.
///
/// Dropping the handle without calling [`shutdown`](Self::shutdown) also stops
/// polling, but does not wait for in-flight captures.
pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Stops polling and waits for in-flight captures to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            error!(error = %e, "Capture worker task ended abnormally");
        }
    }
}

/// Spawns the polling loop that feeds due jobs to `worker`, running at most
/// `settings.concurrency` captures at once.
pub fn start_worker_pool(
    queue: Arc<dyn CaptureQueue>,
    worker: Arc<CaptureWorker>,
    settings: WorkerSettings,
) -> WorkerHandle {
    let (shutdown, mut shutdown_rx) = watch::channel(false);

    let task = tokio::spawn(async move {
        let semaphore = Arc::new(Semaphore::new(settings.concurrency.max(1)));
        let mut in_flight = JoinSet::new();
        let mut ticker =
            tokio::time::interval(settings.poll_interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_recovery = Instant::now();

        info!(
            concurrency = settings.concurrency,
            poll_interval_ms = settings.poll_interval.as_millis() as u64,
            "Capture worker started"
        );

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                _ = ticker.tick() => {}
            }

            while let Some(joined) = in_flight.try_join_next() {
                if let Err(e) = joined {
                    error!(error = %e, "Capture task panicked; job will be recovered as stalled");
                }
            }

            if last_recovery.elapsed() >= settings.stall_timeout {
                last_recovery = Instant::now();
                match queue.recover_stalled(settings.stall_timeout).await {
                    Ok(0) => {}
                    Ok(recovered) => warn!(recovered, "Requeued stalled capture jobs"),
                    Err(e) => warn!(error = %e, "Stalled capture job recovery failed"),
                }
            }

            let available = semaphore.available_permits();
            if available == 0 {
                continue;
            }

            let jobs = match queue.reserve_due(available).await {
                Ok(jobs) => jobs,
                Err(e) if e.is_transient() => {
                    warn!(error = %e, "Failed to reserve due capture jobs");
                    continue;
                }
                Err(e) => {
                    error!(error = %e, "Capture queue returned an unexpected error");
                    continue;
                }
            };

            for job in jobs {
                let Ok(permit) = semaphore.clone().acquire_owned().await else {
                    break;
                };
                let queue = queue.clone();
                let worker = worker.clone();
                in_flight.spawn(async move {
                    let _permit = permit;
                    execute_job(queue.as_ref(), &worker, job).await;
                });
            }
        }

        info!(in_flight = in_flight.len(), "Capture worker draining");
        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Capture task panicked during shutdown");
            }
        }
        info!("Capture worker stopped");
    });

    WorkerHandle { shutdown, task }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::lock::{EditStatus, DEFAULT_LOCK_TTL_SECS};
    use crate::capture::memory_queue::InMemoryCaptureQueue;
    use crate::capture::queue::ScheduleOptions;
    use crate::services::orders::InMemoryOrderService;
    use crate::services::payments::PaymentAuthorization;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use mockall::{mock, Sequence};
    use rust_decimal_macros::dec;

    mock! {
        pub Gateway {}

        #[async_trait]
        impl PaymentGateway for Gateway {
            async fn retrieve_authorization(
                &self,
                payment_intent_id: &str,
            ) -> Result<PaymentAuthorization, ServiceError>;

            async fn capture(
                &self,
                request: &CaptureRequest,
            ) -> Result<PaymentAuthorization, ServiceError>;
        }
    }

    mock! {
        pub Orders {}

        #[async_trait]
        impl OrderDataService for Orders {
            async fn retrieve_order(&self, order_id: &str) -> Result<OrderSnapshot, ServiceError>;

            async fn try_lock_for_capture(
                &self,
                order_id: &str,
                holder: &str,
                stale_before: DateTime<Utc>,
            ) -> Result<bool, ServiceError>;

            async fn release_capture_lock(
                &self,
                order_id: &str,
                holder: &str,
            ) -> Result<bool, ServiceError>;

            async fn record_capture(&self, capture: &CaptureRecord) -> Result<(), ServiceError>;
        }
    }

    fn authorization(status: AuthorizationStatus, amount: i64) -> PaymentAuthorization {
        PaymentAuthorization {
            id: "pi_1".into(),
            status,
            amount,
            currency: "usd".into(),
            amount_received: 0,
        }
    }

    fn job() -> CaptureJob {
        let mut job = CaptureJob::new("ord_1", "pi_1", 0, &ScheduleOptions::normal(), 0);
        job.attempts = 1;
        job
    }

    fn worker_with(orders: &InMemoryOrderService, gateway: MockGateway) -> CaptureWorker {
        CaptureWorker::new(
            Arc::new(orders.clone()),
            Arc::new(gateway),
            Duration::from_secs(DEFAULT_LOCK_TTL_SECS),
        )
    }

    fn orders_with_total(total: rust_decimal::Decimal) -> InMemoryOrderService {
        let orders = InMemoryOrderService::new();
        orders.insert(OrderSnapshot::new("ord_1", total, "usd").with_authorized_payment("pi_1"));
        orders
    }

    #[tokio::test]
    async fn captures_live_order_total_with_idempotency_key() {
        let orders = orders_with_total(dec!(45.50));
        let mut gateway = MockGateway::new();
        gateway
            .expect_retrieve_authorization()
            .withf(|payment_intent_id| payment_intent_id == "pi_1")
            .times(1)
            .returning(|_| Ok(authorization(AuthorizationStatus::RequiresCapture, 5000)));
        gateway
            .expect_capture()
            .withf(|req| {
                req.payment_intent_id == "pi_1"
                    && req.amount == 4550
                    && req.idempotency_key == "capture_ord_1_pi_1"
            })
            .times(1)
            .returning(|_| Ok(authorization(AuthorizationStatus::Succeeded, 5000)));

        let outcome = worker_with(&orders, gateway)
            .process_payment_capture(&job())
            .await
            .unwrap();

        assert_eq!(outcome.amount, 4550);
        assert!(!outcome.already_captured);
        assert_eq!(
            orders.edit_status_history("ord_1"),
            vec![EditStatus::LockedForCapture, EditStatus::Idle]
        );
        assert_eq!(orders.capture_for("ord_1").unwrap().amount, 4550);
    }

    #[tokio::test]
    async fn amount_above_authorization_fails_without_capture_and_releases_lock() {
        let orders = orders_with_total(dec!(60.00));
        let mut gateway = MockGateway::new();
        gateway
            .expect_retrieve_authorization()
            .returning(|_| Ok(authorization(AuthorizationStatus::RequiresCapture, 5000)));
        gateway.expect_capture().never();

        let err = worker_with(&orders, gateway)
            .process_payment_capture(&job())
            .await
            .unwrap_err();

        assert_matches!(
            err,
            ServiceError::AuthorizationExceeded {
                amount_due: 6000,
                authorized: 5000,
                ..
            }
        );
        assert_eq!(
            orders.edit_status_history("ord_1"),
            vec![EditStatus::LockedForCapture, EditStatus::Idle]
        );
        assert!(orders.capture_for("ord_1").is_none());
    }

    #[tokio::test]
    async fn lock_release_follows_failure_in_strict_order() {
        let mut seq = Sequence::new();
        let mut orders = MockOrders::new();
        let snapshot =
            OrderSnapshot::new("ord_1", dec!(60.00), "usd").with_authorized_payment("pi_1");

        orders
            .expect_retrieve_order()
            .times(2)
            .returning(move |_| Ok(snapshot.clone()));
        orders
            .expect_try_lock_for_capture()
            .withf(|order_id, holder, _| order_id == "ord_1" && holder == "capture:ord_1:1")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(true));
        orders
            .expect_release_capture_lock()
            .withf(|order_id, holder| order_id == "ord_1" && holder == "capture:ord_1:1")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(true));
        orders.expect_record_capture().never();

        let mut gateway = MockGateway::new();
        gateway
            .expect_retrieve_authorization()
            .returning(|_| Ok(authorization(AuthorizationStatus::RequiresCapture, 5000)));
        gateway.expect_capture().never();

        let worker = CaptureWorker::new(
            Arc::new(orders),
            Arc::new(gateway),
            Duration::from_secs(DEFAULT_LOCK_TTL_SECS),
        );
        assert!(worker.process_payment_capture(&job()).await.is_err());
    }

    #[tokio::test]
    async fn order_canceled_while_waiting_for_lock_is_not_captured() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let reads = AtomicUsize::new(0);
        let mut orders = MockOrders::new();
        orders.expect_retrieve_order().times(2).returning(move |_| {
            let mut order =
                OrderSnapshot::new("ord_1", dec!(20.00), "usd").with_authorized_payment("pi_1");
            if reads.fetch_add(1, Ordering::SeqCst) > 0 {
                order.status = "canceled".into();
            }
            Ok(order)
        });
        orders
            .expect_try_lock_for_capture()
            .times(1)
            .returning(|_, _, _| Ok(true));
        orders
            .expect_release_capture_lock()
            .withf(|order_id, holder| order_id == "ord_1" && holder == "capture:ord_1:1")
            .times(1)
            .returning(|_, _| Ok(true));
        orders.expect_record_capture().never();

        let mut gateway = MockGateway::new();
        gateway.expect_retrieve_authorization().never();
        gateway.expect_capture().never();

        let worker = CaptureWorker::new(
            Arc::new(orders),
            Arc::new(gateway),
            Duration::from_secs(DEFAULT_LOCK_TTL_SECS),
        );
        let err = worker.process_payment_capture(&job()).await.unwrap_err();

        assert_matches!(err, ServiceError::InvalidStatus(_));
    }

    #[tokio::test]
    async fn gateway_error_still_releases_lock() {
        let orders = orders_with_total(dec!(20.00));
        let mut gateway = MockGateway::new();
        gateway
            .expect_retrieve_authorization()
            .returning(|_| Ok(authorization(AuthorizationStatus::RequiresCapture, 2000)));
        gateway
            .expect_capture()
            .returning(|_| Err(ServiceError::ExternalServiceError("timeout".into())));

        let err = worker_with(&orders, gateway)
            .process_payment_capture(&job())
            .await
            .unwrap_err();

        assert_matches!(err, ServiceError::ExternalServiceError(_));
        assert_eq!(orders.get("ord_1").unwrap().lock.status, EditStatus::Idle);
    }

    #[tokio::test]
    async fn authorization_not_capturable_is_rejected() {
        let orders = orders_with_total(dec!(20.00));
        let mut gateway = MockGateway::new();
        gateway
            .expect_retrieve_authorization()
            .returning(|_| Ok(authorization(AuthorizationStatus::Canceled, 2000)));
        gateway.expect_capture().never();

        let err = worker_with(&orders, gateway)
            .process_payment_capture(&job())
            .await
            .unwrap_err();

        assert_matches!(err, ServiceError::InvalidStatus(_));
        assert_eq!(orders.get("ord_1").unwrap().lock.status, EditStatus::Idle);
    }

    #[tokio::test]
    async fn already_captured_authorization_is_recorded_without_recapture() {
        let orders = orders_with_total(dec!(20.00));
        let mut gateway = MockGateway::new();
        gateway.expect_retrieve_authorization().returning(|_| {
            Ok(PaymentAuthorization {
                amount_received: 2000,
                ..authorization(AuthorizationStatus::Succeeded, 2000)
            })
        });
        gateway.expect_capture().never();

        let outcome = worker_with(&orders, gateway)
            .process_payment_capture(&job())
            .await
            .unwrap();

        assert!(outcome.already_captured);
        assert_eq!(orders.capture_for("ord_1").unwrap().amount, 2000);
    }

    #[tokio::test]
    async fn locked_order_is_not_captured_twice() {
        let orders = orders_with_total(dec!(20.00));
        assert!(orders
            .try_lock_for_capture("ord_1", "someone_else", Utc::now() - chrono::Duration::hours(1))
            .await
            .unwrap());
        let mut gateway = MockGateway::new();
        gateway.expect_retrieve_authorization().never();
        gateway.expect_capture().never();

        let err = worker_with(&orders, gateway)
            .process_payment_capture(&job())
            .await
            .unwrap_err();

        assert_matches!(err, ServiceError::Conflict(_));
        assert_eq!(
            orders.get("ord_1").unwrap().lock.holder.as_deref(),
            Some("someone_else")
        );
    }

    #[tokio::test]
    async fn canceled_order_is_not_locked() {
        let orders = InMemoryOrderService::new();
        let mut order = OrderSnapshot::new("ord_1", dec!(20.00), "usd").with_authorized_payment("pi_1");
        order.status = "canceled".into();
        orders.insert(order);
        let mut gateway = MockGateway::new();
        gateway.expect_retrieve_authorization().never();

        let err = worker_with(&orders, gateway)
            .process_payment_capture(&job())
            .await
            .unwrap_err();

        assert_matches!(err, ServiceError::InvalidStatus(_));
        assert!(orders.edit_status_history("ord_1").is_empty());
    }

    #[tokio::test]
    async fn pool_drains_due_jobs_and_shuts_down() {
        let orders = orders_with_total(dec!(10.00));
        let mut gateway = MockGateway::new();
        gateway
            .expect_retrieve_authorization()
            .returning(|_| Ok(authorization(AuthorizationStatus::RequiresCapture, 1000)));
        gateway
            .expect_capture()
            .times(1)
            .returning(|_| Ok(authorization(AuthorizationStatus::Succeeded, 1000)));

        let queue = Arc::new(InMemoryCaptureQueue::new());
        queue
            .schedule("ord_1", "pi_1", 0, ScheduleOptions::immediate())
            .await
            .unwrap();

        let handle = start_worker_pool(
            queue.clone(),
            Arc::new(worker_with(&orders, gateway)),
            WorkerSettings {
                concurrency: 2,
                poll_interval: Duration::from_millis(10),
                stall_timeout: Duration::from_secs(60),
            },
        );

        for _ in 0..100 {
            if orders.capture_for("ord_1").is_some() && queue.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.shutdown().await;

        assert!(orders.capture_for("ord_1").is_some());
        assert!(queue.is_empty());
    }
}
