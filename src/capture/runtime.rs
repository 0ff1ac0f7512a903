use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::delay::DelayPolicy;
use super::queue::{CaptureQueue, QueueError};
use super::redis_queue::RedisCaptureQueue;
use super::scheduler::CaptureScheduler;
use super::trigger::ImmediateCaptureTrigger;
use super::worker::{start_worker_pool, CaptureWorker, WorkerHandle, WorkerSettings};
use crate::config::AppConfig;
use crate::errors::ServiceError;
use crate::events::EventSender;
use crate::services::orders::OrderDataService;
use crate::services::payments::PaymentGateway;

/// Cloneable entry points for code paths that enqueue or cancel captures.
#[derive(Clone)]
pub struct CaptureHandle {
    pub scheduler: CaptureScheduler,
    pub trigger: ImmediateCaptureTrigger,
    queue: Arc<dyn CaptureQueue>,
}

impl CaptureHandle {
    pub fn new(
        queue: Arc<dyn CaptureQueue>,
        policy: DelayPolicy,
        event_sender: Option<Arc<EventSender>>,
    ) -> Self {
        let mut scheduler = CaptureScheduler::new(queue.clone(), policy);
        if let Some(sender) = event_sender {
            scheduler = scheduler.with_event_sender(sender);
        }
        Self {
            scheduler,
            trigger: ImmediateCaptureTrigger::new(queue.clone()),
            queue,
        }
    }

    pub fn queue(&self) -> Arc<dyn CaptureQueue> {
        self.queue.clone()
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub delay: DelayPolicy,
    pub lock_ttl: Duration,
    pub worker: WorkerSettings,
}

impl From<&AppConfig> for RuntimeSettings {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            delay: cfg.delay_policy(),
            lock_ttl: cfg.lock_ttl(),
            worker: cfg.worker_settings(),
        }
    }
}

/// The process-wide capture machinery: queue, scheduler, trigger and the
/// worker pool. Built once at startup and torn down with [`shutdown`](Self::shutdown).
pub struct CaptureRuntime {
    handle: CaptureHandle,
    worker: WorkerHandle,
}

impl CaptureRuntime {
    /// Wires the scheduler, trigger and worker pool around `queue` and
    /// starts consuming jobs.
    pub fn start(
        queue: Arc<dyn CaptureQueue>,
        orders: Arc<dyn OrderDataService>,
        gateway: Arc<dyn PaymentGateway>,
        settings: RuntimeSettings,
        event_sender: Option<Arc<EventSender>>,
    ) -> Self {
        let handle = CaptureHandle::new(queue.clone(), settings.delay, event_sender.clone());
        let mut worker = CaptureWorker::new(orders, gateway, settings.lock_ttl);
        if let Some(sender) = event_sender {
            worker = worker.with_event_sender(sender);
        }

        let worker = start_worker_pool(queue, Arc::new(worker), settings.worker);
        info!(
            capture_delay_ms = settings.delay.capture_delay_ms(),
            "Capture runtime started"
        );

        Self { handle, worker }
    }

    /// Connects the Redis queue from `config` and starts the runtime.
    ///
    /// Returns `Ok(None)` when no queue backend is configured: payment
    /// capture is disabled rather than fatal. Connection failures are errors.
    pub async fn load(
        config: &AppConfig,
        orders: Arc<dyn OrderDataService>,
        gateway: Arc<dyn PaymentGateway>,
        event_sender: Option<Arc<EventSender>>,
    ) -> Result<Option<Self>, ServiceError> {
        let queue = match RedisCaptureQueue::connect(
            config.redis_url(),
            config.capture_queue_namespace.clone(),
            config.retry_policy(),
        )
        .await
        {
            Ok(queue) => queue,
            Err(QueueError::NotConfigured) => {
                warn!("Capture queue backend not configured (REDIS_URL unset); payment capture worker not started");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        queue.ping().await?;

        Ok(Some(Self::start(
            Arc::new(queue),
            orders,
            gateway,
            RuntimeSettings::from(config),
            event_sender,
        )))
    }

    pub fn handle(&self) -> CaptureHandle {
        self.handle.clone()
    }

    /// Stops the worker pool, waiting for in-flight captures.
    pub async fn shutdown(self) {
        info!("Shutting down capture runtime");
        self.worker.shutdown().await;
    }
}
