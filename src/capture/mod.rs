//! Deferred payment capture.
//!
//! Checkout schedules a capture job that fires when the order's edit window
//! closes. The worker locks the order, captures the authorized payment and
//! releases the lock; edit paths consult the lock through [`guard::EditGuard`].

pub mod currency;
pub mod delay;
pub mod guard;
pub mod lock;
pub mod memory_queue;
pub mod queue;
pub mod redis_queue;
pub mod runtime;
pub mod scheduler;
pub mod trigger;
pub mod worker;

pub use delay::{calculate_capture_delay_ms, DelayPolicy, DEFAULT_CAPTURE_BUFFER_SECS, EDIT_WINDOW_SECS};
pub use guard::EditGuard;
pub use lock::{EditStatus, OrderLock, OrderLockManager};
pub use memory_queue::InMemoryCaptureQueue;
pub use queue::{CaptureJob, CaptureQueue, JobSource, JobState, QueueError, ScheduleOptions};
pub use redis_queue::RedisCaptureQueue;
pub use runtime::{CaptureHandle, CaptureRuntime, RuntimeSettings};
pub use scheduler::CaptureScheduler;
pub use trigger::{ImmediateCaptureTrigger, TriggerOutcome};
pub use worker::{start_worker_pool, CaptureOutcome, CaptureWorker, WorkerHandle, WorkerSettings};
