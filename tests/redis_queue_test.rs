//! Runs against a local Redis: `cargo test -- --ignored`.

use assert_matches::assert_matches;
use uuid::Uuid;

use capture_scheduler::capture::{
    queue::{CaptureQueue, JobDisposition, JobSource, JobState, QueueError, RetryPolicy, ScheduleOptions},
    redis_queue::RedisCaptureQueue,
};

const REDIS_URL: &str = "redis://127.0.0.1:6379";

async fn queue() -> RedisCaptureQueue {
    let namespace = format!("capture-test-{}", Uuid::new_v4().simple());
    RedisCaptureQueue::connect(Some(REDIS_URL), namespace, RetryPolicy::default())
        .await
        .expect("connect to redis")
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn schedule_rejects_second_job_for_order() {
    let queue = queue().await;
    let job = queue
        .schedule("ord_1", "pi_1", 60_000, ScheduleOptions::normal())
        .await
        .unwrap();
    assert_eq!(job.state, JobState::Delayed);

    let duplicate = queue
        .schedule("ord_1", "pi_1", 0, ScheduleOptions::immediate())
        .await;
    assert_matches!(duplicate, Err(QueueError::DuplicateJob { state: JobState::Delayed, .. }));

    let stored = queue.get_job("ord_1").await.unwrap().unwrap();
    assert_eq!(stored.source, JobSource::Normal);
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn cancel_removes_only_pending_jobs() {
    let queue = queue().await;
    queue
        .schedule("ord_1", "pi_1", 0, ScheduleOptions::immediate())
        .await
        .unwrap();
    queue
        .schedule("ord_2", "pi_2", 60_000, ScheduleOptions::normal())
        .await
        .unwrap();

    let reserved = queue.reserve_due(10).await.unwrap();
    assert_eq!(reserved.len(), 1);
    assert_eq!(reserved[0].order_id, "ord_1");
    assert_eq!(reserved[0].state, JobState::Active);

    assert!(!queue.cancel("ord_1").await.unwrap());
    assert!(queue.cancel("ord_2").await.unwrap());
    assert!(queue.get_job("ord_2").await.unwrap().is_none());

    queue.complete(&reserved[0]).await.unwrap();
    assert!(queue.get_job("ord_1").await.unwrap().is_none());
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn failed_job_is_rescheduled_with_backoff() {
    let queue = queue().await;
    queue
        .schedule("ord_1", "pi_1", 0, ScheduleOptions::immediate())
        .await
        .unwrap();
    let job = queue.reserve_due(1).await.unwrap().remove(0);

    let disposition = queue.fail(&job, "gateway timeout").await.unwrap();
    assert_matches!(disposition, JobDisposition::Retrying { .. });

    let stored = queue.get_job("ord_1").await.unwrap().unwrap();
    assert_eq!(stored.state, JobState::Delayed);
    assert_eq!(stored.last_error.as_deref(), Some("gateway timeout"));
    assert!(queue.reserve_due(1).await.unwrap().is_empty());
}
