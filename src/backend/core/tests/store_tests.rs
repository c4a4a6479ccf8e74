//! Integration tests for job stores.
//!
//! Tests cover:
//! - Compare-and-swap under contention
//! - Duplicate and missing ids
//! - Terminal records are read-only apart from the delivery acknowledgement
//! - Unfinished listing order
//! - Redis backend (ignored unless `SUTRA_TEST_REDIS_URL` is set)

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::job;
use sutra_core::error::ErrorCode;
use sutra_core::jobs::{
    FailureReason, HistoryEntry, InMemoryJobStore, JobId, JobStatus, JobStore, JobUpdate,
    RedisJobStore, Step,
};

// ============================================================================
// Shared Contract
// ============================================================================

async fn cas_has_single_winner(store: Arc<dyn JobStore>, id: &str) {
    store.put(job(id)).await.unwrap();
    let id: JobId = id.parse().unwrap();

    let mut tasks = Vec::new();
    for worker in 0..16 {
        let store = store.clone();
        let id = id.clone();
        tasks.push(tokio::spawn(async move {
            store
                .update_status(&id, 0, JobUpdate::new().claim(format!("worker-{}", worker)))
                .await
        }));
    }

    let mut winners = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(job) => {
                winners += 1;
                assert_eq!(job.version, 1);
            }
            Err(e) => assert_eq!(e.code(), ErrorCode::PersistenceConflict),
        }
    }
    assert_eq!(winners, 1);
    assert_eq!(store.get(&id).await.unwrap().version, 1);
}

async fn lifecycle(store: Arc<dyn JobStore>, id: &str) {
    store.put(job(id)).await.unwrap();
    let id: JobId = id.parse().unwrap();

    let dup = store.put(job(id.as_str())).await.unwrap_err();
    assert_eq!(dup.code(), ErrorCode::DuplicateJob);

    let running = store
        .update_status(
            &id,
            0,
            JobUpdate::new()
                .claim("w1")
                .status(JobStatus::Running { step: Step::Download }),
        )
        .await
        .unwrap();
    assert_eq!(running.owner.as_deref(), Some("w1"));

    let stale = store
        .update_status(&id, 0, JobUpdate::new().attempt(1))
        .await
        .unwrap_err();
    assert_eq!(stale.code(), ErrorCode::PersistenceConflict);

    let failed = store
        .update_status(
            &id,
            running.version,
            JobUpdate::new()
                .push(HistoryEntry::succeeded(Step::Download, 1))
                .status(JobStatus::Failed {
                    reason: FailureReason::Cancelled,
                })
                .release(),
        )
        .await
        .unwrap();
    assert_eq!(failed.history.len(), 1);
    assert!(failed.owner.is_none());
    assert!(store.list_unfinished().await.unwrap().iter().all(|j| j.id != id));

    let frozen = store
        .update_status(&id, failed.version, JobUpdate::new().status(JobStatus::Pending))
        .await
        .unwrap_err();
    assert_eq!(frozen.code(), ErrorCode::InvalidStateTransition);
    assert_eq!(store.get(&id).await.unwrap(), failed);

    let undelivered = store.list_unnotified().await.unwrap();
    assert_eq!(undelivered.len(), 1);
    assert_eq!(undelivered[0].id, id);

    let acked = store.mark_notified(&id).await.unwrap();
    assert!(acked.notified);
    assert_eq!(acked.status, failed.status);
    assert!(store.list_unnotified().await.unwrap().is_empty());
}

// ============================================================================
// In-Memory Store
// ============================================================================

#[tokio::test]
async fn test_memory_cas_single_winner() {
    cas_has_single_winner(Arc::new(InMemoryJobStore::new()), "race").await;
}

#[tokio::test]
async fn test_memory_lifecycle() {
    lifecycle(Arc::new(InMemoryJobStore::new()), "life").await;
}

#[tokio::test]
async fn test_memory_get_missing() {
    let store = InMemoryJobStore::new();
    let err = store.get(&"nope".parse().unwrap()).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::JobNotFound);
    assert_eq!(err.http_status(), axum::http::StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_memory_unfinished_in_submission_order() {
    let store = InMemoryJobStore::new();
    for id in ["first", "second", "third"] {
        store.put(job(id)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    let order: Vec<String> = store
        .list_unfinished()
        .await
        .unwrap()
        .into_iter()
        .map(|j| j.id.to_string())
        .collect();
    assert_eq!(order, vec!["first", "second", "third"]);
}

#[tokio::test]
async fn test_memory_request_cancel_is_idempotent() {
    let store = InMemoryJobStore::new();
    store.put(job("c")).await.unwrap();
    let id: JobId = "c".parse().unwrap();

    let first = store.request_cancel(&id).await.unwrap();
    let second = store.request_cancel(&id).await.unwrap();
    assert!(first.cancel_requested);
    assert_eq!(first.version, second.version);
}

// ============================================================================
// Redis Store
// ============================================================================

async fn redis_store() -> Arc<dyn JobStore> {
    let url = std::env::var("SUTRA_TEST_REDIS_URL").expect("SUTRA_TEST_REDIS_URL not set");
    let prefix = format!("sutra-test-{}", uuid::Uuid::new_v4());
    Arc::new(RedisJobStore::connect(&url, prefix).await.unwrap())
}

#[tokio::test]
#[ignore = "requires a Redis server"]
async fn test_redis_cas_single_winner() {
    cas_has_single_winner(redis_store().await, "race").await;
}

#[tokio::test]
#[ignore = "requires a Redis server"]
async fn test_redis_lifecycle() {
    lifecycle(redis_store().await, "life").await;
}
