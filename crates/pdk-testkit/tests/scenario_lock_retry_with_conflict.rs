//! Scenario: Lock Retry With Conflict
//!
//! # Invariant under test
//! A queued write whose lease is blocked by an existing write lock retries
//! with backoff and succeeds once the holder releases — no error reaches
//! the operation's completion sink.

use std::sync::Arc;
use std::time::Duration;

use pdk_queue::{LeaseRequest, LeaseStore, OpParams, QueueSet};
use pdk_schemas::LockScope;
use pdk_testkit::{MemoryLeaseStore, RecordingRepoAdapter};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn queued_write_waits_out_a_held_write_lock() {
    let leases = MemoryLeaseStore::new();

    // A writer outside the queue holds the branch lock.
    let held = leases
        .acquire(LeaseRequest {
            org_id: "org-1".into(),
            user_id: "user-0".into(),
            plan_id: "plan-1".into(),
            branch: Some("main".into()),
            scope: LockScope::Write,
            reason: "external write".into(),
            ctx: CancellationToken::new(),
        })
        .await
        .expect("direct acquire must succeed");

    let queues = QueueSet::new(
        Arc::new(leases.clone()),
        Arc::new(RecordingRepoAdapter::new()),
    );

    let rx = queues.enqueue(
        OpParams {
            org_id: "org-1".into(),
            user_id: "user-1".into(),
            plan_id: "plan-1".into(),
            branch: "main".into(),
            scope: LockScope::Write,
            reason: "queued write".into(),
            plan_build_id: None,
            clear_repo_on_err: false,
            ctx: CancellationToken::new(),
        },
        Box::new(|_ctx| Box::pin(async { Ok(()) })),
    );

    // Release the external lock while the queued write is still retrying.
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        held.release().await.expect("release must succeed");
    });

    let result = tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .expect("queued write must complete")
        .expect("completion sink must deliver");
    assert!(result.is_ok(), "no error surfaces: {result:?}");
    assert_eq!(leases.held_count(), 0);
}

#[tokio::test]
async fn exhausted_retries_surface_lock_timeout_with_cause() {
    // Tiny retry budget so the conflict can never resolve in time.
    let leases = MemoryLeaseStore::with_retry(Duration::from_millis(5), 3);

    let _held = leases
        .acquire(LeaseRequest {
            org_id: "org-1".into(),
            user_id: "user-0".into(),
            plan_id: "plan-1".into(),
            branch: Some("main".into()),
            scope: LockScope::Write,
            reason: "long-lived write".into(),
            ctx: CancellationToken::new(),
        })
        .await
        .unwrap();

    let queues = QueueSet::new(
        Arc::new(leases.clone()),
        Arc::new(RecordingRepoAdapter::new()),
    );

    let rx = queues.enqueue(
        OpParams {
            org_id: "org-1".into(),
            user_id: "user-1".into(),
            plan_id: "plan-1".into(),
            branch: "main".into(),
            scope: LockScope::Write,
            reason: "doomed write".into(),
            plan_build_id: None,
            clear_repo_on_err: false,
            ctx: CancellationToken::new(),
        },
        Box::new(|_ctx| Box::pin(async { Ok(()) })),
    );

    let result = rx.await.unwrap();
    let err = result.unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("3 attempts"), "attempt count in message: {msg}");
    assert!(msg.contains("conflicting lock"), "cause in message: {msg}");
}
