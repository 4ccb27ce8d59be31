//! Scenario: Cross-Branch Reads Do Not Batch
//!
//! # Invariant under test
//! Reads on different branches dispatch as separate single-op batches,
//! each under its own read lease. Root reads also dispatch alone.

use std::sync::Arc;

use pdk_queue::{OpParams, QueueSet};
use pdk_schemas::LockScope;
use pdk_testkit::{LeaseLogEntry, MemoryLeaseStore, RecordingRepoAdapter};
use tokio_util::sync::CancellationToken;

fn params(scope: LockScope, branch: &str) -> OpParams {
    OpParams {
        org_id: "org-1".into(),
        user_id: "user-1".into(),
        plan_id: "plan-1".into(),
        branch: branch.into(),
        scope,
        reason: "test".into(),
        plan_build_id: None,
        clear_repo_on_err: false,
        ctx: CancellationToken::new(),
    }
}

fn noop() -> pdk_queue::OpRun {
    Box::new(|_ctx| Box::pin(async { Ok(()) }))
}

#[tokio::test]
async fn reads_on_different_branches_take_separate_leases() {
    let leases = MemoryLeaseStore::new();
    let queues = QueueSet::new(
        Arc::new(leases.clone()),
        Arc::new(RecordingRepoAdapter::new()),
    );

    let a = queues.enqueue(params(LockScope::Read, "main"), noop());
    let b = queues.enqueue(params(LockScope::Read, "feature"), noop());

    assert!(a.await.unwrap().is_ok());
    assert!(b.await.unwrap().is_ok());

    let acquires: Vec<_> = leases
        .log()
        .into_iter()
        .filter(|e| matches!(e, LeaseLogEntry::Acquired { .. }))
        .collect();
    assert_eq!(
        acquires,
        vec![
            LeaseLogEntry::Acquired {
                scope: LockScope::Read,
                branch: Some("main".into())
            },
            LeaseLogEntry::Acquired {
                scope: LockScope::Read,
                branch: Some("feature".into())
            },
        ]
    );
}

#[tokio::test]
async fn root_reads_dispatch_alone() {
    let leases = MemoryLeaseStore::new();
    let queues = QueueSet::new(
        Arc::new(leases.clone()),
        Arc::new(RecordingRepoAdapter::new()),
    );

    let a = queues.enqueue(params(LockScope::Read, ""), noop());
    let b = queues.enqueue(params(LockScope::Read, ""), noop());

    assert!(a.await.unwrap().is_ok());
    assert!(b.await.unwrap().is_ok());

    // Two separate root leases, not one batched lease.
    let acquires = leases
        .log()
        .into_iter()
        .filter(|e| matches!(e, LeaseLogEntry::Acquired { .. }))
        .count();
    assert_eq!(acquires, 2);
}
