//! Scenario: Write After Reads
//!
//! # Invariant under test
//! Three reads on the same branch followed by a write dispatch as two
//! batches: `[R, R, R]` under one read lease, then `[W]` under one write
//! lease. All three reads complete before the write begins, and the lock
//! store sees exactly one read acquire then one write acquire.

use std::sync::{Arc, Mutex};
use std::time::Duration;

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

fn recording_op(log: &Arc<Mutex<Vec<String>>>, name: &'static str) -> pdk_queue::OpRun {
    let log = Arc::clone(log);
    Box::new(move |_ctx| {
        Box::pin(async move {
            log.lock().unwrap().push(format!("{name}:start"));
            tokio::time::sleep(Duration::from_millis(15)).await;
            log.lock().unwrap().push(format!("{name}:end"));
            Ok(())
        })
    })
}

#[tokio::test]
async fn three_reads_then_write_forms_two_batches() {
    let leases = MemoryLeaseStore::new();
    let queues = QueueSet::new(
        Arc::new(leases.clone()),
        Arc::new(RecordingRepoAdapter::new()),
    );

    let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    let r1 = queues.enqueue(params(LockScope::Read, "main"), recording_op(&log, "r1"));
    let r2 = queues.enqueue(params(LockScope::Read, "main"), recording_op(&log, "r2"));
    let r3 = queues.enqueue(params(LockScope::Read, "main"), recording_op(&log, "r3"));
    let w = queues.enqueue(params(LockScope::Write, "main"), recording_op(&log, "w"));

    assert!(r1.await.unwrap().is_ok());
    assert!(r2.await.unwrap().is_ok());
    assert!(r3.await.unwrap().is_ok());
    assert!(w.await.unwrap().is_ok());

    // Every read finished before the write started.
    let events = log.lock().unwrap().clone();
    let write_start = events.iter().position(|e| e == "w:start").unwrap();
    for read_end in ["r1:end", "r2:end", "r3:end"] {
        let pos = events.iter().position(|e| e == read_end).unwrap();
        assert!(
            pos < write_start,
            "{read_end} must precede w:start: {events:?}"
        );
    }

    // One read lease for the whole batch, then one write lease.
    let lease_log = leases.log();
    assert_eq!(
        lease_log,
        vec![
            LeaseLogEntry::Acquired {
                scope: LockScope::Read,
                branch: Some("main".into())
            },
            LeaseLogEntry::Released {
                scope: LockScope::Read,
                branch: Some("main".into())
            },
            LeaseLogEntry::Acquired {
                scope: LockScope::Write,
                branch: Some("main".into())
            },
            LeaseLogEntry::Released {
                scope: LockScope::Write,
                branch: Some("main".into())
            },
        ]
    );
    assert_eq!(leases.held_count(), 0);
}

#[tokio::test]
async fn each_operation_gets_exactly_one_terminal_value() {
    let queues = QueueSet::new(
        Arc::new(MemoryLeaseStore::new()),
        Arc::new(RecordingRepoAdapter::new()),
    );

    let rx = queues.enqueue(
        params(LockScope::Read, "main"),
        Box::new(|_ctx| Box::pin(async { Ok(()) })),
    );

    // One terminal value, then the channel is spent.
    let first = rx.await;
    assert!(first.unwrap().is_ok());
}
