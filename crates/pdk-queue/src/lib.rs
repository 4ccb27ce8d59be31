//! pdk-queue
//!
//! Per-plan operation scheduling. One queue per plan; each queue runs a
//! single cooperative dispatch loop that pops batches, takes a lease from
//! the lock store, and runs the batch under it.
//!
//! Batching rules (`next_batch`):
//! - writes never batch: a leading write dispatches alone
//! - consecutive reads on the same branch dispatch together under one
//!   read lease and run concurrently
//! - reads on the plan root dispatch alone (they conflict with every
//!   branch write, so there is nothing safe to batch them with)
//!
//! Ordering: FIFO per plan. A write is never reordered around earlier
//! reads; members of a read batch preserve enqueue order at dispatch and
//! may only complete out of order.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use pdk_kv::ConcurrentKv;
use pdk_schemas::LockScope;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

mod seams;

pub use seams::{Lease, LeaseError, LeaseRequest, LeaseStore, RepoAdapter};

// ---------------------------------------------------------------------------
// QueueError
// ---------------------------------------------------------------------------

/// Terminal value delivered on an operation's completion sink.
#[derive(Debug)]
pub enum QueueError {
    /// The operation's context was cancelled before or during execution.
    Cancelled,
    /// A deadline attached to the operation's context elapsed.
    DeadlineExceeded,
    /// The lease could not be acquired for the operation's batch.
    Lease(LeaseError),
    /// The operation itself returned an error.
    Op(anyhow::Error),
}

impl std::fmt::Display for QueueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueError::Cancelled => write!(f, "operation cancelled"),
            QueueError::DeadlineExceeded => write!(f, "operation deadline exceeded"),
            QueueError::Lease(e) => write!(f, "lease acquisition failed: {e}"),
            QueueError::Op(e) => write!(f, "operation failed: {e}"),
        }
    }
}

impl std::error::Error for QueueError {}

pub type OpResult = Result<(), QueueError>;

/// The work a queued operation performs once its batch holds a lease.
/// Receives the operation's own cancellation token.
pub type OpFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
pub type OpRun = Box<dyn FnOnce(CancellationToken) -> OpFuture + Send>;

// ---------------------------------------------------------------------------
// QueuedOperation
// ---------------------------------------------------------------------------

/// Parameters describing a repository operation to enqueue.
#[derive(Debug, Clone)]
pub struct OpParams {
    pub org_id: String,
    pub user_id: String,
    pub plan_id: String,
    /// Empty string targets the plan root.
    pub branch: String,
    pub scope: LockScope,
    pub reason: String,
    pub plan_build_id: Option<String>,
    /// On a failed write, reset the working tree to its head commit before
    /// the lease is released.
    pub clear_repo_on_err: bool,
    pub ctx: CancellationToken,
}

struct QueuedOperation {
    id: Uuid,
    params: OpParams,
    run: OpRun,
    done: oneshot::Sender<OpResult>,
}

impl QueuedOperation {
    fn complete(self, result: OpResult) {
        // Receiver may have hung up; completion is best-effort delivery.
        let _ = self.done.send(result);
    }
}

// ---------------------------------------------------------------------------
// next_batch
// ---------------------------------------------------------------------------

struct QueueInner {
    ops: VecDeque<QueuedOperation>,
    processing: bool,
}

/// Pop the next dispatchable batch. Empty result means the queue drained.
fn next_batch(inner: &mut QueueInner) -> Vec<QueuedOperation> {
    let head_scope = match inner.ops.front() {
        Some(op) => op.params.scope,
        None => return Vec::new(),
    };

    if head_scope == LockScope::Write {
        return vec![inner.ops.pop_front().expect("head checked")];
    }

    let head_branch = inner.ops[0].params.branch.clone();
    if head_branch.is_empty() {
        // Root read: conflicts with every branch write, dispatch alone.
        return vec![inner.ops.pop_front().expect("head checked")];
    }

    // Greedy same-branch read prefix.
    let mut batch = Vec::new();
    while let Some(op) = inner.ops.front() {
        if op.params.scope == LockScope::Read && op.params.branch == head_branch {
            batch.push(inner.ops.pop_front().expect("front checked"));
        } else {
            break;
        }
    }
    batch
}

// ---------------------------------------------------------------------------
// PlanQueue
// ---------------------------------------------------------------------------

/// Queue for a single plan. Owned behind `Arc` in the [`QueueSet`] map.
pub struct PlanQueue {
    plan_id: String,
    inner: Mutex<QueueInner>,
}

impl PlanQueue {
    fn new(plan_id: String) -> Self {
        Self {
            plan_id,
            inner: Mutex::new(QueueInner {
                ops: VecDeque::new(),
                processing: false,
            }),
        }
    }

    pub fn plan_id(&self) -> &str {
        &self.plan_id
    }

    /// Number of operations waiting (not including any in-flight batch).
    pub fn depth(&self) -> usize {
        self.inner.lock().expect("queue lock poisoned").ops.len()
    }
}

// ---------------------------------------------------------------------------
// QueueSet
// ---------------------------------------------------------------------------

/// Process-wide map of per-plan queues plus the collaborators batches run
/// against. Created once at process init; `shutdown` drains every queue.
pub struct QueueSet {
    queues: ConcurrentKv<Arc<PlanQueue>>,
    leases: Arc<dyn LeaseStore>,
    repo: Arc<dyn RepoAdapter>,
    shutdown: CancellationToken,
}

impl QueueSet {
    pub fn new(leases: Arc<dyn LeaseStore>, repo: Arc<dyn RepoAdapter>) -> Self {
        Self {
            queues: ConcurrentKv::new(),
            leases,
            repo,
            shutdown: CancellationToken::new(),
        }
    }

    /// The existing queue for a plan, or a freshly created one.
    pub fn get_queue(&self, plan_id: &str) -> Arc<PlanQueue> {
        let (queue, _loaded) = self
            .queues
            .set_if_absent(plan_id, Arc::new(PlanQueue::new(plan_id.to_string())));
        queue
    }

    /// Enqueue an operation; the caller blocks on the returned receiver for
    /// the terminal result. Starts the plan's dispatch loop if idle.
    pub fn enqueue(&self, params: OpParams, run: OpRun) -> oneshot::Receiver<OpResult> {
        let (done_tx, done_rx) = oneshot::channel();
        let op = QueuedOperation {
            id: Uuid::new_v4(),
            params,
            run,
            done: done_tx,
        };

        if self.shutdown.is_cancelled() {
            op.complete(Err(QueueError::Cancelled));
            return done_rx;
        }

        let queue = self.get_queue(&op.params.plan_id);
        let start_loop = {
            let mut inner = queue.inner.lock().expect("queue lock poisoned");
            debug!(
                plan_id = %queue.plan_id,
                op_id = %op.id,
                scope = %op.params.scope,
                branch = %op.params.branch,
                depth = inner.ops.len() + 1,
                "operation enqueued"
            );
            inner.ops.push_back(op);
            if inner.processing {
                false
            } else {
                inner.processing = true;
                true
            }
        };

        if start_loop {
            let queue = Arc::clone(&queue);
            let leases = Arc::clone(&self.leases);
            let repo = Arc::clone(&self.repo);
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move {
                dispatch_loop(queue, leases, repo, shutdown).await;
            });
        }

        done_rx
    }

    /// Cancel all dispatch loops and fail still-queued operations with a
    /// cancellation error. Safe to call more than once.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        for (_, queue) in self.queues.snapshot_items() {
            let drained: Vec<QueuedOperation> = {
                let mut inner = queue.inner.lock().expect("queue lock poisoned");
                inner.ops.drain(..).collect()
            };
            for op in drained {
                op.complete(Err(QueueError::Cancelled));
            }
        }
    }

    /// Plans that currently have a queue (diagnostics surface).
    pub fn plan_ids(&self) -> Vec<String> {
        self.queues.keys()
    }
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// The single cooperative task per plan: pop a batch, run it, repeat until
/// the queue drains, then clear `processing` and exit.
async fn dispatch_loop(
    queue: Arc<PlanQueue>,
    leases: Arc<dyn LeaseStore>,
    repo: Arc<dyn RepoAdapter>,
    shutdown: CancellationToken,
) {
    loop {
        let batch = {
            let mut inner = queue.inner.lock().expect("queue lock poisoned");
            if shutdown.is_cancelled() {
                let drained: Vec<QueuedOperation> = inner.ops.drain(..).collect();
                inner.processing = false;
                drop(inner);
                for op in drained {
                    op.complete(Err(QueueError::Cancelled));
                }
                return;
            }
            let batch = next_batch(&mut inner);
            if batch.is_empty() {
                inner.processing = false;
                return;
            }
            batch
        };

        run_batch(&queue, batch, &leases, &repo, &shutdown).await;
    }
}

/// Run one batch under a single lease. Operation errors land on completion
/// sinks; the lease is always released afterwards.
async fn run_batch(
    queue: &PlanQueue,
    batch: Vec<QueuedOperation>,
    leases: &Arc<dyn LeaseStore>,
    repo: &Arc<dyn RepoAdapter>,
    shutdown: &CancellationToken,
) {
    // Ops cancelled before dispatch complete immediately and drop out.
    let mut live: Vec<QueuedOperation> = Vec::with_capacity(batch.len());
    for op in batch {
        if op.params.ctx.is_cancelled() {
            op.complete(Err(QueueError::Cancelled));
        } else {
            live.push(op);
        }
    }
    let Some(head) = live.first() else { return };

    let scope = head.params.scope;
    let branch = head.params.branch.clone();
    // A single-op batch aborts its lock wait when the op is cancelled; a
    // read batch outlives any individual member's cancellation.
    let acquire_ctx = if live.len() == 1 {
        live[0].params.ctx.clone()
    } else {
        shutdown.child_token()
    };

    let lease = match leases
        .acquire(LeaseRequest {
            org_id: head.params.org_id.clone(),
            user_id: head.params.user_id.clone(),
            plan_id: queue.plan_id.clone(),
            branch: if branch.is_empty() {
                None
            } else {
                Some(branch.clone())
            },
            scope,
            reason: head.params.reason.clone(),
            ctx: acquire_ctx,
        })
        .await
    {
        Ok(lease) => lease,
        Err(e) => {
            warn!(
                plan_id = %queue.plan_id,
                scope = %scope,
                error = %e,
                "batch lease acquisition failed"
            );
            for op in live {
                let result = match (&e, op.params.ctx.is_cancelled()) {
                    (LeaseError::Cancelled, true) => QueueError::Cancelled,
                    _ => QueueError::Lease(e.clone()),
                };
                op.complete(Err(result));
            }
            return;
        }
    };

    match scope {
        LockScope::Write => {
            debug_assert_eq!(live.len(), 1, "writes dispatch as single-op batches");
            for op in live {
                run_one(op, repo).await;
            }
        }
        LockScope::Read => {
            // Batch members run concurrently under the shared lease and are
            // joined before release.
            let mut handles = Vec::with_capacity(live.len());
            for op in live {
                let repo = Arc::clone(repo);
                handles.push(tokio::spawn(async move {
                    run_one(op, &repo).await;
                }));
            }
            for handle in handles {
                // A panicking op must not leak the lease; join errors are
                // logged and the remaining members still complete.
                if let Err(e) = handle.await {
                    warn!(plan_id = %queue.plan_id, error = %e, "batch member task failed");
                }
            }
        }
    }

    if let Err(e) = lease.release().await {
        warn!(plan_id = %queue.plan_id, error = %e, "lease release failed");
    }
}

/// Execute one operation and deliver its terminal value.
async fn run_one(op: QueuedOperation, repo: &Arc<dyn RepoAdapter>) {
    if op.params.ctx.is_cancelled() {
        op.complete(Err(QueueError::Cancelled));
        return;
    }

    let QueuedOperation {
        id,
        params,
        run,
        done,
    } = op;

    let result = run(params.ctx.clone()).await;

    let outcome = match result {
        Ok(()) => Ok(()),
        Err(e) => {
            if params.scope == LockScope::Write && params.clear_repo_on_err {
                if let Err(reset_err) = repo.reset_to_head(&params.plan_id, &params.branch).await {
                    warn!(
                        plan_id = %params.plan_id,
                        branch = %params.branch,
                        error = %reset_err,
                        "reset to head after failed write also failed"
                    );
                }
            }
            if params.ctx.is_cancelled() {
                Err(QueueError::Cancelled)
            } else {
                Err(QueueError::Op(e))
            }
        }
    };

    debug!(op_id = %id, ok = outcome.is_ok(), "operation finished");
    let _ = done.send(outcome);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(scope: LockScope, branch: &str) -> QueuedOperation {
        let (done, _rx) = oneshot::channel();
        QueuedOperation {
            id: Uuid::new_v4(),
            params: OpParams {
                org_id: "org".into(),
                user_id: "user".into(),
                plan_id: "plan".into(),
                branch: branch.into(),
                scope,
                reason: "test".into(),
                plan_build_id: None,
                clear_repo_on_err: false,
                ctx: CancellationToken::new(),
            },
            run: Box::new(|_| Box::pin(async { Ok(()) })),
            done,
        }
    }

    fn inner_with(ops: Vec<QueuedOperation>) -> QueueInner {
        QueueInner {
            ops: ops.into(),
            processing: false,
        }
    }

    #[test]
    fn next_batch_empty_queue_is_nil() {
        let mut inner = inner_with(vec![]);
        assert!(next_batch(&mut inner).is_empty());
    }

    #[test]
    fn leading_write_dispatches_alone() {
        let mut inner = inner_with(vec![
            op(LockScope::Write, "main"),
            op(LockScope::Read, "main"),
        ]);
        let batch = next_batch(&mut inner);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].params.scope, LockScope::Write);
        assert_eq!(inner.ops.len(), 1);
    }

    #[test]
    fn same_branch_reads_batch_until_write() {
        let mut inner = inner_with(vec![
            op(LockScope::Read, "main"),
            op(LockScope::Read, "main"),
            op(LockScope::Read, "main"),
            op(LockScope::Write, "main"),
        ]);
        let batch = next_batch(&mut inner);
        assert_eq!(batch.len(), 3);
        assert!(batch.iter().all(|o| o.params.scope == LockScope::Read));

        let batch = next_batch(&mut inner);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].params.scope, LockScope::Write);
        assert!(next_batch(&mut inner).is_empty());
    }

    #[test]
    fn cross_branch_reads_do_not_batch() {
        let mut inner = inner_with(vec![
            op(LockScope::Read, "main"),
            op(LockScope::Read, "feature"),
        ]);
        let batch = next_batch(&mut inner);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].params.branch, "main");
        let batch = next_batch(&mut inner);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].params.branch, "feature");
    }

    #[test]
    fn root_reads_dispatch_alone() {
        let mut inner = inner_with(vec![op(LockScope::Read, ""), op(LockScope::Read, "")]);
        let batch = next_batch(&mut inner);
        assert_eq!(batch.len(), 1);
        assert!(batch[0].params.branch.is_empty());
        assert_eq!(inner.ops.len(), 1);
    }

    #[test]
    fn read_batch_preserves_enqueue_order() {
        let mut inner = inner_with(vec![
            op(LockScope::Read, "main"),
            op(LockScope::Read, "main"),
            op(LockScope::Read, "main"),
        ]);
        let ids: Vec<Uuid> = inner.ops.iter().map(|o| o.id).collect();
        let batch = next_batch(&mut inner);
        let batch_ids: Vec<Uuid> = batch.iter().map(|o| o.id).collect();
        assert_eq!(ids, batch_ids);
    }
}
