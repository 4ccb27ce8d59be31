//! LeaseStore wiring: the queue acquires leases through this impl, which
//! maps the queue's narrow seam onto the real lock store.

use async_trait::async_trait;
use pdk_queue::{Lease, LeaseError, LeaseRequest, LeaseStore};
use uuid::Uuid;

use crate::{AcquireParams, LockError, LockLease, RepoLockStore};

impl From<LockError> for LeaseError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Timeout { attempts, cause } => LeaseError::Timeout { attempts, cause },
            LockError::StoreUnavailable(e) => LeaseError::Unavailable(e.to_string()),
            LockError::Cancelled => LeaseError::Cancelled,
            LockError::ConflictRootBranch { plan_id } => {
                LeaseError::Unavailable(format!("root/branch lock conflict for plan {plan_id}"))
            }
        }
    }
}

#[async_trait]
impl Lease for LockLease {
    fn id(&self) -> Uuid {
        LockLease::id(self)
    }

    async fn release(self: Box<Self>) -> Result<(), LeaseError> {
        (*self).release().await.map_err(Into::into)
    }
}

#[async_trait]
impl LeaseStore for RepoLockStore {
    async fn acquire(&self, req: LeaseRequest) -> Result<Box<dyn Lease>, LeaseError> {
        let lease = RepoLockStore::acquire(
            self,
            AcquireParams {
                org_id: req.org_id,
                user_id: req.user_id,
                plan_id: req.plan_id,
                branch: req.branch,
                scope: req.scope,
                reason: req.reason,
                ctx: req.ctx,
            },
        )
        .await?;
        Ok(Box::new(lease))
    }
}
