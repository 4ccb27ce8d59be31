//! Collaborator seams for the queue.
//!
//! The queue does not talk to Postgres or git itself. It acquires leases
//! through [`LeaseStore`] and asks [`RepoAdapter`] to reset a working tree
//! after a failed write. Production wiring implements these over the real
//! lock store and repo layer; tests inject in-memory fakes.

use async_trait::async_trait;
use pdk_schemas::LockScope;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Failure of a lease acquisition or release, as seen by the queue.
#[derive(Debug, Clone)]
pub enum LeaseError {
    /// Retries exhausted against a conflicting holder.
    Timeout { attempts: u32, cause: String },
    /// The underlying store is unreachable.
    Unavailable(String),
    /// The acquire context was cancelled while waiting.
    Cancelled,
}

impl std::fmt::Display for LeaseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LeaseError::Timeout { attempts, cause } => {
                write!(f, "lease timeout after {attempts} attempts: {cause}")
            }
            LeaseError::Unavailable(msg) => write!(f, "lease store unavailable: {msg}"),
            LeaseError::Cancelled => write!(f, "lease acquire cancelled"),
        }
    }
}

impl std::error::Error for LeaseError {}

/// What a batch asks the lock store for.
#[derive(Debug, Clone)]
pub struct LeaseRequest {
    pub org_id: String,
    pub user_id: String,
    pub plan_id: String,
    /// None targets the plan root.
    pub branch: Option<String>,
    pub scope: LockScope,
    pub reason: String,
    pub ctx: CancellationToken,
}

/// A held lease. Dropped leases are reclaimed by staleness sweeps, but the
/// queue always releases explicitly after a batch.
#[async_trait]
pub trait Lease: Send {
    fn id(&self) -> Uuid;
    async fn release(self: Box<Self>) -> Result<(), LeaseError>;
}

/// Lease acquisition seam; implemented by the repo lock store.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    async fn acquire(&self, req: LeaseRequest) -> Result<Box<dyn Lease>, LeaseError>;
}

/// Working-tree maintenance seam. Read/write repo work itself arrives as
/// the operation's callable; the queue only needs the recovery path.
#[async_trait]
pub trait RepoAdapter: Send + Sync {
    /// Discard uncommitted changes, returning the tree to its head commit.
    async fn reset_to_head(&self, plan_id: &str, branch: &str) -> anyhow::Result<()>;
}
