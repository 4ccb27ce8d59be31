//! pdk-testkit
//!
//! Shared test doubles for the coordination core:
//!
//! - [`MemoryLeaseStore`]: in-memory lease store with the real conflict
//!   matrix and a fast retry loop, plus an acquisition log scenario tests
//!   assert against.
//! - [`ScriptedTransport`]: provider transport replaying a queue of
//!   scripted outcomes, recording every request it saw.
//! - [`MemoryJournal`]: in-memory run journal.
//! - [`RecordingRepoAdapter`]: records `reset_to_head` calls.
//!
//! Scenario tests for cross-component invariants live in this crate's
//! `tests/` directory; DB-backed ones are gated on `PDK_DATABASE_URL`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use pdk_provider::{
    Journal, JournalEvent, ProviderTransport, StreamChunk, TransportFailure, TransportReply,
    TransportRequest,
};
use pdk_queue::{Lease, LeaseError, LeaseRequest, LeaseStore, RepoAdapter};
use pdk_schemas::LockScope;
use uuid::Uuid;

/// Install a fmt subscriber for test output. Safe to call repeatedly.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with_test_writer()
        .try_init();
}

/// Connect using PDK_DATABASE_URL and apply migrations. DB-gated scenario
/// tests start here.
pub async fn testkit_db_pool() -> anyhow::Result<sqlx::PgPool> {
    let pool = pdk_db::connect_from_env().await?;
    pdk_db::migrate(&pool).await?;
    Ok(pool)
}

// ---------------------------------------------------------------------------
// MemoryLeaseStore
// ---------------------------------------------------------------------------

/// What the store did, in order. Tests assert against this.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseLogEntry {
    Acquired { scope: LockScope, branch: Option<String> },
    Released { scope: LockScope, branch: Option<String> },
}

#[derive(Debug, Clone)]
struct HeldLock {
    scope: LockScope,
    branch: Option<String>,
}

#[derive(Default)]
struct MemoryLeaseState {
    held: HashMap<Uuid, HeldLock>,
    log: Vec<LeaseLogEntry>,
}

/// In-memory lease store with the production conflict matrix: a write
/// conflicts with everything on its branch and the root, a root lock
/// conflicts with the whole plan, reads coexist. Conflicts retry on a fast
/// clock so scenario tests finish quickly.
#[derive(Clone)]
pub struct MemoryLeaseStore {
    state: Arc<Mutex<MemoryLeaseState>>,
    retry_delay: Duration,
    max_attempts: u32,
}

impl Default for MemoryLeaseStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLeaseStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryLeaseState::default())),
            retry_delay: Duration::from_millis(25),
            max_attempts: 40,
        }
    }

    /// Store with a bounded retry budget, for timeout-path tests.
    pub fn with_retry(retry_delay: Duration, max_attempts: u32) -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryLeaseState::default())),
            retry_delay,
            max_attempts,
        }
    }

    pub fn log(&self) -> Vec<LeaseLogEntry> {
        self.state.lock().expect("lease state poisoned").log.clone()
    }

    pub fn held_count(&self) -> usize {
        self.state.lock().expect("lease state poisoned").held.len()
    }

    fn conflicts(held: &HeldLock, scope: LockScope, branch: &Option<String>) -> bool {
        // Reads only conflict with writes.
        if scope == LockScope::Read && held.scope == LockScope::Read {
            return false;
        }
        // Root on either side conflicts with the whole plan.
        match (&held.branch, branch) {
            (None, _) | (_, None) => true,
            (Some(a), Some(b)) => a == b,
        }
    }

    fn try_acquire(&self, scope: LockScope, branch: &Option<String>) -> Option<Uuid> {
        let mut state = self.state.lock().expect("lease state poisoned");
        if state
            .held
            .values()
            .any(|held| Self::conflicts(held, scope, branch))
        {
            return None;
        }
        let id = Uuid::new_v4();
        state.held.insert(
            id,
            HeldLock {
                scope,
                branch: branch.clone(),
            },
        );
        state.log.push(LeaseLogEntry::Acquired {
            scope,
            branch: branch.clone(),
        });
        Some(id)
    }

    fn release_id(&self, id: Uuid) {
        let mut state = self.state.lock().expect("lease state poisoned");
        if let Some(held) = state.held.remove(&id) {
            state.log.push(LeaseLogEntry::Released {
                scope: held.scope,
                branch: held.branch,
            });
        }
    }
}

pub struct MemoryLease {
    id: Uuid,
    store: MemoryLeaseStore,
}

#[async_trait]
impl Lease for MemoryLease {
    fn id(&self) -> Uuid {
        self.id
    }

    async fn release(self: Box<Self>) -> Result<(), LeaseError> {
        self.store.release_id(self.id);
        Ok(())
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn acquire(&self, req: LeaseRequest) -> Result<Box<dyn Lease>, LeaseError> {
        for attempt in 0..self.max_attempts {
            if req.ctx.is_cancelled() {
                return Err(LeaseError::Cancelled);
            }
            if let Some(id) = self.try_acquire(req.scope, &req.branch) {
                return Ok(Box::new(MemoryLease {
                    id,
                    store: self.clone(),
                }));
            }
            if attempt + 1 < self.max_attempts {
                tokio::select! {
                    _ = tokio::time::sleep(self.retry_delay) => {}
                    _ = req.ctx.cancelled() => return Err(LeaseError::Cancelled),
                }
            }
        }
        Err(LeaseError::Timeout {
            attempts: self.max_attempts,
            cause: format!(
                "conflicting lock held on {}",
                req.branch.as_deref().unwrap_or("plan root")
            ),
        })
    }
}

// ---------------------------------------------------------------------------
// RepoAdapter doubles
// ---------------------------------------------------------------------------

/// Repo adapter that records reset calls and always succeeds.
#[derive(Clone, Default)]
pub struct RecordingRepoAdapter {
    resets: Arc<Mutex<Vec<(String, String)>>>,
}

impl RecordingRepoAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resets(&self) -> Vec<(String, String)> {
        self.resets.lock().expect("resets poisoned").clone()
    }
}

#[async_trait]
impl RepoAdapter for RecordingRepoAdapter {
    async fn reset_to_head(&self, plan_id: &str, branch: &str) -> anyhow::Result<()> {
        self.resets
            .lock()
            .expect("resets poisoned")
            .push((plan_id.to_string(), branch.to_string()));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ScriptedTransport
// ---------------------------------------------------------------------------

/// One scripted transport outcome.
pub enum ScriptedReply {
    Final(serde_json::Value),
    Fail(TransportFailure),
    /// A stream delivering these items then closing.
    Stream(Vec<Result<StreamChunk, TransportFailure>>),
}

/// Transport replaying scripted outcomes in order and recording every
/// request. Running past the script fails the attempt loudly.
#[derive(Clone, Default)]
pub struct ScriptedTransport {
    script: Arc<Mutex<Vec<ScriptedReply>>>,
    requests: Arc<Mutex<Vec<TransportRequest>>>,
}

impl ScriptedTransport {
    pub fn new(script: Vec<ScriptedReply>) -> Self {
        Self {
            script: Arc::new(Mutex::new(script)),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn push(&self, reply: ScriptedReply) {
        self.script.lock().expect("script poisoned").push(reply);
    }

    /// Every request the controller sent, in order.
    pub fn requests(&self) -> Vec<TransportRequest> {
        self.requests.lock().expect("requests poisoned").clone()
    }

    /// Convenience: a stream of successful text chunks.
    pub fn ok_chunks(texts: &[&str]) -> ScriptedReply {
        ScriptedReply::Stream(
            texts
                .iter()
                .map(|t| {
                    Ok(StreamChunk {
                        content: t.to_string(),
                        bytes: t.len() as u64,
                        tokens: 1,
                    })
                })
                .collect(),
        )
    }
}

#[async_trait]
impl ProviderTransport for ScriptedTransport {
    async fn send(&self, req: TransportRequest) -> Result<TransportReply, TransportFailure> {
        self.requests.lock().expect("requests poisoned").push(req);

        let next = {
            let mut script = self.script.lock().expect("script poisoned");
            if script.is_empty() {
                None
            } else {
                Some(script.remove(0))
            }
        };

        match next {
            None => Err(TransportFailure::http(
                500,
                "scripted transport ran out of replies",
            )),
            Some(ScriptedReply::Final(v)) => Ok(TransportReply::Final(v)),
            Some(ScriptedReply::Fail(f)) => Err(f),
            Some(ScriptedReply::Stream(items)) => {
                let (tx, rx) = tokio::sync::mpsc::channel(items.len().max(1));
                tokio::spawn(async move {
                    for item in items {
                        if tx.send(item).await.is_err() {
                            return;
                        }
                    }
                });
                Ok(TransportReply::Stream(rx))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// MemoryJournal
// ---------------------------------------------------------------------------

/// In-memory run journal for event assertions.
#[derive(Clone, Default)]
pub struct MemoryJournal {
    events: Arc<Mutex<Vec<JournalEvent>>>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<JournalEvent> {
        self.events.lock().expect("journal poisoned").clone()
    }

    /// Count events matching a predicate.
    pub fn count(&self, pred: impl Fn(&JournalEvent) -> bool) -> usize {
        self.events().iter().filter(|e| pred(e)).count()
    }
}

impl Journal for MemoryJournal {
    fn append(&self, event: JournalEvent) {
        self.events.lock().expect("journal poisoned").push(event);
    }
}
