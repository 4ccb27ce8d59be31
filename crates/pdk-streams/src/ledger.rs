//! Stream recovery ledger: per-session accounting of bytes/tokens received
//! so interruptions and restarts produce well-typed recovery information.
//!
//! Sessions live in a [`ConcurrentKv`]; each is mutated under its own lock.
//! A watchdog sweeps sessions whose last chunk is older than the staleness
//! threshold and marks them interrupted — that is what surfaces a "stalled"
//! stream to the progress renderer.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use pdk_kv::ConcurrentKv;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// A session with no chunk for this long is considered stalled.
    pub stall_after: Duration,
    /// Watchdog sweep cadence.
    pub sweep_interval: Duration,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            stall_after: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(10),
        }
    }
}

/// Terminal state of a stream session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    Completed,
    Interrupted,
    Failed,
    Cancelled,
}

impl SessionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionOutcome::Completed => "completed",
            SessionOutcome::Interrupted => "interrupted",
            SessionOutcome::Failed => "failed",
            SessionOutcome::Cancelled => "cancelled",
        }
    }
}

/// One end-to-end streaming response attempt.
#[derive(Debug, Clone)]
pub struct StreamSession {
    pub id: Uuid,
    pub provider_id: String,
    pub model_id: String,
    pub started_at: DateTime<Utc>,
    pub bytes_received: u64,
    pub tokens_received: u64,
    pub last_chunk_at: DateTime<Utc>,
    /// None while the stream is live.
    pub outcome: Option<SessionOutcome>,
}

/// Process-wide session ledger. Entries are append-only: closed sessions
/// stay queryable for post-hoc inspection until the registry is torn down.
#[derive(Default)]
pub struct StreamRecoveryLedger {
    sessions: ConcurrentKv<Arc<Mutex<StreamSession>>>,
    cfg: LedgerConfig,
}

impl StreamRecoveryLedger {
    pub fn new() -> Self {
        Self::with_config(LedgerConfig::default())
    }

    pub fn with_config(cfg: LedgerConfig) -> Self {
        Self {
            sessions: ConcurrentKv::new(),
            cfg,
        }
    }

    /// Open a session on the first chunk of a stream. Returns the session id
    /// used for all further accounting.
    pub fn open_session(&self, provider_id: &str, model_id: &str) -> Uuid {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let session = StreamSession {
            id,
            provider_id: provider_id.to_string(),
            model_id: model_id.to_string(),
            started_at: now,
            bytes_received: 0,
            tokens_received: 0,
            last_chunk_at: now,
            outcome: None,
        };
        self.sessions
            .set(id.to_string(), Arc::new(Mutex::new(session)));
        id
    }

    /// Account one received chunk. Unknown or already-closed sessions are
    /// ignored (a late chunk after the watchdog fired is not an error).
    pub fn record_chunk(&self, session_id: Uuid, bytes: u64, tokens: u64) {
        if let Some(session) = self.sessions.get(&session_id.to_string()) {
            let mut s = session.lock().expect("session lock poisoned");
            if s.outcome.is_some() {
                return;
            }
            s.bytes_received += bytes;
            s.tokens_received += tokens;
            s.last_chunk_at = Utc::now();
        }
    }

    /// Close a session with its terminal outcome. First close wins; later
    /// calls are no-ops.
    pub fn close_session(&self, session_id: Uuid, outcome: SessionOutcome) {
        if let Some(session) = self.sessions.get(&session_id.to_string()) {
            let mut s = session.lock().expect("session lock poisoned");
            if s.outcome.is_none() {
                s.outcome = Some(outcome);
            }
        }
    }

    /// Point-in-time copy of one session.
    pub fn snapshot(&self, session_id: Uuid) -> Option<StreamSession> {
        self.sessions
            .get(&session_id.to_string())
            .map(|s| s.lock().expect("session lock poisoned").clone())
    }

    /// Copies of all sessions that have not reached a terminal outcome.
    pub fn active_sessions(&self) -> Vec<StreamSession> {
        self.sessions
            .snapshot_items()
            .into_iter()
            .map(|(_, s)| s.lock().expect("session lock poisoned").clone())
            .filter(|s| s.outcome.is_none())
            .collect()
    }

    /// One watchdog pass: mark live sessions whose last chunk is older than
    /// the stall threshold as interrupted. Returns the ids marked.
    pub fn sweep_stalled(&self) -> Vec<Uuid> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.cfg.stall_after)
                .unwrap_or_else(|_| chrono::Duration::seconds(60));

        let mut marked = Vec::new();
        for (_, session) in self.sessions.snapshot_items() {
            let mut s = session.lock().expect("session lock poisoned");
            if s.outcome.is_none() && s.last_chunk_at < cutoff {
                s.outcome = Some(SessionOutcome::Interrupted);
                marked.push(s.id);
            }
        }
        if !marked.is_empty() {
            warn!(count = marked.len(), "watchdog marked stalled stream sessions interrupted");
        }
        marked
    }

    /// Spawn the watchdog; sweeps until `ctx` is cancelled.
    pub fn spawn_watchdog(self: Arc<Self>, ctx: CancellationToken) {
        let ledger = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ledger.cfg.sweep_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = ctx.cancelled() => return,
                }
                ledger.sweep_stalled();
            }
        });
    }

    /// Swap in a clean ledger between tests.
    #[cfg(any(test, feature = "testkit"))]
    pub fn reset_for_test(&self) {
        for key in self.sessions.keys() {
            self.sessions.delete(&key);
        }
    }
}
