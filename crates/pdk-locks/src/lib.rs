//! pdk-locks
//!
//! Durable advisory repo locks with retry, heartbeats, and reaping.
//!
//! `RepoLockStore` is the only way the rest of the core touches the
//! `repo_locks` table. An `acquire` that hits a conflict retries with
//! exponential backoff (200ms, ×2, capped at 2s, ±20% jitter, 6 attempts);
//! every wait selects on the caller's cancellation token. A held lease
//! heartbeats every 15s until released; a lease whose heartbeat lapses for
//! 60s is stale and will be swept by the next acquirer or a reap pass.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use pdk_db::{LockAttempt, NewRepoLock, ReapedLock, RepoLockRow};
use pdk_schemas::LockScope;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

// Wires RepoLockStore into the queue's LeaseStore seam.
mod lease_store;

// ---------------------------------------------------------------------------
// LockError
// ---------------------------------------------------------------------------

/// Caller-visible failures of the lock store.
#[derive(Debug)]
pub enum LockError {
    /// All retry attempts hit a conflict. Carries the attempt count and the
    /// last observed conflict cause.
    Timeout { attempts: u32, cause: String },
    /// The persistence layer is unreachable or misbehaving.
    StoreUnavailable(anyhow::Error),
    /// The caller's context was cancelled while waiting.
    Cancelled,
    /// A root lock and a branch lock were requested in the same validation
    /// pass. Raised only by validators; the runtime path surfaces conflicts
    /// as `Timeout`.
    ConflictRootBranch { plan_id: String },
}

impl std::fmt::Display for LockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockError::Timeout { attempts, cause } => {
                write!(f, "lock timeout after {attempts} attempts: {cause}")
            }
            LockError::StoreUnavailable(e) => write!(f, "lock store unavailable: {e}"),
            LockError::Cancelled => write!(f, "lock acquire cancelled"),
            LockError::ConflictRootBranch { plan_id } => {
                write!(f, "root and branch locks conflict for plan {plan_id}")
            }
        }
    }
}

impl std::error::Error for LockError {}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Retry, heartbeat, and staleness tuning for the lock store.
#[derive(Debug, Clone)]
pub struct LockConfig {
    pub retry_initial: Duration,
    pub retry_factor: f64,
    pub retry_max_delay: Duration,
    pub retry_max_attempts: u32,
    pub heartbeat_interval: Duration,
    pub stale_after: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            retry_initial: Duration::from_millis(200),
            retry_factor: 2.0,
            retry_max_delay: Duration::from_secs(2),
            retry_max_attempts: 6,
            heartbeat_interval: Duration::from_secs(15),
            stale_after: Duration::from_secs(60),
        }
    }
}

/// Backoff delay for a zero-based attempt index, before jitter.
fn backoff_delay(cfg: &LockConfig, attempt: u32) -> Duration {
    let raw = cfg.retry_initial.as_millis() as f64 * cfg.retry_factor.powi(attempt as i32);
    let capped = raw.min(cfg.retry_max_delay.as_millis() as f64);
    Duration::from_millis(capped as u64)
}

/// Apply ±20% jitter.
fn with_jitter(base: Duration) -> Duration {
    use rand::Rng;
    let factor = rand::thread_rng().gen_range(0.8..=1.2);
    Duration::from_millis((base.as_millis() as f64 * factor) as u64)
}

// ---------------------------------------------------------------------------
// AcquireParams / LockLease
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct AcquireParams {
    pub org_id: String,
    pub user_id: String,
    pub plan_id: String,
    /// None locks the plan root.
    pub branch: Option<String>,
    pub scope: LockScope,
    pub reason: String,
    pub ctx: CancellationToken,
}

/// A held lock. Heartbeats run in a background task until [`LockLease::release`]
/// or until the acquiring context is cancelled.
#[derive(Debug)]
pub struct LockLease {
    id: Uuid,
    pool: PgPool,
    hb_stop: CancellationToken,
}

impl LockLease {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Stop the heartbeat writer and delete the row. Idempotent at the
    /// store level: releasing an already-reaped lease succeeds.
    pub async fn release(self) -> Result<(), LockError> {
        self.hb_stop.cancel();
        pdk_db::lock_delete(&self.pool, self.id)
            .await
            .map_err(LockError::StoreUnavailable)
    }
}

// ---------------------------------------------------------------------------
// RepoLockStore
// ---------------------------------------------------------------------------

/// Lock store over a shared Postgres pool.
#[derive(Clone)]
pub struct RepoLockStore {
    pool: PgPool,
    cfg: Arc<LockConfig>,
}

impl RepoLockStore {
    pub fn new(pool: PgPool) -> Self {
        Self::with_config(pool, LockConfig::default())
    }

    pub fn with_config(pool: PgPool, cfg: LockConfig) -> Self {
        Self {
            pool,
            cfg: Arc::new(cfg),
        }
    }

    pub fn config(&self) -> &LockConfig {
        &self.cfg
    }

    /// Acquire a lock, retrying conflicts with backoff. On success a
    /// heartbeat writer is already running for the returned lease.
    pub async fn acquire(&self, params: AcquireParams) -> Result<LockLease, LockError> {
        let new = NewRepoLock {
            org_id: params.org_id.clone(),
            plan_id: params.plan_id.clone(),
            branch: params.branch.clone(),
            scope: params.scope,
            reason: params.reason.clone(),
        };
        let stale_secs = self.cfg.stale_after.as_secs() as i64;

        let mut last_cause = String::from("no conflict observed");
        for attempt in 0..self.cfg.retry_max_attempts {
            if params.ctx.is_cancelled() {
                return Err(LockError::Cancelled);
            }

            match pdk_db::lock_try_insert(&self.pool, &new, stale_secs).await {
                Ok(LockAttempt::Acquired(id)) => {
                    let hb_stop = self.spawn_heartbeat(id, params.ctx.clone());
                    debug!(
                        lock_id = %id,
                        plan_id = %params.plan_id,
                        scope = %params.scope,
                        attempt = attempt + 1,
                        "repo lock acquired"
                    );
                    return Ok(LockLease {
                        id,
                        pool: self.pool.clone(),
                        hb_stop,
                    });
                }
                Ok(LockAttempt::Conflict { cause }) => {
                    last_cause = cause;
                    // Last attempt gets no sleep; fall through to timeout.
                    if attempt + 1 == self.cfg.retry_max_attempts {
                        break;
                    }
                    let delay = with_jitter(backoff_delay(&self.cfg, attempt));
                    debug!(
                        plan_id = %params.plan_id,
                        scope = %params.scope,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        cause = %last_cause,
                        "lock conflict, backing off"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = params.ctx.cancelled() => return Err(LockError::Cancelled),
                    }
                }
                Err(e) => return Err(LockError::StoreUnavailable(e)),
            }
        }

        warn!(
            plan_id = %params.plan_id,
            scope = %params.scope,
            attempts = self.cfg.retry_max_attempts,
            cause = %last_cause,
            "lock acquire exhausted retries"
        );
        Err(LockError::Timeout {
            attempts: self.cfg.retry_max_attempts,
            cause: last_cause,
        })
    }

    /// Heartbeat writer for a held lease. Stops on release, on context
    /// cancellation, or when the row has been reaped out from under us —
    /// in that last case it logs once and must never re-insert the row.
    fn spawn_heartbeat(&self, id: Uuid, ctx: CancellationToken) -> CancellationToken {
        let stop = CancellationToken::new();
        let task_stop = stop.clone();
        let pool = self.pool.clone();
        let interval = self.cfg.heartbeat_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // First tick fires immediately; skip it, the row was just written.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = task_stop.cancelled() => return,
                    _ = ctx.cancelled() => return,
                }
                match pdk_db::lock_touch_heartbeat(&pool, id).await {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!(lock_id = %id, "lock row gone during heartbeat (reaped); stopping");
                        return;
                    }
                    Err(e) => {
                        // A missed heartbeat is survivable: the lease holder
                        // keeps running and a later reap cleans up if the DB
                        // stays unreachable past the stale threshold.
                        warn!(lock_id = %id, error = %e, "lock heartbeat failed");
                    }
                }
            }
        });

        stop
    }

    /// Remove stale locks for an org; returns removed (id, plan) pairs.
    pub async fn reap(&self, org_id: &str) -> Result<Vec<ReapedLock>, LockError> {
        let reaped = pdk_db::locks_reap_stale(
            &self.pool,
            org_id,
            self.cfg.stale_after.as_secs() as i64,
        )
        .await
        .map_err(LockError::StoreUnavailable)?;

        if !reaped.is_empty() {
            warn!(org_id, count = reaped.len(), "reaped stale repo locks");
        }
        Ok(reaped)
    }

    /// Diagnostics view: active and stale locks for an org, optionally
    /// narrowed to one plan.
    pub async fn inspect(
        &self,
        org_id: &str,
        plan_id: Option<&str>,
    ) -> Result<LockInspection, LockError> {
        let rows = pdk_db::locks_list(&self.pool, org_id, plan_id)
            .await
            .map_err(LockError::StoreUnavailable)?;

        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.cfg.stale_after)
                .unwrap_or_else(|_| chrono::Duration::seconds(60));
        let (active, stale) = rows
            .into_iter()
            .partition(|row| row.last_heartbeat_at > cutoff);

        Ok(LockInspection { active, stale })
    }
}

/// Snapshot returned by [`RepoLockStore::inspect`].
#[derive(Debug, Clone)]
pub struct LockInspection {
    pub active: Vec<RepoLockRow>,
    pub stale: Vec<RepoLockRow>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> LockConfig {
        LockConfig::default()
    }

    #[test]
    fn backoff_grows_and_caps() {
        let cfg = cfg();
        assert_eq!(backoff_delay(&cfg, 0), Duration::from_millis(200));
        assert_eq!(backoff_delay(&cfg, 1), Duration::from_millis(400));
        assert_eq!(backoff_delay(&cfg, 2), Duration::from_millis(800));
        assert_eq!(backoff_delay(&cfg, 3), Duration::from_millis(1600));
        // Capped from here on.
        assert_eq!(backoff_delay(&cfg, 4), Duration::from_secs(2));
        assert_eq!(backoff_delay(&cfg, 10), Duration::from_secs(2));
    }

    #[test]
    fn jitter_stays_within_twenty_percent() {
        let base = Duration::from_millis(1000);
        for _ in 0..200 {
            let d = with_jitter(base).as_millis();
            assert!((800..=1200).contains(&d), "jittered delay out of range: {d}");
        }
    }

    #[test]
    fn timeout_error_reports_attempts_and_cause() {
        let err = LockError::Timeout {
            attempts: 6,
            cause: "write lock held on branch 'main' (reason: build)".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("6 attempts"));
        assert!(msg.contains("write lock held on branch 'main'"));
    }
}
