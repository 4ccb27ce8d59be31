//! Model-stream directory: persistent record of which host owns the stream
//! for a (plan, branch).
//!
//! Claiming inserts a record and starts a heartbeat writer that runs until
//! the owning context is cancelled, at which point the record is deleted.
//! A record whose heartbeat lapses past the stale threshold is expired:
//! `find_active` ignores it, claims sweep it, and the reaper removes it.

use std::sync::Arc;
use std::time::Duration;

use pdk_db::{ModelStreamRow, NewModelStream, StreamClaim};
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct StreamDirectoryConfig {
    pub heartbeat_interval: Duration,
    pub stale_after: Duration,
    /// Cadence of the background reap sweep.
    pub reap_interval: Duration,
}

impl Default for StreamDirectoryConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(10),
            stale_after: Duration::from_secs(60),
            reap_interval: Duration::from_secs(30),
        }
    }
}

/// Outcome of a claim attempt.
#[derive(Debug, Clone)]
pub enum ClaimOutcome {
    Claimed(Uuid),
    /// Another host holds a live record for the key.
    Conflict { host: String },
}

#[derive(Clone)]
pub struct ModelStreamDirectory {
    pool: PgPool,
    cfg: Arc<StreamDirectoryConfig>,
}

impl ModelStreamDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self::with_config(pool, StreamDirectoryConfig::default())
    }

    pub fn with_config(pool: PgPool, cfg: StreamDirectoryConfig) -> Self {
        Self {
            pool,
            cfg: Arc::new(cfg),
        }
    }

    pub fn config(&self) -> &StreamDirectoryConfig {
        &self.cfg
    }

    /// The non-expired record for (plan, branch), if any.
    pub async fn find_active(
        &self,
        plan_id: &str,
        branch: &str,
    ) -> anyhow::Result<Option<ModelStreamRow>> {
        pdk_db::stream_find_active(
            &self.pool,
            plan_id,
            branch,
            self.cfg.stale_after.as_secs() as i64,
        )
        .await
    }

    /// Claim stream ownership for (plan, branch). On success a heartbeat
    /// writer is already running; it stops and deletes the record when
    /// `ctx` is cancelled.
    pub async fn claim(
        &self,
        new: NewModelStream,
        ctx: &CancellationToken,
    ) -> anyhow::Result<ClaimOutcome> {
        let claim = pdk_db::stream_try_insert(
            &self.pool,
            &new,
            self.cfg.stale_after.as_secs() as i64,
        )
        .await?;

        match claim {
            StreamClaim::Conflict(row) => Ok(ClaimOutcome::Conflict {
                host: row.internal_ip,
            }),
            StreamClaim::Claimed(id) => {
                debug!(stream_id = %id, plan_id = %new.plan_id, branch = %new.branch, "stream claimed");
                self.spawn_heartbeat(id, ctx.clone());
                Ok(ClaimOutcome::Claimed(id))
            }
        }
    }

    /// Heartbeat writer for a claimed stream. On context cancellation the
    /// record is deleted. A record reaped out from under us stops the
    /// writer silently; it must never be re-inserted.
    fn spawn_heartbeat(&self, id: Uuid, ctx: CancellationToken) {
        let pool = self.pool.clone();
        let interval = self.cfg.heartbeat_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // immediate first tick; row is fresh
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = ctx.cancelled() => {
                        if let Err(e) = pdk_db::stream_delete(&pool, id).await {
                            warn!(stream_id = %id, error = %e, "stream record delete on cancel failed");
                        }
                        return;
                    }
                }
                match pdk_db::stream_touch_heartbeat(&pool, id).await {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!(stream_id = %id, "stream record gone during heartbeat (reaped); stopping");
                        return;
                    }
                    Err(e) => {
                        warn!(stream_id = %id, error = %e, "stream heartbeat failed");
                    }
                }
            }
        });
    }

    /// Remove expired records fleet-wide. Returns removed ids.
    pub async fn reap_stale(&self) -> anyhow::Result<Vec<Uuid>> {
        let reaped =
            pdk_db::streams_reap_stale(&self.pool, self.cfg.stale_after.as_secs() as i64).await?;
        if !reaped.is_empty() {
            warn!(count = reaped.len(), "reaped stale model streams");
        }
        Ok(reaped)
    }

    /// Background sweeper; runs until `ctx` is cancelled.
    pub fn spawn_reaper(&self, ctx: CancellationToken) {
        let dir = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(dir.cfg.reap_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = ctx.cancelled() => return,
                }
                if let Err(e) = dir.reap_stale().await {
                    warn!(error = %e, "stream reap sweep failed");
                }
            }
        });
    }

    /// Count of live streams for an org (diagnostics surface).
    pub async fn count_active(&self, org_id: &str) -> anyhow::Result<i64> {
        pdk_db::streams_count_active(&self.pool, org_id, self.cfg.stale_after.as_secs() as i64)
            .await
    }
}
