//! The composed activation path.
//!
//! Activating (plan, branch) must be race-free across the fleet:
//!
//! 1. check the directory for a live record (cheap fast-fail with the
//!    owning host's address)
//! 2. atomic insert into the host-local registry
//! 3. claim the directory record
//!
//! A conflict at step 3 (another host won between 1 and 3) rolls back
//! step 2 so no orphaned local entry survives.

use std::sync::Arc;

use pdk_active::{ActivePlanEntry, ActivePlanRegistry, NewActivePlan, StreamOutcome};
use pdk_db::NewModelStream;
use pdk_schemas::PlanKey;
use tokio::sync::oneshot;
use tracing::debug;

use crate::directory::{ClaimOutcome, ModelStreamDirectory};

// ---------------------------------------------------------------------------
// ActivateError
// ---------------------------------------------------------------------------

/// Why an activation was rejected. The remote variants carry the owning
/// host so the caller can offer attach-or-stop.
#[derive(Debug)]
pub enum ActivateError {
    /// An entry already exists on this host for the key.
    AlreadyActiveLocal,
    /// A live stream record exists on another host.
    AlreadyActiveRemote { host: String },
    /// The directory could not be read or written.
    Store(anyhow::Error),
}

impl std::fmt::Display for ActivateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActivateError::AlreadyActiveLocal => {
                write!(f, "plan is already active on this host")
            }
            ActivateError::AlreadyActiveRemote { host } => {
                write!(f, "plan is already active on host {host}")
            }
            ActivateError::Store(e) => write!(f, "stream directory unavailable: {e}"),
        }
    }
}

impl std::error::Error for ActivateError {}

// ---------------------------------------------------------------------------
// activate
// ---------------------------------------------------------------------------

/// Activation inputs beyond the plan entry itself.
#[derive(Debug, Clone)]
pub struct ActivationParams {
    pub plan: NewActivePlan,
    /// This host's address, recorded in the claimed directory row.
    pub internal_ip: String,
}

/// Activate (plan, branch) on this host. On success the returned entry is
/// registered locally, owns a claimed directory record with a running
/// heartbeat, and the receiver delivers the stream's terminal outcome.
pub async fn activate(
    registry: &ActivePlanRegistry,
    directory: &ModelStreamDirectory,
    key: &PlanKey,
    params: ActivationParams,
) -> Result<(Arc<ActivePlanEntry>, oneshot::Receiver<StreamOutcome>), ActivateError> {
    // Fast-fail on a live foreign record before touching local state.
    let existing = directory
        .find_active(key.plan_id(), key.branch())
        .await
        .map_err(ActivateError::Store)?;
    if let Some(row) = existing {
        return Err(ActivateError::AlreadyActiveRemote {
            host: row.internal_ip,
        });
    }

    let org_id = params.plan.org_id.clone();
    let (entry, done_rx) = registry
        .activate(key, params.plan)
        .ok_or(ActivateError::AlreadyActiveLocal)?;

    // Claim under the entry's own context so cancellation tears the
    // directory record down with the execution.
    let claim_ctx = entry.child_ctx();
    let claim = directory
        .claim(
            NewModelStream {
                org_id,
                plan_id: key.plan_id().to_string(),
                branch: key.branch().to_string(),
                internal_ip: params.internal_ip,
            },
            &claim_ctx,
        )
        .await;

    match claim {
        Ok(ClaimOutcome::Claimed(stream_id)) => {
            entry.set_model_stream_id(stream_id);
            debug!(key = %key, stream_id = %stream_id, "activation complete");
            Ok((entry, done_rx))
        }
        Ok(ClaimOutcome::Conflict { host }) => {
            // Another host won between find_active and claim; release the
            // local entry so nothing orphaned survives.
            registry.delete(key);
            Err(ActivateError::AlreadyActiveRemote { host })
        }
        Err(e) => {
            registry.delete(key);
            Err(ActivateError::Store(e))
        }
    }
}
