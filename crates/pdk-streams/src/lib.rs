//! pdk-streams
//!
//! Cross-host stream ownership and per-stream recovery accounting:
//!
//! - [`directory`]: the persistent model-stream directory. At most one
//!   non-expired record per (plan, branch) across the fleet; records
//!   heartbeat every 10s and go stale after 60s.
//! - [`ledger`]: in-process append-only accounting of stream sessions
//!   (bytes, tokens, last chunk) with a watchdog that marks stalled
//!   sessions interrupted.
//! - [`activation`]: the composed activate path — local registry insert,
//!   directory claim, rollback on conflict.

pub mod activation;
pub mod directory;
pub mod ledger;

pub use activation::{activate, ActivateError, ActivationParams};
pub use directory::{ClaimOutcome, ModelStreamDirectory, StreamDirectoryConfig};
pub use ledger::{
    LedgerConfig, SessionOutcome, StreamRecoveryLedger, StreamSession,
};
