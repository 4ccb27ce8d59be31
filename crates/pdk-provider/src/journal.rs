//! Run-journal seam.
//!
//! Every attempt appends an event so a run's provider history can be
//! reconstructed: what failed, what was retried after which delay, when a
//! circuit moved, which fallback was taken. The journal implementation is
//! a collaborator (file-backed in production, in-memory in tests).

use serde::{Deserialize, Serialize};

use crate::classify::FailureClass;

/// One journal entry. Serialized with a tag so the journal file is a
/// self-describing JSONL stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JournalEvent {
    RetryAttempt {
        provider: String,
        model: String,
        class: FailureClass,
        attempt: u32,
        delay_ms: u64,
        saw_partial: bool,
    },
    RetryExhaust {
        provider: String,
        model: String,
        class: FailureClass,
        attempts: u32,
        saw_partial: bool,
    },
    CircuitEvent {
        provider: String,
        from: String,
        to: String,
    },
    FallbackEvent {
        /// "context" for the large-context model hop, "provider" for the
        /// alternate-provider hop.
        kind: String,
        from_provider: String,
        from_model: String,
        to_provider: String,
        to_model: String,
    },
}

/// Append-only journal seam. Appends must not fail the request path;
/// implementations swallow and log their own I/O errors.
pub trait Journal: Send + Sync {
    fn append(&self, event: JournalEvent);
}

/// Discards everything. Default wiring for callers that do not journal.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopJournal;

impl Journal for NoopJournal {
    fn append(&self, _event: JournalEvent) {}
}
