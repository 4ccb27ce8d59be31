//! pdk-provider
//!
//! The provider request controller: classification of provider failures,
//! per-class retry policies, a per-provider circuit breaker, fallback
//! escalation, and journaling of every attempt.
//!
//! Module map:
//! - [`transport`] — the dumb wire seam the controller drives
//! - [`classify`] — failure → class mapping (data, not behavior)
//! - [`policy`] — per-class retry policy table, backoff and jitter
//! - [`breaker`] — per-provider circuit state machine and table
//! - [`journal`] — the run-journal seam and event types
//! - [`controller`] — the driver tying it together
//! - [`error`] — the caller-visible error taxonomy

pub mod breaker;
pub mod classify;
pub mod controller;
pub mod error;
pub mod journal;
pub mod policy;
pub mod transport;

pub use breaker::{BreakerConfig, CircuitState, CircuitTable, Transition};
pub use classify::{classify, FailureClass};
pub use controller::{
    ControllerConfig, ProviderFallback, ProviderRequest, ProviderRequestController, StreamEvent,
};
pub use error::ProviderError;
pub use journal::{Journal, JournalEvent, NoopJournal};
pub use policy::{backoff_delay, delay_for, fallback_for, policy_for, FallbackEligibility, RetryPolicy};
pub use transport::{
    ProviderTransport, StreamChunk, TransportFailure, TransportFailureKind, TransportReply,
    TransportRequest, TransportStream,
};
