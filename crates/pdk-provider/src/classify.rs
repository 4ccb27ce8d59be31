//! Failure classification.
//!
//! Maps a raw transport failure (status code, body markers, transport
//! error kind) to one failure class. Behavior is not encoded here: the
//! class indexes into the retry-policy table in `policy`.

use serde::{Deserialize, Serialize};

use crate::transport::{TransportFailure, TransportFailureKind};

/// Provider failure classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    RateLimit,
    Overloaded,
    ServerError,
    Timeout,
    StreamInterrupted,
    ContextTooLong,
    AuthInvalid,
    BadRequest,
    ContentPolicy,
    QuotaExhausted,
}

impl FailureClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureClass::RateLimit => "rate_limit",
            FailureClass::Overloaded => "overloaded",
            FailureClass::ServerError => "server_error",
            FailureClass::Timeout => "timeout",
            FailureClass::StreamInterrupted => "stream_interrupted",
            FailureClass::ContextTooLong => "context_too_long",
            FailureClass::AuthInvalid => "auth_invalid",
            FailureClass::BadRequest => "bad_request",
            FailureClass::ContentPolicy => "content_policy",
            FailureClass::QuotaExhausted => "quota_exhausted",
        }
    }

    /// Classes the controller retries against the same target. Only these
    /// count toward the circuit breaker: auth and bad-request failures are
    /// client errors, not provider health signals.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FailureClass::RateLimit
                | FailureClass::Overloaded
                | FailureClass::ServerError
                | FailureClass::Timeout
                | FailureClass::StreamInterrupted
        )
    }

    /// Classes that demand operator/user action rather than a retry.
    pub fn is_user_intervention(&self) -> bool {
        matches!(self, FailureClass::AuthInvalid | FailureClass::QuotaExhausted)
    }
}

impl std::fmt::Display for FailureClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// Marker sets scanned in the response body. Providers disagree on exact
// phrasing; these cover the ones seen in practice.
const CONTEXT_MARKERS: &[&str] = &[
    "context_length_exceeded",
    "maximum context length",
    "context window",
    "too many tokens",
    "prompt is too long",
];

const OVERLOAD_MARKERS: &[&str] = &["overloaded", "overloaded_error", "at capacity"];

const POLICY_MARKERS: &[&str] = &[
    "content_policy",
    "content policy",
    "content_filter",
    "responsible ai",
];

const QUOTA_MARKERS: &[&str] = &[
    "insufficient_quota",
    "quota exceeded",
    "billing",
    "payment required",
];

fn contains_any(haystack: &str, markers: &[&str]) -> bool {
    let lower = haystack.to_ascii_lowercase();
    markers.iter().any(|m| lower.contains(m))
}

/// Classify one transport failure.
pub fn classify(failure: &TransportFailure) -> FailureClass {
    match failure.kind {
        TransportFailureKind::Timeout => return FailureClass::Timeout,
        TransportFailureKind::StreamInterrupted => return FailureClass::StreamInterrupted,
        TransportFailureKind::Http => {}
    }

    // Body markers win over bare status: a 400 carrying a policy marker is
    // a policy refusal, not a generic bad request.
    if contains_any(&failure.message, POLICY_MARKERS) {
        return FailureClass::ContentPolicy;
    }
    if contains_any(&failure.message, QUOTA_MARKERS) {
        return FailureClass::QuotaExhausted;
    }

    match failure.status {
        Some(429) => FailureClass::RateLimit,
        Some(503) => FailureClass::Overloaded,
        Some(500) | Some(502) | Some(504) => FailureClass::ServerError,
        Some(401) | Some(403) => FailureClass::AuthInvalid,
        Some(400) => {
            if contains_any(&failure.message, CONTEXT_MARKERS) {
                FailureClass::ContextTooLong
            } else {
                FailureClass::BadRequest
            }
        }
        Some(status) if (500..600).contains(&status) => {
            if contains_any(&failure.message, OVERLOAD_MARKERS) {
                FailureClass::Overloaded
            } else {
                FailureClass::ServerError
            }
        }
        Some(_) => FailureClass::BadRequest,
        None => {
            if contains_any(&failure.message, OVERLOAD_MARKERS) {
                FailureClass::Overloaded
            } else {
                FailureClass::ServerError
            }
        }
    }
}
