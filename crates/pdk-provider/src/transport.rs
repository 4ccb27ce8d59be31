//! Provider transport seam.
//!
//! The transport is dumb: one request in, one reply or failure out, no
//! retry of its own. All resilience lives in the controller.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

/// What the controller hands the transport for one attempt. Retries reuse
/// the same `idempotency_key` so the provider can deduplicate.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub provider_id: String,
    pub model_id: String,
    pub body: Value,
    pub streaming: bool,
    pub idempotency_key: String,
}

/// One streamed chunk of model output.
#[derive(Debug, Clone)]
pub struct StreamChunk {
    pub content: String,
    pub bytes: u64,
    pub tokens: u64,
}

/// Failure surface of a transport attempt, before classification.
#[derive(Debug, Clone)]
pub struct TransportFailure {
    pub kind: TransportFailureKind,
    /// HTTP status for `Http` failures.
    pub status: Option<u16>,
    /// Response body or error text; classification scans it for provider
    /// markers (context limit, overload, policy, quota).
    pub message: String,
    /// Parsed `Retry-After`, when the provider sent one.
    pub retry_after: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportFailureKind {
    /// HTTP-level rejection carrying a status code.
    Http,
    /// Transport timeout before a response arrived.
    Timeout,
    /// Reset or EOF mid-stream.
    StreamInterrupted,
}

impl TransportFailure {
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self {
            kind: TransportFailureKind::Http,
            status: Some(status),
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            kind: TransportFailureKind::Timeout,
            status: None,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn interrupted(message: impl Into<String>) -> Self {
        Self {
            kind: TransportFailureKind::StreamInterrupted,
            status: None,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn with_retry_after(mut self, after: Duration) -> Self {
        self.retry_after = Some(after);
        self
    }
}

impl std::fmt::Display for TransportFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.kind, self.status) {
            (TransportFailureKind::Http, Some(status)) => {
                write!(f, "HTTP {status}: {}", self.message)
            }
            (TransportFailureKind::Timeout, _) => write!(f, "transport timeout: {}", self.message),
            (TransportFailureKind::StreamInterrupted, _) => {
                write!(f, "stream interrupted: {}", self.message)
            }
            _ => write!(f, "transport failure: {}", self.message),
        }
    }
}

/// Items of a transport stream: chunks until either a clean close (success)
/// or one terminal `Err` item followed by close (interruption or provider
/// error surfaced mid-stream).
pub type TransportStream = mpsc::Receiver<Result<StreamChunk, TransportFailure>>;

pub enum TransportReply {
    Final(Value),
    Stream(TransportStream),
}

/// The wire seam. Implementations handle one provider protocol each and do
/// not retry.
#[async_trait]
pub trait ProviderTransport: Send + Sync {
    async fn send(&self, req: TransportRequest) -> Result<TransportReply, TransportFailure>;
}
