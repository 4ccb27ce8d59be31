//! Caller-visible provider errors.
//!
//! Everything the controller could not absorb through retries or fallbacks
//! surfaces as one of these. Streaming callers receive them as the terminal
//! event on the stream sink; final-response callers get them as `Err`.

use crate::classify::FailureClass;

#[derive(Debug, Clone)]
pub enum ProviderError {
    /// A retryable class exhausted its budget (or the circuit was open) and
    /// no fallback succeeded.
    Transient {
        provider: String,
        class: Option<FailureClass>,
        message: String,
    },
    /// The provider rejected the request in a way only the user can fix
    /// (credentials, quota). Carries actionable resolution text.
    UserIntervention {
        provider: String,
        class: FailureClass,
        message: String,
        resolution: String,
    },
    /// Malformed or unfulfillable request; retrying cannot help.
    BadRequest { provider: String, message: String },
    /// The provider's content policy refused the request.
    ContentPolicy { provider: String, message: String },
    /// The stream broke and the retry budget could not recover it. The
    /// recovery ledger holds the partial session for post-hoc inspection.
    StreamInterruptedUnrecovered { provider: String, message: String },
    /// The caller's context was cancelled.
    Cancelled,
}

impl ProviderError {
    /// Resolution text for classes that need user action.
    pub fn resolution_for(class: FailureClass) -> &'static str {
        match class {
            FailureClass::AuthInvalid => {
                "verify the provider API credentials configured for this org, then retry"
            }
            FailureClass::QuotaExhausted => {
                "provider quota or billing limit reached; update billing or raise the limit, then retry"
            }
            _ => "retry later",
        }
    }
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderError::Transient {
                provider,
                class,
                message,
            } => match class {
                Some(c) => write!(f, "provider {provider} transient failure ({c}): {message}"),
                None => write!(f, "provider {provider} transient failure: {message}"),
            },
            ProviderError::UserIntervention {
                provider,
                class,
                message,
                resolution,
            } => write!(
                f,
                "provider {provider} needs user intervention ({class}): {message} — {resolution}"
            ),
            ProviderError::BadRequest { provider, message } => {
                write!(f, "provider {provider} rejected request: {message}")
            }
            ProviderError::ContentPolicy { provider, message } => {
                write!(f, "provider {provider} content policy refusal: {message}")
            }
            ProviderError::StreamInterruptedUnrecovered { provider, message } => {
                write!(f, "provider {provider} stream interrupted and not recovered: {message}")
            }
            ProviderError::Cancelled => write!(f, "provider request cancelled"),
        }
    }
}

impl std::error::Error for ProviderError {}
