//! Retry policies per failure class.
//!
//! The mapping is data: a class indexes into a fixed table. `Retry-After`
//! from the provider overrides the computed rate-limit delay. All delays
//! carry ±20% jitter.

use std::time::Duration;

use crate::classify::FailureClass;

/// When a class may escalate to a fallback target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackEligibility {
    Never,
    /// Only once the class's retry budget is spent.
    AfterExhaustion,
    /// Also as soon as the provider's circuit opens mid-request.
    Early,
}

/// Retry tuning for one failure class.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub initial: Duration,
    pub factor: f64,
    pub max_delay: Duration,
    pub max_attempts: u32,
    pub fallback: FallbackEligibility,
}

/// The policy table. `None` means the class is never retried against the
/// same target.
pub fn policy_for(class: FailureClass) -> Option<RetryPolicy> {
    match class {
        FailureClass::RateLimit => Some(RetryPolicy {
            initial: Duration::from_secs(1),
            factor: 2.0,
            max_delay: Duration::from_secs(60),
            max_attempts: 5,
            fallback: FallbackEligibility::AfterExhaustion,
        }),
        FailureClass::Overloaded => Some(RetryPolicy {
            initial: Duration::from_secs(5),
            factor: 2.0,
            max_delay: Duration::from_secs(120),
            max_attempts: 5,
            fallback: FallbackEligibility::Early,
        }),
        FailureClass::ServerError => Some(RetryPolicy {
            initial: Duration::from_secs(1),
            factor: 2.0,
            max_delay: Duration::from_secs(30),
            max_attempts: 3,
            fallback: FallbackEligibility::Early,
        }),
        FailureClass::Timeout => Some(RetryPolicy {
            initial: Duration::ZERO,
            factor: 1.0,
            max_delay: Duration::ZERO,
            max_attempts: 2,
            fallback: FallbackEligibility::Early,
        }),
        FailureClass::StreamInterrupted => Some(RetryPolicy {
            initial: Duration::from_secs(1),
            factor: 1.5,
            max_delay: Duration::from_secs(5),
            max_attempts: 2,
            fallback: FallbackEligibility::Never,
        }),
        FailureClass::ContextTooLong
        | FailureClass::AuthInvalid
        | FailureClass::BadRequest
        | FailureClass::ContentPolicy
        | FailureClass::QuotaExhausted => None,
    }
}

/// Fallback eligibility for non-retryable classes: context overflow
/// escalates to the configured large-context model, everything else is
/// terminal.
pub fn fallback_for(class: FailureClass) -> FallbackEligibility {
    match policy_for(class) {
        Some(policy) => policy.fallback,
        None => match class {
            FailureClass::ContextTooLong => FallbackEligibility::AfterExhaustion,
            _ => FallbackEligibility::Never,
        },
    }
}

/// Backoff delay for a zero-based attempt index, before jitter.
pub fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let raw = policy.initial.as_millis() as f64 * policy.factor.powi(attempt as i32);
    let capped = raw.min(policy.max_delay.as_millis() as f64);
    Duration::from_millis(capped as u64)
}

/// Full delay computation: `Retry-After` override, then ±20% jitter.
pub fn delay_for(policy: &RetryPolicy, attempt: u32, retry_after: Option<Duration>) -> Duration {
    let base = retry_after.unwrap_or_else(|| backoff_delay(policy, attempt));
    with_jitter(base)
}

fn with_jitter(base: Duration) -> Duration {
    if base.is_zero() {
        return base;
    }
    use rand::Rng;
    let factor = rand::thread_rng().gen_range(0.8..=1.2);
    Duration::from_millis((base.as_millis() as f64 * factor) as u64)
}
