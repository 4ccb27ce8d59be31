//! The provider request controller.
//!
//! Wraps every model-provider call: gates through the per-provider circuit
//! breaker, applies the per-class retry policy, escalates to configured
//! fallbacks, and journals every attempt. Retries always reuse the caller's
//! idempotency key; partial streams are never resumed — a retry replays the
//! full request and the stream sink gets a `Restarted` marker first.

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::breaker::{CircuitState, CircuitTable, Transition};
use crate::classify::{classify, FailureClass};
use crate::error::ProviderError;
use crate::journal::{Journal, JournalEvent};
use crate::policy::{delay_for, fallback_for, policy_for, FallbackEligibility};
use crate::transport::{
    ProviderTransport, StreamChunk, TransportReply, TransportRequest,
};

/// Events delivered on the streaming sink. Exactly one terminal event
/// (`Done` or `Failed`) ends every stream.
#[derive(Debug)]
pub enum StreamEvent {
    Chunk(StreamChunk),
    /// The request was replayed after partial content was already
    /// delivered; the consumer must reset accumulated state.
    Restarted,
    Done,
    Failed(ProviderError),
}

/// One controller call.
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub provider_id: String,
    pub model_id: String,
    pub body: Value,
    /// Reused verbatim on every retry so providers can deduplicate.
    pub idempotency_key: String,
    pub ctx: CancellationToken,
}

// ---------------------------------------------------------------------------
// Fallback configuration
// ---------------------------------------------------------------------------

/// Per-provider escalation targets.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProviderFallback {
    /// Same-provider model used when the request overflows the context
    /// window.
    pub large_context_model: Option<String>,
    /// Alternate provider tried for the same model on transient exhaustion.
    pub alternate_provider: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ControllerConfig {
    #[serde(default)]
    pub fallbacks: HashMap<String, ProviderFallback>,
}

impl ControllerConfig {
    fn large_context_model(&self, provider: &str) -> Option<&str> {
        self.fallbacks
            .get(provider)
            .and_then(|f| f.large_context_model.as_deref())
    }

    fn alternate_provider(&self, provider: &str) -> Option<&str> {
        self.fallbacks
            .get(provider)
            .and_then(|f| f.alternate_provider.as_deref())
    }
}

// ---------------------------------------------------------------------------
// Internal attempt bookkeeping
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Target {
    provider: String,
    model: String,
}

/// Why one target gave up, with enough detail to pick a fallback.
#[derive(Debug)]
struct TargetFailure {
    class: Option<FailureClass>,
    message: String,
    /// The class's retry budget was spent.
    exhausted: bool,
    /// The breaker blocked the attempt or opened during this target.
    circuit_open: bool,
    saw_partial: bool,
    cancelled: bool,
}

impl TargetFailure {
    fn cancelled() -> Self {
        Self {
            class: None,
            message: "cancelled".into(),
            exhausted: false,
            circuit_open: false,
            saw_partial: false,
            cancelled: true,
        }
    }
}

// ---------------------------------------------------------------------------
// ProviderRequestController
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct ProviderRequestController {
    transport: Arc<dyn ProviderTransport>,
    journal: Arc<dyn Journal>,
    breakers: Arc<CircuitTable>,
    cfg: Arc<ControllerConfig>,
}

impl ProviderRequestController {
    pub fn new(
        transport: Arc<dyn ProviderTransport>,
        journal: Arc<dyn Journal>,
        breakers: Arc<CircuitTable>,
        cfg: ControllerConfig,
    ) -> Self {
        Self {
            transport,
            journal,
            breakers,
            cfg: Arc::new(cfg),
        }
    }

    pub fn breakers(&self) -> &CircuitTable {
        &self.breakers
    }

    // -- final-response path ------------------------------------------------

    /// Issue a non-streaming request; retries and fallbacks happen inside.
    pub async fn complete(&self, req: &ProviderRequest) -> Result<Value, ProviderError> {
        let mut target = Target {
            provider: req.provider_id.clone(),
            model: req.model_id.clone(),
        };
        let mut used_context = false;
        let mut used_alternate = false;

        loop {
            match self.try_complete_target(&target, req).await {
                Ok(v) => return Ok(v),
                Err(f) if f.cancelled => return Err(ProviderError::Cancelled),
                Err(f) => match self.next_target(&f, &target, req, &mut used_context, &mut used_alternate) {
                    Some(next) => target = next,
                    None => return Err(self.to_provider_error(&target, f)),
                },
            }
        }
    }

    async fn try_complete_target(
        &self,
        target: &Target,
        req: &ProviderRequest,
    ) -> Result<Value, TargetFailure> {
        let mut attempts: HashMap<FailureClass, u32> = HashMap::new();
        let mut circuit_opened = false;

        loop {
            if req.ctx.is_cancelled() {
                return Err(TargetFailure::cancelled());
            }

            let (allowed, transition) = self.breakers.allow_request(&target.provider);
            self.journal_transition(&target.provider, transition);
            if !allowed {
                return Err(TargetFailure {
                    class: None,
                    message: format!("circuit open for provider {}", target.provider),
                    exhausted: false,
                    circuit_open: true,
                    saw_partial: false,
                    cancelled: false,
                });
            }

            let reply = self
                .transport
                .send(TransportRequest {
                    provider_id: target.provider.clone(),
                    model_id: target.model.clone(),
                    body: req.body.clone(),
                    streaming: false,
                    idempotency_key: req.idempotency_key.clone(),
                })
                .await;

            let failure = match reply {
                Ok(TransportReply::Final(v)) => {
                    let t = self.breakers.record_success(&target.provider);
                    self.journal_transition(&target.provider, t);
                    return Ok(v);
                }
                Ok(TransportReply::Stream(_)) => {
                    return Err(TargetFailure {
                        class: Some(FailureClass::BadRequest),
                        message: "transport returned a stream for a final-response request".into(),
                        exhausted: false,
                        circuit_open: circuit_opened,
                        saw_partial: false,
                        cancelled: false,
                    });
                }
                Err(f) => f,
            };

            if let Some(step) = self
                .handle_failed_attempt(
                    target,
                    &failure,
                    &mut attempts,
                    &mut circuit_opened,
                    false,
                    &req.ctx,
                )
                .await
            {
                return Err(step);
            }
        }
    }

    // -- streaming path -----------------------------------------------------

    /// Issue a streaming request. Returns immediately; chunks, restart
    /// markers, and exactly one terminal event arrive on the receiver.
    pub fn stream(&self, req: ProviderRequest) -> mpsc::Receiver<StreamEvent> {
        let (tx, rx) = mpsc::channel(64);
        let ctrl = self.clone();
        tokio::spawn(async move {
            ctrl.drive_stream(req, tx).await;
        });
        rx
    }

    async fn drive_stream(&self, req: ProviderRequest, out: mpsc::Sender<StreamEvent>) {
        let mut target = Target {
            provider: req.provider_id.clone(),
            model: req.model_id.clone(),
        };
        let mut used_context = false;
        let mut used_alternate = false;
        let mut saw_partial = false;

        loop {
            match self
                .try_stream_target(&target, &req, &out, &mut saw_partial)
                .await
            {
                Ok(()) => {
                    let _ = out.send(StreamEvent::Done).await;
                    return;
                }
                Err(f) if f.cancelled => {
                    let _ = out.send(StreamEvent::Failed(ProviderError::Cancelled)).await;
                    return;
                }
                Err(f) => match self.next_target(&f, &target, &req, &mut used_context, &mut used_alternate) {
                    Some(next) => target = next,
                    None => {
                        let err = self.to_provider_error(&target, f);
                        let _ = out.send(StreamEvent::Failed(err)).await;
                        return;
                    }
                },
            }
        }
    }

    async fn try_stream_target(
        &self,
        target: &Target,
        req: &ProviderRequest,
        out: &mpsc::Sender<StreamEvent>,
        saw_partial: &mut bool,
    ) -> Result<(), TargetFailure> {
        let mut attempts: HashMap<FailureClass, u32> = HashMap::new();
        let mut circuit_opened = false;

        loop {
            if req.ctx.is_cancelled() {
                return Err(TargetFailure::cancelled());
            }

            let (allowed, transition) = self.breakers.allow_request(&target.provider);
            self.journal_transition(&target.provider, transition);
            if !allowed {
                return Err(TargetFailure {
                    class: None,
                    message: format!("circuit open for provider {}", target.provider),
                    exhausted: false,
                    circuit_open: true,
                    saw_partial: *saw_partial,
                    cancelled: false,
                });
            }

            let reply = self
                .transport
                .send(TransportRequest {
                    provider_id: target.provider.clone(),
                    model_id: target.model.clone(),
                    body: req.body.clone(),
                    streaming: true,
                    idempotency_key: req.idempotency_key.clone(),
                })
                .await;

            let failure = match reply {
                Ok(TransportReply::Stream(mut chunks)) => {
                    // A replay after partial content: the consumer must
                    // reset whatever it accumulated.
                    if *saw_partial && out.send(StreamEvent::Restarted).await.is_err() {
                        return Err(TargetFailure::cancelled());
                    }

                    loop {
                        tokio::select! {
                            item = chunks.recv() => match item {
                                Some(Ok(chunk)) => {
                                    *saw_partial = true;
                                    if out.send(StreamEvent::Chunk(chunk)).await.is_err() {
                                        // Consumer hung up; stop quietly.
                                        return Err(TargetFailure::cancelled());
                                    }
                                }
                                Some(Err(f)) => break f,
                                None => {
                                    let t = self.breakers.record_success(&target.provider);
                                    self.journal_transition(&target.provider, t);
                                    return Ok(());
                                }
                            },
                            _ = req.ctx.cancelled() => return Err(TargetFailure::cancelled()),
                        }
                    }
                }
                Ok(TransportReply::Final(_)) => {
                    // Degenerate but harmless: the whole response arrived at
                    // once. Success with no chunks.
                    let t = self.breakers.record_success(&target.provider);
                    self.journal_transition(&target.provider, t);
                    return Ok(());
                }
                Err(f) => f,
            };

            if let Some(step) = self
                .handle_failed_attempt(
                    target,
                    &failure,
                    &mut attempts,
                    &mut circuit_opened,
                    *saw_partial,
                    &req.ctx,
                )
                .await
            {
                return Err(step);
            }
        }
    }

    // -- shared attempt machinery -------------------------------------------

    /// Classify one failed attempt, update the breaker and journal, and
    /// either wait out the backoff (returning `None` to retry) or produce
    /// the target's terminal failure.
    async fn handle_failed_attempt(
        &self,
        target: &Target,
        failure: &crate::transport::TransportFailure,
        attempts: &mut HashMap<FailureClass, u32>,
        circuit_opened: &mut bool,
        saw_partial: bool,
        ctx: &CancellationToken,
    ) -> Option<TargetFailure> {
        let class = classify(failure);

        if class.is_retryable() {
            let t = self.breakers.record_failure(&target.provider);
            if let Some(t) = t {
                if t.to == CircuitState::Open {
                    *circuit_opened = true;
                }
            }
            self.journal_transition(&target.provider, t);
        }

        let count = {
            let n = attempts.entry(class).or_insert(0);
            *n += 1;
            *n
        };

        let Some(policy) = policy_for(class) else {
            debug!(provider = %target.provider, class = %class, "non-retryable provider failure");
            return Some(TargetFailure {
                class: Some(class),
                message: failure.to_string(),
                exhausted: false,
                circuit_open: *circuit_opened,
                saw_partial,
                cancelled: false,
            });
        };

        if count >= policy.max_attempts {
            self.journal.append(JournalEvent::RetryAttempt {
                provider: target.provider.clone(),
                model: target.model.clone(),
                class,
                attempt: count,
                delay_ms: 0,
                saw_partial,
            });
            self.journal.append(JournalEvent::RetryExhaust {
                provider: target.provider.clone(),
                model: target.model.clone(),
                class,
                attempts: count,
                saw_partial,
            });
            warn!(
                provider = %target.provider,
                model = %target.model,
                class = %class,
                attempts = count,
                "retry budget exhausted"
            );
            return Some(TargetFailure {
                class: Some(class),
                message: failure.to_string(),
                exhausted: true,
                circuit_open: *circuit_opened,
                saw_partial,
                cancelled: false,
            });
        }

        // The circuit opened mid-request: classes marked for early fallback
        // stop burning retries against a provider that is clearly down.
        if *circuit_opened && policy.fallback == FallbackEligibility::Early {
            return Some(TargetFailure {
                class: Some(class),
                message: failure.to_string(),
                exhausted: false,
                circuit_open: true,
                saw_partial,
                cancelled: false,
            });
        }

        let delay = delay_for(&policy, count - 1, failure.retry_after);
        self.journal.append(JournalEvent::RetryAttempt {
            provider: target.provider.clone(),
            model: target.model.clone(),
            class,
            attempt: count,
            delay_ms: delay.as_millis() as u64,
            saw_partial,
        });
        warn!(
            provider = %target.provider,
            model = %target.model,
            class = %class,
            attempt = count,
            delay_ms = delay.as_millis() as u64,
            "retrying after provider failure"
        );

        tokio::select! {
            _ = tokio::time::sleep(delay) => None,
            _ = ctx.cancelled() => Some(TargetFailure::cancelled()),
        }
    }

    /// Escalation: (1) same provider, large-context model on context
    /// overflow; (2) configured alternate provider for the requested model;
    /// (3) bubble up (None).
    fn next_target(
        &self,
        failure: &TargetFailure,
        current: &Target,
        req: &ProviderRequest,
        used_context: &mut bool,
        used_alternate: &mut bool,
    ) -> Option<Target> {
        if failure.class == Some(FailureClass::ContextTooLong) && !*used_context {
            if let Some(model) = self.cfg.large_context_model(&current.provider) {
                *used_context = true;
                self.journal.append(JournalEvent::FallbackEvent {
                    kind: "context".into(),
                    from_provider: current.provider.clone(),
                    from_model: current.model.clone(),
                    to_provider: current.provider.clone(),
                    to_model: model.to_string(),
                });
                warn!(
                    provider = %current.provider,
                    from_model = %current.model,
                    to_model = %model,
                    "context overflow, falling back to large-context model"
                );
                return Some(Target {
                    provider: current.provider.clone(),
                    model: model.to_string(),
                });
            }
        }

        let eligible = if failure.circuit_open {
            true
        } else {
            match failure.class.map(fallback_for) {
                Some(FallbackEligibility::Early) => failure.exhausted || failure.circuit_open,
                Some(FallbackEligibility::AfterExhaustion) => failure.exhausted,
                _ => false,
            }
        };
        // Stream interruptions never fall back: a different provider cannot
        // continue another provider's partial stream.
        if failure.class == Some(FailureClass::StreamInterrupted) {
            return None;
        }

        if eligible && !*used_alternate {
            if let Some(provider) = self.cfg.alternate_provider(&req.provider_id) {
                *used_alternate = true;
                self.journal.append(JournalEvent::FallbackEvent {
                    kind: "provider".into(),
                    from_provider: current.provider.clone(),
                    from_model: current.model.clone(),
                    to_provider: provider.to_string(),
                    to_model: req.model_id.clone(),
                });
                warn!(
                    from_provider = %current.provider,
                    to_provider = %provider,
                    model = %req.model_id,
                    "falling back to alternate provider"
                );
                return Some(Target {
                    provider: provider.to_string(),
                    model: req.model_id.clone(),
                });
            }
        }

        None
    }

    fn to_provider_error(&self, target: &Target, f: TargetFailure) -> ProviderError {
        let provider = target.provider.clone();
        match f.class {
            None => ProviderError::Transient {
                provider,
                class: None,
                message: f.message,
            },
            Some(class) if class.is_user_intervention() => ProviderError::UserIntervention {
                provider,
                class,
                message: f.message,
                resolution: ProviderError::resolution_for(class).to_string(),
            },
            Some(FailureClass::ContentPolicy) => ProviderError::ContentPolicy {
                provider,
                message: f.message,
            },
            Some(FailureClass::BadRequest) | Some(FailureClass::ContextTooLong) => {
                ProviderError::BadRequest {
                    provider,
                    message: f.message,
                }
            }
            Some(FailureClass::StreamInterrupted) => {
                let message = if f.saw_partial {
                    format!("{} (partial content was delivered)", f.message)
                } else {
                    f.message
                };
                ProviderError::StreamInterruptedUnrecovered { provider, message }
            }
            Some(class) => ProviderError::Transient {
                provider,
                class: Some(class),
                message: f.message,
            },
        }
    }

    fn journal_transition(&self, provider: &str, transition: Option<Transition>) {
        if let Some(t) = transition {
            self.journal.append(JournalEvent::CircuitEvent {
                provider: provider.to_string(),
                from: t.from.as_str().to_string(),
                to: t.to.as_str().to_string(),
            });
        }
    }
}
