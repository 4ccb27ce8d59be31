//! Per-provider circuit breaker.
//!
//! closed → open after 5 consecutive retryable failures; open → half-open
//! after 30s; half-open → closed after 2 consecutive probe successes; any
//! failure in half-open reopens immediately. Client errors (auth, bad
//! request) never touch the breaker — the controller only records
//! retryable-class results.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use pdk_kv::ConcurrentKv;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive retryable failures before the circuit opens.
    pub failure_threshold: u32,
    /// How long the circuit stays open before allowing a probe.
    pub open_duration: Duration,
    /// Consecutive probe successes required to close again.
    pub half_open_successes: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_duration: Duration::from_secs(30),
            half_open_successes: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// A state change, reported back so the controller can journal it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: CircuitState,
    pub to: CircuitState,
}

#[derive(Debug)]
struct Breaker {
    state: CircuitState,
    consecutive_failures: u32,
    half_open_successes: u32,
    last_transition: Instant,
}

impl Breaker {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            half_open_successes: 0,
            last_transition: Instant::now(),
        }
    }

    fn transition(&mut self, to: CircuitState) -> Transition {
        let from = self.state;
        self.state = to;
        self.last_transition = Instant::now();
        Transition { from, to }
    }

    fn allow_request(&mut self, cfg: &BreakerConfig) -> (bool, Option<Transition>) {
        match self.state {
            CircuitState::Closed => (true, None),
            CircuitState::Open => {
                if self.last_transition.elapsed() >= cfg.open_duration {
                    self.half_open_successes = 0;
                    let t = self.transition(CircuitState::HalfOpen);
                    (true, Some(t))
                } else {
                    (false, None)
                }
            }
            // One probe at a time; concurrent requests wait out the probe.
            CircuitState::HalfOpen => (false, None),
        }
    }

    fn record_success(&mut self, cfg: &BreakerConfig) -> Option<Transition> {
        self.consecutive_failures = 0;
        match self.state {
            CircuitState::Closed => None,
            CircuitState::HalfOpen => {
                self.half_open_successes += 1;
                if self.half_open_successes >= cfg.half_open_successes {
                    Some(self.transition(CircuitState::Closed))
                } else {
                    None
                }
            }
            // A success while open (a probe that raced the timer) closes.
            CircuitState::Open => Some(self.transition(CircuitState::Closed)),
        }
    }

    fn record_failure(&mut self, cfg: &BreakerConfig) -> Option<Transition> {
        self.consecutive_failures += 1;
        match self.state {
            CircuitState::Closed => {
                if self.consecutive_failures >= cfg.failure_threshold {
                    Some(self.transition(CircuitState::Open))
                } else {
                    None
                }
            }
            CircuitState::HalfOpen => Some(self.transition(CircuitState::Open)),
            CircuitState::Open => None,
        }
    }
}

/// Process-wide breaker table keyed by provider id. State transitions for a
/// provider are serialised with result recording under the per-provider
/// mutex.
#[derive(Default)]
pub struct CircuitTable {
    breakers: ConcurrentKv<Arc<Mutex<Breaker>>>,
    cfg: BreakerConfig,
}

impl CircuitTable {
    pub fn new() -> Self {
        Self::with_config(BreakerConfig::default())
    }

    pub fn with_config(cfg: BreakerConfig) -> Self {
        Self {
            breakers: ConcurrentKv::new(),
            cfg,
        }
    }

    fn breaker(&self, provider_id: &str) -> Arc<Mutex<Breaker>> {
        let (breaker, _) = self
            .breakers
            .set_if_absent(provider_id, Arc::new(Mutex::new(Breaker::new())));
        breaker
    }

    /// Gate one attempt. `false` means short-circuit without touching the
    /// transport.
    pub fn allow_request(&self, provider_id: &str) -> (bool, Option<Transition>) {
        let breaker = self.breaker(provider_id);
        let mut b = breaker.lock().expect("breaker lock poisoned");
        b.allow_request(&self.cfg)
    }

    pub fn record_success(&self, provider_id: &str) -> Option<Transition> {
        let breaker = self.breaker(provider_id);
        let mut b = breaker.lock().expect("breaker lock poisoned");
        b.record_success(&self.cfg)
    }

    pub fn record_failure(&self, provider_id: &str) -> Option<Transition> {
        let breaker = self.breaker(provider_id);
        let mut b = breaker.lock().expect("breaker lock poisoned");
        let transition = b.record_failure(&self.cfg);
        if let Some(t) = transition {
            if t.to == CircuitState::Open {
                warn!(
                    provider = provider_id,
                    failures = b.consecutive_failures,
                    "circuit breaker opened"
                );
            }
        }
        transition
    }

    /// Current state, for diagnostics and tests.
    pub fn state_of(&self, provider_id: &str) -> CircuitState {
        let breaker = self.breaker(provider_id);
        let state = breaker.lock().expect("breaker lock poisoned").state;
        state
    }

    /// Swap in fresh breakers between tests.
    #[cfg(any(test, feature = "testkit"))]
    pub fn reset_for_test(&self) {
        for key in self.breakers.keys() {
            self.breakers.delete(&key);
        }
    }
}
