//! Per-module circuit breakers
//!
//! # State machine
//!
//! ```text
//!            failure_threshold consecutive failures
//!   Closed ─────────────────────────────────────────► Open
//!     ▲                                                │ ▲
//!     │ success_threshold trial successes  open_timeout │ │ trial failure
//!     │                                                ▼ │
//!     └──────────────────────────────────────────── HalfOpen
//! ```
//!
//! An open breaker rejects every call. Once `open_timeout` has passed, the
//! next call is admitted as the single half-open trial; further calls are
//! rejected until the trial reports its outcome.
//!
//! Breakers are created lazily on the first failure for a module and live
//! for the lifetime of the registry.

use crate::config::BreakerConfig;
use crate::event::{CircuitEvent, EventBus};
use hotswap_core::{Clock, ModuleId};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum CircuitState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        })
    }
}

/// How a call was let through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Breaker closed
    Normal,
    /// The single half-open trial
    Trial,
}

/// A recorded state change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub from: CircuitState,
    pub to: CircuitState,
    pub at: u64,
}

/// Breaker for one module boundary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreaker {
    pub module: ModuleId,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub total_failures: u64,
    pub total_successes: u64,
    pub rejected: u64,
    pub last_failure_at: Option<u64>,
    pub last_success_at: Option<u64>,
    pub state_changed_at: u64,
    pub trial_in_flight: bool,
    pub transitions: Vec<Transition>,
}

impl CircuitBreaker {
    fn new(module: ModuleId, now: u64) -> Self {
        Self {
            module,
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            total_failures: 0,
            total_successes: 0,
            rejected: 0,
            last_failure_at: None,
            last_success_at: None,
            state_changed_at: now,
            trial_in_flight: false,
            transitions: Vec::new(),
        }
    }

    fn set_state(&mut self, to: CircuitState, now: u64) -> Option<Transition> {
        if self.state == to {
            return None;
        }
        let transition = Transition {
            from: self.state,
            to,
            at: now,
        };
        self.state = to;
        self.state_changed_at = now;
        self.transitions.push(transition);
        Some(transition)
    }
}

/// Registry of breakers keyed by module
pub struct BreakerRegistry {
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    events: Arc<EventBus>,
    breakers: RwLock<HashMap<ModuleId, CircuitBreaker>>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig, clock: Arc<dyn Clock>, events: Arc<EventBus>) -> Self {
        Self {
            config,
            clock,
            events,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    fn timeout_us(&self) -> u64 {
        self.config.open_timeout_ms.saturating_mul(1_000)
    }

    /// Effective state of `module`'s breaker
    ///
    /// An open breaker whose timeout has passed reports `HalfOpen`: the
    /// next call will be admitted as a trial.
    pub fn state(&self, module: ModuleId) -> CircuitState {
        let breakers = self.breakers.read();
        let Some(breaker) = breakers.get(&module) else {
            return CircuitState::Closed;
        };
        match breaker.state {
            CircuitState::Open
                if self.clock.elapsed_since(breaker.state_changed_at) >= self.timeout_us() =>
            {
                CircuitState::HalfOpen
            }
            state => state,
        }
    }

    /// Whether a call would be rejected right now
    pub fn is_rejecting(&self, module: ModuleId) -> bool {
        let breakers = self.breakers.read();
        let Some(breaker) = breakers.get(&module) else {
            return false;
        };
        match breaker.state {
            CircuitState::Closed => false,
            CircuitState::Open => {
                self.clock.elapsed_since(breaker.state_changed_at) < self.timeout_us()
            }
            CircuitState::HalfOpen => breaker.trial_in_flight,
        }
    }

    /// Ask to call `module`; `None` means the call is rejected
    pub fn try_acquire(&self, module: ModuleId) -> Option<Admission> {
        if !self.breakers.read().contains_key(&module) {
            return Some(Admission::Normal);
        }

        let now = self.clock.now_micros();
        let mut breakers = self.breakers.write();
        let breaker = breakers.get_mut(&module)?;
        let (admission, transition) = match breaker.state {
            CircuitState::Closed => (Some(Admission::Normal), None),
            CircuitState::Open if now.saturating_sub(breaker.state_changed_at) >= self.timeout_us() => {
                breaker.trial_in_flight = true;
                (
                    Some(Admission::Trial),
                    breaker.set_state(CircuitState::HalfOpen, now),
                )
            }
            CircuitState::HalfOpen if !breaker.trial_in_flight => {
                breaker.trial_in_flight = true;
                (Some(Admission::Trial), None)
            }
            CircuitState::Open | CircuitState::HalfOpen => {
                breaker.rejected += 1;
                (None, None)
            }
        };
        drop(breakers);

        self.publish(module, transition);
        admission
    }

    /// Give back a trial admission that was never used
    pub fn abandon_trial(&self, module: ModuleId) {
        if let Some(breaker) = self.breakers.write().get_mut(&module) {
            breaker.trial_in_flight = false;
        }
    }

    /// Record a successful call
    pub fn record_success(&self, module: ModuleId) {
        let now = self.clock.now_micros();
        let mut breakers = self.breakers.write();
        let Some(breaker) = breakers.get_mut(&module) else {
            return;
        };
        breaker.total_successes += 1;
        breaker.consecutive_failures = 0;
        breaker.consecutive_successes += 1;
        breaker.last_success_at = Some(now);

        let transition = match breaker.state {
            CircuitState::HalfOpen => {
                breaker.trial_in_flight = false;
                if breaker.consecutive_successes >= self.config.success_threshold {
                    breaker.set_state(CircuitState::Closed, now)
                } else {
                    None
                }
            }
            _ => None,
        };
        drop(breakers);
        self.publish(module, transition);
    }

    /// Record a failed call, creating the breaker if needed
    pub fn record_failure(&self, module: ModuleId) {
        let now = self.clock.now_micros();
        let mut breakers = self.breakers.write();
        let breaker = breakers
            .entry(module)
            .or_insert_with(|| CircuitBreaker::new(module, now));
        breaker.total_failures += 1;
        breaker.consecutive_successes = 0;
        breaker.consecutive_failures += 1;
        breaker.last_failure_at = Some(now);

        let transition = match breaker.state {
            CircuitState::Closed
                if breaker.consecutive_failures >= self.config.failure_threshold =>
            {
                breaker.set_state(CircuitState::Open, now)
            }
            CircuitState::HalfOpen => {
                breaker.trial_in_flight = false;
                breaker.set_state(CircuitState::Open, now)
            }
            // Restart the cooldown
            CircuitState::Open => {
                breaker.state_changed_at = now;
                None
            }
            CircuitState::Closed => None,
        };
        drop(breakers);
        self.publish(module, transition);
    }

    /// Open `module`'s breaker regardless of its counters
    pub fn force_open(&self, module: ModuleId) {
        let now = self.clock.now_micros();
        let transition = {
            let mut breakers = self.breakers.write();
            let breaker = breakers
                .entry(module)
                .or_insert_with(|| CircuitBreaker::new(module, now));
            breaker.trial_in_flight = false;
            breaker.set_state(CircuitState::Open, now)
        };
        self.publish(module, transition);
    }

    /// Close `module`'s breaker and clear its counters
    pub fn reset(&self, module: ModuleId) {
        let now = self.clock.now_micros();
        let transition = {
            let mut breakers = self.breakers.write();
            let Some(breaker) = breakers.get_mut(&module) else {
                return;
            };
            breaker.consecutive_failures = 0;
            breaker.consecutive_successes = 0;
            breaker.trial_in_flight = false;
            breaker.set_state(CircuitState::Closed, now)
        };
        self.publish(module, transition);
    }

    /// Copy of `module`'s breaker, if one was created
    pub fn get(&self, module: ModuleId) -> Option<CircuitBreaker> {
        self.breakers.read().get(&module).cloned()
    }

    fn publish(&self, module: ModuleId, transition: Option<Transition>) {
        let Some(t) = transition else {
            return;
        };
        if t.to == CircuitState::Open {
            warn!(%module, from = %t.from, at = t.at, "circuit opened");
        } else {
            info!(%module, from = %t.from, to = %t.to, at = t.at, "circuit state change");
        }
        self.events.circuit(CircuitEvent {
            module,
            from: t.from,
            to: t.to,
        });
    }
}
