//! Circuit breaker state machine.
//!
//! State machine: Closed -> Open -> `HalfOpen` -> (Closed | Open)
//!
//! Every transition happens under the per-key mutex. Methods return the
//! [`Transition`] they caused so callers fire hooks and log after the lock
//! is released.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use rampart_core::{CircuitBreakerPolicy, CircuitState};
use tokio::time::Instant;

use super::KeyedRegistry;
use crate::config::CircuitBreakerDefaults;

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Resolved thresholds for one circuit key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitSettings {
    pub failure_threshold: u32,
    pub sampling_window: Duration,
    pub open_duration: Duration,
    pub success_threshold: u32,
}

impl CircuitSettings {
    /// Policy fields override the defaults one by one.
    #[must_use]
    pub fn resolve(policy: Option<&CircuitBreakerPolicy>, defaults: &CircuitBreakerDefaults) -> Self {
        let policy = policy.cloned().unwrap_or_default();
        Self {
            failure_threshold: policy
                .failure_threshold
                .unwrap_or(defaults.failure_threshold)
                .max(1),
            sampling_window: policy
                .sampling_window
                .unwrap_or(Duration::from_millis(defaults.sampling_window_ms)),
            open_duration: policy
                .open_duration
                .unwrap_or(Duration::from_millis(defaults.open_duration_ms)),
            success_threshold: policy
                .success_threshold
                .unwrap_or(defaults.success_threshold)
                .max(1),
        }
    }
}

impl Default for CircuitSettings {
    fn default() -> Self {
        Self::resolve(None, &CircuitBreakerDefaults::default())
    }
}

// ---------------------------------------------------------------------------
// Transition / Admission
// ---------------------------------------------------------------------------

/// A state change caused by one call on [`CircuitBreakerState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: CircuitState,
    pub to: CircuitState,
}

/// Outcome of [`CircuitBreakerState::allow_execution`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The call may proceed. Carries the Open -> `HalfOpen` transition when
    /// this admission ended the open period.
    Allowed { transition: Option<Transition> },
    /// The circuit is open; `retry_after` is the remaining open time.
    Rejected { retry_after: Duration },
}

impl Admission {
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }
}

/// Point-in-time view of one circuit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitSnapshot {
    pub key: String,
    pub state: CircuitState,
    /// Failures currently inside the sampling window (Closed only).
    pub failure_count: usize,
    pub half_open_successes: u32,
    pub opened_at: Option<Instant>,
}

// ---------------------------------------------------------------------------
// CircuitBreakerState
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct CircuitInner {
    state: CircuitState,
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    half_open_successes: u32,
}

impl CircuitInner {
    fn transition(&mut self, to: CircuitState, now: Instant) -> Transition {
        let from = self.state;
        self.state = to;
        match to {
            CircuitState::Open => {
                self.opened_at = Some(now);
                self.failures.clear();
            }
            CircuitState::HalfOpen => {
                self.half_open_successes = 0;
            }
            CircuitState::Closed => {
                self.opened_at = None;
                self.failures.clear();
                self.half_open_successes = 0;
            }
        }
        Transition { from, to }
    }

    fn prune(&mut self, window: Duration, now: Instant) {
        while let Some(&oldest) = self.failures.front() {
            if now.saturating_duration_since(oldest) > window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Circuit state for one key.
#[derive(Debug)]
pub struct CircuitBreakerState {
    key: String,
    settings: CircuitSettings,
    inner: Mutex<CircuitInner>,
}

impl CircuitBreakerState {
    #[must_use]
    pub fn new(key: impl Into<String>, settings: CircuitSettings) -> Self {
        Self {
            key: key.into(),
            settings,
            inner: Mutex::new(CircuitInner {
                state: CircuitState::Closed,
                failures: VecDeque::new(),
                opened_at: None,
                half_open_successes: 0,
            }),
        }
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    #[must_use]
    pub fn settings(&self) -> &CircuitSettings {
        &self.settings
    }

    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Decide whether a call may proceed, moving Open -> `HalfOpen` once the
    /// open duration has elapsed.
    pub fn allow_execution(&self) -> Admission {
        self.allow_execution_at(Instant::now())
    }

    /// Count a failed call. Failures are ignored while Open.
    pub fn record_failure(&self) -> Option<Transition> {
        self.record_failure_at(Instant::now())
    }

    /// Count a successful call. Only meaningful while `HalfOpen`.
    pub fn record_success(&self) -> Option<Transition> {
        self.record_success_at(Instant::now())
    }

    /// Force the circuit back to Closed.
    pub fn reset(&self) -> Option<Transition> {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::Closed {
            inner.failures.clear();
            return None;
        }
        Some(inner.transition(CircuitState::Closed, Instant::now()))
    }

    #[must_use]
    pub fn snapshot(&self) -> CircuitSnapshot {
        let mut inner = self.inner.lock();
        inner.prune(self.settings.sampling_window, Instant::now());
        CircuitSnapshot {
            key: self.key.clone(),
            state: inner.state,
            failure_count: inner.failures.len(),
            half_open_successes: inner.half_open_successes,
            opened_at: inner.opened_at,
        }
    }

    fn allow_execution_at(&self, now: Instant) -> Admission {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => Admission::Allowed { transition: None },
            CircuitState::Open => {
                let opened_at = inner.opened_at.unwrap_or(now);
                let reopen_at = opened_at + self.settings.open_duration;
                if now >= reopen_at {
                    let transition = inner.transition(CircuitState::HalfOpen, now);
                    Admission::Allowed {
                        transition: Some(transition),
                    }
                } else {
                    Admission::Rejected {
                        retry_after: reopen_at - now,
                    }
                }
            }
        }
    }

    fn record_failure_at(&self, now: Instant) -> Option<Transition> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.prune(self.settings.sampling_window, now);
                inner.failures.push_back(now);
                let threshold = self.settings.failure_threshold as usize;
                (inner.failures.len() >= threshold)
                    .then(|| inner.transition(CircuitState::Open, now))
            }
            CircuitState::HalfOpen => Some(inner.transition(CircuitState::Open, now)),
            CircuitState::Open => None,
        }
    }

    fn record_success_at(&self, now: Instant) -> Option<Transition> {
        let mut inner = self.inner.lock();
        if inner.state != CircuitState::HalfOpen {
            return None;
        }
        inner.half_open_successes += 1;
        (inner.half_open_successes >= self.settings.success_threshold)
            .then(|| inner.transition(CircuitState::Closed, now))
    }
}

// ---------------------------------------------------------------------------
// CircuitBreakerRegistry
// ---------------------------------------------------------------------------

/// Process-wide circuit states keyed by circuit key.
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    states: KeyedRegistry<CircuitBreakerState>,
}

impl CircuitBreakerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the state for `key`, creating it with `settings` on first use.
    pub fn get_or_create(
        &self,
        key: &str,
        settings: impl FnOnce() -> CircuitSettings,
    ) -> std::sync::Arc<CircuitBreakerState> {
        self.states
            .get_or_insert_with(key, || CircuitBreakerState::new(key, settings()))
    }

    #[must_use]
    pub fn state(&self, key: &str) -> Option<CircuitState> {
        self.states.get(key).map(|s| s.state())
    }

    #[must_use]
    pub fn snapshot(&self, key: &str) -> Option<CircuitSnapshot> {
        self.states.get(key).map(|s| s.snapshot())
    }

    /// Force the circuit for `key` to Closed. Returns `false` for unknown keys.
    pub fn reset(&self, key: &str) -> bool {
        match self.states.get(key) {
            Some(state) => {
                if let Some(transition) = state.reset() {
                    tracing::info!(
                        key,
                        from = %transition.from,
                        to = %transition.to,
                        "circuit reset"
                    );
                }
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.states.keys()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
