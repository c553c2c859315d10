//! Resilience profiles: per-operation tuning for each decorator.
//!
//! A [`ResilienceProfile`] carries one optional policy per capability. A
//! missing policy means "use the pipeline defaults"; inside a policy, every
//! `None` field likewise falls back to the matching default. Hooks are plain
//! closures invoked synchronously at fixed points of each decorator.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::context::ExecutionContext;
use crate::error::{OperationError, RejectionReason};
use crate::types::{BoxFuture, CircuitState, OperationResponse};

// ---------------------------------------------------------------------------
// Hook types
// ---------------------------------------------------------------------------

/// Predicate over an error (retryable? counts as failure? should fall back?).
pub type ErrorPredicate = Arc<dyn Fn(&OperationError) -> bool + Send + Sync>;

/// Called before each retry delay with `(attempt, delay, error)`.
pub type RetryHook = Arc<dyn Fn(u32, Duration, &OperationError) + Send + Sync>;

/// Called after a circuit transition with `(key, from, to)`.
pub type StateChangeHook = Arc<dyn Fn(&str, CircuitState, CircuitState) + Send + Sync>;

/// Called when a caller enters the bulkhead queue, with its 1-based position.
pub type QueuedHook = Arc<dyn Fn(usize) + Send + Sync>;

/// Called when a queued caller obtains an execution slot, with its wait time.
pub type DequeuedHook = Arc<dyn Fn(Duration) + Send + Sync>;

/// Called when the bulkhead rejects a caller.
pub type RejectedHook = Arc<dyn Fn(RejectionReason) + Send + Sync>;

/// Substitute action run by the fallback decorator. Receives the context and
/// the triggering error (`None` when the context was faulty without one).
pub type FallbackAction = Arc<
    dyn for<'a> Fn(
            &'a ExecutionContext,
            Option<&'a OperationError>,
        ) -> BoxFuture<'a, Result<OperationResponse, OperationError>>
        + Send
        + Sync,
>;

pub type FallbackStartingHook = Arc<dyn Fn(Option<&OperationError>) + Send + Sync>;
pub type FallbackCompletedHook = Arc<dyn Fn() + Send + Sync>;
pub type FallbackFailedHook = Arc<dyn Fn(&OperationError) + Send + Sync>;

fn hook_label<T>(hook: Option<&T>) -> &'static str {
    if hook.is_some() {
        "<set>"
    } else {
        "<unset>"
    }
}

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

/// Retry tuning. `max_attempts` counts every invocation, including the first.
#[derive(Clone, Default)]
pub struct RetryPolicy {
    pub max_attempts: Option<u32>,
    pub initial_delay: Option<Duration>,
    pub backoff_multiplier: Option<f64>,
    pub max_delay: Option<Duration>,
    pub jitter_factor: Option<f64>,
    pub is_retryable: Option<ErrorPredicate>,
    pub on_retry: Option<RetryHook>,
}

impl RetryPolicy {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    #[must_use]
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = Some(delay);
        self
    }

    #[must_use]
    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = Some(multiplier);
        self
    }

    #[must_use]
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = Some(delay);
        self
    }

    #[must_use]
    pub fn jitter_factor(mut self, factor: f64) -> Self {
        self.jitter_factor = Some(factor);
        self
    }

    #[must_use]
    pub fn retry_if<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&OperationError) -> bool + Send + Sync + 'static,
    {
        self.is_retryable = Some(Arc::new(predicate));
        self
    }

    #[must_use]
    pub fn on_retry<F>(mut self, hook: F) -> Self
    where
        F: Fn(u32, Duration, &OperationError) + Send + Sync + 'static,
    {
        self.on_retry = Some(Arc::new(hook));
        self
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("initial_delay", &self.initial_delay)
            .field("backoff_multiplier", &self.backoff_multiplier)
            .field("max_delay", &self.max_delay)
            .field("jitter_factor", &self.jitter_factor)
            .field("is_retryable", &hook_label(self.is_retryable.as_ref()))
            .field("on_retry", &hook_label(self.on_retry.as_ref()))
            .finish()
    }
}

// ---------------------------------------------------------------------------
// CircuitBreakerPolicy
// ---------------------------------------------------------------------------

/// Circuit breaker tuning. Operations sharing a `key` share one state machine;
/// without a key the operation name is used.
#[derive(Clone, Default)]
pub struct CircuitBreakerPolicy {
    pub key: Option<String>,
    pub failure_threshold: Option<u32>,
    pub sampling_window: Option<Duration>,
    pub open_duration: Option<Duration>,
    pub success_threshold: Option<u32>,
    pub is_failure: Option<ErrorPredicate>,
    pub on_state_change: Option<StateChangeHook>,
}

impl CircuitBreakerPolicy {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    #[must_use]
    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = Some(threshold);
        self
    }

    #[must_use]
    pub fn sampling_window(mut self, window: Duration) -> Self {
        self.sampling_window = Some(window);
        self
    }

    #[must_use]
    pub fn open_duration(mut self, duration: Duration) -> Self {
        self.open_duration = Some(duration);
        self
    }

    #[must_use]
    pub fn success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = Some(threshold);
        self
    }

    #[must_use]
    pub fn failure_if<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&OperationError) -> bool + Send + Sync + 'static,
    {
        self.is_failure = Some(Arc::new(predicate));
        self
    }

    #[must_use]
    pub fn on_state_change<F>(mut self, hook: F) -> Self
    where
        F: Fn(&str, CircuitState, CircuitState) + Send + Sync + 'static,
    {
        self.on_state_change = Some(Arc::new(hook));
        self
    }
}

impl fmt::Debug for CircuitBreakerPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreakerPolicy")
            .field("key", &self.key)
            .field("failure_threshold", &self.failure_threshold)
            .field("sampling_window", &self.sampling_window)
            .field("open_duration", &self.open_duration)
            .field("success_threshold", &self.success_threshold)
            .field("is_failure", &hook_label(self.is_failure.as_ref()))
            .field("on_state_change", &hook_label(self.on_state_change.as_ref()))
            .finish()
    }
}

// ---------------------------------------------------------------------------
// BulkheadPolicy
// ---------------------------------------------------------------------------

/// Bulkhead tuning. Operations sharing a `key` share one pair of semaphores.
#[derive(Clone, Default)]
pub struct BulkheadPolicy {
    pub key: Option<String>,
    pub max_concurrency: Option<usize>,
    pub queue_limit: Option<usize>,
    pub queue_timeout: Option<Duration>,
    pub on_queued: Option<QueuedHook>,
    pub on_dequeued: Option<DequeuedHook>,
    pub on_rejected: Option<RejectedHook>,
}

impl BulkheadPolicy {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    #[must_use]
    pub fn max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = Some(max);
        self
    }

    #[must_use]
    pub fn queue_limit(mut self, limit: usize) -> Self {
        self.queue_limit = Some(limit);
        self
    }

    #[must_use]
    pub fn queue_timeout(mut self, timeout: Duration) -> Self {
        self.queue_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn on_queued<F>(mut self, hook: F) -> Self
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        self.on_queued = Some(Arc::new(hook));
        self
    }

    #[must_use]
    pub fn on_dequeued<F>(mut self, hook: F) -> Self
    where
        F: Fn(Duration) + Send + Sync + 'static,
    {
        self.on_dequeued = Some(Arc::new(hook));
        self
    }

    #[must_use]
    pub fn on_rejected<F>(mut self, hook: F) -> Self
    where
        F: Fn(RejectionReason) + Send + Sync + 'static,
    {
        self.on_rejected = Some(Arc::new(hook));
        self
    }
}

impl fmt::Debug for BulkheadPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BulkheadPolicy")
            .field("key", &self.key)
            .field("max_concurrency", &self.max_concurrency)
            .field("queue_limit", &self.queue_limit)
            .field("queue_timeout", &self.queue_timeout)
            .field("on_queued", &hook_label(self.on_queued.as_ref()))
            .field("on_dequeued", &hook_label(self.on_dequeued.as_ref()))
            .field("on_rejected", &hook_label(self.on_rejected.as_ref()))
            .finish()
    }
}

// ---------------------------------------------------------------------------
// FallbackPolicy
// ---------------------------------------------------------------------------

/// Fallback tuning. Without an `action` the decorator never substitutes.
#[derive(Clone, Default)]
pub struct FallbackPolicy {
    pub fallback_on_faulty: Option<bool>,
    pub should_fallback: Option<ErrorPredicate>,
    pub action: Option<FallbackAction>,
    pub on_fallback_starting: Option<FallbackStartingHook>,
    pub on_fallback_completed: Option<FallbackCompletedHook>,
    pub on_fallback_failed: Option<FallbackFailedHook>,
}

impl FallbackPolicy {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the substitute action.
    ///
    /// ```ignore
    /// FallbackPolicy::new().action(|_ctx, _err| {
    ///     Box::pin(async { Ok(OperationResponse::Value(json!("cached"))) })
    /// });
    /// ```
    #[must_use]
    pub fn action<F>(mut self, action: F) -> Self
    where
        F: for<'a> Fn(
                &'a ExecutionContext,
                Option<&'a OperationError>,
            ) -> BoxFuture<'a, Result<OperationResponse, OperationError>>
            + Send
            + Sync
            + 'static,
    {
        self.action = Some(Arc::new(action));
        self
    }

    #[must_use]
    pub fn fallback_on_faulty(mut self, enabled: bool) -> Self {
        self.fallback_on_faulty = Some(enabled);
        self
    }

    #[must_use]
    pub fn fallback_if<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&OperationError) -> bool + Send + Sync + 'static,
    {
        self.should_fallback = Some(Arc::new(predicate));
        self
    }

    #[must_use]
    pub fn on_fallback_starting<F>(mut self, hook: F) -> Self
    where
        F: Fn(Option<&OperationError>) + Send + Sync + 'static,
    {
        self.on_fallback_starting = Some(Arc::new(hook));
        self
    }

    #[must_use]
    pub fn on_fallback_completed<F>(mut self, hook: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_fallback_completed = Some(Arc::new(hook));
        self
    }

    #[must_use]
    pub fn on_fallback_failed<F>(mut self, hook: F) -> Self
    where
        F: Fn(&OperationError) + Send + Sync + 'static,
    {
        self.on_fallback_failed = Some(Arc::new(hook));
        self
    }
}

impl fmt::Debug for FallbackPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FallbackPolicy")
            .field("fallback_on_faulty", &self.fallback_on_faulty)
            .field("should_fallback", &hook_label(self.should_fallback.as_ref()))
            .field("action", &hook_label(self.action.as_ref()))
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// ResilienceProfile
// ---------------------------------------------------------------------------

/// Per-operation resilience capabilities. Every field is optional.
#[derive(Debug, Clone, Default)]
pub struct ResilienceProfile {
    pub retry: Option<RetryPolicy>,
    pub circuit_breaker: Option<CircuitBreakerPolicy>,
    pub bulkhead: Option<BulkheadPolicy>,
    pub fallback: Option<FallbackPolicy>,
    /// Per-attempt timeout override for the timeout decorator.
    pub timeout: Option<Duration>,
}

impl ResilienceProfile {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    #[must_use]
    pub fn with_circuit_breaker(mut self, policy: CircuitBreakerPolicy) -> Self {
        self.circuit_breaker = Some(policy);
        self
    }

    #[must_use]
    pub fn with_bulkhead(mut self, policy: BulkheadPolicy) -> Self {
        self.bulkhead = Some(policy);
        self
    }

    #[must_use]
    pub fn with_fallback(mut self, policy: FallbackPolicy) -> Self {
        self.fallback = Some(policy);
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
