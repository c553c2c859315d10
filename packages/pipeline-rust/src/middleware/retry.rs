//! Retry decorator: re-invokes the inner service on retryable errors with
//! exponential backoff and jitter.
//!
//! Completions that only marked the context faulty are returned as-is; only
//! raised errors are retried. Cancellation during a backoff delay ends the
//! whole execution with `OperationError::Cancelled`.

use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use rampart_core::{OperationError, OperationResponse, RetryPolicy};
use rand::Rng;
use tower::{Layer, Service, ServiceExt};

use super::{duration_ms, Execution, ResponseFuture};
use crate::config::RetryDefaults;

// ---------------------------------------------------------------------------
// Backoff
// ---------------------------------------------------------------------------

/// Delay before retry number `attempt` (1-based, the attempt that just
/// failed): `min(max_delay, initial × multiplier^(attempt-1))`.
#[must_use]
pub fn backoff_delay(
    attempt: u32,
    initial: Duration,
    multiplier: f64,
    max_delay: Option<Duration>,
) -> Duration {
    let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
    let secs = initial.as_secs_f64() * multiplier.powi(exponent);
    let delay = Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX);
    match max_delay {
        Some(cap) => delay.min(cap),
        None => delay,
    }
}

/// Perturb `delay` uniformly by up to `± factor × delay`.
fn apply_jitter(delay: Duration, factor: f64) -> Duration {
    if factor <= 0.0 || delay.is_zero() {
        return delay;
    }
    let base = delay.as_secs_f64();
    let spread = base * factor.min(1.0);
    let offset = rand::rng().random_range(-spread..=spread);
    Duration::try_from_secs_f64((base + offset).max(0.0)).unwrap_or(delay)
}

/// Retry parameters after merging the profile's policy over the defaults.
#[derive(Debug, Clone, Copy, PartialEq)]
struct RetrySettings {
    max_attempts: u32,
    initial_delay: Duration,
    multiplier: f64,
    max_delay: Option<Duration>,
    jitter_factor: f64,
}

impl RetrySettings {
    fn resolve(policy: Option<&RetryPolicy>, defaults: &RetryDefaults) -> Self {
        Self {
            // Zero attempts still runs the operation once.
            max_attempts: policy
                .and_then(|p| p.max_attempts)
                .unwrap_or(defaults.max_attempts)
                .max(1),
            initial_delay: policy
                .and_then(|p| p.initial_delay)
                .unwrap_or(Duration::from_millis(defaults.initial_delay_ms)),
            // Profile values bypass config validation: non-finite falls back
            // to the default, then the same ranges apply.
            multiplier: policy
                .and_then(|p| p.backoff_multiplier)
                .filter(|m| m.is_finite())
                .unwrap_or(defaults.backoff_multiplier)
                .max(1.0),
            max_delay: policy
                .and_then(|p| p.max_delay)
                .or(defaults.max_delay_ms.map(Duration::from_millis)),
            jitter_factor: policy
                .and_then(|p| p.jitter_factor)
                .filter(|j| j.is_finite())
                .unwrap_or(defaults.jitter_factor)
                .clamp(0.0, 1.0),
        }
    }
}

// ---------------------------------------------------------------------------
// RetryLayer
// ---------------------------------------------------------------------------

/// Tower layer installing [`RetryService`].
#[derive(Debug, Clone, Default)]
pub struct RetryLayer {
    defaults: Arc<RetryDefaults>,
}

impl RetryLayer {
    #[must_use]
    pub fn new(defaults: RetryDefaults) -> Self {
        Self {
            defaults: Arc::new(defaults),
        }
    }
}

impl<S> Layer<S> for RetryLayer {
    type Service = RetryService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RetryService {
            inner,
            defaults: Arc::clone(&self.defaults),
        }
    }
}

// ---------------------------------------------------------------------------
// RetryService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RetryService<S> {
    inner: S,
    defaults: Arc<RetryDefaults>,
}

impl<S> Service<Execution> for RetryService<S>
where
    S: Service<Execution, Response = OperationResponse, Error = OperationError>
        + Clone
        + Send
        + 'static,
    S::Future: Send + 'static,
{
    type Response = OperationResponse;
    type Error = OperationError;
    type Future = ResponseFuture;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, exec: Execution) -> Self::Future {
        // Take the service that was driven to readiness, leave a clone behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let defaults = Arc::clone(&self.defaults);

        Box::pin(async move {
            let policy = exec.profile().retry.clone();
            let settings = RetrySettings::resolve(policy.as_ref(), &defaults);
            let is_retryable = policy.as_ref().and_then(|p| p.is_retryable.clone());
            let on_retry = policy.as_ref().and_then(|p| p.on_retry.clone());

            let mut attempt = 0u32;
            let mut first_call = true;
            loop {
                attempt += 1;
                let result = if first_call {
                    first_call = false;
                    inner.call(Arc::clone(&exec)).await
                } else {
                    inner.ready().await?.call(Arc::clone(&exec)).await
                };

                let err = match result {
                    Ok(resp) => {
                        if attempt > 1 && !exec.is_faulty() {
                            tracing::debug!(
                                operation = exec.operation_name(),
                                attempts = attempt,
                                "operation succeeded after retry"
                            );
                        }
                        return Ok(resp);
                    }
                    Err(err) if err.is_cancelled() => return Err(err),
                    Err(err) => err,
                };

                let retryable = match &is_retryable {
                    Some(predicate) => predicate(&err),
                    None => err.is_transient(),
                };
                if !retryable {
                    return Err(err);
                }

                if attempt >= settings.max_attempts {
                    tracing::warn!(
                        operation = exec.operation_name(),
                        correlation_id = exec.correlation_id(),
                        attempts = attempt,
                        error = %err,
                        "retries exhausted"
                    );
                    return Err(OperationError::RetryExhausted {
                        attempts: attempt,
                        source: Box::new(err),
                    });
                }

                let delay = apply_jitter(
                    backoff_delay(
                        attempt,
                        settings.initial_delay,
                        settings.multiplier,
                        settings.max_delay,
                    ),
                    settings.jitter_factor,
                );
                if let Some(hook) = &on_retry {
                    hook(attempt, delay, &err);
                }
                tracing::warn!(
                    operation = exec.operation_name(),
                    correlation_id = exec.correlation_id(),
                    attempt,
                    delay_ms = duration_ms(delay),
                    error = %err,
                    "retrying operation"
                );

                tokio::select! {
                    biased;
                    () = exec.cancellation().cancelled() => {
                        return Err(OperationError::Cancelled {
                            last: Some(Box::new(err)),
                        });
                    }
                    () = tokio::time::sleep(delay) => {}
                }
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
