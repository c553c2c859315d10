//! Circuit breaker decorator.
//!
//! Rejects calls with `OperationError::CircuitOpen` while the per-key circuit
//! is open and feeds every completed call back into the state machine.
//! Cancellation is never counted as a failure.

use std::sync::Arc;
use std::task::{Context, Poll};

use chrono::Utc;
use rampart_core::{OperationError, OperationResponse, StateChangeHook};
use tower::{Layer, Service};

use super::{duration_ms, Execution, ResponseFuture};
use crate::config::CircuitBreakerDefaults;
use crate::state::{Admission, CircuitBreakerRegistry, CircuitSettings, Transition};

// ---------------------------------------------------------------------------
// CircuitBreakerLayer
// ---------------------------------------------------------------------------

/// Tower layer installing [`CircuitBreakerService`].
#[derive(Debug, Clone)]
pub struct CircuitBreakerLayer {
    registry: Arc<CircuitBreakerRegistry>,
    defaults: Arc<CircuitBreakerDefaults>,
}

impl CircuitBreakerLayer {
    #[must_use]
    pub fn new(registry: Arc<CircuitBreakerRegistry>, defaults: CircuitBreakerDefaults) -> Self {
        Self {
            registry,
            defaults: Arc::new(defaults),
        }
    }
}

impl<S> Layer<S> for CircuitBreakerLayer {
    type Service = CircuitBreakerService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CircuitBreakerService {
            inner,
            registry: Arc::clone(&self.registry),
            defaults: Arc::clone(&self.defaults),
        }
    }
}

// ---------------------------------------------------------------------------
// CircuitBreakerService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CircuitBreakerService<S> {
    inner: S,
    registry: Arc<CircuitBreakerRegistry>,
    defaults: Arc<CircuitBreakerDefaults>,
}

/// Fire the state-change hook, log and count a transition.
fn notify(key: &str, transition: Option<Transition>, hook: Option<&StateChangeHook>) {
    let Some(Transition { from, to }) = transition else {
        return;
    };
    tracing::info!(key, from = %from, to = %to, "circuit state changed");
    metrics::counter!(
        "rampart_circuit_transitions_total",
        "key" => key.to_string(),
        "to" => to.as_str()
    )
    .increment(1);
    if let Some(hook) = hook {
        hook(key, from, to);
    }
}

impl<S> Service<Execution> for CircuitBreakerService<S>
where
    S: Service<Execution, Response = OperationResponse, Error = OperationError> + Send,
    S::Future: Send + 'static,
{
    type Response = OperationResponse;
    type Error = OperationError;
    type Future = ResponseFuture;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, exec: Execution) -> Self::Future {
        let policy = exec.profile().circuit_breaker.clone();
        let key = policy
            .as_ref()
            .and_then(|p| p.key.clone())
            .unwrap_or_else(|| exec.operation_name().to_string());
        let state = self.registry.get_or_create(&key, || {
            CircuitSettings::resolve(policy.as_ref(), &self.defaults)
        });
        let hook = policy.as_ref().and_then(|p| p.on_state_change.clone());
        let is_failure = policy.as_ref().and_then(|p| p.is_failure.clone());

        match state.allow_execution() {
            Admission::Rejected { retry_after } => {
                tracing::warn!(
                    key = %key,
                    operation = exec.operation_name(),
                    retry_after_ms = duration_ms(retry_after),
                    "circuit open, rejecting execution"
                );
                let retry_after = Utc::now()
                    + chrono::Duration::from_std(retry_after).unwrap_or(chrono::Duration::zero());
                return Box::pin(async move {
                    Err(OperationError::CircuitOpen { key, retry_after })
                });
            }
            Admission::Allowed { transition } => notify(&key, transition, hook.as_ref()),
        }

        let fut = self.inner.call(Arc::clone(&exec));
        Box::pin(async move {
            let result = fut.await;
            let transition = match &result {
                Ok(_) if exec.is_faulty() => state.record_failure(),
                Ok(_) => state.record_success(),
                Err(err) if err.is_cancelled() => None,
                Err(err) => {
                    let counts = is_failure.as_ref().map_or(true, |predicate| predicate(err));
                    if counts {
                        state.record_failure()
                    } else {
                        None
                    }
                }
            };
            notify(&key, transition, hook.as_ref());
            result
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use parking_lot::Mutex;
    use rampart_core::{CircuitBreakerPolicy, CircuitState, ResilienceProfile};
    use tower::ServiceExt;

    use super::*;
    use crate::invoker::OperationInvoker;
    use crate::middleware::test_support;

    fn profile(policy: CircuitBreakerPolicy) -> ResilienceProfile {
        ResilienceProfile::new().with_circuit_breaker(
            policy
                .failure_threshold(2)
                .open_duration(Duration::from_secs(5))
                .success_threshold(1),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn opens_and_rejects_without_invoking() {
        let registry = Arc::new(CircuitBreakerRegistry::new());
        let layer = CircuitBreakerLayer::new(Arc::clone(&registry), CircuitBreakerDefaults::default());
        let (exec, calls) =
            test_support::flaky("billing.charge", u32::MAX, profile(CircuitBreakerPolicy::new()));

        for _ in 0..2 {
            let err = layer.layer(OperationInvoker).oneshot(Arc::clone(&exec)).await.unwrap_err();
            assert!(matches!(err, OperationError::Transient(_)));
        }
        assert_eq!(registry.state("billing.charge"), Some(CircuitState::Open));

        let err = layer.layer(OperationInvoker).oneshot(Arc::clone(&exec)).await.unwrap_err();
        match err {
            OperationError::CircuitOpen { key, retry_after } => {
                assert_eq!(key, "billing.charge");
                assert!(retry_after > Utc::now());
            }
            other => panic!("expected CircuitOpen, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn probe_success_closes_and_fires_hooks() {
        let registry = Arc::new(CircuitBreakerRegistry::new());
        let layer = CircuitBreakerLayer::new(Arc::clone(&registry), CircuitBreakerDefaults::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&seen);
        let policy = CircuitBreakerPolicy::new()
            .key("billing")
            .on_state_change(move |key, from, to| recorded.lock().push((key.to_string(), from, to)));
        let (exec, _calls) = test_support::flaky("billing.charge", 2, profile(policy));

        for _ in 0..2 {
            let _ = layer.layer(OperationInvoker).oneshot(Arc::clone(&exec)).await;
        }
        tokio::time::advance(Duration::from_secs(5)).await;
        layer.layer(OperationInvoker).oneshot(Arc::clone(&exec)).await.unwrap();

        assert_eq!(registry.state("billing"), Some(CircuitState::Closed));
        assert_eq!(
            *seen.lock(),
            vec![
                ("billing".to_string(), CircuitState::Closed, CircuitState::Open),
                ("billing".to_string(), CircuitState::Open, CircuitState::HalfOpen),
                ("billing".to_string(), CircuitState::HalfOpen, CircuitState::Closed),
            ]
        );
    }

    #[tokio::test]
    async fn faulty_completion_counts_as_failure() {
        let registry = Arc::new(CircuitBreakerRegistry::new());
        let layer = CircuitBreakerLayer::new(Arc::clone(&registry), CircuitBreakerDefaults::default());
        let exec = test_support::faulty("billing.charge", profile(CircuitBreakerPolicy::new()));

        layer.layer(OperationInvoker).oneshot(Arc::clone(&exec)).await.unwrap();
        assert_eq!(registry.snapshot("billing.charge").unwrap().failure_count, 1);
    }

    #[tokio::test]
    async fn predicate_and_cancellation_exclusions() {
        let registry = Arc::new(CircuitBreakerRegistry::new());
        let layer = CircuitBreakerLayer::new(Arc::clone(&registry), CircuitBreakerDefaults::default());
        let policy = CircuitBreakerPolicy::new()
            .failure_if(|err| !matches!(err, OperationError::InvalidArgument(_)));

        let exec = test_support::failing("billing.charge", profile(policy.clone()), || {
            OperationError::InvalidArgument("bad card".into())
        });
        let _ = layer.layer(OperationInvoker).oneshot(exec).await;

        let exec = test_support::failing("billing.charge", profile(policy), OperationError::cancelled);
        let _ = layer.layer(OperationInvoker).oneshot(exec).await;

        let snapshot = registry.snapshot("billing.charge").unwrap();
        assert_eq!(snapshot.state, CircuitState::Closed);
        assert_eq!(snapshot.failure_count, 0);
    }
}
