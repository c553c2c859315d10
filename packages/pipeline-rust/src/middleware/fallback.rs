//! Fallback decorator: runs a substitute action when the inner call fails.
//!
//! Errors fall back when the policy's predicate accepts them (every
//! non-cancellation error by default). Faulty completions without an error
//! fall back only when `fallback_on_faulty` is enabled. A successful fallback
//! clears the context's fault flag.

use std::sync::Arc;
use std::task::{Context, Poll};

use rampart_core::{
    ExecutionContext, FallbackAction, FallbackPolicy, OperationError, OperationResponse,
};
use tower::{Layer, Service};

use super::{Execution, ResponseFuture};
use crate::config::FallbackDefaults;

// ---------------------------------------------------------------------------
// FallbackLayer
// ---------------------------------------------------------------------------

/// Tower layer installing [`FallbackService`].
#[derive(Debug, Clone, Default)]
pub struct FallbackLayer {
    defaults: FallbackDefaults,
}

impl FallbackLayer {
    #[must_use]
    pub fn new(defaults: FallbackDefaults) -> Self {
        Self { defaults }
    }
}

impl<S> Layer<S> for FallbackLayer {
    type Service = FallbackService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        FallbackService {
            inner,
            defaults: self.defaults.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// FallbackService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct FallbackService<S> {
    inner: S,
    defaults: FallbackDefaults,
}

/// Run the fallback action for `original` (`None` for a faulty completion).
async fn run_fallback(
    exec: &ExecutionContext,
    policy: &FallbackPolicy,
    action: &FallbackAction,
    original: Option<OperationError>,
) -> Result<OperationResponse, OperationError> {
    if let Some(hook) = &policy.on_fallback_starting {
        hook(original.as_ref());
    }
    tracing::debug!(
        operation = exec.operation_name(),
        correlation_id = exec.correlation_id(),
        error = original.as_ref().map(tracing::field::display),
        "running fallback"
    );

    let outcome = action(exec, original.as_ref()).await;
    match outcome {
        Ok(resp) => {
            if let Some(hook) = &policy.on_fallback_completed {
                hook();
            }
            exec.clear_fault();
            tracing::info!(operation = exec.operation_name(), "fallback completed");
            Ok(resp)
        }
        Err(err) if err.is_cancelled() => Err(err),
        Err(err) => {
            if let Some(hook) = &policy.on_fallback_failed {
                hook(&err);
            }
            tracing::warn!(
                operation = exec.operation_name(),
                correlation_id = exec.correlation_id(),
                error = %err,
                "fallback failed"
            );
            Err(OperationError::FallbackFailed {
                original: original.map(Box::new),
                fallback: Box::new(err),
            })
        }
    }
}

impl<S> Service<Execution> for FallbackService<S>
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
        let fut = self.inner.call(Arc::clone(&exec));
        let default_on_faulty = self.defaults.fallback_on_faulty;

        Box::pin(async move {
            let result = fut.await;
            let Some(policy) = exec.profile().fallback.clone() else {
                return result;
            };
            let Some(action) = policy.action.clone() else {
                return result;
            };

            match result {
                Ok(resp) if !exec.is_faulty() => Ok(resp),
                Ok(resp) => {
                    let on_faulty = policy.fallback_on_faulty.unwrap_or(default_on_faulty);
                    if on_faulty {
                        run_fallback(&exec, &policy, &action, None).await
                    } else {
                        Ok(resp)
                    }
                }
                Err(err) if err.is_cancelled() => Err(err),
                Err(err) => {
                    let accepted = policy
                        .should_fallback
                        .as_ref()
                        .map_or(true, |predicate| predicate(&err));
                    if accepted {
                        run_fallback(&exec, &policy, &action, Some(err)).await
                    } else {
                        Err(err)
                    }
                }
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
