//! Timeout decorator for operations.
//!
//! Fails an attempt that exceeds the profile's timeout (or the pipeline
//! default) with `OperationError::Timeout`. Without either, calls pass
//! through unbounded.

use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use rampart_core::{OperationError, OperationResponse};
use tower::{Layer, Service};

use super::{duration_ms, Execution, ResponseFuture};

// ---------------------------------------------------------------------------
// TimeoutLayer
// ---------------------------------------------------------------------------

/// Tower layer that wraps services with per-attempt timeout enforcement.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimeoutLayer {
    default_timeout: Option<Duration>,
}

impl TimeoutLayer {
    #[must_use]
    pub fn new(default_timeout: Option<Duration>) -> Self {
        Self { default_timeout }
    }
}

impl<S> Layer<S> for TimeoutLayer {
    type Service = TimeoutService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TimeoutService {
            inner,
            default_timeout: self.default_timeout,
        }
    }
}

// ---------------------------------------------------------------------------
// TimeoutService
// ---------------------------------------------------------------------------

/// Service wrapper that enforces per-attempt timeouts.
#[derive(Debug, Clone)]
pub struct TimeoutService<S> {
    inner: S,
    default_timeout: Option<Duration>,
}

impl<S> Service<Execution> for TimeoutService<S>
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
        let timeout = exec.profile().timeout.or(self.default_timeout);
        let operation = exec.operation_name().to_string();
        let fut = self.inner.call(Arc::clone(&exec));

        let Some(duration) = timeout else {
            return Box::pin(fut);
        };
        Box::pin(async move {
            match tokio::time::timeout(duration, fut).await {
                Ok(result) => result,
                Err(_elapsed) => {
                    let timeout_ms = duration_ms(duration);
                    tracing::warn!(operation = %operation, timeout_ms, "operation timed out");
                    Err(OperationError::Timeout { timeout_ms })
                }
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
