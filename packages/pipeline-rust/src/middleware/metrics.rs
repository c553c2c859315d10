//! Metrics middleware for operations.
//!
//! Wraps every chain outermost. Records an `operation` span with duration
//! and outcome, plus `metrics` counters and histograms.

use std::sync::Arc;
use std::task::{Context, Poll};

use rampart_core::{OperationError, OperationResponse};
use tokio::time::Instant;
use tower::{Layer, Service};
use tracing::{info_span, Instrument};

use super::{duration_ms, Execution, ResponseFuture};

// ---------------------------------------------------------------------------
// MetricsLayer
// ---------------------------------------------------------------------------

/// Tower layer that instruments executions with spans, counters and histograms.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsLayer;

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService { inner }
    }
}

// ---------------------------------------------------------------------------
// MetricsService
// ---------------------------------------------------------------------------

/// Service wrapper that records execution duration and outcome.
#[derive(Debug, Clone)]
pub struct MetricsService<S> {
    inner: S,
}

/// Outcome label for a finished execution.
fn outcome(result: &Result<OperationResponse, OperationError>, faulty: bool) -> &'static str {
    match result {
        Ok(OperationResponse::DeadLettered { .. }) => "dead_lettered",
        Ok(_) if faulty => "faulty",
        Ok(_) => "ok",
        Err(err) => err.kind(),
    }
}

impl<S> Service<Execution> for MetricsService<S>
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
        let operation = exec.operation_name().to_string();
        let span = info_span!(
            "operation",
            operation = %operation,
            correlation_id = exec.correlation_id(),
            duration_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        let fut = self.inner.call(Arc::clone(&exec));

        Box::pin(
            async move {
                let start = Instant::now();
                let result = fut.await;
                let elapsed = start.elapsed();
                let outcome = outcome(&result, exec.is_faulty());
                let duration_ms = duration_ms(elapsed);

                tracing::Span::current().record("duration_ms", duration_ms);
                tracing::Span::current().record("outcome", outcome);
                tracing::debug!(
                    operation = %operation,
                    attempts = exec.attempts(),
                    duration_ms,
                    outcome,
                    "execution complete"
                );

                metrics::counter!(
                    "rampart_operations_total",
                    "operation" => operation.clone(),
                    "outcome" => outcome
                )
                .increment(1);
                metrics::histogram!(
                    "rampart_operation_duration_seconds",
                    "operation" => operation
                )
                .record(elapsed.as_secs_f64());

                result
            }
            .instrument(span),
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use rampart_core::{DeadLetterReason, ResilienceProfile};
    use tower::ServiceExt;
    use uuid::Uuid;

    use super::*;
    use crate::invoker::OperationInvoker;
    use crate::middleware::test_support;

    #[tokio::test]
    async fn metrics_layer_passes_through_response() {
        let (exec, _calls) = test_support::flaky("orders.create", 0, ResilienceProfile::new());
        let resp = MetricsLayer.layer(OperationInvoker).oneshot(exec).await.unwrap();
        assert_eq!(resp, OperationResponse::Empty);
    }

    #[test]
    fn outcome_labels() {
        assert_eq!(outcome(&Ok(OperationResponse::Empty), false), "ok");
        assert_eq!(outcome(&Ok(OperationResponse::Empty), true), "faulty");
        assert_eq!(
            outcome(
                &Ok(OperationResponse::DeadLettered {
                    record_id: Uuid::new_v4(),
                    reason: DeadLetterReason::Timeout,
                }),
                true,
            ),
            "dead_lettered"
        );
        assert_eq!(
            outcome(&Err(OperationError::Timeout { timeout_ms: 1 }), false),
            "timeout"
        );
    }
}
