//! Innermost service of every chain: invokes the operation itself.

use std::sync::Arc;
use std::task::{Context, Poll};

use rampart_core::{OperationError, OperationResponse};
use tower::Service;

use crate::middleware::{Execution, ResponseFuture};

// ---------------------------------------------------------------------------
// OperationInvoker
// ---------------------------------------------------------------------------

/// Runs the operation referenced by the execution context once per call.
///
/// Each invocation starts with a cleared fault flag and bumps the context's
/// attempt counter. Cancellation is checked before the call and raced
/// against it.
#[derive(Debug, Clone, Copy, Default)]
pub struct OperationInvoker;

impl OperationInvoker {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Service<Execution> for OperationInvoker {
    type Response = OperationResponse;
    type Error = OperationError;
    type Future = ResponseFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, exec: Execution) -> Self::Future {
        Box::pin(async move {
            if exec.is_cancelled() {
                return Err(OperationError::cancelled());
            }
            exec.clear_fault();
            let attempt = exec.begin_attempt();
            tracing::debug!(
                operation = exec.operation_name(),
                correlation_id = exec.correlation_id(),
                attempt,
                "invoking operation"
            );

            let operation = Arc::clone(exec.operation());
            tokio::select! {
                biased;
                () = exec.cancellation().cancelled() => Err(OperationError::cancelled()),
                result = operation.execute(&exec) => result,
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rampart_core::{ExecutionContext, FnOperation, ResilienceProfile};
    use tower::ServiceExt;

    use super::*;
    use crate::middleware::test_support;

    #[tokio::test]
    async fn invokes_operation_and_counts_attempts() {
        let (exec, calls) = test_support::flaky("orders.create", 1, ResilienceProfile::new());

        let err = OperationInvoker.oneshot(Arc::clone(&exec)).await.unwrap_err();
        assert!(matches!(err, OperationError::Transient(_)));
        let resp = OperationInvoker.oneshot(Arc::clone(&exec)).await.unwrap();
        assert_eq!(resp, OperationResponse::Empty);

        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 2);
        assert_eq!(exec.attempts(), 2);
    }

    #[tokio::test]
    async fn clears_stale_fault_before_invocation() {
        let (exec, _calls) = test_support::flaky("orders.create", 0, ResilienceProfile::new());
        exec.mark_faulty();
        OperationInvoker.oneshot(Arc::clone(&exec)).await.unwrap();
        assert!(!exec.is_faulty());
    }

    #[tokio::test]
    async fn cancelled_context_is_not_invoked() {
        let (exec, calls) = test_support::flaky("orders.create", 0, ResilienceProfile::new());
        exec.cancellation().cancel();
        let err = OperationInvoker.oneshot(Arc::clone(&exec)).await.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 0);
        assert_eq!(exec.attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_running_operation() {
        let op = FnOperation::new("reports.render", |_ctx| {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(OperationResponse::Empty)
            })
        });
        let exec = Arc::new(ExecutionContext::new(Arc::new(op)));
        let token = exec.cancellation().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            token.cancel();
        });

        let err = OperationInvoker.oneshot(exec).await.unwrap_err();
        assert!(err.is_cancelled());
    }
}
