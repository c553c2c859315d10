//! Tower decorators for the resilience pipeline.
//!
//! Every decorator is a `tower::Service<Execution>` wrapping the next one.
//! The request is the shared [`ExecutionContext`]; decorators read the
//! resolved profile from it and fall back to [`PipelineConfig`] defaults.
//!
//! - [`retry`]: re-invokes the inner service with exponential backoff
//! - [`circuit_breaker`]: fails fast while the per-key circuit is open
//! - [`bulkhead`]: bounds concurrent executions per key with a wait queue
//! - [`fallback`]: substitutes a fallback action on failure
//! - [`dead_letter`]: persists terminal failures to a dead-letter store
//! - [`timeout`]: per-attempt timeout enforcement
//! - [`metrics`]: spans, counters and histograms around the whole chain
//! - [`pipeline`]: composes the decorators in a caller-supplied order
//!
//! [`PipelineConfig`]: crate::config::PipelineConfig

pub mod bulkhead;
pub mod circuit_breaker;
pub mod dead_letter;
pub mod fallback;
pub mod metrics;
pub mod pipeline;
pub mod retry;
pub mod timeout;

use std::sync::Arc;

use rampart_core::{BoxFuture, ExecutionContext, OperationError, OperationResponse};

pub use bulkhead::BulkheadLayer;
pub use circuit_breaker::CircuitBreakerLayer;
pub use dead_letter::DeadLetterLayer;
pub use fallback::FallbackLayer;
pub use metrics::MetricsLayer;
pub use pipeline::{ResiliencePipeline, ResiliencePipelineBuilder};
pub use retry::{backoff_delay, RetryLayer};
pub use timeout::TimeoutLayer;

/// Request type flowing through every decorator.
pub type Execution = Arc<ExecutionContext>;

/// Future returned by every decorator.
pub type ResponseFuture = BoxFuture<'static, Result<OperationResponse, OperationError>>;

/// Saturating conversion used for log fields and error payloads.
pub(crate) fn duration_ms(duration: std::time::Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

// ---------------------------------------------------------------------------
// Test support
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use rampart_core::{
        ExecutionContext, FnOperation, Operation, OperationError, OperationResponse,
        ResilienceProfile,
    };

    use super::Execution;

    /// Context around an operation that fails with `Transient` for the first
    /// `failures` invocations and succeeds afterwards.
    pub(crate) fn flaky(name: &str, failures: u32, profile: ResilienceProfile) -> (Execution, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let op = FnOperation::new(name, move |_ctx| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                if n < failures {
                    Err(OperationError::Transient(format!("attempt {}", n + 1)))
                } else {
                    Ok(OperationResponse::Empty)
                }
            })
        })
        .with_profile(profile);
        let op: Arc<dyn Operation> = Arc::new(op);
        (Arc::new(ExecutionContext::new(op)), calls)
    }

    /// Context around an operation that always fails with `err()`.
    pub(crate) fn failing<F>(name: &str, profile: ResilienceProfile, err: F) -> Execution
    where
        F: Fn() -> OperationError + Send + Sync + 'static,
    {
        let op = FnOperation::new(name, move |_ctx| {
            let e = err();
            Box::pin(async move { Err(e) })
        })
        .with_profile(profile);
        Arc::new(ExecutionContext::new(Arc::new(op)))
    }

    /// Context around an operation that marks itself faulty and returns `Empty`.
    pub(crate) fn faulty(name: &str, profile: ResilienceProfile) -> Execution {
        let op = FnOperation::new(name, |ctx| {
            Box::pin(async move {
                ctx.mark_faulty();
                Ok(OperationResponse::Empty)
            })
        })
        .with_profile(profile);
        Arc::new(ExecutionContext::new(Arc::new(op)))
    }
}
