//! Bulkhead decorator for operations.
//!
//! Bounds concurrent executions per key. Callers beyond `max_concurrency`
//! wait in a bounded queue; callers beyond the queue, or queued past the
//! queue timeout, are rejected with `OperationError::BulkheadRejected`
//! without invoking the inner service.

use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use rampart_core::{OperationError, OperationResponse};
use tower::{Layer, Service, ServiceExt};

use super::{duration_ms, Execution, ResponseFuture};
use crate::config::BulkheadDefaults;
use crate::state::{AdmissionError, BulkheadRegistry, BulkheadSettings, QueueHooks};

// ---------------------------------------------------------------------------
// BulkheadLayer
// ---------------------------------------------------------------------------

/// Tower layer that admits operations through per-key semaphores.
#[derive(Debug, Clone)]
pub struct BulkheadLayer {
    registry: Arc<BulkheadRegistry>,
    defaults: Arc<BulkheadDefaults>,
}

impl BulkheadLayer {
    #[must_use]
    pub fn new(registry: Arc<BulkheadRegistry>, defaults: BulkheadDefaults) -> Self {
        Self {
            registry,
            defaults: Arc::new(defaults),
        }
    }
}

impl<S> Layer<S> for BulkheadLayer {
    type Service = BulkheadService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        BulkheadService {
            inner,
            registry: Arc::clone(&self.registry),
            defaults: Arc::clone(&self.defaults),
        }
    }
}

// ---------------------------------------------------------------------------
// BulkheadService
// ---------------------------------------------------------------------------

/// Service wrapper holding an execution slot for the duration of each call.
#[derive(Debug, Clone)]
pub struct BulkheadService<S> {
    inner: S,
    registry: Arc<BulkheadRegistry>,
    defaults: Arc<BulkheadDefaults>,
}

impl<S> Service<Execution> for BulkheadService<S>
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
        let clone = self.inner.clone();
        let inner = std::mem::replace(&mut self.inner, clone);

        let policy = exec.profile().bulkhead.clone();
        let key = policy
            .as_ref()
            .and_then(|p| p.key.clone())
            .unwrap_or_else(|| exec.operation_name().to_string());
        let state = self.registry.get_or_create(&key, || {
            BulkheadSettings::resolve(policy.as_ref(), &self.defaults)
        });
        let queue_timeout = policy
            .as_ref()
            .and_then(|p| p.queue_timeout)
            .or(self.defaults.queue_timeout_ms.map(Duration::from_millis));

        Box::pin(async move {
            let hooks = QueueHooks::from_policy(policy.as_ref());
            let permit = match state.acquire(queue_timeout, exec.cancellation(), hooks).await {
                Ok(permit) => permit,
                Err(AdmissionError::Cancelled) => return Err(OperationError::cancelled()),
                Err(AdmissionError::Rejected(reason)) => {
                    tracing::warn!(
                        key = %key,
                        operation = exec.operation_name(),
                        reason = %reason,
                        "bulkhead rejected execution"
                    );
                    metrics::counter!(
                        "rampart_bulkhead_rejections_total",
                        "key" => key.clone(),
                        "reason" => reason.as_str()
                    )
                    .increment(1);
                    if let Some(hook) = policy.as_ref().and_then(|p| p.on_rejected.as_ref()) {
                        hook(reason);
                    }
                    return Err(OperationError::BulkheadRejected { key, reason });
                }
            };
            if let Some(waited) = permit.waited() {
                tracing::debug!(key = %key, waited_ms = duration_ms(waited), "bulkhead slot acquired");
            }

            // The permit is held until the inner call completes or is dropped.
            let result = inner.oneshot(exec).await;
            drop(permit);
            result
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
