//! Dead-letter decorator: classifies terminal failures and persists them.
//!
//! With `propagate_exception` disabled the failure is absorbed and the
//! caller receives `Ok(OperationResponse::DeadLettered { .. })` even though
//! the work failed permanently. Cancellation is never dead-lettered.

use std::sync::Arc;
use std::task::{Context, Poll};

use rampart_core::{
    render_error_chain, DeadLetterReason, ExecutionContext, OperationError, OperationResponse,
};
use tower::{Layer, Service};

use super::{Execution, ResponseFuture};
use crate::config::DeadLetterConfig;
use crate::dead_letter::{DeadLetterError, DeadLetterRecord, DeadLetterStore};

// ---------------------------------------------------------------------------
// DeadLetterLayer
// ---------------------------------------------------------------------------

/// Tower layer installing [`DeadLetterService`].
#[derive(Clone)]
pub struct DeadLetterLayer {
    store: Arc<dyn DeadLetterStore>,
    config: Arc<DeadLetterConfig>,
}

impl DeadLetterLayer {
    #[must_use]
    pub fn new(store: Arc<dyn DeadLetterStore>, config: DeadLetterConfig) -> Self {
        Self {
            store,
            config: Arc::new(config),
        }
    }
}

impl std::fmt::Debug for DeadLetterLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadLetterLayer")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<S> Layer<S> for DeadLetterLayer {
    type Service = DeadLetterService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        DeadLetterService {
            inner,
            store: Arc::clone(&self.store),
            config: Arc::clone(&self.config),
        }
    }
}

// ---------------------------------------------------------------------------
// Record construction
// ---------------------------------------------------------------------------

/// Truncate to at most `max` bytes on a char boundary.
fn truncate_on_char_boundary(mut text: String, max: usize) -> String {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text.truncate(end);
    text
}

/// MessagePack-encode the operation payload, dropping it when too large.
fn encode_payload(exec: &ExecutionContext, max_bytes: usize) -> Option<Vec<u8>> {
    let payload = exec.operation().payload()?;
    match rmp_serde::to_vec_named(&payload) {
        Ok(bytes) if bytes.len() <= max_bytes => Some(bytes),
        Ok(bytes) => {
            tracing::debug!(
                operation = exec.operation_name(),
                size = bytes.len(),
                max_bytes,
                "payload too large, not captured"
            );
            None
        }
        Err(err) => {
            tracing::debug!(operation = exec.operation_name(), error = %err, "payload encoding failed");
            None
        }
    }
}

fn build_record(
    exec: &ExecutionContext,
    reason: DeadLetterReason,
    error: Option<&OperationError>,
    config: &DeadLetterConfig,
) -> DeadLetterRecord {
    let mut record = DeadLetterRecord::new(exec.operation_name(), reason, exec.correlation_id())
        .with_retry_attempts(exec.attempts());
    if config.capture_message {
        record.message = encode_payload(exec, config.max_message_bytes);
    }
    if config.capture_exception {
        record.exception = error.map(|err| {
            truncate_on_char_boundary(render_error_chain(err), config.max_exception_len)
        });
    }
    record
}

// ---------------------------------------------------------------------------
// DeadLetterService
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct DeadLetterService<S> {
    inner: S,
    store: Arc<dyn DeadLetterStore>,
    config: Arc<DeadLetterConfig>,
}

/// Terminal outcome that gets dead-lettered.
enum Failure {
    Faulty(OperationResponse),
    Error(OperationError),
}

impl<S> Service<Execution> for DeadLetterService<S>
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
        let store = Arc::clone(&self.store);
        let config = Arc::clone(&self.config);

        Box::pin(async move {
            let (reason, failure) = match fut.await {
                Ok(resp) if !exec.is_faulty() => return Ok(resp),
                Ok(resp) => (DeadLetterReason::Unknown, Failure::Faulty(resp)),
                Err(err) => match err.dead_letter_reason() {
                    None => return Err(err),
                    Some(DeadLetterReason::NonRetryableException)
                        if !config.capture_non_retryable =>
                    {
                        return Err(err);
                    }
                    Some(reason) => (reason, Failure::Error(err)),
                },
            };

            let error = match &failure {
                Failure::Error(err) => Some(err),
                Failure::Faulty(_) => None,
            };
            let record = build_record(&exec, reason, error, &config);
            let record_id = record.id;

            if let Err(storage) = store.store(record, exec.cancellation()).await {
                let original = match failure {
                    Failure::Error(err) => Some(Box::new(err)),
                    Failure::Faulty(_) => None,
                };
                if matches!(storage, DeadLetterError::Cancelled) {
                    return Err(OperationError::Cancelled { last: original });
                }
                tracing::error!(
                    operation = exec.operation_name(),
                    correlation_id = exec.correlation_id(),
                    reason = %reason,
                    error = %storage,
                    "failed to store dead letter"
                );
                return Err(OperationError::DeadLetterFailed {
                    original,
                    storage: Box::new(storage),
                });
            }

            tracing::warn!(
                operation = exec.operation_name(),
                correlation_id = exec.correlation_id(),
                record_id = %record_id,
                reason = %reason,
                "operation dead-lettered"
            );
            metrics::counter!("rampart_dead_letters_total", "reason" => reason.as_str()).increment(1);

            if config.propagate_exception {
                match failure {
                    Failure::Error(err) => Err(err),
                    Failure::Faulty(resp) => Ok(resp),
                }
            } else {
                Ok(OperationResponse::DeadLettered { record_id, reason })
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
