use std::fmt;
use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Boxed, sendable future used at every async seam that has to be object-safe
/// (operation closures, fallback actions).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Successful result of an operation, or of the pipeline on its behalf.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OperationResponse {
    /// Completed without a result value.
    Empty,
    /// Completed with a JSON result value.
    Value(serde_json::Value),
    /// The operation failed terminally and was captured as a dead letter.
    /// Returned instead of the error when exception propagation is disabled.
    DeadLettered {
        record_id: Uuid,
        reason: DeadLetterReason,
    },
}

impl OperationResponse {
    #[must_use]
    pub fn is_dead_lettered(&self) -> bool {
        matches!(self, Self::DeadLettered { .. })
    }
}

/// Classification of a terminally failed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeadLetterReason {
    MaxRetriesExceeded,
    CircuitBreakerOpen,
    BulkheadRejected,
    FallbackFailed,
    Timeout,
    NonRetryableException,
    /// The operation marked its context faulty without raising an error.
    Unknown,
}

impl DeadLetterReason {
    /// Stable label used in logs and metrics.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MaxRetriesExceeded => "max_retries_exceeded",
            Self::CircuitBreakerOpen => "circuit_breaker_open",
            Self::BulkheadRejected => "bulkhead_rejected",
            Self::FallbackFailed => "fallback_failed",
            Self::Timeout => "timeout",
            Self::NonRetryableException => "non_retryable_exception",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Circuit breaker state.
///
/// State machine: Closed -> Open -> `HalfOpen` -> (Closed | Open)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CircuitState {
    /// Calls flow through; failures are counted inside the sampling window.
    Closed,
    /// Calls are rejected until the open duration elapses.
    Open,
    /// Calls are admitted as probes; enough successes close the circuit.
    HalfOpen,
}

impl CircuitState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
