//! Error taxonomy for operations executed through the resilience pipeline.
//!
//! Operations signal their own failures with the domain variants
//! (`InvalidArgument`, `Transient`, `Internal`, ...). The decorators add the
//! terminal variants (`RetryExhausted`, `CircuitOpen`, `BulkheadRejected`, ...)
//! so downstream consumers never have to inspect error types at runtime.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::DeadLetterReason;

// ---------------------------------------------------------------------------
// RejectionReason
// ---------------------------------------------------------------------------

/// Why a bulkhead refused to admit a caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    /// No execution slot and no queue slot were free.
    AtCapacity,
    /// The caller waited for a slot longer than the queue timeout.
    QueueTimeout,
}

impl RejectionReason {
    /// Stable label used in logs and metrics.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AtCapacity => "at_capacity",
            Self::QueueTimeout => "queue_timeout",
        }
    }
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// OperationError
// ---------------------------------------------------------------------------

/// Errors produced by operations and by the decorators wrapping them.
#[derive(Debug, thiserror::Error)]
pub enum OperationError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("unsupported operation: {0}")]
    Unsupported(String),
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    /// The execution was cancelled. `last` carries the most recent real
    /// failure when cancellation interrupted a retry delay.
    #[error("operation cancelled")]
    Cancelled { last: Option<Box<OperationError>> },
    #[error("retries exhausted after {attempts} attempts")]
    RetryExhausted {
        attempts: u32,
        #[source]
        source: Box<OperationError>,
    },
    #[error("circuit '{key}' is open, retry after {retry_after}")]
    CircuitOpen {
        key: String,
        retry_after: DateTime<Utc>,
    },
    #[error("bulkhead '{key}' rejected execution: {reason}")]
    BulkheadRejected { key: String, reason: RejectionReason },
    #[error("fallback failed: {fallback}")]
    FallbackFailed {
        original: Option<Box<OperationError>>,
        #[source]
        fallback: Box<OperationError>,
    },
    #[error("dead-letter storage failed: {storage}")]
    DeadLetterFailed {
        original: Option<Box<OperationError>>,
        #[source]
        storage: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl OperationError {
    /// A bare cancellation signal with no preceding failure.
    #[must_use]
    pub fn cancelled() -> Self {
        Self::Cancelled { last: None }
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Default retryability: everything except cancellation, caller errors,
    /// and the terminal signals raised by other decorators.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        !matches!(
            self,
            Self::InvalidArgument(_)
                | Self::InvalidState(_)
                | Self::Unsupported(_)
                | Self::Cancelled { .. }
                | Self::RetryExhausted { .. }
                | Self::CircuitOpen { .. }
                | Self::BulkheadRejected { .. }
                | Self::FallbackFailed { .. }
                | Self::DeadLetterFailed { .. }
        )
    }

    /// Dead-letter classification. `None` for cancellation, which is never
    /// dead-lettered.
    #[must_use]
    pub fn dead_letter_reason(&self) -> Option<DeadLetterReason> {
        let reason = match self {
            Self::Cancelled { .. } => return None,
            Self::RetryExhausted { .. } => DeadLetterReason::MaxRetriesExceeded,
            Self::CircuitOpen { .. } => DeadLetterReason::CircuitBreakerOpen,
            Self::BulkheadRejected { .. } => DeadLetterReason::BulkheadRejected,
            Self::FallbackFailed { .. } => DeadLetterReason::FallbackFailed,
            Self::Timeout { .. } => DeadLetterReason::Timeout,
            _ => DeadLetterReason::NonRetryableException,
        };
        Some(reason)
    }

    /// Number of attempts recorded by a retry decorator, looking through
    /// fallback and storage wrappers.
    #[must_use]
    pub fn retry_attempts(&self) -> Option<u32> {
        match self {
            Self::RetryExhausted { attempts, .. } => Some(*attempts),
            Self::FallbackFailed { original, .. } | Self::DeadLetterFailed { original, .. } => {
                original.as_deref().and_then(Self::retry_attempts)
            }
            Self::Cancelled { last } => last.as_deref().and_then(Self::retry_attempts),
            _ => None,
        }
    }

    /// Short label for logs and metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "invalid_argument",
            Self::InvalidState(_) => "invalid_state",
            Self::Unsupported(_) => "unsupported",
            Self::Transient(_) => "transient",
            Self::Timeout { .. } => "timeout",
            Self::Cancelled { .. } => "cancelled",
            Self::RetryExhausted { .. } => "retry_exhausted",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::BulkheadRejected { .. } => "bulkhead_rejected",
            Self::FallbackFailed { .. } => "fallback_failed",
            Self::DeadLetterFailed { .. } => "dead_letter_failed",
            Self::Internal(_) => "internal",
        }
    }
}

/// Render an error and its `source()` chain as `outer: inner: root`.
#[must_use]
pub fn render_error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut rendered = err.to_string();
    let mut current = err.source();
    while let Some(cause) = current {
        rendered.push_str(": ");
        rendered.push_str(&cause.to_string());
        current = cause.source();
    }
    rendered
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
