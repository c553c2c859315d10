//! Dead-letter record: one terminally failed execution.

use chrono::{DateTime, Utc};
use rampart_core::DeadLetterReason;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Durable record of an operation that failed after every configured
/// resilience strategy was exhausted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub id: Uuid,
    pub operation_name: String,
    pub reason: DeadLetterReason,
    /// MessagePack-encoded operation payload.
    #[serde(default, with = "serde_bytes")]
    pub message: Option<Vec<u8>>,
    /// Rendered error chain, length-bounded.
    pub exception: Option<String>,
    pub retry_attempts: u32,
    pub correlation_id: String,
    pub failed_at: DateTime<Utc>,
    pub acknowledged: bool,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub acknowledged_by: Option<String>,
    pub reprocess_count: u32,
    pub last_reprocessed_at: Option<DateTime<Utc>>,
}

impl DeadLetterRecord {
    /// Creates an unacknowledged record failed now.
    #[must_use]
    pub fn new(
        operation_name: impl Into<String>,
        reason: DeadLetterReason,
        correlation_id: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            operation_name: operation_name.into(),
            reason,
            message: None,
            exception: None,
            retry_attempts: 0,
            correlation_id: correlation_id.into(),
            failed_at: Utc::now(),
            acknowledged: false,
            acknowledged_at: None,
            acknowledged_by: None,
            reprocess_count: 0,
            last_reprocessed_at: None,
        }
    }

    #[must_use]
    pub fn with_message(mut self, message: Vec<u8>) -> Self {
        self.message = Some(message);
        self
    }

    #[must_use]
    pub fn with_exception(mut self, exception: impl Into<String>) -> Self {
        self.exception = Some(exception.into());
        self
    }

    #[must_use]
    pub fn with_retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = attempts;
        self
    }

    /// Decode the captured payload.
    ///
    /// Returns `Ok(None)` when no payload was captured.
    ///
    /// # Errors
    ///
    /// Returns the MessagePack decode error when the payload does not match `T`.
    pub fn decode_message<T: DeserializeOwned>(&self) -> Result<Option<T>, rmp_serde::decode::Error> {
        self.message
            .as_deref()
            .map(rmp_serde::from_slice)
            .transpose()
    }

    /// Mark as handled by `by`.
    pub fn acknowledge(&mut self, by: impl Into<String>) {
        self.acknowledged = true;
        self.acknowledged_at = Some(Utc::now());
        self.acknowledged_by = Some(by.into());
    }

    /// Count one more reprocessing attempt.
    pub fn mark_reprocessed(&mut self) {
        self.reprocess_count += 1;
        self.last_reprocessed_at = Some(Utc::now());
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
