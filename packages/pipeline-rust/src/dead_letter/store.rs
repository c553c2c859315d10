//! Storage contract for dead-letter records.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rampart_core::DeadLetterReason;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::record::DeadLetterRecord;

// ---------------------------------------------------------------------------
// DeadLetterError
// ---------------------------------------------------------------------------

/// Failures of a [`DeadLetterStore`].
#[derive(Debug, thiserror::Error)]
pub enum DeadLetterError {
    #[error("dead-letter operation cancelled")]
    Cancelled,
    #[error("dead-letter backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

// ---------------------------------------------------------------------------
// DeadLetterQuery
// ---------------------------------------------------------------------------

/// Filter and page for [`DeadLetterStore::list`] and [`DeadLetterStore::count`].
///
/// The default query matches every unacknowledged record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeadLetterQuery {
    pub operation_name: Option<String>,
    pub reason: Option<DeadLetterReason>,
    pub correlation_id: Option<String>,
    /// Inclusive lower bound on `failed_at`.
    pub failed_after: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `failed_at`.
    pub failed_before: Option<DateTime<Utc>>,
    pub include_acknowledged: bool,
    pub offset: usize,
    /// Maximum records returned by `list`. `None` returns all.
    pub limit: Option<usize>,
}

impl DeadLetterQuery {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn operation(mut self, name: impl Into<String>) -> Self {
        self.operation_name = Some(name.into());
        self
    }

    #[must_use]
    pub fn reason(mut self, reason: DeadLetterReason) -> Self {
        self.reason = Some(reason);
        self
    }

    #[must_use]
    pub fn correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Only records with `failed_at >= at`.
    #[must_use]
    pub fn failed_after(mut self, at: DateTime<Utc>) -> Self {
        self.failed_after = Some(at);
        self
    }

    /// Only records with `failed_at < at`.
    #[must_use]
    pub fn failed_before(mut self, at: DateTime<Utc>) -> Self {
        self.failed_before = Some(at);
        self
    }

    /// Records that failed in `[from, to)`.
    #[must_use]
    pub fn failed_between(self, from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        self.failed_after(from).failed_before(to)
    }

    #[must_use]
    pub fn include_acknowledged(mut self, include: bool) -> Self {
        self.include_acknowledged = include;
        self
    }

    #[must_use]
    pub fn page(mut self, offset: usize, limit: usize) -> Self {
        self.offset = offset;
        self.limit = Some(limit);
        self
    }

    /// Whether `record` passes the filters (paging is not applied).
    #[must_use]
    pub fn matches(&self, record: &DeadLetterRecord) -> bool {
        if record.acknowledged && !self.include_acknowledged {
            return false;
        }
        if let Some(name) = &self.operation_name {
            if &record.operation_name != name {
                return false;
            }
        }
        if let Some(reason) = self.reason {
            if record.reason != reason {
                return false;
            }
        }
        if let Some(correlation_id) = &self.correlation_id {
            if &record.correlation_id != correlation_id {
                return false;
            }
        }
        if self.failed_after.is_some_and(|from| record.failed_at < from) {
            return false;
        }
        if self.failed_before.is_some_and(|to| record.failed_at >= to) {
            return false;
        }
        true
    }
}

// ---------------------------------------------------------------------------
// DeadLetterStore
// ---------------------------------------------------------------------------

/// Persistence for dead-letter records. Every method observes `cancel` and
/// returns `DeadLetterError::Cancelled` once it has fired.
#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    async fn store(
        &self,
        record: DeadLetterRecord,
        cancel: &CancellationToken,
    ) -> Result<(), DeadLetterError>;

    async fn get(
        &self,
        id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<Option<DeadLetterRecord>, DeadLetterError>;

    /// Matching records, newest first.
    async fn list(
        &self,
        query: &DeadLetterQuery,
        cancel: &CancellationToken,
    ) -> Result<Vec<DeadLetterRecord>, DeadLetterError>;

    /// Number of matching records, ignoring paging.
    async fn count(
        &self,
        query: &DeadLetterQuery,
        cancel: &CancellationToken,
    ) -> Result<usize, DeadLetterError>;

    /// Returns `false` when no record has `id`.
    async fn acknowledge(
        &self,
        id: Uuid,
        by: &str,
        cancel: &CancellationToken,
    ) -> Result<bool, DeadLetterError>;

    /// Returns `false` when no record has `id`.
    async fn mark_reprocessed(
        &self,
        id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<bool, DeadLetterError>;

    /// Returns `false` when no record has `id`.
    async fn delete(&self, id: Uuid, cancel: &CancellationToken) -> Result<bool, DeadLetterError>;

    /// Delete acknowledged records acknowledged at least `age` ago. Returns
    /// the number removed.
    async fn purge_acknowledged_older_than(
        &self,
        age: Duration,
        cancel: &CancellationToken,
    ) -> Result<usize, DeadLetterError>;

    /// Unacknowledged records reprocessed fewer than `max_reprocess` times,
    /// oldest first, at most `limit`.
    async fn reprocess_candidates(
        &self,
        max_reprocess: u32,
        limit: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<DeadLetterRecord>, DeadLetterError>;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
