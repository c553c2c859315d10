//! In-memory dead-letter store.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::record::DeadLetterRecord;
use super::store::{DeadLetterError, DeadLetterQuery, DeadLetterStore};

/// Records keyed by insertion sequence, plus an id index.
#[derive(Debug, Default)]
struct Inner {
    next_seq: u64,
    by_seq: BTreeMap<u64, DeadLetterRecord>,
    index: HashMap<Uuid, u64>,
}

impl Inner {
    fn remove(&mut self, id: Uuid) -> Option<DeadLetterRecord> {
        let seq = self.index.remove(&id)?;
        self.by_seq.remove(&seq)
    }

    /// Evict one record: the oldest acknowledged, else the oldest overall.
    fn evict_one(&mut self) -> Option<DeadLetterRecord> {
        let victim = self
            .by_seq
            .iter()
            .filter(|(_, r)| r.acknowledged)
            .min_by_key(|(seq, r)| (r.failed_at, **seq))
            .or_else(|| self.by_seq.iter().min_by_key(|(seq, r)| (r.failed_at, **seq)))
            .map(|(_, r)| r.id)?;
        self.remove(victim)
    }
}

/// Bounded dead-letter store held in process memory.
///
/// Beyond `max_records` the oldest acknowledged record is evicted, falling
/// back to the oldest unacknowledged one.
#[derive(Debug)]
pub struct InMemoryDeadLetterStore {
    max_records: usize,
    inner: Mutex<Inner>,
}

impl InMemoryDeadLetterStore {
    #[must_use]
    pub fn new(max_records: usize) -> Self {
        Self {
            max_records: max_records.max(1),
            inner: Mutex::new(Inner::default()),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().by_seq.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryDeadLetterStore {
    fn default() -> Self {
        Self::new(crate::config::DeadLetterConfig::default().max_records)
    }
}

fn check(cancel: &CancellationToken) -> Result<(), DeadLetterError> {
    if cancel.is_cancelled() {
        Err(DeadLetterError::Cancelled)
    } else {
        Ok(())
    }
}

#[async_trait]
impl DeadLetterStore for InMemoryDeadLetterStore {
    async fn store(
        &self,
        record: DeadLetterRecord,
        cancel: &CancellationToken,
    ) -> Result<(), DeadLetterError> {
        check(cancel)?;
        let mut inner = self.inner.lock();
        // Re-storing an id replaces the previous copy.
        inner.remove(record.id);
        while inner.by_seq.len() >= self.max_records {
            match inner.evict_one() {
                Some(evicted) => tracing::debug!(
                    id = %evicted.id,
                    acknowledged = evicted.acknowledged,
                    "evicted dead-letter record"
                ),
                None => break,
            }
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.index.insert(record.id, seq);
        inner.by_seq.insert(seq, record);
        Ok(())
    }

    async fn get(
        &self,
        id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<Option<DeadLetterRecord>, DeadLetterError> {
        check(cancel)?;
        let inner = self.inner.lock();
        Ok(inner
            .index
            .get(&id)
            .and_then(|seq| inner.by_seq.get(seq))
            .cloned())
    }

    async fn list(
        &self,
        query: &DeadLetterQuery,
        cancel: &CancellationToken,
    ) -> Result<Vec<DeadLetterRecord>, DeadLetterError> {
        check(cancel)?;
        let inner = self.inner.lock();
        let mut matching: Vec<&DeadLetterRecord> =
            inner.by_seq.values().filter(|r| query.matches(r)).collect();
        // Newest first; insertion order breaks ties.
        matching.reverse();
        matching.sort_by(|a, b| b.failed_at.cmp(&a.failed_at));

        let page = matching.into_iter().skip(query.offset);
        let records = match query.limit {
            Some(limit) => page.take(limit).cloned().collect(),
            None => page.cloned().collect(),
        };
        Ok(records)
    }

    async fn count(
        &self,
        query: &DeadLetterQuery,
        cancel: &CancellationToken,
    ) -> Result<usize, DeadLetterError> {
        check(cancel)?;
        let inner = self.inner.lock();
        Ok(inner.by_seq.values().filter(|r| query.matches(r)).count())
    }

    async fn acknowledge(
        &self,
        id: Uuid,
        by: &str,
        cancel: &CancellationToken,
    ) -> Result<bool, DeadLetterError> {
        check(cancel)?;
        let mut inner = self.inner.lock();
        let Some(seq) = inner.index.get(&id).copied() else {
            return Ok(false);
        };
        match inner.by_seq.get_mut(&seq) {
            Some(record) => {
                record.acknowledge(by);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn mark_reprocessed(
        &self,
        id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<bool, DeadLetterError> {
        check(cancel)?;
        let mut inner = self.inner.lock();
        let Some(seq) = inner.index.get(&id).copied() else {
            return Ok(false);
        };
        match inner.by_seq.get_mut(&seq) {
            Some(record) => {
                record.mark_reprocessed();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete(&self, id: Uuid, cancel: &CancellationToken) -> Result<bool, DeadLetterError> {
        check(cancel)?;
        Ok(self.inner.lock().remove(id).is_some())
    }

    async fn purge_acknowledged_older_than(
        &self,
        age: Duration,
        cancel: &CancellationToken,
    ) -> Result<usize, DeadLetterError> {
        check(cancel)?;
        let Ok(age) = chrono::Duration::from_std(age) else {
            return Ok(0);
        };
        let Some(cutoff) = Utc::now().checked_sub_signed(age) else {
            return Ok(0);
        };

        let mut inner = self.inner.lock();
        let expired: Vec<Uuid> = inner
            .by_seq
            .values()
            .filter(|r| r.acknowledged && r.acknowledged_at.unwrap_or(r.failed_at) <= cutoff)
            .map(|r| r.id)
            .collect();
        for id in &expired {
            inner.remove(*id);
        }
        Ok(expired.len())
    }

    async fn reprocess_candidates(
        &self,
        max_reprocess: u32,
        limit: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<DeadLetterRecord>, DeadLetterError> {
        check(cancel)?;
        let inner = self.inner.lock();
        let mut candidates: Vec<&DeadLetterRecord> = inner
            .by_seq
            .values()
            .filter(|r| !r.acknowledged && r.reprocess_count < max_reprocess)
            .collect();
        candidates.sort_by_key(|r| r.failed_at);
        Ok(candidates.into_iter().take(limit).cloned().collect())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
