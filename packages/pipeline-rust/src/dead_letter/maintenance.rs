//! Periodic purge of acknowledged dead-letter records.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::store::DeadLetterStore;
use crate::config::DeadLetterConfig;
use crate::worker::{BackgroundRunnable, BackgroundWorker};

/// On-demand maintenance requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaintenanceTask {
    /// Purge with the configured retention.
    PurgeNow,
    /// Purge acknowledged records older than the given age.
    PurgeOlderThan(Duration),
}

/// [`BackgroundRunnable`] purging acknowledged records past their retention
/// on every tick.
pub struct DeadLetterMaintenance {
    store: Arc<dyn DeadLetterStore>,
    retention: Duration,
    cancel: CancellationToken,
}

impl DeadLetterMaintenance {
    #[must_use]
    pub fn new(store: Arc<dyn DeadLetterStore>, retention: Duration) -> Self {
        Self {
            store,
            retention,
            cancel: CancellationToken::new(),
        }
    }

    /// Spawn the maintenance worker with the retention and interval from
    /// `config`.
    #[must_use]
    pub fn spawn(store: Arc<dyn DeadLetterStore>, config: &DeadLetterConfig) -> BackgroundWorker<Self> {
        let runnable = Self::new(store, Duration::from_millis(config.retention_ms));
        BackgroundWorker::start(runnable, Duration::from_millis(config.purge_interval_ms.max(1)))
    }

    async fn purge(&self, age: Duration) {
        match self.store.purge_acknowledged_older_than(age, &self.cancel).await {
            Ok(0) => {}
            Ok(purged) => tracing::info!(purged, "purged acknowledged dead letters"),
            Err(err) => tracing::warn!(error = %err, "dead-letter purge failed"),
        }
    }
}

#[async_trait]
impl BackgroundRunnable for DeadLetterMaintenance {
    type Task = MaintenanceTask;

    async fn run(&mut self, task: MaintenanceTask) {
        let age = match task {
            MaintenanceTask::PurgeNow => self.retention,
            MaintenanceTask::PurgeOlderThan(age) => age,
        };
        self.purge(age).await;
    }

    async fn on_tick(&mut self) {
        self.purge(self.retention).await;
    }

    async fn shutdown(&mut self) {
        self.cancel.cancel();
        tracing::debug!("dead-letter maintenance stopped");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use rampart_core::DeadLetterReason;

    use super::*;
    use crate::dead_letter::{DeadLetterQuery, DeadLetterRecord, InMemoryDeadLetterStore};

    async fn seeded_store() -> Arc<InMemoryDeadLetterStore> {
        let store = Arc::new(InMemoryDeadLetterStore::new(10));
        let cancel = CancellationToken::new();

        let mut stale = DeadLetterRecord::new("a", DeadLetterReason::Timeout, "c-1");
        stale.acknowledge("ops");
        stale.acknowledged_at = Some(Utc::now() - chrono::Duration::days(8));
        let mut recent = DeadLetterRecord::new("b", DeadLetterReason::Timeout, "c-2");
        recent.acknowledge("ops");
        let pending = DeadLetterRecord::new("c", DeadLetterReason::Timeout, "c-3");

        for record in [stale, recent, pending] {
            store.store(record, &cancel).await.unwrap();
        }
        store
    }

    #[tokio::test]
    async fn purge_now_uses_retention() {
        let store = seeded_store().await;
        let mut worker = DeadLetterMaintenance::spawn(
            Arc::clone(&store) as Arc<dyn DeadLetterStore>,
            &DeadLetterConfig::default(),
        );

        worker.submit(MaintenanceTask::PurgeNow).await.unwrap();
        worker.stop().await;
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn explicit_age_purges_recent_acknowledged() {
        let store = seeded_store().await;
        let mut worker = DeadLetterMaintenance::spawn(
            Arc::clone(&store) as Arc<dyn DeadLetterStore>,
            &DeadLetterConfig::default(),
        );

        worker
            .submit(MaintenanceTask::PurgeOlderThan(Duration::ZERO))
            .await
            .unwrap();
        worker.stop().await;

        let cancel = CancellationToken::new();
        let remaining = store
            .list(&DeadLetterQuery::new().include_acknowledged(true), &cancel)
            .await
            .unwrap();
        assert_eq!(remaining.len(), 1);
        assert!(!remaining[0].acknowledged);
    }

    #[tokio::test(start_paused = true)]
    async fn tick_purges_with_retention() {
        let store = seeded_store().await;
        let config = DeadLetterConfig {
            purge_interval_ms: 1_000,
            ..DeadLetterConfig::default()
        };
        let mut worker =
            DeadLetterMaintenance::spawn(Arc::clone(&store) as Arc<dyn DeadLetterStore>, &config);

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(store.len(), 2);
        worker.stop().await;
    }
}
