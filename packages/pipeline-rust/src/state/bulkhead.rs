//! Bulkhead admission state: one execution semaphore and one queue semaphore
//! per key.
//!
//! The queue semaphore is sized `max_concurrency + queue_limit`, so holding a
//! queue permit means the caller is either executing or waiting in the bounded
//! queue. Both permits are RAII guards released on every exit path.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rampart_core::{BulkheadPolicy, DequeuedHook, QueuedHook, RejectionReason};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::KeyedRegistry;
use crate::config::BulkheadDefaults;

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Resolved capacity for one bulkhead key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkheadSettings {
    pub max_concurrency: usize,
    pub queue_limit: usize,
}

impl BulkheadSettings {
    #[must_use]
    ///
    /// Capacity is clamped so that `max_concurrency + queue_limit` never
    /// exceeds [`Semaphore::MAX_PERMITS`].
    pub fn resolve(policy: Option<&BulkheadPolicy>, defaults: &BulkheadDefaults) -> Self {
        let max_concurrency = policy
            .and_then(|p| p.max_concurrency)
            .unwrap_or(defaults.max_concurrency)
            .clamp(1, Semaphore::MAX_PERMITS);
        let queue_limit = policy
            .and_then(|p| p.queue_limit)
            .unwrap_or(defaults.queue_limit)
            .min(Semaphore::MAX_PERMITS - max_concurrency);
        Self {
            max_concurrency,
            queue_limit,
        }
    }
}

// ---------------------------------------------------------------------------
// Admission types
// ---------------------------------------------------------------------------

/// Why [`BulkheadState::acquire`] did not return a permit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionError {
    Rejected(RejectionReason),
    Cancelled,
}

/// Hooks fired while a caller waits in the queue.
#[derive(Default, Clone, Copy)]
pub struct QueueHooks<'a> {
    pub on_queued: Option<&'a QueuedHook>,
    pub on_dequeued: Option<&'a DequeuedHook>,
}

impl<'a> QueueHooks<'a> {
    #[must_use]
    pub fn from_policy(policy: Option<&'a BulkheadPolicy>) -> Self {
        Self {
            on_queued: policy.and_then(|p| p.on_queued.as_ref()),
            on_dequeued: policy.and_then(|p| p.on_dequeued.as_ref()),
        }
    }
}

/// Execution slot held for the lifetime of one call.
///
/// The execution permit is declared first so it is released before the queue
/// permit.
#[derive(Debug)]
pub struct BulkheadPermit {
    _execution: OwnedSemaphorePermit,
    _queue: OwnedSemaphorePermit,
    waited: Option<Duration>,
}

impl BulkheadPermit {
    /// Time spent in the queue, `None` when a slot was free on arrival.
    #[must_use]
    pub fn waited(&self) -> Option<Duration> {
        self.waited
    }
}

/// Point-in-time view of one bulkhead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkheadSnapshot {
    pub max_concurrency: usize,
    pub queue_limit: usize,
    /// Free execution slots.
    pub available: usize,
    /// Callers currently waiting for an execution slot.
    pub queued: usize,
}

/// Decrements the queued count when the waiting caller leaves the queue.
struct QueuedGuard<'a>(&'a AtomicUsize);

impl Drop for QueuedGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

// ---------------------------------------------------------------------------
// BulkheadState
// ---------------------------------------------------------------------------

/// Admission state for one bulkhead key.
#[derive(Debug)]
pub struct BulkheadState {
    key: String,
    settings: BulkheadSettings,
    execution: Arc<Semaphore>,
    queue: Arc<Semaphore>,
    queued: AtomicUsize,
}

impl BulkheadState {
    #[must_use]
    pub fn new(key: impl Into<String>, settings: BulkheadSettings) -> Self {
        let execution = settings.max_concurrency.clamp(1, Semaphore::MAX_PERMITS);
        let admitted = execution
            .saturating_add(settings.queue_limit)
            .min(Semaphore::MAX_PERMITS);
        Self {
            key: key.into(),
            settings,
            execution: Arc::new(Semaphore::new(execution)),
            queue: Arc::new(Semaphore::new(admitted)),
            queued: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    #[must_use]
    pub fn settings(&self) -> &BulkheadSettings {
        &self.settings
    }

    #[must_use]
    pub fn snapshot(&self) -> BulkheadSnapshot {
        BulkheadSnapshot {
            max_concurrency: self.settings.max_concurrency,
            queue_limit: self.settings.queue_limit,
            available: self.execution.available_permits(),
            queued: self.queued.load(Ordering::Acquire),
        }
    }

    /// Admit a caller.
    ///
    /// `queue_timeout` of `None` waits indefinitely. `Some(Duration::ZERO)`
    /// never waits for queue admission, but a caller that got into the queue
    /// waits for its execution slot without a deadline. A positive timeout
    /// bounds both waits together.
    ///
    /// # Errors
    ///
    /// Returns `AdmissionError::Rejected` when capacity or the timeout is
    /// exhausted and `AdmissionError::Cancelled` when `cancel` fires while
    /// waiting.
    pub async fn acquire(
        &self,
        queue_timeout: Option<Duration>,
        cancel: &CancellationToken,
        hooks: QueueHooks<'_>,
    ) -> Result<BulkheadPermit, AdmissionError> {
        let start = Instant::now();
        let deadline = queue_timeout
            .filter(|t| !t.is_zero())
            .map(|t| start + t);

        // 1. Queue admission.
        let queue_permit = match queue_timeout {
            Some(t) if t.is_zero() => Arc::clone(&self.queue)
                .try_acquire_owned()
                .map_err(|_| AdmissionError::Rejected(RejectionReason::AtCapacity))?,
            _ => wait_for_permit(&self.queue, deadline, cancel).await?,
        };

        // 2. Free execution slot.
        if let Ok(execution) = Arc::clone(&self.execution).try_acquire_owned() {
            return Ok(BulkheadPermit {
                _execution: execution,
                _queue: queue_permit,
                waited: None,
            });
        }

        // 3. Wait in the bounded queue.
        if self.settings.queue_limit == 0 {
            return Err(AdmissionError::Rejected(RejectionReason::AtCapacity));
        }
        let position = self.queued.fetch_add(1, Ordering::AcqRel) + 1;
        let _queued = QueuedGuard(&self.queued);
        if let Some(hook) = hooks.on_queued {
            hook(position);
        }
        tracing::debug!(key = %self.key, position, "queued for bulkhead slot");

        let queued_at = Instant::now();
        let execution = wait_for_permit(&self.execution, deadline, cancel).await?;
        let waited = queued_at.elapsed();
        if let Some(hook) = hooks.on_dequeued {
            hook(waited);
        }

        Ok(BulkheadPermit {
            _execution: execution,
            _queue: queue_permit,
            waited: Some(waited),
        })
    }
}

/// Wait for one permit from `semaphore`, bounded by `deadline` and raced
/// against `cancel`.
async fn wait_for_permit(
    semaphore: &Arc<Semaphore>,
    deadline: Option<Instant>,
    cancel: &CancellationToken,
) -> Result<OwnedSemaphorePermit, AdmissionError> {
    let acquire = Arc::clone(semaphore).acquire_owned();
    let acquired = match deadline {
        None => tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(AdmissionError::Cancelled),
            permit = acquire => permit,
        },
        Some(deadline) => tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(AdmissionError::Cancelled),
            permit = tokio::time::timeout_at(deadline, acquire) => match permit {
                Ok(permit) => permit,
                Err(_elapsed) => {
                    return Err(AdmissionError::Rejected(RejectionReason::QueueTimeout));
                }
            },
        },
    };
    // The semaphores are never closed.
    acquired.map_err(|_closed| AdmissionError::Rejected(RejectionReason::AtCapacity))
}

// ---------------------------------------------------------------------------
// BulkheadRegistry
// ---------------------------------------------------------------------------

/// Process-wide bulkhead states keyed by bulkhead key.
#[derive(Debug, Default)]
pub struct BulkheadRegistry {
    states: KeyedRegistry<BulkheadState>,
}

impl BulkheadRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the state for `key`, creating it with `settings` on first use.
    pub fn get_or_create(
        &self,
        key: &str,
        settings: impl FnOnce() -> BulkheadSettings,
    ) -> Arc<BulkheadState> {
        self.states
            .get_or_insert_with(key, || BulkheadState::new(key, settings()))
    }

    #[must_use]
    pub fn snapshot(&self, key: &str) -> Option<BulkheadSnapshot> {
        self.states.get(key).map(|s| s.snapshot())
    }

    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.states.keys()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
