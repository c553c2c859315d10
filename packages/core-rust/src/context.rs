//! Per-execution context threaded through every decorator of a pipeline.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::operation::Operation;
use crate::profile::ResilienceProfile;

/// Property key under which the correlation id is mirrored.
pub const CORRELATION_ID_KEY: &str = "correlation-id";
/// Property key under which the operation name is mirrored.
pub const CURRENT_OPERATION_KEY: &str = "current-operation";

/// Mutable state for one operation invocation.
///
/// Owned by the caller and shared (behind an `Arc`) only between the
/// decorators of a single chain. Flags and the attempt counter are atomics;
/// the property bag sits behind a `RwLock`, so every accessor takes `&self`.
pub struct ExecutionContext {
    operation: Arc<dyn Operation>,
    profile: ResilienceProfile,
    correlation_id: String,
    cancellation: CancellationToken,
    created_at: DateTime<Utc>,
    locked: AtomicBool,
    faulty: AtomicBool,
    attempts: AtomicU32,
    properties: RwLock<HashMap<String, Value>>,
}

impl ExecutionContext {
    /// Creates a context for `operation`, using the operation's own profile
    /// and a fresh correlation id and cancellation token.
    #[must_use]
    pub fn new(operation: Arc<dyn Operation>) -> Self {
        let profile = operation.profile().unwrap_or_default();
        let correlation_id = Uuid::new_v4().to_string();

        let mut properties = HashMap::new();
        properties.insert(
            CURRENT_OPERATION_KEY.to_string(),
            Value::String(operation.name().to_string()),
        );
        properties.insert(
            CORRELATION_ID_KEY.to_string(),
            Value::String(correlation_id.clone()),
        );

        Self {
            operation,
            profile,
            correlation_id,
            cancellation: CancellationToken::new(),
            created_at: Utc::now(),
            locked: AtomicBool::new(false),
            faulty: AtomicBool::new(false),
            attempts: AtomicU32::new(0),
            properties: RwLock::new(properties),
        }
    }

    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self.properties.get_mut().insert(
            CORRELATION_ID_KEY.to_string(),
            Value::String(self.correlation_id.clone()),
        );
        self
    }

    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Replaces the resolved profile (e.g. with a registry override).
    #[must_use]
    pub fn with_profile(mut self, profile: ResilienceProfile) -> Self {
        self.profile = profile;
        self
    }

    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, value: Value) -> Self {
        self.properties.get_mut().insert(key.into(), value);
        self
    }

    pub fn operation(&self) -> &Arc<dyn Operation> {
        &self.operation
    }

    #[must_use]
    pub fn operation_name(&self) -> &str {
        self.operation.name()
    }

    #[must_use]
    pub fn profile(&self) -> &ResilienceProfile {
        &self.profile
    }

    #[must_use]
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    // -- fault flag --

    /// Marks the execution as failed without raising an error.
    pub fn mark_faulty(&self) {
        if !self.faulty.swap(true, Ordering::AcqRel) {
            tracing::debug!(
                operation = self.operation_name(),
                correlation_id = %self.correlation_id,
                "execution marked faulty"
            );
        }
    }

    pub fn clear_fault(&self) {
        self.faulty.store(false, Ordering::Release);
    }

    #[must_use]
    pub fn is_faulty(&self) -> bool {
        self.faulty.load(Ordering::Acquire)
    }

    // -- lock flag --

    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }

    /// Locks the context for the duration of one execution.
    ///
    /// Returns `None` if the context is already executing. The lock is
    /// released when the returned guard is dropped.
    #[must_use]
    pub fn try_lock(self: &Arc<Self>) -> Option<ContextLock> {
        self.locked
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| ContextLock {
                ctx: Arc::clone(self),
            })
    }

    // -- attempts --

    /// Records the start of another invocation of the operation and returns
    /// the 1-based attempt number.
    pub fn begin_attempt(&self) -> u32 {
        self.attempts.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Number of times the operation itself has been invoked.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::Acquire)
    }

    // -- property bag --

    #[must_use]
    pub fn property(&self, key: &str) -> Option<Value> {
        self.properties.read().get(key).cloned()
    }

    pub fn set_property(&self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.properties.write().insert(key.into(), value)
    }

    pub fn remove_property(&self, key: &str) -> Option<Value> {
        self.properties.write().remove(key)
    }

    /// Point-in-time copy of the property bag.
    #[must_use]
    pub fn properties(&self) -> HashMap<String, Value> {
        self.properties.read().clone()
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("operation", &self.operation_name())
            .field("correlation_id", &self.correlation_id)
            .field("locked", &self.is_locked())
            .field("faulty", &self.is_faulty())
            .field("attempts", &self.attempts())
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// RAII guard holding the context lock.
///
/// Unlocks on drop, including when the execution future is dropped mid-flight.
#[derive(Debug)]
pub struct ContextLock {
    ctx: Arc<ExecutionContext>,
}

impl Drop for ContextLock {
    fn drop(&mut self) {
        self.ctx.locked.store(false, Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
