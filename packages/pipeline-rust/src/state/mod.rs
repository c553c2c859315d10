//! Per-key resilience state shared by every execution that resolves to the
//! same key.
//!
//! - [`circuit`]: circuit breaker state machine and its registry
//! - [`bulkhead`]: execution/queue semaphores and their registry

pub mod bulkhead;
pub mod circuit;

use std::sync::Arc;

use dashmap::DashMap;

pub use bulkhead::{
    AdmissionError, BulkheadPermit, BulkheadRegistry, BulkheadSettings, BulkheadSnapshot,
    BulkheadState, QueueHooks,
};
pub use circuit::{
    Admission, CircuitBreakerRegistry, CircuitBreakerState, CircuitSettings, CircuitSnapshot,
    Transition,
};

// ---------------------------------------------------------------------------
// KeyedRegistry
// ---------------------------------------------------------------------------

/// Lazily populated key -> state map.
///
/// States live for the lifetime of the registry. Under concurrent first access
/// to a key exactly one state is created and every caller observes it; the
/// settings of that first creator win.
#[derive(Debug)]
pub struct KeyedRegistry<T> {
    entries: DashMap<String, Arc<T>>,
}

impl<T> KeyedRegistry<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Returns the state for `key`, creating it with `make` if absent.
    pub fn get_or_insert_with(&self, key: &str, make: impl FnOnce() -> T) -> Arc<T> {
        if let Some(existing) = self.entries.get(key) {
            return Arc::clone(existing.value());
        }
        let entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(make()));
        Arc::clone(entry.value())
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<Arc<T>> {
        self.entries.get(key).map(|entry| Arc::clone(entry.value()))
    }

    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T> Default for KeyedRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;

    use super::*;

    #[test]
    fn first_creator_wins() {
        let registry: KeyedRegistry<u32> = KeyedRegistry::new();
        let first = registry.get_or_insert_with("payments", || 1);
        let second = registry.get_or_insert_with("payments", || 2);
        assert_eq!(*first, 1);
        assert_eq!(*second, 1);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn concurrent_first_access_creates_one_state() {
        let registry: Arc<KeyedRegistry<usize>> = Arc::new(KeyedRegistry::new());
        let created = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = Arc::clone(&registry);
                let created = Arc::clone(&created);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    registry.get_or_insert_with("shared", || {
                        created.fetch_add(1, Ordering::SeqCst);
                        i
                    })
                })
            })
            .collect();

        let states: Vec<Arc<usize>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert!(states.iter().all(|s| Arc::ptr_eq(s, &states[0])));
    }

    #[test]
    fn keys_are_sorted() {
        let registry: KeyedRegistry<()> = KeyedRegistry::default();
        assert!(registry.is_empty());
        registry.get_or_insert_with("b", || ());
        registry.get_or_insert_with("a", || ());
        assert_eq!(registry.keys(), vec!["a".to_string(), "b".to_string()]);
        assert!(registry.get("c").is_none());
    }
}
