//! Operation-name -> resilience profile overrides.

use dashmap::DashMap;
use parking_lot::RwLock;
use rampart_core::{Operation, ResilienceProfile};

// ---------------------------------------------------------------------------
// ProfileRegistry
// ---------------------------------------------------------------------------

/// Registry of resilience profiles keyed by operation name.
///
/// Resolution order for an operation: a registered override, then the
/// operation's own declared profile, then the registry default, then an
/// empty profile (pipeline defaults everywhere).
#[derive(Debug, Default)]
pub struct ProfileRegistry {
    by_name: DashMap<String, ResilienceProfile>,
    default: RwLock<Option<ResilienceProfile>>,
}

impl ProfileRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an override. Returns the profile it replaced, if any.
    pub fn register(
        &self,
        operation_name: impl Into<String>,
        profile: ResilienceProfile,
    ) -> Option<ResilienceProfile> {
        self.by_name.insert(operation_name.into(), profile)
    }

    #[must_use]
    pub fn get(&self, operation_name: &str) -> Option<ResilienceProfile> {
        self.by_name
            .get(operation_name)
            .map(|entry| entry.value().clone())
    }

    pub fn remove(&self, operation_name: &str) -> Option<ResilienceProfile> {
        self.by_name.remove(operation_name).map(|(_, profile)| profile)
    }

    /// Profile used for operations with neither an override nor a declared
    /// profile.
    pub fn set_default(&self, profile: Option<ResilienceProfile>) {
        *self.default.write() = profile;
    }

    #[must_use]
    pub fn resolve(&self, operation: &dyn Operation) -> ResilienceProfile {
        self.get(operation.name())
            .or_else(|| operation.profile())
            .or_else(|| self.default.read().clone())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rampart_core::{FnOperation, OperationResponse, RetryPolicy};

    use super::*;

    fn op(name: &str) -> FnOperation {
        FnOperation::new(name, |_ctx| Box::pin(async { Ok(OperationResponse::Empty) }))
    }

    #[test]
    fn override_beats_declared_profile() {
        let registry = ProfileRegistry::new();
        let declared = op("orders.create")
            .with_profile(ResilienceProfile::new().with_timeout(Duration::from_secs(1)));
        registry.register(
            "orders.create",
            ResilienceProfile::new().with_timeout(Duration::from_secs(9)),
        );

        let resolved = registry.resolve(&declared);
        assert_eq!(resolved.timeout, Some(Duration::from_secs(9)));
    }

    #[test]
    fn declared_profile_beats_default() {
        let registry = ProfileRegistry::new();
        registry.set_default(Some(
            ResilienceProfile::new().with_retry(RetryPolicy::new().max_attempts(9)),
        ));
        let declared = op("orders.create")
            .with_profile(ResilienceProfile::new().with_retry(RetryPolicy::new().max_attempts(2)));
        let resolved = registry.resolve(&declared);
        assert_eq!(resolved.retry.unwrap().max_attempts, Some(2));

        let bare = registry.resolve(&op("orders.cancel"));
        assert_eq!(bare.retry.unwrap().max_attempts, Some(9));
    }

    #[test]
    fn register_replace_and_remove() {
        let registry = ProfileRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.register("a", ResilienceProfile::new()).is_none());
        assert!(registry
            .register("a", ResilienceProfile::new().with_timeout(Duration::from_secs(1)))
            .is_some());
        assert_eq!(registry.len(), 1);
        assert!(registry.remove("a").is_some());
        assert!(registry.get("a").is_none());
        assert!(registry.resolve(&op("a")).timeout.is_none());
    }
}
