use std::fmt;

use async_trait::async_trait;

use crate::context::ExecutionContext;
use crate::error::OperationError;
use crate::profile::ResilienceProfile;
use crate::types::{BoxFuture, OperationResponse};

/// A unit of business work executed inside an [`ExecutionContext`].
///
/// Implementations signal failure either by returning an error or by calling
/// [`ExecutionContext::mark_faulty`] and returning normally.
#[async_trait]
pub trait Operation: Send + Sync {
    /// Stable name, used as the default circuit/bulkhead key and in logs.
    fn name(&self) -> &str;

    /// Resilience tuning declared by the operation itself.
    fn profile(&self) -> Option<ResilienceProfile> {
        None
    }

    /// Payload captured into a dead-letter record when the operation fails
    /// terminally and message capture is enabled.
    fn payload(&self) -> Option<serde_json::Value> {
        None
    }

    /// Run the operation once.
    async fn execute(&self, ctx: &ExecutionContext) -> Result<OperationResponse, OperationError>;
}

type OperationFn = Box<
    dyn for<'a> Fn(&'a ExecutionContext) -> BoxFuture<'a, Result<OperationResponse, OperationError>>
        + Send
        + Sync,
>;

/// Closure-backed [`Operation`].
pub struct FnOperation {
    name: String,
    profile: Option<ResilienceProfile>,
    payload: Option<serde_json::Value>,
    run: OperationFn,
}

impl FnOperation {
    pub fn new<F>(name: impl Into<String>, run: F) -> Self
    where
        F: for<'a> Fn(&'a ExecutionContext) -> BoxFuture<'a, Result<OperationResponse, OperationError>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name: name.into(),
            profile: None,
            payload: None,
            run: Box::new(run),
        }
    }

    #[must_use]
    pub fn with_profile(mut self, profile: ResilienceProfile) -> Self {
        self.profile = Some(profile);
        self
    }

    #[must_use]
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

impl fmt::Debug for FnOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnOperation")
            .field("name", &self.name)
            .field("profile", &self.profile)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Operation for FnOperation {
    fn name(&self) -> &str {
        &self.name
    }

    fn profile(&self) -> Option<ResilienceProfile> {
        self.profile.clone()
    }

    fn payload(&self) -> Option<serde_json::Value> {
        self.payload.clone()
    }

    async fn execute(&self, ctx: &ExecutionContext) -> Result<OperationResponse, OperationError> {
        (self.run)(ctx).await
    }
}
