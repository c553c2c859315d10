//! Pipeline composition: builds the decorator chain in the configured order
//! and runs executions through it.

use std::sync::Arc;

use rampart_core::{ExecutionContext, Operation, OperationError, OperationResponse};
use tower::util::BoxCloneSyncService;
use tower::{Layer, ServiceExt};

use super::bulkhead::BulkheadLayer;
use super::circuit_breaker::CircuitBreakerLayer;
use super::dead_letter::DeadLetterLayer;
use super::fallback::FallbackLayer;
use super::metrics::MetricsLayer;
use super::retry::RetryLayer;
use super::timeout::TimeoutLayer;
use super::Execution;
use crate::config::{ConfigError, DecoratorKind, PipelineConfig};
use crate::dead_letter::{DeadLetterStore, InMemoryDeadLetterStore};
use crate::invoker::OperationInvoker;
use crate::registry::ProfileRegistry;
use crate::state::{BulkheadRegistry, CircuitBreakerRegistry};

/// Type-erased decorator chain.
pub type ExecutionService = BoxCloneSyncService<Execution, OperationResponse, OperationError>;

// ---------------------------------------------------------------------------
// Chain composition
// ---------------------------------------------------------------------------

/// Shared state the decorators are built over.
struct ChainParts<'a> {
    config: &'a PipelineConfig,
    circuits: &'a Arc<CircuitBreakerRegistry>,
    bulkheads: &'a Arc<BulkheadRegistry>,
    dead_letters: &'a Arc<dyn DeadLetterStore>,
}

/// Wrap the invoker with the decorators in `parts.config.order` (outermost
/// first), then wrap everything in [`MetricsLayer`].
fn build_chain(parts: &ChainParts<'_>) -> ExecutionService {
    let config = parts.config;
    let mut service = ExecutionService::new(OperationInvoker);

    for kind in config.order.iter().rev() {
        service = match kind {
            DecoratorKind::Timeout => {
                ExecutionService::new(TimeoutLayer::new(config.default_timeout()).layer(service))
            }
            DecoratorKind::Retry => {
                ExecutionService::new(RetryLayer::new(config.retry.clone()).layer(service))
            }
            DecoratorKind::CircuitBreaker => ExecutionService::new(
                CircuitBreakerLayer::new(
                    Arc::clone(parts.circuits),
                    config.circuit_breaker.clone(),
                )
                .layer(service),
            ),
            DecoratorKind::Bulkhead => ExecutionService::new(
                BulkheadLayer::new(Arc::clone(parts.bulkheads), config.bulkhead.clone())
                    .layer(service),
            ),
            DecoratorKind::Fallback => {
                ExecutionService::new(FallbackLayer::new(config.fallback.clone()).layer(service))
            }
            DecoratorKind::DeadLetter => ExecutionService::new(
                DeadLetterLayer::new(Arc::clone(parts.dead_letters), config.dead_letter.clone())
                    .layer(service),
            ),
        };
    }

    ExecutionService::new(MetricsLayer.layer(service))
}

// ---------------------------------------------------------------------------
// ResiliencePipeline
// ---------------------------------------------------------------------------

/// A composed decorator chain plus the shared state it runs against.
///
/// Cloning is cheap; clones share circuit and bulkhead state, the profile
/// registry and the dead-letter store.
#[derive(Clone)]
pub struct ResiliencePipeline {
    service: ExecutionService,
    config: Arc<PipelineConfig>,
    profiles: Arc<ProfileRegistry>,
    circuits: Arc<CircuitBreakerRegistry>,
    bulkheads: Arc<BulkheadRegistry>,
    dead_letters: Arc<dyn DeadLetterStore>,
}

impl ResiliencePipeline {
    #[must_use]
    pub fn builder() -> ResiliencePipelineBuilder {
        ResiliencePipelineBuilder::default()
    }

    /// Create a context for `operation` with its profile resolved through the
    /// profile registry.
    #[must_use]
    pub fn context(&self, operation: Arc<dyn Operation>) -> ExecutionContext {
        let profile = self.profiles.resolve(operation.as_ref());
        ExecutionContext::new(operation).with_profile(profile)
    }

    /// Run `operation` in a fresh context.
    ///
    /// # Errors
    ///
    /// See [`ResiliencePipeline::execute_shared`].
    pub async fn run(
        &self,
        operation: Arc<dyn Operation>,
    ) -> Result<OperationResponse, OperationError> {
        self.execute(self.context(operation)).await
    }

    /// Run an execution through the chain.
    ///
    /// # Errors
    ///
    /// See [`ResiliencePipeline::execute_shared`].
    pub async fn execute(
        &self,
        ctx: ExecutionContext,
    ) -> Result<OperationResponse, OperationError> {
        self.execute_shared(Arc::new(ctx)).await
    }

    /// Run an execution the caller keeps a handle to, e.g. to cancel it or
    /// read its properties afterwards. The context is locked for the
    /// duration of the call.
    ///
    /// When the dead-letter decorator is installed with exception
    /// propagation disabled, a permanently failed execution returns
    /// `Ok(OperationResponse::DeadLettered { .. })`.
    ///
    /// # Errors
    ///
    /// Returns `OperationError::InvalidState` if the context is already
    /// executing, otherwise whatever the chain produced.
    pub async fn execute_shared(
        &self,
        ctx: Arc<ExecutionContext>,
    ) -> Result<OperationResponse, OperationError> {
        let Some(_lock) = ctx.try_lock() else {
            return Err(OperationError::InvalidState(format!(
                "execution context {} is already executing",
                ctx.correlation_id()
            )));
        };
        self.service.clone().oneshot(ctx).await
    }

    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    #[must_use]
    pub fn profiles(&self) -> &Arc<ProfileRegistry> {
        &self.profiles
    }

    #[must_use]
    pub fn circuit_breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.circuits
    }

    #[must_use]
    pub fn bulkheads(&self) -> &Arc<BulkheadRegistry> {
        &self.bulkheads
    }

    #[must_use]
    pub fn dead_letters(&self) -> &Arc<dyn DeadLetterStore> {
        &self.dead_letters
    }
}

impl std::fmt::Debug for ResiliencePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResiliencePipeline")
            .field("order", &self.config.order)
            .field("profiles", &self.profiles.len())
            .field("circuits", &self.circuits.keys())
            .field("bulkheads", &self.bulkheads.keys())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// ResiliencePipelineBuilder
// ---------------------------------------------------------------------------

/// Builder for [`ResiliencePipeline`]. Unset parts get fresh defaults.
#[derive(Default)]
pub struct ResiliencePipelineBuilder {
    config: Option<PipelineConfig>,
    order: Option<Vec<DecoratorKind>>,
    profiles: Option<Arc<ProfileRegistry>>,
    circuits: Option<Arc<CircuitBreakerRegistry>>,
    bulkheads: Option<Arc<BulkheadRegistry>>,
    dead_letters: Option<Arc<dyn DeadLetterStore>>,
}

impl ResiliencePipelineBuilder {
    #[must_use]
    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Override the configured decorator order (outermost first).
    #[must_use]
    pub fn order(mut self, order: Vec<DecoratorKind>) -> Self {
        self.order = Some(order);
        self
    }

    #[must_use]
    pub fn profiles(mut self, profiles: Arc<ProfileRegistry>) -> Self {
        self.profiles = Some(profiles);
        self
    }

    #[must_use]
    pub fn circuit_breakers(mut self, registry: Arc<CircuitBreakerRegistry>) -> Self {
        self.circuits = Some(registry);
        self
    }

    #[must_use]
    pub fn bulkheads(mut self, registry: Arc<BulkheadRegistry>) -> Self {
        self.bulkheads = Some(registry);
        self
    }

    #[must_use]
    pub fn dead_letter_store(mut self, store: Arc<dyn DeadLetterStore>) -> Self {
        self.dead_letters = Some(store);
        self
    }

    /// Validate the configuration and compose the chain.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found by [`PipelineConfig::validate`].
    pub fn build(self) -> Result<ResiliencePipeline, ConfigError> {
        let mut config = self.config.unwrap_or_default();
        if let Some(order) = self.order {
            config.order = order;
        }
        config.validate()?;

        let circuits = self.circuits.unwrap_or_default();
        let bulkheads = self.bulkheads.unwrap_or_default();
        let dead_letters = self.dead_letters.unwrap_or_else(|| {
            Arc::new(InMemoryDeadLetterStore::new(config.dead_letter.max_records))
        });

        let service = build_chain(&ChainParts {
            config: &config,
            circuits: &circuits,
            bulkheads: &bulkheads,
            dead_letters: &dead_letters,
        });
        tracing::debug!(order = ?config.order, "resilience pipeline composed");

        Ok(ResiliencePipeline {
            service,
            config: Arc::new(config),
            profiles: self.profiles.unwrap_or_default(),
            circuits,
            bulkheads,
            dead_letters,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
