//! Rampart Core: execution context, operation contract, resilience profiles and error taxonomy.

pub mod context;
pub mod error;
pub mod operation;
pub mod profile;
pub mod types;

pub use context::{ContextLock, ExecutionContext, CORRELATION_ID_KEY, CURRENT_OPERATION_KEY};
pub use error::{render_error_chain, OperationError, RejectionReason};
pub use operation::{FnOperation, Operation};
pub use profile::{
    BulkheadPolicy, CircuitBreakerPolicy, DequeuedHook, ErrorPredicate, FallbackAction,
    FallbackCompletedHook, FallbackFailedHook, FallbackPolicy, FallbackStartingHook, QueuedHook,
    RejectedHook, ResilienceProfile, RetryHook, RetryPolicy, StateChangeHook,
};
pub use types::{BoxFuture, CircuitState, DeadLetterReason, OperationResponse};
