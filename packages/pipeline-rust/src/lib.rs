//! Rampart Pipeline: composable resilience decorators (retry, circuit breaker,
//! bulkhead, fallback, dead-letter, timeout) over `tower` services.

pub mod config;
pub mod dead_letter;
pub mod invoker;
pub mod middleware;
pub mod registry;
pub mod state;
pub mod worker;

pub use config::{ConfigError, DecoratorKind, PipelineConfig};
pub use dead_letter::{
    DeadLetterError, DeadLetterMaintenance, DeadLetterQuery, DeadLetterRecord, DeadLetterStore,
    InMemoryDeadLetterStore,
};
pub use invoker::OperationInvoker;
pub use middleware::{ResiliencePipeline, ResiliencePipelineBuilder};
pub use registry::ProfileRegistry;
pub use state::{BulkheadRegistry, CircuitBreakerRegistry};
