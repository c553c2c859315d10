//! Pipeline configuration: process-wide decorator defaults and nesting order.
//!
//! Durations are stored as integer milliseconds so a configuration document
//! stays plain JSON. Operation profiles override individual fields per call.

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// DecoratorKind
// ---------------------------------------------------------------------------

/// Decorators that can appear in a pipeline's nesting order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecoratorKind {
    DeadLetter,
    Fallback,
    Bulkhead,
    CircuitBreaker,
    Retry,
    Timeout,
}

impl DecoratorKind {
    /// Default nesting order, outermost first.
    pub const DEFAULT_ORDER: [DecoratorKind; 6] = [
        DecoratorKind::DeadLetter,
        DecoratorKind::Fallback,
        DecoratorKind::Bulkhead,
        DecoratorKind::CircuitBreaker,
        DecoratorKind::Retry,
        DecoratorKind::Timeout,
    ];
}

// ---------------------------------------------------------------------------
// ConfigError
// ---------------------------------------------------------------------------

/// Rejected configuration values.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },
    #[error("{field} is out of range: {value}")]
    OutOfRange { field: &'static str, value: f64 },
    #[error("decorator {0:?} appears more than once in the pipeline order")]
    DuplicateDecorator(DecoratorKind),
    #[error("invalid configuration document: {0}")]
    Parse(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Defaults per decorator
// ---------------------------------------------------------------------------

/// Retry defaults used when an operation declares no retry policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryDefaults {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub backoff_multiplier: f64,
    /// Upper bound for a single delay. `None` leaves delays uncapped.
    pub max_delay_ms: Option<u64>,
    /// Uniform jitter as a fraction of the computed delay, in `[0, 1]`.
    pub jitter_factor: f64,
}

impl Default for RetryDefaults {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 200,
            backoff_multiplier: 2.0,
            max_delay_ms: Some(30_000),
            jitter_factor: 0.1,
        }
    }
}

/// Circuit breaker defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerDefaults {
    pub failure_threshold: u32,
    pub sampling_window_ms: u64,
    pub open_duration_ms: u64,
    pub success_threshold: u32,
}

impl Default for CircuitBreakerDefaults {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            sampling_window_ms: 30_000,
            open_duration_ms: 10_000,
            success_threshold: 2,
        }
    }
}

/// Bulkhead defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BulkheadDefaults {
    pub max_concurrency: usize,
    pub queue_limit: usize,
    /// `None` waits indefinitely; `Some(0)` never waits for queue admission.
    pub queue_timeout_ms: Option<u64>,
}

impl Default for BulkheadDefaults {
    fn default() -> Self {
        Self {
            max_concurrency: 10,
            queue_limit: 10,
            queue_timeout_ms: Some(5_000),
        }
    }
}

/// Fallback defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackDefaults {
    pub fallback_on_faulty: bool,
}

/// Dead-letter capture policy and in-memory store limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeadLetterConfig {
    /// Return the original error after the record is stored. When `false`
    /// the caller receives `OperationResponse::DeadLettered` instead.
    pub propagate_exception: bool,
    /// Capture the operation payload into the record.
    pub capture_message: bool,
    /// Capture the rendered error chain into the record.
    pub capture_exception: bool,
    /// Dead-letter errors that are not a resilience signal.
    pub capture_non_retryable: bool,
    pub max_exception_len: usize,
    /// Payloads whose encoded size exceeds this are not captured.
    pub max_message_bytes: usize,
    /// Capacity of the in-memory store before eviction.
    pub max_records: usize,
    /// Acknowledged records older than this are purged by maintenance.
    pub retention_ms: u64,
    pub purge_interval_ms: u64,
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self {
            propagate_exception: false,
            capture_message: true,
            capture_exception: true,
            capture_non_retryable: true,
            max_exception_len: 4_096,
            max_message_bytes: 64 * 1024,
            max_records: 10_000,
            retention_ms: 7 * 24 * 60 * 60 * 1_000,
            purge_interval_ms: 60 * 60 * 1_000,
        }
    }
}

// ---------------------------------------------------------------------------
// PipelineConfig
// ---------------------------------------------------------------------------

/// Top-level configuration for a resilience pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Decorator nesting order, outermost first. Kinds not listed are not
    /// installed.
    pub order: Vec<DecoratorKind>,
    /// Per-attempt timeout applied by the timeout decorator when the
    /// operation declares none. `None` disables the default.
    pub default_timeout_ms: Option<u64>,
    pub retry: RetryDefaults,
    pub circuit_breaker: CircuitBreakerDefaults,
    pub bulkhead: BulkheadDefaults,
    pub fallback: FallbackDefaults,
    pub dead_letter: DeadLetterConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            order: DecoratorKind::DEFAULT_ORDER.to_vec(),
            default_timeout_ms: None,
            retry: RetryDefaults::default(),
            circuit_breaker: CircuitBreakerDefaults::default(),
            bulkhead: BulkheadDefaults::default(),
            fallback: FallbackDefaults::default(),
            dead_letter: DeadLetterConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Parse and validate a JSON configuration document. Missing fields take
    /// their defaults.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Parse` for malformed JSON and the validation
    /// errors of [`PipelineConfig::validate`].
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges and the decorator order.
    ///
    /// # Errors
    ///
    /// Returns the first violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for kind in &self.order {
            if !seen.insert(*kind) {
                return Err(ConfigError::DuplicateDecorator(*kind));
            }
        }

        let retry = &self.retry;
        if !retry.backoff_multiplier.is_finite() || retry.backoff_multiplier < 1.0 {
            return Err(ConfigError::OutOfRange {
                field: "retry.backoff_multiplier",
                value: retry.backoff_multiplier,
            });
        }
        if !(0.0..=1.0).contains(&retry.jitter_factor) {
            return Err(ConfigError::OutOfRange {
                field: "retry.jitter_factor",
                value: retry.jitter_factor,
            });
        }

        let cb = &self.circuit_breaker;
        if cb.failure_threshold == 0 {
            return Err(ConfigError::Zero {
                field: "circuit_breaker.failure_threshold",
            });
        }
        if cb.success_threshold == 0 {
            return Err(ConfigError::Zero {
                field: "circuit_breaker.success_threshold",
            });
        }
        if cb.sampling_window_ms == 0 {
            return Err(ConfigError::Zero {
                field: "circuit_breaker.sampling_window_ms",
            });
        }

        if self.bulkhead.max_concurrency == 0 {
            return Err(ConfigError::Zero {
                field: "bulkhead.max_concurrency",
            });
        }
        if self.dead_letter.max_records == 0 {
            return Err(ConfigError::Zero {
                field: "dead_letter.max_records",
            });
        }
        if self.default_timeout_ms == Some(0) {
            return Err(ConfigError::Zero {
                field: "default_timeout_ms",
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout_ms.map(Duration::from_millis)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
