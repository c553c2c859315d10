//! Integration tests for the composed pipeline.
//!
//! Each test drives a real decorator chain built by `ResiliencePipeline` and
//! checks the observable contract: attempt timing, circuit transitions,
//! bulkhead admission, dead-letter capture, fallback triggering and
//! cancellation precedence.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rampart_core::{
    BulkheadPolicy, CircuitBreakerPolicy, CircuitState, DeadLetterReason, ExecutionContext,
    FallbackPolicy, FnOperation, Operation, OperationError, OperationResponse, RejectionReason,
    ResilienceProfile, RetryPolicy,
};
use rampart_pipeline::{DeadLetterQuery, DecoratorKind, ResiliencePipeline};
use serde_json::json;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Test Operations
// ============================================================================

/// Operation that always fails transiently and records when each attempt ran.
fn always_failing(name: &str, attempts: Arc<Mutex<Vec<Instant>>>) -> Arc<dyn Operation> {
    Arc::new(FnOperation::new(name, move |_ctx| {
        attempts.lock().push(Instant::now());
        Box::pin(async { Err(OperationError::Transient("connection reset".into())) })
    }))
}

/// Operation whose outcome is switched by `fail`, counting invocations.
fn switchable(name: &str, fail: Arc<AtomicBool>, calls: Arc<AtomicU32>) -> Arc<dyn Operation> {
    Arc::new(FnOperation::new(name, move |_ctx| {
        calls.fetch_add(1, Ordering::SeqCst);
        let failing = fail.load(Ordering::SeqCst);
        Box::pin(async move {
            if failing {
                Err(OperationError::Transient("upstream 503".into()))
            } else {
                Ok(OperationResponse::Empty)
            }
        })
    }))
}

/// Operation that holds its slot until a permit is added to `gate`, tracking
/// peak concurrency in `peak`.
fn gated(
    name: &str,
    gate: Arc<Semaphore>,
    running: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
) -> Arc<dyn Operation> {
    Arc::new(FnOperation::new(name, move |_ctx| {
        let gate = Arc::clone(&gate);
        let running = Arc::clone(&running);
        let peak = Arc::clone(&peak);
        Box::pin(async move {
            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            let permit = gate.acquire().await;
            running.fetch_sub(1, Ordering::SeqCst);
            drop(permit);
            Ok(OperationResponse::Empty)
        })
    }))
}

async fn wait_until(mut done: impl FnMut() -> bool) {
    while !done() {
        tokio::task::yield_now().await;
    }
}

// ============================================================================
// Retry
// ============================================================================

#[tokio::test(start_paused = true)]
async fn retry_follows_backoff_law_then_exhausts() {
    let pipeline = ResiliencePipeline::builder()
        .order(vec![DecoratorKind::Retry, DecoratorKind::Timeout])
        .build()
        .unwrap();
    let attempts = Arc::new(Mutex::new(Vec::new()));
    let op = always_failing("payments.capture", Arc::clone(&attempts));
    let ctx = pipeline.context(op).with_profile(
        ResilienceProfile::new().with_retry(
            RetryPolicy::new()
                .max_attempts(3)
                .initial_delay(Duration::from_millis(200))
                .backoff_multiplier(2.0)
                .jitter_factor(0.0),
        ),
    );

    let err = pipeline.execute(ctx).await.unwrap_err();
    assert!(matches!(err, OperationError::RetryExhausted { attempts: 3, .. }));

    let attempts = attempts.lock();
    assert_eq!(attempts.len(), 3);
    let first_gap = attempts[1] - attempts[0];
    let second_gap = attempts[2] - attempts[1];
    assert!(first_gap >= Duration::from_millis(200) && first_gap < Duration::from_millis(205));
    assert!(second_gap >= Duration::from_millis(400) && second_gap < Duration::from_millis(405));
}

// ============================================================================
// Circuit breaker
// ============================================================================

fn circuit_profile() -> ResilienceProfile {
    ResilienceProfile::new().with_circuit_breaker(
        CircuitBreakerPolicy::new()
            .key("inventory")
            .failure_threshold(5)
            .sampling_window(Duration::from_secs(30))
            .open_duration(Duration::from_secs(10))
            .success_threshold(2),
    )
}

#[tokio::test(start_paused = true)]
async fn circuit_opens_probes_and_closes() {
    let pipeline = ResiliencePipeline::builder()
        .order(vec![DecoratorKind::CircuitBreaker])
        .build()
        .unwrap();
    pipeline.profiles().register("inventory.reserve", circuit_profile());
    let fail = Arc::new(AtomicBool::new(true));
    let calls = Arc::new(AtomicU32::new(0));
    let op = switchable("inventory.reserve", Arc::clone(&fail), Arc::clone(&calls));
    let circuits = Arc::clone(pipeline.circuit_breakers());

    for _ in 0..5 {
        let err = pipeline.run(Arc::clone(&op)).await.unwrap_err();
        assert!(matches!(err, OperationError::Transient(_)));
    }
    assert_eq!(circuits.state("inventory"), Some(CircuitState::Open));

    let err = pipeline.run(Arc::clone(&op)).await.unwrap_err();
    assert!(matches!(err, OperationError::CircuitOpen { ref key, .. } if key == "inventory"));
    assert_eq!(calls.load(Ordering::SeqCst), 5);

    tokio::time::advance(Duration::from_secs(10)).await;
    fail.store(false, Ordering::SeqCst);

    pipeline.run(Arc::clone(&op)).await.unwrap();
    assert_eq!(circuits.state("inventory"), Some(CircuitState::HalfOpen));
    pipeline.run(Arc::clone(&op)).await.unwrap();
    assert_eq!(circuits.state("inventory"), Some(CircuitState::Closed));
    assert_eq!(calls.load(Ordering::SeqCst), 7);
}

#[tokio::test(start_paused = true)]
async fn half_open_failure_reopens_immediately() {
    let pipeline = ResiliencePipeline::builder()
        .order(vec![DecoratorKind::CircuitBreaker])
        .build()
        .unwrap();
    pipeline.profiles().register("inventory.reserve", circuit_profile());
    let fail = Arc::new(AtomicBool::new(true));
    let calls = Arc::new(AtomicU32::new(0));
    let op = switchable("inventory.reserve", Arc::clone(&fail), Arc::clone(&calls));

    for _ in 0..5 {
        let _ = pipeline.run(Arc::clone(&op)).await;
    }
    tokio::time::advance(Duration::from_secs(10)).await;

    let err = pipeline.run(Arc::clone(&op)).await.unwrap_err();
    assert!(matches!(err, OperationError::Transient(_)));
    assert_eq!(
        pipeline.circuit_breakers().state("inventory"),
        Some(CircuitState::Open)
    );

    let err = pipeline.run(Arc::clone(&op)).await.unwrap_err();
    assert!(matches!(err, OperationError::CircuitOpen { .. }));
    assert_eq!(calls.load(Ordering::SeqCst), 6);
}

// ============================================================================
// Bulkhead
// ============================================================================

#[tokio::test]
async fn bulkhead_runs_two_queues_one_rejects_fourth() {
    let pipeline = ResiliencePipeline::builder()
        .order(vec![DecoratorKind::Bulkhead])
        .build()
        .unwrap();
    let queued_at = Arc::new(Mutex::new(Vec::new()));
    let positions = Arc::clone(&queued_at);
    pipeline.profiles().register(
        "reports.render",
        ResilienceProfile::new().with_bulkhead(
            BulkheadPolicy::new()
                .key("reports")
                .max_concurrency(2)
                .queue_limit(1)
                .queue_timeout(Duration::ZERO)
                .on_queued(move |position| positions.lock().push(position)),
        ),
    );
    let gate = Arc::new(Semaphore::new(0));
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let op = gated(
        "reports.render",
        Arc::clone(&gate),
        Arc::clone(&running),
        Arc::clone(&peak),
    );
    let bulkheads = Arc::clone(pipeline.bulkheads());

    let mut in_flight = Vec::new();
    for _ in 0..2 {
        let pipeline = pipeline.clone();
        let op = Arc::clone(&op);
        in_flight.push(tokio::spawn(async move { pipeline.run(op).await }));
    }
    wait_until(|| running.load(Ordering::SeqCst) == 2).await;

    let third = {
        let pipeline = pipeline.clone();
        let op = Arc::clone(&op);
        tokio::spawn(async move { pipeline.run(op).await })
    };
    wait_until(|| bulkheads.snapshot("reports").is_some_and(|s| s.queued == 1)).await;
    assert_eq!(*queued_at.lock(), vec![1]);

    let err = pipeline.run(Arc::clone(&op)).await.unwrap_err();
    assert!(matches!(
        err,
        OperationError::BulkheadRejected {
            reason: RejectionReason::AtCapacity,
            ..
        }
    ));

    gate.add_permits(1);
    assert_eq!(third.await.unwrap().unwrap(), OperationResponse::Empty);
    for handle in in_flight {
        assert_eq!(handle.await.unwrap().unwrap(), OperationResponse::Empty);
    }
    assert_eq!(peak.load(Ordering::SeqCst), 2);

    let snapshot = bulkheads.snapshot("reports").unwrap();
    assert_eq!(snapshot.available, 2);
    assert_eq!(snapshot.queued, 0);
}

#[tokio::test]
async fn oversized_bulkhead_queue_limit_is_clamped() {
    let pipeline = ResiliencePipeline::builder()
        .order(vec![DecoratorKind::Bulkhead])
        .build()
        .unwrap();
    pipeline.profiles().register(
        "reports.export",
        ResilienceProfile::new().with_bulkhead(
            BulkheadPolicy::new()
                .key("exports")
                .max_concurrency(1)
                .queue_limit(usize::MAX / 4),
        ),
    );
    let calls = Arc::new(AtomicU32::new(0));
    let op = switchable(
        "reports.export",
        Arc::new(AtomicBool::new(false)),
        Arc::clone(&calls),
    );

    assert_eq!(pipeline.run(op).await.unwrap(), OperationResponse::Empty);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let snapshot = pipeline.bulkheads().snapshot("exports").unwrap();
    assert_eq!(snapshot.max_concurrency, 1);
    assert_eq!(snapshot.queue_limit, Semaphore::MAX_PERMITS - 1);
}

// ============================================================================
// Dead letter
// ============================================================================

#[tokio::test(start_paused = true)]
async fn exhausted_retries_are_dead_lettered_once() {
    let pipeline = ResiliencePipeline::builder().build().unwrap();
    pipeline.profiles().register(
        "payments.capture",
        ResilienceProfile::new().with_retry(
            RetryPolicy::new()
                .max_attempts(4)
                .initial_delay(Duration::from_millis(50))
                .jitter_factor(0.0),
        ),
    );
    let attempts = Arc::new(Mutex::new(Vec::new()));
    let op = always_failing("payments.capture", Arc::clone(&attempts));

    let resp = pipeline.run(op).await.unwrap();
    let OperationResponse::DeadLettered { record_id, reason } = resp else {
        panic!("expected a dead-lettered response, got {resp:?}");
    };
    assert_eq!(reason, DeadLetterReason::MaxRetriesExceeded);

    let store = pipeline.dead_letters();
    let cancel = CancellationToken::new();
    let listed = store.list(&DeadLetterQuery::new(), &cancel).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, record_id);
    assert_eq!(listed[0].retry_attempts, 4);
    assert_eq!(listed[0].operation_name, "payments.capture");

    assert!(store.acknowledge(record_id, "oncall", &cancel).await.unwrap());
    let record = store.get(record_id, &cancel).await.unwrap().unwrap();
    assert!(record.acknowledged);
    assert!(record.acknowledged_at.is_some());
    assert_eq!(record.acknowledged_by.as_deref(), Some("oncall"));

    assert!(store.list(&DeadLetterQuery::new(), &cancel).await.unwrap().is_empty());
    let with_acked = DeadLetterQuery::new().include_acknowledged(true);
    assert_eq!(store.count(&with_acked, &cancel).await.unwrap(), 1);
}

#[tokio::test]
async fn propagated_dead_letters_return_original_error() {
    let mut config = rampart_pipeline::PipelineConfig::default();
    config.dead_letter.propagate_exception = true;
    let pipeline = ResiliencePipeline::builder()
        .config(config)
        .order(vec![DecoratorKind::DeadLetter])
        .build()
        .unwrap();
    let op: Arc<dyn Operation> = Arc::new(FnOperation::new("orders.validate", |_ctx| {
        Box::pin(async { Err(OperationError::InvalidArgument("missing sku".into())) })
    }));

    let err = pipeline.run(op).await.unwrap_err();
    assert!(matches!(err, OperationError::InvalidArgument(_)));
    let records = pipeline
        .dead_letters()
        .list(&DeadLetterQuery::new(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].reason, DeadLetterReason::NonRetryableException);
}

// ============================================================================
// Fallback
// ============================================================================

#[tokio::test]
async fn fallback_untouched_when_operation_succeeds() {
    let pipeline = ResiliencePipeline::builder().build().unwrap();
    let invoked = Arc::new(AtomicU32::new(0));
    let started = Arc::new(AtomicU32::new(0));
    let completed = Arc::new(AtomicU32::new(0));
    let (i, s, c) = (
        Arc::clone(&invoked),
        Arc::clone(&started),
        Arc::clone(&completed),
    );
    let profile = ResilienceProfile::new().with_fallback(
        FallbackPolicy::new()
            .fallback_on_faulty(true)
            .action(move |_ctx, _err| {
                i.fetch_add(1, Ordering::SeqCst);
                Box::pin(async { Ok(OperationResponse::Value(json!("stale"))) })
            })
            .on_fallback_starting(move |_err| {
                s.fetch_add(1, Ordering::SeqCst);
            })
            .on_fallback_completed(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }),
    );
    let op: Arc<dyn Operation> = Arc::new(
        FnOperation::new("catalog.lookup", |_ctx| {
            Box::pin(async { Ok(OperationResponse::Value(json!({ "sku": "A-1" }))) })
        })
        .with_profile(profile),
    );

    let resp = pipeline.run(op).await.unwrap();
    assert_eq!(resp, OperationResponse::Value(json!({ "sku": "A-1" })));
    assert_eq!(invoked.load(Ordering::SeqCst), 0);
    assert_eq!(started.load(Ordering::SeqCst), 0);
    assert_eq!(completed.load(Ordering::SeqCst), 0);
}

// ============================================================================
// Cancellation
// ============================================================================

#[tokio::test(start_paused = true)]
async fn cancel_during_retry_delay_surfaces_cancellation() {
    let pipeline = ResiliencePipeline::builder()
        .order(vec![DecoratorKind::CircuitBreaker, DecoratorKind::Retry])
        .build()
        .unwrap();
    let attempts = Arc::new(Mutex::new(Vec::new()));
    let op = always_failing("payments.capture", Arc::clone(&attempts));
    let cancel = CancellationToken::new();
    let ctx: Arc<ExecutionContext> = Arc::new(
        pipeline
            .context(op)
            .with_cancellation(cancel.clone())
            .with_profile(
                ResilienceProfile::new().with_retry(
                    RetryPolicy::new()
                        .max_attempts(5)
                        .initial_delay(Duration::from_secs(30)),
                ),
            ),
    );

    let handle = {
        let pipeline = pipeline.clone();
        let ctx = Arc::clone(&ctx);
        tokio::spawn(async move { pipeline.execute_shared(ctx).await })
    };
    wait_until(|| ctx.attempts() == 1).await;
    cancel.cancel();

    let err = handle.await.unwrap().unwrap_err();
    assert!(err.is_cancelled());
    assert!(matches!(
        err,
        OperationError::Cancelled { last: Some(ref last) } if matches!(**last, OperationError::Transient(_))
    ));
    assert_eq!(attempts.lock().len(), 1);
    assert_eq!(
        pipeline
            .circuit_breakers()
            .snapshot("payments.capture")
            .unwrap()
            .failure_count,
        0
    );
}

#[tokio::test]
async fn cancel_during_queue_wait_releases_position() {
    let pipeline = ResiliencePipeline::builder()
        .order(vec![DecoratorKind::CircuitBreaker, DecoratorKind::Bulkhead])
        .build()
        .unwrap();
    pipeline.profiles().register(
        "reports.render",
        ResilienceProfile::new()
            .with_bulkhead(BulkheadPolicy::new().max_concurrency(1).queue_limit(1)),
    );
    let gate = Arc::new(Semaphore::new(0));
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let op = gated(
        "reports.render",
        Arc::clone(&gate),
        Arc::clone(&running),
        Arc::clone(&peak),
    );
    let bulkheads = Arc::clone(pipeline.bulkheads());

    let first = {
        let pipeline = pipeline.clone();
        let op = Arc::clone(&op);
        tokio::spawn(async move { pipeline.run(op).await })
    };
    wait_until(|| running.load(Ordering::SeqCst) == 1).await;

    let cancel = CancellationToken::new();
    let waiting = {
        let pipeline = pipeline.clone();
        let ctx = pipeline
            .context(Arc::clone(&op))
            .with_cancellation(cancel.clone());
        tokio::spawn(async move { pipeline.execute(ctx).await })
    };
    wait_until(|| bulkheads.snapshot("reports.render").is_some_and(|s| s.queued == 1)).await;
    cancel.cancel();

    let err = waiting.await.unwrap().unwrap_err();
    assert!(err.is_cancelled());
    assert!(!matches!(err, OperationError::BulkheadRejected { .. }));
    assert_eq!(bulkheads.snapshot("reports.render").unwrap().queued, 0);

    gate.add_permits(1);
    first.await.unwrap().unwrap();
    assert_eq!(bulkheads.snapshot("reports.render").unwrap().available, 1);
    assert_eq!(
        pipeline
            .circuit_breakers()
            .snapshot("reports.render")
            .unwrap()
            .failure_count,
        0
    );
}
