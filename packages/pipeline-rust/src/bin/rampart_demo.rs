//! Rampart demo: drives a flaky workload through a resilience pipeline.
//!
//! ## Usage
//!
//! ```bash
//! # 200 operations, 30% transient failure rate
//! cargo run --bin rampart-demo
//!
//! # Heavier failure rate with JSON logs
//! RUST_LOG=debug cargo run --bin rampart-demo -- --failure-rate 0.8 --json-logs
//! ```
//!
//! Prints a JSON summary of outcomes and dead letters on exit. Ctrl+C cancels
//! in-flight executions.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use parking_lot::Mutex;
use rampart_core::{
    BulkheadPolicy, CircuitBreakerPolicy, FnOperation, Operation, OperationError,
    OperationResponse, ResilienceProfile, RetryPolicy,
};
use rampart_pipeline::{
    DeadLetterMaintenance, DeadLetterQuery, PipelineConfig, ResiliencePipeline,
};
use rand::Rng;
use serde_json::json;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const OPERATION_NAME: &str = "demo.fetch";

#[derive(Parser, Debug)]
#[command(name = "rampart-demo", about = "Run a flaky workload through a resilience pipeline")]
struct Cli {
    /// Total operations to execute.
    #[arg(long, env = "RAMPART_DEMO_OPERATIONS", default_value_t = 200)]
    operations: usize,

    /// Probability that a single attempt fails transiently (0.0..=1.0).
    #[arg(long, env = "RAMPART_DEMO_FAILURE_RATE", default_value_t = 0.3)]
    failure_rate: f64,

    /// Concurrent callers.
    #[arg(long, env = "RAMPART_DEMO_CONCURRENCY", default_value_t = 16)]
    concurrency: usize,

    /// Simulated work per attempt, in milliseconds.
    #[arg(long, env = "RAMPART_DEMO_WORK_MS", default_value_t = 5)]
    work_ms: u64,

    /// Pipeline configuration JSON file.
    #[arg(long, env = "RAMPART_DEMO_CONFIG")]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, env = "RAMPART_DEMO_JSON_LOGS")]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let config = load_config(cli.config.as_ref())?;
    let pipeline = ResiliencePipeline::builder()
        .config(config)
        .build()
        .context("invalid pipeline configuration")?;
    pipeline.profiles().register(OPERATION_NAME, demo_profile());

    let mut maintenance =
        DeadLetterMaintenance::spawn(Arc::clone(pipeline.dead_letters()), &pipeline.config().dead_letter);

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_ctrl_c(cancel.clone()));

    info!(
        operations = cli.operations,
        failure_rate = cli.failure_rate,
        concurrency = cli.concurrency,
        order = ?pipeline.config().order,
        "starting workload"
    );
    let outcomes = run_workload(&pipeline, &cli, &cancel).await;

    maintenance.stop().await;
    let summary = summarize(&pipeline, outcomes).await?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn init_tracing(json_logs: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let registry = tracing_subscriber::registry().with(filter);
    if json_logs {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<PipelineConfig> {
    let Some(path) = path else {
        return Ok(PipelineConfig::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    PipelineConfig::from_json_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

fn demo_profile() -> ResilienceProfile {
    ResilienceProfile::new()
        .with_retry(
            RetryPolicy::new()
                .max_attempts(3)
                .initial_delay(Duration::from_millis(20))
                .max_delay(Duration::from_millis(200)),
        )
        .with_circuit_breaker(
            CircuitBreakerPolicy::new()
                .key("demo.upstream")
                .failure_threshold(10)
                .open_duration(Duration::from_millis(500))
                .on_state_change(|key, from, to| {
                    info!(key, from = from.as_str(), to = to.as_str(), "circuit changed state");
                }),
        )
        .with_bulkhead(
            BulkheadPolicy::new()
                .key("demo.upstream")
                .max_concurrency(8)
                .queue_limit(32)
                .queue_timeout(Duration::from_secs(2)),
        )
        .with_timeout(Duration::from_secs(1))
}

fn flaky_operation(failure_rate: f64, work: Duration) -> Arc<dyn Operation> {
    let failure_rate = failure_rate.clamp(0.0, 1.0);
    Arc::new(
        FnOperation::new(OPERATION_NAME, move |_ctx| {
            let fail = rand::rng().random_bool(failure_rate);
            Box::pin(async move {
                tokio::time::sleep(work).await;
                if fail {
                    Err(OperationError::Transient("upstream unavailable".into()))
                } else {
                    Ok(OperationResponse::Value(json!({ "status": "ok" })))
                }
            })
        })
        .with_payload(json!({ "resource": "inventory" })),
    )
}

async fn run_workload(
    pipeline: &ResiliencePipeline,
    cli: &Cli,
    cancel: &CancellationToken,
) -> BTreeMap<String, usize> {
    let next = Arc::new(AtomicUsize::new(0));
    let outcomes = Arc::new(Mutex::new(BTreeMap::<String, usize>::new()));
    let operation = flaky_operation(cli.failure_rate, Duration::from_millis(cli.work_ms));
    let total = cli.operations;

    let mut callers = JoinSet::new();
    for _ in 0..cli.concurrency.max(1) {
        let pipeline = pipeline.clone();
        let operation = Arc::clone(&operation);
        let next = Arc::clone(&next);
        let outcomes = Arc::clone(&outcomes);
        let cancel = cancel.clone();
        callers.spawn(async move {
            while next.fetch_add(1, Ordering::Relaxed) < total && !cancel.is_cancelled() {
                let ctx = pipeline
                    .context(Arc::clone(&operation))
                    .with_cancellation(cancel.child_token());
                let label = match pipeline.execute(ctx).await {
                    Ok(OperationResponse::DeadLettered { .. }) => "dead_lettered",
                    Ok(_) => "ok",
                    Err(err) => err.kind(),
                };
                *outcomes.lock().entry(label.to_string()).or_default() += 1;
            }
        });
    }
    while let Some(joined) = callers.join_next().await {
        if let Err(err) = joined {
            tracing::error!(error = %err, "caller task failed");
        }
    }

    let outcomes = outcomes.lock().clone();
    outcomes
}

async fn summarize(
    pipeline: &ResiliencePipeline,
    outcomes: BTreeMap<String, usize>,
) -> anyhow::Result<serde_json::Value> {
    let cancel = CancellationToken::new();
    let records = pipeline
        .dead_letters()
        .list(&DeadLetterQuery::new().include_acknowledged(true), &cancel)
        .await?;

    let mut by_reason = BTreeMap::<&'static str, usize>::new();
    for record in &records {
        *by_reason.entry(record.reason.as_str()).or_default() += 1;
    }
    let circuits: Vec<_> = pipeline
        .circuit_breakers()
        .keys()
        .into_iter()
        .filter_map(|key| pipeline.circuit_breakers().snapshot(&key))
        .map(|snapshot| {
            json!({
                "key": snapshot.key,
                "state": snapshot.state.as_str(),
                "failure_count": snapshot.failure_count,
            })
        })
        .collect();
    let newest: Vec<_> = records
        .iter()
        .take(5)
        .map(|record| {
            json!({
                "id": record.id,
                "reason": record.reason.as_str(),
                "retry_attempts": record.retry_attempts,
                "failed_at": record.failed_at,
                "exception": record.exception,
            })
        })
        .collect();

    Ok(json!({
        "outcomes": outcomes,
        "dead_letters": {
            "total": records.len(),
            "by_reason": by_reason,
            "newest": newest,
        },
        "circuits": circuits,
    }))
}

async fn cancel_on_ctrl_c(cancel: CancellationToken) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            info!("received Ctrl+C, cancelling in-flight executions");
            cancel.cancel();
        }
        Err(err) => tracing::error!(error = ?err, "failed to install Ctrl+C handler"),
    }
}
