//! Drive the scheduler with synthetic load against the simulated worker

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use batchforge::logging::{self, LogLevel, LoggingConfig};
use batchforge::{
    Priority, RequestSpec, Scheduler, SchedulerConfig, SchedulerMetrics, SchedulerStats,
    SimulatedConfig, StreamOutput, Termination, WorkerBackend,
};
use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tokio::task::JoinSet;

#[derive(Parser, Debug)]
#[command(name = "batchforge-sim", version)]
#[command(about = "Run the continuous-batching scheduler against a simulated worker", long_about = None)]
struct Cli {
    /// Number of requests to submit
    #[arg(long, default_value_t = 64)]
    requests: usize,

    /// Shortest prompt, in tokens
    #[arg(long, default_value_t = 8)]
    min_prompt: usize,

    /// Longest prompt, in tokens
    #[arg(long, default_value_t = 128)]
    max_prompt: usize,

    /// Output budget per request
    #[arg(long, default_value_t = 32)]
    max_output: usize,

    /// Fraction of requests submitted as interactive
    #[arg(long, default_value_t = 0.25)]
    interactive_fraction: f64,

    /// Fraction of requests cancelled shortly after submission
    #[arg(long, default_value_t = 0.0)]
    cancel_fraction: f64,

    /// Per-token chance the simulated worker ends a sequence
    #[arg(long, default_value_t = 0.01)]
    eos_probability: f64,

    /// Per-request chance the simulated worker fails a dispatch
    #[arg(long, default_value_t = 0.0)]
    failure_probability: f64,

    /// Fixed worker latency per dispatch, in milliseconds
    #[arg(long, default_value_t = 2)]
    latency_ms: u64,

    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Override the configured max batch size
    #[arg(long)]
    max_batch_size: Option<usize>,

    /// Override the configured cache unit budget
    #[arg(long)]
    total_units: Option<usize>,

    /// Override the configured tokens per unit
    #[arg(long)]
    page_size: Option<usize>,

    /// Override the configured steps per dispatch
    #[arg(long)]
    max_steps: Option<usize>,

    /// Override the configured prompt tokens per batch
    #[arg(long)]
    max_prefill_tokens: Option<usize>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Print the summary as JSON
    #[arg(long)]
    json: bool,

    /// Print Prometheus metrics after the run
    #[arg(long)]
    metrics: bool,
}

#[derive(Debug, Default, Serialize)]
struct Summary {
    submitted: usize,
    rejected: usize,
    completed: usize,
    cancelled: usize,
    failed: usize,
    tokens: usize,
    elapsed_ms: u64,
    tokens_per_sec: f64,
    stats: SchedulerStats,
}

impl Summary {
    fn record(&mut self, output: &StreamOutput) {
        self.tokens += output.tokens.len();
        match output.termination {
            Some(Termination::Completed(_)) => self.completed += 1,
            Some(Termination::Cancelled(_)) => self.cancelled += 1,
            Some(Termination::Failed(_)) | None => self.failed += 1,
        }
    }
}

fn scheduler_config(cli: &Cli) -> anyhow::Result<SchedulerConfig> {
    let mut config = SchedulerConfig::from_env().context("reading BATCHFORGE_* overrides")?;
    if let Some(v) = cli.max_batch_size {
        config = config.with_max_batch_size(v);
    }
    if let Some(v) = cli.total_units {
        config = config.with_total_units(v);
    }
    if let Some(v) = cli.page_size {
        config = config.with_page_size(v);
    }
    if let Some(v) = cli.max_steps {
        config = config.with_max_steps_per_batch(v);
    }
    if let Some(v) = cli.max_prefill_tokens {
        config = config.with_max_prefill_tokens(v);
    }
    // Every synthetic request is submitted up front
    let depth = config.max_queue_depth.max(cli.requests);
    config = config.with_max_queue_depth(depth);
    Ok(config)
}

fn random_spec(cli: &Cli, rng: &mut StdRng) -> RequestSpec {
    let prompt_len = rng.gen_range(cli.min_prompt.max(1)..=cli.max_prompt.max(cli.min_prompt.max(1)));
    let prompt = (0..prompt_len).map(|_| rng.gen_range(0..32_000)).collect();
    let priority = if rng.gen_bool(cli.interactive_fraction.clamp(0.0, 1.0)) {
        Priority::Interactive
    } else {
        Priority::Batch
    };
    RequestSpec::new(prompt, cli.max_output.max(1)).with_priority(priority)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = LogLevel::parse(&cli.log_level)
        .with_context(|| format!("unknown log level '{}'", cli.log_level))?;
    logging::init_with_config(&LoggingConfig::from_env()?.with_level(level))?;

    let config = scheduler_config(&cli)?;
    let worker = SimulatedConfig {
        base_latency: Duration::from_millis(cli.latency_ms),
        eos_probability: cli.eos_probability,
        failure_probability: cli.failure_probability,
        seed: cli.seed,
        ..SimulatedConfig::default()
    };
    let metrics = Arc::new(SchedulerMetrics::new());

    let (scheduler, handle) = Scheduler::builder(config, WorkerBackend::Simulated(worker))
        .with_metrics(metrics.clone())
        .build()?;
    let loop_task = scheduler.spawn();

    let mut rng = StdRng::seed_from_u64(cli.seed);
    let mut summary = Summary::default();
    let mut consumers = JoinSet::new();
    let started = Instant::now();

    for _ in 0..cli.requests {
        let spec = random_spec(&cli, &mut rng);
        let cancel_after = rng
            .gen_bool(cli.cancel_fraction.clamp(0.0, 1.0))
            .then(|| Duration::from_millis(rng.gen_range(0..20)));

        let request = loop {
            match handle.submit(spec.clone()) {
                Ok(request) => break Some(request),
                Err(e) if e.is_retryable() => tokio::time::sleep(Duration::from_millis(1)).await,
                Err(e) => {
                    tracing::warn!(error = %e, "Submission rejected");
                    break None;
                }
            }
        };
        let Some(request) = request else {
            summary.rejected += 1;
            continue;
        };
        summary.submitted += 1;

        if let Some(delay) = cancel_after {
            let canceller = request.canceller();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                canceller.cancel();
            });
        }
        consumers.spawn(request.collect_output());
    }

    while let Some(output) = consumers.join_next().await {
        summary.record(&output.context("output consumer panicked")?);
    }

    let elapsed = started.elapsed();
    summary.elapsed_ms = elapsed.as_millis() as u64;
    summary.tokens_per_sec = summary.tokens as f64 / elapsed.as_secs_f64().max(f64::EPSILON);

    handle.shutdown();
    loop_task.await.context("scheduler task panicked")??;
    summary.stats = handle.stats();

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("requests:   {} submitted, {} rejected", summary.submitted, summary.rejected);
        println!(
            "outcomes:   {} completed, {} cancelled, {} failed",
            summary.completed, summary.cancelled, summary.failed
        );
        println!(
            "tokens:     {} in {} ms ({:.1} tok/s)",
            summary.tokens, summary.elapsed_ms, summary.tokens_per_sec
        );
        println!(
            "batches:    {} over {} iterations, {} deferrals, {} evictions",
            summary.stats.batches_dispatched,
            summary.stats.iterations,
            summary.stats.deferrals,
            summary.stats.evicted_requests
        );
    }

    if cli.metrics {
        print!("{}", metrics.encode_text()?);
    }
    Ok(())
}
