//! Scheduler Benchmark Suite
//!
//! Benchmarks for the hot per-iteration bookkeeping:
//! - Slot ledger reserve/release churn
//! - Batch building over growing request sets (32, 256, 1024 requests)
//! - End-to-end throughput against a zero-latency simulated worker
//!
//! Run with: `cargo bench --bench scheduler_bench`

use std::hint::black_box;
use std::time::{Duration, Instant};

use batchforge::batch::BatchBuilder;
use batchforge::ledger::SlotLedger;
use batchforge::request::{Request, RequestId, RequestSpec};
use batchforge::stream::CancelFlag;
use batchforge::{Priority, Scheduler, SchedulerConfig, SimulatedConfig, WorkerBackend};

// ============================================================================
// Benchmark Harness
// ============================================================================

struct Benchmark {
    name: String,
    iterations: usize,
    warmup_iterations: usize,
}

impl Benchmark {
    fn new(name: &str, iterations: usize) -> Self {
        Benchmark {
            name: name.to_string(),
            iterations,
            warmup_iterations: iterations.min(10),
        }
    }

    fn run_time<F, R>(&self, mut f: F) -> BenchmarkResult
    where
        F: FnMut() -> R,
    {
        // Warmup
        for _ in 0..self.warmup_iterations {
            black_box(f());
        }

        let mut durations = Vec::with_capacity(self.iterations);
        for _ in 0..self.iterations {
            let start = Instant::now();
            black_box(f());
            durations.push(start.elapsed());
        }

        BenchmarkResult {
            name: self.name.clone(),
            iterations: self.iterations,
            durations,
        }
    }
}

struct BenchmarkResult {
    name: String,
    iterations: usize,
    durations: Vec<Duration>,
}

impl BenchmarkResult {
    fn report(&self) {
        let total: Duration = self.durations.iter().sum();
        let avg = total / self.iterations as u32;

        let mut sorted = self.durations.clone();
        sorted.sort();
        let min = sorted[0];
        let max = sorted[sorted.len() - 1];
        let p50 = sorted[sorted.len() / 2];
        let p99 = sorted[(sorted.len() * 99) / 100];

        println!("\n=== {} ===", self.name);
        println!("Iterations: {}", self.iterations);
        println!("Average: {:?} ({:.3} us)", avg, avg.as_secs_f64() * 1e6);
        println!("Min:     {:?}", min);
        println!("Max:     {:?}", max);
        println!("P50:     {:?}", p50);
        println!("P99:     {:?}", p99);

        let ops_per_sec = 1_000_000_000.0 / avg.as_nanos().max(1) as f64;
        println!("Throughput: {:.2} ops/sec", ops_per_sec);
    }
}

// ============================================================================
// Fixtures
// ============================================================================

fn admitted_requests(count: usize, ledger: &mut SlotLedger) -> Vec<Request> {
    (0..count)
        .map(|i| {
            let id = RequestId::from(format!("bench-{i}"));
            let priority = if i % 4 == 0 {
                Priority::Interactive
            } else {
                Priority::Batch
            };
            let spec = RequestSpec::new(vec![1; 16 + i % 48], 64).with_priority(priority);
            let mut request = Request::new(id.clone(), spec, i as u64, CancelFlag::new());
            if let Some(slot) = ledger.try_admit(&id, 4) {
                let _ = request.admit(slot);
            }
            request
        })
        .collect()
}

// ============================================================================
// Benchmarks
// ============================================================================

fn benchmark_ledger_churn() {
    let ids: Vec<RequestId> = (0..256).map(|i| RequestId::from(format!("r{i}"))).collect();
    let mut ledger = SlotLedger::new(8192, 256);

    let bench = Benchmark::new("ledger: admit/reserve/release x256", 200);
    let result = bench.run_time(|| {
        for id in &ids {
            let slot = ledger.try_admit(id, 4);
            ledger.try_reserve(id, 8);
            black_box(slot);
        }
        for id in &ids {
            ledger.release(id);
        }
        ledger.available()
    });
    result.report();
}

fn benchmark_batch_build(request_count: usize) {
    let config = SchedulerConfig::new()
        .with_total_units(request_count * 8)
        .with_max_sequences(request_count)
        .with_max_batch_size(64);

    let bench = Benchmark::new(&format!("batch build: {request_count} requests"), 100);
    let result = bench.run_time(|| {
        let mut ledger = SlotLedger::from_config(&config);
        let mut requests = admitted_requests(request_count, &mut ledger);
        let mut builder = BatchBuilder::new(&config);
        let plan = builder.build(requests.iter_mut(), &mut ledger);
        plan.descriptor.len()
    });
    result.report();
}

fn benchmark_end_to_end() {
    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            println!("\n[end-to-end skipped: {e}]");
            return;
        }
    };

    let requests = 256;
    let max_output = 32;
    let config = SchedulerConfig::new()
        .with_max_batch_size(64)
        .with_total_units(4096)
        .with_max_steps_per_batch(4)
        .with_idle_timeout(Duration::from_millis(1));
    let worker = SimulatedConfig {
        base_latency: Duration::ZERO,
        per_token_latency: Duration::ZERO,
        ..SimulatedConfig::default()
    };

    let start = Instant::now();
    let tokens = runtime.block_on(async move {
        let (scheduler, handle) = match Scheduler::builder(config, WorkerBackend::Simulated(worker)).build() {
            Ok(parts) => parts,
            Err(e) => {
                println!("\n[end-to-end skipped: {e}]");
                return 0;
            }
        };
        let task = scheduler.spawn();

        let mut handles = Vec::with_capacity(requests);
        for i in 0..requests {
            if let Ok(h) = handle.submit(RequestSpec::new(vec![7; 32 + i % 64], max_output)) {
                handles.push(h);
            }
        }

        let mut tokens = 0;
        for h in handles {
            tokens += h.collect_output().await.tokens.len();
        }
        handle.shutdown();
        let _ = task.await;
        tokens
    });
    let elapsed = start.elapsed();

    println!("\n=== end-to-end: {requests} requests x {max_output} tokens ===");
    println!("Tokens:     {}", tokens);
    println!("Wall time:  {:.2} ms", elapsed.as_secs_f64() * 1000.0);
    println!(
        "Throughput: {:.0} tokens/sec",
        tokens as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
    );
}

fn main() {
    println!("========================================");
    println!("batchforge Scheduler Benchmark Suite");
    println!("========================================");

    benchmark_ledger_churn();
    for count in [32, 256, 1024] {
        benchmark_batch_build(count);
    }
    benchmark_end_to_end();
}
