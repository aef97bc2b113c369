//! Scheduler fixtures shared by the integration tests

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use batchforge::config::{RetryConfig, SchedulerConfig};
use batchforge::error::ForgeResult;
use batchforge::metrics::SchedulerMetrics;
use batchforge::scheduler::{Scheduler, SchedulerHandle, SchedulerStats};
use batchforge::worker::WorkerBackend;
use tokio::task::JoinHandle;

use super::workers::{CountingSupervisor, ScriptedWorker};

/// Upper bound for any single await in a test
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Small, per-token accounting, fast idle ticks, one fast retry
pub fn test_config() -> SchedulerConfig {
    SchedulerConfig::new()
        .with_page_size(1)
        .with_total_units(256)
        .with_max_sequences(16)
        .with_max_batch_size(16)
        .with_admission_watermark(0.0)
        .with_idle_timeout(Duration::from_millis(5))
        .with_dispatch_timeout(Duration::from_secs(2))
        .with_dispatch_retry(
            RetryConfig::new()
                .with_max_retries(1)
                .with_delay_ms(1)
                .with_jitter(false),
        )
}

/// A built but not yet running scheduler plus its collaborators
pub struct Harness {
    scheduler: Option<Scheduler>,
    pub handle: SchedulerHandle,
    pub worker: Arc<ScriptedWorker>,
    pub supervisor: Arc<CountingSupervisor>,
    pub metrics: Arc<SchedulerMetrics>,
}

impl Harness {
    /// Start the loop. Submissions made before this are all seen by the
    /// first iteration.
    pub fn spawn(&mut self) -> JoinHandle<ForgeResult<()>> {
        self.scheduler
            .take()
            .expect("scheduler already spawned")
            .spawn()
    }
}

pub fn harness(config: SchedulerConfig, worker: ScriptedWorker) -> Harness {
    let worker = Arc::new(worker);
    let supervisor = Arc::new(CountingSupervisor::default());
    let metrics = Arc::new(SchedulerMetrics::new());

    let (scheduler, handle) = Scheduler::builder(config, WorkerBackend::Custom(worker.clone()))
        .with_supervisor(supervisor.clone())
        .with_metrics(metrics.clone())
        .build()
        .expect("test config is valid");

    Harness {
        scheduler: Some(scheduler),
        handle,
        worker,
        supervisor,
        metrics,
    }
}

/// Await `fut`, failing the test after [`TEST_TIMEOUT`]
pub async fn within<F: Future>(fut: F) -> F::Output {
    tokio::time::timeout(TEST_TIMEOUT, fut)
        .await
        .expect("test step timed out")
}

/// Wait until the loop publishes a snapshot matching `pred`
pub async fn wait_for_stats<P>(handle: &SchedulerHandle, mut pred: P) -> SchedulerStats
where
    P: FnMut(&SchedulerStats) -> bool,
{
    let mut rx = handle.subscribe_stats();
    let stats = within(rx.wait_for(|s| pred(s)))
        .await
        .expect("scheduler stopped before condition was met")
        .clone();
    stats
}
