//! Continuous-batching scheduler loop
//!
//! One [`Scheduler`] task owns the [`SchedulerState`] and runs
//! drain → sweep → admit → build → dispatch → apply → sweep until it is shut
//! down, every handle is dropped, or the worker fails batch-wide. Exactly one
//! batch is in flight at a time.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::handle::SchedulerHandle;
use super::queue::{LoopPhase, QueueDepth, SchedulerStats};
use super::state::{SchedulerState, Submission};
use super::supervisor::{FatalFailure, LogSupervisor, Supervisor};
use crate::batch::BatchDescriptor;
use crate::config::SchedulerConfig;
use crate::error::{ForgeError, ForgeResult};
use crate::metrics::{DispatchTimer, SchedulerMetrics};
use crate::request::{CancelReason, FailureReason};
use crate::worker::{BatchResult, ComputeWorker, WorkerBackend, WorkerError};

/// Configures and creates a [`Scheduler`] with its [`SchedulerHandle`]
pub struct SchedulerBuilder {
    config: SchedulerConfig,
    backend: WorkerBackend,
    supervisor: Arc<dyn Supervisor>,
    metrics: Option<Arc<SchedulerMetrics>>,
}

impl SchedulerBuilder {
    pub fn new(config: SchedulerConfig, backend: WorkerBackend) -> Self {
        SchedulerBuilder {
            config,
            backend,
            supervisor: Arc::new(LogSupervisor),
            metrics: None,
        }
    }

    pub fn with_supervisor(mut self, supervisor: Arc<dyn Supervisor>) -> Self {
        self.supervisor = supervisor;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<SchedulerMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Validate the configuration and wire the loop to a fresh handle
    pub fn build(self) -> ForgeResult<(Scheduler, SchedulerHandle)> {
        self.config.validate()?;

        let depth = QueueDepth::new(self.config.max_queue_depth);
        let (tx, rx) = mpsc::unbounded_channel();
        let wake = Arc::new(Notify::new());
        let shutdown = CancellationToken::new();

        let state = SchedulerState::new(self.config.clone(), depth.clone(), self.metrics.clone());
        let (stats_tx, stats_rx) = watch::channel(state.snapshot(LoopPhase::Idle));
        let worker = self.backend.into_worker();

        info!(
            worker = worker.name(),
            max_batch_size = self.config.max_batch_size,
            total_units = self.config.total_units,
            max_sequences = self.config.max_sequences,
            page_size = self.config.page_size,
            max_queue_depth = self.config.max_queue_depth,
            "Scheduler created"
        );

        let handle = SchedulerHandle::new(
            tx,
            depth,
            wake.clone(),
            Arc::new(self.config.clone()),
            stats_rx,
            self.metrics,
            shutdown.clone(),
        );

        let scheduler = Scheduler {
            config: self.config,
            state,
            rx,
            worker,
            supervisor: self.supervisor,
            wake,
            shutdown,
            stats_tx,
            inbound_closed: false,
        };

        Ok((scheduler, handle))
    }
}

/// A batch-wide failure that survived the retry budget
#[derive(Debug)]
struct DispatchFailure {
    error: WorkerError,
    attempts: usize,
}

enum Wake {
    Shutdown,
    Submission(Option<Submission>),
    Notified,
    Tick,
}

/// The scheduler loop; consumed by [`Scheduler::run`]
pub struct Scheduler {
    config: SchedulerConfig,
    state: SchedulerState,
    rx: mpsc::UnboundedReceiver<Submission>,
    worker: Arc<dyn ComputeWorker>,
    supervisor: Arc<dyn Supervisor>,
    wake: Arc<Notify>,
    shutdown: CancellationToken,
    stats_tx: watch::Sender<SchedulerStats>,
    inbound_closed: bool,
}

impl Scheduler {
    pub fn builder(config: SchedulerConfig, backend: WorkerBackend) -> SchedulerBuilder {
        SchedulerBuilder::new(config, backend)
    }

    /// Run the loop on the current runtime
    pub fn spawn(self) -> JoinHandle<ForgeResult<()>> {
        tokio::spawn(self.run())
    }

    /// Run until shutdown, until every handle is dropped with no work left,
    /// or until the worker fails batch-wide.
    ///
    /// Every request accepted by `submit` gets a terminal event before this
    /// returns.
    pub async fn run(mut self) -> ForgeResult<()> {
        info!(worker = self.worker.name(), "Scheduler loop started");

        let result = self.run_loop().await;

        // Nothing submitted from here on is accepted; settle the stragglers
        self.rx.close();
        while let Ok(submission) = self.rx.try_recv() {
            self.state.accept(submission);
        }
        let leftover = match &result {
            Ok(()) => self.state.cancel_all(CancelReason::Shutdown),
            Err(_) => self.state.fail_all(FailureReason::WorkerUnavailable),
        };

        let stats = self.publish(LoopPhase::Stopped);
        info!(
            leftover,
            iterations = stats.iterations,
            batches = stats.batches_dispatched,
            tokens = stats.tokens_generated,
            completed = stats.completed_requests,
            cancelled = stats.cancelled_requests,
            failed = stats.failed_requests,
            "Scheduler loop stopped"
        );
        result
    }

    async fn run_loop(&mut self) -> ForgeResult<()> {
        loop {
            if self.shutdown.is_cancelled() {
                let cancelled = self.state.cancel_all(CancelReason::Shutdown);
                info!(cancelled, "Shutdown requested");
                return Ok(());
            }

            self.state.record_iteration();
            self.drain_submissions();

            let mut progressed = self.state.sweep_cancelled() > 0;
            progressed |= self.state.admit()? > 0;

            let plan = self.state.build();
            if let Some(victim) = &plan.victim {
                progressed |= self.state.evict(victim);
            }

            if plan.descriptor.is_empty() {
                self.publish(LoopPhase::Idle);
                if self.inbound_closed && !self.state.has_work() {
                    info!("All scheduler handles dropped, no work left");
                    return Ok(());
                }
                if !progressed {
                    self.wait_for_work().await;
                }
                continue;
            }

            let batch = Arc::new(plan.descriptor);
            self.publish(LoopPhase::Dispatching);

            let result = match self.dispatch(&batch).await {
                Ok(result) => result,
                Err(failure) => return Err(self.escalate(&batch, failure)),
            };

            self.publish(LoopPhase::ApplyingResults);
            let tokens = self.state.apply(&batch, result)?;
            self.state.sweep_cancelled();

            debug!(
                step = batch.step,
                batch_size = batch.len(),
                tokens,
                outstanding = self.state.outstanding(),
                "Batch applied"
            );
        }
    }

    fn drain_submissions(&mut self) {
        loop {
            match self.rx.try_recv() {
                Ok(submission) => self.state.accept(submission),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    if !self.inbound_closed {
                        debug!("Submission channel closed");
                        self.inbound_closed = true;
                    }
                    break;
                }
            }
        }
    }

    /// The loop's only suspension point
    async fn wait_for_work(&mut self) {
        let idle = self.config.idle_timeout;
        let accepting = !self.inbound_closed;
        let event = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Wake::Shutdown,
            submission = self.rx.recv(), if accepting => Wake::Submission(submission),
            _ = self.wake.notified() => Wake::Notified,
            _ = tokio::time::sleep(idle) => Wake::Tick,
        };

        match event {
            Wake::Submission(Some(submission)) => self.state.accept(submission),
            Wake::Submission(None) => {
                debug!("Submission channel closed");
                self.inbound_closed = true;
            }
            Wake::Shutdown | Wake::Notified | Wake::Tick => {}
        }
    }

    /// Execute `batch`, retrying batch-wide errors within the retry budget.
    ///
    /// Timeouts are not retried: the timed-out call may still be running on
    /// the blocking pool and a second dispatch would put two batches in
    /// flight.
    async fn dispatch(&self, batch: &Arc<BatchDescriptor>) -> Result<BatchResult, DispatchFailure> {
        let retry = &self.config.dispatch_retry;
        let metrics = self.state_metrics();
        let _timer = DispatchTimer::start(metrics.clone(), batch.len());
        let mut attempts = 0;

        loop {
            attempts += 1;
            debug!(
                step = batch.step,
                batch_size = batch.len(),
                num_steps = batch.num_steps,
                attempt = attempts,
                "Dispatching batch"
            );

            let started = Instant::now();
            let error = match self.execute_once(batch).await {
                Ok(result) => {
                    debug!(
                        step = batch.step,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Batch executed"
                    );
                    return Ok(result);
                }
                Err(error) => error,
            };

            let retryable = !matches!(error, WorkerError::Timeout(_));
            if !retryable || attempts > retry.max_retries {
                return Err(DispatchFailure { error, attempts });
            }

            let delay = retry.retry_delay();
            warn!(
                step = batch.step,
                attempt = attempts,
                error = %error,
                delay_ms = delay.as_millis() as u64,
                "Batch dispatch failed, retrying"
            );
            if let Some(metrics) = &metrics {
                metrics.record_retry();
            }
            tokio::time::sleep(delay).await;
        }
    }

    async fn execute_once(&self, batch: &Arc<BatchDescriptor>) -> Result<BatchResult, WorkerError> {
        let worker = Arc::clone(&self.worker);
        let batch = Arc::clone(batch);
        let timeout = self.config.dispatch_timeout;

        let task = tokio::task::spawn_blocking(move || worker.execute(&batch));
        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(WorkerError::Internal(format!(
                "worker task aborted: {join_error}"
            ))),
            Err(_) => Err(WorkerError::Timeout(timeout)),
        }
    }

    /// Fail everything, tell the supervisor, and produce the error `run`
    /// returns
    fn escalate(&mut self, batch: &BatchDescriptor, failure: DispatchFailure) -> ForgeError {
        let failed_requests = self.state.fail_all(FailureReason::WorkerUnavailable);
        let fatal = FatalFailure {
            error: failure.error,
            step: batch.step,
            attempts: failure.attempts,
            failed_requests,
        };
        self.supervisor.on_fatal(&fatal);
        self.publish(LoopPhase::Stopped);
        ForgeError::WorkerUnavailable(fatal.error.to_string())
    }

    fn state_metrics(&self) -> Option<Arc<SchedulerMetrics>> {
        self.state.metrics().cloned()
    }

    fn publish(&self, phase: LoopPhase) -> SchedulerStats {
        let stats = self.state.snapshot(phase);
        self.stats_tx.send_replace(stats.clone());
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{FinishReason, RequestSpec, Termination};
    use crate::worker::{RequestOutput, SimulatedConfig};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct EchoWorker;

    impl ComputeWorker for EchoWorker {
        fn execute(&self, batch: &BatchDescriptor) -> Result<BatchResult, WorkerError> {
            Ok(BatchResult::new(
                batch
                    .entries
                    .iter()
                    .map(|e| RequestOutput::tokens(e.id.clone(), vec![e.seq_len as u32; e.num_tokens]))
                    .collect(),
            ))
        }
    }

    struct FlakyWorker {
        calls: AtomicUsize,
        failures: usize,
    }

    impl ComputeWorker for FlakyWorker {
        fn execute(&self, batch: &BatchDescriptor) -> Result<BatchResult, WorkerError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
                return Err(WorkerError::Unreachable("flap".to_string()));
            }
            EchoWorker.execute(batch)
        }
    }

    fn config() -> SchedulerConfig {
        SchedulerConfig::new()
            .with_page_size(1)
            .with_total_units(64)
            .with_max_sequences(8)
            .with_idle_timeout(Duration::from_millis(5))
            .with_dispatch_timeout(Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_builder_rejects_invalid_config() {
        let result = SchedulerBuilder::new(
            config().with_max_batch_size(0),
            WorkerBackend::Custom(Arc::new(EchoWorker)),
        )
        .build();
        assert!(matches!(result, Err(ForgeError::InvalidConfiguration(_))));
    }

    #[tokio::test]
    async fn test_request_runs_to_length() {
        let (scheduler, handle) =
            Scheduler::builder(config(), WorkerBackend::Custom(Arc::new(EchoWorker)))
                .build()
                .unwrap();
        let task = scheduler.spawn();

        let request = handle.submit(RequestSpec::new(vec![1, 2, 3], 4)).unwrap();
        let output = request.collect_output().await;
        assert_eq!(output.tokens, vec![3, 4, 5, 6]);
        assert_eq!(
            output.termination,
            Some(Termination::Completed(FinishReason::Length))
        );

        drop(handle);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_one_retry_recovers() {
        let worker = Arc::new(FlakyWorker {
            calls: AtomicUsize::new(0),
            failures: 1,
        });
        let (scheduler, handle) =
            Scheduler::builder(config(), WorkerBackend::Custom(worker.clone()))
                .build()
                .unwrap();
        let task = scheduler.spawn();

        let output = handle
            .submit(RequestSpec::new(vec![1], 1))
            .unwrap()
            .collect_output()
            .await;
        assert_eq!(output.tokens.len(), 1);
        assert_eq!(worker.calls.load(Ordering::SeqCst), 2);

        drop(handle);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_simulated_backend() {
        let (scheduler, handle) = Scheduler::builder(
            config(),
            WorkerBackend::Simulated(SimulatedConfig {
                base_latency: Duration::ZERO,
                per_token_latency: Duration::ZERO,
                ..SimulatedConfig::default()
            }),
        )
        .build()
        .unwrap();
        let task = scheduler.spawn();

        let output = handle
            .submit(RequestSpec::new(vec![5, 6], 3))
            .unwrap()
            .collect_output()
            .await;
        assert!(output.termination.is_some());
        assert!(output.tokens.len() <= 3);

        handle.shutdown();
        task.await.unwrap().unwrap();
    }
}
