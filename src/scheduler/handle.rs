//! Producer-side handle to a running scheduler

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::queue::{QueueDepth, SchedulerStats};
use super::state::Submission;
use crate::config::SchedulerConfig;
use crate::error::{ForgeError, ForgeResult};
use crate::ledger::UnitPolicy;
use crate::metrics::SchedulerMetrics;
use crate::request::{Request, RequestId, RequestSpec};
use crate::stream::{continuation, RequestHandle};

/// Cheap-to-clone entry point for submitting and cancelling requests
///
/// Usable from any task or thread. When every handle is dropped the loop
/// finishes outstanding work and exits.
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    tx: mpsc::UnboundedSender<Submission>,
    depth: QueueDepth,
    next_seq: Arc<AtomicU64>,
    wake: Arc<Notify>,
    config: Arc<SchedulerConfig>,
    units: UnitPolicy,
    stats: watch::Receiver<SchedulerStats>,
    metrics: Option<Arc<SchedulerMetrics>>,
    shutdown: CancellationToken,
}

impl SchedulerHandle {
    pub(crate) fn new(
        tx: mpsc::UnboundedSender<Submission>,
        depth: QueueDepth,
        wake: Arc<Notify>,
        config: Arc<SchedulerConfig>,
        stats: watch::Receiver<SchedulerStats>,
        metrics: Option<Arc<SchedulerMetrics>>,
        shutdown: CancellationToken,
    ) -> Self {
        SchedulerHandle {
            tx,
            depth,
            next_seq: Arc::new(AtomicU64::new(0)),
            wake,
            units: UnitPolicy::new(config.page_size),
            config,
            stats,
            metrics,
            shutdown,
        }
    }

    /// Enqueue a request without blocking.
    ///
    /// Fails with `QueueFull` when `max_queue_depth` requests are already
    /// waiting for admission, with `InvalidRequest` for malformed specs or
    /// prompts larger than the whole ledger, and with `SchedulerStopped`
    /// once the loop has exited.
    pub fn submit(&self, spec: RequestSpec) -> ForgeResult<RequestHandle> {
        if let Err(e) = spec.validate() {
            self.record_rejected();
            return Err(e);
        }

        let units = self.units.units_for(spec.prompt.len() + 1);
        if units > self.config.total_units {
            self.record_rejected();
            return Err(ForgeError::InvalidRequest(format!(
                "prompt of {} tokens needs {} units, ledger holds {}",
                spec.prompt.len(),
                units,
                self.config.total_units
            )));
        }

        if self.tx.is_closed() {
            return Err(ForgeError::SchedulerStopped);
        }

        if let Err(depth) = self.depth.try_acquire() {
            debug!(depth, limit = self.depth.limit(), "Submission rejected, queue full");
            self.record_rejected();
            return Err(ForgeError::QueueFull {
                depth,
                limit: self.depth.limit(),
            });
        }

        let id = spec.id.clone().unwrap_or_else(RequestId::generate);
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let (output, flag, handle) =
            continuation(id.clone(), self.config.stream_buffer, Arc::clone(&self.wake));
        let request = Request::new(id.clone(), spec, seq, flag);

        if self.tx.send(Submission { request, output }).is_err() {
            self.depth.release();
            return Err(ForgeError::SchedulerStopped);
        }
        self.wake.notify_one();

        if let Some(metrics) = &self.metrics {
            metrics.record_submitted();
        }
        debug!(request_id = %id, seq, "Request submitted");
        Ok(handle)
    }

    /// Idempotent; same as [`RequestHandle::cancel`]
    pub fn cancel(&self, request: &RequestHandle) {
        request.cancel();
    }

    /// Latest snapshot published by the loop
    pub fn stats(&self) -> SchedulerStats {
        self.stats.borrow().clone()
    }

    /// Receiver that observes every published snapshot
    pub fn subscribe_stats(&self) -> watch::Receiver<SchedulerStats> {
        self.stats.clone()
    }

    pub fn metrics(&self) -> Option<&Arc<SchedulerMetrics>> {
        self.metrics.as_ref()
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Requests waiting for admission
    pub fn queue_depth(&self) -> usize {
        self.depth.current()
    }

    /// Stop the loop; outstanding requests end as `Cancelled(Shutdown)`
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_running(&self) -> bool {
        !self.tx.is_closed() && !self.shutdown.is_cancelled()
    }

    fn record_rejected(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.record_rejected();
        }
    }
}
