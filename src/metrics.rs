//! Prometheus-compatible scheduler metrics
//!
//! The scheduler loop updates these as it works; exporting them (an HTTP
//! `/metrics` endpoint, a push gateway) is left to the embedding process,
//! which calls [`SchedulerMetrics::encode_text`].

use std::fmt;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Instant;

use prometheus_client::{
    encoding::text::encode,
    metrics::counter::Counter,
    metrics::gauge::Gauge,
    metrics::histogram::{exponential_buckets, linear_buckets, Histogram},
    registry::Registry,
};

use crate::request::Termination;

/// Metrics for one scheduler instance
///
/// Updates are lock-free atomics; share it behind an `Arc`.
pub struct SchedulerMetrics {
    registry: Registry,

    pub requests_submitted: Counter<u64>,
    pub requests_rejected: Counter<u64>,
    pub requests_admitted: Counter<u64>,
    pub requests_completed: Counter<u64>,
    pub requests_cancelled: Counter<u64>,
    pub requests_failed: Counter<u64>,
    pub requests_evicted: Counter<u64>,
    pub deferrals: Counter<u64>,
    pub tokens_generated: Counter<u64>,
    pub dispatch_retries: Counter<u64>,

    pub queued_requests: Gauge<i64>,
    pub running_requests: Gauge<i64>,
    pub units_in_use: Gauge<i64>,
    pub unit_utilization: Gauge<f64, AtomicU64>,

    pub batch_size: Histogram,
    pub dispatch_duration_seconds: Histogram,
    pub time_to_first_token_seconds: Histogram,
}

impl SchedulerMetrics {
    pub fn new() -> Self {
        let mut registry = Registry::with_prefix("batchforge");

        let requests_submitted = Counter::default();
        registry.register(
            "requests_submitted",
            "Requests accepted by submit",
            requests_submitted.clone(),
        );

        let requests_rejected = Counter::default();
        registry.register(
            "requests_rejected",
            "Requests refused at submit (queue full or invalid)",
            requests_rejected.clone(),
        );

        let requests_admitted = Counter::default();
        registry.register(
            "requests_admitted",
            "Requests that acquired a sequence slot",
            requests_admitted.clone(),
        );

        let requests_completed = Counter::default();
        registry.register(
            "requests_completed",
            "Requests that finished normally",
            requests_completed.clone(),
        );

        let requests_cancelled = Counter::default();
        registry.register(
            "requests_cancelled",
            "Requests cancelled by client, disconnect or shutdown",
            requests_cancelled.clone(),
        );

        let requests_failed = Counter::default();
        registry.register(
            "requests_failed",
            "Requests that ended in failure, evictions included",
            requests_failed.clone(),
        );

        let requests_evicted = Counter::default();
        registry.register(
            "requests_evicted",
            "Requests evicted after sustained deferral",
            requests_evicted.clone(),
        );

        let deferrals = Counter::default();
        registry.register(
            "deferrals",
            "Times a request was left out of a batch for lack of units",
            deferrals.clone(),
        );

        let tokens_generated = Counter::default();
        registry.register(
            "tokens_generated",
            "Tokens applied to requests",
            tokens_generated.clone(),
        );

        let dispatch_retries = Counter::default();
        registry.register(
            "dispatch_retries",
            "Batch-wide dispatch failures that were retried",
            dispatch_retries.clone(),
        );

        let queued_requests = Gauge::default();
        registry.register(
            "queued_requests",
            "Requests waiting for admission",
            queued_requests.clone(),
        );

        let running_requests = Gauge::default();
        registry.register(
            "running_requests",
            "Requests holding a sequence slot",
            running_requests.clone(),
        );

        let units_in_use = Gauge::default();
        registry.register(
            "units_in_use",
            "Cache units currently reserved",
            units_in_use.clone(),
        );

        let unit_utilization = Gauge::<f64, AtomicU64>::default();
        registry.register(
            "unit_utilization",
            "Fraction of cache units reserved",
            unit_utilization.clone(),
        );

        let batch_size = Histogram::new(linear_buckets(1.0, 8.0, 16));
        registry.register(
            "batch_size",
            "Requests per dispatched batch",
            batch_size.clone(),
        );

        // Buckets: 1ms .. 100s
        let dispatch_duration_seconds = Histogram::new(exponential_buckets(0.001, 10.0, 6));
        registry.register(
            "dispatch_duration_seconds",
            "Wall time of one execute call, retries included",
            dispatch_duration_seconds.clone(),
        );

        let time_to_first_token_seconds = Histogram::new(exponential_buckets(0.001, 10.0, 6));
        registry.register(
            "time_to_first_token_seconds",
            "Submission to first delivered token",
            time_to_first_token_seconds.clone(),
        );

        SchedulerMetrics {
            registry,
            requests_submitted,
            requests_rejected,
            requests_admitted,
            requests_completed,
            requests_cancelled,
            requests_failed,
            requests_evicted,
            deferrals,
            tokens_generated,
            dispatch_retries,
            queued_requests,
            running_requests,
            units_in_use,
            unit_utilization,
            batch_size,
            dispatch_duration_seconds,
            time_to_first_token_seconds,
        }
    }

    pub fn record_submitted(&self) {
        self.requests_submitted.inc();
    }

    pub fn record_rejected(&self) {
        self.requests_rejected.inc();
    }

    pub fn record_admitted(&self) {
        self.requests_admitted.inc();
    }

    pub fn record_terminal(&self, termination: &Termination) {
        match termination {
            Termination::Completed(_) => self.requests_completed.inc(),
            Termination::Cancelled(_) => self.requests_cancelled.inc(),
            Termination::Failed(_) => self.requests_failed.inc(),
        };
    }

    pub fn record_evicted(&self) {
        self.requests_evicted.inc();
    }

    pub fn record_deferrals(&self, count: usize) {
        self.deferrals.inc_by(count as u64);
    }

    pub fn record_tokens(&self, count: usize) {
        self.tokens_generated.inc_by(count as u64);
    }

    pub fn record_retry(&self) {
        self.dispatch_retries.inc();
    }

    pub fn record_batch(&self, size: usize, duration_sec: f64) {
        self.batch_size.observe(size as f64);
        self.dispatch_duration_seconds.observe(duration_sec);
    }

    pub fn record_ttft(&self, duration_sec: f64) {
        self.time_to_first_token_seconds.observe(duration_sec);
    }

    pub fn set_occupancy(&self, queued: usize, running: usize, units_used: usize, total_units: usize) {
        self.queued_requests.set(queued as i64);
        self.running_requests.set(running as i64);
        self.units_in_use.set(units_used as i64);
        if total_units > 0 {
            self.unit_utilization
                .set(units_used as f64 / total_units as f64);
        }
    }

    /// Prometheus text exposition of every metric
    pub fn encode_text(&self) -> Result<String, fmt::Error> {
        let mut buffer = String::new();
        encode(&mut buffer, &self.registry)?;
        Ok(buffer)
    }
}

impl Default for SchedulerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SchedulerMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulerMetrics")
            .field("requests_submitted", &self.requests_submitted.get())
            .field("requests_completed", &self.requests_completed.get())
            .field("tokens_generated", &self.tokens_generated.get())
            .finish_non_exhaustive()
    }
}

/// Records dispatch wall time into the histogram when dropped
pub struct DispatchTimer {
    metrics: Option<Arc<SchedulerMetrics>>,
    batch_size: usize,
    start: Instant,
}

impl DispatchTimer {
    pub fn start(metrics: Option<Arc<SchedulerMetrics>>, batch_size: usize) -> Self {
        DispatchTimer {
            metrics,
            batch_size,
            start: Instant::now(),
        }
    }
}

impl Drop for DispatchTimer {
    fn drop(&mut self) {
        if let Some(metrics) = &self.metrics {
            metrics.record_batch(self.batch_size, self.start.elapsed().as_secs_f64());
        }
    }
}
