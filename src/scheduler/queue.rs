//! Admission queue accounting and scheduler statistics

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::Serialize;

/// Counts requests accepted by `submit` but not yet admitted
///
/// Shared between every handle and the scheduler loop. Submitters acquire,
/// the loop releases when a request is admitted or ends while queued.
#[derive(Debug, Clone)]
pub struct QueueDepth {
    current: Arc<AtomicUsize>,
    limit: usize,
}

impl QueueDepth {
    pub fn new(limit: usize) -> Self {
        QueueDepth {
            current: Arc::new(AtomicUsize::new(0)),
            limit,
        }
    }

    /// Take one place in the queue; `Err` carries the depth seen when full
    pub fn try_acquire(&self) -> Result<(), usize> {
        self.current
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |depth| {
                (depth < self.limit).then_some(depth + 1)
            })
            .map(|_| ())
    }

    pub fn release(&self) {
        // Saturating: never wraps below zero
        let _ = self
            .current
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |depth| {
                depth.checked_sub(1)
            });
    }

    pub fn current(&self) -> usize {
        self.current.load(Ordering::Acquire)
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}

/// What the loop is doing right now
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopPhase {
    #[default]
    Idle,
    Dispatching,
    ApplyingResults,
    Stopped,
}

/// Snapshot published by the scheduler loop after every phase change
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SchedulerStats {
    pub phase: LoopPhase,
    pub queued_requests: usize,
    pub admitted_requests: usize,
    pub running_requests: usize,
    pub units_used: usize,
    pub units_total: usize,
    pub active_sequences: usize,
    pub iterations: u64,
    pub batches_dispatched: u64,
    pub tokens_generated: u64,
    pub completed_requests: u64,
    pub cancelled_requests: u64,
    pub failed_requests: u64,
    pub evicted_requests: u64,
    pub deferrals: u64,
}

impl SchedulerStats {
    /// Requests holding a sequence slot (admitted + running)
    pub fn active_requests(&self) -> usize {
        self.admitted_requests + self.running_requests
    }

    /// Requests the scheduler still owes an outcome
    pub fn outstanding_requests(&self) -> usize {
        self.queued_requests + self.active_requests()
    }

    pub fn is_empty(&self) -> bool {
        self.outstanding_requests() == 0
    }

    /// Requests that reached a terminal state
    pub fn finished_requests(&self) -> u64 {
        self.completed_requests + self.cancelled_requests + self.failed_requests
    }

    pub fn utilization(&self) -> f64 {
        if self.units_total == 0 {
            return 0.0;
        }
        self.units_used as f64 / self.units_total as f64
    }
}
