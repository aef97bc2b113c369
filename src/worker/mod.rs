//! Compute worker port and built-in implementations
//!
//! The scheduler only sees `Arc<dyn ComputeWorker>`. Which implementation
//! backs it is decided once, at construction, through [`WorkerBackend`].

pub mod simulated;
pub mod types;

use std::fmt;
use std::sync::Arc;

pub use simulated::{SimulatedConfig, SimulatedWorker};
pub use types::{BatchResult, ComputeWorker, RequestOutput, StepOutcome, WorkerError};

/// Worker selection at scheduler construction time
pub enum WorkerBackend {
    Simulated(SimulatedConfig),
    /// Caller-provided worker (a real engine client, or a test double)
    Custom(Arc<dyn ComputeWorker>),
}

impl WorkerBackend {
    pub fn into_worker(self) -> Arc<dyn ComputeWorker> {
        match self {
            WorkerBackend::Simulated(config) => Arc::new(SimulatedWorker::new(config)),
            WorkerBackend::Custom(worker) => worker,
        }
    }
}

impl fmt::Debug for WorkerBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerBackend::Simulated(config) => f.debug_tuple("Simulated").field(config).finish(),
            WorkerBackend::Custom(worker) => f.debug_tuple("Custom").field(&worker.name()).finish(),
        }
    }
}

impl<W: ComputeWorker> From<Arc<W>> for WorkerBackend {
    fn from(worker: Arc<W>) -> Self {
        WorkerBackend::Custom(worker)
    }
}
