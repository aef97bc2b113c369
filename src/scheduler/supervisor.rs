//! Escalation port for unrecoverable worker failures

use serde::Serialize;
use tracing::error;

use crate::worker::WorkerError;

/// Details of the failure that stopped the scheduler
#[derive(Debug, Clone, Serialize)]
pub struct FatalFailure {
    #[serde(serialize_with = "serialize_display")]
    pub error: WorkerError,
    /// Batch step that could not be executed
    pub step: u64,
    /// Dispatch attempts made for that batch
    pub attempts: usize,
    /// Requests moved to `Failed` as a consequence
    pub failed_requests: usize,
}

fn serialize_display<S: serde::Serializer>(
    error: &WorkerError,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.collect_str(error)
}

/// Receives batch-wide failures; invoked at most once per scheduler
pub trait Supervisor: Send + Sync {
    fn on_fatal(&self, failure: &FatalFailure);
}

/// Default supervisor: logs and lets the caller react to `run` returning
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSupervisor;

impl Supervisor for LogSupervisor {
    fn on_fatal(&self, failure: &FatalFailure) {
        error!(
            step = failure.step,
            attempts = failure.attempts,
            failed_requests = failure.failed_requests,
            error = %failure.error,
            "Compute worker unavailable, scheduler stopping"
        );
    }
}
