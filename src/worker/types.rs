//! Compute worker port: the trait and the data crossing it

use std::time::Duration;

use thiserror::Error;

use crate::batch::BatchDescriptor;
use crate::request::RequestId;

/// Batch-wide worker failures
///
/// Any of these fails the whole batch. Per-request failures are reported
/// inside [`BatchResult`] instead.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WorkerError {
    #[error("worker unreachable: {0}")]
    Unreachable(String),

    #[error("worker did not answer within {0:?}")]
    Timeout(Duration),

    #[error("worker internal error: {0}")]
    Internal(String),
}

/// What one request got out of a dispatch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// Newly generated tokens, in order
    Tokens(Vec<u32>),
    /// The sequence ended; `tokens` were produced before the end signal
    EndOfSequence { tokens: Vec<u32> },
    /// This request failed; the rest of the batch is unaffected
    Failed { code: i32 },
}

impl StepOutcome {
    pub fn end_of_sequence() -> Self {
        StepOutcome::EndOfSequence { tokens: Vec::new() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestOutput {
    pub id: RequestId,
    pub outcome: StepOutcome,
}

impl RequestOutput {
    pub fn tokens(id: RequestId, tokens: Vec<u32>) -> Self {
        RequestOutput {
            id,
            outcome: StepOutcome::Tokens(tokens),
        }
    }
}

/// Worker answer for a whole batch, one output per dispatched request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchResult {
    pub outputs: Vec<RequestOutput>,
}

impl BatchResult {
    pub fn new(outputs: Vec<RequestOutput>) -> Self {
        BatchResult { outputs }
    }

    /// Remove and return the output for `id`, if the worker produced one
    pub fn take(&mut self, id: &RequestId) -> Option<StepOutcome> {
        let pos = self.outputs.iter().position(|o| &o.id == id)?;
        Some(self.outputs.swap_remove(pos).outcome)
    }
}

/// The external compute engine
///
/// `execute` is blocking; the scheduler runs it on the blocking pool under
/// a timeout and never calls it concurrently.
pub trait ComputeWorker: Send + Sync + 'static {
    fn name(&self) -> &str {
        "worker"
    }

    fn execute(&self, batch: &BatchDescriptor) -> Result<BatchResult, WorkerError>;
}
