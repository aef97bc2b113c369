//! Test doubles for the compute worker and supervisor ports

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use batchforge::batch::BatchDescriptor;
use batchforge::request::RequestId;
use batchforge::scheduler::{FatalFailure, Supervisor};
use batchforge::worker::{BatchResult, ComputeWorker, RequestOutput, StepOutcome, WorkerError};

type Script = dyn Fn(&BatchDescriptor, usize) -> Result<BatchResult, WorkerError> + Send + Sync;

// ============================================================================
// Scripts
// ============================================================================

/// Every entry gets `num_tokens` copies of its current sequence length
pub fn echo(batch: &BatchDescriptor, _call: usize) -> Result<BatchResult, WorkerError> {
    Ok(BatchResult::new(
        batch
            .entries
            .iter()
            .map(|e| RequestOutput::tokens(e.id.clone(), vec![e.seq_len as u32; e.num_tokens]))
            .collect(),
    ))
}

/// Batch-wide failure on every call
pub fn unreachable(_batch: &BatchDescriptor, _call: usize) -> Result<BatchResult, WorkerError> {
    Err(WorkerError::Unreachable("worker offline".to_string()))
}

/// Per-entry script: decide each request's outcome from its entry
pub fn per_entry<F>(f: F) -> impl Fn(&BatchDescriptor, usize) -> Result<BatchResult, WorkerError>
where
    F: Fn(&batchforge::batch::BatchEntry) -> Option<StepOutcome> + Send + Sync + 'static,
{
    move |batch: &BatchDescriptor, _call: usize| {
        Ok(BatchResult::new(
            batch
                .entries
                .iter()
                .filter_map(|e| {
                    f(e).map(|outcome| RequestOutput {
                        id: e.id.clone(),
                        outcome,
                    })
                })
                .collect(),
        ))
    }
}

// ============================================================================
// Gate
// ============================================================================

/// Holds the worker inside `execute` until opened
#[derive(Clone, Default)]
pub struct Gate {
    inner: Arc<GateInner>,
}

#[derive(Default)]
struct GateInner {
    open: Mutex<bool>,
    cv: Condvar,
    waiting: AtomicUsize,
}

impl Gate {
    pub fn new() -> Self {
        Self::default()
    }

    fn pass(&self) {
        self.inner.waiting.fetch_add(1, Ordering::SeqCst);
        let mut open = self.inner.open.lock().unwrap();
        while !*open {
            open = self.inner.cv.wait(open).unwrap();
        }
    }

    pub fn open(&self) {
        *self.inner.open.lock().unwrap() = true;
        self.inner.cv.notify_all();
    }

    /// Resolve once a worker call is parked at the gate
    pub async fn wait_for_waiter(&self) {
        while self.inner.waiting.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }
}

// ============================================================================
// Scripted worker
// ============================================================================

/// Worker driven by a script, recording every batch it receives
pub struct ScriptedWorker {
    script: Box<Script>,
    calls: AtomicUsize,
    in_flight: AtomicBool,
    overlaps: AtomicUsize,
    batches: Mutex<Vec<BatchDescriptor>>,
    delay: Duration,
    gate: Option<Gate>,
}

impl ScriptedWorker {
    pub fn new<F>(script: F) -> Self
    where
        F: Fn(&BatchDescriptor, usize) -> Result<BatchResult, WorkerError> + Send + Sync + 'static,
    {
        ScriptedWorker {
            script: Box::new(script),
            calls: AtomicUsize::new(0),
            in_flight: AtomicBool::new(false),
            overlaps: AtomicUsize::new(0),
            batches: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
            gate: None,
        }
    }

    /// Sleep this long inside every call
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Park every call at `gate` until it opens
    pub fn with_gate(mut self, gate: Gate) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Calls that started while another was still running
    pub fn overlaps(&self) -> usize {
        self.overlaps.load(Ordering::SeqCst)
    }

    pub fn batches(&self) -> Vec<BatchDescriptor> {
        self.batches.lock().unwrap().clone()
    }

    pub fn batch_ids(&self) -> Vec<Vec<String>> {
        self.batches()
            .iter()
            .map(|b| b.ids().map(|id| id.as_str().to_string()).collect())
            .collect()
    }

    /// Whether `id` was part of any dispatched batch
    pub fn dispatched(&self, id: &RequestId) -> bool {
        self.batches().iter().any(|b| b.contains(id))
    }
}

impl ComputeWorker for ScriptedWorker {
    fn name(&self) -> &str {
        "scripted"
    }

    fn execute(&self, batch: &BatchDescriptor) -> Result<BatchResult, WorkerError> {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.batches.lock().unwrap().push(batch.clone());

        if let Some(gate) = &self.gate {
            gate.pass();
        }
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }

        let result = (self.script)(batch, call);
        self.in_flight.store(false, Ordering::SeqCst);
        result
    }
}

// ============================================================================
// Supervisor
// ============================================================================

/// Records every escalation
#[derive(Default)]
pub struct CountingSupervisor {
    failures: Mutex<Vec<FatalFailure>>,
}

impl CountingSupervisor {
    pub fn count(&self) -> usize {
        self.failures.lock().unwrap().len()
    }

    pub fn last(&self) -> Option<FatalFailure> {
        self.failures.lock().unwrap().last().cloned()
    }
}

impl Supervisor for CountingSupervisor {
    fn on_fatal(&self, failure: &FatalFailure) {
        self.failures.lock().unwrap().push(failure.clone());
    }
}
