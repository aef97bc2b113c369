//! Request lifecycle: status state machine and mutable progress
//!
//! A [`Request`] is created at submission and is mutated only by the
//! scheduler loop. Every status change goes through
//! [`RequestStatus::can_transition_to`]; illegal moves are reported as
//! [`ForgeError::InvalidStateTransition`] and leave the request untouched.

use std::time::{Duration, Instant};

use serde::Serialize;

use super::types::{Priority, RequestId, RequestSpec};
use crate::error::{ForgeError, ForgeResult};
use crate::ledger::SlotHandle;
use crate::stream::CancelFlag;

/// Lifecycle status of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RequestStatus {
    Queued,
    Admitted,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl RequestStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestStatus::Completed | RequestStatus::Cancelled | RequestStatus::Failed
        )
    }

    /// Whether `self -> next` is an edge of the lifecycle graph
    pub fn can_transition_to(&self, next: RequestStatus) -> bool {
        use RequestStatus::*;
        matches!(
            (self, next),
            (Queued, Admitted)
                | (Queued, Cancelled)
                | (Queued, Failed)
                | (Admitted, Running)
                | (Admitted, Cancelled)
                | (Admitted, Failed)
                | (Running, Running)
                | (Running, Completed)
                | (Running, Cancelled)
                | (Running, Failed)
        )
    }
}

/// Why a request completed normally
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// Output budget exhausted
    Length,
    /// End-of-sequence token or worker end-of-sequence signal
    EndOfSequence,
}

/// Why a request was cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    /// Explicit cancel from the client
    Client,
    /// Output consumer dropped its stream
    Disconnected,
    /// Output consumer fell a full buffer behind
    SlowConsumer,
    /// Scheduler shut down with the request outstanding
    Shutdown,
}

/// Why a request failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// The worker reported a failure for this request only
    Worker { code: i32 },
    /// The worker returned no output for a dispatched request
    MissingOutput,
    /// Deferred past the eviction threshold
    ResourceStarvation,
    /// Batch-wide worker failure, retries exhausted
    WorkerUnavailable,
    /// Another outstanding request already uses this id
    DuplicateId,
}

/// Terminal outcome, delivered as the last event of every output stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum Termination {
    Completed(FinishReason),
    Cancelled(CancelReason),
    Failed(FailureReason),
}

impl Termination {
    pub fn status(&self) -> RequestStatus {
        match self {
            Termination::Completed(_) => RequestStatus::Completed,
            Termination::Cancelled(_) => RequestStatus::Cancelled,
            Termination::Failed(_) => RequestStatus::Failed,
        }
    }
}

/// A request tracked by the scheduler
#[derive(Debug)]
pub struct Request {
    id: RequestId,
    spec: RequestSpec,
    arrival: Instant,
    arrival_seq: u64,
    status: RequestStatus,
    generated: Vec<u32>,
    slot: Option<SlotHandle>,
    deferrals: u32,
    cancel: CancelFlag,
    admitted_at: Option<Instant>,
    first_token_at: Option<Instant>,
    finished_at: Option<Instant>,
    termination: Option<Termination>,
}

impl Request {
    pub fn new(id: RequestId, spec: RequestSpec, arrival_seq: u64, cancel: CancelFlag) -> Self {
        Request {
            id,
            spec,
            arrival: Instant::now(),
            arrival_seq,
            status: RequestStatus::Queued,
            generated: Vec::new(),
            slot: None,
            deferrals: 0,
            cancel,
            admitted_at: None,
            first_token_at: None,
            finished_at: None,
            termination: None,
        }
    }

    pub fn id(&self) -> &RequestId {
        &self.id
    }

    pub fn spec(&self) -> &RequestSpec {
        &self.spec
    }

    pub fn priority(&self) -> Priority {
        self.spec.priority
    }

    pub fn arrival(&self) -> Instant {
        self.arrival
    }

    pub fn arrival_seq(&self) -> u64 {
        self.arrival_seq
    }

    /// Scheduling order: priority class, then arrival, then submission order
    pub fn schedule_key(&self) -> (Priority, Instant, u64) {
        (self.spec.priority, self.arrival, self.arrival_seq)
    }

    pub fn status(&self) -> RequestStatus {
        self.status
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn termination(&self) -> Option<Termination> {
        self.termination
    }

    pub fn generated(&self) -> &[u32] {
        &self.generated
    }

    pub fn prompt_len(&self) -> usize {
        self.spec.prompt.len()
    }

    /// Current sequence length: prompt plus generated tokens
    pub fn seq_len(&self) -> usize {
        self.spec.prompt.len() + self.generated.len()
    }

    /// Output tokens still allowed
    pub fn remaining(&self) -> usize {
        self.spec.max_output_len.saturating_sub(self.generated.len())
    }

    pub fn slot_index(&self) -> Option<u32> {
        self.slot.as_ref().map(SlotHandle::index)
    }

    pub fn deferrals(&self) -> u32 {
        self.deferrals
    }

    pub fn cancel_flag(&self) -> &CancelFlag {
        &self.cancel
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel.is_set()
    }

    pub fn queue_time(&self) -> Option<Duration> {
        self.admitted_at.map(|t| t.duration_since(self.arrival))
    }

    pub fn time_to_first_token(&self) -> Option<Duration> {
        self.first_token_at.map(|t| t.duration_since(self.arrival))
    }

    pub fn total_time(&self) -> Option<Duration> {
        self.finished_at.map(|t| t.duration_since(self.arrival))
    }

    fn transition(&mut self, next: RequestStatus) -> ForgeResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(ForgeError::InvalidStateTransition {
                id: self.id.clone(),
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// `Queued -> Admitted`, taking ownership of the sequence slot
    pub fn admit(&mut self, slot: SlotHandle) -> ForgeResult<()> {
        self.transition(RequestStatus::Admitted)?;
        self.slot = Some(slot);
        self.admitted_at = Some(Instant::now());
        Ok(())
    }

    /// `Admitted -> Running` on the first applied step, `Running -> Running` after
    pub fn mark_running(&mut self) -> ForgeResult<()> {
        self.transition(RequestStatus::Running)
    }

    /// Append one generated token.
    ///
    /// Returns `Ok(false)` without appending once the output budget is spent.
    pub fn append_token(&mut self, token: u32) -> ForgeResult<bool> {
        if self.status != RequestStatus::Running {
            return Err(ForgeError::InvalidStateTransition {
                id: self.id.clone(),
                from: self.status,
                to: RequestStatus::Running,
            });
        }
        if self.remaining() == 0 {
            return Ok(false);
        }
        if self.first_token_at.is_none() {
            self.first_token_at = Some(Instant::now());
        }
        self.generated.push(token);
        Ok(true)
    }

    /// Move to a terminal status and drop the slot handle.
    ///
    /// The caller releases the ledger entry in the same step.
    pub fn finish(&mut self, termination: Termination) -> ForgeResult<()> {
        self.transition(termination.status())?;
        self.slot = None;
        self.termination = Some(termination);
        self.finished_at = Some(Instant::now());
        Ok(())
    }

    /// Count one more consecutive deferral, returning the new count
    pub fn record_deferral(&mut self) -> u32 {
        self.deferrals = self.deferrals.saturating_add(1);
        self.deferrals
    }

    pub fn reset_deferrals(&mut self) {
        self.deferrals = 0;
    }
}
