//! Single-writer scheduler state and the per-iteration steps
//!
//! [`SchedulerState`] owns every request, the slot ledger and the batch
//! builder. Only the scheduler loop holds it, and every step takes
//! `&mut self`, so no locking is needed. Producers reach it through the
//! submission channel and the per-request cancel flags.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, error, warn};

use super::queue::{LoopPhase, QueueDepth, SchedulerStats};
use crate::batch::{BatchBuilder, BatchDescriptor, BatchPlan};
use crate::config::SchedulerConfig;
use crate::error::ForgeResult;
use crate::ledger::SlotLedger;
use crate::metrics::SchedulerMetrics;
use crate::request::{
    CancelReason, FailureReason, FinishReason, Request, RequestId, RequestStatus, Termination,
};
use crate::stream::{ContinuationSender, PushOutcome};
use crate::worker::{BatchResult, StepOutcome};

/// A request plus its output channel, as sent from a handle to the loop
#[derive(Debug)]
pub struct Submission {
    pub request: Request,
    pub output: ContinuationSender,
}

#[derive(Debug)]
struct Tracked {
    request: Request,
    output: ContinuationSender,
    /// Why the loop itself set the cancel flag; `None` means the client did
    cancel_reason: Option<CancelReason>,
}

impl Tracked {
    fn flag_cancel(&mut self, reason: CancelReason) {
        if self.request.cancel_flag().set() {
            self.cancel_reason = Some(reason);
        }
    }

    /// Append and forward worker tokens.
    ///
    /// Returns the number of tokens applied and the termination they
    /// caused, if any. Tokens past the output budget or after the
    /// end-of-sequence token are discarded.
    fn deliver(
        &mut self,
        tokens: &[u32],
        metrics: Option<&SchedulerMetrics>,
    ) -> ForgeResult<(usize, Option<Termination>)> {
        let eos = self.request.spec().sampling.eos_token;
        let mut applied = 0;

        for &token in tokens {
            if self.request.cancel_requested() {
                return Ok((applied, None));
            }
            if eos == Some(token) {
                return Ok((applied, Some(Termination::Completed(FinishReason::EndOfSequence))));
            }
            if !self.request.append_token(token)? {
                break;
            }
            applied += 1;

            if self.request.generated().len() == 1 {
                if let (Some(metrics), Some(ttft)) = (metrics, self.request.time_to_first_token()) {
                    metrics.record_ttft(ttft.as_secs_f64());
                }
            }

            match self.output.push(token) {
                PushOutcome::Delivered => {}
                PushOutcome::Disconnected => {
                    self.flag_cancel(CancelReason::Disconnected);
                    return Ok((applied, None));
                }
                PushOutcome::Overflow => {
                    warn!(
                        request_id = %self.request.id(),
                        delivered = self.output.delivered(),
                        "Output consumer fell behind, cancelling"
                    );
                    self.flag_cancel(CancelReason::SlowConsumer);
                    return Ok((applied, None));
                }
            }
        }

        if self.request.remaining() == 0 {
            return Ok((applied, Some(Termination::Completed(FinishReason::Length))));
        }
        Ok((applied, None))
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    iterations: u64,
    batches: u64,
    tokens: u64,
    completed: u64,
    cancelled: u64,
    failed: u64,
    evicted: u64,
}

/// Everything the scheduler loop mutates
#[derive(Debug)]
pub struct SchedulerState {
    config: SchedulerConfig,
    ledger: SlotLedger,
    builder: BatchBuilder,
    requests: HashMap<RequestId, Tracked>,
    depth: QueueDepth,
    metrics: Option<Arc<SchedulerMetrics>>,
    counters: Counters,
}

impl SchedulerState {
    pub fn new(
        config: SchedulerConfig,
        depth: QueueDepth,
        metrics: Option<Arc<SchedulerMetrics>>,
    ) -> Self {
        SchedulerState {
            ledger: SlotLedger::from_config(&config),
            builder: BatchBuilder::new(&config),
            config,
            requests: HashMap::new(),
            depth,
            metrics,
            counters: Counters::default(),
        }
    }

    pub fn metrics(&self) -> Option<&Arc<SchedulerMetrics>> {
        self.metrics.as_ref()
    }

    pub fn ledger(&self) -> &SlotLedger {
        &self.ledger
    }

    pub fn request(&self, id: &RequestId) -> Option<&Request> {
        self.requests.get(id).map(|t| &t.request)
    }

    /// Requests not yet terminal
    pub fn outstanding(&self) -> usize {
        self.requests.len()
    }

    pub fn has_work(&self) -> bool {
        !self.requests.is_empty()
    }

    fn count_status(&self, pred: impl Fn(RequestStatus) -> bool) -> usize {
        self.requests
            .values()
            .filter(|t| pred(t.request.status()))
            .count()
    }

    /// Take ownership of a submitted request
    pub fn accept(&mut self, submission: Submission) {
        let Submission {
            mut request,
            mut output,
        } = submission;

        if self.requests.contains_key(request.id()) {
            warn!(request_id = %request.id(), "Duplicate request id, rejecting");
            self.depth.release();
            let termination = Termination::Failed(FailureReason::DuplicateId);
            if request.finish(termination).is_ok() {
                output.finish(termination);
            }
            self.record_terminal(&termination);
            return;
        }

        debug!(
            request_id = %request.id(),
            prompt_len = request.prompt_len(),
            max_output_len = request.spec().max_output_len,
            priority = %request.priority(),
            "Request queued"
        );
        self.requests.insert(
            request.id().clone(),
            Tracked {
                request,
                output,
                cancel_reason: None,
            },
        );
    }

    /// Move a request to a terminal state, release its ledger entry, push
    /// its end marker and drop it from the table.
    ///
    /// Returns `false` if the id is unknown.
    pub fn terminate(&mut self, id: &RequestId, termination: Termination) -> bool {
        let Some(mut tracked) = self.requests.remove(id) else {
            return false;
        };

        let was_queued = tracked.request.status() == RequestStatus::Queued;
        if let Err(e) = tracked.request.finish(termination) {
            // Terminal requests are never left in the table
            error!(request_id = %id, error = %e, "Request in unexpected state at termination");
        }
        if was_queued {
            self.depth.release();
        }

        let freed_units = self.ledger.release(id);
        let delivered = tracked.output.finish(termination);
        self.record_terminal(&termination);

        debug!(
            request_id = %id,
            ?termination,
            freed_units,
            generated = tracked.request.generated().len(),
            delivered,
            "Request finished"
        );
        true
    }

    fn record_terminal(&mut self, termination: &Termination) {
        match termination {
            Termination::Completed(_) => self.counters.completed += 1,
            Termination::Cancelled(_) => self.counters.cancelled += 1,
            Termination::Failed(_) => self.counters.failed += 1,
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_terminal(termination);
        }
    }

    /// Cancel every request whose flag is set, including requests whose
    /// consumer has dropped its stream. Returns how many were cancelled.
    pub fn sweep_cancelled(&mut self) -> usize {
        for tracked in self.requests.values_mut() {
            if tracked.output.is_disconnected() {
                tracked.flag_cancel(CancelReason::Disconnected);
            }
        }

        let cancelled: Vec<(RequestId, CancelReason)> = self
            .requests
            .values()
            .filter(|t| t.request.cancel_requested())
            .map(|t| {
                (
                    t.request.id().clone(),
                    t.cancel_reason.unwrap_or(CancelReason::Client),
                )
            })
            .collect();

        for (id, reason) in &cancelled {
            self.terminate(id, Termination::Cancelled(*reason));
        }
        cancelled.len()
    }

    /// Admit queued requests in scheduling order.
    ///
    /// Each needs a sequence slot plus units for its prompt and first
    /// token. The first request that does not fit stops admission so a
    /// large request at the head is not overtaken by smaller ones. While
    /// free units are under the watermark and requests are running,
    /// nothing is admitted.
    pub fn admit(&mut self) -> ForgeResult<usize> {
        let active = self.count_status(|s| matches!(s, RequestStatus::Admitted | RequestStatus::Running));
        if active > 0 && self.ledger.free_fraction() < self.config.admission_watermark {
            debug!(
                active,
                free_fraction = self.ledger.free_fraction(),
                "Admission paused below watermark"
            );
            return Ok(0);
        }

        let mut queued: Vec<_> = self
            .requests
            .values()
            .filter(|t| t.request.status() == RequestStatus::Queued && !t.request.cancel_requested())
            .map(|t| (t.request.schedule_key(), t.request.id().clone()))
            .collect();
        queued.sort_by(|a, b| a.0.cmp(&b.0));

        let policy = self.builder.unit_policy();
        let mut admitted = 0;

        for (_, id) in queued {
            let Some(tracked) = self.requests.get_mut(&id) else {
                continue;
            };
            let units = policy.units_for(tracked.request.prompt_len() + 1);

            let Some(slot) = self.ledger.try_admit(&id, units) else {
                debug!(
                    request_id = %id,
                    units,
                    available = self.ledger.available(),
                    free_sequences = self.ledger.free_sequences(),
                    "Admission blocked at head of queue"
                );
                break;
            };

            if let Err(e) = tracked.request.admit(slot) {
                self.ledger.release(&id);
                return Err(e);
            }
            self.depth.release();
            admitted += 1;

            debug!(
                request_id = %id,
                units,
                queue_ms = tracked.request.queue_time().map(|d| d.as_millis() as u64),
                "Request admitted"
            );
            if let Some(metrics) = &self.metrics {
                metrics.record_admitted();
            }
        }

        Ok(admitted)
    }

    /// Select the next batch and reserve its units
    pub fn build(&mut self) -> BatchPlan {
        let plan = self.builder.build(
            self.requests.values_mut().map(|t| &mut t.request),
            &mut self.ledger,
        );
        if let Some(metrics) = &self.metrics {
            if !plan.deferred.is_empty() {
                metrics.record_deferrals(plan.deferred.len());
            }
        }
        plan
    }

    /// Fail a request chosen to relieve sustained deferral
    pub fn evict(&mut self, victim: &RequestId) -> bool {
        let deferrals = self.request(victim).map(Request::deferrals).unwrap_or_default();
        if !self.terminate(victim, Termination::Failed(FailureReason::ResourceStarvation)) {
            return false;
        }

        self.counters.evicted += 1;
        warn!(
            request_id = %victim,
            deferrals,
            total_evicted = self.counters.evicted,
            total_deferrals = self.builder.total_deferrals(),
            "Evicting request after sustained deferral"
        );
        if let Some(metrics) = &self.metrics {
            metrics.record_evicted();
        }
        true
    }

    /// Apply worker output in descriptor order.
    ///
    /// A request with no output in `result` fails on its own; the rest of
    /// the batch proceeds. Returns the number of tokens applied.
    pub fn apply(&mut self, batch: &BatchDescriptor, mut result: BatchResult) -> ForgeResult<usize> {
        self.counters.batches += 1;
        let metrics = self.metrics.clone();
        let mut applied = 0;

        for entry in &batch.entries {
            let outcome = result.take(&entry.id);
            let Some(tracked) = self.requests.get_mut(&entry.id) else {
                continue;
            };

            let termination = match outcome {
                None => {
                    warn!(request_id = %entry.id, step = batch.step, "Worker returned no output for request");
                    Some(Termination::Failed(FailureReason::MissingOutput))
                }
                Some(StepOutcome::Failed { code }) => {
                    warn!(request_id = %entry.id, step = batch.step, code, "Worker failed request");
                    Some(Termination::Failed(FailureReason::Worker { code }))
                }
                Some(StepOutcome::Tokens(tokens)) => {
                    tracked.request.mark_running()?;
                    let tokens = &tokens[..tokens.len().min(entry.num_tokens)];
                    let (n, termination) = tracked.deliver(tokens, metrics.as_deref())?;
                    applied += n;
                    termination
                }
                Some(StepOutcome::EndOfSequence { tokens }) => {
                    tracked.request.mark_running()?;
                    let tokens = &tokens[..tokens.len().min(entry.num_tokens)];
                    let (n, termination) = tracked.deliver(tokens, metrics.as_deref())?;
                    applied += n;
                    if tracked.request.cancel_requested() {
                        termination
                    } else {
                        termination.or(Some(Termination::Completed(FinishReason::EndOfSequence)))
                    }
                }
            };

            if let Some(termination) = termination {
                self.terminate(&entry.id, termination);
            }
        }

        if !result.outputs.is_empty() {
            warn!(
                step = batch.step,
                unexpected = result.outputs.len(),
                "Worker returned output for requests outside the batch"
            );
        }

        self.counters.tokens += applied as u64;
        if let Some(metrics) = &self.metrics {
            metrics.record_tokens(applied);
        }
        Ok(applied)
    }

    /// Fail every outstanding request with `reason`
    pub fn fail_all(&mut self, reason: FailureReason) -> usize {
        let ids: Vec<RequestId> = self.requests.keys().cloned().collect();
        for id in &ids {
            self.terminate(id, Termination::Failed(reason));
        }
        ids.len()
    }

    /// Cancel every outstanding request with `reason`
    pub fn cancel_all(&mut self, reason: CancelReason) -> usize {
        let ids: Vec<RequestId> = self.requests.keys().cloned().collect();
        for id in &ids {
            self.terminate(id, Termination::Cancelled(reason));
        }
        ids.len()
    }

    pub fn record_iteration(&mut self) {
        self.counters.iterations += 1;
    }

    /// Current statistics; also refreshes the occupancy gauges
    pub fn snapshot(&self, phase: LoopPhase) -> SchedulerStats {
        let stats = SchedulerStats {
            phase,
            queued_requests: self.count_status(|s| s == RequestStatus::Queued),
            admitted_requests: self.count_status(|s| s == RequestStatus::Admitted),
            running_requests: self.count_status(|s| s == RequestStatus::Running),
            units_used: self.ledger.total_reserved(),
            units_total: self.ledger.total_units(),
            active_sequences: self.ledger.active_sequences(),
            iterations: self.counters.iterations,
            batches_dispatched: self.counters.batches,
            tokens_generated: self.counters.tokens,
            completed_requests: self.counters.completed,
            cancelled_requests: self.counters.cancelled,
            failed_requests: self.counters.failed,
            evicted_requests: self.counters.evicted,
            deferrals: self.builder.total_deferrals(),
        };

        if let Some(metrics) = &self.metrics {
            metrics.set_occupancy(
                stats.queued_requests,
                stats.active_requests(),
                stats.units_used,
                stats.units_total,
            );
        }
        stats
    }
}
