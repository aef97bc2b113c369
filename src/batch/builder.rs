//! Batch selection under cache pressure
//!
//! Candidates are `Admitted`/`Running` requests whose cancel flag is clear.
//! They are walked in scheduling order (priority class, arrival, submission
//! sequence). Each one reserves the units its next step needs; the first
//! reservation that fails closes the batch, and that candidate plus every
//! later one is deferred. Candidates skipped only because the batch is full
//! or the prompt token budget is spent are not deferred.
//!
//! Once any deferred candidate has waited past the deferral threshold, the
//! newest, lowest-priority deferred candidate is named for eviction. One
//! victim per build: the next build re-checks whether the head now fits.

use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::descriptor::{BatchDescriptor, BatchEntry};
use crate::config::SchedulerConfig;
use crate::ledger::{SlotLedger, UnitPolicy};
use crate::request::{Request, RequestId, RequestStatus};

/// Minimum spacing between resource-pressure warnings
const PRESSURE_LOG_INTERVAL: Duration = Duration::from_secs(1);

/// Outcome of one build
#[derive(Debug, Default)]
pub struct BatchPlan {
    pub descriptor: BatchDescriptor,
    /// Candidates excluded for lack of units this iteration
    pub deferred: Vec<RequestId>,
    /// Request the caller must evict so starved requests can make progress
    pub victim: Option<RequestId>,
    /// Prefill candidates left for a later batch by the prompt token budget
    pub prefill_held: usize,
}

/// Rate-limited reporting of deferrals
#[derive(Debug, Default)]
struct PressureLog {
    last_logged: Option<Instant>,
    total_deferrals: u64,
}

impl PressureLog {
    fn record(&mut self, deferred: usize, available_units: usize) {
        self.total_deferrals += deferred as u64;
        let now = Instant::now();
        let due = self
            .last_logged
            .map_or(true, |t| now.duration_since(t) >= PRESSURE_LOG_INTERVAL);
        if due {
            warn!(
                deferred,
                available_units,
                total_deferrals = self.total_deferrals,
                "Requests deferred: not enough cache units"
            );
            self.last_logged = Some(now);
        }
    }
}

/// Builds one [`BatchDescriptor`] per scheduler iteration
#[derive(Debug)]
pub struct BatchBuilder {
    max_batch_size: usize,
    max_steps_per_batch: usize,
    max_prefill_tokens: usize,
    deferral_threshold: u32,
    units: UnitPolicy,
    next_step: u64,
    pressure: PressureLog,
}

impl BatchBuilder {
    pub fn new(config: &SchedulerConfig) -> Self {
        BatchBuilder {
            max_batch_size: config.max_batch_size,
            max_steps_per_batch: config.max_steps_per_batch.max(1),
            max_prefill_tokens: config.max_prefill_tokens.max(1),
            deferral_threshold: config.deferral_threshold,
            units: UnitPolicy::new(config.page_size),
            next_step: 0,
            pressure: PressureLog::default(),
        }
    }

    pub fn unit_policy(&self) -> UnitPolicy {
        self.units
    }

    /// Deferrals recorded since construction
    pub fn total_deferrals(&self) -> u64 {
        self.pressure.total_deferrals
    }

    /// Select the next batch, reserving units for every included request.
    ///
    /// An empty descriptor means there is nothing runnable.
    pub fn build<'a, I>(&mut self, requests: I, ledger: &mut SlotLedger) -> BatchPlan
    where
        I: IntoIterator<Item = &'a mut Request>,
    {
        let mut candidates: Vec<&mut Request> = requests
            .into_iter()
            .filter(|r| {
                matches!(r.status(), RequestStatus::Admitted | RequestStatus::Running)
                    && !r.cancel_requested()
                    && r.remaining() > 0
            })
            .collect();

        if candidates.is_empty() {
            return BatchPlan::default();
        }

        candidates.sort_by_key(|r| r.schedule_key());

        // Multi-step dispatch: enough steps for the longest remaining budget,
        // capped by configuration
        let num_steps = candidates
            .iter()
            .map(|r| r.remaining())
            .max()
            .unwrap_or(1)
            .clamp(1, self.max_steps_per_batch);

        let mut plan = BatchPlan::default();
        let mut blocked = false;
        let mut starving = false;
        let mut prefill_tokens = 0;

        for request in candidates {
            if !blocked && plan.descriptor.entries.len() >= self.max_batch_size {
                break;
            }

            if !blocked {
                let prefill = request.generated().is_empty();
                if prefill && prefill_tokens >= self.max_prefill_tokens {
                    plan.prefill_held += 1;
                    continue;
                }

                let steps = num_steps.min(request.remaining());
                let need = self
                    .units
                    .additional_units(ledger.reserved_for(request.id()), request.seq_len() + steps);

                if ledger.try_reserve(request.id(), need) {
                    request.reset_deferrals();
                    if prefill {
                        prefill_tokens += request.prompt_len();
                    }
                    plan.descriptor.entries.push(entry_for(request, steps));
                    continue;
                }

                debug!(
                    request_id = %request.id(),
                    need,
                    available = ledger.available(),
                    "Reservation failed, closing batch"
                );
                blocked = true;
            }

            starving |= request.record_deferral() > self.deferral_threshold;
            plan.deferred.push(request.id().clone());
        }

        // Deferred ids are in scheduling order, so the last is the newest
        // request of the lowest priority class present
        if starving {
            plan.victim = plan.deferred.last().cloned();
        }
        if plan.prefill_held > 0 {
            debug!(
                held = plan.prefill_held,
                prefill_tokens,
                budget = self.max_prefill_tokens,
                "Prompt token budget reached"
            );
        }

        if !plan.deferred.is_empty() {
            self.pressure.record(plan.deferred.len(), ledger.available());
        }

        if !plan.descriptor.entries.is_empty() {
            plan.descriptor.step = self.next_step;
            plan.descriptor.num_steps = num_steps;
            self.next_step += 1;
        }

        plan
    }
}

fn entry_for(request: &Request, num_tokens: usize) -> BatchEntry {
    let input_tokens = match request.generated().last() {
        Some(&last) => vec![last],
        None => request.spec().prompt.clone(),
    };
    BatchEntry {
        id: request.id().clone(),
        seq_len: request.seq_len(),
        slot: request.slot_index().unwrap_or_default(),
        input_tokens,
        num_tokens,
        sampling: request.spec().sampling.clone(),
    }
}
