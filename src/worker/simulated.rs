//! In-process worker that fabricates tokens
//!
//! Used by the `batchforge-sim` binary and benches. Output is a pure
//! function of the batch and the configured seed, so runs are reproducible.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::types::{BatchResult, ComputeWorker, RequestOutput, StepOutcome, WorkerError};
use crate::batch::{BatchDescriptor, BatchEntry};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatedConfig {
    /// Fixed cost of every `execute` call
    pub base_latency: Duration,
    /// Additional cost per generated token
    pub per_token_latency: Duration,
    pub vocab_size: u32,
    /// Chance that any generated token ends the sequence
    pub eos_probability: f64,
    /// Chance that a request fails within a dispatch
    pub failure_probability: f64,
    pub seed: u64,
}

impl Default for SimulatedConfig {
    fn default() -> Self {
        SimulatedConfig {
            base_latency: Duration::from_millis(2),
            per_token_latency: Duration::from_micros(50),
            vocab_size: 32_000,
            eos_probability: 0.0,
            failure_probability: 0.0,
            seed: 0x5eed,
        }
    }
}

#[derive(Debug)]
pub struct SimulatedWorker {
    config: SimulatedConfig,
    batches: AtomicU64,
    tokens: AtomicU64,
}

impl SimulatedWorker {
    pub fn new(config: SimulatedConfig) -> Self {
        SimulatedWorker {
            config,
            batches: AtomicU64::new(0),
            tokens: AtomicU64::new(0),
        }
    }

    pub fn batches_executed(&self) -> u64 {
        self.batches.load(Ordering::Relaxed)
    }

    pub fn tokens_generated(&self) -> u64 {
        self.tokens.load(Ordering::Relaxed)
    }

    fn generate(&self, entry: &BatchEntry, rng: &mut StdRng) -> StepOutcome {
        if self.config.failure_probability > 0.0
            && rng.gen_bool(self.config.failure_probability.min(1.0))
        {
            return StepOutcome::Failed { code: 1 };
        }

        let vocab = self.config.vocab_size.max(1);
        let seed_token = entry.input_tokens.last().copied().unwrap_or_default();
        let mut tokens = Vec::with_capacity(entry.num_tokens);

        for i in 0..entry.num_tokens {
            let position = (entry.seq_len + i) as u32;
            let token = seed_token
                .wrapping_mul(31)
                .wrapping_add(position)
                .wrapping_add(entry.slot)
                % vocab;
            tokens.push(token);

            if self.config.eos_probability > 0.0
                && rng.gen_bool(self.config.eos_probability.min(1.0))
            {
                return StepOutcome::EndOfSequence { tokens };
            }
        }

        StepOutcome::Tokens(tokens)
    }
}

impl ComputeWorker for SimulatedWorker {
    fn name(&self) -> &str {
        "simulated"
    }

    fn execute(&self, batch: &BatchDescriptor) -> Result<BatchResult, WorkerError> {
        let mut rng = StdRng::seed_from_u64(self.config.seed ^ batch.step);

        let outputs: Vec<RequestOutput> = batch
            .entries
            .iter()
            .map(|entry| RequestOutput {
                id: entry.id.clone(),
                outcome: self.generate(entry, &mut rng),
            })
            .collect();

        let latency = self.config.base_latency
            + self.config.per_token_latency * batch.total_new_tokens() as u32;
        if !latency.is_zero() {
            std::thread::sleep(latency);
        }

        self.batches.fetch_add(1, Ordering::Relaxed);
        self.tokens
            .fetch_add(batch.total_new_tokens() as u64, Ordering::Relaxed);
        Ok(BatchResult::new(outputs))
    }
}
