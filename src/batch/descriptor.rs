//! Immutable description of one compute step handed to the worker

use crate::request::{RequestId, SamplingParams};

/// One request's participation in a batch
#[derive(Debug, Clone, PartialEq)]
pub struct BatchEntry {
    pub id: RequestId,
    /// Sequence length before this step (prompt + generated)
    pub seq_len: usize,
    /// Sequence slot owned by the request
    pub slot: u32,
    /// Tokens the worker has not seen yet: the prompt on the first step,
    /// the last generated token afterwards
    pub input_tokens: Vec<u32>,
    /// Tokens to produce for this request in this dispatch
    pub num_tokens: usize,
    pub sampling: SamplingParams,
}

/// Batch handed to [`ComputeWorker::execute`](crate::worker::ComputeWorker::execute)
///
/// Built fresh every iteration and never mutated after dispatch; the
/// scheduler shares it behind an `Arc`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BatchDescriptor {
    /// Monotonic batch counter
    pub step: u64,
    /// Upper bound on tokens any entry produces in this dispatch
    pub num_steps: usize,
    pub entries: Vec<BatchEntry>,
}

impl BatchDescriptor {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &RequestId> {
        self.entries.iter().map(|e| &e.id)
    }

    pub fn contains(&self, id: &RequestId) -> bool {
        self.entries.iter().any(|e| &e.id == id)
    }

    /// Tokens the worker is asked to produce in total
    pub fn total_new_tokens(&self) -> usize {
        self.entries.iter().map(|e| e.num_tokens).sum()
    }

    pub fn max_sequence_length(&self) -> usize {
        self.entries.iter().map(|e| e.seq_len).max().unwrap_or(0)
    }
}
