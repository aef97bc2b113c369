//! Immutable request description: identity, priority and sampling knobs

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ForgeResult;
use crate::user_error;

/// Opaque request identity
///
/// Supplied by the caller or generated at submission.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    /// Fresh random identity
    pub fn generate() -> Self {
        RequestId(format!("req-{}", uuid::Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        RequestId(s.to_string())
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        RequestId(s)
    }
}

/// Priority class. Variants are declared in scheduling order, so the derived
/// `Ord` puts `Interactive` first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Interactive,
    #[default]
    Batch,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::Interactive => write!(f, "interactive"),
            Priority::Batch => write!(f, "batch"),
        }
    }
}

/// Sampling parameters forwarded to the compute worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingParams {
    pub temperature: f32,
    /// 0 disables top-k filtering
    pub top_k: usize,
    pub top_p: f32,
    /// Generation stops after this token is produced; it is not delivered
    pub eos_token: Option<u32>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        SamplingParams {
            temperature: 1.0,
            top_k: 0,
            top_p: 1.0,
            eos_token: None,
        }
    }
}

impl SamplingParams {
    pub fn validate(&self) -> ForgeResult<()> {
        if !(self.temperature > 0.0) {
            return Err(user_error!(
                "invalid temperature {}: must be > 0",
                self.temperature
            ));
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(user_error!("invalid top_p {}: must be in (0, 1]", self.top_p));
        }
        Ok(())
    }
}

/// What a client asks the scheduler to do
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestSpec {
    #[serde(default)]
    pub id: Option<RequestId>,
    pub prompt: Vec<u32>,
    pub max_output_len: usize,
    #[serde(default)]
    pub sampling: SamplingParams,
    #[serde(default)]
    pub priority: Priority,
}

impl RequestSpec {
    pub fn new(prompt: Vec<u32>, max_output_len: usize) -> Self {
        RequestSpec {
            id: None,
            prompt,
            max_output_len,
            sampling: SamplingParams::default(),
            priority: Priority::default(),
        }
    }

    pub fn with_id(mut self, id: impl Into<RequestId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_sampling(mut self, sampling: SamplingParams) -> Self {
        self.sampling = sampling;
        self
    }

    pub fn with_eos_token(mut self, eos_token: u32) -> Self {
        self.sampling.eos_token = Some(eos_token);
        self
    }

    /// Prompt plus the full output budget
    pub fn max_total_tokens(&self) -> usize {
        self.prompt.len().saturating_add(self.max_output_len)
    }

    /// Shape checks that do not depend on scheduler capacity
    pub fn validate(&self) -> ForgeResult<()> {
        if self.prompt.is_empty() {
            return Err(user_error!("prompt must contain at least one token"));
        }
        if self.max_output_len == 0 {
            return Err(user_error!("max_output_len must be > 0"));
        }
        self.sampling.validate()
    }
}
