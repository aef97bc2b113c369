//! Inference requests: what a client asks for and how far it has got

pub mod lifecycle;
pub mod types;

pub use lifecycle::{CancelReason, FailureReason, FinishReason, Request, RequestStatus, Termination};
pub use types::{Priority, RequestId, RequestSpec, SamplingParams};
