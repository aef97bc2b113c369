//! batchforge - continuous-batching request scheduler
//!
//! Accepts generation requests, admits them against a fixed budget of
//! cache units and sequence slots, groups runnable requests into one batch
//! per step for an external compute worker, and streams each request's
//! tokens back through a bounded per-request channel.

#![allow(clippy::collapsible_else_if)] // Sometimes clearer for control flow
#![allow(clippy::collapsible_if)] // Sometimes clearer for control flow
#![allow(clippy::let_and_return)] // Sometimes clearer for debugging
#![allow(clippy::module_inception)] // scheduler::scheduler holds the loop
#![allow(clippy::too_many_arguments)] // Handle wiring takes every channel end

pub mod batch;
pub mod config;
pub mod error;
pub mod ledger;
pub mod logging;
pub mod metrics;
pub mod request;
pub mod scheduler;
pub mod stream;
pub mod worker;

pub use batch::{BatchBuilder, BatchDescriptor, BatchEntry};
pub use config::{RetryConfig, SchedulerConfig};
pub use error::{ErrorCategory, ForgeError, ForgeResult};
pub use ledger::{SlotLedger, UnitPolicy};
pub use metrics::SchedulerMetrics;
pub use request::{
    CancelReason, FailureReason, FinishReason, Priority, RequestId, RequestSpec, RequestStatus,
    SamplingParams, Termination,
};
pub use scheduler::{
    FatalFailure, LogSupervisor, Scheduler, SchedulerBuilder, SchedulerHandle, SchedulerStats,
    Supervisor,
};
pub use stream::{CancelHandle, RequestHandle, StreamEvent, StreamOutput, TokenStream};
pub use worker::{
    BatchResult, ComputeWorker, RequestOutput, SimulatedConfig, SimulatedWorker, StepOutcome,
    WorkerBackend, WorkerError,
};
