//! Scheduler module for continuous batching
//!
//! A single loop task owns every request and the slot ledger. Clients talk
//! to it through a [`SchedulerHandle`] (submission queue) and per-request
//! cancel flags; each step admits queued requests, builds one batch,
//! dispatches it to the compute worker and applies the results.

// Module declarations
pub mod handle;
pub mod queue;
pub mod scheduler;
pub mod state;
pub mod supervisor;

pub use handle::SchedulerHandle;
pub use queue::{LoopPhase, QueueDepth, SchedulerStats};
pub use scheduler::{Scheduler, SchedulerBuilder};
pub use state::{SchedulerState, Submission};
pub use supervisor::{FatalFailure, LogSupervisor, Supervisor};
