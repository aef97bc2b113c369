//! Batch formation for continuous batching

pub mod builder;
pub mod descriptor;

pub use builder::{BatchBuilder, BatchPlan};
pub use descriptor::{BatchDescriptor, BatchEntry};
