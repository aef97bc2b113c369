//! Common test utilities for scheduler integration tests
//!
//! - Scripted compute workers that record every batch and detect
//!   overlapping `execute` calls
//! - A supervisor that counts escalations
//! - Fixtures that build a scheduler without spawning it, so tests can
//!   queue submissions before the first iteration
//!
//! # Usage
//!
//! ```ignore
//! mod common;
//! use common::{harness, test_config, echo, ScriptedWorker};
//!
//! let mut h = harness(test_config(), ScriptedWorker::new(echo));
//! let request = h.handle.submit(spec)?;
//! let task = h.spawn();
//! ```

#![allow(dead_code)]

// Submodules
mod fixtures;
mod tempfile_helpers;
mod workers;

pub use fixtures::*;
pub use serial_test::serial;
pub use tempfile_helpers::*;
pub use workers::*;
