//! Write-once cancellation flag shared between a client and the scheduler

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

use crate::request::RequestId;

/// Lock-free cancellation flag. Once set it stays set.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the flag. Returns `true` only for the call that flipped it.
    pub fn set(&self) -> bool {
        !self.0.swap(true, Ordering::AcqRel)
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Client-side handle that cancels one request
///
/// Cheap to clone. Cancelling also wakes an idle scheduler loop so the
/// request is swept promptly.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    id: RequestId,
    flag: CancelFlag,
    wake: Arc<Notify>,
}

impl CancelHandle {
    pub(crate) fn new(id: RequestId, flag: CancelFlag, wake: Arc<Notify>) -> Self {
        CancelHandle { id, flag, wake }
    }

    pub fn id(&self) -> &RequestId {
        &self.id
    }

    /// Idempotent
    pub fn cancel(&self) {
        if self.flag.set() {
            self.wake.notify_one();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.is_set()
    }
}
