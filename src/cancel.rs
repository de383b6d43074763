//! One-way cancellation latch shared between the pipeline and signal handlers.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Latch that starts clear and, once set, stays set for the rest of the run.
///
/// Clones observe the same flag, so a signal handler task can hold one copy
/// while the pipeline and its polling loops check another.
#[derive(Clone, Debug, Default)]
pub struct CancelLatch {
    flag: Arc<AtomicBool>,
}

impl CancelLatch {
    /// Creates a clear latch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation. Calling this more than once has no further effect.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Returns `true` once [`CancelLatch::cancel`] has been called on any clone.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}
