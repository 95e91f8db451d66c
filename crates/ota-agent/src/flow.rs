//! Cooperative cancellation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A monotonic continue/abort signal shared between the engine, transport,
/// and package drivers.
///
/// Once aborted a token never becomes runnable again; holders must check
/// [`FlowControlToken::can_continue`] on every I/O boundary and unwind
/// promptly when it turns false.
#[derive(Debug, Clone, Default)]
pub struct FlowControlToken {
    aborted: Arc<AtomicBool>,
}

impl FlowControlToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// True while work may proceed.
    pub fn can_continue(&self) -> bool {
        !self.aborted.load(Ordering::Acquire)
    }

    /// Latches the token into the aborted state.
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
    }
}
