//! Cooperative cancellation for long-running loops.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{IvfError, Result};

/// Shared flag polled at safe points by sampling, training, builds, scans and vacuum.
///
/// Clones observe the same flag. A cancelled operation unwinds with
/// [`IvfError::Cancelled`], leaving only what it had already committed.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    #[inline]
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(IvfError::Cancelled);
        }
        Ok(())
    }
}
