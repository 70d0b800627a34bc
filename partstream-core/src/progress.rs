//! Progress reporting and cooperative cancellation

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};

/// Receives progress updates and answers cancellation polls.
///
/// Streams and caches poll [`ProgressSink::is_cancelled`] once per batch, so
/// cancellation is coarse-grained.
pub trait ProgressSink: Send + Sync {
    /// Report that `done` of `total` records have been processed
    fn update(&self, done: u64, total: Option<u64>) {
        let _ = (done, total);
    }

    /// Whether the current work should stop
    fn is_cancelled(&self) -> bool {
        false
    }

    /// Return `Err(Cancelled)` if cancellation was requested
    fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// A sink that ignores progress and never cancels
#[derive(Debug, Default, Clone, Copy)]
pub struct NullProgress;

impl ProgressSink for NullProgress {}

/// Shared cancellation flag with a processed-record counter
#[derive(Debug, Default, Clone)]
pub struct CancelFlag {
    cancelled: Arc<AtomicBool>,
    processed: Arc<AtomicU64>,
}

impl CancelFlag {
    /// Create a flag that is not cancelled
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Clear a previous cancellation request
    pub fn reset(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }

    /// Last reported processed-record count
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }
}

impl ProgressSink for CancelFlag {
    fn update(&self, done: u64, _total: Option<u64>) {
        self.processed.store(done, Ordering::Relaxed);
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}
