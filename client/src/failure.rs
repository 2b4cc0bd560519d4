//! Consecutive-failure tracking for disconnect detection.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tracing::{debug, warn};

/// Tracks consecutive transport failures against the upstream session.
///
/// Each transient transport error counts one failure; any success resets the
/// count. Crossing the threshold reports exactly once until the next
/// success.
#[derive(Debug)]
pub(crate) struct FailureTracker {
    consecutive: AtomicU32,
    threshold: u32,
    notified: AtomicBool,
}

impl FailureTracker {
    pub(crate) fn new(threshold: u32) -> Self {
        Self {
            consecutive: AtomicU32::new(0),
            threshold,
            notified: AtomicBool::new(false),
        }
    }

    /// Record a failure. Returns `(count, crossed_threshold)`; the second
    /// element is true exactly once per failure sequence.
    pub(crate) fn record_failure(&self) -> (u32, bool) {
        let count = self.consecutive.fetch_add(1, Ordering::SeqCst) + 1;
        let should_notify = count >= self.threshold && !self.notified.swap(true, Ordering::SeqCst);
        if should_notify {
            warn!("Transport interruption detected after {} consecutive failures", count);
        } else {
            debug!("Recorded transport failure (count: {})", count);
        }
        (count, should_notify)
    }

    /// Record a success. Returns true when this clears a reported
    /// interruption.
    pub(crate) fn record_success(&self) -> bool {
        self.consecutive.store(0, Ordering::SeqCst);
        let was_interrupted = self.notified.swap(false, Ordering::SeqCst);
        if was_interrupted {
            debug!("Transport recovery detected (was interrupted)");
        }
        was_interrupted
    }

    #[cfg(test)]
    pub(crate) fn failure_count(&self) -> u32 {
        self.consecutive.load(Ordering::SeqCst)
    }
}
