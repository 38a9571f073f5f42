//! TX batching policy
//!
//! Queued TX descriptors are published to the kernel when the batch reaches
//! its threshold, or once the socket has been idle for the flush timeout with
//! a partial batch outstanding. Time is always passed in, never read here.

use std::time::{Duration, Instant};

/// Why a batch was submitted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    Threshold,
    Timeout,
    Explicit,
}

#[derive(Debug, Clone)]
pub struct TxBatch {
    pending: u32,
    threshold: u32,
    timeout: Duration,
    /// Last flush or RX activity; the idle timeout counts from here
    last_activity: Instant,
}

impl TxBatch {
    pub fn new(threshold: u32, timeout: Duration, now: Instant) -> Self {
        assert!(threshold > 0, "batch threshold must be at least 1");
        TxBatch {
            pending: 0,
            threshold,
            timeout,
            last_activity: now,
        }
    }

    /// Count one more queued descriptor. Returns true once the threshold is reached.
    #[inline]
    pub fn push(&mut self) -> bool {
        self.pending += 1;
        self.pending >= self.threshold
    }

    /// Note RX activity; pushes the idle deadline back
    #[inline]
    pub fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }

    /// A partial batch has sat idle for at least the timeout
    #[inline]
    pub fn timed_out(&self, now: Instant) -> bool {
        self.pending > 0 && now.saturating_duration_since(self.last_activity) >= self.timeout
    }

    /// When the pending batch will time out, if there is one
    pub fn deadline(&self) -> Option<Instant> {
        (self.pending > 0).then(|| self.last_activity + self.timeout)
    }

    /// Empty the batch, returning how many descriptors to submit
    #[inline]
    pub fn take(&mut self, now: Instant) -> u32 {
        let pending = self.pending;
        self.pending = 0;
        self.last_activity = now;
        pending
    }

    /// Forget the pending batch without submitting it
    pub fn discard(&mut self) -> u32 {
        std::mem::take(&mut self.pending)
    }

    pub fn pending(&self) -> u32 {
        self.pending
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}
