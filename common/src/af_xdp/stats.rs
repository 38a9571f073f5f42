//! AF_XDP Performance Statistics

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Per-socket counters. Written by the owning worker, read by anyone.
#[derive(Debug, Default)]
pub struct XdpStats {
    pub rx_packets: AtomicU64,
    pub rx_bytes: AtomicU64,
    pub tx_packets: AtomicU64,
    pub tx_bytes: AtomicU64,
    pub rx_batches: AtomicU64,
    pub tx_batches: AtomicU64,
    /// Handler verdict was Drop
    pub rx_dropped: AtomicU64,
    /// No TX slot for a forwarded frame
    pub tx_dropped: AtomicU64,
    pub handler_errors: AtomicU64,
    pub timeout_flushes: AtomicU64,
    /// RX batches whose Fill top-up restocked fewer frames than were received
    pub fill_shortfall: AtomicU64,
}

impl XdpStats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Read the throughput counters, stamped with `now`
    pub fn snapshot_at(&self, now: Instant) -> StatsSnapshot {
        StatsSnapshot {
            timestamp: now,
            rx_packets: self.rx_packets.load(Ordering::Relaxed),
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
            tx_packets: self.tx_packets.load(Ordering::Relaxed),
            tx_bytes: self.tx_bytes.load(Ordering::Relaxed),
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        self.snapshot_at(Instant::now())
    }

    pub fn avg_rx_batch(&self) -> f64 {
        let packets = self.rx_packets.load(Ordering::Relaxed);
        let batches = self.rx_batches.load(Ordering::Relaxed);
        if batches == 0 {
            0.0
        } else {
            packets as f64 / batches as f64
        }
    }

    pub fn avg_tx_batch(&self) -> f64 {
        let packets = self.tx_packets.load(Ordering::Relaxed);
        let batches = self.tx_batches.load(Ordering::Relaxed);
        if batches == 0 {
            0.0
        } else {
            packets as f64 / batches as f64
        }
    }
}

/// Point-in-time copy of the throughput counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub timestamp: Instant,
    pub rx_packets: u64,
    pub rx_bytes: u64,
    pub tx_packets: u64,
    pub tx_bytes: u64,
}

/// Throughput between two snapshots
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rates {
    pub period: Duration,
    pub rx_pps: f64,
    pub rx_mbps: f64,
    pub tx_pps: f64,
    pub tx_mbps: f64,
}

impl StatsSnapshot {
    /// Rates since `prev`. A zero-length period is treated as one second.
    pub fn rates(&self, prev: &StatsSnapshot) -> Rates {
        let period = self.timestamp.saturating_duration_since(prev.timestamp);
        let secs = if period.is_zero() {
            1.0
        } else {
            period.as_secs_f64()
        };

        let pps = |now: u64, before: u64| now.saturating_sub(before) as f64 / secs;
        let mbps =
            |now: u64, before: u64| (now.saturating_sub(before) * 8) as f64 / secs / 1_000_000.0;

        Rates {
            period,
            rx_pps: pps(self.rx_packets, prev.rx_packets),
            rx_mbps: mbps(self.rx_bytes, prev.rx_bytes),
            tx_pps: pps(self.tx_packets, prev.tx_packets),
            tx_mbps: mbps(self.tx_bytes, prev.tx_bytes),
        }
    }
}

/// Kernel-side socket counters (`struct xdp_statistics`)
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KernelStats {
    pub rx_dropped: u64,
    pub rx_invalid_descs: u64,
    pub tx_invalid_descs: u64,
    pub rx_ring_full: u64,
    pub rx_fill_ring_empty_descs: u64,
    pub tx_ring_empty_descs: u64,
}
