//! Periodic per-queue throughput report

use std::sync::Arc;
use std::time::Instant;

use xskpump_common::af_xdp::{StatsSnapshot, XdpStats};

struct QueueSample {
    queue_id: u32,
    stats: Arc<XdpStats>,
    last: StatsSnapshot,
}

/// Turns counter snapshots into rate lines, one pair per queue
pub struct Reporter {
    queues: Vec<QueueSample>,
}

impl Reporter {
    pub fn new(handles: Vec<(u32, Arc<XdpStats>)>, now: Instant) -> Self {
        let queues = handles
            .into_iter()
            .map(|(queue_id, stats)| QueueSample {
                queue_id,
                last: stats.snapshot_at(now),
                stats,
            })
            .collect();
        Self { queues }
    }

    /// Rates since the previous sample
    pub fn sample(&mut self, now: Instant) -> Vec<String> {
        let mut lines = Vec::with_capacity(self.queues.len() * 2);
        for queue in &mut self.queues {
            let current = queue.stats.snapshot_at(now);
            lines.extend(format_rates(queue.queue_id, &current, &queue.last));
            queue.last = current;
        }
        lines
    }

    /// Lifetime totals, logged once at exit
    pub fn summary(&self) -> Vec<String> {
        self.queues
            .iter()
            .map(|queue| {
                let snap = queue.stats.snapshot();
                format!(
                    "queue {}: rx {} pkts / {} bytes, tx {} pkts / {} bytes, avg batch rx {:.1} tx {:.1}",
                    queue.queue_id,
                    snap.rx_packets,
                    snap.rx_bytes,
                    snap.tx_packets,
                    snap.tx_bytes,
                    queue.stats.avg_rx_batch(),
                    queue.stats.avg_tx_batch(),
                )
            })
            .collect()
    }
}

pub fn format_rates(queue_id: u32, current: &StatsSnapshot, prev: &StatsSnapshot) -> [String; 2] {
    let rates = current.rates(prev);
    let period = rates.period.as_secs_f64();
    let kbytes = |now: u64, before: u64| now.saturating_sub(before) as f64 / 1000.0;

    [
        format!(
            "q{} rx {:>12.0} pps {:>12} pkts {:>10.1} KB {:>9.2} Mbit/s over {:.2}s",
            queue_id,
            rates.rx_pps,
            current.rx_packets,
            kbytes(current.rx_bytes, prev.rx_bytes),
            rates.rx_mbps,
            period,
        ),
        format!(
            "q{} tx {:>12.0} pps {:>12} pkts {:>10.1} KB {:>9.2} Mbit/s over {:.2}s",
            queue_id,
            rates.tx_pps,
            current.tx_packets,
            kbytes(current.tx_bytes, prev.tx_bytes),
            rates.tx_mbps,
            period,
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    #[test]
    fn test_format_rates() {
        let start = Instant::now();
        let prev = StatsSnapshot {
            timestamp: start,
            rx_packets: 0,
            rx_bytes: 0,
            tx_packets: 0,
            tx_bytes: 0,
        };
        let current = StatsSnapshot {
            timestamp: start + Duration::from_secs(1),
            rx_packets: 1000,
            rx_bytes: 64_000,
            tx_packets: 500,
            tx_bytes: 32_000,
        };

        let [rx, tx] = format_rates(3, &current, &prev);
        assert!(rx.starts_with("q3 rx"));
        assert!(rx.contains("1000 pps"));
        assert!(rx.contains("64.0 KB"));
        assert!(rx.contains("0.51 Mbit/s"));
        assert!(tx.contains("500 pps"));
        assert!(tx.contains("32.0 KB"));
    }

    #[test]
    fn test_sample_reports_deltas() {
        let stats = Arc::new(XdpStats::new());
        let start = Instant::now();
        let mut reporter = Reporter::new(vec![(0, stats.clone())], start);

        stats.rx_packets.fetch_add(200, Ordering::Relaxed);
        let lines = reporter.sample(start + Duration::from_secs(2));
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("100 pps"));

        // nothing new arrived
        let lines = reporter.sample(start + Duration::from_secs(4));
        assert!(lines[0].contains(" 0 pps"));
        assert!(lines[0].contains("200 pkts"));
    }

    #[test]
    fn test_summary_per_queue() {
        let a = Arc::new(XdpStats::new());
        let b = Arc::new(XdpStats::new());
        a.tx_packets.fetch_add(10, Ordering::Relaxed);
        a.tx_batches.fetch_add(2, Ordering::Relaxed);

        let reporter = Reporter::new(vec![(4, a), (5, b)], Instant::now());
        let summary = reporter.summary();
        assert_eq!(summary.len(), 2);
        assert!(summary[0].starts_with("queue 4: rx 0 pkts"));
        assert!(summary[0].contains("tx 10 pkts"));
        assert!(summary[0].contains("tx 5.0"));
        assert!(summary[1].starts_with("queue 5"));
    }
}
