//! AF_XDP Configuration

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::XdpError;

/// Minimum frame size the kernel accepts for an aligned UMEM chunk
pub const MIN_FRAME_SIZE: u32 = 2048;

/// How sockets bind to their NIC queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindMode {
    /// Try zero-copy, fall back to copy mode
    #[default]
    Auto,
    ZeroCopy,
    Copy,
}

/// How the redirect program attaches to the interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachMode {
    /// Try native (driver) mode, fall back to generic SKB mode
    #[default]
    Auto,
    Native,
    Skb,
}

/// How a worker waits for traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollMode {
    /// Spin over the owned sockets without blocking
    #[default]
    Busy,
    /// Block in poll(2) until a socket is readable or the wait bound expires
    Readiness,
}

/// AF_XDP engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct XdpConfig {
    /// Network interface name (e.g., "eth0")
    pub interface: String,
    /// First NIC queue to bind
    pub first_queue: u32,
    /// Number of sockets, one per queue starting at `first_queue`
    pub queue_count: u32,
    /// Frames in the arena, split evenly between sockets
    pub frame_count: u32,
    /// Size of each frame (power of 2)
    pub frame_size: u32,
    /// Headroom before packet data
    pub headroom: u32,
    pub rx_ring_size: u32,
    pub tx_ring_size: u32,
    pub fill_ring_size: u32,
    pub comp_ring_size: u32,
    /// Max RX descriptors handled per drain
    pub rx_batch_size: u32,
    /// Pending TX descriptors that trigger a submission
    pub tx_batch_size: u32,
    /// Idle time after which a partial TX batch is submitted
    pub tx_flush_timeout_ms: u64,
    pub poll_mode: PollMode,
    /// Upper bound on a single readiness wait
    pub poll_timeout_ms: u64,
    /// Worker threads; sockets are dealt round-robin
    pub workers: usize,
    pub bind_mode: BindMode,
    pub attach_mode: AttachMode,
    /// Bind with XDP_USE_NEED_WAKEUP
    pub need_wakeup: bool,
    /// XSKMAP pinned by an externally loaded program; no program is loaded when set
    pub xskmap_pin: Option<PathBuf>,
}

impl Default for XdpConfig {
    fn default() -> Self {
        XdpConfig {
            interface: "eth0".to_string(),
            first_queue: 0,
            queue_count: 1,
            frame_count: 4096,
            frame_size: 4096,
            headroom: 0,
            rx_ring_size: 2048,
            tx_ring_size: 2048,
            fill_ring_size: 2048,
            comp_ring_size: 2048,
            rx_batch_size: 64,
            tx_batch_size: 5,
            tx_flush_timeout_ms: 500,
            poll_mode: PollMode::Busy,
            poll_timeout_ms: 100,
            workers: 1,
            bind_mode: BindMode::Auto,
            attach_mode: AttachMode::Auto,
            need_wakeup: true,
            xskmap_pin: None,
        }
    }
}

impl XdpConfig {
    /// High-throughput configuration for 10+ Gbps
    pub fn high_throughput(interface: &str) -> Self {
        XdpConfig {
            interface: interface.to_string(),
            frame_count: 16384,
            rx_ring_size: 8192,
            tx_ring_size: 8192,
            fill_ring_size: 8192,
            comp_ring_size: 8192,
            rx_batch_size: 128,
            tx_batch_size: 64,
            tx_flush_timeout_ms: 1,
            ..Default::default()
        }
    }

    /// Low-latency configuration: small batches, short flush timeout
    pub fn low_latency(interface: &str) -> Self {
        XdpConfig {
            interface: interface.to_string(),
            frame_count: 2048,
            frame_size: 2048,
            rx_ring_size: 1024,
            tx_ring_size: 1024,
            fill_ring_size: 1024,
            comp_ring_size: 1024,
            rx_batch_size: 16,
            tx_batch_size: 1,
            tx_flush_timeout_ms: 0,
            ..Default::default()
        }
    }

    /// Frames owned by each socket's allocator
    pub fn frames_per_socket(&self) -> u32 {
        self.frame_count / self.queue_count.max(1)
    }

    pub fn tx_flush_timeout(&self) -> Duration {
        Duration::from_millis(self.tx_flush_timeout_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    /// NIC queues bound by this configuration, in socket order
    pub fn queues(&self) -> impl Iterator<Item = u32> {
        self.first_queue..self.first_queue.saturating_add(self.queue_count)
    }

    pub fn validate(&self) -> Result<(), XdpError> {
        let invalid = |msg: String| Err(XdpError::InvalidConfig(msg));

        for (name, size) in [
            ("rx_ring_size", self.rx_ring_size),
            ("tx_ring_size", self.tx_ring_size),
            ("fill_ring_size", self.fill_ring_size),
            ("comp_ring_size", self.comp_ring_size),
        ] {
            if !size.is_power_of_two() {
                return invalid(format!("{name} must be a power of two, got {size}"));
            }
        }
        if !self.frame_size.is_power_of_two() || self.frame_size < MIN_FRAME_SIZE {
            return invalid(format!(
                "frame_size must be a power of two >= {MIN_FRAME_SIZE}, got {}",
                self.frame_size
            ));
        }
        if self.headroom >= self.frame_size {
            return invalid(format!(
                "headroom {} leaves no room in a {} byte frame",
                self.headroom, self.frame_size
            ));
        }
        if self.queue_count == 0 {
            return invalid("queue_count must be at least 1".into());
        }
        if self.first_queue.checked_add(self.queue_count).is_none() {
            return invalid(format!(
                "queues {}+{} run past the last queue index",
                self.first_queue, self.queue_count
            ));
        }
        if self.workers == 0 {
            return invalid("workers must be at least 1".into());
        }
        if self.workers > self.queue_count as usize {
            return invalid(format!(
                "{} workers for {} sockets would leave workers idle",
                self.workers, self.queue_count
            ));
        }
        if self.frame_count % self.queue_count != 0 {
            return invalid(format!(
                "frame_count {} does not split evenly across {} sockets",
                self.frame_count, self.queue_count
            ));
        }
        if self.rx_batch_size == 0 || self.tx_batch_size == 0 {
            return invalid("batch sizes must be at least 1".into());
        }
        if self.frames_per_socket() < self.rx_batch_size {
            return invalid(format!(
                "{} frames per socket cannot cover an RX batch of {}",
                self.frames_per_socket(),
                self.rx_batch_size
            ));
        }
        if self.tx_batch_size > self.tx_ring_size {
            return invalid(format!(
                "tx_batch_size {} exceeds tx_ring_size {}",
                self.tx_batch_size, self.tx_ring_size
            ));
        }
        Ok(())
    }
}
