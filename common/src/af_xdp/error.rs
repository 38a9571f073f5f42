//! AF_XDP engine errors

use std::io;

use thiserror::Error;

/// Setup and teardown failures of the engine.
///
/// Steady-state backpressure never surfaces here; see [`Exhausted`] and the
/// granted counts returned by the ring operations.
#[derive(Debug, Error)]
pub enum XdpError {
    /// Rejected by [`XdpConfig::validate`](super::XdpConfig::validate)
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Failed to map or register the frame arena
    #[error("failed to create UMEM: {0}")]
    Umem(#[source] io::Error),

    /// Failed to create or configure an AF_XDP socket
    #[error("failed to create AF_XDP socket on {interface} queue {queue}: {source}")]
    Socket {
        interface: String,
        queue: u32,
        #[source]
        source: io::Error,
    },

    /// Failed to mmap one of the four rings
    #[error("failed to map {ring} ring: {source}")]
    RingMap {
        ring: &'static str,
        #[source]
        source: io::Error,
    },

    /// Bind to the NIC queue failed in every permitted mode
    #[error("failed to bind AF_XDP socket to {interface} queue {queue}: {source}")]
    Bind {
        interface: String,
        queue: u32,
        #[source]
        source: io::Error,
    },

    /// Loading the redirect program or registering a socket failed
    #[error("control plane: {0}")]
    ControlPlane(#[source] io::Error),

    #[error("AF_XDP is only supported on Linux")]
    Unsupported,

    #[error("worker {0} panicked")]
    WorkerPanicked(usize),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// The frame allocator has no free frames.
///
/// Callers treat this as backpressure: drop the work item and carry on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("frame pool exhausted")]
pub struct Exhausted;
