//! AF_XDP zero-copy packet engine
//!
//! One arena of fixed-size frames is shared by every socket; each socket owns
//! a disjoint slice of it, four descriptor rings, and a TX batching policy.
//! Workers poll their sockets, run a [`PacketHandler`] on each received frame
//! in place and send it back out or drop it.
//!
//! Requires Linux 5.4+, root (or CAP_NET_ADMIN/CAP_BPF) and an XDP-capable
//! NIC for [`Engine::bind`]. [`Engine::loopback`] runs the same machinery
//! against an in-process stand-in for the kernel.

#[cfg(target_os = "linux")]
mod linux_impl;

#[cfg(target_os = "linux")]
mod xdp_loader;

#[cfg(target_os = "linux")]
pub use linux_impl::raise_memlock_limit;

#[cfg(target_os = "linux")]
pub use xdp_loader::{XdpProgram, XskMap};

mod config;
pub use config::*;

mod error;
pub use error::{Exhausted, XdpError};

mod stats;
pub use stats::*;

pub mod ring;
pub use ring::{ConsRing, ProdRing, XdpDesc};

mod umem;
pub use umem::{FrameAllocator, Umem};

mod batch;
pub use batch::{FlushReason, TxBatch};

mod clock;
pub use clock::{Clock, ManualClock, MonotonicClock};

mod handler;
pub use handler::{PacketHandler, Reflector, Verdict};

mod socket;
pub use socket::XskSocket;

mod loopback;
pub use loopback::{LoopbackNic, TxFrame};

mod worker;
pub use worker::{wait_bound, LoopState, Shutdown, Worker};

mod engine;
pub use engine::Engine;
