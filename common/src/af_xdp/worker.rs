//! Dispatch loop
//!
//! A worker owns a set of sockets outright and runs them in a single thread:
//! drain RX on each, hand frames to the packet handler, then flush any batch
//! that has gone idle. Shutdown is a shared flag checked once per pass.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::clock::{Clock, MonotonicClock};
use super::handler::PacketHandler;
use super::socket::XskSocket;
use super::PollMode;

/// Cooperative stop signal shared by every worker and the control thread
#[derive(Debug, Clone, Default)]
pub struct Shutdown(Arc<AtomicBool>);

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// What the last pass of the loop did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// Nothing received, nothing flushed
    Idle,
    /// Frames were received and dispatched
    Draining,
    /// At least one idle batch was submitted
    Flushing,
    ShuttingDown,
}

/// How long a readiness wait may block: the poll timeout, cut short by the
/// nearest pending flush deadline. Deadlines already passed give zero.
pub fn wait_bound<I>(now: Instant, deadlines: I, poll_timeout: Duration) -> Duration
where
    I: IntoIterator<Item = Instant>,
{
    deadlines
        .into_iter()
        .map(|deadline| deadline.saturating_duration_since(now))
        .fold(poll_timeout, Duration::min)
}

pub struct Worker<H, C = MonotonicClock> {
    id: usize,
    sockets: Vec<XskSocket>,
    handler: H,
    shutdown: Shutdown,
    clock: C,
    mode: PollMode,
    poll_timeout: Duration,
    pollfds: Vec<libc::pollfd>,
    state: LoopState,
}

impl<H: PacketHandler, C: Clock> Worker<H, C> {
    pub fn new(
        id: usize,
        sockets: Vec<XskSocket>,
        handler: H,
        shutdown: Shutdown,
        clock: C,
        mode: PollMode,
        poll_timeout: Duration,
    ) -> Self {
        let pollfds = sockets
            .iter()
            .filter_map(XskSocket::raw_fd)
            .map(|fd| libc::pollfd {
                fd,
                events: libc::POLLIN,
                revents: 0,
            })
            .collect();

        Worker {
            id,
            sockets,
            handler,
            shutdown,
            clock,
            mode,
            poll_timeout,
            pollfds,
            state: LoopState::Idle,
        }
    }

    /// Run until shutdown, then quiesce every socket
    pub fn run(&mut self) {
        let queues: Vec<u32> = self.sockets.iter().map(XskSocket::queue_id).collect();
        info!("worker {} started on queues {:?}", self.id, queues);

        while self.step() != LoopState::ShuttingDown {}

        self.teardown();
        info!("worker {} stopped", self.id);
    }

    /// One pass over every owned socket
    pub fn step(&mut self) -> LoopState {
        if self.shutdown.is_triggered() {
            self.state = LoopState::ShuttingDown;
            return self.state;
        }

        if self.mode == PollMode::Readiness {
            self.wait_readable();
        }

        let now = self.clock.now();
        let mut received = 0;
        for socket in self.sockets.iter_mut() {
            received += socket.drain_rx(&mut self.handler, now);
        }

        let now = self.clock.now();
        let mut flushed = 0;
        for socket in self.sockets.iter_mut() {
            flushed += socket.flush_if_idle(now);
            socket.reclaim_completions();
        }

        self.state = if flushed > 0 {
            LoopState::Flushing
        } else if received > 0 {
            LoopState::Draining
        } else {
            LoopState::Idle
        };
        self.state
    }

    /// Block until a socket is readable, the earliest flush deadline passes,
    /// or the poll timeout expires
    fn wait_readable(&mut self) {
        if self.pollfds.is_empty() {
            return;
        }

        let wait = wait_bound(
            self.clock.now(),
            self.sockets.iter().filter_map(XskSocket::flush_deadline),
            self.poll_timeout,
        );

        let ret = unsafe {
            libc::poll(
                self.pollfds.as_mut_ptr(),
                self.pollfds.len() as libc::nfds_t,
                wait.as_millis().min(i32::MAX as u128) as libc::c_int,
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                warn!("worker {}: poll failed: {}", self.id, err);
            }
        }
    }

    fn teardown(&mut self) {
        for socket in self.sockets.iter_mut() {
            let recovered = socket.quiesce();
            debug!(
                "worker {}: queue {} quiesced, {} frames recovered, {} still outstanding",
                self.id,
                socket.queue_id(),
                recovered,
                socket.outstanding_tx()
            );
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn sockets(&self) -> &[XskSocket] {
        &self.sockets
    }

    pub fn sockets_mut(&mut self) -> &mut [XskSocket] {
        &mut self.sockets
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn into_sockets(self) -> Vec<XskSocket> {
        self.sockets
    }
}
