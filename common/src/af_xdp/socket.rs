//! Socket context: one NIC queue, its four rings and its share of the arena

use std::io::{self, ErrorKind};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, trace};

use super::batch::{FlushReason, TxBatch};
use super::handler::{PacketHandler, Verdict};
use super::ring::{ConsRing, ProdRing, XdpDesc};
use super::stats::KernelStats;
use super::umem::{FrameAllocator, Umem};
use super::{Exhausted, XdpConfig, XdpStats};

/// The userspace ends of one socket's rings
pub(crate) struct SocketRings {
    pub rx: ConsRing<XdpDesc>,
    pub tx: ProdRing<XdpDesc>,
    pub fill: ProdRing<u64>,
    pub comp: ConsRing<u64>,
}

/// One AF_XDP socket and everything needed to drive it.
///
/// Owned by exactly one worker; none of its operations block.
pub struct XskSocket {
    queue_id: u32,
    rx: ConsRing<XdpDesc>,
    tx: ProdRing<XdpDesc>,
    fill: ProdRing<u64>,
    comp: ConsRing<u64>,
    frames: FrameAllocator,
    batch: TxBatch,
    /// Bytes queued in the current TX batch
    pending_bytes: u64,
    /// Submitted to TX and not yet seen on the completion ring
    outstanding_tx: u32,
    rx_batch_size: u32,
    /// Kick the kernel even when it has not asked for it
    always_kick: bool,
    stats: Arc<XdpStats>,
    /// `None` for in-process sockets
    fd: Option<OwnedFd>,
    umem: Arc<Umem>,
}

impl XskSocket {
    pub(crate) fn new(
        queue_id: u32,
        rings: SocketRings,
        frames: FrameAllocator,
        umem: Arc<Umem>,
        fd: Option<OwnedFd>,
        config: &XdpConfig,
        now: Instant,
    ) -> Self {
        let mut socket = XskSocket {
            queue_id,
            rx: rings.rx,
            tx: rings.tx,
            fill: rings.fill,
            comp: rings.comp,
            frames,
            batch: TxBatch::new(config.tx_batch_size, config.tx_flush_timeout(), now),
            pending_bytes: 0,
            outstanding_tx: 0,
            rx_batch_size: config.rx_batch_size,
            always_kick: !config.need_wakeup,
            stats: Arc::new(XdpStats::new()),
            fd,
            umem,
        };

        let stocked = socket.refill();
        debug!(
            "queue {}: fill ring primed with {} of {} frames",
            queue_id,
            stocked,
            socket.frames.capacity()
        );
        socket
    }

    /// Process up to one RX batch. Returns how many descriptors were consumed.
    pub fn drain_rx<H>(&mut self, handler: &mut H, now: Instant) -> u32
    where
        H: PacketHandler + ?Sized,
    {
        let (rcvd, idx_rx) = self.rx.peek(self.rx_batch_size);
        if rcvd == 0 {
            // Frames reclaimed from TX only reach the kernel through here
            // while nothing is being received.
            if self.frames.available() > 0 {
                self.refill();
            }
            if self.fill.needs_wakeup() {
                self.kick_rx();
            }
            return 0;
        }

        if self.refill() < rcvd {
            XdpStats::add(&self.stats.fill_shortfall, 1);
        }

        for i in 0..rcvd {
            let desc = self.rx.read(idx_rx.wrapping_add(i));

            // SAFETY: the descriptor was just consumed from RX, so this
            // socket owns the frame until it is queued or released below.
            let frame = unsafe { self.umem.data_mut(desc.addr, desc.len) };
            let verdict = match handler.handle(frame) {
                Ok(verdict) => verdict,
                Err(err) => {
                    trace!("queue {}: handler error: {:#}", self.queue_id, err);
                    XdpStats::add(&self.stats.handler_errors, 1);
                    Verdict::Drop
                }
            };

            match verdict {
                Verdict::Forward => {
                    self.transmit(desc.addr, desc.len, now);
                }
                Verdict::Drop => {
                    XdpStats::add(&self.stats.rx_dropped, 1);
                    self.frames.release(self.umem.frame_base(desc.addr));
                }
            }
            XdpStats::add(&self.stats.rx_bytes, desc.len as u64);
        }

        self.rx.release(rcvd);
        XdpStats::add(&self.stats.rx_packets, rcvd as u64);
        XdpStats::add(&self.stats.rx_batches, 1);

        self.reclaim_completions();
        self.batch.touch(now);
        rcvd
    }

    /// Top up the Fill ring from the allocator. Partial top-ups are normal.
    pub fn refill(&mut self) -> u32 {
        let free_frames = self.frames.available();
        let wanted = self.fill.free(free_frames).min(free_frames);
        if wanted == 0 {
            return 0;
        }

        let (granted, idx) = self.fill.reserve(wanted);
        let mut stocked = 0;
        while stocked < granted {
            match self.frames.allocate() {
                Ok(addr) => {
                    self.fill.write(idx.wrapping_add(stocked), addr);
                    stocked += 1;
                }
                Err(Exhausted) => break,
            }
        }
        if stocked < granted {
            self.fill.cancel(granted - stocked);
        }
        self.fill.submit(stocked);
        stocked
    }

    /// Queue a frame on TX. The frame is dropped back to the allocator if
    /// the ring has no room.
    pub fn transmit(&mut self, addr: u64, len: u32, now: Instant) -> bool {
        let (granted, idx) = self.tx.reserve(1);
        if granted == 0 {
            trace!("queue {}: TX ring full, dropping frame", self.queue_id);
            XdpStats::add(&self.stats.tx_dropped, 1);
            self.frames.release(self.umem.frame_base(addr));
            return false;
        }

        self.tx.write(
            idx,
            XdpDesc {
                addr,
                len,
                options: 0,
            },
        );
        self.pending_bytes += len as u64;

        if self.batch.push() {
            self.flush(now, FlushReason::Threshold);
        }
        true
    }

    /// Publish the pending TX batch and wake the kernel if needed.
    pub fn flush(&mut self, now: Instant, reason: FlushReason) -> u32 {
        let submitted = self.batch.take(now);
        if submitted == 0 {
            return 0;
        }

        self.tx.submit(submitted);
        self.outstanding_tx += submitted;

        XdpStats::add(&self.stats.tx_packets, submitted as u64);
        XdpStats::add(&self.stats.tx_bytes, self.pending_bytes);
        XdpStats::add(&self.stats.tx_batches, 1);
        if reason == FlushReason::Timeout {
            trace!(
                "queue {}: flushing {} frames on timeout",
                self.queue_id,
                submitted
            );
            XdpStats::add(&self.stats.timeout_flushes, 1);
        }
        self.pending_bytes = 0;

        self.reclaim_completions();
        submitted
    }

    /// Submit a partial batch that has been idle for the flush timeout
    pub fn flush_if_idle(&mut self, now: Instant) -> u32 {
        if self.batch.timed_out(now) {
            self.flush(now, FlushReason::Timeout)
        } else {
            0
        }
    }

    /// Return completed TX frames to the allocator
    pub fn reclaim_completions(&mut self) -> u32 {
        if self.outstanding_tx == 0 {
            return 0;
        }

        if self.always_kick || self.tx.needs_wakeup() {
            self.kick_tx();
        }

        let (completed, idx_cq) = self.comp.peek(self.comp.capacity());
        if completed == 0 {
            return 0;
        }

        for i in 0..completed {
            let addr = self.comp.read(idx_cq.wrapping_add(i));
            self.frames.release(self.umem.frame_base(addr));
        }
        self.comp.release(completed);
        self.outstanding_tx -= completed.min(self.outstanding_tx);
        completed
    }

    /// Abandon the pending TX batch and collect what has completed.
    ///
    /// Used on shutdown: nothing more is submitted, and every frame this
    /// socket still holds goes back to its allocator.
    pub fn quiesce(&mut self) -> u32 {
        let pending = self.batch.discard();
        let mut recovered = 0;
        for desc in self.tx.cancel(pending) {
            self.frames.release(self.umem.frame_base(desc.addr));
            recovered += 1;
        }
        self.pending_bytes = 0;
        recovered + self.reclaim_completions()
    }

    fn kick_tx(&self) {
        #[cfg(target_os = "linux")]
        if let Some(fd) = &self.fd {
            super::linux_impl::kick_tx(fd.as_raw_fd());
        }
    }

    fn kick_rx(&self) {
        #[cfg(target_os = "linux")]
        if let Some(fd) = &self.fd {
            super::linux_impl::kick_rx(fd.as_raw_fd());
        }
    }

    pub fn queue_id(&self) -> u32 {
        self.queue_id
    }

    pub fn stats(&self) -> &Arc<XdpStats> {
        &self.stats
    }

    pub fn outstanding_tx(&self) -> u32 {
        self.outstanding_tx
    }

    /// Descriptors queued on TX but not yet submitted
    pub fn pending_tx(&self) -> u32 {
        self.batch.pending()
    }

    /// When the pending TX batch times out, if there is one
    pub fn flush_deadline(&self) -> Option<Instant> {
        self.batch.deadline()
    }

    pub fn frames(&self) -> &FrameAllocator {
        &self.frames
    }

    pub fn raw_fd(&self) -> Option<RawFd> {
        self.fd.as_ref().map(|fd| fd.as_raw_fd())
    }

    /// Kernel-side drop and error counters
    pub fn kernel_stats(&self) -> io::Result<KernelStats> {
        match &self.fd {
            #[cfg(target_os = "linux")]
            Some(fd) => super::linux_impl::statistics(fd.as_raw_fd()),
            _ => Err(io::Error::new(
                ErrorKind::Unsupported,
                "no kernel socket behind this queue",
            )),
        }
    }

    /// Every frame base address reachable from this socket's side of the
    /// rings: free list, Fill, RX, TX (submitted and pending) and Completion.
    ///
    /// Frames the kernel has taken off a ring and not yet put back are not
    /// visible here.
    pub fn visible_frames(&self) -> Vec<u64> {
        let mut frames = self.frames.free_frames().to_vec();
        frames.extend(self.fill.published());
        frames.extend(self.rx.published().iter().map(|d| d.addr));
        frames.extend(self.tx.published().iter().map(|d| d.addr));
        frames.extend(self.tx.pending().iter().map(|d| d.addr));
        frames.extend(self.comp.published());
        for addr in &mut frames {
            *addr = self.umem.frame_base(*addr);
        }
        frames
    }
}
