//! In-process stand-in for the kernel side of an AF_XDP socket.
//!
//! A [`LoopbackNic`] holds the opposite end of each of a socket's four rings:
//! it consumes Fill and TX and produces RX and Completion, writing injected
//! packets straight into the shared arena. Tests and `--loopback` runs use it
//! to drive the whole engine without a NIC or privileges.

use std::collections::VecDeque;
use std::sync::Arc;

use super::ring::{ConsRing, ProdRing, XdpDesc};
use super::umem::Umem;

/// A frame taken off the TX ring
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxFrame {
    pub addr: u64,
    pub data: Vec<u8>,
}

pub struct LoopbackNic {
    queue_id: u32,
    fill: ConsRing<u64>,
    rx: ProdRing<XdpDesc>,
    tx: ConsRing<XdpDesc>,
    comp: ProdRing<u64>,
    umem: Arc<Umem>,
    headroom: u32,
    /// Consumed from TX, completion not posted yet
    in_flight: VecDeque<u64>,
}

impl LoopbackNic {
    pub(crate) fn new(
        queue_id: u32,
        fill: ConsRing<u64>,
        rx: ProdRing<XdpDesc>,
        tx: ConsRing<XdpDesc>,
        comp: ProdRing<u64>,
        umem: Arc<Umem>,
        headroom: u32,
    ) -> Self {
        LoopbackNic {
            queue_id,
            fill,
            rx,
            tx,
            comp,
            umem,
            headroom,
            in_flight: VecDeque::new(),
        }
    }

    pub fn queue_id(&self) -> u32 {
        self.queue_id
    }

    /// Receive one packet. Returns false if no Fill frame or RX slot is free.
    pub fn inject(&mut self, packet: &[u8]) -> bool {
        self.inject_batch(&[packet]) == 1
    }

    /// Receive as many of `packets` as Fill and RX allow, in order.
    ///
    /// Packets longer than a frame minus headroom are truncated.
    pub fn inject_batch<P: AsRef<[u8]>>(&mut self, packets: &[P]) -> usize {
        let wanted = packets.len().min(u32::MAX as usize) as u32;
        let nb = self.fill.available(wanted).min(self.rx.free(wanted));
        if nb == 0 {
            return 0;
        }

        let (count, idx_fq) = self.fill.peek(nb);
        let (granted, idx_rx) = self.rx.reserve(count);
        debug_assert_eq!(granted, count);

        let room = (self.umem.frame_size() - self.headroom) as usize;
        for (i, packet) in packets.iter().take(count as usize).enumerate() {
            let i = i as u32;
            let base = self.fill.read(idx_fq.wrapping_add(i));
            let addr = base + self.headroom as u64;
            let packet = packet.as_ref();
            let len = packet.len().min(room);

            // SAFETY: the frame came off the Fill ring, so this side owns it
            // until the RX descriptor is submitted.
            let frame = unsafe { self.umem.data_mut(addr, len as u32) };
            frame.copy_from_slice(&packet[..len]);

            self.rx.write(
                idx_rx.wrapping_add(i),
                XdpDesc {
                    addr,
                    len: len as u32,
                    options: 0,
                },
            );
        }

        self.fill.release(count);
        self.rx.submit(count);
        count as usize
    }

    /// Take up to `max` submitted TX frames. They stay in flight until
    /// [`complete`](Self::complete) posts them back.
    pub fn take_tx(&mut self, max: u32) -> Vec<TxFrame> {
        let (count, idx) = self.tx.peek(max);
        let frames = (0..count)
            .map(|i| {
                let desc = self.tx.read(idx.wrapping_add(i));
                self.in_flight.push_back(desc.addr);
                // SAFETY: submitted TX frames belong to this side until completed.
                let data = unsafe { self.umem.read(desc.addr, desc.len) };
                TxFrame {
                    addr: desc.addr,
                    data,
                }
            })
            .collect();
        self.tx.release(count);
        frames
    }

    /// Post up to `max` in-flight frames on the Completion ring, oldest first
    pub fn complete(&mut self, max: u32) -> u32 {
        let wanted = (self.in_flight.len() as u32).min(max);
        let nb = self.comp.free(wanted).min(wanted);
        let (granted, idx) = self.comp.reserve(nb);
        for i in 0..granted {
            if let Some(addr) = self.in_flight.pop_front() {
                self.comp.write(idx.wrapping_add(i), addr);
            }
        }
        self.comp.submit(granted);
        granted
    }

    /// Take everything on TX and complete as much as the Completion ring holds
    pub fn drain_tx(&mut self) -> Vec<TxFrame> {
        let frames = self.take_tx(self.tx.capacity());
        self.complete(u32::MAX);
        frames
    }

    /// Ask the socket for a wakeup before the next Fill refill is noticed
    pub fn set_fill_need_wakeup(&self, needed: bool) {
        self.fill.set_needs_wakeup(needed);
    }

    /// Ask the socket for a wakeup before submitted TX frames are picked up
    pub fn set_tx_need_wakeup(&self, needed: bool) {
        self.tx.set_needs_wakeup(needed);
    }

    /// Frames sitting on the Fill ring, ready to receive into
    pub fn fill_level(&self) -> u32 {
        self.fill.published().len() as u32
    }

    /// Frame bases held by this side between TX and Completion
    pub fn held_frames(&self) -> Vec<u64> {
        self.in_flight
            .iter()
            .map(|&addr| self.umem.frame_base(addr))
            .collect()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
}
