//! Single-producer/single-consumer descriptor rings shared with the kernel.
//!
//! The same protocol serves all four AF_XDP rings; only the direction flips.
//! Userspace produces into Fill and TX and consumes RX and Completion.
//!
//! Each side keeps a cached copy of the peer's cursor and only re-reads the
//! shared one when the cache says there is not enough room (producer) or
//! nothing left (consumer). Cursors are free-running `u32`s; slots are
//! addressed with `index & mask`.
//!
//! Ordering: descriptor writes happen before the producer cursor is published
//! with `Release`; the consumer loads the producer cursor with `Acquire`
//! before reading descriptors, and publishes its own cursor with `Release`
//! once it is done reading.

use std::io::{self, Error};
use std::marker::PhantomData;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use super::XdpError;

/// Set by the kernel in a ring's flags word when it needs a syscall to make progress
pub const XDP_RING_NEED_WAKEUP: u32 = 1 << 0;

/// RX/TX descriptor, laid out as `struct xdp_desc`
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct XdpDesc {
    pub addr: u64,
    pub len: u32,
    pub options: u32,
}

/// Byte offsets of one ring within its mapping, laid out as `struct xdp_ring_offset`
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct XdpRingOffset {
    pub producer: u64,
    pub consumer: u64,
    pub desc: u64,
    pub flags: u64,
}

mod sealed {
    pub trait Sealed {}
    impl Sealed for u64 {}
    impl Sealed for super::XdpDesc {}
}

/// Entry type of a ring: a frame address (Fill/Completion) or an [`XdpDesc`] (RX/TX)
pub trait RingEntry: Copy + Send + sealed::Sealed {}
impl RingEntry for u64 {}
impl RingEntry for XdpDesc {}

/// An mmap'd region holding one or more rings. Unmapped on drop.
pub(crate) struct Region {
    ptr: *mut u8,
    len: usize,
}

// SAFETY: the region is plain shared memory; every access goes through the
// ring protocol below.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// Anonymous zeroed mapping, used for in-process ring pairs
    pub(crate) fn anonymous(len: usize) -> io::Result<Self> {
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(Error::last_os_error());
        }
        Ok(Region {
            ptr: ptr as *mut u8,
            len,
        })
    }

    /// Take ownership of an existing mapping.
    ///
    /// # Safety
    /// `ptr`/`len` must describe a live mapping that nothing else unmaps.
    pub(crate) unsafe fn from_raw(ptr: *mut u8, len: usize) -> Self {
        Region { ptr, len }
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.len);
        }
    }
}

/// Raw view of one ring inside a [`Region`]
pub(crate) struct RingMap {
    _region: Arc<Region>,
    producer: *const AtomicU32,
    consumer: *const AtomicU32,
    flags: *const AtomicU32,
    descs: *mut u8,
    size: u32,
    mask: u32,
}

impl RingMap {
    /// # Safety
    /// `offsets` must lie within `region` and the descriptor array must hold
    /// `size` entries of the ring's entry type.
    pub(crate) unsafe fn new(region: Arc<Region>, offsets: &XdpRingOffset, size: u32) -> Self {
        assert!(size.is_power_of_two(), "ring size must be a power of two");
        let base = region.ptr;
        RingMap {
            producer: base.add(offsets.producer as usize) as *const AtomicU32,
            consumer: base.add(offsets.consumer as usize) as *const AtomicU32,
            flags: base.add(offsets.flags as usize) as *const AtomicU32,
            descs: base.add(offsets.desc as usize),
            size,
            mask: size - 1,
            _region: region,
        }
    }

    #[inline]
    fn producer(&self) -> &AtomicU32 {
        unsafe { &*self.producer }
    }

    #[inline]
    fn consumer(&self) -> &AtomicU32 {
        unsafe { &*self.consumer }
    }

    #[inline]
    fn flags(&self) -> &AtomicU32 {
        unsafe { &*self.flags }
    }

    #[inline]
    unsafe fn slot<T: RingEntry>(&self, idx: u32) -> *mut T {
        self.descs.add((idx & self.mask) as usize * mem::size_of::<T>()) as *mut T
    }

    /// Entries published by the producer and not yet released by the consumer
    fn published<T: RingEntry>(&self) -> Vec<T> {
        let cons = self.consumer().load(Ordering::Acquire);
        let prod = self.producer().load(Ordering::Acquire);
        (0..prod.wrapping_sub(cons))
            .map(|i| unsafe { ptr::read(self.slot::<T>(cons.wrapping_add(i))) })
            .collect()
    }
}

/// Layout used for anonymous in-process rings: one cache line per cursor
const ANON_OFFSETS: XdpRingOffset = XdpRingOffset {
    producer: 0,
    consumer: 64,
    flags: 128,
    desc: 192,
};

/// Create both ends of an in-process ring of `size` entries.
///
/// The consumer end plays the role the kernel has for a real Fill/TX ring,
/// and the producer end the kernel's role for RX/Completion.
pub fn pair<T: RingEntry>(size: u32) -> Result<(ProdRing<T>, ConsRing<T>), XdpError> {
    if !size.is_power_of_two() {
        return Err(XdpError::InvalidConfig(format!(
            "ring size must be a power of two, got {size}"
        )));
    }
    let len = ANON_OFFSETS.desc as usize + size as usize * mem::size_of::<T>();
    let region = Arc::new(Region::anonymous(len)?);
    let (prod, cons) = unsafe {
        (
            RingMap::new(region.clone(), &ANON_OFFSETS, size),
            RingMap::new(region, &ANON_OFFSETS, size),
        )
    };
    Ok((ProdRing::new(prod), ConsRing::new(cons)))
}

/// Producer end of a ring
pub struct ProdRing<T> {
    map: RingMap,
    cached_prod: u32,
    /// Peer's consumer cursor plus ring size, so `cached_cons - cached_prod` is free space
    cached_cons: u32,
    _entry: PhantomData<T>,
}

// SAFETY: one producer per ring; the end moves between threads but is never shared.
unsafe impl<T: RingEntry> Send for ProdRing<T> {}

impl<T: RingEntry> ProdRing<T> {
    pub(crate) fn new(map: RingMap) -> Self {
        let cached_prod = map.producer().load(Ordering::Relaxed);
        let cached_cons = map.consumer().load(Ordering::Relaxed).wrapping_add(map.size);
        ProdRing {
            map,
            cached_prod,
            cached_cons,
            _entry: PhantomData,
        }
    }

    pub fn capacity(&self) -> u32 {
        self.map.size
    }

    /// Free slots, re-reading the consumer cursor only if fewer than `wanted` are cached
    #[inline]
    pub fn free(&mut self, wanted: u32) -> u32 {
        let free = self.cached_cons.wrapping_sub(self.cached_prod);
        if free >= wanted {
            return free;
        }
        self.cached_cons = self
            .map
            .consumer()
            .load(Ordering::Acquire)
            .wrapping_add(self.map.size);
        self.cached_cons.wrapping_sub(self.cached_prod)
    }

    /// Reserve `nb` slots. Returns `(granted, start_index)`; `granted` is
    /// either `nb` or 0, never blocking.
    #[inline]
    pub fn reserve(&mut self, nb: u32) -> (u32, u32) {
        let idx = self.cached_prod;
        if nb == 0 || self.free(nb) < nb {
            return (0, idx);
        }
        self.cached_prod = self.cached_prod.wrapping_add(nb);
        (nb, idx)
    }

    /// Fill a reserved slot
    #[inline]
    pub fn write(&mut self, idx: u32, entry: T) {
        let prod = self.map.producer().load(Ordering::Relaxed);
        assert!(
            idx.wrapping_sub(prod) < self.cached_prod.wrapping_sub(prod),
            "write to ring slot {idx} outside the reserved range"
        );
        unsafe { ptr::write(self.map.slot::<T>(idx), entry) }
    }

    /// Publish the first `nb` reserved slots to the consumer
    #[inline]
    pub fn submit(&mut self, nb: u32) {
        let prod = self.map.producer().load(Ordering::Relaxed);
        let reserved = self.cached_prod.wrapping_sub(prod);
        assert!(
            nb <= reserved,
            "ring submit of {nb} exceeds {reserved} reserved"
        );
        self.map
            .producer()
            .store(prod.wrapping_add(nb), Ordering::Release);
    }

    /// Give back the last `nb` reserved-but-unsubmitted slots, returning what was written in them
    pub fn cancel(&mut self, nb: u32) -> Vec<T> {
        let reserved = self.reserved();
        assert!(
            nb <= reserved,
            "ring cancel of {nb} exceeds {reserved} reserved"
        );
        let start = self.cached_prod.wrapping_sub(nb);
        let entries = (0..nb)
            .map(|i| unsafe { ptr::read(self.map.slot::<T>(start.wrapping_add(i))) })
            .collect();
        self.cached_prod = start;
        entries
    }

    /// Slots reserved and not yet submitted
    pub fn reserved(&self) -> u32 {
        self.cached_prod
            .wrapping_sub(self.map.producer().load(Ordering::Relaxed))
    }

    pub fn needs_wakeup(&self) -> bool {
        self.map.flags().load(Ordering::Relaxed) & XDP_RING_NEED_WAKEUP != 0
    }

    pub fn producer_index(&self) -> u32 {
        self.map.producer().load(Ordering::Acquire)
    }

    pub fn consumer_index(&self) -> u32 {
        self.map.consumer().load(Ordering::Acquire)
    }

    /// Submitted entries the consumer has not released yet
    pub fn published(&self) -> Vec<T> {
        self.map.published()
    }

    /// Entries written into reserved slots that are not submitted yet
    pub fn pending(&self) -> Vec<T> {
        let prod = self.map.producer().load(Ordering::Relaxed);
        (0..self.reserved())
            .map(|i| unsafe { ptr::read(self.map.slot::<T>(prod.wrapping_add(i))) })
            .collect()
    }
}

/// Consumer end of a ring
pub struct ConsRing<T> {
    map: RingMap,
    cached_prod: u32,
    cached_cons: u32,
    _entry: PhantomData<T>,
}

// SAFETY: one consumer per ring; the end moves between threads but is never shared.
unsafe impl<T: RingEntry> Send for ConsRing<T> {}

impl<T: RingEntry> ConsRing<T> {
    pub(crate) fn new(map: RingMap) -> Self {
        let cached_prod = map.producer().load(Ordering::Relaxed);
        let cached_cons = map.consumer().load(Ordering::Relaxed);
        ConsRing {
            map,
            cached_prod,
            cached_cons,
            _entry: PhantomData,
        }
    }

    pub fn capacity(&self) -> u32 {
        self.map.size
    }

    /// Entries ready to peek, capped at `wanted`; re-reads the producer
    /// cursor only once the cached view is drained
    #[inline]
    pub fn available(&mut self, wanted: u32) -> u32 {
        let mut entries = self.cached_prod.wrapping_sub(self.cached_cons);
        if entries == 0 {
            self.cached_prod = self.map.producer().load(Ordering::Acquire);
            entries = self.cached_prod.wrapping_sub(self.cached_cons);
        }
        entries.min(wanted)
    }

    /// Claim up to `nb` published entries without releasing them.
    /// Returns `(count, start_index)`.
    #[inline]
    pub fn peek(&mut self, nb: u32) -> (u32, u32) {
        let count = self.available(nb);
        let idx = self.cached_cons;
        self.cached_cons = self.cached_cons.wrapping_add(count);
        (count, idx)
    }

    /// Read a peeked entry
    #[inline]
    pub fn read(&self, idx: u32) -> T {
        let cons = self.map.consumer().load(Ordering::Relaxed);
        assert!(
            idx.wrapping_sub(cons) < self.cached_cons.wrapping_sub(cons),
            "read of ring slot {idx} outside the peeked range"
        );
        unsafe { ptr::read(self.map.slot::<T>(idx)) }
    }

    /// Hand the first `nb` peeked slots back to the producer
    #[inline]
    pub fn release(&mut self, nb: u32) {
        let cons = self.map.consumer().load(Ordering::Relaxed);
        let peeked = self.cached_cons.wrapping_sub(cons);
        assert!(nb <= peeked, "ring release of {nb} exceeds {peeked} peeked");
        self.map
            .consumer()
            .store(cons.wrapping_add(nb), Ordering::Release);
    }

    /// Peeked entries not released yet
    pub fn peeked(&self) -> u32 {
        self.cached_cons
            .wrapping_sub(self.map.consumer().load(Ordering::Relaxed))
    }

    /// Set or clear the need-wakeup flag, as the kernel does for Fill and TX
    pub fn set_needs_wakeup(&self, needed: bool) {
        if needed {
            self.map
                .flags()
                .fetch_or(XDP_RING_NEED_WAKEUP, Ordering::Relaxed);
        } else {
            self.map
                .flags()
                .fetch_and(!XDP_RING_NEED_WAKEUP, Ordering::Relaxed);
        }
    }

    pub fn producer_index(&self) -> u32 {
        self.map.producer().load(Ordering::Acquire)
    }

    pub fn consumer_index(&self) -> u32 {
        self.map.consumer().load(Ordering::Acquire)
    }

    /// Published entries not released yet, including peeked ones
    pub fn published(&self) -> Vec<T> {
        self.map.published()
    }
}
