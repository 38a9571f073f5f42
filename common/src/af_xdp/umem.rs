//! Frame arena and per-socket frame allocator

use std::io::Error;
use std::ptr;

use super::{Exhausted, XdpError};

/// Fixed pool of equally sized frames backing every socket.
///
/// Frames are addressed by byte offset into the area. The arena itself does
/// no ownership tracking: a frame's bytes may only be touched by whoever
/// currently owns its address (allocator, ring, or handler).
pub struct Umem {
    area: *mut u8,
    size: usize,
    frame_size: u32,
    frame_count: u32,
}

// SAFETY: the mapping lives until drop; concurrent access to a frame is ruled
// out by the ring/allocator ownership protocol, not by the arena.
unsafe impl Send for Umem {}
unsafe impl Sync for Umem {}

impl Umem {
    pub fn new(frame_count: u32, frame_size: u32) -> Result<Self, XdpError> {
        assert!(frame_size.is_power_of_two(), "frame size must be a power of two");
        let size = (frame_count as usize) * (frame_size as usize);

        let area = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if area == libc::MAP_FAILED {
            return Err(XdpError::Umem(Error::last_os_error()));
        }

        Ok(Umem {
            area: area as *mut u8,
            size,
            frame_size,
            frame_count,
        })
    }

    pub fn addr(&self) -> u64 {
        self.area as u64
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn frame_size(&self) -> u32 {
        self.frame_size
    }

    pub fn frame_count(&self) -> u32 {
        self.frame_count
    }

    /// Start of the frame containing `addr`.
    ///
    /// RX descriptors point past the headroom, completions hand back whatever
    /// was submitted; both normalize to the frame base here.
    #[inline]
    pub fn frame_base(&self, addr: u64) -> u64 {
        addr & !(self.frame_size as u64 - 1)
    }

    /// Bytes `[addr, addr + len)` of one frame.
    ///
    /// # Safety
    /// The caller must own the frame containing `addr` and must not create a
    /// second live slice over it.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn data_mut(&self, addr: u64, len: u32) -> &mut [u8] {
        self.check_bounds(addr, len);
        std::slice::from_raw_parts_mut(self.area.add(addr as usize), len as usize)
    }

    /// Copy of `[addr, addr + len)`.
    ///
    /// # Safety
    /// Same ownership requirement as [`Umem::data_mut`].
    pub unsafe fn read(&self, addr: u64, len: u32) -> Vec<u8> {
        self.check_bounds(addr, len);
        std::slice::from_raw_parts(self.area.add(addr as usize), len as usize).to_vec()
    }

    fn check_bounds(&self, addr: u64, len: u32) {
        let base = self.frame_base(addr);
        assert!(
            (addr as usize) < self.size && addr - base + len as u64 <= self.frame_size as u64,
            "descriptor {addr:#x}+{len} crosses frame or arena bounds"
        );
    }
}

impl Drop for Umem {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.area as *mut libc::c_void, self.size);
        }
    }
}

/// Stack free-list over one socket's partition of the arena.
///
/// Allocation pops the most recently released frame. Releasing a frame that
/// is already free, or one outside the partition, is a protocol violation and
/// panics.
#[derive(Debug)]
pub struct FrameAllocator {
    free: Vec<u64>,
    in_pool: Vec<bool>,
    base: u64,
    frame_size: u64,
}

impl FrameAllocator {
    /// Seed with frames `first_frame..first_frame + count`.
    pub fn new(first_frame: u32, count: u32, frame_size: u32) -> Self {
        let frame_size = frame_size as u64;
        let base = first_frame as u64 * frame_size;
        let free = (0..count as u64).map(|i| base + i * frame_size).collect();

        FrameAllocator {
            free,
            in_pool: vec![true; count as usize],
            base,
            frame_size,
        }
    }

    #[inline]
    pub fn allocate(&mut self) -> Result<u64, Exhausted> {
        let addr = self.free.pop().ok_or(Exhausted)?;
        let slot = self.slot(addr);
        self.in_pool[slot] = false;
        Ok(addr)
    }

    /// Return a frame by its base address.
    #[inline]
    pub fn release(&mut self, addr: u64) {
        assert!(
            self.free.len() < self.capacity(),
            "frame pool overflow releasing {addr:#x}"
        );
        let slot = self.slot(addr);
        assert!(!self.in_pool[slot], "double release of frame {addr:#x}");
        self.in_pool[slot] = true;
        self.free.push(addr);
    }

    #[inline]
    pub fn available(&self) -> u32 {
        self.free.len() as u32
    }

    pub fn capacity(&self) -> usize {
        self.in_pool.len()
    }

    pub fn owns(&self, addr: u64) -> bool {
        addr >= self.base
            && addr < self.base + self.capacity() as u64 * self.frame_size
            && (addr - self.base) % self.frame_size == 0
    }

    /// Every address in the partition, free or not
    pub fn partition(&self) -> impl Iterator<Item = u64> + '_ {
        (0..self.capacity() as u64).map(move |i| self.base + i * self.frame_size)
    }

    /// Addresses currently on the free list
    pub fn free_frames(&self) -> &[u64] {
        &self.free
    }

    fn slot(&self, addr: u64) -> usize {
        assert!(self.owns(addr), "frame {addr:#x} is not part of this pool");
        ((addr - self.base) / self.frame_size) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_is_lifo() {
        let mut frames = FrameAllocator::new(0, 4, 2048);
        let a = frames.allocate().unwrap();
        let b = frames.allocate().unwrap();
        assert_ne!(a, b);
        frames.release(a);
        assert_eq!(frames.allocate().unwrap(), a);
    }

    #[test]
    fn test_exhausted_is_deterministic() {
        let mut frames = FrameAllocator::new(0, 2, 2048);
        frames.allocate().unwrap();
        frames.allocate().unwrap();
        assert_eq!(frames.allocate(), Err(Exhausted));
        assert_eq!(frames.allocate(), Err(Exhausted));
        assert_eq!(frames.available(), 0);
    }

    #[test]
    fn test_partition_offsets() {
        let frames = FrameAllocator::new(8, 4, 4096);
        let all: Vec<u64> = frames.partition().collect();
        assert_eq!(all, vec![8 * 4096, 9 * 4096, 10 * 4096, 11 * 4096]);
        assert!(frames.owns(9 * 4096));
        assert!(!frames.owns(0));
        assert!(!frames.owns(9 * 4096 + 1));
    }

    #[test]
    #[should_panic(expected = "frame pool overflow")]
    fn test_release_into_full_pool_panics() {
        let mut frames = FrameAllocator::new(0, 2, 2048);
        frames.release(0);
    }

    #[test]
    #[should_panic(expected = "double release")]
    fn test_double_release_panics() {
        let mut frames = FrameAllocator::new(0, 2, 2048);
        let a = frames.allocate().unwrap();
        let _b = frames.allocate().unwrap();
        frames.release(a);
        frames.release(a);
    }

    #[test]
    #[should_panic(expected = "not part of this pool")]
    fn test_foreign_frame_panics() {
        let mut frames = FrameAllocator::new(4, 2, 2048);
        frames.allocate().unwrap();
        frames.release(0);
    }

    #[test]
    fn test_umem_frame_access() {
        let umem = Umem::new(4, 2048).unwrap();
        assert_eq!(umem.size(), 4 * 2048);
        assert_eq!(umem.frame_base(2048 + 100), 2048);
        unsafe {
            umem.data_mut(2048 + 10, 4).copy_from_slice(&[1, 2, 3, 4]);
            assert_eq!(umem.read(2048 + 10, 4), vec![1, 2, 3, 4]);
        }
    }

    #[test]
    #[should_panic(expected = "crosses frame")]
    fn test_umem_rejects_frame_overrun() {
        let umem = Umem::new(4, 2048).unwrap();
        unsafe {
            umem.read(2040, 16);
        }
    }
}
