//! Linux AF_XDP socket setup using raw libc syscalls

use std::ffi::CString;
use std::io::{self, Error, ErrorKind};
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::ring::{ConsRing, ProdRing, Region, RingEntry, RingMap, XdpDesc, XdpRingOffset};
use super::socket::SocketRings;
use super::stats::KernelStats;
use super::umem::Umem;
use super::{BindMode, XdpConfig, XdpError};

// Linux kernel constants
const AF_XDP: i32 = 44;
const SOL_XDP: i32 = 283;
const XDP_MMAP_OFFSETS: i32 = 1;
const XDP_RX_RING: i32 = 2;
const XDP_TX_RING: i32 = 3;
const XDP_UMEM_REG: i32 = 4;
const XDP_UMEM_FILL_RING: i32 = 5;
const XDP_UMEM_COMPLETION_RING: i32 = 6;
const XDP_STATISTICS: i32 = 7;

const XDP_SHARED_UMEM: u16 = 1 << 0;
const XDP_COPY: u16 = 1 << 1;
const XDP_ZEROCOPY: u16 = 1 << 2;
const XDP_USE_NEED_WAKEUP: u16 = 1 << 3;

const XDP_PGOFF_RX_RING: i64 = 0;
const XDP_PGOFF_TX_RING: i64 = 0x80000000;
const XDP_UMEM_PGOFF_FILL_RING: i64 = 0x100000000;
const XDP_UMEM_PGOFF_COMPLETION_RING: i64 = 0x180000000;

#[repr(C)]
struct XdpUmemReg {
    addr: u64,
    len: u64,
    chunk_size: u32,
    headroom: u32,
    flags: u32,
    tx_metadata_len: u32,
}

#[repr(C)]
#[derive(Default)]
struct XdpMmapOffsets {
    rx: XdpRingOffset,
    tx: XdpRingOffset,
    fr: XdpRingOffset,
    cr: XdpRingOffset,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct SockaddrXdp {
    sxdp_family: u16,
    sxdp_flags: u16,
    sxdp_ifindex: u32,
    sxdp_queue_id: u32,
    sxdp_shared_umem_fd: u32,
}

/// A socket bound to one NIC queue, rings mapped
pub(crate) struct BoundSocket {
    pub fd: OwnedFd,
    pub rings: SocketRings,
    pub zero_copy: bool,
}

/// Create an AF_XDP socket for `queue_id` and bind it.
///
/// The first socket registers `umem`; later ones pass the first socket's fd
/// as `shared_with` and get their own Fill/Completion pair over it.
pub(crate) fn bind_socket(
    config: &XdpConfig,
    ifindex: u32,
    umem: &Umem,
    queue_id: u32,
    shared_with: Option<RawFd>,
) -> Result<BoundSocket, XdpError> {
    let socket_err = |source: io::Error| XdpError::Socket {
        interface: config.interface.clone(),
        queue: queue_id,
        source,
    };

    let raw = unsafe { libc::socket(AF_XDP, libc::SOCK_RAW | libc::SOCK_CLOEXEC, 0) };
    if raw < 0 {
        return Err(socket_err(Error::last_os_error()));
    }
    // SAFETY: freshly created and owned by nothing else.
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };

    if shared_with.is_none() {
        let reg = XdpUmemReg {
            addr: umem.addr(),
            len: umem.size() as u64,
            chunk_size: umem.frame_size(),
            headroom: config.headroom,
            flags: 0,
            tx_metadata_len: 0,
        };
        setsockopt(fd.as_raw_fd(), XDP_UMEM_REG, &reg).map_err(XdpError::Umem)?;
        info!(
            "UMEM registered: {} frames x {} bytes",
            umem.frame_count(),
            umem.frame_size()
        );
    }

    for (opt, size) in [
        (XDP_UMEM_FILL_RING, config.fill_ring_size),
        (XDP_UMEM_COMPLETION_RING, config.comp_ring_size),
        (XDP_RX_RING, config.rx_ring_size),
        (XDP_TX_RING, config.tx_ring_size),
    ] {
        setsockopt(fd.as_raw_fd(), opt, &size).map_err(socket_err)?;
    }

    let mut offsets = XdpMmapOffsets::default();
    let mut optlen = mem::size_of::<XdpMmapOffsets>() as libc::socklen_t;
    if unsafe {
        libc::getsockopt(
            fd.as_raw_fd(),
            SOL_XDP,
            XDP_MMAP_OFFSETS,
            &mut offsets as *mut _ as *mut libc::c_void,
            &mut optlen,
        )
    } < 0
    {
        return Err(socket_err(Error::last_os_error()));
    }

    let rings = SocketRings {
        fill: ProdRing::new(map_ring::<u64>(
            fd.as_raw_fd(),
            "fill",
            XDP_UMEM_PGOFF_FILL_RING,
            &offsets.fr,
            config.fill_ring_size,
        )?),
        comp: ConsRing::new(map_ring::<u64>(
            fd.as_raw_fd(),
            "completion",
            XDP_UMEM_PGOFF_COMPLETION_RING,
            &offsets.cr,
            config.comp_ring_size,
        )?),
        rx: ConsRing::new(map_ring::<XdpDesc>(
            fd.as_raw_fd(),
            "rx",
            XDP_PGOFF_RX_RING,
            &offsets.rx,
            config.rx_ring_size,
        )?),
        tx: ProdRing::new(map_ring::<XdpDesc>(
            fd.as_raw_fd(),
            "tx",
            XDP_PGOFF_TX_RING,
            &offsets.tx,
            config.tx_ring_size,
        )?),
    };

    let zero_copy = bind(config, fd.as_raw_fd(), ifindex, queue_id, shared_with)?;
    Ok(BoundSocket {
        fd,
        rings,
        zero_copy,
    })
}

/// Bind to the queue, falling back from zero-copy to copy mode when allowed.
/// Returns whether the socket ended up in zero-copy mode.
fn bind(
    config: &XdpConfig,
    fd: RawFd,
    ifindex: u32,
    queue_id: u32,
    shared_with: Option<RawFd>,
) -> Result<bool, XdpError> {
    let mut sxdp = SockaddrXdp {
        sxdp_family: AF_XDP as u16,
        sxdp_flags: 0,
        sxdp_ifindex: ifindex,
        sxdp_queue_id: queue_id,
        sxdp_shared_umem_fd: 0,
    };

    // Sockets sharing a UMEM inherit the owner's mode and may not set any
    // other flag.
    if let Some(owner) = shared_with {
        sxdp.sxdp_flags = XDP_SHARED_UMEM;
        sxdp.sxdp_shared_umem_fd = owner as u32;
        return bind_raw(fd, &sxdp)
            .map(|()| false)
            .map_err(|source| XdpError::Bind {
                interface: config.interface.clone(),
                queue: queue_id,
                source,
            });
    }

    let wakeup = if config.need_wakeup {
        XDP_USE_NEED_WAKEUP
    } else {
        0
    };

    let attempts: &[(u16, bool)] = match config.bind_mode {
        BindMode::Auto => &[(XDP_ZEROCOPY, true), (XDP_COPY, false)],
        BindMode::ZeroCopy => &[(XDP_ZEROCOPY, true)],
        BindMode::Copy => &[(XDP_COPY, false)],
    };

    let mut last_err = Error::other("no bind attempted");
    for &(mode, zero_copy) in attempts {
        sxdp.sxdp_flags = mode | wakeup;
        match bind_raw(fd, &sxdp) {
            Ok(()) => {
                info!(
                    "Bound {}:{} in {} mode",
                    config.interface,
                    queue_id,
                    if zero_copy { "zero-copy" } else { "copy" }
                );
                return Ok(zero_copy);
            }
            Err(err) => {
                if zero_copy && config.bind_mode == BindMode::Auto {
                    warn!("Zero-copy bind failed: {}, trying copy mode...", err);
                }
                last_err = err;
            }
        }
    }

    Err(XdpError::Bind {
        interface: config.interface.clone(),
        queue: queue_id,
        source: last_err,
    })
}

fn bind_raw(fd: RawFd, sxdp: &SockaddrXdp) -> io::Result<()> {
    if unsafe {
        libc::bind(
            fd,
            sxdp as *const _ as *const libc::sockaddr,
            mem::size_of::<SockaddrXdp>() as libc::socklen_t,
        )
    } < 0
    {
        return Err(Error::last_os_error());
    }
    Ok(())
}

fn setsockopt<T>(fd: RawFd, opt: i32, value: &T) -> io::Result<()> {
    if unsafe {
        libc::setsockopt(
            fd,
            SOL_XDP,
            opt,
            value as *const T as *const libc::c_void,
            mem::size_of::<T>() as libc::socklen_t,
        )
    } < 0
    {
        return Err(Error::last_os_error());
    }
    Ok(())
}

fn map_ring<T: RingEntry>(
    fd: RawFd,
    ring: &'static str,
    pgoff: i64,
    offsets: &XdpRingOffset,
    size: u32,
) -> Result<RingMap, XdpError> {
    let map_size = offsets.desc as usize + size as usize * mem::size_of::<T>();
    debug!("mmap {} ring: size={} pgoff={:#x}", ring, map_size, pgoff);
    let map_addr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            map_size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED | libc::MAP_POPULATE,
            fd,
            pgoff as libc::off_t,
        )
    };
    if map_addr == libc::MAP_FAILED {
        return Err(XdpError::RingMap {
            ring,
            source: Error::last_os_error(),
        });
    }

    // SAFETY: the kernel laid out `size` entries at `offsets` in this mapping.
    unsafe {
        let region = Arc::new(Region::from_raw(map_addr as *mut u8, map_size));
        Ok(RingMap::new(region, offsets, size))
    }
}

/// Ask the kernel to process the TX ring
pub(crate) fn kick_tx(fd: RawFd) {
    let ret = unsafe {
        libc::sendto(
            fd,
            ptr::null(),
            0,
            libc::MSG_DONTWAIT,
            ptr::null(),
            0,
        )
    };
    if ret < 0 {
        log_kick_error("TX");
    }
}

/// Ask the kernel to pick up new Fill ring entries
pub(crate) fn kick_rx(fd: RawFd) {
    let ret = unsafe {
        libc::recvfrom(
            fd,
            ptr::null_mut(),
            0,
            libc::MSG_DONTWAIT,
            ptr::null_mut(),
            ptr::null_mut(),
        )
    };
    if ret < 0 {
        log_kick_error("RX");
    }
}

fn log_kick_error(ring: &str) {
    let err = Error::last_os_error();
    match err.raw_os_error() {
        // Transient: the kernel is busy or the link is down
        Some(libc::EAGAIN | libc::EBUSY | libc::ENOBUFS | libc::ENETDOWN) => {}
        _ => warn!("{} wakeup failed: {}", ring, err),
    }
}

pub(crate) fn statistics(fd: RawFd) -> io::Result<KernelStats> {
    let mut stats = KernelStats::default();
    let mut optlen = mem::size_of::<KernelStats>() as libc::socklen_t;
    if unsafe {
        libc::getsockopt(
            fd,
            SOL_XDP,
            XDP_STATISTICS,
            &mut stats as *mut _ as *mut libc::c_void,
            &mut optlen,
        )
    } < 0
    {
        return Err(Error::last_os_error());
    }
    Ok(stats)
}

pub(crate) fn ifindex(interface: &str) -> io::Result<u32> {
    let ifname = CString::new(interface)
        .map_err(|_| Error::new(ErrorKind::InvalidInput, "Invalid interface"))?;
    let idx = unsafe { libc::if_nametoindex(ifname.as_ptr()) };
    if idx == 0 {
        Err(Error::last_os_error())
    } else {
        Ok(idx)
    }
}

/// Raise RLIMIT_MEMLOCK so UMEM registration is not refused on older kernels
pub fn raise_memlock_limit() -> io::Result<()> {
    let rlim = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    if unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) } < 0 {
        return Err(Error::last_os_error());
    }
    Ok(())
}
