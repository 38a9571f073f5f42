//! XDP redirect program and XSKMAP
//!
//! Loads a minimal XDP program that redirects every packet arriving on queue
//! N to the AF_XDP socket registered under key N in an XSKMAP, and passes the
//! packet to the kernel stack when no socket is registered. Alternatively an
//! XSKMAP pinned by an externally loaded program can be opened and used as-is.

use std::ffi::CString;
use std::io::{self, Error};
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use tracing::{error, info, warn};

use super::AttachMode;

// BPF syscall commands
const BPF_MAP_CREATE: u32 = 0;
const BPF_MAP_UPDATE_ELEM: u32 = 2;
const BPF_PROG_LOAD: u32 = 5;
const BPF_OBJ_GET: u32 = 7;
const BPF_LINK_CREATE: u32 = 28;

const BPF_MAP_TYPE_XSKMAP: u32 = 17;
const BPF_PROG_TYPE_XDP: u32 = 6;
const BPF_XDP: u32 = 37;

const XDP_FLAGS_SKB_MODE: u32 = 1 << 1;
const XDP_FLAGS_DRV_MODE: u32 = 1 << 2;

// BPF instruction encoding
const BPF_LD: u8 = 0x00;
const BPF_LDX: u8 = 0x01;
const BPF_JMP: u8 = 0x05;
const BPF_ALU64: u8 = 0x07;
const BPF_W: u8 = 0x00;
const BPF_DW: u8 = 0x18;
const BPF_IMM: u8 = 0x00;
const BPF_MEM: u8 = 0x60;
const BPF_MOV: u8 = 0xb0;
const BPF_K: u8 = 0x00;
const BPF_CALL: u8 = 0x80;
const BPF_EXIT: u8 = 0x90;
const BPF_PSEUDO_MAP_FD: u8 = 1;

#[allow(non_upper_case_globals)]
const BPF_FUNC_redirect_map: i32 = 51;

const XDP_PASS: i32 = 2;

/// Offset of `rx_queue_index` in `struct xdp_md`
const XDP_MD_RX_QUEUE_INDEX: i16 = 16;

/// BPF instruction
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct BpfInsn {
    code: u8,
    dst_src: u8, // dst:4 | src:4
    off: i16,
    imm: i32,
}

impl BpfInsn {
    fn new(code: u8, dst: u8, src: u8, off: i16, imm: i32) -> Self {
        BpfInsn {
            code,
            dst_src: (src << 4) | (dst & 0xf),
            off,
            imm,
        }
    }
}

/// BPF attribute union for syscalls
#[repr(C)]
union BpfAttr {
    map_create: BpfMapCreate,
    map_elem: BpfMapElem,
    prog_load: BpfProgLoad,
    obj_get: BpfObjGet,
    link_create: BpfLinkCreate,
    _size: [u64; 18],
}

#[repr(C)]
#[derive(Clone, Copy)]
struct BpfMapCreate {
    map_type: u32,
    key_size: u32,
    value_size: u32,
    max_entries: u32,
    map_flags: u32,
    inner_map_fd: u32,
    numa_node: u32,
    map_name: [u8; 16],
}

#[repr(C)]
#[derive(Clone, Copy)]
struct BpfMapElem {
    map_fd: u32,
    key: u64,
    value_or_next_key: u64,
    flags: u64,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct BpfProgLoad {
    prog_type: u32,
    insn_cnt: u32,
    insns: u64,
    license: u64,
    log_level: u32,
    log_size: u32,
    log_buf: u64,
    kern_version: u32,
    prog_flags: u32,
    prog_name: [u8; 16],
}

#[repr(C)]
#[derive(Clone, Copy)]
struct BpfObjGet {
    pathname: u64,
    bpf_fd: u32,
    file_flags: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct BpfLinkCreate {
    prog_fd: u32,
    target_ifindex: u32,
    attach_type: u32,
    flags: u32,
}

fn bpf(cmd: u32, attr: &BpfAttr) -> io::Result<OwnedFd> {
    let ret = unsafe {
        libc::syscall(
            libc::SYS_bpf,
            cmd,
            attr as *const _ as *const libc::c_void,
            mem::size_of::<BpfAttr>(),
        )
    };
    if ret < 0 {
        return Err(Error::last_os_error());
    }
    // SAFETY: these commands return a new fd that nothing else owns.
    Ok(unsafe { OwnedFd::from_raw_fd(ret as RawFd) })
}

fn object_name(name: &str) -> [u8; 16] {
    let mut buf = [0u8; 16];
    let len = name.len().min(15);
    buf[..len].copy_from_slice(&name.as_bytes()[..len]);
    buf
}

/// Queue index to AF_XDP socket map
pub struct XskMap {
    fd: OwnedFd,
}

impl XskMap {
    /// Create a map with room for queue indices `0..max_entries`
    pub fn create(max_entries: u32) -> io::Result<Self> {
        let mut attr: BpfAttr = unsafe { mem::zeroed() };
        attr.map_create = BpfMapCreate {
            map_type: BPF_MAP_TYPE_XSKMAP,
            key_size: 4,   // u32 queue index
            value_size: 4, // u32 socket fd
            max_entries,
            map_flags: 0,
            inner_map_fd: 0,
            numa_node: 0,
            map_name: object_name("xskpump_xsks"),
        };

        let fd = bpf(BPF_MAP_CREATE, &attr)?;
        info!("Created XSKMAP with {} entries", max_entries);
        Ok(XskMap { fd })
    }

    /// Open a map pinned in bpffs by another loader
    pub fn open_pinned(path: &Path) -> io::Result<Self> {
        let pathname = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| Error::new(io::ErrorKind::InvalidInput, "Invalid pin path"))?;

        let mut attr: BpfAttr = unsafe { mem::zeroed() };
        attr.obj_get = BpfObjGet {
            pathname: pathname.as_ptr() as u64,
            bpf_fd: 0,
            file_flags: 0,
        };

        let fd = bpf(BPF_OBJ_GET, &attr)?;
        info!("Opened pinned XSKMAP at {}", path.display());
        Ok(XskMap { fd })
    }

    /// Point queue `queue_id` at `socket_fd`
    pub fn register(&self, queue_id: u32, socket_fd: RawFd) -> io::Result<()> {
        let key = queue_id;
        let value = socket_fd as u32;

        let mut attr: BpfAttr = unsafe { mem::zeroed() };
        attr.map_elem = BpfMapElem {
            map_fd: self.fd.as_raw_fd() as u32,
            key: &key as *const _ as u64,
            value_or_next_key: &value as *const _ as u64,
            flags: 0,
        };

        let ret = unsafe {
            libc::syscall(
                libc::SYS_bpf,
                BPF_MAP_UPDATE_ELEM,
                &attr as *const _ as *const libc::c_void,
                mem::size_of::<BpfAttr>(),
            )
        };
        if ret < 0 {
            return Err(Error::last_os_error());
        }

        info!(
            "Registered AF_XDP socket fd={} for queue {}",
            socket_fd, queue_id
        );
        Ok(())
    }
}

impl AsRawFd for XskMap {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// Loaded redirect program and its map. Detached when dropped.
pub struct XdpProgram {
    map: XskMap,
    prog: OwnedFd,
    link: Option<OwnedFd>,
}

impl XdpProgram {
    pub fn load(map: XskMap) -> io::Result<Self> {
        let insns = redirect_bytecode(map.as_raw_fd());
        let license = b"GPL\0";
        let mut log_buf = vec![0u8; 65536];

        let mut attr: BpfAttr = unsafe { mem::zeroed() };
        attr.prog_load = BpfProgLoad {
            prog_type: BPF_PROG_TYPE_XDP,
            insn_cnt: insns.len() as u32,
            insns: insns.as_ptr() as u64,
            license: license.as_ptr() as u64,
            log_level: 1,
            log_size: log_buf.len() as u32,
            log_buf: log_buf.as_mut_ptr() as u64,
            kern_version: 0,
            prog_flags: 0,
            prog_name: object_name("xskpump_redir"),
        };

        let prog = bpf(BPF_PROG_LOAD, &attr).map_err(|err| {
            let log = String::from_utf8_lossy(&log_buf);
            let log = log.trim_end_matches('\0');
            if !log.is_empty() {
                error!("BPF verifier log:\n{}", log);
            }
            err
        })?;

        info!("Loaded XDP redirect program");
        Ok(XdpProgram {
            map,
            prog,
            link: None,
        })
    }

    /// Attach to `ifindex`. `Auto` tries driver mode, then generic (SKB) mode.
    pub fn attach(&mut self, ifindex: u32, mode: AttachMode) -> io::Result<()> {
        if self.link.is_some() {
            return Ok(());
        }

        let attempts: &[(u32, &str)] = match mode {
            AttachMode::Auto => &[(XDP_FLAGS_DRV_MODE, "native"), (XDP_FLAGS_SKB_MODE, "skb")],
            AttachMode::Native => &[(XDP_FLAGS_DRV_MODE, "native")],
            AttachMode::Skb => &[(XDP_FLAGS_SKB_MODE, "skb")],
        };

        let mut last_err = Error::other("no attach attempted");
        for &(flags, name) in attempts {
            let mut attr: BpfAttr = unsafe { mem::zeroed() };
            attr.link_create = BpfLinkCreate {
                prog_fd: self.prog.as_raw_fd() as u32,
                target_ifindex: ifindex,
                attach_type: BPF_XDP,
                flags,
            };

            match bpf(BPF_LINK_CREATE, &attr) {
                Ok(link) => {
                    info!("XDP program attached to ifindex {} in {} mode", ifindex, name);
                    self.link = Some(link);
                    return Ok(());
                }
                Err(err) => {
                    warn!("XDP attach in {} mode failed: {}", name, err);
                    last_err = err;
                }
            }
        }
        Err(last_err)
    }

    pub fn map(&self) -> &XskMap {
        &self.map
    }

    pub fn is_attached(&self) -> bool {
        self.link.is_some()
    }
}

impl Drop for XdpProgram {
    fn drop(&mut self) {
        if self.link.take().is_some() {
            info!("Detaching XDP program");
        }
    }
}

/// ```text
/// r2 = ctx->rx_queue_index
/// r1 = xskmap
/// r3 = XDP_PASS             ; action when the key has no socket
/// r0 = bpf_redirect_map(r1, r2, r3)
/// exit
/// ```
fn redirect_bytecode(xskmap_fd: RawFd) -> Vec<BpfInsn> {
    vec![
        BpfInsn::new(BPF_LDX | BPF_W | BPF_MEM, 2, 1, XDP_MD_RX_QUEUE_INDEX, 0),
        BpfInsn::new(BPF_LD | BPF_DW | BPF_IMM, 1, BPF_PSEUDO_MAP_FD, 0, xskmap_fd),
        BpfInsn::new(0, 0, 0, 0, 0),
        BpfInsn::new(BPF_ALU64 | BPF_MOV | BPF_K, 3, 0, 0, XDP_PASS),
        BpfInsn::new(BPF_JMP | BPF_CALL, 0, 0, 0, BPF_FUNC_redirect_map),
        BpfInsn::new(BPF_JMP | BPF_EXIT, 0, 0, 0, 0),
    ]
}
