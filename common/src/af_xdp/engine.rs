//! Engine: arena, sockets and the control plane that feeds them
//!
//! Setup order is arena, control plane, then one socket per queue, each
//! registered in the XSKMAP as soon as it is bound. Teardown runs the other
//! way round: workers stop and quiesce their sockets, the sockets close, the
//! program detaches and the arena is unmapped last.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use tracing::{error, info};

use super::handler::PacketHandler;
use super::loopback::LoopbackNic;
use super::ring;
use super::socket::{SocketRings, XskSocket};
use super::umem::{FrameAllocator, Umem};
use super::worker::{Shutdown, Worker};
use super::{MonotonicClock, XdpConfig, XdpError, XdpStats};

#[cfg(target_os = "linux")]
use super::xdp_loader::{XdpProgram, XskMap};

/// Where sockets get registered for redirection
#[cfg(target_os = "linux")]
enum ControlPlane {
    /// Program loaded and attached by this process
    Owned(XdpProgram),
    /// Map of an externally loaded program
    Pinned(XskMap),
}

#[cfg(target_os = "linux")]
impl ControlPlane {
    fn map(&self) -> &XskMap {
        match self {
            ControlPlane::Owned(program) => program.map(),
            ControlPlane::Pinned(map) => map,
        }
    }
}

pub struct Engine {
    config: XdpConfig,
    sockets: Vec<XskSocket>,
    #[cfg(target_os = "linux")]
    control: Option<ControlPlane>,
    umem: Arc<Umem>,
}

impl Engine {
    /// Bind one socket per configured queue on a real interface
    #[cfg(target_os = "linux")]
    pub fn bind(config: XdpConfig) -> Result<Self, XdpError> {
        use std::os::fd::AsRawFd;

        use super::linux_impl;

        config.validate()?;
        info!(
            "Starting AF_XDP on {} queues {:?}",
            config.interface,
            config.queues().collect::<Vec<_>>()
        );

        let ifindex = linux_impl::ifindex(&config.interface).map_err(|source| {
            XdpError::Socket {
                interface: config.interface.clone(),
                queue: config.first_queue,
                source,
            }
        })?;
        let umem = Arc::new(Umem::new(config.frame_count, config.frame_size)?);

        let control = match &config.xskmap_pin {
            Some(path) => ControlPlane::Pinned(
                XskMap::open_pinned(path).map_err(XdpError::ControlPlane)?,
            ),
            None => {
                let max_entries = config.first_queue.saturating_add(config.queue_count);
                let map = XskMap::create(max_entries).map_err(XdpError::ControlPlane)?;
                let mut program = XdpProgram::load(map).map_err(XdpError::ControlPlane)?;
                program
                    .attach(ifindex, config.attach_mode)
                    .map_err(XdpError::ControlPlane)?;
                ControlPlane::Owned(program)
            }
        };

        let per_socket = config.frames_per_socket();
        let mut sockets: Vec<XskSocket> = Vec::with_capacity(config.queue_count as usize);
        for (i, queue_id) in config.queues().enumerate() {
            let shared_with = sockets.first().and_then(XskSocket::raw_fd);
            let bound = linux_impl::bind_socket(&config, ifindex, &umem, queue_id, shared_with)?;
            control
                .map()
                .register(queue_id, bound.fd.as_raw_fd())
                .map_err(XdpError::ControlPlane)?;

            let frames = FrameAllocator::new(i as u32 * per_socket, per_socket, config.frame_size);
            sockets.push(XskSocket::new(
                queue_id,
                bound.rings,
                frames,
                umem.clone(),
                Some(bound.fd),
                &config,
                Instant::now(),
            ));
        }

        Ok(Engine {
            config,
            sockets,
            control: Some(control),
            umem,
        })
    }

    #[cfg(not(target_os = "linux"))]
    pub fn bind(_config: XdpConfig) -> Result<Self, XdpError> {
        Err(XdpError::Unsupported)
    }

    /// Build the engine over in-process rings, returning the peer that plays
    /// the NIC for each socket, in socket order
    pub fn loopback(config: XdpConfig) -> Result<(Self, Vec<LoopbackNic>), XdpError> {
        Self::loopback_at(config, Instant::now())
    }

    /// [`loopback`](Self::loopback) with the batch clocks started at `now`
    pub fn loopback_at(
        config: XdpConfig,
        now: Instant,
    ) -> Result<(Self, Vec<LoopbackNic>), XdpError> {
        config.validate()?;
        let umem = Arc::new(Umem::new(config.frame_count, config.frame_size)?);
        let per_socket = config.frames_per_socket();

        let mut sockets = Vec::with_capacity(config.queue_count as usize);
        let mut nics = Vec::with_capacity(config.queue_count as usize);
        for (i, queue_id) in config.queues().enumerate() {
            let (fill, nic_fill) = ring::pair::<u64>(config.fill_ring_size)?;
            let (comp_nic, comp) = ring::pair::<u64>(config.comp_ring_size)?;
            let (rx_nic, rx) = ring::pair(config.rx_ring_size)?;
            let (tx, tx_nic) = ring::pair(config.tx_ring_size)?;

            nics.push(LoopbackNic::new(
                queue_id,
                nic_fill,
                rx_nic,
                tx_nic,
                comp_nic,
                umem.clone(),
                config.headroom,
            ));

            let frames = FrameAllocator::new(i as u32 * per_socket, per_socket, config.frame_size);
            sockets.push(XskSocket::new(
                queue_id,
                SocketRings { rx, tx, fill, comp },
                frames,
                umem.clone(),
                None,
                &config,
                now,
            ));
        }

        info!(
            "Loopback engine ready: {} sockets, {} frames each",
            sockets.len(),
            per_socket
        );
        Ok((
            Engine {
                config,
                sockets,
                #[cfg(target_os = "linux")]
                control: None,
                umem,
            },
            nics,
        ))
    }

    pub fn config(&self) -> &XdpConfig {
        &self.config
    }

    pub fn sockets(&self) -> &[XskSocket] {
        &self.sockets
    }

    pub fn umem(&self) -> &Arc<Umem> {
        &self.umem
    }

    /// Counter handles per queue, usable after the engine is consumed by [`run`](Self::run)
    pub fn stats_handles(&self) -> Vec<(u32, Arc<XdpStats>)> {
        self.sockets
            .iter()
            .map(|s| (s.queue_id(), s.stats().clone()))
            .collect()
    }

    /// Take the sockets to drive them by hand. A loaded program is detached.
    pub fn into_sockets(self) -> Vec<XskSocket> {
        self.sockets
    }

    /// Run the dispatch loop on `config.workers` threads until `shutdown`
    /// triggers, then tear everything down.
    ///
    /// Sockets are dealt to workers round-robin; `make_handler` is called
    /// once per worker with its index. A worker panic stops every worker and
    /// is reported as [`XdpError::WorkerPanicked`].
    pub fn run<H, F>(self, shutdown: &Shutdown, make_handler: F) -> Result<(), XdpError>
    where
        H: PacketHandler + Send + 'static,
        F: FnMut(usize) -> H,
    {
        self.run_with(shutdown, make_handler, |id, body| {
            thread::Builder::new()
                .name(format!("xsk-worker-{id}"))
                .spawn(body)
        })
    }

    /// [`run`](Self::run) with the thread spawn supplied by the caller
    fn run_with<H, F, S>(
        self,
        shutdown: &Shutdown,
        mut make_handler: F,
        mut spawn: S,
    ) -> Result<(), XdpError>
    where
        H: PacketHandler + Send + 'static,
        F: FnMut(usize) -> H,
        S: FnMut(usize, WorkerBody) -> io::Result<JoinHandle<()>>,
    {
        let Engine {
            config,
            sockets,
            #[cfg(target_os = "linux")]
            control,
            umem,
        } = self;

        let workers = config.workers.max(1);
        let mut groups: Vec<Vec<XskSocket>> = (0..workers).map(|_| Vec::new()).collect();
        for (i, socket) in sockets.into_iter().enumerate() {
            groups[i % workers].push(socket);
        }

        let mut handles = Vec::with_capacity(workers);
        let mut spawn_err = None;
        for (id, group) in groups.into_iter().enumerate() {
            let handler = make_handler(id);
            let worker_shutdown = shutdown.clone();
            let (mode, poll_timeout) = (config.poll_mode, config.poll_timeout());

            let spawned = spawn(
                id,
                Box::new(move || {
                    let _guard = StopOnPanic(worker_shutdown.clone());
                    let mut worker = Worker::new(
                        id,
                        group,
                        handler,
                        worker_shutdown,
                        MonotonicClock,
                        mode,
                        poll_timeout,
                    );
                    worker.run();
                }),
            );

            match spawned {
                Ok(handle) => handles.push((id, handle)),
                Err(err) => {
                    error!("Failed to spawn worker {}: {}", id, err);
                    shutdown.trigger();
                    spawn_err = Some(XdpError::Io(err));
                    break;
                }
            }
        }

        let mut result = spawn_err.map_or(Ok(()), Err);
        for (id, handle) in handles {
            if handle.join().is_err() {
                error!("Worker {} panicked", id);
                if result.is_ok() {
                    result = Err(XdpError::WorkerPanicked(id));
                }
            }
        }

        #[cfg(target_os = "linux")]
        drop(control);
        drop(umem);
        info!("AF_XDP engine stopped");
        result
    }
}

/// A worker thread's entry point
type WorkerBody = Box<dyn FnOnce() + Send + 'static>;

/// Stops the other workers when the one holding it unwinds
struct StopOnPanic(Shutdown);

impl Drop for StopOnPanic {
    fn drop(&mut self) {
        if thread::panicking() {
            self.0.trigger();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::af_xdp::Verdict;

    fn small_config(queues: u32) -> XdpConfig {
        XdpConfig {
            queue_count: queues,
            frame_count: 64 * queues,
            frame_size: 2048,
            rx_ring_size: 64,
            tx_ring_size: 64,
            fill_ring_size: 64,
            comp_ring_size: 64,
            rx_batch_size: 16,
            ..Default::default()
        }
    }

    #[test]
    fn test_loopback_partitions_frames() {
        let (engine, nics) = Engine::loopback(small_config(2)).unwrap();
        assert_eq!(nics.len(), 2);
        let sockets = engine.sockets();
        assert_eq!(sockets[0].frames().partition().next(), Some(0));
        assert_eq!(sockets[1].frames().partition().next(), Some(64 * 2048));
        for nic in &nics {
            assert_eq!(nic.fill_level(), 64, "fill ring primed with the whole partition");
        }
    }

    #[test]
    fn test_loopback_rejects_invalid_config() {
        let config = XdpConfig {
            fill_ring_size: 100,
            ..small_config(1)
        };
        assert!(matches!(
            Engine::loopback(config),
            Err(XdpError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_run_stops_on_shutdown() {
        let config = XdpConfig {
            workers: 2,
            ..small_config(2)
        };
        let (engine, _nics) = Engine::loopback(config).unwrap();
        let shutdown = Shutdown::new();
        shutdown.trigger();
        engine
            .run(&shutdown, |_| {
                |_: &mut [u8]| -> anyhow::Result<Verdict> { Ok(Verdict::Drop) }
            })
            .unwrap();
    }

    #[test]
    fn test_worker_panic_is_reported() {
        let (engine, mut nics) = Engine::loopback(small_config(1)).unwrap();
        assert!(nics[0].inject(&[0u8; 64]));
        let shutdown = Shutdown::new();
        let result = engine.run(&shutdown, |_| {
            |_: &mut [u8]| -> anyhow::Result<Verdict> { panic!("handler blew up") }
        });
        assert!(matches!(result, Err(XdpError::WorkerPanicked(0))));
        assert!(shutdown.is_triggered());
    }

    #[test]
    fn test_failed_spawn_stops_started_workers() {
        let config = XdpConfig {
            workers: 2,
            ..small_config(2)
        };
        let (engine, _nics) = Engine::loopback(config).unwrap();
        let shutdown = Shutdown::new();

        let result = engine.run_with(
            &shutdown,
            |_| |_: &mut [u8]| -> anyhow::Result<Verdict> { Ok(Verdict::Drop) },
            |id, body| {
                if id == 1 {
                    Err(io::Error::other("thread limit reached"))
                } else {
                    thread::Builder::new().spawn(body)
                }
            },
        );

        assert!(matches!(result, Err(XdpError::Io(_))));
        assert!(shutdown.is_triggered());
    }
}
