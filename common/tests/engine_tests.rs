//! Tests for the AF_XDP engine driven through the in-process loopback NIC

use std::cell::Cell;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::bail;
use proptest::prelude::*;
use xskpump_common::af_xdp::{
    Clock, Engine, LoopState, LoopbackNic, ManualClock, PacketHandler, PollMode, Reflector,
    Shutdown, Verdict, Worker, XdpConfig, XdpStats, XskSocket,
};

const FRAME_SIZE: u32 = 2048;
const TIMEOUT: Duration = Duration::from_millis(500);

fn config(frames: u32, tx_batch: u32) -> XdpConfig {
    XdpConfig {
        interface: "loop0".into(),
        queue_count: 1,
        frame_count: frames,
        frame_size: FRAME_SIZE,
        rx_ring_size: 64,
        tx_ring_size: 64,
        fill_ring_size: 64,
        comp_ring_size: 64,
        rx_batch_size: 16,
        tx_batch_size: tx_batch,
        tx_flush_timeout_ms: TIMEOUT.as_millis() as u64,
        ..Default::default()
    }
}

/// Ethernet + IPv4 + UDP, 60 bytes, `tag` as the first payload byte
fn udp_frame(seq: u16, tag: u8) -> Vec<u8> {
    let mut frame = vec![0u8; 60];
    frame[0..6].copy_from_slice(&[0x02, 0, 0, 0, 0, 0x01]);
    frame[6..12].copy_from_slice(&[0x02, 0, 0, 0, 0, 0x02]);
    frame[12..14].copy_from_slice(&0x0800u16.to_be_bytes());
    frame[14] = 0x45;
    frame[23] = 17;
    frame[26..30].copy_from_slice(&[10, 0, 0, 1]);
    frame[30..34].copy_from_slice(&[10, 0, 0, 2]);
    frame[34..36].copy_from_slice(&seq.to_be_bytes());
    frame[36..38].copy_from_slice(&9u16.to_be_bytes());
    frame[42] = tag;
    frame
}

fn worker<H: PacketHandler>(
    config: XdpConfig,
    handler: H,
    clock: &ManualClock,
    shutdown: &Shutdown,
) -> (Worker<H, ManualClock>, Vec<LoopbackNic>) {
    let (engine, nics) = Engine::loopback_at(config.clone(), clock.now()).unwrap();
    let worker = Worker::new(
        0,
        engine.into_sockets(),
        handler,
        shutdown.clone(),
        clock.clone(),
        PollMode::Busy,
        config.poll_timeout(),
    );
    (worker, nics)
}

fn forward_all(_: &mut [u8]) -> anyhow::Result<Verdict> {
    Ok(Verdict::Forward)
}

/// Every frame of each socket's partition is accounted for exactly once
fn assert_conserved(sockets: &[XskSocket], nics: &[LoopbackNic]) {
    for (socket, nic) in sockets.iter().zip(nics) {
        let mut seen = socket.visible_frames();
        seen.extend(nic.held_frames());
        seen.sort_unstable();
        let expected: Vec<u64> = socket.frames().partition().collect();
        assert_eq!(seen, expected, "queue {}", socket.queue_id());
    }
}

fn counter(socket: &XskSocket, pick: impl Fn(&XdpStats) -> &AtomicU64) -> u64 {
    pick(socket.stats()).load(Ordering::Relaxed)
}

// ============================================================================
// Frame Conservation
// ============================================================================

#[derive(Debug, Clone)]
enum Action {
    /// Receive frames tagged Forward (0), Drop (1) or handler error (2)
    Inject(Vec<u8>),
    Step,
    TakeTx(u32),
    Complete(u32),
    Advance(u64),
}

fn action() -> impl Strategy<Value = Action> {
    prop_oneof![
        prop::collection::vec(0u8..3, 0..24).prop_map(Action::Inject),
        Just(Action::Step),
        (0u32..32).prop_map(Action::TakeTx),
        (0u32..32).prop_map(Action::Complete),
        (0u64..700).prop_map(Action::Advance),
    ]
}

fn tagged(frame: &mut [u8]) -> anyhow::Result<Verdict> {
    match frame[42] {
        0 => Ok(Verdict::Forward),
        1 => Ok(Verdict::Drop),
        tag => bail!("rejected tag {tag}"),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn frames_are_conserved(actions in prop::collection::vec(action(), 1..80)) {
        let clock = ManualClock::new();
        let shutdown = Shutdown::new();
        let (mut worker, mut nics) = worker(config(32, 4), tagged, &clock, &shutdown);

        let mut seq = 0u16;
        for action in actions {
            match action {
                Action::Inject(tags) => {
                    let packets: Vec<Vec<u8>> = tags
                        .iter()
                        .map(|&tag| {
                            seq = seq.wrapping_add(1);
                            udp_frame(seq, tag)
                        })
                        .collect();
                    nics[0].inject_batch(&packets);
                }
                Action::Step => {
                    worker.step();
                }
                Action::TakeTx(n) => {
                    nics[0].take_tx(n);
                }
                Action::Complete(n) => {
                    nics[0].complete(n);
                }
                Action::Advance(ms) => clock.advance(Duration::from_millis(ms)),
            }
            assert_conserved(worker.sockets(), &nics);
        }

        shutdown.trigger();
        worker.run();
        assert_conserved(worker.sockets(), &nics);
        prop_assert_eq!(worker.sockets()[0].pending_tx(), 0);
    }
}

// ============================================================================
// Batch / Flush Policy
// ============================================================================

#[test]
fn test_batch_threshold_submits_once() {
    let clock = ManualClock::new();
    let shutdown = Shutdown::new();
    let (mut worker, mut nics) = worker(config(128, 4), forward_all, &clock, &shutdown);

    let packets: Vec<_> = (0..4).map(|i| udp_frame(i, 0)).collect();
    assert_eq!(nics[0].inject_batch(&packets), 4);

    assert_eq!(worker.step(), LoopState::Draining);
    assert_eq!(nics[0].take_tx(64).len(), 4);

    for _ in 0..5 {
        assert_eq!(worker.step(), LoopState::Idle);
    }
    assert!(nics[0].take_tx(64).is_empty());

    let socket = &worker.sockets()[0];
    assert_eq!(counter(socket, |s| &s.tx_batches), 1);
    assert_eq!(counter(socket, |s| &s.tx_packets), 4);
    assert_eq!(counter(socket, |s| &s.timeout_flushes), 0);
}

#[test]
fn test_partial_batch_flushes_once_after_timeout() {
    let clock = ManualClock::new();
    let shutdown = Shutdown::new();
    let (mut worker, mut nics) = worker(config(128, 8), forward_all, &clock, &shutdown);

    let packets: Vec<_> = (0..3).map(|i| udp_frame(i, 0)).collect();
    nics[0].inject_batch(&packets);
    assert_eq!(worker.step(), LoopState::Draining);
    assert!(nics[0].take_tx(64).is_empty());
    assert_eq!(worker.sockets()[0].pending_tx(), 3);

    clock.advance(TIMEOUT - Duration::from_millis(1));
    assert_eq!(worker.step(), LoopState::Idle);
    assert!(nics[0].take_tx(64).is_empty());

    clock.advance(Duration::from_millis(1));
    assert_eq!(worker.step(), LoopState::Flushing);
    assert_eq!(nics[0].take_tx(64).len(), 3);

    clock.advance(TIMEOUT * 4);
    assert_eq!(worker.step(), LoopState::Idle);
    assert!(nics[0].take_tx(64).is_empty());

    let socket = &worker.sockets()[0];
    assert_eq!(counter(socket, |s| &s.timeout_flushes), 1);
    assert_eq!(counter(socket, |s| &s.tx_batches), 1);
}

#[test]
fn test_rx_activity_defers_timeout() {
    let clock = ManualClock::new();
    let shutdown = Shutdown::new();
    let (mut worker, mut nics) = worker(config(128, 8), forward_all, &clock, &shutdown);

    nics[0].inject(&udp_frame(1, 0));
    worker.step();
    clock.advance(Duration::from_millis(400));
    nics[0].inject(&udp_frame(2, 0));
    worker.step();

    clock.advance(Duration::from_millis(400));
    worker.step();
    assert!(nics[0].take_tx(64).is_empty(), "idle time counts from the last drain");

    clock.advance(Duration::from_millis(100));
    assert_eq!(worker.step(), LoopState::Flushing);
    assert_eq!(nics[0].take_tx(64).len(), 2);
}

// ============================================================================
// Backpressure
// ============================================================================

#[test]
fn test_exhausted_allocator_does_not_stall_loop() {
    let clock = ManualClock::new();
    let shutdown = Shutdown::new();
    let (mut worker, mut nics) = worker(config(16, 4), forward_all, &clock, &shutdown);

    assert_eq!(nics[0].fill_level(), 16, "partition smaller than the fill ring");
    assert_eq!(worker.sockets()[0].frames().available(), 0);

    let packets: Vec<_> = (0..16).map(|i| udp_frame(i, 0)).collect();
    assert_eq!(nics[0].inject_batch(&packets), 16);
    assert_eq!(worker.step(), LoopState::Draining);
    assert_eq!(counter(&worker.sockets()[0], |s| &s.fill_shortfall), 1);

    // every frame is on TX now; nothing left to receive into
    assert!(!nics[0].inject(&udp_frame(99, 0)));
    for _ in 0..3 {
        assert_eq!(worker.step(), LoopState::Idle);
    }
    assert_conserved(worker.sockets(), &nics);

    assert_eq!(nics[0].drain_tx().len(), 16);
    worker.step();
    worker.step();
    assert_eq!(worker.sockets()[0].outstanding_tx(), 0);
    assert_eq!(nics[0].fill_level(), 16);
    assert!(nics[0].inject(&udp_frame(100, 0)));
    assert_conserved(worker.sockets(), &nics);
}

#[test]
fn test_full_tx_ring_drops_and_recycles() {
    let clock = ManualClock::new();
    let shutdown = Shutdown::new();
    let config = XdpConfig {
        tx_ring_size: 4,
        ..config(16, 4)
    };
    let (mut worker, mut nics) = worker(config, forward_all, &clock, &shutdown);

    let packets: Vec<_> = (0..16).map(|i| udp_frame(i, 0)).collect();
    nics[0].inject_batch(&packets);
    worker.step();

    let socket = &worker.sockets()[0];
    assert_eq!(counter(socket, |s| &s.tx_packets), 4);
    assert_eq!(counter(socket, |s| &s.tx_dropped), 12);
    assert_conserved(worker.sockets(), &nics);
}

// ============================================================================
// End to End
// ============================================================================

#[test]
fn test_reflects_every_frame() {
    const M: u16 = 40;
    let clock = ManualClock::new();
    let shutdown = Shutdown::new();
    let (mut worker, mut nics) = worker(config(128, 8), Reflector, &clock, &shutdown);

    let mut sent = 0;
    let mut reflected = Vec::new();
    while reflected.len() < M as usize {
        let batch: Vec<_> = (sent..M.min(sent + 12)).map(|i| udp_frame(i, 0)).collect();
        sent += nics[0].inject_batch(&batch) as u16;
        worker.step();
        reflected.extend(nics[0].drain_tx());
        clock.advance(Duration::from_millis(1));
    }
    worker.step();

    assert_eq!(reflected.len(), M as usize);
    for (i, frame) in reflected.iter().enumerate() {
        assert_eq!(&frame.data[0..6], &[0x02, 0, 0, 0, 0, 0x02]);
        assert_eq!(&frame.data[26..30], &[10, 0, 0, 2]);
        assert_eq!(u16::from_be_bytes([frame.data[36], frame.data[37]]), i as u16);
    }

    let socket = &worker.sockets()[0];
    assert_eq!(socket.outstanding_tx(), 0);
    assert_eq!(counter(socket, |s| &s.rx_packets), M as u64);
    assert_eq!(counter(socket, |s| &s.tx_packets), M as u64);
    assert_eq!(counter(socket, |s| &s.rx_bytes), M as u64 * 60);
    assert_eq!(counter(socket, |s| &s.tx_bytes), M as u64 * 60);
    assert_eq!(nics[0].in_flight(), 0);
    assert_conserved(worker.sockets(), &nics);
}

#[test]
fn test_handler_errors_drop_frame() {
    let clock = ManualClock::new();
    let shutdown = Shutdown::new();
    let (mut worker, mut nics) = worker(config(64, 1), tagged, &clock, &shutdown);

    nics[0].inject_batch(&[udp_frame(1, 0), udp_frame(2, 1), udp_frame(3, 2)]);
    worker.step();

    let socket = &worker.sockets()[0];
    assert_eq!(counter(socket, |s| &s.handler_errors), 1);
    assert_eq!(counter(socket, |s| &s.rx_dropped), 2);
    assert_eq!(nics[0].take_tx(64).len(), 1);
}

#[test]
fn test_headroom_offsets_descriptors() {
    let clock = ManualClock::new();
    let shutdown = Shutdown::new();
    let config = XdpConfig {
        headroom: 256,
        ..config(64, 1)
    };
    let (mut worker, mut nics) = worker(config, Reflector, &clock, &shutdown);

    nics[0].inject(&udp_frame(7, 0));
    worker.step();
    let out = nics[0].drain_tx();
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].addr % FRAME_SIZE as u64, 256);
    worker.step();
    assert_conserved(worker.sockets(), &nics);
}

#[test]
fn test_engine_run_on_worker_threads() {
    const M: usize = 200;
    let config = XdpConfig {
        queue_count: 2,
        workers: 2,
        tx_flush_timeout_ms: 1,
        ..config(256, 8)
    };
    let (engine, mut nics) = Engine::loopback(config).unwrap();
    let stats = engine.stats_handles();
    let shutdown = Shutdown::new();

    let runner = {
        let shutdown = shutdown.clone();
        thread::spawn(move || engine.run(&shutdown, |_| Reflector))
    };

    let deadline = Instant::now() + Duration::from_secs(10);
    let mut received = [0usize; 2];
    let mut sent = [0usize; 2];
    while received.iter().sum::<usize>() < 2 * M && Instant::now() < deadline {
        for (q, nic) in nics.iter_mut().enumerate() {
            if sent[q] < M {
                let seq = sent[q] as u16;
                if nic.inject(&udp_frame(seq, 0)) {
                    sent[q] += 1;
                }
            }
            received[q] += nic.drain_tx().len();
        }
        thread::yield_now();
    }

    shutdown.trigger();
    runner.join().unwrap().unwrap();

    assert_eq!(received, [M, M]);
    for (queue, stats) in stats {
        let rx = stats.rx_packets.load(Ordering::Relaxed);
        assert_eq!(rx, M as u64, "queue {queue}");
    }
}

// ============================================================================
// Shutdown
// ============================================================================

#[test]
fn test_shutdown_mid_drain_finishes_pass() {
    let clock = ManualClock::new();
    let shutdown = Shutdown::new();

    let seen = Rc::new(Cell::new(0));
    let handler = {
        let seen = seen.clone();
        let shutdown = shutdown.clone();
        move |_: &mut [u8]| -> anyhow::Result<Verdict> {
            seen.set(seen.get() + 1);
            if seen.get() == 3 {
                shutdown.trigger();
            }
            Ok(Verdict::Forward)
        }
    };
    let (mut worker, mut nics) = worker(config(64, 4), handler, &clock, &shutdown);

    let packets: Vec<_> = (0..10).map(|i| udp_frame(i, 0)).collect();
    assert_eq!(nics[0].inject_batch(&packets), 10);

    worker.run();

    assert_eq!(seen.get(), 10, "the pass in progress completes");
    assert_eq!(worker.state(), LoopState::ShuttingDown);
    let socket = &worker.sockets()[0];
    assert_eq!(counter(socket, |s| &s.rx_packets), 10);
    assert_eq!(counter(socket, |s| &s.tx_packets), 8);
    assert_eq!(socket.pending_tx(), 0, "partial batch abandoned");
    assert_eq!(nics[0].take_tx(64).len(), 8);
    assert_conserved(worker.sockets(), &nics);
}
