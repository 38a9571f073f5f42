//! Synthetic traffic for `--loopback` runs

use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info};
use xskpump_common::af_xdp::{LoopbackNic, Shutdown};

const FRAME_LEN: usize = 64;
const BURST: usize = 64;

/// A 64-byte Ethernet/IPv4/UDP frame carrying `seq` in its payload
pub fn synthetic_frame(seq: u32) -> Vec<u8> {
    let mut frame = vec![0u8; FRAME_LEN];

    frame[0..6].copy_from_slice(&[0x02, 0x00, 0x00, 0x00, 0x00, 0x01]);
    frame[6..12].copy_from_slice(&[0x02, 0x00, 0x00, 0x00, 0x00, 0x02]);
    frame[12..14].copy_from_slice(&0x0800u16.to_be_bytes());

    let ip = &mut frame[14..34];
    ip[0] = 0x45;
    ip[2..4].copy_from_slice(&((FRAME_LEN - 14) as u16).to_be_bytes());
    ip[8] = 64;
    ip[9] = 17;
    ip[12..16].copy_from_slice(&[10, 0, 0, 1]);
    ip[16..20].copy_from_slice(&[10, 0, 0, 2]);
    let csum = ipv4_checksum(ip);
    ip[10..12].copy_from_slice(&csum.to_be_bytes());

    let udp = &mut frame[34..42];
    udp[0..2].copy_from_slice(&9000u16.to_be_bytes());
    udp[2..4].copy_from_slice(&9001u16.to_be_bytes());
    udp[4..6].copy_from_slice(&((FRAME_LEN - 34) as u16).to_be_bytes());

    frame[42..46].copy_from_slice(&seq.to_be_bytes());
    frame
}

fn ipv4_checksum(header: &[u8]) -> u16 {
    let mut sum: u32 = header
        .chunks_exact(2)
        .map(|w| u16::from_be_bytes([w[0], w[1]]) as u32)
        .sum();
    while sum > 0xFFFF {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

/// Feed every NIC bursts of synthetic frames and reap what comes back until
/// `shutdown` triggers. The thread returns the number of reflected frames.
pub fn spawn_generator(
    mut nics: Vec<LoopbackNic>,
    shutdown: Shutdown,
) -> std::io::Result<JoinHandle<u64>> {
    thread::Builder::new()
        .name("xsk-loopback".into())
        .spawn(move || {
            let mut seq = 0u32;
            let mut sent = 0u64;
            let mut reflected = 0u64;

            while !shutdown.is_triggered() {
                let mut progress = false;
                for nic in &mut nics {
                    let burst: Vec<Vec<u8>> = (0..BURST)
                        .map(|i| synthetic_frame(seq.wrapping_add(i as u32)))
                        .collect();
                    let injected = nic.inject_batch(&burst);
                    seq = seq.wrapping_add(injected as u32);
                    sent += injected as u64;

                    let back = nic.drain_tx().len();
                    reflected += back as u64;
                    progress |= injected > 0 || back > 0;
                }
                if !progress {
                    thread::sleep(Duration::from_micros(100));
                }
            }

            for nic in &mut nics {
                reflected += nic.drain_tx().len() as u64;
                debug!("Loopback queue {} stopped, {} frames in flight", nic.queue_id(), nic.in_flight());
            }
            info!("Loopback generator sent {} frames, {} reflected", sent, reflected);
            reflected
        })
}
