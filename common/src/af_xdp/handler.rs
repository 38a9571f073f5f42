//! Per-frame packet handlers

use anyhow::Result;

/// What to do with a frame after the handler has seen it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Transmit the (possibly rewritten) frame on the socket it arrived on
    Forward,
    /// Return the frame to the allocator
    Drop,
}

/// Per-frame transform run by the dispatch loop.
///
/// `frame` is exactly the received bytes and may be rewritten in place; it
/// cannot outlive the call. An `Err` is counted and treated as [`Verdict::Drop`].
pub trait PacketHandler {
    fn handle(&mut self, frame: &mut [u8]) -> Result<Verdict>;
}

impl<F> PacketHandler for F
where
    F: FnMut(&mut [u8]) -> Result<Verdict>,
{
    #[inline]
    fn handle(&mut self, frame: &mut [u8]) -> Result<Verdict> {
        self(frame)
    }
}

const ETH_ALEN: usize = 6;
const ETH_HLEN: usize = 14;
const ETH_P_IP: u16 = 0x0800;
const IPV4_MIN_HLEN: usize = 20;
const IPPROTO_TCP: u8 = 6;
const IPPROTO_UDP: u8 = 17;

/// Echoes IPv4 frames back where they came from.
///
/// Swaps Ethernet source/destination, IPv4 source/destination and, for UDP
/// and TCP, the ports. The swaps leave every checksum valid. Anything that is
/// not a well-formed IPv4 frame is dropped.
#[derive(Debug, Clone, Copy, Default)]
pub struct Reflector;

impl PacketHandler for Reflector {
    fn handle(&mut self, frame: &mut [u8]) -> Result<Verdict> {
        if frame.len() < ETH_HLEN + IPV4_MIN_HLEN {
            return Ok(Verdict::Drop);
        }
        if u16::from_be_bytes([frame[12], frame[13]]) != ETH_P_IP {
            return Ok(Verdict::Drop);
        }

        let version = frame[ETH_HLEN] >> 4;
        let ihl = (frame[ETH_HLEN] & 0x0F) as usize * 4;
        if version != 4 || ihl < IPV4_MIN_HLEN || frame.len() < ETH_HLEN + ihl {
            return Ok(Verdict::Drop);
        }

        for i in 0..ETH_ALEN {
            frame.swap(i, ETH_ALEN + i);
        }

        // saddr at 12..16, daddr at 16..20 of the IP header
        let ip = ETH_HLEN;
        for i in 0..4 {
            frame.swap(ip + 12 + i, ip + 16 + i);
        }

        let protocol = frame[ip + 9];
        let l4 = ip + ihl;
        if matches!(protocol, IPPROTO_UDP | IPPROTO_TCP) && frame.len() >= l4 + 4 {
            frame.swap(l4, l4 + 2);
            frame.swap(l4 + 1, l4 + 3);
        }

        Ok(Verdict::Forward)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Ethernet + IPv4 + UDP frame with a short payload
    fn udp_frame(src_port: u16, dst_port: u16) -> Vec<u8> {
        let mut frame = vec![0u8; 60];
        frame[0..6].copy_from_slice(&[0x9c, 0xdc, 0x71, 0x5d, 0x01, 0x81]); // dst MAC
        frame[6..12].copy_from_slice(&[0x9c, 0xdc, 0x71, 0x5d, 0x41, 0xf1]); // src MAC
        frame[12..14].copy_from_slice(&ETH_P_IP.to_be_bytes());
        frame[14] = 0x45;
        frame[23] = IPPROTO_UDP;
        frame[26..30].copy_from_slice(&[192, 168, 6, 1]);
        frame[30..34].copy_from_slice(&[192, 168, 6, 2]);
        frame[34..36].copy_from_slice(&src_port.to_be_bytes());
        frame[36..38].copy_from_slice(&dst_port.to_be_bytes());
        frame
    }

    #[test]
    fn test_reflector_swaps_addresses() {
        let mut frame = udp_frame(8889, 53);
        assert_eq!(Reflector.handle(&mut frame).unwrap(), Verdict::Forward);

        assert_eq!(&frame[0..6], &[0x9c, 0xdc, 0x71, 0x5d, 0x41, 0xf1]);
        assert_eq!(&frame[6..12], &[0x9c, 0xdc, 0x71, 0x5d, 0x01, 0x81]);
        assert_eq!(&frame[26..30], &[192, 168, 6, 2]);
        assert_eq!(&frame[30..34], &[192, 168, 6, 1]);
        assert_eq!(u16::from_be_bytes([frame[34], frame[35]]), 53);
        assert_eq!(u16::from_be_bytes([frame[36], frame[37]]), 8889);
    }

    #[test]
    fn test_reflector_is_an_involution() {
        let original = udp_frame(1234, 4321);
        let mut frame = original.clone();
        Reflector.handle(&mut frame).unwrap();
        Reflector.handle(&mut frame).unwrap();
        assert_eq!(frame, original);
    }

    #[test]
    fn test_reflector_respects_ihl() {
        let mut frame = udp_frame(1, 2);
        frame.splice(34..34, [0u8; 4]);
        frame[14] = 0x46; // 24-byte header
        frame[38..40].copy_from_slice(&1111u16.to_be_bytes());
        frame[40..42].copy_from_slice(&2222u16.to_be_bytes());
        Reflector.handle(&mut frame).unwrap();
        assert_eq!(u16::from_be_bytes([frame[38], frame[39]]), 2222);
        assert_eq!(u16::from_be_bytes([frame[40], frame[41]]), 1111);
    }

    #[test]
    fn test_reflector_leaves_ports_of_other_protocols() {
        let mut frame = udp_frame(7, 9);
        frame[23] = 1; // ICMP
        Reflector.handle(&mut frame).unwrap();
        assert_eq!(u16::from_be_bytes([frame[34], frame[35]]), 7);
    }

    #[test]
    fn test_reflector_drops_malformed() {
        let mut short = vec![0u8; 20];
        assert_eq!(Reflector.handle(&mut short).unwrap(), Verdict::Drop);

        let mut arp = udp_frame(1, 2);
        arp[12..14].copy_from_slice(&0x0806u16.to_be_bytes());
        assert_eq!(Reflector.handle(&mut arp).unwrap(), Verdict::Drop);

        let mut bad_ihl = udp_frame(1, 2);
        bad_ihl[14] = 0x44;
        assert_eq!(Reflector.handle(&mut bad_ihl).unwrap(), Verdict::Drop);

        let mut truncated = udp_frame(1, 2);
        truncated[14] = 0x4F; // 60-byte header does not fit
        assert_eq!(Reflector.handle(&mut truncated).unwrap(), Verdict::Drop);
    }

    #[test]
    fn test_closure_handler() {
        let mut seen = 0;
        let mut handler = |frame: &mut [u8]| {
            seen += frame.len();
            Ok::<_, anyhow::Error>(Verdict::Drop)
        };
        assert_eq!(handler.handle(&mut [0u8; 10]).unwrap(), Verdict::Drop);
        drop(handler);
        assert_eq!(seen, 10);
    }
}
