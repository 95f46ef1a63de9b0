use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};

use super::{Frame, LightingTransport, CHANNELS};
use crate::{ArenaError, Result};

/// Standard Art-Net UDP port.
pub const ARTNET_PORT: u16 = 6454;

const ARTNET_ID: &[u8; 8] = b"Art-Net\0";
const OP_DMX: u16 = 0x5000;
const PROTOCOL_VERSION: u16 = 14;
const HEADER_LEN: usize = 18;

/// Builds an ArtDmx packet carrying a full universe.
pub fn encode_art_dmx(universe: u16, sequence: u8, frame: &Frame) -> Vec<u8> {
    let mut packet = Vec::with_capacity(HEADER_LEN + CHANNELS);
    packet.extend_from_slice(ARTNET_ID);
    packet.extend_from_slice(&OP_DMX.to_le_bytes());
    packet.extend_from_slice(&PROTOCOL_VERSION.to_be_bytes());
    packet.push(sequence);
    packet.push(0); // physical port
    // 15-bit port address: SubUni then Net.
    packet.push((universe & 0xff) as u8);
    packet.push(((universe >> 8) & 0x7f) as u8);
    packet.extend_from_slice(&(CHANNELS as u16).to_be_bytes());
    packet.extend_from_slice(frame);
    packet
}

/// Sends frames to a single Art-Net node.
#[derive(Debug)]
pub struct ArtNetTransport {
    socket: UdpSocket,
    target: SocketAddr,
    sequence: u8,
}

impl ArtNetTransport {
    /// Resolves `target` (the port defaults to [`ARTNET_PORT`]) and binds an
    /// ephemeral local socket.
    pub fn connect(target: &str) -> Result<Self> {
        let target = resolve(target)?;
        let socket = UdpSocket::bind(("0.0.0.0", 0))?;
        socket.set_broadcast(true)?;
        tracing::info!(%target, "art-net output ready");
        Ok(Self {
            socket,
            target,
            sequence: 0,
        })
    }

    fn next_sequence(&mut self) -> u8 {
        // 0 tells receivers sequencing is off, so wrap 255 -> 1.
        self.sequence = self.sequence.checked_add(1).unwrap_or(1);
        self.sequence
    }
}

impl LightingTransport for ArtNetTransport {
    fn send_frame(&mut self, universe: u16, frame: &Frame) -> Result<()> {
        let sequence = self.next_sequence();
        let packet = encode_art_dmx(universe, sequence, frame);
        self.socket.send_to(&packet, self.target)?;
        Ok(())
    }
}

fn resolve(target: &str) -> Result<SocketAddr> {
    let with_port = if target.contains(':') {
        target.to_string()
    } else {
        format!("{target}:{ARTNET_PORT}")
    };
    with_port
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| ArenaError::msg(format!("could not resolve art-net node `{target}`")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn art_dmx_header_layout() {
        let mut frame = [0u8; CHANNELS];
        frame[0] = 0xAB;
        let packet = encode_art_dmx(0x0123, 7, &frame);

        assert_eq!(packet.len(), 530);
        assert_eq!(&packet[..8], b"Art-Net\0");
        assert_eq!(&packet[8..10], &[0x00, 0x50]);
        assert_eq!(&packet[10..12], &[0, 14]);
        assert_eq!(packet[12], 7);
        assert_eq!(&packet[14..16], &[0x23, 0x01]);
        assert_eq!(&packet[16..18], &[0x02, 0x00]);
        assert_eq!(packet[18], 0xAB);
    }

    #[test]
    fn sequence_skips_zero() {
        let mut transport = ArtNetTransport::connect("127.0.0.1").unwrap();
        transport.sequence = 254;
        assert_eq!(transport.next_sequence(), 255);
        assert_eq!(transport.next_sequence(), 1);
    }

    #[test]
    fn delivers_frames_to_node() {
        let node = UdpSocket::bind("127.0.0.1:0").unwrap();
        let address = node.local_addr().unwrap().to_string();
        let mut transport = ArtNetTransport::connect(&address).unwrap();

        let frame = [9u8; CHANNELS];
        transport.send_frame(1, &frame).unwrap();

        let mut buf = [0u8; 600];
        node.set_read_timeout(Some(std::time::Duration::from_secs(2)))
            .unwrap();
        let (len, _) = node.recv_from(&mut buf).unwrap();
        assert_eq!(len, 530);
        assert_eq!(buf[14], 1);
        assert_eq!(buf[529], 9);
    }
}
