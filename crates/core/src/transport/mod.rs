//! Outbound packet delivery for the RTP sink.
//!
//! RTP is unacknowledged: [`PacketTransport::send_packet`] is fire-and-forget
//! and a lost packet is never retried.
//!
//! - [`UdpTransport`] ([`udp`]): a bound socket sending to one destination.
//! - [`DiscardTransport`]: drops everything; used for SDP probing.
//! - `Vec<Vec<u8>>`: collects packets in memory.

pub mod udp;

pub use udp::UdpTransport;

use crate::error::Result;

/// Receiver of completed RTP packets.
pub trait PacketTransport {
    fn send_packet(&mut self, packet: &[u8]) -> Result<()>;
}

impl<T: PacketTransport + ?Sized> PacketTransport for &mut T {
    fn send_packet(&mut self, packet: &[u8]) -> Result<()> {
        (**self).send_packet(packet)
    }
}

impl PacketTransport for Vec<Vec<u8>> {
    fn send_packet(&mut self, packet: &[u8]) -> Result<()> {
        self.push(packet.to_vec());
        Ok(())
    }
}

/// Transport that drops every packet.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardTransport;

impl PacketTransport for DiscardTransport {
    fn send_packet(&mut self, _packet: &[u8]) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collector_keeps_packets_in_order() {
        let mut packets: Vec<Vec<u8>> = Vec::new();
        packets.send_packet(&[1, 2]).unwrap();
        (&mut packets).send_packet(&[3]).unwrap();
        assert_eq!(packets, vec![vec![1, 2], vec![3]]);
    }

    #[test]
    fn discard_accepts_anything() {
        assert!(DiscardTransport.send_packet(&[0; 2000]).is_ok());
    }
}
