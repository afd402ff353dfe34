use std::net::{SocketAddr, UdpSocket};

use super::PacketTransport;
use crate::error::Result;

/// UDP transport for outbound RTP packets.
///
/// Binds one socket and sends every packet to a fixed destination. Send
/// failures are logged and the packet is dropped, as with any other loss.
pub struct UdpTransport {
    socket: UdpSocket,
    destination: SocketAddr,
    send_failures: u64,
}

impl UdpTransport {
    /// Bind an ephemeral socket (`0.0.0.0:0`) sending to `destination`.
    pub fn bind(destination: SocketAddr) -> Result<Self> {
        Self::bind_to(SocketAddr::from(([0, 0, 0, 0], 0)), destination)
    }

    pub fn bind_to(local: SocketAddr, destination: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(local)?;
        tracing::info!(local = %socket.local_addr()?, %destination, "UDP transport bound");
        Ok(Self {
            socket,
            destination,
            send_failures: 0,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn destination(&self) -> SocketAddr {
        self.destination
    }

    pub fn send_failures(&self) -> u64 {
        self.send_failures
    }
}

impl PacketTransport for UdpTransport {
    fn send_packet(&mut self, packet: &[u8]) -> Result<()> {
        if let Err(error) = self.socket.send_to(packet, self.destination) {
            self.send_failures += 1;
            tracing::warn!(%error, destination = %self.destination, "RTP packet dropped");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packets_arrive_at_destination() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        let destination = receiver.local_addr().unwrap();
        let mut transport =
            UdpTransport::bind_to("127.0.0.1:0".parse().unwrap(), destination).unwrap();
        transport.send_packet(&[0x80, 0x21, 0, 1]).unwrap();
        let mut buf = [0u8; 16];
        let (n, from) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], &[0x80, 0x21, 0, 1]);
        assert_eq!(from, transport.local_addr().unwrap());
        assert_eq!(transport.send_failures(), 0);
    }
}
