use crate::error::{BlockchainError, Result};
use crate::network::packet::{write_packet, Packet};
use log::debug;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

/// Outbound delivery of one packet to one peer. Any failure to reach the
/// peer is reported as `PeerUnreachable`.
pub trait Transport: Send + Sync {
    fn send(&self, addr: &str, packet: &Packet) -> Result<()>;
}

/// One short-lived TCP connection per packet, bounded by timeouts.
pub struct TcpTransport {
    dial_timeout: Duration,
    io_timeout: Duration,
    max_frame_bytes: usize,
}

impl TcpTransport {
    pub fn new(dial_timeout: Duration, io_timeout: Duration, max_frame_bytes: usize) -> Self {
        TcpTransport {
            dial_timeout,
            io_timeout,
            max_frame_bytes,
        }
    }

    fn unreachable(addr: &str, reason: impl std::fmt::Display) -> BlockchainError {
        BlockchainError::PeerUnreachable(format!("{addr}: {reason}"))
    }
}

impl Transport for TcpTransport {
    fn send(&self, addr: &str, packet: &Packet) -> Result<()> {
        debug!("Sending {:?} to {addr}", packet.command);

        let socket_addr = addr
            .to_socket_addrs()
            .map_err(|e| Self::unreachable(addr, e))?
            .next()
            .ok_or_else(|| Self::unreachable(addr, "address did not resolve"))?;

        let mut stream = TcpStream::connect_timeout(&socket_addr, self.dial_timeout)
            .map_err(|e| Self::unreachable(addr, e))?;
        stream
            .set_write_timeout(Some(self.io_timeout))
            .map_err(|e| Self::unreachable(addr, e))?;

        write_packet(&mut stream, packet, self.max_frame_bytes).map_err(|e| match e {
            BlockchainError::Io(reason) => Self::unreachable(addr, reason),
            other => other,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::packet::{read_packet, Message};
    use std::net::TcpListener;
    use std::thread;

    fn transport() -> TcpTransport {
        TcpTransport::new(Duration::from_millis(500), Duration::from_millis(500), 1 << 20)
    }

    #[test]
    fn test_delivers_one_frame() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let receiver = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            read_packet(&mut stream, 1 << 20).unwrap()
        });

        let packet = Packet::new("me", &addr, &Message::GetBlocks { count: 3 }).unwrap();
        transport().send(&addr, &packet).unwrap();
        assert_eq!(receiver.join().unwrap(), packet);
    }

    #[test]
    fn test_closed_port_is_unreachable() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().to_string()
        };
        let packet = Packet::new("me", &addr, &Message::GetBlocks { count: 3 }).unwrap();

        let err = transport().send(&addr, &packet).unwrap_err();
        assert!(matches!(err, BlockchainError::PeerUnreachable(_)));

        let err = transport().send("not an address", &packet).unwrap_err();
        assert!(matches!(err, BlockchainError::PeerUnreachable(_)));
    }
}
