//! UDP backend - one-way plaintext relay
//!
//! Every payload becomes one datagram sent from a connected socket to the
//! configured backend address. Replies from the backend are not read.

use std::io::ErrorKind;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::net::UdpSocket;
use tracing::{debug, trace};

use crate::common::{PeerAddress, Result};
use crate::error::Error;

use super::Backend;

/// Backend that forwards plaintext as UDP datagrams
pub struct UdpBackend {
    target: SocketAddr,
    socket: UdpSocket,
    forwarded: u64,
}

impl UdpBackend {
    /// Bind an ephemeral socket of the target's family and connect it.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect(target: SocketAddr) -> Result<Self> {
        let local: SocketAddr = match target {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };

        let std_socket = std::net::UdpSocket::bind(local)?;
        std_socket.set_nonblocking(true)?;
        std_socket.connect(target)?;
        let socket = UdpSocket::from_std(std_socket)?;

        debug!("UDP backend: {} -> {}", socket.local_addr()?, target);

        Ok(Self {
            target,
            socket,
            forwarded: 0,
        })
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Payloads forwarded so far
    pub fn forwarded(&self) -> u64 {
        self.forwarded
    }
}

impl Backend for UdpBackend {
    fn name(&self) -> &'static str {
        "udp"
    }

    fn forward(&mut self, peer: &PeerAddress, payload: &[u8]) -> Result<()> {
        match self.socket.try_send(payload) {
            Ok(n) => {
                trace!("UDP backend: {} bytes from {} -> {}", n, peer, self.target);
                self.forwarded += 1;
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => Err(Error::Backend(format!(
                "send buffer full, dropped {} bytes from {}",
                payload.len(),
                peer
            ))),
            Err(e) => Err(Error::Backend(format!(
                "send to {} failed: {}",
                self.target, e
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_udp_backend_forwards() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut backend = UdpBackend::connect(receiver.local_addr().unwrap()).unwrap();
        assert_eq!(backend.target(), receiver.local_addr().unwrap());

        let peer = PeerAddress::unspecified();
        backend.forward(&peer, b"plaintext").unwrap();
        assert_eq!(backend.forwarded(), 1);

        let mut buf = [0u8; 64];
        let (n, from) = receiver.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"plaintext");
        assert_eq!(from.port(), backend.local_addr().unwrap().port());
    }
}
