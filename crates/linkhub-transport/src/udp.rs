//! UDP datagram transport bound to a fixed peer.
//!
//! Many device links share one socket per tunnel; each link writes to the
//! peer address it was created for. Closing a link never closes the shared
//! socket.

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;

use crate::traits::{Transport, TransportError};

/// A datagram transport that always sends to the same peer.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    is_open: bool,
}

impl UdpTransport {
    /// Create a transport sending to `peer` over a shared socket.
    #[must_use]
    pub fn new(socket: Arc<UdpSocket>, peer: SocketAddr) -> Self {
        Self {
            socket,
            peer,
            is_open: true,
        }
    }

    /// Get the peer address.
    #[must_use]
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        if !self.is_open {
            return Err(TransportError::ConnectionClosed);
        }
        Ok(self.socket.send_to(data, self.peer).await?)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.is_open = false;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "udp"
    }

    fn remote_addr(&self) -> Option<String> {
        Some(self.peer.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_udp_transport_sends_to_peer() {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = peer.local_addr().unwrap();

        let mut transport = UdpTransport::new(socket.clone(), peer_addr);
        assert_eq!(transport.write(&[0xAA, 0x01]).await.unwrap(), 2);

        let mut buf = [0u8; 16];
        let (n, from) = peer.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &[0xAA, 0x01]);
        assert_eq!(from, socket.local_addr().unwrap());

        transport.close().await.unwrap();
        assert!(matches!(
            transport.write(b"x").await,
            Err(TransportError::ConnectionClosed)
        ));
    }
}
