//! TCP stream transport.
//!
//! A stream is split in two: the read half stays with the acceptor, which
//! pumps inbound bytes into the link, and the write half becomes the link's
//! [`Transport`].

use async_trait::async_trait;
use std::net::SocketAddr;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::debug;

use crate::traits::{Transport, TransportError};

/// Write half of an accepted TCP connection.
pub struct TcpTransport {
    writer: OwnedWriteHalf,
    remote_addr: Option<SocketAddr>,
    is_open: bool,
}

impl TcpTransport {
    /// Get the peer socket address, if it was known at accept time.
    #[must_use]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }
}

/// Split a TCP stream into its read half and a link transport.
#[must_use]
pub fn split(stream: TcpStream) -> (OwnedReadHalf, TcpTransport) {
    let remote_addr = stream.peer_addr().ok();
    let (reader, writer) = stream.into_split();
    let transport = TcpTransport {
        writer,
        remote_addr,
        is_open: true,
    };
    (reader, transport)
}

#[async_trait]
impl Transport for TcpTransport {
    async fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        if !self.is_open {
            return Err(TransportError::ConnectionClosed);
        }

        // write_all loops until the whole payload is on the wire
        self.writer.write_all(data).await?;
        Ok(data.len())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if !self.is_open {
            return Ok(());
        }
        self.is_open = false;

        debug!(remote = ?self.remote_addr, "Shutting down TCP write half");
        self.writer.shutdown().await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "tcp"
    }

    fn remote_addr(&self) -> Option<String> {
        self.remote_addr.map(|a| a.to_string())
    }
}
