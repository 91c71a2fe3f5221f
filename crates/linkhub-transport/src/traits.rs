//! Transport abstraction traits for Linkhub.
//!
//! These traits define what a link needs from a device connection, allowing
//! the link engine to stay agnostic of stream vs datagram sockets.

use async_trait::async_trait;
use thiserror::Error;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// The outbound half of a device connection.
///
/// Implementations may return fewer bytes than supplied from [`write`];
/// callers decide whether a short write is an error.
///
/// [`write`]: Transport::write
#[async_trait]
pub trait Transport: Send + Sync {
    /// Write a payload, returning the number of bytes accepted.
    async fn write(&mut self, data: &[u8]) -> Result<usize, TransportError>;

    /// Close the connection.
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Get the transport name (e.g., "tcp", "udp").
    fn name(&self) -> &'static str;

    /// Get the remote address of the connection, if available.
    fn remote_addr(&self) -> Option<String> {
        None
    }
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Box<T> {
    async fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        (**self).write(data).await
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        (**self).close().await
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn remote_addr(&self) -> Option<String> {
        (**self).remote_addr()
    }
}
