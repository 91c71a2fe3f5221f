//! In-memory transport.
//!
//! Records every write so tests and benchmarks can observe exactly what a
//! link put on the wire. Failure modes can be toggled through the shared
//! [`MemoryHandle`].

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::traits::{Transport, TransportError};

#[derive(Debug, Default)]
struct Shared {
    writes: Vec<Bytes>,
    closed: bool,
    fail_writes: bool,
    fail_close: bool,
    short_write: Option<usize>,
}

/// A transport that stores written payloads in memory.
#[derive(Debug)]
pub struct MemoryTransport {
    shared: Arc<Mutex<Shared>>,
}

/// Observer and control side of a [`MemoryTransport`].
#[derive(Debug, Clone)]
pub struct MemoryHandle {
    shared: Arc<Mutex<Shared>>,
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MemoryTransport {
    /// Create a transport and the handle observing it.
    #[must_use]
    pub fn new() -> (Self, MemoryHandle) {
        let shared = Arc::new(Mutex::new(Shared::default()));
        (
            Self {
                shared: shared.clone(),
            },
            MemoryHandle { shared },
        )
    }
}

impl MemoryHandle {
    /// All payloads written so far, in order.
    #[must_use]
    pub fn writes(&self) -> Vec<Bytes> {
        lock(&self.shared).writes.clone()
    }

    /// Number of successful writes.
    #[must_use]
    pub fn write_count(&self) -> usize {
        lock(&self.shared).writes.len()
    }

    /// Whether `close` has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        lock(&self.shared).closed
    }

    /// Make subsequent writes fail with a broken pipe.
    pub fn fail_writes(&self, fail: bool) {
        lock(&self.shared).fail_writes = fail;
    }

    /// Make `close` fail with an I/O error.
    pub fn fail_close(&self, fail: bool) {
        lock(&self.shared).fail_close = fail;
    }

    /// Accept at most `limit` bytes per write.
    pub fn short_write(&self, limit: Option<usize>) {
        lock(&self.shared).short_write = limit;
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        // Suspend like a socket write would, so concurrent callers can interleave
        tokio::task::yield_now().await;

        let mut shared = lock(&self.shared);
        if shared.closed {
            return Err(TransportError::ConnectionClosed);
        }
        if shared.fail_writes {
            return Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "write failed").into());
        }

        let n = shared.short_write.map_or(data.len(), |limit| limit.min(data.len()));
        shared.writes.push(Bytes::copy_from_slice(&data[..n]));
        Ok(n)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        let mut shared = lock(&self.shared);
        shared.closed = true;
        if shared.fail_close {
            return Err(std::io::Error::new(std::io::ErrorKind::Other, "close failed").into());
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_transport_records_writes() {
        let (mut transport, handle) = MemoryTransport::new();

        transport.write(b"one").await.unwrap();
        transport.write(b"two").await.unwrap();
        assert_eq!(handle.writes(), vec![Bytes::from("one"), Bytes::from("two")]);

        transport.close().await.unwrap();
        assert!(handle.is_closed());
        assert!(transport.write(b"three").await.is_err());
        assert_eq!(handle.write_count(), 2);
    }

    #[tokio::test]
    async fn test_memory_transport_failure_modes() {
        let (mut transport, handle) = MemoryTransport::new();

        handle.short_write(Some(2));
        assert_eq!(transport.write(b"hello").await.unwrap(), 2);
        assert_eq!(handle.writes(), vec![Bytes::from("he")]);

        handle.short_write(None);
        handle.fail_writes(true);
        assert!(matches!(
            transport.write(b"x").await,
            Err(TransportError::Io(_))
        ));

        handle.fail_close(true);
        assert!(transport.close().await.is_err());
        assert!(handle.is_closed());
    }
}
