//! Bus publications.

use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// A unique publication identifier.
pub type PublicationId = u64;

static ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Generate a unique publication ID.
#[must_use]
pub fn generate_publication_id() -> PublicationId {
    ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// A payload published on a bus topic.
#[derive(Debug, Clone)]
pub struct Publication {
    /// Unique publication identifier.
    pub id: PublicationId,
    /// Target topic.
    pub topic: String,
    /// Payload, shared cheaply between subscribers.
    pub payload: Bytes,
    /// Milliseconds since the Unix epoch when the publication was created.
    pub timestamp: u64,
}

impl Publication {
    /// Create a new publication.
    #[must_use]
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            id: generate_publication_id(),
            topic: topic.into(),
            payload: payload.into(),
            timestamp: now_millis(),
        }
    }

    /// Get the payload size in bytes.
    #[must_use]
    pub fn payload_size(&self) -> usize {
        self.payload.len()
    }
}
