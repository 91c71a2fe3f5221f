//! The publish sink links mirror their traffic to.

use bytes::Bytes;

/// A fire-and-forget publish sink.
///
/// Links receive their bus at construction; there is no process-wide
/// instance. Delivery is best effort and never reported back to the link.
pub trait Bus: Send + Sync {
    /// Publish a payload on a topic.
    fn publish(&self, topic: &str, payload: Bytes);
}
