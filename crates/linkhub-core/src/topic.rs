//! Bus topics.
//!
//! Every link mirrors its traffic under `/link/{tunnel}/{link}/{kind}`.

use std::fmt;

/// Maximum topic length.
pub const MAX_TOPIC_LENGTH: usize = 256;

/// Validate a topic name.
///
/// # Errors
///
/// Returns an error message if the topic name is invalid.
pub fn validate_topic(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("Topic cannot be empty");
    }
    if name.len() > MAX_TOPIC_LENGTH {
        return Err("Topic too long");
    }
    if !name.starts_with('/') {
        return Err("Topic must start with '/'");
    }
    if !name.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
        return Err("Topic contains invalid characters");
    }
    Ok(())
}

/// The kind of traffic mirrored for a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkTopic {
    /// Inbound payloads from the device.
    Recv,
    /// Outbound payloads written to the device.
    Send,
    /// Lifecycle events such as `close`.
    Event,
}

impl LinkTopic {
    /// The topic suffix.
    #[must_use]
    pub fn suffix(self) -> &'static str {
        match self {
            Self::Recv => "recv",
            Self::Send => "send",
            Self::Event => "event",
        }
    }

    /// Build the full topic for a link.
    #[must_use]
    pub fn for_link(self, tunnel_id: u64, link_id: u64) -> String {
        format!("/link/{}/{}/{}", tunnel_id, link_id, self.suffix())
    }
}

impl fmt::Display for LinkTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.suffix())
    }
}

/// Precomputed topics of one link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkTopics {
    pub recv: String,
    pub send: String,
    pub event: String,
}

impl LinkTopics {
    #[must_use]
    pub fn new(tunnel_id: u64, link_id: u64) -> Self {
        Self {
            recv: LinkTopic::Recv.for_link(tunnel_id, link_id),
            send: LinkTopic::Send.for_link(tunnel_id, link_id),
            event: LinkTopic::Event.for_link(tunnel_id, link_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_topics() {
        let topics = LinkTopics::new(3, 42);
        assert_eq!(topics.recv, "/link/3/42/recv");
        assert_eq!(topics.send, "/link/3/42/send");
        assert_eq!(topics.event, "/link/3/42/event");
        assert!(validate_topic(&topics.recv).is_ok());
    }

    #[test]
    fn test_topic_validation() {
        assert!(validate_topic("/link/1/1/recv").is_ok());
        assert!(validate_topic("").is_err());
        assert!(validate_topic("link/1/1/recv").is_err());
        assert!(validate_topic("/bad\ntopic").is_err());

        let long_topic = format!("/{}", "a".repeat(MAX_TOPIC_LENGTH));
        assert!(validate_topic(&long_topic).is_err());
    }
}
