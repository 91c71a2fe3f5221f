//! Heartbeat suppression.
//!
//! Devices behind a tunnel periodically send a fixed keep-alive payload.
//! Those payloads are swallowed by the link and never reach a peer, a
//! listener or the bus.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Errors decoding the configured heartbeat content.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HeartbeatError {
    /// Hex content with an odd number of digits.
    #[error("Hex heartbeat content has odd length {0}")]
    OddLength(usize),

    /// A character that is not a hex digit.
    #[error("Invalid hex digit {digit:?} at index {index}")]
    InvalidDigit { index: usize, digit: char },
}

/// Tunnel-level heartbeat policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Whether heartbeat filtering is enabled.
    #[serde(default)]
    pub enabled: bool,

    /// Minimum quiet time before an inbound payload is checked.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// The heartbeat payload, literal or hex-encoded.
    #[serde(default)]
    pub content: String,

    /// Whether `content` is hex-encoded.
    #[serde(default)]
    pub is_hex: bool,
}

fn default_interval_secs() -> u64 {
    30
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: default_interval_secs(),
            content: String::new(),
            is_hex: false,
        }
    }
}

impl HeartbeatConfig {
    /// The quiet window as a duration.
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Decode the configured content into the bytes a heartbeat carries.
    ///
    /// # Errors
    ///
    /// Returns an error if `is_hex` is set and the content is not valid hex.
    pub fn decode_content(&self) -> Result<Bytes, HeartbeatError> {
        if self.is_hex {
            decode_hex(&self.content).map(Bytes::from)
        } else {
            Ok(Bytes::copy_from_slice(self.content.as_bytes()))
        }
    }
}

/// Heartbeat matcher with the content decoded once.
///
/// A disabled policy, or one whose hex content does not decode, never
/// matches. The decode failure is logged when the filter is built.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeartbeatFilter {
    interval: Duration,
    content: Option<Bytes>,
}

impl HeartbeatFilter {
    #[must_use]
    pub fn new(config: &HeartbeatConfig) -> Self {
        let content = if config.enabled {
            match config.decode_content() {
                Ok(content) => Some(content),
                Err(e) => {
                    warn!(error = %e, content = %config.content, "Invalid heartbeat content, filtering disabled");
                    None
                }
            }
        } else {
            None
        };

        Self {
            interval: config.interval(),
            content,
        }
    }

    /// Whether the filter can ever discard a payload.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.content.is_some()
    }

    /// Decide whether `payload` is a heartbeat to discard.
    ///
    /// `since_active` is the time since the link last carried data; `None`
    /// means it never did. Payloads arriving inside the interval are always
    /// data.
    #[must_use]
    pub fn is_heartbeat(&self, since_active: Option<Duration>, payload: &[u8]) -> bool {
        let Some(expected) = &self.content else {
            return false;
        };
        if matches!(since_active, Some(elapsed) if elapsed < self.interval) {
            return false;
        }
        expected.as_ref() == payload
    }
}

/// Decode a hex string, accepting either case.
///
/// # Errors
///
/// Returns an error on odd length or a non-hex character.
pub fn decode_hex(s: &str) -> Result<Vec<u8>, HeartbeatError> {
    let digits = s.as_bytes();
    if digits.len() % 2 != 0 {
        return Err(HeartbeatError::OddLength(digits.len()));
    }

    let nibble = |index: usize| -> Result<u8, HeartbeatError> {
        let c = digits[index];
        match c {
            b'0'..=b'9' => Ok(c - b'0'),
            b'a'..=b'f' => Ok(c - b'a' + 10),
            b'A'..=b'F' => Ok(c - b'A' + 10),
            _ => Err(HeartbeatError::InvalidDigit {
                index,
                digit: char::from(c),
            }),
        }
    };

    (0..digits.len())
        .step_by(2)
        .map(|i| -> Result<u8, HeartbeatError> { Ok(nibble(i)? << 4 | nibble(i + 1)?) })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex_config(content: &str) -> HeartbeatConfig {
        HeartbeatConfig {
            enabled: true,
            interval_secs: 30,
            content: content.to_string(),
            is_hex: true,
        }
    }

    fn filter(config: HeartbeatConfig) -> HeartbeatFilter {
        HeartbeatFilter::new(&config)
    }

    #[test]
    fn test_decode_hex() {
        assert_eq!(decode_hex("AA").unwrap(), vec![0xAA]);
        assert_eq!(decode_hex("0a1B").unwrap(), vec![0x0A, 0x1B]);
        assert_eq!(decode_hex("").unwrap(), Vec::<u8>::new());
        assert_eq!(decode_hex("ABC"), Err(HeartbeatError::OddLength(3)));
        assert_eq!(
            decode_hex("zz"),
            Err(HeartbeatError::InvalidDigit { index: 0, digit: 'z' })
        );
    }

    #[test]
    fn test_heartbeat_matches_after_interval() {
        let config = filter(hex_config("AA"));
        let elapsed = Some(Duration::from_secs(31));

        assert!(config.is_heartbeat(elapsed, &[0xAA]));
        assert!(!config.is_heartbeat(elapsed, &[0xAB]));
        assert!(!config.is_heartbeat(elapsed, &[0xAA, 0xAA]));
    }

    #[test]
    fn test_interval_boundary_is_inclusive() {
        let config = filter(hex_config("AA"));
        assert!(config.is_heartbeat(Some(Duration::from_secs(30)), &[0xAA]));
        assert!(!config.is_heartbeat(Some(Duration::from_secs(29)), &[0xAA]));
    }

    #[test]
    fn test_never_active_link_is_checked() {
        assert!(filter(hex_config("AA")).is_heartbeat(None, &[0xAA]));
    }

    #[test]
    fn test_disabled_never_matches() {
        let config = filter(HeartbeatConfig {
            enabled: false,
            ..hex_config("AA")
        });
        assert!(!config.is_enabled());
        assert!(!config.is_heartbeat(None, &[0xAA]));
    }

    #[test]
    fn test_literal_content() {
        let config = filter(HeartbeatConfig {
            is_hex: false,
            ..hex_config("ping")
        });
        assert!(config.is_heartbeat(None, b"ping"));
        assert!(!config.is_heartbeat(None, b"PING"));
    }

    #[test]
    fn test_bad_hex_fails_open() {
        let config = hex_config("XYZ");
        assert!(config.decode_content().is_err());

        let heartbeat = filter(config);
        assert!(!heartbeat.is_enabled());
        assert!(!heartbeat.is_heartbeat(None, b"XYZ"));
    }

    #[test]
    fn test_empty_content_matches_only_empty_payload() {
        let config = filter(HeartbeatConfig {
            is_hex: false,
            ..hex_config("")
        });
        assert!(config.is_heartbeat(None, b""));
        assert!(!config.is_heartbeat(None, b"x"));
    }

    #[test]
    fn test_config_defaults_from_toml() {
        let config: HeartbeatConfig = toml::from_str("enabled = true\ncontent = \"AA\"").unwrap();
        assert!(config.enabled);
        assert_eq!(config.interval_secs, 30);
        assert!(!config.is_hex);
    }
}
