//! Channel configuration.
//!
//! Every field has a default, so a JSON document only needs the values it
//! changes:
//!
//! ```
//! use kernelwire::ChannelConfig;
//!
//! let config = ChannelConfig::from_json(r#"{ "max_payload_size": 1048576 }"#)?;
//! assert_eq!(config.max_payload_size, 1024 * 1024);
//! assert_eq!(config.channel_capacity, ChannelConfig::default().channel_capacity);
//! # Ok::<(), kernelwire::ChannelError>(())
//! ```

use serde::Deserialize;

use crate::error::{ChannelError, Result};
use crate::protocol::{ABSOLUTE_MAX_SIZE, DEFAULT_MAX_HEADER_SIZE, DEFAULT_MAX_PAYLOAD_SIZE};
use crate::reader::DEFAULT_READ_BUFFER_SIZE;
use crate::writer::DEFAULT_CHANNEL_CAPACITY;

/// Tunables for a [`Channel`](crate::Channel).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Capacity of the outgoing frame queue.
    pub channel_capacity: usize,
    /// Size of each read from the stream.
    pub read_buffer_size: usize,
    /// Largest accepted inbound header.
    pub max_header_size: u32,
    /// Largest accepted inbound payload.
    pub max_payload_size: u32,
}

impl ChannelConfig {
    /// Parse a configuration from JSON and validate it.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check that every value is usable.
    pub fn validate(&self) -> Result<()> {
        if self.channel_capacity == 0 {
            return Err(ChannelError::Protocol(
                "channel_capacity must be at least 1".to_string(),
            ));
        }
        if self.read_buffer_size == 0 {
            return Err(ChannelError::Protocol(
                "read_buffer_size must be at least 1".to_string(),
            ));
        }
        for (name, value) in [
            ("max_header_size", self.max_header_size),
            ("max_payload_size", self.max_payload_size),
        ] {
            if value == 0 || value > ABSOLUTE_MAX_SIZE {
                return Err(ChannelError::Protocol(format!(
                    "{} must be between 1 and {}, got {}",
                    name, ABSOLUTE_MAX_SIZE, value
                )));
            }
        }
        Ok(())
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            max_header_size: DEFAULT_MAX_HEADER_SIZE,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ChannelConfig::default();
        assert_eq!(config.channel_capacity, 1024);
        assert_eq!(config.read_buffer_size, 64 * 1024);
        assert_eq!(config.max_header_size, 64 * 1024);
        assert_eq!(config.max_payload_size, 1_073_741_824);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_json_full() {
        let config = ChannelConfig::from_json(
            r#"{
                "channel_capacity": 16,
                "read_buffer_size": 512,
                "max_header_size": 256,
                "max_payload_size": 4096
            }"#,
        )
        .unwrap();

        assert_eq!(config.channel_capacity, 16);
        assert_eq!(config.read_buffer_size, 512);
        assert_eq!(config.max_header_size, 256);
        assert_eq!(config.max_payload_size, 4096);
    }

    #[test]
    fn test_from_json_empty_object() {
        assert_eq!(ChannelConfig::from_json("{}").unwrap(), ChannelConfig::default());
    }

    #[test]
    fn test_from_json_rejects_bad_values() {
        assert!(matches!(
            ChannelConfig::from_json("{ \"channel_capacity\": \"many\" }"),
            Err(ChannelError::Json(_))
        ));
        assert!(matches!(
            ChannelConfig::from_json("{ \"channel_capacity\": 0 }"),
            Err(ChannelError::Protocol(_))
        ));
        assert!(ChannelConfig::from_json("{ \"max_header_size\": 0 }").is_err());
        assert!(ChannelConfig::from_json("{ \"max_payload_size\": 4294967295 }").is_err());
    }
}
