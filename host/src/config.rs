use std::time::Duration;

use serde::{Deserialize, Serialize};
use serial_link::LinkConfig;

use crate::error::Result;

/// Configuration for a [`LinkHost`](crate::LinkHost)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Session tunables
    pub link: LinkConfig,
    /// Period of the session poll in milliseconds
    pub poll_interval_ms: u64,
    /// Largest single read from the stream
    pub read_chunk_size: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            link: LinkConfig::default(),
            poll_interval_ms: 10,
            read_chunk_size: 256,
        }
    }
}

impl HostConfig {
    /// Parse a JSON document; missing fields keep their defaults
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HostError;

    #[test]
    fn test_host_config_default() {
        let config = HostConfig::default();
        assert_eq!(config.poll_interval_ms, 10);
        assert_eq!(config.read_chunk_size, 256);
        assert_eq!(config.link, LinkConfig::default());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config =
            HostConfig::from_json(r#"{"poll_interval_ms": 5, "link": {"max_retries": 7}}"#)
                .unwrap();
        assert_eq!(config.poll_interval_ms, 5);
        assert_eq!(config.read_chunk_size, 256);
        assert_eq!(config.link.max_retries, 7);
        assert_eq!(config.link.ack_timeout_ms, 10_000);
    }

    #[test]
    fn test_invalid_json_is_error() {
        assert!(matches!(
            HostConfig::from_json("{not json"),
            Err(HostError::Json(_))
        ));
    }

    #[test]
    fn test_zero_interval_is_clamped() {
        let config = HostConfig {
            poll_interval_ms: 0,
            ..HostConfig::default()
        };
        assert_eq!(config.poll_interval(), Duration::from_millis(1));
    }
}
