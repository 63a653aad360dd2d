//! Driver configuration.
//!
//! All timing constants live here with their protocol-observed defaults.
//! A config can be deserialized from YAML; unspecified fields keep their
//! defaults.

use std::time::Duration;

use serde::Deserialize;

use crate::DriverError;

/// Tunable parameters for the driver.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Node id of the controller itself.
    pub controller_node_id: u8,
    /// How long to wait for an ACK/reply before retrying a send.
    pub transaction_timeout_ms: u64,
    /// Send attempts before a message is dropped.
    pub max_send_attempts: u8,
    /// Total polling interval, spread across all enrolled devices.
    pub poll_interval_ms: u64,
    /// When set, `poll_interval_ms` is the gap between consecutive polls
    /// instead of the whole-list period.
    pub interval_between_polls: bool,
    /// Validity window of a nonce after request or report.
    pub nonce_timeout_ms: u64,
    /// Consecutive nonce failures before a device is declared degraded.
    pub nonce_retry_cap: u8,
    /// How long a partially received frame may stall before it is abandoned.
    pub read_stall_timeout_ms: u64,
    /// Granularity of the reader's wait on the serial port.
    pub wait_grain_ms: u64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        DriverConfig {
            controller_node_id: 1,
            transaction_timeout_ms: 5_000,
            max_send_attempts: 3,
            poll_interval_ms: 30_000,
            interval_between_polls: false,
            nonce_timeout_ms: 10_000,
            nonce_retry_cap: 3,
            read_stall_timeout_ms: 500,
            wait_grain_ms: 100,
        }
    }
}

impl DriverConfig {
    /// Parse a config from YAML text.
    pub fn from_yaml(yaml: &str) -> Result<Self, DriverError> {
        serde_yaml::from_str(yaml).map_err(|e| DriverError::Config(e.to_string()))
    }

    /// Transaction retry window.
    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_millis(self.transaction_timeout_ms)
    }

    /// Total polling interval.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Nonce validity window.
    pub fn nonce_timeout(&self) -> Duration {
        Duration::from_millis(self.nonce_timeout_ms)
    }

    /// Stalled-frame abandonment window.
    pub fn read_stall_timeout(&self) -> Duration {
        Duration::from_millis(self.read_stall_timeout_ms)
    }

    /// Reader wait granularity.
    pub fn wait_grain(&self) -> Duration {
        Duration::from_millis(self.wait_grain_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_observed_protocol_constants() {
        let config = DriverConfig::default();
        assert_eq!(config.transaction_timeout(), Duration::from_secs(5));
        assert_eq!(config.nonce_timeout(), Duration::from_secs(10));
        assert_eq!(config.max_send_attempts, 3);
        assert_eq!(config.poll_interval(), Duration::from_secs(30));
    }

    #[test]
    fn test_from_yaml_partial_override() {
        let config = DriverConfig::from_yaml("poll_interval_ms: 500\nmax_send_attempts: 5\n")
            .expect("valid yaml");
        assert_eq!(config.poll_interval_ms, 500);
        assert_eq!(config.max_send_attempts, 5);
        // Untouched fields keep their defaults.
        assert_eq!(config.transaction_timeout_ms, 5_000);
    }

    #[test]
    fn test_from_yaml_rejects_garbage() {
        assert!(DriverConfig::from_yaml("poll_interval_ms: [not a number]").is_err());
    }
}
