//! Bridge configuration

use std::time::Duration;

// ----------------------------------------------------------------------------
// Wire Constants
// ----------------------------------------------------------------------------

/// Baseline GATT MTU every BLE stack must carry per operation.
pub const MIN_MTU: usize = 23;

/// Largest characteristic value BlueZ accepts.
pub const CHARACTERISTIC_MAX: usize = 512;

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------

/// What the server publish path does with an encoded message that
/// exceeds the configured MTU bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum OversizePolicy {
    /// Fail the publish call with `MessageTooLarge`.
    Reject,
    /// Cut the payload down to the bound and log a warning.
    Truncate,
}

/// Configuration for a topic server or client
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct BleTopicConfig {
    /// Maximum time a single scan attempt waits before logging and retrying
    pub scan_timeout: Duration,
    /// Maximum time to wait for a connection handshake
    pub connection_timeout: Duration,
    /// Connect attempts before falling back to a fresh scan
    pub connect_retries: u32,
    /// Effective payload bound per message
    pub mtu: usize,
    /// Server-side handling of oversized publishes
    pub oversize_policy: OversizePolicy,
}

impl Default for BleTopicConfig {
    fn default() -> Self {
        Self {
            scan_timeout: Duration::from_secs(20),
            connection_timeout: Duration::from_secs(20),
            connect_retries: 3,
            mtu: MIN_MTU,
            oversize_policy: OversizePolicy::Reject,
        }
    }
}

impl BleTopicConfig {
    /// Create a configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the per-attempt scan timeout
    pub fn with_scan_timeout(mut self, timeout: Duration) -> Self {
        self.scan_timeout = timeout;
        self
    }

    /// Set the connection handshake timeout
    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Set the connect retry count
    pub fn with_connect_retries(mut self, retries: u32) -> Self {
        self.connect_retries = retries;
        self
    }

    /// Set the payload bound, clamped to what BlueZ can carry
    pub fn with_mtu(mut self, mtu: usize) -> Self {
        self.mtu = mtu.min(CHARACTERISTIC_MAX);
        self
    }

    /// Set the server-side oversize policy
    pub fn with_oversize_policy(mut self, policy: OversizePolicy) -> Self {
        self.oversize_policy = policy;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_baseline_policy() {
        let config = BleTopicConfig::default();
        assert_eq!(config.mtu, MIN_MTU);
        assert_eq!(config.connect_retries, 3);
        assert_eq!(config.scan_timeout, Duration::from_secs(20));
        assert_eq!(config.oversize_policy, OversizePolicy::Reject);
    }

    #[test]
    fn test_mtu_is_clamped_to_characteristic_max() {
        let config = BleTopicConfig::new().with_mtu(4096);
        assert_eq!(config.mtu, CHARACTERISTIC_MAX);

        let config = BleTopicConfig::new().with_mtu(180);
        assert_eq!(config.mtu, 180);
    }
}
