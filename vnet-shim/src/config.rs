use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, ShimError};

/// Default device name prefix (`vnet0`, `vnet1`, ...).
pub const DEFAULT_DEVICE_PREFIX: &str = "vnet";

/// Default MTU for virtual wire frames.
pub const DEFAULT_MTU: u32 = 2800;

/// Policy constants for one shim instance.
///
/// Durations are (de)serialized as milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShimConfig {
    /// Prefix for device names; a process-wide counter is appended.
    pub device_prefix: String,
    /// Minimum time between two housekeeping passes.
    #[serde(with = "millis")]
    pub housekeeping_interval: Duration,
    /// How long a closed connection stays in the table before it is released.
    #[serde(with = "millis")]
    pub connection_grace_period: Duration,
    /// Integer returned to BSD-style callers for any failure.
    pub general_failure_code: i32,
    /// MTU used when the builder is not given one.
    pub default_mtu: u32,
    /// Capacity of a connection's inbound staging buffer.
    pub rx_buffer_size: usize,
    /// Capacity of a connection's outbound staging buffer.
    pub tx_buffer_size: usize,
    /// Per-socket buffer size handed to the stack engine.
    pub engine_socket_buffer: usize,
    /// Upper bound on how long the interface loop blocks between polls.
    #[serde(with = "millis")]
    pub max_poll_interval: Duration,
}

impl Default for ShimConfig {
    fn default() -> Self {
        Self {
            device_prefix: DEFAULT_DEVICE_PREFIX.to_string(),
            housekeeping_interval: Duration::from_secs(5),
            connection_grace_period: Duration::from_secs(10),
            general_failure_code: -1,
            default_mtu: DEFAULT_MTU,
            rx_buffer_size: 128 * 1024,
            tx_buffer_size: 128 * 1024,
            engine_socket_buffer: 64 * 1024,
            max_poll_interval: Duration::from_millis(50),
        }
    }
}

impl ShimConfig {
    /// Load a config from a JSON file. Missing fields take their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    /// Parse a config from a JSON string.
    pub fn from_json(raw: &str) -> Result<Self> {
        let config: ShimConfig =
            serde_json::from_str(raw).map_err(|e| ShimError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the shim cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.device_prefix.is_empty() {
            return Err(ShimError::Config("device_prefix must not be empty".into()));
        }
        if self.max_poll_interval.is_zero() {
            return Err(ShimError::Config("max_poll_interval must be > 0".into()));
        }
        if self.rx_buffer_size == 0 || self.tx_buffer_size == 0 {
            return Err(ShimError::Config("staging buffers must be non-empty".into()));
        }
        Ok(())
    }

    pub fn with_housekeeping_interval(mut self, interval: Duration) -> Self {
        self.housekeeping_interval = interval;
        self
    }

    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.connection_grace_period = grace;
        self
    }

    pub fn with_device_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.device_prefix = prefix.into();
        self
    }

    pub fn with_buffer_sizes(mut self, rx: usize, tx: usize) -> Self {
        self.rx_buffer_size = rx;
        self.tx_buffer_size = tx;
        self
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ShimConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.device_prefix, "vnet");
        assert_eq!(config.general_failure_code, -1);
    }

    #[test]
    fn test_from_json_partial() {
        let config = ShimConfig::from_json(
            r#"{ "device_prefix": "libzt", "connection_grace_period": 2500 }"#,
        )
        .unwrap();
        assert_eq!(config.device_prefix, "libzt");
        assert_eq!(config.connection_grace_period, Duration::from_millis(2500));
        assert_eq!(config.housekeeping_interval, Duration::from_secs(5));
    }

    #[test]
    fn test_from_json_invalid() {
        assert!(ShimConfig::from_json(r#"{ "device_prefix": "" }"#).is_err());
        assert!(ShimConfig::from_json("not json").is_err());
    }

    #[test]
    fn test_json_roundtrip() {
        let config = ShimConfig::default()
            .with_grace_period(Duration::from_millis(1))
            .with_device_prefix("zt");
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(ShimConfig::from_json(&json).unwrap(), config);
    }

    #[test]
    fn test_from_json_file() {
        let path = std::env::temp_dir().join(format!("vnet-shim-config-{}.json", std::process::id()));
        std::fs::write(&path, r#"{ "general_failure_code": -88 }"#).unwrap();
        let config = ShimConfig::from_json_file(&path).unwrap();
        let _ = std::fs::remove_file(&path);
        assert_eq!(config.general_failure_code, -88);
    }
}
