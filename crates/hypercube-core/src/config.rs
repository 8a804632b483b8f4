//! Centralized configuration for the mesh.
//!
//! Compile-time defaults live as associated constants on unit structs; the
//! runtime option structs below start from those defaults and can be loaded
//! from JSON by the node binary.

use crate::codec::Codec;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Per-link timing and retry defaults.
pub struct LinkConfig;

impl LinkConfig {
    pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(5000);
    pub const PING_TIMEOUT: Duration = Duration::from_millis(15000);
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
    /// Retries of the queue head after its first failed write.
    pub const MAX_SEND_RETRIES: u32 = 3;
    /// Retries of the initial outbound connect after the first failure.
    pub const MAX_CONNECT_RETRIES: u32 = 3;
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    pub const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(200);
    /// Best-effort window for the close notification on a forced close.
    pub const CLOSE_NOTIFY_TIMEOUT: Duration = Duration::from_secs(1);
    /// Correlation counter wraps after this value.
    pub const MAX_REQUEST_COUNTER: u32 = 9999;
    pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024; // 16MB
}

/// Link pool defaults.
pub struct PoolConfig;

impl PoolConfig {
    pub const REMAIN_RETRY_INTERVALS: [Duration; 3] = [
        Duration::from_millis(5000),
        Duration::from_millis(10000),
        Duration::from_millis(60000),
    ];
    pub const REMAIN_UPDATE_INTERVAL: Duration = Duration::from_millis(30000);
}

/// Peer registry defaults.
pub struct RegistryConfig;

impl RegistryConfig {
    pub const SYNC_INTERVAL: Duration = Duration::from_millis(30000);
    pub const BUSY_TIMEOUT_MS: u32 = 5000;
}

/// Listener defaults.
pub struct ListenerConfig;

impl ListenerConfig {
    pub const MAX_CONNECTIONS: usize = 1024;
}

/// Runtime options applied to every link a pool creates.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LinkOptions {
    #[serde(with = "millis")]
    pub heartbeat_interval: Duration,
    #[serde(with = "millis")]
    pub ping_timeout: Duration,
    #[serde(with = "millis")]
    pub request_timeout: Duration,
    pub max_send_retries: u32,
    pub max_connect_retries: u32,
    #[serde(with = "millis")]
    pub connect_timeout: Duration,
    #[serde(with = "millis")]
    pub connect_retry_delay: Duration,
    pub codec: Codec,
    /// Lower-case object keys of outgoing payloads.
    pub lowercase_messages: bool,
}

impl Default for LinkOptions {
    fn default() -> Self {
        Self {
            heartbeat_interval: LinkConfig::HEARTBEAT_INTERVAL,
            ping_timeout: LinkConfig::PING_TIMEOUT,
            request_timeout: LinkConfig::REQUEST_TIMEOUT,
            max_send_retries: LinkConfig::MAX_SEND_RETRIES,
            max_connect_retries: LinkConfig::MAX_CONNECT_RETRIES,
            connect_timeout: LinkConfig::CONNECT_TIMEOUT,
            connect_retry_delay: LinkConfig::CONNECT_RETRY_DELAY,
            codec: Codec::None,
            lowercase_messages: false,
        }
    }
}

/// Runtime options for the link pool's remain watchdog.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PoolOptions {
    #[serde(with = "millis_vec")]
    pub retry_intervals: Vec<Duration>,
    #[serde(with = "millis")]
    pub update_interval: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            retry_intervals: PoolConfig::REMAIN_RETRY_INTERVALS.to_vec(),
            update_interval: PoolConfig::REMAIN_UPDATE_INTERVAL,
        }
    }
}

impl PoolOptions {
    /// Backoff delay for the given retry step, capped at the last entry.
    pub fn retry_delay(&self, step: usize) -> Duration {
        match self.retry_intervals.last() {
            None => self.update_interval,
            Some(last) => self.retry_intervals.get(step).copied().unwrap_or(*last),
        }
    }
}

/// Top-level mesh configuration, as read from a node's config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MeshConfig {
    /// Groups this process keeps connected regardless of demand.
    pub remain: Vec<String>,
    pub link: LinkOptions,
    pub pool: PoolOptions,
    pub auto_sync: bool,
    #[serde(with = "millis_opt")]
    pub sync_interval: Option<Duration>,
    pub max_connections: Option<usize>,
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

mod millis_opt {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}

mod millis_vec {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &[Duration], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(value.iter().map(|d| d.as_millis() as u64))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<Duration>, D::Error> {
        Ok(Vec::<u64>::deserialize(deserializer)?
            .into_iter()
            .map(Duration::from_millis)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_delay_caps_at_last_interval() {
        let opts = PoolOptions::default();
        assert_eq!(opts.retry_delay(0), Duration::from_millis(5000));
        assert_eq!(opts.retry_delay(1), Duration::from_millis(10000));
        assert_eq!(opts.retry_delay(2), Duration::from_millis(60000));
        assert_eq!(opts.retry_delay(17), Duration::from_millis(60000));
    }

    #[test]
    fn test_mesh_config_from_partial_json() {
        let config: MeshConfig = serde_json::from_str(
            r#"{"remain": ["lobby"], "pool": {"retryIntervals": [100, 200]}, "link": {"codec": "deflate"}}"#,
        )
        .unwrap();

        assert_eq!(config.remain, vec!["lobby".to_string()]);
        assert_eq!(config.pool.retry_delay(5), Duration::from_millis(200));
        assert_eq!(config.pool.update_interval, PoolConfig::REMAIN_UPDATE_INTERVAL);
        assert_eq!(config.link.codec, Codec::Deflate);
        assert_eq!(config.link.request_timeout, LinkConfig::REQUEST_TIMEOUT);
    }

    #[test]
    fn test_timeouts_are_reasonable() {
        assert!(LinkConfig::PING_TIMEOUT > LinkConfig::HEARTBEAT_INTERVAL);
        assert!(LinkConfig::REQUEST_TIMEOUT > Duration::ZERO);
    }
}
