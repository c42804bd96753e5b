//! Gateway configuration: every tunable in spec.md §6, loaded from an
//! optional TOML file with environment overrides, following
//! `astrid_gateway::config::GatewayConfig`'s `#[serde(default =
//! "default_*")]` convention.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use broker_core::config::BrokerConfig;
use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, Result};

fn default_listen_addr() -> SocketAddr {
    "127.0.0.1:8787".parse().expect("valid default listen address")
}

fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_max_subscribers() -> usize {
    10_000
}

fn default_max_subscriptions_per_subscriber() -> usize {
    50
}

fn default_max_total_subscriptions() -> usize {
    10_000
}

fn default_max_queue_per_subscriber() -> usize {
    100
}

fn default_max_frame_bytes() -> usize {
    1_048_576
}

fn default_nonce_cache() -> usize {
    1_000
}

fn default_nonce_window_seconds() -> i64 {
    60
}

fn default_subscribe_rate_per_minute() -> u32 {
    100
}

/// The daemon's full configuration surface. `core` carries every tunable
/// `broker-core` needs; the remaining fields are gateway-specific.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Address the WebSocket server binds to.
    #[serde(with = "socket_addr_str")]
    pub listen_addr: SocketAddr,
    /// Interval between heartbeat pings sent to each subscriber.
    #[serde(with = "secs_duration")]
    pub heartbeat_interval: Duration,
    /// Maximum number of concurrently connected subscribers.
    pub max_subscribers: usize,
    /// Maximum authorized sessions a single subscriber may hold.
    pub max_subscriptions_per_subscriber: usize,
    /// Server-wide ceiling on authorized (client, session) subscriptions,
    /// independent of `max_subscribers` (connection count).
    pub max_total_subscriptions: usize,
    /// Maximum buffered outbound messages per subscriber.
    pub max_queue_per_subscriber: usize,
    /// Maximum accepted inbound frame size, in bytes.
    pub max_frame_bytes: usize,
    /// Maximum tracked nonces per subscriber.
    pub nonce_cache: usize,
    /// Acceptable clock skew window for inbound response timestamps.
    pub nonce_window_seconds: i64,
    /// Maximum `subscribe`/`interaction-sync-request` messages accepted per
    /// subscriber per minute.
    pub subscribe_rate_per_minute: u32,
    /// Tunables owned by `broker-core` (TTLs, per-kind timeouts, quotas).
    #[serde(flatten)]
    pub core: BrokerConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            heartbeat_interval: default_heartbeat_interval(),
            max_subscribers: default_max_subscribers(),
            max_subscriptions_per_subscriber: default_max_subscriptions_per_subscriber(),
            max_total_subscriptions: default_max_total_subscriptions(),
            max_queue_per_subscriber: default_max_queue_per_subscriber(),
            max_frame_bytes: default_max_frame_bytes(),
            nonce_cache: default_nonce_cache(),
            nonce_window_seconds: default_nonce_window_seconds(),
            subscribe_rate_per_minute: default_subscribe_rate_per_minute(),
            core: BrokerConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Load configuration from an optional TOML file, falling back to
    /// defaults for any field the file omits or that the file itself is
    /// absent entirely.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path)
            .map_err(|e| GatewayError::Config(format!("reading {}: {e}", path.display())))?;
        toml::from_str(&raw).map_err(|e| GatewayError::Config(format!("parsing {}: {e}", path.display())))
    }
}

mod socket_addr_str {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S: Serializer>(value: &SocketAddr, serializer: S) -> Result<S::Ok, S::Error> {
        value.to_string().serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<SocketAddr, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

mod secs_duration {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        value.as_secs_f64().serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Ok(Duration::from_secs_f64(secs))
    }
}
