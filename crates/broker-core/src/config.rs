//! Tunables for [`crate::store::InteractionStore`], [`crate::session_index::SessionIndex`]
//! and [`crate::broker::Broker`], per the defaults table in spec.md §6.
//!
//! Follows `astrid_gateway::config::GatewayConfig`'s `#[serde(default =
//! "default_*")]` per-field convention so every value can be overridden from
//! a TOML file or environment without losing the documented default when a
//! field is omitted.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Core broker tunables. Embedded into `broker_gateway::config::GatewayConfig`
/// so the daemon has a single configuration surface, while remaining
/// independently constructible for tests and embedders that only need
/// `broker-core`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// How long a session may sit idle before the sweeper evicts it.
    #[serde(with = "humantime_duration")]
    pub session_ttl: Duration,
    /// Per-interaction timeout for `permission` kind.
    #[serde(with = "humantime_duration")]
    pub interaction_timeout_permission: Duration,
    /// Per-interaction timeout for `plan-approval` kind.
    #[serde(with = "humantime_duration")]
    pub interaction_timeout_plan: Duration,
    /// Per-interaction timeout for `ask-user` kind.
    #[serde(with = "humantime_duration")]
    pub interaction_timeout_ask_user: Duration,
    /// Maximum pending interactions a single session may hold.
    pub max_interactions_per_session: usize,
    /// Maximum tracked sessions before LRU disposal kicks in.
    pub max_sessions: usize,
    /// Cadence of the background session sweeper.
    #[serde(with = "humantime_duration")]
    pub sweep_interval: Duration,
}

impl BrokerConfig {
    /// The timeout that applies to a given interaction kind.
    #[must_use]
    pub fn timeout_for(&self, kind: crate::types::InteractionKind) -> Duration {
        match kind {
            crate::types::InteractionKind::Permission => self.interaction_timeout_permission,
            crate::types::InteractionKind::PlanApproval => self.interaction_timeout_plan,
            crate::types::InteractionKind::AskUser => self.interaction_timeout_ask_user,
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            session_ttl: Duration::from_secs(15 * 60),
            interaction_timeout_permission: Duration::from_secs(30),
            interaction_timeout_plan: Duration::from_secs(5 * 60),
            interaction_timeout_ask_user: Duration::from_secs(5 * 60),
            max_interactions_per_session: 100,
            max_sessions: 1_000,
            sweep_interval: Duration::from_secs(5 * 60),
        }
    }
}

/// `serde_with`-style helper module for (de)serializing `Duration` as a
/// plain seconds count, without pulling in a dedicated crate for it.
mod humantime_duration {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_table() {
        let cfg = BrokerConfig::default();
        assert_eq!(cfg.session_ttl, Duration::from_secs(900));
        assert_eq!(cfg.interaction_timeout_permission, Duration::from_secs(30));
        assert_eq!(cfg.interaction_timeout_plan, Duration::from_secs(300));
        assert_eq!(cfg.interaction_timeout_ask_user, Duration::from_secs(300));
        assert_eq!(cfg.max_interactions_per_session, 100);
        assert_eq!(cfg.max_sessions, 1_000);
    }

    #[test]
    fn round_trips_through_toml() {
        let cfg = BrokerConfig::default();
        let toml_str = toml::to_string(&cfg).expect("serialize");
        let back: BrokerConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(back.max_sessions, cfg.max_sessions);
    }
}
