//! Background session-expiry sweep, per spec §4.2 "Session TTL".
//!
//! Shaped the same way as [`crate::heartbeat::run_heartbeat`]: a
//! `tokio::select!` racing a fixed-interval tick against a shutdown
//! broadcast, grounded on the same `discord_proxy::heartbeat` loop idiom.

use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::debug;

use broker_core::store::InteractionStore;

/// Run the session-expiry sweep loop until `shutdown_rx` fires.
pub async fn run_sweeper(store: InteractionStore, interval: Duration, mut shutdown_rx: broadcast::Receiver<()>) {
    debug!(?interval, "session sweep task started");
    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.recv() => {
                debug!("session sweep task shutting down");
                return;
            }
            () = tokio::time::sleep(interval) => {
                store.sweep_expired_sessions(Utc::now());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use broker_core::config::BrokerConfig;
    use broker_core::types::{AskUserPayload, InteractionData, InteractionMetadata, RiskLevel, SessionId, UserId};

    #[tokio::test]
    async fn sweep_evicts_sessions_past_ttl() {
        let mut config = BrokerConfig::default();
        config.session_ttl = Duration::from_millis(1);
        let (store, _events) = InteractionStore::new(config);

        let session = SessionId::new();
        let (_id, rx) = store
            .create(
                InteractionData::AskUser(AskUserPayload { questions: vec![] }),
                Some(session),
                UserId("u".into()),
                InteractionMetadata::new(RiskLevel::Low, "test"),
            )
            .unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        store.sweep_expired_sessions(Utc::now());

        let outcome = tokio::time::timeout(Duration::from_millis(100), rx.wait())
            .await
            .expect("completion should already be resolved")
            .expect("channel delivered a value");
        assert!(matches!(
            outcome,
            Err(broker_core::error::BrokerError::SessionEvicted(_, _))
        ));
    }
}
