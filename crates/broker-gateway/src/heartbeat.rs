//! Server-side heartbeat loop, per spec §5.
//!
//! Adapted from `discord_proxy::heartbeat::run_heartbeat`'s single-connection
//! jittered-first-tick loop, generalized here to ping every connected
//! subscriber each tick instead of one upstream connection, and to report
//! zombies (missed one full round of pongs) rather than reconnect itself —
//! teardown is the connection task's job, not the heartbeat task's.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use broker_core::types::ClientId;

use crate::protocol::OutboundEnvelope;
use crate::registry::SubscriberRegistry;

/// Run the heartbeat loop until `shutdown_rx` fires.
///
/// Each tick: any subscriber that did not `pong` since the previous tick is
/// reported on `zombie_tx` so its connection task can tear it down, then
/// every remaining subscriber's liveness is reset and a fresh `ping` is
/// enqueued for it.
pub async fn run_heartbeat(
    registry: Arc<SubscriberRegistry>,
    interval: Duration,
    zombie_tx: mpsc::UnboundedSender<ClientId>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let jitter_factor = f64::from(fastrand::u32(0..1000)) / 1000.0;
    let first_delay = interval.mul_f64(jitter_factor);

    debug!(?interval, ?first_delay, "heartbeat task started");

    tokio::select! {
        biased;
        _ = shutdown_rx.recv() => return,
        () = tokio::time::sleep(first_delay) => {},
    }

    let mut sequence: u64 = 0;
    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.recv() => {
                debug!("heartbeat task shutting down");
                return;
            }
            () = tokio::time::sleep(interval) => {
                tick(&registry, &mut sequence, &zombie_tx);
            }
        }
    }
}

fn tick(registry: &Arc<SubscriberRegistry>, sequence: &mut u64, zombie_tx: &mpsc::UnboundedSender<ClientId>) {
    for client_id in registry.sweep_zombies() {
        warn!(?client_id, "subscriber missed heartbeat ack, reporting zombie");
        let _ = zombie_tx.send(client_id);
    }

    registry.reset_liveness();
    *sequence += 1;
    for client_id in registry.all_client_ids() {
        registry.enqueue(
            client_id,
            OutboundEnvelope::Ping {
                sequence_number: *sequence,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use broker_core::audit::NoopAuditSink;
    use broker_core::auth::SessionOwnershipVerifier;
    use broker_core::types::{SessionId, UserId};
    use chrono::Utc;

    struct AllowAll;

    #[async_trait]
    impl SessionOwnershipVerifier for AllowAll {
        async fn verify(&self, _user_id: &UserId, _session_id: SessionId) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn tick_pings_connected_and_skips_first_round_zombies() {
        let config = Arc::new(crate::config::GatewayConfig::default());
        let registry = Arc::new(SubscriberRegistry::new(
            config,
            Arc::new(AllowAll),
            Arc::new(NoopAuditSink),
        ));
        let (client, _notify) = registry.add(UserId("u".into()), Utc::now()).unwrap();

        let (zombie_tx, mut zombie_rx) = mpsc::unbounded_channel();
        let mut sequence = 0;
        tick(&registry, &mut sequence, &zombie_tx);
        assert!(zombie_rx.try_recv().is_err(), "no zombies on the first tick");

        let queued = registry.flush_queue(client);
        assert!(matches!(queued.as_slice(), [OutboundEnvelope::Ping { sequence_number: 1 }]));
    }

    #[tokio::test]
    async fn tick_reports_subscriber_that_never_ponged() {
        let config = Arc::new(crate::config::GatewayConfig::default());
        let registry = Arc::new(SubscriberRegistry::new(
            config,
            Arc::new(AllowAll),
            Arc::new(NoopAuditSink),
        ));
        let (client, _notify) = registry.add(UserId("u".into()), Utc::now()).unwrap();

        let (zombie_tx, mut zombie_rx) = mpsc::unbounded_channel();
        let mut sequence = 0;
        tick(&registry, &mut sequence, &zombie_tx); // round 1: reset_liveness marks it unacked
        tick(&registry, &mut sequence, &zombie_tx); // round 2: still unacked since start -> zombie

        let reported = zombie_rx.try_recv().unwrap();
        assert_eq!(reported, client);
    }
}
