//! The set of connected subscribers, per spec §4.4.
//!
//! Shaped after `astrid-approval`'s `AllowanceStore` — a single
//! `RwLock<HashMap<..>>` guarding bounded per-entry state — generalized
//! from "allowances keyed by id" to "subscribers keyed by client id", plus
//! the server-wide subscription cap spec §4.4 calls for.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use broker_core::auth::ArcVerifier;
use broker_core::audit::{AuditSink, SecurityEvent};
use broker_core::types::{ClientId, InteractionId, SessionId, UserId};
use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::protocol::OutboundEnvelope;
use crate::subscriber::Subscriber;

/// A connected subscriber plus the waker its connection task listens on
/// for newly enqueued outbound messages.
struct Slot {
    subscriber: Subscriber,
    notify: Arc<Notify>,
}

/// Outcome of a `subscribe` / `interaction-sync-request` batch.
#[derive(Debug, Default)]
pub struct SubscribeOutcome {
    /// Sessions now (or already) authorized.
    pub authorized: Vec<SessionId>,
    /// Sessions that failed ownership verification.
    pub unauthorized: Vec<SessionId>,
}

/// Owns every connected subscriber's state.
pub struct SubscriberRegistry {
    subscribers: RwLock<HashMap<ClientId, Slot>>,
    config: Arc<GatewayConfig>,
    verifier: ArcVerifier,
    audit: Arc<dyn AuditSink>,
    total_subscriptions: AtomicUsize,
}

impl SubscriberRegistry {
    /// Build an empty registry.
    #[must_use]
    pub fn new(config: Arc<GatewayConfig>, verifier: ArcVerifier, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            config,
            verifier,
            audit,
            total_subscriptions: AtomicUsize::new(0),
        }
    }

    fn lock_mut(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<ClientId, Slot>> {
        self.subscribers.write().unwrap_or_else(|poisoned| {
            tracing::warn!("SubscriberRegistry lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn lock_ref(&self) -> std::sync::RwLockReadGuard<'_, HashMap<ClientId, Slot>> {
        self.subscribers.read().unwrap_or_else(|poisoned| {
            tracing::warn!("SubscriberRegistry lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Accept a new connection, returning its assigned id and the waker its
    /// write loop should await for freshly enqueued outbound messages.
    /// Fails if the server-wide `max_subscribers` cap is already reached.
    pub fn add(&self, user_id: UserId, now: DateTime<Utc>) -> Result<(ClientId, Arc<Notify>)> {
        let mut subs = self.lock_mut();
        if subs.len() >= self.config.max_subscribers {
            return Err(GatewayError::RateLimit("MAX_SUBSCRIBERS"));
        }
        let client_id = ClientId::new();
        let notify = Arc::new(Notify::new());
        subs.insert(
            client_id,
            Slot {
                subscriber: Subscriber::new(
                    client_id,
                    user_id,
                    self.config.max_queue_per_subscriber,
                    self.config.nonce_cache,
                    self.config.max_subscriptions_per_subscriber,
                    self.config.subscribe_rate_per_minute,
                    now,
                ),
                notify: notify.clone(),
            },
        );
        Ok((client_id, notify))
    }

    /// Drop a subscriber (socket closed or heartbeat failure). Returns the
    /// interactions it still considered outstanding, so the caller can
    /// decide whether to requeue them for other authorized subscribers.
    pub fn remove(&self, client_id: ClientId) -> Vec<InteractionId> {
        let mut subs = self.lock_mut();
        let total_removed = subs
            .get(&client_id)
            .map_or(0, |slot| slot.subscriber.authorized_sessions().len());
        self.total_subscriptions
            .fetch_sub(total_removed, Ordering::SeqCst);
        subs.remove(&client_id)
            .map(|slot| slot.subscriber.pending_deliveries().iter().copied().collect())
            .unwrap_or_default()
    }

    /// Verify and authorize a batch of session ids for `client_id`, per
    /// spec §4.4's "Authorization set construction".
    pub async fn subscribe(
        &self,
        client_id: ClientId,
        session_ids: Vec<SessionId>,
        now: DateTime<Utc>,
    ) -> Result<SubscribeOutcome> {
        let user_id = {
            let subs = self.lock_ref();
            let slot = subs
                .get(&client_id)
                .ok_or_else(|| GatewayError::Unauthorized("unknown client".to_string()))?;
            if !slot.subscriber.record_subscribe_attempt(now) {
                return Err(GatewayError::RateLimit("subscribe requests per minute"));
            }
            slot.subscriber.user_id.clone()
        };

        let mut outcome = SubscribeOutcome::default();
        for session_id in session_ids {
            if self.verifier.verify(&user_id, session_id).await {
                let mut subs = self.lock_mut();
                let Some(slot) = subs.get_mut(&client_id) else {
                    return Err(GatewayError::Unauthorized("unknown client".to_string()));
                };
                let already_authorized = slot.subscriber.is_authorized(session_id);
                if !already_authorized
                    && self.total_subscriptions.load(Ordering::SeqCst) >= self.config.max_total_subscriptions
                {
                    drop(subs);
                    self.audit
                        .notify(SecurityEvent::RateLimit {
                            user_id: user_id.clone(),
                            limit: "MAX_SUBSCRIPTIONS",
                        })
                        .await;
                    return Err(GatewayError::RateLimit("MAX_SUBSCRIPTIONS"));
                }
                if slot.subscriber.authorize(session_id) {
                    outcome.authorized.push(session_id);
                    if !already_authorized {
                        self.total_subscriptions.fetch_add(1, Ordering::SeqCst);
                    }
                } else {
                    return Err(GatewayError::LimitExceeded);
                }
            } else {
                outcome.unauthorized.push(session_id);
                self.audit
                    .notify(SecurityEvent::UnauthorizedSubscribe {
                        user_id: user_id.clone(),
                        session_id,
                    })
                    .await;
            }
        }

        Ok(outcome)
    }

    /// Revoke a session's authorization for a subscriber (its ownership no
    /// longer verifies, e.g. after eviction).
    pub fn revoke(&self, client_id: ClientId, session_id: SessionId) {
        let mut subs = self.lock_mut();
        if let Some(slot) = subs.get_mut(&client_id) {
            if slot.subscriber.is_authorized(session_id) {
                slot.subscriber.revoke(session_id);
                self.total_subscriptions.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }

    /// Every connected client id authorized for `session_id` (spec §4.5
    /// "Never broadcast to subscribers outside the session's authorized
    /// set").
    #[must_use]
    pub fn iterate_for_session(&self, session_id: SessionId) -> Vec<ClientId> {
        self.lock_ref()
            .iter()
            .filter(|(_, slot)| slot.subscriber.is_authorized(session_id))
            .map(|(id, _)| *id)
            .collect()
    }

    /// Enqueue an envelope for delivery and wake the connection's write
    /// loop.
    pub fn enqueue(&self, client_id: ClientId, envelope: OutboundEnvelope) {
        let mut subs = self.lock_mut();
        if let Some(slot) = subs.get_mut(&client_id) {
            slot.subscriber.enqueue(envelope);
            slot.notify.notify_one();
        }
    }

    /// Drain a subscriber's outbound queue for sending. Used by the
    /// connection's write loop.
    #[must_use]
    pub fn flush_queue(&self, client_id: ClientId) -> Vec<OutboundEnvelope> {
        let mut subs = self.lock_mut();
        subs.get_mut(&client_id)
            .map(Slot::flush)
            .unwrap_or_default()
    }

    /// Record that `client_id` was told about `interaction_id`.
    pub fn mark_pending(&self, client_id: ClientId, interaction_id: InteractionId) {
        let mut subs = self.lock_mut();
        if let Some(slot) = subs.get_mut(&client_id) {
            slot.subscriber.mark_pending(interaction_id);
        }
    }

    /// Clear a delivery once its interaction reaches a terminal state,
    /// for every subscriber authorized for `session_id`.
    pub fn clear_pending_for_session(&self, session_id: SessionId, interaction_id: InteractionId) {
        let mut subs = self.lock_mut();
        for slot in subs.values_mut() {
            if slot.subscriber.is_authorized(session_id) {
                slot.subscriber.clear_pending(interaction_id);
            }
        }
    }

    /// Validate and record an inbound response's nonce for replay
    /// detection and its timestamp for staleness, per spec §4.4.
    pub fn validate_response_freshness(
        &self,
        client_id: ClientId,
        nonce: &str,
        timestamp: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<UserId> {
        let mut subs = self.lock_mut();
        let slot = subs
            .get_mut(&client_id)
            .ok_or_else(|| GatewayError::Unauthorized("unknown client".to_string()))?;

        let window = chrono::Duration::seconds(self.config.nonce_window_seconds);
        if (timestamp - now).abs() > window {
            return Err(GatewayError::Expired);
        }
        if !slot.subscriber.record_nonce(nonce) {
            return Err(GatewayError::ReplayDetected);
        }
        Ok(slot.subscriber.user_id.clone())
    }

    /// Total connected subscribers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock_ref().len()
    }

    /// Whether no subscribers are connected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock_ref().is_empty()
    }

    /// Mark subscribers whose heartbeat ACK was not observed before the
    /// next tick as dead, returning their ids for the caller to disconnect.
    /// This does not remove them — the connection layer owns teardown.
    #[must_use]
    pub fn sweep_zombies(&self) -> Vec<ClientId> {
        let subs = self.lock_ref();
        subs.iter()
            .filter(|(_, slot)| !slot.subscriber.is_alive)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Reset every subscriber's liveness flag to "unacknowledged" ahead of
    /// sending the next round of pings.
    pub fn reset_liveness(&self) {
        let mut subs = self.lock_mut();
        for slot in subs.values_mut() {
            slot.subscriber.is_alive = false;
        }
    }

    /// Mark a subscriber alive (it sent a `pong`).
    pub fn mark_alive(&self, client_id: ClientId, now: DateTime<Utc>) {
        let mut subs = self.lock_mut();
        if let Some(slot) = subs.get_mut(&client_id) {
            slot.subscriber.is_alive = true;
            slot.subscriber.last_seen = now;
        }
    }

    /// Every connected client id, for broadcasting pings.
    #[must_use]
    pub fn all_client_ids(&self) -> Vec<ClientId> {
        self.lock_ref().keys().copied().collect()
    }
}

impl Slot {
    fn flush(&mut self) -> Vec<OutboundEnvelope> {
        self.subscriber.flush_queue()
    }
}

impl std::fmt::Debug for SubscriberRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberRegistry")
            .field("connected", &self.len())
            .field(
                "total_subscriptions",
                &self.total_subscriptions.load(Ordering::SeqCst),
            )
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use broker_core::audit::NoopAuditSink;
    use broker_core::auth::SessionOwnershipVerifier;
    use std::collections::HashSet as StdHashSet;

    /// A verifier backed by a fixed in-memory ownership table, local to
    /// this crate's tests (`broker-core`'s own test double is private to
    /// that crate).
    #[derive(Default)]
    struct StaticVerifier {
        owned: StdHashSet<(UserId, SessionId)>,
    }

    impl StaticVerifier {
        fn new() -> Self {
            Self::default()
        }

        fn grant(mut self, user_id: UserId, session_id: SessionId) -> Self {
            self.owned.insert((user_id, session_id));
            self
        }

        fn into_arc(self) -> ArcVerifier {
            Arc::new(self)
        }
    }

    #[async_trait]
    impl SessionOwnershipVerifier for StaticVerifier {
        async fn verify(&self, user_id: &UserId, session_id: SessionId) -> bool {
            self.owned.contains(&(user_id.clone(), session_id))
        }
    }

    fn registry() -> (SubscriberRegistry, SessionId, UserId) {
        let alice = UserId("alice".into());
        let session = SessionId::new();
        let verifier = StaticVerifier::new()
            .grant(alice.clone(), session)
            .into_arc();
        let registry = SubscriberRegistry::new(
            Arc::new(GatewayConfig::default()),
            verifier,
            Arc::new(NoopAuditSink),
        );
        (registry, session, alice)
    }

    #[tokio::test]
    async fn subscribe_authorizes_owned_session() {
        let (registry, session, alice) = registry();
        let (client, _notify) = registry.add(alice, Utc::now()).unwrap();
        let outcome = registry.subscribe(client, vec![session], Utc::now()).await.unwrap();
        assert_eq!(outcome.authorized, vec![session]);
        assert!(outcome.unauthorized.is_empty());
    }

    #[tokio::test]
    async fn subscribe_rejects_unowned_session() {
        let (registry, _session, _alice) = registry();
        let mallory = UserId("mallory".into());
        let (client, _notify) = registry.add(mallory, Utc::now()).unwrap();
        let stranger_session = SessionId::new();
        let outcome = registry
            .subscribe(client, vec![stranger_session], Utc::now())
            .await
            .unwrap();
        assert!(outcome.authorized.is_empty());
        assert_eq!(outcome.unauthorized, vec![stranger_session]);
    }

    #[tokio::test]
    async fn iterate_for_session_only_returns_authorized() {
        let (registry, session, alice) = registry();
        let (client, _notify) = registry.add(alice, Utc::now()).unwrap();
        assert!(registry.iterate_for_session(session).is_empty());
        registry.subscribe(client, vec![session], Utc::now()).await.unwrap();
        assert_eq!(registry.iterate_for_session(session), vec![client]);
    }

    #[tokio::test]
    async fn replay_nonce_rejected() {
        let (registry, session, alice) = registry();
        let (client, _notify) = registry.add(alice, Utc::now()).unwrap();
        registry.subscribe(client, vec![session], Utc::now()).await.unwrap();

        let now = Utc::now();
        assert!(registry.validate_response_freshness(client, "n1", now, now).is_ok());
        assert!(matches!(
            registry.validate_response_freshness(client, "n1", now, now),
            Err(GatewayError::ReplayDetected)
        ));
    }

    #[tokio::test]
    async fn server_wide_subscription_cap_is_enforced() {
        let alice = UserId("alice".into());
        let first = SessionId::new();
        let second = SessionId::new();
        let verifier = StaticVerifier::new()
            .grant(alice.clone(), first)
            .grant(alice.clone(), second)
            .into_arc();
        let mut config = GatewayConfig::default();
        config.max_total_subscriptions = 1;
        let registry = SubscriberRegistry::new(Arc::new(config), verifier, Arc::new(NoopAuditSink));

        let (client, _notify) = registry.add(alice, Utc::now()).unwrap();
        registry.subscribe(client, vec![first], Utc::now()).await.unwrap();

        let err = registry
            .subscribe(client, vec![second], Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::RateLimit("MAX_SUBSCRIPTIONS")));
    }

    #[tokio::test]
    async fn expired_timestamp_rejected() {
        let (registry, _session, alice) = registry();
        let (client, _notify) = registry.add(alice, Utc::now()).unwrap();
        let now = Utc::now();
        let stale = now - chrono::Duration::seconds(61);
        assert!(matches!(
            registry.validate_response_freshness(client, "n1", stale, now),
            Err(GatewayError::Expired)
        ));
    }
}
