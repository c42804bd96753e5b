//! Bridges `InteractionStore` lifecycle events to `SubscriberRegistry`, and
//! validates/dispatches inbound subscriber messages, per spec §4.5.
//!
//! The outbound half is grounded on `astrid_gateway::server::rpc::events`'s
//! broadcast-to-subscription forwarding task, generalized from "one
//! broadcast channel fanning out to every subscription" to "per-session
//! authorized delivery" — the spec's explicit fix for the source system's
//! broadcast-to-all flaw (spec §1).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use broker_core::audit::{AuditSink, SecurityEvent};
use broker_core::error::BrokerError;
use broker_core::store::{InteractionStore, StoreEvent};
use broker_core::types::{ClientId, InteractionId, SessionId, UserId};
use chrono::Utc;
use tokio::sync::mpsc;

use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::protocol::{InboundEnvelope, OutboundEnvelope, UpdateStatus, WireInteraction};
use crate::registry::SubscriberRegistry;

/// Glue between the store's event stream and the subscriber registry.
pub struct FanoutRouter {
    store: InteractionStore,
    registry: Arc<SubscriberRegistry>,
    audit: Arc<dyn AuditSink>,
    config: Arc<GatewayConfig>,
    sequence: AtomicU64,
}

impl FanoutRouter {
    /// Build a router over an existing store and registry.
    #[must_use]
    pub fn new(
        store: InteractionStore,
        registry: Arc<SubscriberRegistry>,
        audit: Arc<dyn AuditSink>,
        config: Arc<GatewayConfig>,
    ) -> Self {
        Self {
            store,
            registry,
            audit,
            config,
            sequence: AtomicU64::new(0),
        }
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst)
    }

    /// Drive the outbound half: consume store lifecycle events for as long
    /// as the store's sender half (and thus this receiver) stays open.
    /// Intended to be spawned once as a background task.
    pub async fn run_outbound(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<StoreEvent>) {
        while let Some(event) = events.recv().await {
            self.handle_store_event(event);
        }
        tracing::debug!("FanoutRouter outbound loop exiting: store event channel closed");
    }

    fn handle_store_event(&self, event: StoreEvent) {
        match event {
            StoreEvent::Created(snapshot) => self.fanout_created(snapshot),
            StoreEvent::Resolved { id, session_id } => {
                self.fanout_update(id, session_id, UpdateStatus::Resolved);
            }
            StoreEvent::Rejected { id, session_id, .. } => {
                self.fanout_update(id, session_id, UpdateStatus::Rejected);
            }
            StoreEvent::TimedOut { id, session_id } => {
                self.fanout_update(id, session_id, UpdateStatus::TimedOut);
            }
            StoreEvent::SessionEvicted {
                session_id,
                interaction_ids,
            } => {
                for id in interaction_ids {
                    self.fanout_update(id, Some(session_id), UpdateStatus::Rejected);
                }
            }
        }
    }

    fn fanout_created(&self, snapshot: broker_core::types::InteractionSnapshot) {
        let Some(session_id) = snapshot.session_id else {
            // Session-less interactions have no authorized-subscriber set to
            // fan out to; they are only reachable by direct store inspection.
            return;
        };
        let targets = self.registry.iterate_for_session(session_id);
        if targets.is_empty() {
            // No subscriber is authorized yet. The interaction stays pending
            // in the store; a later `interaction-sync-request` for this
            // session will surface it without any extra bookkeeping here.
            return;
        }

        let envelope = OutboundEnvelope::InteractionRequest {
            sequence_number: self.next_sequence(),
            interaction: WireInteraction {
                id: snapshot.id,
                session_id: Some(session_id),
                data: snapshot.data,
                metadata: snapshot.metadata,
                requested_at: snapshot.requested_at,
            },
        };

        for client_id in targets {
            self.registry.mark_pending(client_id, snapshot.id);
            self.registry.enqueue(client_id, envelope.clone());
        }
    }

    fn fanout_update(&self, id: InteractionId, session_id: Option<SessionId>, status: UpdateStatus) {
        let Some(session_id) = session_id else {
            return;
        };
        self.registry.clear_pending_for_session(session_id, id);

        let envelope = OutboundEnvelope::InteractionUpdate {
            sequence_number: self.next_sequence(),
            interaction_id: id,
            session_id: Some(session_id),
            status,
        };
        for client_id in self.registry.iterate_for_session(session_id) {
            self.registry.enqueue(client_id, envelope.clone());
        }
    }

    /// Validate and dispatch one inbound message, returning the direct
    /// reply (if any) to send back to `client_id`. Per spec §4.5, schema
    /// failures and authorization failures never mutate state.
    pub async fn handle_inbound(
        &self,
        client_id: ClientId,
        raw: &[u8],
    ) -> Option<OutboundEnvelope> {
        if raw.len() > self.config.max_frame_bytes {
            return Some(error_envelope(None, GatewayError::FrameTooLarge));
        }

        let envelope: InboundEnvelope = match serde_json::from_slice(raw) {
            Ok(envelope) => envelope,
            Err(e) => return Some(error_envelope(None, GatewayError::Schema(e.to_string()))),
        };

        match envelope {
            InboundEnvelope::Subscribe { session_ids } | InboundEnvelope::InteractionSyncRequest { session_ids } => {
                self.handle_subscribe(client_id, session_ids).await
            }
            InboundEnvelope::InteractionResponse {
                interaction_id,
                response,
                nonce,
                timestamp,
            } => {
                self.handle_response(client_id, interaction_id, response, nonce, timestamp)
                    .await
            }
            InboundEnvelope::Pong => {
                self.registry.mark_alive(client_id, Utc::now());
                None
            }
        }
    }

    async fn handle_subscribe(
        &self,
        client_id: ClientId,
        session_ids: Vec<SessionId>,
    ) -> Option<OutboundEnvelope> {
        let now = Utc::now();
        let outcome = match self.registry.subscribe(client_id, session_ids, now).await {
            Ok(outcome) => outcome,
            Err(e @ (GatewayError::RateLimit(_) | GatewayError::LimitExceeded)) => {
                self.audit
                    .notify(SecurityEvent::RateLimit {
                        user_id: UserId("unknown".to_string()),
                        limit: rate_limit_label(&e),
                    })
                    .await;
                return Some(error_envelope(None, e));
            }
            Err(e) => return Some(error_envelope(None, e)),
        };

        if outcome.authorized.is_empty() {
            return Some(error_envelope(
                None,
                GatewayError::Unauthorized("none of the requested sessions are owned by this user".to_string()),
            ));
        }

        let interactions = self
            .store
            .get_for_sessions(&outcome.authorized, None)
            .into_iter()
            .map(|snapshot| WireInteraction {
                id: snapshot.id,
                session_id: snapshot.session_id,
                data: snapshot.data,
                metadata: snapshot.metadata,
                requested_at: snapshot.requested_at,
            })
            .collect();

        Some(OutboundEnvelope::InteractionSyncResponse {
            sequence_number: self.next_sequence(),
            interactions,
        })
    }

    async fn handle_response(
        &self,
        client_id: ClientId,
        interaction_id: InteractionId,
        response: broker_core::types::InteractionResponse,
        nonce: String,
        timestamp: chrono::DateTime<Utc>,
    ) -> Option<OutboundEnvelope> {
        let now = Utc::now();
        let user_id = match self
            .registry
            .validate_response_freshness(client_id, &nonce, timestamp, now)
        {
            Ok(user_id) => user_id,
            Err(e @ GatewayError::ReplayDetected) => {
                self.audit
                    .notify(SecurityEvent::ReplayDetected {
                        user_id: UserId("unknown".to_string()),
                        interaction_id,
                    })
                    .await;
                return Some(error_envelope(Some(interaction_id), e));
            }
            Err(e) => return Some(error_envelope(Some(interaction_id), e)),
        };

        if let Some(reason) = schema_violation(&self.store, interaction_id, &response) {
            return Some(error_envelope(Some(interaction_id), GatewayError::Schema(reason)));
        }

        match self.store.resolve(interaction_id, response, &user_id) {
            Ok(()) => None,
            Err(e @ BrokerError::SessionMismatch { .. }) => {
                self.audit
                    .notify(SecurityEvent::SessionMismatch { user_id, interaction_id })
                    .await;
                Some(error_envelope(Some(interaction_id), GatewayError::Broker(e)))
            }
            Err(e) => Some(error_envelope(Some(interaction_id), GatewayError::Broker(e))),
        }
    }
}

/// Validate an inbound response against the §3 data-model invariants its
/// kind carries, and (for ask-user) against the pending interaction's own
/// payload. Returns `Some(reason)` if the response is malformed; never
/// mutates the store. A response for an interaction no longer pending (or
/// never created) passes here and is left for `store.resolve` to reject
/// with `NOT_FOUND`.
fn schema_violation(
    store: &InteractionStore,
    interaction_id: InteractionId,
    response: &broker_core::types::InteractionResponse,
) -> Option<String> {
    use broker_core::types::{InteractionData, InteractionResponse};

    match response {
        InteractionResponse::Permission(permission) if !permission.is_well_formed() => {
            Some("permission response: decision=modify requires non-null updated_input".to_string())
        }
        InteractionResponse::AskUser(answers) => {
            let snapshot = store.get(interaction_id)?;
            let InteractionData::AskUser(payload) = &snapshot.data else {
                return Some("ask-user response does not match the pending interaction's kind".to_string());
            };
            if answers.answers_all(payload) {
                None
            } else {
                Some("ask-user response: every question index must be answered".to_string())
            }
        }
        _ => None,
    }
}

fn rate_limit_label(error: &GatewayError) -> &'static str {
    match error {
        GatewayError::RateLimit(label) => label,
        GatewayError::LimitExceeded => "MAX_SUBSCRIPTIONS_PER_SUBSCRIBER",
        _ => "unknown",
    }
}

fn error_envelope(interaction_id: Option<InteractionId>, error: GatewayError) -> OutboundEnvelope {
    OutboundEnvelope::Error {
        interaction_id,
        code: error.code(),
        message: error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use broker_core::audit::NoopAuditSink;
    use broker_core::auth::{ArcVerifier, SessionOwnershipVerifier};
    use broker_core::config::BrokerConfig;
    use broker_core::types::{AskUserPayload, InteractionData, InteractionMetadata, RiskLevel};

    struct AllowAll;

    #[async_trait]
    impl SessionOwnershipVerifier for AllowAll {
        async fn verify(&self, _user_id: &UserId, _session_id: SessionId) -> bool {
            true
        }
    }

    fn verifier() -> ArcVerifier {
        Arc::new(AllowAll)
    }

    fn setup() -> (Arc<FanoutRouter>, InteractionStore, Arc<SubscriberRegistry>) {
        let (store, events) = InteractionStore::new(BrokerConfig::default());
        let config = Arc::new(GatewayConfig::default());
        let registry = Arc::new(SubscriberRegistry::new(
            config.clone(),
            verifier(),
            Arc::new(NoopAuditSink),
        ));
        let router = Arc::new(FanoutRouter::new(
            store.clone(),
            registry.clone(),
            Arc::new(NoopAuditSink),
            config,
        ));
        tokio::spawn(router.clone().run_outbound(events));
        (router, store, registry)
    }

    #[tokio::test]
    async fn subscribe_then_created_interaction_is_delivered() {
        let (router, store, registry) = setup();
        let user = UserId("u".into());
        let session = SessionId::new();
        let (client, _notify) = registry.add(user.clone(), Utc::now()).unwrap();

        router
            .handle_subscribe(client, vec![session])
            .await
            .expect("authorized, expect a sync response");

        store
            .create(
                InteractionData::AskUser(AskUserPayload { questions: vec![] }),
                Some(session),
                user,
                InteractionMetadata::new(RiskLevel::Low, "test"),
            )
            .unwrap();

        // Give the outbound task a chance to process the Created event.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let queued = registry.flush_queue(client);
        assert!(queued
            .iter()
            .any(|e| matches!(e, OutboundEnvelope::InteractionRequest { .. })));
    }

    #[tokio::test]
    async fn unauthorized_subscribe_gets_error_reply() {
        struct DenyAll;
        #[async_trait]
        impl SessionOwnershipVerifier for DenyAll {
            async fn verify(&self, _user_id: &UserId, _session_id: SessionId) -> bool {
                false
            }
        }

        let (store, _events) = InteractionStore::new(BrokerConfig::default());
        let config = Arc::new(GatewayConfig::default());
        let registry = Arc::new(SubscriberRegistry::new(
            config.clone(),
            Arc::new(DenyAll),
            Arc::new(NoopAuditSink),
        ));
        let router = FanoutRouter::new(store, registry.clone(), Arc::new(NoopAuditSink), config);

        let (client, _notify) = registry.add(UserId("mallory".into()), Utc::now()).unwrap();
        let reply = router.handle_subscribe(client, vec![SessionId::new()]).await;
        assert!(matches!(
            reply,
            Some(OutboundEnvelope::Error { code: "UNAUTHORIZED", .. })
        ));
        assert!(registry.iterate_for_session(SessionId::new()).is_empty());
    }

    #[tokio::test]
    async fn malformed_modify_response_is_rejected_as_schema_violation() {
        use broker_core::types::{PermissionDecision, PermissionPayload, PermissionResponse};

        let (router, store, registry) = setup();
        let user = UserId("u".into());
        let session = SessionId::new();
        let (client, _notify) = registry.add(user.clone(), Utc::now()).unwrap();
        registry.subscribe(client, vec![session], Utc::now()).await.unwrap();

        let (interaction_id, _rx) = store
            .create(
                InteractionData::Permission(PermissionPayload {
                    tool_name: "Write".into(),
                    tool_input: serde_json::json!({}),
                }),
                Some(session),
                user,
                InteractionMetadata::new(RiskLevel::Low, "test"),
            )
            .unwrap();

        let malformed = broker_core::types::InteractionResponse::Permission(PermissionResponse {
            decision: PermissionDecision::Modify,
            updated_input: None,
        });

        let reply = router
            .handle_response(client, interaction_id, malformed, "n1".into(), Utc::now())
            .await;
        assert!(matches!(
            reply,
            Some(OutboundEnvelope::Error { code: "SCHEMA", .. })
        ));

        // The interaction is still pending — the malformed response never resolved it.
        assert!(store.get(interaction_id).is_some());
    }

    #[tokio::test]
    async fn incomplete_ask_user_answers_rejected_as_schema_violation() {
        use broker_core::types::{AnswerValue, AskUserResponse, Question};

        let (router, store, registry) = setup();
        let user = UserId("u".into());
        let session = SessionId::new();
        let (client, _notify) = registry.add(user.clone(), Utc::now()).unwrap();
        registry.subscribe(client, vec![session], Utc::now()).await.unwrap();

        let (interaction_id, _rx) = store
            .create(
                InteractionData::AskUser(AskUserPayload {
                    questions: vec![
                        Question {
                            header: "h1".into(),
                            question: "q1?".into(),
                            options: vec![],
                            multi_select: false,
                        },
                        Question {
                            header: "h2".into(),
                            question: "q2?".into(),
                            options: vec![],
                            multi_select: false,
                        },
                    ],
                }),
                Some(session),
                user,
                InteractionMetadata::new(RiskLevel::Low, "test"),
            )
            .unwrap();

        let mut answers = std::collections::HashMap::new();
        answers.insert(0, AnswerValue::Single("Other: yes".to_string()));
        let incomplete = broker_core::types::InteractionResponse::AskUser(AskUserResponse { answers });

        let reply = router
            .handle_response(client, interaction_id, incomplete, "n1".into(), Utc::now())
            .await;
        assert!(matches!(
            reply,
            Some(OutboundEnvelope::Error { code: "SCHEMA", .. })
        ));
        assert!(store.get(interaction_id).is_some());
    }

    #[tokio::test]
    async fn oversized_frame_rejected() {
        let (router, _store, _registry) = setup();
        let client = ClientId::new();
        let huge = vec![b'x'; 2_000_000];
        let reply = router.handle_inbound(client, &huge).await;
        assert!(matches!(
            reply,
            Some(OutboundEnvelope::Error { code: "FRAME_TOO_LARGE", .. })
        ));
    }
}
