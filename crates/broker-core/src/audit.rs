//! Security-event observability hook, per spec §4.6 and §7.
//!
//! Scoped down from `astrid_audit::AuditLog` to a hook trait only — no
//! append-only storage, no chain-linking/signing. Persisting a real audit
//! log is explicitly out of scope (spec §1 Non-goals); this exists so a
//! caller can plug one in without the broker knowing about it.

use async_trait::async_trait;

use crate::types::{InteractionId, SessionId, UserId};

/// A security-relevant event worth surfacing outside the broker.
#[derive(Debug, Clone)]
pub enum SecurityEvent {
    /// A subscriber attempted to authorize a session it does not own.
    UnauthorizedSubscribe {
        /// The subscriber's user id.
        user_id: UserId,
        /// The session it attempted to claim.
        session_id: SessionId,
    },
    /// An inbound response reused a nonce already seen for this subscriber.
    ReplayDetected {
        /// The responding user.
        user_id: UserId,
        /// The interaction targeted.
        interaction_id: InteractionId,
    },
    /// A subscriber exceeded a configured rate limit.
    RateLimit {
        /// The subscriber's user id.
        user_id: UserId,
        /// Which limit was hit, for logging.
        limit: &'static str,
    },
    /// A response's claimed session did not match the interaction's actual
    /// owning session.
    SessionMismatch {
        /// The responding user.
        user_id: UserId,
        /// The interaction targeted.
        interaction_id: InteractionId,
    },
}

/// Receives [`SecurityEvent`]s as they occur. Implementors must not block —
/// `notify` is called inline on the hot path of subscribe/response handling.
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Record a security event.
    async fn notify(&self, event: SecurityEvent);
}

/// Discards every event. The default when no sink is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAuditSink;

#[async_trait]
impl AuditSink for NoopAuditSink {
    async fn notify(&self, _event: SecurityEvent) {}
}

/// Logs every event at `warn!` via `tracing`. Reasonable default for a
/// deployment with no external audit pipeline.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn notify(&self, event: SecurityEvent) {
        match event {
            SecurityEvent::UnauthorizedSubscribe { user_id, session_id } => {
                tracing::warn!(%user_id, %session_id, "UNAUTHORIZED_SUBSCRIBE");
            }
            SecurityEvent::ReplayDetected { user_id, interaction_id } => {
                tracing::warn!(%user_id, %interaction_id, "REPLAY_DETECTED");
            }
            SecurityEvent::RateLimit { user_id, limit } => {
                tracing::warn!(%user_id, limit, "RATE_LIMIT");
            }
            SecurityEvent::SessionMismatch { user_id, interaction_id } => {
                tracing::warn!(%user_id, %interaction_id, "SESSION_MISMATCH");
            }
        }
    }
}
