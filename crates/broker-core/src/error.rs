//! Error taxonomy for the broker core, per spec §7.

use thiserror::Error;

use crate::types::{InteractionId, SessionId, UserId};

/// Errors surfaced by [`crate::store::InteractionStore`], [`crate::session_index::SessionIndex`]
/// and [`crate::broker::Broker`].
///
/// Internal bookkeeping that cannot fail (plain map mutations) returns
/// values directly rather than `Result` — only the failure modes below are
/// ever reported to a caller.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// A session already holds `max_interactions_per_session` pending
    /// interactions, or the global session table is at `max_sessions`.
    #[error("quota exceeded: {0}")]
    QuotaExceeded(&'static str),

    /// No interaction exists with this id (already resolved, rejected, or
    /// never created).
    #[error("interaction {0} not found")]
    NotFound(InteractionId),

    /// A response targeted an interaction not owned by the responding
    /// session.
    #[error("user {user} is not authorized to respond to interaction {interaction}")]
    Unauthorized {
        /// The user that attempted the response.
        user: UserId,
        /// The interaction they attempted to respond to.
        interaction: InteractionId,
    },

    /// A response's session id did not match the interaction's owning
    /// session.
    #[error("interaction {interaction} belongs to session {expected}, not {actual}")]
    SessionMismatch {
        /// The interaction in question.
        interaction: InteractionId,
        /// The session it actually belongs to.
        expected: SessionId,
        /// The session the caller claimed.
        actual: SessionId,
    },

    /// The interaction's per-kind timeout fired before any response arrived.
    #[error("interaction {0} timed out")]
    Timeout(InteractionId),

    /// The waiting caller's future was cancelled (e.g. the agent turn ended).
    #[error("interaction {0} was cancelled")]
    Cancelled(InteractionId),

    /// The owning session was evicted (TTL expiry or explicit close) while
    /// the interaction was still pending.
    #[error("session {0} was evicted while interaction {1} was pending")]
    SessionEvicted(SessionId, InteractionId),

    /// The broker is shutting down; no new interactions are accepted and
    /// all pending ones are being rejected.
    #[error("broker is shutting down")]
    Shutdown,

    /// Anything else — a collaborator (e.g. `SessionOwnershipVerifier`)
    /// failed, or an invariant was violated.
    #[error("internal broker error: {0}")]
    Internal(String),
}

impl BrokerError {
    /// Whether this error represents a caller mistake (bad input, wrong
    /// ownership) as opposed to a timing/lifecycle outcome.
    #[must_use]
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Self::Unauthorized { .. } | Self::SessionMismatch { .. } | Self::NotFound(_)
        )
    }
}

/// Convenience alias for broker-core results.
pub type Result<T> = std::result::Result<T, BrokerError>;
