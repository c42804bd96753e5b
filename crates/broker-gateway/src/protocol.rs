//! The WebSocket wire envelope, per spec §6.
//!
//! Adapted from `discord_proxy::protocol`'s `GatewayPayload` wire struct:
//! that module tags frames with a numeric Discord opcode and a generic
//! `Option<Value>` data field; this one tags frames with a `type` string
//! discriminant and a typed, per-variant payload, since this protocol (unlike
//! Discord's Gateway) is under our own control end to end.

use broker_core::types::{
    InteractionData, InteractionId, InteractionMetadata, InteractionResponse, SessionId,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maximum accepted frame size is enforced by the caller (the connection
/// read loop) before a frame ever reaches (de)serialization; see spec §6
/// "Message size" and `GatewayConfig::max_frame_bytes`.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1_048_576;

/// Status an `interaction-update` envelope reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UpdateStatus {
    /// Resolved by a human decision.
    Resolved,
    /// Rejected (cancelled, shutdown, or session-evicted).
    Rejected,
    /// Timed out before any response arrived.
    TimedOut,
}

/// One interaction as rendered for `interaction-request` /
/// `interaction-sync-response` payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireInteraction {
    /// The interaction's id.
    pub id: InteractionId,
    /// Its owning session, if any.
    pub session_id: Option<SessionId>,
    /// Kind-specific payload (self-describing via its own `interactionType`
    /// tag, spec §3/§6).
    #[serde(flatten)]
    pub data: InteractionData,
    /// Kind-independent metadata.
    pub metadata: InteractionMetadata,
    /// When the interaction was created.
    pub requested_at: DateTime<Utc>,
}

/// Server -> client envelopes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum OutboundEnvelope {
    /// A new interaction is pending and requires a human decision.
    #[serde(rename_all = "camelCase")]
    InteractionRequest {
        /// Monotonically increasing per-connection sequence number.
        sequence_number: u64,
        /// The interaction, flattened.
        #[serde(flatten)]
        interaction: WireInteraction,
    },
    /// An interaction reached a terminal state.
    #[serde(rename_all = "camelCase")]
    InteractionUpdate {
        /// Monotonically increasing per-connection sequence number.
        sequence_number: u64,
        /// The interaction that changed.
        interaction_id: InteractionId,
        /// Its owning session, if any.
        session_id: Option<SessionId>,
        /// Terminal status reached.
        status: UpdateStatus,
    },
    /// Reply to `subscribe` / `interaction-sync-request`: the currently
    /// pending interactions for the authorized sessions.
    #[serde(rename_all = "camelCase")]
    InteractionSyncResponse {
        /// Monotonically increasing per-connection sequence number.
        sequence_number: u64,
        /// Pending interactions visible to the requester.
        interactions: Vec<WireInteraction>,
    },
    /// A typed error reply.
    #[serde(rename_all = "camelCase")]
    Error {
        /// The interaction the error pertains to, if any.
        interaction_id: Option<InteractionId>,
        /// Error code, drawn from spec §7's taxonomy.
        code: &'static str,
        /// Human-readable detail.
        message: String,
    },
    /// Heartbeat liveness probe.
    #[serde(rename_all = "camelCase")]
    Ping {
        /// Monotonically increasing per-connection sequence number.
        sequence_number: u64,
    },
}

/// Client -> server envelopes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum InboundEnvelope {
    /// Authorize this connection for a set of sessions.
    #[serde(rename_all = "camelCase")]
    Subscribe {
        /// Sessions to authorize, pending ownership verification.
        session_ids: Vec<SessionId>,
    },
    /// Idempotent variant of `subscribe` that also requests a full sync of
    /// currently pending interactions.
    #[serde(rename_all = "camelCase")]
    InteractionSyncRequest {
        /// Sessions to authorize and sync.
        session_ids: Vec<SessionId>,
    },
    /// A human's decision on a pending interaction.
    #[serde(rename_all = "camelCase")]
    InteractionResponse {
        /// The interaction being responded to.
        interaction_id: InteractionId,
        /// The kind-specific response.
        response: InteractionResponse,
        /// Single-use replay guard.
        nonce: String,
        /// Sender's wall-clock time, checked against the server's
        /// `nonce_window_seconds`.
        timestamp: DateTime<Utc>,
    },
    /// Heartbeat liveness reply.
    Pong,
}

#[cfg(test)]
mod tests {
    use super::*;
    use broker_core::types::{InteractionKind, InteractionMetadata, PermissionPayload, RiskLevel};

    #[test]
    fn interaction_request_round_trips() {
        let envelope = OutboundEnvelope::InteractionRequest {
            sequence_number: 1,
            interaction: WireInteraction {
                id: InteractionId::new(),
                session_id: Some(SessionId::new()),
                data: InteractionData::Permission(PermissionPayload {
                    tool_name: "Write".to_string(),
                    tool_input: serde_json::json!({"path": "/a"}),
                }),
                metadata: InteractionMetadata::new(RiskLevel::Medium, "filesystem"),
                requested_at: Utc::now(),
            },
        };

        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["type"], "interaction-request");
        assert_eq!(json["interactionType"], "permission");

        let back: OutboundEnvelope = serde_json::from_value(json).unwrap();
        match back {
            OutboundEnvelope::InteractionRequest { interaction, .. } => {
                assert_eq!(interaction.data.kind(), InteractionKind::Permission);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn inbound_subscribe_round_trips() {
        let envelope = InboundEnvelope::Subscribe {
            session_ids: vec![SessionId::new(), SessionId::new()],
        };
        let json = serde_json::to_string(&envelope).unwrap();
        let back: InboundEnvelope = serde_json::from_str(&json).unwrap();
        match back {
            InboundEnvelope::Subscribe { session_ids } => assert_eq!(session_ids.len(), 2),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn pong_has_no_payload() {
        let json = serde_json::to_value(InboundEnvelope::Pong).unwrap();
        assert_eq!(json["type"], "pong");
    }
}
