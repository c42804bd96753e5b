//! Gateway-boundary error taxonomy, per spec §7's transport/protocol codes.

use broker_core::error::BrokerError;
use thiserror::Error;

/// Errors surfaced by the wire protocol, subscriber registry and transport.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// An inbound frame failed schema validation.
    #[error("schema validation failed: {0}")]
    Schema(String),

    /// An inbound response reused a nonce already seen for this subscriber.
    #[error("replay detected")]
    ReplayDetected,

    /// An inbound response's timestamp fell outside the accepted window.
    #[error("response timestamp expired")]
    Expired,

    /// A rate or quota limit was exceeded.
    #[error("rate limit exceeded: {0}")]
    RateLimit(&'static str),

    /// A subscriber tried to authorize more sessions than
    /// `max_subscriptions_per_subscriber` allows.
    #[error("subscription limit exceeded")]
    LimitExceeded,

    /// An inbound frame exceeded `max_frame_bytes`.
    #[error("frame too large")]
    FrameTooLarge,

    /// A subscribe/sync/response attempt failed session ownership
    /// verification.
    #[error("unauthorized session {0}")]
    Unauthorized(String),

    /// The underlying `InteractionStore`/`Broker` reported an error.
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// Transport-level I/O failure.
    #[error("transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    /// Config file could not be read or parsed.
    #[error("configuration error: {0}")]
    Config(String),

    /// Binding the listen address failed.
    #[error("failed to bind listener: {0}")]
    Bind(#[from] std::io::Error),
}

impl GatewayError {
    /// The wire-level error code for this error, per spec §7's taxonomy.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Schema(_) => "SCHEMA",
            Self::ReplayDetected => "REPLAY_DETECTED",
            Self::Expired => "EXPIRED",
            Self::RateLimit(_) => "RATE_LIMIT",
            Self::LimitExceeded => "LIMIT_EXCEEDED",
            Self::FrameTooLarge => "FRAME_TOO_LARGE",
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::Broker(broker_error) => broker_error_code(broker_error),
            Self::Transport(_) | Self::Config(_) | Self::Bind(_) => "INTERNAL",
        }
    }
}

fn broker_error_code(error: &BrokerError) -> &'static str {
    match error {
        BrokerError::QuotaExceeded(_) => "QUOTA_EXCEEDED",
        BrokerError::NotFound(_) => "NOT_FOUND",
        BrokerError::Unauthorized { .. } => "UNAUTHORIZED",
        BrokerError::SessionMismatch { .. } => "SESSION_MISMATCH",
        BrokerError::Timeout(_) => "TIMEOUT",
        BrokerError::Cancelled(_) => "CANCELLED",
        BrokerError::SessionEvicted(_, _) => "SESSION_EVICTED",
        BrokerError::Shutdown => "SHUTDOWN",
        BrokerError::Internal(_) => "INTERNAL",
    }
}

/// Convenience alias for gateway results.
pub type Result<T> = std::result::Result<T, GatewayError>;
