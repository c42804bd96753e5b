//! Pure-domain core of the interaction broker: the pending-interaction
//! store, the session reverse index, and the typed broker facade the agent
//! runtime calls into. No networking lives here — that is
//! `broker-gateway`'s job.

pub mod audit;
pub mod auth;
pub mod broker;
pub mod completion;
pub mod config;
pub mod error;
pub mod session_index;
pub mod store;
pub mod types;

pub mod prelude {
    //! Common imports for crates that embed `broker-core`.
    pub use crate::audit::{AuditSink, NoopAuditSink, SecurityEvent, TracingAuditSink};
    pub use crate::auth::{ArcVerifier, SessionOwnershipVerifier};
    pub use crate::broker::{Broker, PermissionMode};
    pub use crate::config::BrokerConfig;
    pub use crate::error::{BrokerError, Result};
    pub use crate::store::{InteractionStore, RejectReason, StoreEvent};
    pub use crate::types::*;
}
