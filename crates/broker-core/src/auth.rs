//! Session ownership verification, per spec §4.6.
//!
//! The broker core does not issue or store session ownership itself — that
//! is the auth layer's job (spec §1 Non-goals). This trait is the seam,
//! shaped after `astrid_core::frontend::traits::Frontend`'s
//! `Arc<dyn Trait + Send + Sync>` object pattern.

use async_trait::async_trait;
use std::sync::Arc;

use crate::types::{SessionId, UserId};

/// `verify(userId, sessionId) -> bool`, called on every subscribe, sync,
/// and response (spec §4.6). Must be a pure read over an authoritative
/// session registry owned elsewhere.
#[async_trait]
pub trait SessionOwnershipVerifier: Send + Sync {
    /// Whether `user_id` owns `session_id` right now.
    async fn verify(&self, user_id: &UserId, session_id: SessionId) -> bool;
}

/// Type-erased handle to a verifier, for storing in registries/configs.
pub type ArcVerifier = Arc<dyn SessionOwnershipVerifier>;

#[cfg(test)]
pub(crate) mod test_support {
    use super::{async_trait, ArcVerifier, SessionId, SessionOwnershipVerifier, UserId};
    use std::collections::HashSet;
    use std::sync::Arc;

    /// A verifier backed by a fixed in-memory ownership table, for tests.
    #[derive(Debug, Default)]
    pub struct StaticVerifier {
        owned: HashSet<(UserId, SessionId)>,
    }

    impl StaticVerifier {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn grant(mut self, user_id: UserId, session_id: SessionId) -> Self {
            self.owned.insert((user_id, session_id));
            self
        }

        pub fn into_arc(self) -> ArcVerifier {
            Arc::new(self)
        }
    }

    #[async_trait]
    impl SessionOwnershipVerifier for StaticVerifier {
        async fn verify(&self, user_id: &UserId, session_id: SessionId) -> bool {
            self.owned.contains(&(user_id.clone(), session_id))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::StaticVerifier;
    use super::*;

    #[tokio::test]
    async fn grants_only_the_specific_pair() {
        let alice = UserId("alice".into());
        let s = SessionId::new();
        let verifier = StaticVerifier::new().grant(alice.clone(), s).into_arc();

        assert!(verifier.verify(&alice, s).await);
        assert!(!verifier.verify(&UserId("mallory".into()), s).await);
    }
}
