//! The authoritative pending-interaction table, per spec §4.1.
//!
//! Exactly-once resolution is the one invariant every other component leans
//! on: `resolve`/`reject`/`timeout_fire` all funnel through `take_entry`,
//! which removes the entry from both the primary map and the session index
//! under a single lock before anything is signaled. Whoever wins that
//! removal is the only caller that ever completes the waiting future —
//! mirroring `AllowanceStore::find_matching_and_consume`'s single
//! write-lock find-and-mutate shape, generalized from "consume an
//! allowance" to "consume a pending interaction".

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::completion::{self, CompletionSender};
use crate::config::BrokerConfig;
use crate::error::{BrokerError, Result};
use crate::session_index::SessionIndex;
use crate::types::{
    InteractionData, InteractionId, InteractionKind, InteractionMetadata, InteractionResponse,
    InteractionSnapshot, InteractionStatus, SessionId, UserId,
};

/// Lifecycle events the store emits for [`crate::broker::Broker`]/the
/// gateway's `FanoutRouter` to fan out. Receiving is optional — a store with
/// no attached consumer simply drops events once its channel buffer (it is
/// unbounded, matching the teacher's `broadcast`-free internal event
/// plumbing in `rpc/events.rs`, which is fine here since volume is bounded
/// by interaction traffic, not arbitrary data) has no reader.
#[derive(Debug, Clone)]
pub enum StoreEvent {
    /// A new interaction was created and is now pending.
    Created(InteractionSnapshot),
    /// An interaction was resolved by a human response.
    Resolved {
        /// The interaction resolved.
        id: InteractionId,
        /// Its owning session, if any.
        session_id: Option<SessionId>,
    },
    /// An interaction was rejected (cancelled or shutdown), not resolved.
    Rejected {
        /// The interaction rejected.
        id: InteractionId,
        /// Its owning session, if any.
        session_id: Option<SessionId>,
        /// Why it was rejected.
        reason: RejectReason,
    },
    /// An interaction's per-kind timer fired before any response arrived.
    TimedOut {
        /// The interaction that timed out.
        id: InteractionId,
        /// Its owning session, if any.
        session_id: Option<SessionId>,
    },
    /// A session was evicted, taking every pending interaction it held with
    /// it.
    SessionEvicted {
        /// The evicted session.
        session_id: SessionId,
        /// Interactions that were pending for it.
        interaction_ids: Vec<InteractionId>,
    },
}

/// Why an interaction was rejected via [`InteractionStore::reject`] (as
/// opposed to timing out or its session being evicted).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// The caller's cancellation signal fired.
    Cancelled,
    /// The broker is shutting down.
    Shutdown,
}

impl RejectReason {
    fn into_error(self, id: InteractionId) -> BrokerError {
        match self {
            Self::Cancelled => BrokerError::Cancelled(id),
            Self::Shutdown => BrokerError::Shutdown,
        }
    }
}

type Completion = CompletionSender<Result<InteractionResponse>>;

struct Entry {
    session_id: Option<SessionId>,
    user_id: UserId,
    data: InteractionData,
    metadata: InteractionMetadata,
    requested_at: DateTime<Utc>,
    completion: Completion,
    timer: JoinHandle<()>,
}

impl Entry {
    fn snapshot(&self, id: InteractionId) -> InteractionSnapshot {
        InteractionSnapshot {
            id,
            session_id: self.session_id,
            user_id: self.user_id.clone(),
            data: self.data.clone(),
            metadata: self.metadata.clone(),
            requested_at: self.requested_at,
            decided_at: None,
            status: InteractionStatus::Pending,
        }
    }
}

struct StoreInner {
    entries: HashMap<InteractionId, Entry>,
    sessions: SessionIndex,
}

impl StoreInner {
    /// Pure read: is `acting_user_id` allowed to resolve `id`? A session-
    /// owned interaction is authorized by the session's registered owner;
    /// a session-less interaction is authorized by its own creator.
    fn authorized(&self, id: InteractionId, acting_user_id: &UserId) -> Result<bool> {
        let entry = self.entries.get(&id).ok_or(BrokerError::NotFound(id))?;
        Ok(match entry.session_id {
            Some(sid) => self
                .sessions
                .get(sid)
                .is_some_and(|s| s.owner == *acting_user_id),
            None => entry.user_id == *acting_user_id,
        })
    }

    /// Remove every interaction belonging to `session_id`, and the session
    /// entry itself, returning what was removed for the caller to signal
    /// once the lock is released.
    fn take_session(&mut self, session_id: SessionId) -> Vec<(InteractionId, Entry)> {
        let ids = self.sessions.remove(session_id).unwrap_or_default();
        ids.into_iter()
            .filter_map(|id| self.entries.remove(&id).map(|e| (id, e)))
            .collect()
    }
}

struct StoreShared {
    inner: RwLock<StoreInner>,
    config: BrokerConfig,
    events: mpsc::UnboundedSender<StoreEvent>,
}

/// The pending-interaction store. Cheap to clone — internally an `Arc`,
/// the same handle-type shape as `ApprovalManager`.
#[derive(Clone)]
pub struct InteractionStore(Arc<StoreShared>);

impl InteractionStore {
    /// Build a fresh, empty store. Returns the store and the receiving end
    /// of its lifecycle event stream.
    #[must_use]
    pub fn new(config: BrokerConfig) -> (Self, mpsc::UnboundedReceiver<StoreEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = StoreShared {
            inner: RwLock::new(StoreInner {
                entries: HashMap::new(),
                sessions: SessionIndex::new(config.max_sessions),
            }),
            config,
            events: tx,
        };
        (Self(Arc::new(shared)), rx)
    }

    fn lock_mut(&self) -> RwLockWriteGuard<'_, StoreInner> {
        self.0.inner.write().unwrap_or_else(|poisoned| {
            tracing::warn!("InteractionStore lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn lock_ref(&self) -> RwLockReadGuard<'_, StoreInner> {
        self.0.inner.read().unwrap_or_else(|poisoned| {
            tracing::warn!("InteractionStore lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn emit(&self, event: StoreEvent) {
        let _ = self.0.events.send(event);
    }

    fn spawn_timer(&self, id: InteractionId, timeout: StdDuration) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            store.timeout_fire(id).await;
        })
    }

    /// Allocate a fresh interaction, insert it into the primary map and the
    /// session index atomically, and arm its per-kind timeout timer.
    ///
    /// Fails with [`BrokerError::QuotaExceeded`] if `session_id` already
    /// holds `max_interactions_per_session` pending interactions.
    pub fn create(
        &self,
        data: InteractionData,
        session_id: Option<SessionId>,
        user_id: UserId,
        metadata: InteractionMetadata,
    ) -> Result<(InteractionId, completion::CompletionReceiver<Result<InteractionResponse>>)> {
        let now = Utc::now();
        let id = InteractionId::new();
        let timeout = self.0.config.timeout_for(data.kind());
        let (tx, rx) = completion::channel();

        let mut disposed: Option<(SessionId, Vec<(InteractionId, Entry)>)> = None;
        let snapshot_data = data.clone();
        let snapshot_metadata = metadata.clone();
        let snapshot_user = user_id.clone();

        {
            let mut inner = self.lock_mut();

            if let Some(sid) = session_id {
                if inner.sessions.pending_count(sid) >= self.0.config.max_interactions_per_session
                {
                    return Err(BrokerError::QuotaExceeded("MAX_INTERACTIONS_PER_SESSION"));
                }
                let touch = inner.sessions.touch(sid, &user_id, now);
                if let Some(disposed_id) = touch.disposed {
                    disposed = Some((disposed_id, inner.take_session(disposed_id)));
                }
                inner.sessions.insert_interaction(sid, id);
            }

            let timer = self.spawn_timer(id, timeout);
            inner.entries.insert(
                id,
                Entry {
                    session_id,
                    user_id,
                    data,
                    metadata,
                    requested_at: now,
                    completion: tx,
                    timer,
                },
            );
        }

        if let Some((disposed_session, entries)) = disposed {
            self.finish_session_eviction(disposed_session, entries);
        }

        self.emit(StoreEvent::Created(InteractionSnapshot {
            id,
            session_id,
            user_id: snapshot_user,
            data: snapshot_data,
            metadata: snapshot_metadata,
            requested_at: now,
            decided_at: None,
            status: InteractionStatus::Pending,
        }));

        Ok((id, rx))
    }

    /// Transition `pending -> resolved`. See module docs for the
    /// delete-before-signal ordering this relies on.
    pub fn resolve(
        &self,
        id: InteractionId,
        response: InteractionResponse,
        acting_user_id: &UserId,
    ) -> Result<()> {
        let (entry, session_id) = {
            let mut inner = self.lock_mut();
            if !inner.authorized(id, acting_user_id)? {
                return Err(BrokerError::Unauthorized {
                    user: acting_user_id.clone(),
                    interaction: id,
                });
            }
            let entry = inner
                .entries
                .remove(&id)
                .expect("authorized() already confirmed presence");
            if let Some(sid) = entry.session_id {
                inner.sessions.remove_interaction(sid, id);
            }
            let session_id = entry.session_id;
            (entry, session_id)
        };

        entry.timer.abort();
        let _ = entry.completion.complete(Ok(response));
        self.emit(StoreEvent::Resolved { id, session_id });
        Ok(())
    }

    /// Transition `pending -> rejected` for a reason other than timeout or
    /// session eviction (cancellation, shutdown).
    pub fn reject(&self, id: InteractionId, reason: RejectReason) -> Result<()> {
        let entry = {
            let mut inner = self.lock_mut();
            let entry = inner.entries.remove(&id).ok_or(BrokerError::NotFound(id))?;
            if let Some(sid) = entry.session_id {
                inner.sessions.remove_interaction(sid, id);
            }
            entry
        };

        let session_id = entry.session_id;
        entry.timer.abort();
        let _ = entry.completion.complete(Err(reason.into_error(id)));
        self.emit(StoreEvent::Rejected {
            id,
            session_id,
            reason,
        });
        Ok(())
    }

    /// Internal callback invoked by the per-interaction timer. A no-op if
    /// the interaction already reached a terminal state before the timer
    /// fired (it simply won't be in the map any more).
    async fn timeout_fire(&self, id: InteractionId) {
        let entry = {
            let mut inner = self.lock_mut();
            let Some(entry) = inner.entries.remove(&id) else {
                return;
            };
            if let Some(sid) = entry.session_id {
                inner.sessions.remove_interaction(sid, id);
            }
            entry
        };

        let session_id = entry.session_id;
        let _ = entry.completion.complete(Err(BrokerError::Timeout(id)));
        self.emit(StoreEvent::TimedOut { id, session_id });
    }

    /// Remove every interaction for `session_id`, rejecting each with
    /// [`BrokerError::SessionEvicted`], and drop the session entry.
    pub fn evict_session(&self, session_id: SessionId) {
        let entries = {
            let mut inner = self.lock_mut();
            inner.take_session(session_id)
        };
        self.finish_session_eviction(session_id, entries);
    }

    fn finish_session_eviction(&self, session_id: SessionId, entries: Vec<(InteractionId, Entry)>) {
        if entries.is_empty() {
            return;
        }
        let ids: Vec<InteractionId> = entries.iter().map(|(id, _)| *id).collect();
        for (id, entry) in entries {
            entry.timer.abort();
            let _ = entry
                .completion
                .complete(Err(BrokerError::SessionEvicted(session_id, id)));
        }
        self.emit(StoreEvent::SessionEvicted {
            session_id,
            interaction_ids: ids,
        });
    }

    /// Sweep sessions whose TTL has elapsed, evicting each. Intended to be
    /// called by `broker-gateway`'s background sweeper task on a fixed
    /// cadence (spec §4.2 default 5 minutes).
    pub fn sweep_expired_sessions(&self, now: DateTime<Utc>) {
        let ttl = chrono::Duration::from_std(self.0.config.session_ttl)
            .unwrap_or_else(|_| chrono::Duration::zero());
        let expired = { self.lock_ref().sessions.expired(ttl, now) };
        for session_id in expired {
            self.evict_session(session_id);
        }
    }

    /// Reject every currently pending interaction with `SHUTDOWN` and drain
    /// the table. Spec §5: "Shutdown broadcasts reject(...,\"SHUTDOWN\") to
    /// every pending interaction and then drains."
    pub fn shutdown(&self) {
        let ids: Vec<InteractionId> = { self.lock_ref().entries.keys().copied().collect() };
        for id in ids {
            let _ = self.reject(id, RejectReason::Shutdown);
        }
    }

    /// Read-only snapshot of pending interactions across the given
    /// sessions, optionally filtered by kind. Never mutates.
    #[must_use]
    pub fn get_for_sessions(
        &self,
        session_ids: &[SessionId],
        kind_filter: Option<InteractionKind>,
    ) -> Vec<InteractionSnapshot> {
        let inner = self.lock_ref();
        inner
            .entries
            .iter()
            .filter(|(_, e)| e.session_id.is_some_and(|sid| session_ids.contains(&sid)))
            .filter(|(_, e)| kind_filter.is_none_or(|k| e.data.kind() == k))
            .map(|(id, e)| e.snapshot(*id))
            .collect()
    }

    /// Read-only snapshot of a single pending interaction, for callers that
    /// need to validate an inbound response against its request payload
    /// before resolving (spec §4.5 schema validation). Never mutates.
    #[must_use]
    pub fn get(&self, id: InteractionId) -> Option<InteractionSnapshot> {
        let inner = self.lock_ref();
        inner.entries.get(&id).map(|e| e.snapshot(id))
    }
}

impl fmt::Debug for InteractionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock_ref();
        f.debug_struct("InteractionStore")
            .field("pending_interactions", &inner.entries.len())
            .field("tracked_sessions", &inner.sessions.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AskUserPayload, PermissionDecision, PermissionResponse};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn data() -> InteractionData {
        InteractionData::AskUser(AskUserPayload { questions: vec![] })
    }

    fn metadata() -> InteractionMetadata {
        InteractionMetadata::new(crate::types::RiskLevel::Low, "test")
    }

    #[tokio::test]
    async fn create_then_resolve_yields_response() {
        let (store, _events) = InteractionStore::new(BrokerConfig::default());
        let user = UserId("alice".into());
        let session = SessionId::new();
        let (id, rx) = store
            .create(data(), Some(session), user.clone(), metadata())
            .unwrap();

        store
            .resolve(id, InteractionResponse::Permission(PermissionResponse::allow()), &user)
            .unwrap();

        let outcome = rx.wait().await.unwrap();
        assert!(matches!(
            outcome,
            Ok(InteractionResponse::Permission(PermissionResponse {
                decision: PermissionDecision::Allow,
                ..
            }))
        ));
    }

    #[tokio::test]
    async fn second_resolve_returns_not_found() {
        let (store, _events) = InteractionStore::new(BrokerConfig::default());
        let user = UserId("alice".into());
        let session = SessionId::new();
        let (id, _rx) = store
            .create(data(), Some(session), user.clone(), metadata())
            .unwrap();

        store
            .resolve(id, InteractionResponse::Permission(PermissionResponse::allow()), &user)
            .unwrap();
        let second = store.resolve(id, InteractionResponse::Permission(PermissionResponse::deny()), &user);
        assert!(matches!(second, Err(BrokerError::NotFound(_))));
    }

    #[tokio::test]
    async fn concurrent_resolve_exactly_one_winner() {
        let (store, _events) = InteractionStore::new(BrokerConfig::default());
        let user = UserId("alice".into());
        let session = SessionId::new();
        let (id, rx) = store
            .create(data(), Some(session), user.clone(), metadata())
            .unwrap();

        let wins = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let user = user.clone();
            let wins = wins.clone();
            handles.push(tokio::spawn(async move {
                if store
                    .resolve(id, InteractionResponse::Permission(PermissionResponse::allow()), &user)
                    .is_ok()
                {
                    wins.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(wins.load(Ordering::SeqCst), 1);
        assert!(rx.wait().await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn resolve_by_non_owner_is_unauthorized() {
        let (store, _events) = InteractionStore::new(BrokerConfig::default());
        let owner = UserId("alice".into());
        let session = SessionId::new();
        let (id, _rx) = store
            .create(data(), Some(session), owner, metadata())
            .unwrap();

        let mallory = UserId("mallory".into());
        let result = store.resolve(id, InteractionResponse::Permission(PermissionResponse::allow()), &mallory);
        assert!(matches!(result, Err(BrokerError::Unauthorized { .. })));
    }

    #[tokio::test]
    async fn quota_exceeded_when_session_full() {
        let mut config = BrokerConfig::default();
        config.max_interactions_per_session = 1;
        let (store, _events) = InteractionStore::new(config);
        let user = UserId("alice".into());
        let session = SessionId::new();

        store.create(data(), Some(session), user.clone(), metadata()).unwrap();
        let second = store.create(data(), Some(session), user, metadata());
        assert!(matches!(second, Err(BrokerError::QuotaExceeded(_))));
    }

    #[tokio::test]
    async fn session_eviction_rejects_pending_interactions() {
        let (store, _events) = InteractionStore::new(BrokerConfig::default());
        let user = UserId("alice".into());
        let session = SessionId::new();
        let (id, rx) = store
            .create(data(), Some(session), user, metadata())
            .unwrap();

        store.evict_session(session);

        let outcome = rx.wait().await.unwrap();
        assert!(matches!(outcome, Err(BrokerError::SessionEvicted(s, i)) if s == session && i == id));

        let second = store.resolve(
            id,
            InteractionResponse::Permission(PermissionResponse::allow()),
            &UserId("alice".into()),
        );
        assert!(matches!(second, Err(BrokerError::NotFound(_))));
    }

    #[tokio::test]
    async fn shutdown_rejects_every_pending_interaction() {
        let (store, _events) = InteractionStore::new(BrokerConfig::default());
        let user = UserId("alice".into());
        let session = SessionId::new();
        let (_id1, rx1) = store
            .create(data(), Some(session), user.clone(), metadata())
            .unwrap();
        let (_id2, rx2) = store.create(data(), None, user, metadata()).unwrap();

        store.shutdown();

        assert!(matches!(rx1.wait().await.unwrap(), Err(BrokerError::Shutdown)));
        assert!(matches!(rx2.wait().await.unwrap(), Err(BrokerError::Shutdown)));
    }
}
