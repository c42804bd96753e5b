//! Session → interaction-set reverse index, per spec §4.2.
//!
//! This type holds no lock of its own — it is co-owned with
//! [`crate::store::InteractionStore`]'s primary map under a single lock, so
//! that the two structures can never diverge (spec §3 "Ownership",
//! §5 "Shared state and discipline"). The bounded-LRU-over-unbounded-map
//! shape mirrors `astrid-approval`'s `AllowanceStore::cleanup_expired`
//! retain-based sweep, generalized with an explicit recency queue for the
//! capacity-triggered dispose path.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Duration, Utc};

use crate::types::{InteractionId, SessionId, UserId};

/// Per-session bookkeeping.
#[derive(Debug, Clone)]
pub struct SessionEntry {
    /// The user that owns this session for its entire lifetime.
    pub owner: UserId,
    /// Last time any operation touched this session.
    pub last_activity: DateTime<Utc>,
    /// Interactions currently pending for this session.
    pub interactions: HashSet<InteractionId>,
}

/// The reverse index itself: session id -> entry, plus a recency queue for
/// bounded-capacity LRU disposal.
#[derive(Debug)]
pub struct SessionIndex {
    sessions: HashMap<SessionId, SessionEntry>,
    /// Recency queue, oldest-touched at the front. May contain stale
    /// entries for sessions already removed; these are skipped lazily on
    /// pop, the same trick a plain `VecDeque`-backed LRU always needs
    /// without pulling in an external linked-hashmap crate.
    recency: VecDeque<SessionId>,
    capacity: usize,
}

/// Outcome of touching the index with a new or existing session.
pub struct Touch {
    /// A session disposed by capacity overflow, if any. The caller must
    /// evict every interaction belonging to this session.
    pub disposed: Option<SessionId>,
}

impl SessionIndex {
    /// Build an index bounded at `capacity` sessions (spec §6
    /// `MAX_SESSIONS`).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            sessions: HashMap::new(),
            recency: VecDeque::new(),
            capacity,
        }
    }

    /// Number of tracked sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether the index tracks no sessions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Look up a session's owner and activity.
    #[must_use]
    pub fn get(&self, session_id: SessionId) -> Option<&SessionEntry> {
        self.sessions.get(&session_id)
    }

    /// Interaction ids currently pending for a session, or an empty slice
    /// if the session is not tracked.
    #[must_use]
    pub fn interactions_of(&self, session_id: SessionId) -> Option<&HashSet<InteractionId>> {
        self.sessions.get(&session_id).map(|e| &e.interactions)
    }

    /// Register activity for a session, creating its entry if this is the
    /// first time it is seen. Returns the session disposed by capacity
    /// overflow, if the new session pushed the index past `capacity`.
    ///
    /// The owner passed on first touch is permanently fixed — spec §3:
    /// "session→user is total and immutable for a session's lifetime".
    pub fn touch(&mut self, session_id: SessionId, owner: &UserId, now: DateTime<Utc>) -> Touch {
        let is_new = !self.sessions.contains_key(&session_id);

        let entry = self.sessions.entry(session_id).or_insert_with(|| SessionEntry {
            owner: owner.clone(),
            last_activity: now,
            interactions: HashSet::new(),
        });
        entry.last_activity = now;
        self.recency.push_back(session_id);

        let disposed = if is_new && self.sessions.len() > self.capacity {
            self.dispose_lru(session_id)
        } else {
            None
        };

        Touch { disposed }
    }

    /// Evict the least recently touched session other than `protect`.
    fn dispose_lru(&mut self, protect: SessionId) -> Option<SessionId> {
        while let Some(candidate) = self.recency.pop_front() {
            if candidate == protect || !self.sessions.contains_key(&candidate) {
                continue;
            }
            self.sessions.remove(&candidate);
            return Some(candidate);
        }
        None
    }

    /// Add an interaction id to a session's pending set. The session must
    /// already be tracked (caller calls `touch` first).
    pub fn insert_interaction(&mut self, session_id: SessionId, interaction_id: InteractionId) {
        if let Some(entry) = self.sessions.get_mut(&session_id) {
            entry.interactions.insert(interaction_id);
        }
    }

    /// Remove an interaction id from a session's pending set.
    pub fn remove_interaction(&mut self, session_id: SessionId, interaction_id: InteractionId) {
        if let Some(entry) = self.sessions.get_mut(&session_id) {
            entry.interactions.remove(&interaction_id);
        }
    }

    /// Count of pending interactions for a session (0 if untracked).
    #[must_use]
    pub fn pending_count(&self, session_id: SessionId) -> usize {
        self.sessions
            .get(&session_id)
            .map_or(0, |e| e.interactions.len())
    }

    /// Remove a session outright, returning its pending interaction ids so
    /// the caller can reject each one. Used by both explicit eviction and
    /// the TTL sweeper.
    pub fn remove(&mut self, session_id: SessionId) -> Option<HashSet<InteractionId>> {
        self.sessions.remove(&session_id).map(|e| e.interactions)
    }

    /// Sessions whose TTL has elapsed as of `now`, regardless of whether
    /// they still hold pending interactions (spec §4.2: "sessions whose TTL
    /// elapsed regardless of emptiness").
    #[must_use]
    pub fn expired(&self, ttl: Duration, now: DateTime<Utc>) -> Vec<SessionId> {
        self.sessions
            .iter()
            .filter_map(|(id, entry)| {
                if entry.last_activity + ttl < now {
                    Some(*id)
                } else {
                    None
                }
            })
            .collect()
    }
}
