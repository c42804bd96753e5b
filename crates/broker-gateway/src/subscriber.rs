//! Per-connection subscriber state, per spec §3 "Subscriber" and §4.4.
//!
//! The bounded-queue-plus-LRU shape mirrors `astrid-approval`'s
//! `AllowanceStore` (bounded collections guarded by retain/eviction rather
//! than letting anything grow unboundedly), generalized here to per-
//! connection outbound messages and seen-nonces instead of allowances.

use std::collections::{HashSet, VecDeque};

use broker_core::types::{ClientId, InteractionId, SessionId, UserId};
use chrono::{DateTime, Duration, Utc};

use crate::protocol::OutboundEnvelope;

/// Bounded least-recently-seen nonce set, guarding against response
/// replay (spec §4.4 "Seen-nonce set").
#[derive(Debug)]
struct NonceCache {
    seen: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl NonceCache {
    fn new(capacity: usize) -> Self {
        Self {
            seen: HashSet::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    /// Record `nonce` if it hasn't been seen before. Returns `false` if it
    /// was already present (a replay).
    fn record(&mut self, nonce: &str) -> bool {
        if !self.seen.insert(nonce.to_string()) {
            return false;
        }
        self.order.push_back(nonce.to_string());
        if self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }

    fn len(&self) -> usize {
        self.seen.len()
    }
}

/// Bounded FIFO outbound queue with drop-oldest overflow policy (spec
/// §4.4 "Queueing").
#[derive(Debug)]
struct OutboundQueue {
    items: VecDeque<OutboundEnvelope>,
    capacity: usize,
}

impl OutboundQueue {
    fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::new(),
            capacity,
        }
    }

    fn push(&mut self, envelope: OutboundEnvelope) {
        if self.items.len() >= self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(envelope);
    }

    fn drain(&mut self) -> Vec<OutboundEnvelope> {
        self.items.drain(..).collect()
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

/// A single connected subscriber's bookkeeping. Owned by
/// [`crate::registry::SubscriberRegistry`] behind its internal lock.
#[derive(Debug)]
pub struct Subscriber {
    /// Unique id assigned at accept time.
    pub client_id: ClientId,
    /// The authenticated user this connection belongs to.
    pub user_id: UserId,
    authorized_sessions: HashSet<SessionId>,
    queue: OutboundQueue,
    nonces: NonceCache,
    subscribe_attempts: VecDeque<DateTime<Utc>>,
    max_subscriptions: usize,
    subscribe_rate_per_minute: u32,
    /// Liveness flag flipped by the heartbeat loop.
    pub is_alive: bool,
    /// Last time this subscriber acknowledged a heartbeat or sent a
    /// message.
    pub last_seen: DateTime<Utc>,
    /// Interactions this subscriber has been told about but that have not
    /// yet reached a terminal state from its point of view.
    pending_deliveries: HashSet<InteractionId>,
}

impl Subscriber {
    /// Construct a subscriber with empty authorization and state.
    #[must_use]
    pub fn new(
        client_id: ClientId,
        user_id: UserId,
        max_queue: usize,
        nonce_cache_capacity: usize,
        max_subscriptions: usize,
        subscribe_rate_per_minute: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            client_id,
            user_id,
            authorized_sessions: HashSet::new(),
            queue: OutboundQueue::new(max_queue),
            nonces: NonceCache::new(nonce_cache_capacity),
            subscribe_attempts: VecDeque::new(),
            max_subscriptions,
            subscribe_rate_per_minute,
            is_alive: true,
            last_seen: now,
            pending_deliveries: HashSet::new(),
        }
    }

    /// Whether `session_id` is in this subscriber's authorized set.
    #[must_use]
    pub fn is_authorized(&self, session_id: SessionId) -> bool {
        self.authorized_sessions.contains(&session_id)
    }

    /// The authorized-session set, read-only.
    #[must_use]
    pub fn authorized_sessions(&self) -> &HashSet<SessionId> {
        &self.authorized_sessions
    }

    /// Record a subscribe/sync attempt for rate-limiting purposes, pruning
    /// attempts older than one minute. Returns `false` if this attempt
    /// would exceed `subscribe_rate_per_minute`.
    pub fn record_subscribe_attempt(&mut self, now: DateTime<Utc>) -> bool {
        let window_start = now - Duration::minutes(1);
        while matches!(self.subscribe_attempts.front(), Some(t) if *t < window_start) {
            self.subscribe_attempts.pop_front();
        }
        if self.subscribe_attempts.len() as u32 >= self.subscribe_rate_per_minute {
            return false;
        }
        self.subscribe_attempts.push_back(now);
        true
    }

    /// Add `session_id` to the authorized set. Caller must have already
    /// verified ownership. Returns `false` if this would exceed
    /// `max_subscriptions_per_subscriber` (spec §4.4 rate limits) — the
    /// session is not added in that case.
    pub fn authorize(&mut self, session_id: SessionId) -> bool {
        if self.authorized_sessions.contains(&session_id) {
            return true;
        }
        if self.authorized_sessions.len() >= self.max_subscriptions {
            return false;
        }
        self.authorized_sessions.insert(session_id);
        true
    }

    /// Remove `session_id` from the authorized set (e.g. ownership no
    /// longer verifies on a later subscribe attempt).
    pub fn revoke(&mut self, session_id: SessionId) {
        self.authorized_sessions.remove(&session_id);
    }

    /// Enqueue an outbound envelope, dropping the oldest queued one if the
    /// subscriber's queue is already full.
    pub fn enqueue(&mut self, envelope: OutboundEnvelope) {
        self.queue.push(envelope);
    }

    /// Drain the outbound queue in FIFO order for the connection task to
    /// send. The caller is responsible for stopping at the first send
    /// error, per spec §4.4.
    pub fn flush_queue(&mut self) -> Vec<OutboundEnvelope> {
        self.queue.drain()
    }

    /// Current outbound queue depth.
    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Record that this subscriber was told about `interaction_id`.
    pub fn mark_pending(&mut self, interaction_id: InteractionId) {
        self.pending_deliveries.insert(interaction_id);
    }

    /// Clear a delivery once its interaction reaches a terminal state.
    pub fn clear_pending(&mut self, interaction_id: InteractionId) {
        self.pending_deliveries.remove(&interaction_id);
    }

    /// Interactions this subscriber still considers outstanding.
    #[must_use]
    pub fn pending_deliveries(&self) -> &HashSet<InteractionId> {
        &self.pending_deliveries
    }

    /// Validate and record an inbound response nonce. Returns `false` if
    /// this nonce was already seen (replay).
    pub fn record_nonce(&mut self, nonce: &str) -> bool {
        self.nonces.record(nonce)
    }

    /// Current nonce cache size, for the §8 boundary invariant.
    #[must_use]
    pub fn nonce_cache_len(&self) -> usize {
        self.nonces.len()
    }
}
