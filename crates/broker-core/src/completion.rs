//! A single-resolution completion channel.
//!
//! `InteractionStore::resolve`/`reject`/`timeout_fire` must each be able to
//! unblock the agent's waiting future exactly once, from whichever code path
//! gets there first, with no double-fire and no silent drop. `tokio::sync::
//! oneshot` already gives move-only, single-consumer send semantics; this
//! module just names the pair the way the rest of the crate uses it, the
//! same way `discord_proxy::heartbeat` names its `zombie_tx: oneshot::
//! Sender<()>` rather than inlining the channel type at every call site.

use tokio::sync::oneshot;

use crate::error::BrokerError;

/// The producing half of a completion channel. Consumed on first use —
/// a second attempt to complete the same interaction physically cannot
/// happen because the sender no longer exists after `complete` is called.
#[derive(Debug)]
pub struct CompletionSender<T> {
    inner: oneshot::Sender<T>,
}

impl<T> CompletionSender<T> {
    /// Deliver the outcome. Returns `false` if the waiting receiver was
    /// already dropped (the agent's future was cancelled).
    pub fn complete(self, value: T) -> bool {
        self.inner.send(value).is_ok()
    }
}

/// The consuming half of a completion channel.
#[derive(Debug)]
pub struct CompletionReceiver<T> {
    inner: oneshot::Receiver<T>,
}

impl<T> CompletionReceiver<T> {
    /// Await the outcome. Resolves to [`BrokerError::Cancelled`]'s caller
    /// should map a closed channel (the sender was dropped without calling
    /// `complete`, e.g. the store entry was removed some other way) to
    /// their own notion of cancellation; this primitive itself carries no
    /// interaction id, so it returns a bare internal error in that case.
    pub async fn wait(self) -> Result<T, BrokerError> {
        self.inner
            .await
            .map_err(|_| BrokerError::Internal("completion sender dropped without a value".into()))
    }
}

/// Build a fresh, unarmed completion pair.
pub fn channel<T>() -> (CompletionSender<T>, CompletionReceiver<T>) {
    let (tx, rx) = oneshot::channel();
    (CompletionSender { inner: tx }, CompletionReceiver { inner: rx })
}
