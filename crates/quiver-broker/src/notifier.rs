//! Wakeup registry for tailing subscribers.
//!
//! A fetcher that has caught up to the committed tail of a fragment
//! registers here instead of polling the store. Publishers call
//! [`Notifier::notify`] after every committed batch, which drains every
//! waiter whose last-seen offset is behind the new tail. Registration and
//! notification on the same key are serialized by the shard lock, and
//! registration compares against the key's high-water mark, so a waiter
//! that races a concurrent commit fires immediately instead of being lost.

use dashmap::DashMap;
use tokio::sync::oneshot;

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct FragmentKey {
    pub topic: String,
    pub fragment: u32,
}

impl FragmentKey {
    pub fn new(topic: impl Into<String>, fragment: u32) -> Self {
        Self {
            topic: topic.into(),
            fragment,
        }
    }
}

#[derive(Debug)]
struct Waiter {
    session_id: u64,
    last_seen: u64,
    wakeup: oneshot::Sender<u64>,
}

#[derive(Debug, Default)]
struct Shard {
    // Highest offset this key has been notified about.
    last_seq: u64,
    waiters: Vec<Waiter>,
}

/// One-shot wakeup registry keyed by (topic, fragment).
#[derive(Debug, Default)]
pub struct Notifier {
    shards: DashMap<FragmentKey, Shard>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter that has seen everything up to `last_seen`.
    /// The returned receiver resolves with the new last offset after the
    /// next relevant commit, or errors if the waiter is cancelled.
    pub fn register(
        &self,
        session_id: u64,
        topic: &str,
        fragment: u32,
        last_seen: u64,
    ) -> oneshot::Receiver<u64> {
        let (wakeup, receiver) = oneshot::channel();
        let key = FragmentKey::new(topic, fragment);
        let mut shard = self.shards.entry(key).or_default();
        if shard.last_seq > last_seen {
            // A commit already passed this waiter; fire without parking it.
            let _ = wakeup.send(shard.last_seq);
        } else {
            shard.waiters.push(Waiter {
                session_id,
                last_seen,
                wakeup,
            });
        }
        receiver
    }

    /// Wake every waiter behind `new_last_seq`, exactly once each.
    pub fn notify(&self, topic: &str, fragment: u32, new_last_seq: u64) {
        let key = FragmentKey::new(topic, fragment);
        let fired: Vec<Waiter> = {
            let mut shard = self.shards.entry(key).or_default();
            shard.last_seq = shard.last_seq.max(new_last_seq);
            let (fired, parked) = shard
                .waiters
                .drain(..)
                .partition(|waiter| waiter.last_seen < new_last_seq);
            shard.waiters = parked;
            fired
        };
        if !fired.is_empty() {
            metrics::counter!("quiver_notifier_wakeups_total").increment(fired.len() as u64);
        }
        for waiter in fired {
            // The receiver may already be gone if the session died.
            let _ = waiter.wakeup.send(new_last_seq);
        }
    }

    /// Drop every waiter owned by a terminated session. Their receivers
    /// resolve with a cancellation error.
    pub fn cancel_session(&self, session_id: u64) {
        for mut shard in self.shards.iter_mut() {
            shard
                .waiters
                .retain(|waiter| waiter.session_id != session_id);
        }
        self.shards.retain(|_, shard| {
            !shard.waiters.is_empty() || shard.last_seq > 0
        });
    }

    #[cfg(test)]
    fn waiter_count(&self) -> usize {
        self.shards.iter().map(|shard| shard.waiters.len()).sum()
    }
}
