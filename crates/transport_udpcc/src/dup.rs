//! Duplicate suppression.

use lru::LruCache;
use std::net::SocketAddr;
use std::num::NonZeroUsize;

/// How many `(peer, msg_id)` pairs are remembered.
pub(crate) const RECENTLY_SEEN_CAP: usize = 1000;

/// Bounded memory of recently delivered messages.
///
/// A message retransmitted because its ack was lost arrives again with the
/// same message id; it is acked again but not delivered twice.
pub(crate) struct RecentlySeen {
    seen: LruCache<(SocketAddr, i64), ()>,
    received: u64,
    duplicates: u64,
}

impl std::fmt::Debug for RecentlySeen {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecentlySeen")
            .field("len", &self.seen.len())
            .field("received", &self.received)
            .field("duplicates", &self.duplicates)
            .finish()
    }
}

impl Default for RecentlySeen {
    fn default() -> Self {
        Self::with_capacity(RECENTLY_SEEN_CAP)
    }
}

impl RecentlySeen {
    pub fn with_capacity(cap: usize) -> Self {
        Self {
            seen: LruCache::new(NonZeroUsize::new(cap).unwrap_or(NonZeroUsize::MIN)),
            received: 0,
            duplicates: 0,
        }
    }

    /// Record a received message, returning true if it was already seen.
    pub fn check(&mut self, peer: SocketAddr, msg_id: i64) -> bool {
        self.received += 1;
        let key = (peer, msg_id);
        // get refreshes recency
        if self.seen.get(&key).is_some() {
            self.duplicates += 1;
            true
        } else {
            self.seen.put(key, ());
            false
        }
    }

    /// Counters since the last call, as `(received, duplicates)`.
    pub fn take_counts(&mut self) -> (u64, u64) {
        let out = (self.received, self.duplicates);
        self.received = 0;
        self.duplicates = 0;
        out
    }
}
