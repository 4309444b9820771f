//! Which shared ranges have recently been reconciled with which peers.

use bamboo_api::*;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::Instant;

/// Ranges mapped to the peers they were last synced with, each with the
/// time that sync stops counting.
#[derive(Debug, Default)]
pub(crate) struct SyncedTable {
    ranges: BTreeMap<GuidRange, HashMap<SocketAddr, Instant>>,
}

impl SyncedTable {
    /// Record a completed anti-entropy round.
    pub fn synced(
        &mut self,
        range: GuidRange,
        peer: SocketAddr,
        now: Instant,
        timeout: Duration,
    ) {
        let peers = self.ranges.entry(range).or_default();
        let again = peers.insert(peer, now + timeout).is_some();
        tracing::debug!(
            %peer,
            %range,
            secs = timeout.as_secs(),
            "{}synced",
            if again { "re" } else { "" }
        );
    }

    /// Forget that `range` is synced with `peer`.
    pub fn unsynced(&mut self, range: GuidRange, peer: SocketAddr) {
        let Some(peers) = self.ranges.get_mut(&range) else {
            tracing::debug!(%peer, %range, "still unsynced");
            return;
        };
        tracing::debug!(%peer, %range, "unsynced");
        peers.remove(&peer);
        if peers.is_empty() {
            self.ranges.remove(&range);
        }
    }

    /// Drop entries whose timeout has passed.
    pub fn expire(&mut self, now: Instant) {
        self.ranges.retain(|range, peers| {
            peers.retain(|peer, until| {
                let keep = *until > now;
                if !keep {
                    tracing::debug!(%peer, %range, "sync timed out");
                }
                keep
            });
            !peers.is_empty()
        });
    }

    /// Drop ranges that are no longer stored.
    pub fn retain_ranges(&mut self, keep: &BTreeSet<GuidRange>) {
        self.ranges.retain(|range, _| {
            let k = keep.contains(range);
            if !k {
                tracing::debug!(%range, "no longer responsible");
            }
            k
        });
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
    }

    fn covering(&self, guid: &Guid) -> Option<&HashMap<SocketAddr, Instant>> {
        self.ranges
            .iter()
            .find(|(range, _)| range.contains(guid))
            .map(|(_, peers)| peers)
    }

    /// Is the range covering `guid` synced with `peer`?
    pub fn synced_with(
        &self,
        guid: &Guid,
        peer: &SocketAddr,
        now: Instant,
    ) -> bool {
        self.covering(guid)
            .and_then(|peers| peers.get(peer))
            .map(|until| *until > now)
            .unwrap_or(false)
    }

    /// How many peers the range covering `guid` is synced with.
    pub fn synced_count(&self, guid: &Guid, now: Instant) -> usize {
        self.covering(guid)
            .map(|peers| peers.values().filter(|until| **until > now).count())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        ([127, 0, 0, 1], port).into()
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire() {
        let range = GuidRange::new(Guid::from_high_u64(10), Guid::from_high_u64(20));
        let inside = Guid::from_high_u64(15);
        let mut t = SyncedTable::default();
        let now = Instant::now();
        t.synced(range, addr(1), now, Duration::from_secs(10));
        t.synced(range, addr(2), now, Duration::from_secs(20));
        assert!(t.synced_with(&inside, &addr(1), now));
        assert!(!t.synced_with(&Guid::from_high_u64(25), &addr(1), now));
        assert_eq!(2, t.synced_count(&inside, now));

        let later = now + Duration::from_secs(15);
        assert!(!t.synced_with(&inside, &addr(1), later));
        assert_eq!(1, t.synced_count(&inside, later));
        t.expire(later);
        assert_eq!(1, t.ranges[&range].len());

        t.unsynced(range, addr(2));
        assert!(t.ranges.is_empty());
        // unknown range is a no-op
        t.unsynced(range, addr(2));
    }

    #[tokio::test(start_paused = true)]
    async fn wrapping_range_covers_zero() {
        let range = GuidRange::new(Guid::from_high_u64(90), Guid::from_high_u64(10));
        let mut t = SyncedTable::default();
        let now = Instant::now();
        t.synced(range, addr(1), now, Duration::from_secs(10));
        assert!(t.synced_with(&Guid::MIN, &addr(1), now));
        t.retain_ranges(&BTreeSet::new());
        assert!(!t.synced_with(&Guid::MIN, &addr(1), now));
    }
}
