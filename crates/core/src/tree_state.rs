//! One Merkle tree per stored range, and the work waiting on each.
//!
//! Filling a tree takes store scans, so anything that needs a node to be
//! up to date parks a [Resuming] on the tree and is dispatched once the
//! tree has been filled.

use crate::protocol::{FetchNodeReq, FetchNodeResp};
use bamboo_api::*;
use bamboo_dht::{FillHolesState, MerkleTree};
use std::collections::{BTreeMap, VecDeque};
use std::net::SocketAddr;

/// What to do once a tree is ready.
#[derive(Debug, Clone)]
pub(crate) enum Resuming {
    /// Ask the session peer for the current node.
    AeTreeReady { session: u64 },
    /// Compare the session peer's node with ours.
    AeNodeResp { session: u64, resp: FetchNodeResp },
    /// Move the session to its next queued node.
    AeNextNode { session: u64 },
    /// Answer a peer's node request.
    FetchNodeReq { peer: SocketAddr, req: FetchNodeReq },
}

#[derive(Debug)]
pub(crate) struct TreeState {
    pub tree: MerkleTree,
    waiting: Vec<Resuming>,
}

/// Trees keyed by the range they cover.
#[derive(Debug)]
pub(crate) struct TreeRegistry {
    expansion: u32,
    trees: BTreeMap<GuidRange, TreeState>,
    ready_q: VecDeque<GuidRange>,
}

impl TreeRegistry {
    pub fn new(expansion: u32) -> Self {
        Self {
            expansion,
            trees: BTreeMap::new(),
            ready_q: VecDeque::new(),
        }
    }

    pub fn expansion(&self) -> u32 {
        self.expansion
    }

    /// The tree for `range`, created empty on first use.
    pub fn tree_mut(&mut self, range: GuidRange) -> &mut MerkleTree {
        let expansion = self.expansion;
        &mut self
            .trees
            .entry(range)
            .or_insert_with(|| {
                tracing::debug!(%range, "new merkle tree");
                TreeState {
                    tree: MerkleTree::new(expansion),
                    waiting: Vec::new(),
                }
            })
            .tree
    }

    pub fn tree(&self, range: &GuidRange) -> Option<&MerkleTree> {
        self.trees.get(range).map(|t| &t.tree)
    }

    /// Park `resuming` until the tree for `range` is filled.
    pub fn wait_for_ready(&mut self, range: GuidRange, resuming: Resuming) {
        self.tree_mut(range);
        let Some(ts) = self.trees.get_mut(&range) else {
            return;
        };
        if ts.waiting.is_empty() {
            self.ready_q.push_back(range);
        }
        ts.waiting.push(resuming);
    }

    /// The next range with parked work.
    pub fn next_pending(&mut self) -> Option<GuidRange> {
        while let Some(range) = self.ready_q.pop_front() {
            if self.trees.get(&range).is_some_and(|t| !t.waiting.is_empty())
            {
                return Some(range);
            }
        }
        None
    }

    pub fn take_waiters(&mut self, range: &GuidRange) -> Vec<Resuming> {
        self.trees
            .get_mut(range)
            .map(|t| std::mem::take(&mut t.waiting))
            .unwrap_or_default()
    }

    /// Bring every hash of the tree for `range` up to date.
    pub async fn fill(
        &mut self,
        range: GuidRange,
        store: &dyn Store,
    ) -> BambooResult<()> {
        let Some(ts) = self.trees.get_mut(&range) else {
            return Ok(());
        };
        let (level, low) = ts.tree.root_addr();
        ts.tree.root();
        let mut scan: Option<FillHolesState> = None;
        loop {
            let now = Timestamp::now();
            let Some(mut req) = ts.tree.fill_holes(level, low, scan.as_ref(), now)
            else {
                return Ok(());
            };
            let keys = store
                .scan_by_time(
                    req.range_low,
                    req.range_high,
                    range,
                    req.scan_limit(),
                    now,
                )
                .await?;
            req.resolve(&keys);
            tracing::trace!(%range, %req, "scanned");
            scan = Some(req);
        }
    }

    /// A tuple at `(guid, time_usec)` changed: clear the affected path of
    /// every tree covering `guid`.
    pub fn invalidate(&mut self, guid: &Guid, time_usec: i64) {
        for (range, ts) in self.trees.iter_mut() {
            if range.contains(guid) {
                ts.tree.invalidate_path(time_usec);
            }
        }
    }

    /// Drop trees for ranges no longer stored, with their parked work.
    pub fn retain(&mut self, keep: &std::collections::BTreeSet<GuidRange>) {
        self.trees.retain(|range, ts| {
            let k = keep.contains(range);
            if !k {
                tracing::debug!(
                    %range,
                    waiting = ts.waiting.len(),
                    "dropping merkle tree"
                );
            }
            k
        });
    }

    pub fn clear(&mut self) {
        self.trees.clear();
        self.ready_q.clear();
    }

    pub fn len(&self) -> usize {
        self.trees.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::MemStore;
    use bytes::Bytes;

    fn key(guid: u64, time_usec: i64) -> Key {
        Key {
            time_usec,
            ttl_sec: 3600,
            guid: Guid::from_high_u64(guid),
            secret_hash: ZERO_HASH,
            data_hash: bamboo_dht::sha1(&guid.to_be_bytes()),
            is_put: true,
            client_id: [127, 0, 0, 1].into(),
        }
    }

    async fn filled_root(
        reg: &mut TreeRegistry,
        range: GuidRange,
        store: &MemStore,
    ) -> Hash {
        reg.fill(range, store).await.unwrap();
        let tree = reg.tree(&range).unwrap();
        let (level, low) = tree.root_addr();
        *tree.node(level, low).unwrap().hash().unwrap()
    }

    #[tokio::test]
    async fn fill_tracks_store_changes() {
        let store = MemStore::new();
        let t = Timestamp::now().as_micros() - 1_000_000;
        // enough to split at expansion 1
        for i in 0..5 {
            store.put(key(i, t + i as i64), Bytes::new()).await.unwrap();
        }

        let range = GuidRange::FULL;
        let mut a = TreeRegistry::new(1);
        a.tree_mut(range);
        let before = filled_root(&mut a, range, &store).await;

        let k = key(9, t + 9);
        store.put(k, Bytes::new()).await.unwrap();
        // nothing invalidated, the stale hash stays
        assert_eq!(before, filled_root(&mut a, range, &store).await);

        a.invalidate(&k.guid, k.time_usec);
        let after = filled_root(&mut a, range, &store).await;
        assert_ne!(before, after);

        // an independent tree over the same keys agrees
        let mut b = TreeRegistry::new(1);
        b.tree_mut(range);
        assert_eq!(after, filled_root(&mut b, range, &store).await);
    }

    #[test]
    fn waiters_queue_once_per_range() {
        let mut reg = TreeRegistry::new(5);
        let r1 = GuidRange::new(Guid::from_high_u64(1), Guid::from_high_u64(2));
        let r2 = GuidRange::new(Guid::from_high_u64(3), Guid::from_high_u64(4));
        reg.wait_for_ready(r1, Resuming::AeTreeReady { session: 1 });
        reg.wait_for_ready(r1, Resuming::AeNextNode { session: 1 });
        reg.wait_for_ready(r2, Resuming::AeTreeReady { session: 2 });
        assert_eq!(2, reg.len());

        assert_eq!(Some(r1), reg.next_pending());
        assert_eq!(2, reg.take_waiters(&r1).len());
        assert_eq!(Some(r2), reg.next_pending());

        // dropped trees take their waiters with them
        reg.retain(&Default::default());
        assert_eq!(None, reg.next_pending());
        assert!(reg.take_waiters(&r2).is_empty());
    }
}
