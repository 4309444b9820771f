//! Everything a node derives from its leaf set.
//!
//! The ring around a node is cut into ranges, one per gap between
//! consecutive members of `preds`, the node itself and `succs`. Number
//! the members `-len..=len`, with `0` the node, `-1` its immediate
//! predecessor and `1` its immediate successor. Range `i` is then
//! `[member(i), member(i + 1) - 1]`, and the node stores every range in
//! `-len..len`. Two members share the ranges both of them store.
//!
//! When a predecessor is also the furthest successor the leaf set wraps
//! the whole ring, and there is a single shared range covering it.

use bamboo_api::*;
use rand::Rng;
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::time::Duration;

/// An immutable view of a node's leaf set and the ranges derived from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Neighbourhood {
    me: NeighborInfo,
    preds: Vec<NeighborInfo>,
    succs: Vec<NeighborInfo>,
    covers_all: bool,
    resp: GuidRange,
    db_ranges: BTreeSet<GuidRange>,
}

impl Neighbourhood {
    /// A node with no neighbours. It is responsible for the whole ring
    /// and shares nothing.
    pub fn alone(me: NeighborInfo) -> Self {
        Self {
            me,
            preds: Vec::new(),
            succs: Vec::new(),
            covers_all: true,
            resp: GuidRange::FULL,
            db_ranges: BTreeSet::new(),
        }
    }

    /// Derive the neighbourhood from a leaf set, keeping the nearest
    /// `per_side` members on each side.
    pub fn new(me: NeighborInfo, leaf_set: &LeafSet, per_side: usize) -> Self {
        let len = leaf_set
            .preds
            .len()
            .min(leaf_set.succs.len())
            .min(per_side);
        if len == 0 {
            return Self::alone(me);
        }
        let ls = leaf_set.trimmed(len);
        let furthest_succ = ls.succs[len - 1];
        let covers_all = ls.preds.iter().any(|p| *p == furthest_succ);

        let mut out = Self {
            me,
            preds: ls.preds,
            succs: ls.succs,
            covers_all,
            resp: GuidRange::FULL,
            db_ranges: BTreeSet::new(),
        };
        if covers_all {
            out.db_ranges.insert(GuidRange::FULL);
        } else {
            out.resp = GuidRange::new(
                out.preds[len - 1].guid,
                furthest_succ.guid.wrapping_sub_one(),
            );
            let l = len as isize;
            out.db_ranges = (-l..l).map(|i| out.range(i)).collect();
        }
        tracing::debug!(resp = %out.resp, ranges = out.db_ranges.len(), "leaf set derived");
        out
    }

    /// This node.
    pub fn me(&self) -> &NeighborInfo {
        &self.me
    }

    /// Predecessors in use, nearest first.
    pub fn preds(&self) -> &[NeighborInfo] {
        &self.preds
    }

    /// Successors in use, nearest first.
    pub fn succs(&self) -> &[NeighborInfo] {
        &self.succs
    }

    /// True when this node has no neighbours.
    pub fn is_alone(&self) -> bool {
        self.preds.is_empty()
    }

    /// True when the leaf set wraps the whole ring.
    pub fn covers_all(&self) -> bool {
        self.covers_all
    }

    /// The range this node is responsible for.
    pub fn responsibility(&self) -> GuidRange {
        self.resp
    }

    /// Every range this node stores. Empty when alone.
    pub fn db_ranges(&self) -> &BTreeSet<GuidRange> {
        &self.db_ranges
    }

    fn member(&self, i: isize) -> &NeighborInfo {
        match i {
            0 => &self.me,
            i if i < 0 => &self.preds[(-i - 1) as usize],
            i => &self.succs[(i - 1) as usize],
        }
    }

    fn range(&self, i: isize) -> GuidRange {
        GuidRange::new(
            self.member(i).guid,
            self.member(i + 1).guid.wrapping_sub_one(),
        )
    }

    /// Is `guid` within this node's responsibility, on either side of it?
    pub fn in_leaf_set_range(&self, guid: &Guid) -> bool {
        Guid::in_range_mod(&self.resp.low, &self.me.guid, guid)
            || Guid::in_range_mod(&self.me.guid, &self.resp.high, guid)
    }

    /// The replicas a put or remove for `guid` is forwarded to when this
    /// node is its root.
    ///
    /// Every neighbour is a replica, except that the furthest member on a
    /// side is left out when `guid` does not lie between this node and its
    /// immediate neighbour on that side.
    pub fn forward_set(&self, guid: &Guid) -> Vec<NeighborInfo> {
        if self.is_alone() {
            return Vec::new();
        }
        let mut pred_count = self.preds.len();
        if !Guid::in_range_mod(&self.preds[0].guid, &self.me.guid, guid) {
            pred_count -= 1;
        }
        let mut succ_count = self.succs.len();
        if !Guid::in_range_mod(&self.me.guid, &self.succs[0].guid, guid) {
            succ_count -= 1;
        }
        let mut out: Vec<NeighborInfo> = Vec::with_capacity(pred_count + succ_count);
        for n in self.preds[..pred_count]
            .iter()
            .rev()
            .chain(self.succs[..succ_count].iter())
        {
            if !out.iter().any(|o| o.addr == n.addr) {
                out.push(*n);
            }
        }
        out
    }

    /// Where this node, as root of `guid`, says the replicas of `guid`
    /// live. This node is always included.
    pub fn replica_set_for(&self, guid: &Guid) -> Vec<SocketAddr> {
        if self.is_alone() {
            return vec![self.me.addr];
        }
        let unique_count = self
            .preds
            .iter()
            .chain(self.succs.iter())
            .map(|n| n.addr)
            .collect::<BTreeSet<_>>()
            .len();

        let (result_len, pred_max) =
            if unique_count == self.preds.len() + self.succs.len() {
                // full leaf set: drop one member on the far side of guid
                let mut pred_max = self.preds.len() as isize - 1;
                if !Guid::in_range_mod(&self.preds[0].guid, &self.me.guid, guid)
                {
                    pred_max -= 1;
                }
                (unique_count, pred_max)
            } else {
                // only the unique members, half on each side
                (unique_count + 1, ((unique_count - 1) / 2) as isize)
            };

        let mut out = Vec::with_capacity(result_len);
        let mut i = pred_max;
        while i >= 0 {
            out.push(self.preds[i as usize].addr);
            i -= 1;
        }
        out.push(self.me.addr);
        for s in &self.succs {
            if out.len() >= result_len {
                break;
            }
            out.push(s.addr);
        }
        out
    }

    /// A random neighbour to run anti-entropy with: any predecessor, or a
    /// successor closer than the furthest predecessor.
    pub fn random_member<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
    ) -> Option<NeighborInfo> {
        let last_pred = self.preds.last()?;
        let succs = self.succs.iter().take_while(|s| *s != last_pred);
        let choices: Vec<&NeighborInfo> =
            self.preds.iter().chain(succs).collect();
        let which = rng.gen_range(0..choices.len());
        Some(*choices[which])
    }

    /// The ranges this node shares with `other`, or `None` if `other` is
    /// not in the leaf set.
    pub fn shared_ranges(
        &self,
        other: &NeighborInfo,
    ) -> Option<BTreeSet<GuidRange>> {
        if self.is_alone() {
            return None;
        }
        if self.covers_all {
            return Some([GuidRange::FULL].into_iter().collect());
        }
        let len = self.preds.len() as isize;
        let (low, high) = if let Some(idx) =
            self.succs.iter().position(|s| s == other)
        {
            // other stores ranges back to len members before itself
            (idx as isize + 1 - len, len)
        } else if let Some(idx) = self.preds.iter().position(|p| p == other) {
            (-len, len - idx as isize - 1)
        } else {
            return None;
        };
        Some((low..high).map(|i| self.range(i)).collect())
    }

    /// Is `range` a range this node shares with `peer`?
    pub fn valid_db(&self, peer: &NeighborInfo, range: &GuidRange) -> bool {
        self.shared_ranges(peer)
            .map(|r| r.contains(range))
            .unwrap_or(false)
    }

    /// How long a successful anti-entropy round keeps a range marked as
    /// synced with a peer.
    ///
    /// There are up to `2 * len` peers sharing up to `2 * len` ranges, all
    /// picked at random once per period, so visiting every pair takes
    /// about `n * log2(n)` with `n = 4 * len^2 * period`.
    pub fn sync_timeout(&self, period: Duration) -> Duration {
        let len = self.preds.len() as f64;
        let n = 4.0 * len * len * period.as_millis() as f64;
        if n < 2.0 {
            return period;
        }
        Duration::from_millis((n * n.log2()).ceil() as u64)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    /// Ring positions used below, in ring order:
    /// p2 < p1 < me < s1 < s2.
    fn n(pos: u64, port: u16) -> NeighborInfo {
        NeighborInfo::new(
            ([127, 0, 0, 1], port).into(),
            Guid::from_high_u64(pos),
        )
    }

    fn me() -> NeighborInfo {
        n(500, 5000)
    }

    fn five() -> Neighbourhood {
        let ls = LeafSet::new(
            vec![n(400, 4000), n(300, 3000)],
            vec![n(600, 6000), n(700, 7000)],
        );
        Neighbourhood::new(me(), &ls, 2)
    }

    fn g(pos: u64) -> Guid {
        Guid::from_high_u64(pos)
    }

    #[test]
    fn alone_owns_the_ring() {
        let nb = Neighbourhood::new(me(), &LeafSet::default(), 2);
        assert!(nb.is_alone());
        assert_eq!(GuidRange::FULL, nb.responsibility());
        assert!(nb.db_ranges().is_empty());
        assert!(nb.in_leaf_set_range(&Guid::MAX));
        assert!(nb.forward_set(&g(1)).is_empty());
        assert_eq!(vec![me().addr], nb.replica_set_for(&g(1)));
        assert!(nb.random_member(&mut rand::thread_rng()).is_none());
        assert!(!nb.valid_db(&n(400, 4000), &GuidRange::FULL));
    }

    #[test]
    fn ranges_partition_between_members() {
        let nb = five();
        assert!(!nb.covers_all());
        assert_eq!(
            GuidRange::new(g(300), g(700).wrapping_sub_one()),
            nb.responsibility()
        );
        let expect: BTreeSet<GuidRange> = [
            GuidRange::new(g(300), g(400).wrapping_sub_one()),
            GuidRange::new(g(400), g(500).wrapping_sub_one()),
            GuidRange::new(g(500), g(600).wrapping_sub_one()),
            GuidRange::new(g(600), g(700).wrapping_sub_one()),
        ]
        .into_iter()
        .collect();
        assert_eq!(&expect, nb.db_ranges());
        assert!(nb.in_leaf_set_range(&g(300)));
        assert!(nb.in_leaf_set_range(&g(650)));
        assert!(!nb.in_leaf_set_range(&g(700)));
        assert!(!nb.in_leaf_set_range(&g(100)));
    }

    #[test]
    fn leaf_set_is_trimmed() {
        let ls = LeafSet::new(
            vec![n(400, 4000), n(300, 3000), n(200, 2000)],
            vec![n(600, 6000), n(700, 7000), n(800, 8000)],
        );
        assert_eq!(five(), Neighbourhood::new(me(), &ls, 2));
    }

    #[test]
    fn wrapping_leaf_set_covers_all() {
        // three nodes on the ring: each neighbour is on both sides
        let a = n(100, 1000);
        let b = n(900, 9000);
        let ls = LeafSet::new(vec![a, b], vec![b, a]);
        let nb = Neighbourhood::new(me(), &ls, 2);
        assert!(nb.covers_all());
        assert_eq!(GuidRange::FULL, nb.responsibility());
        assert_eq!(
            Some([GuidRange::FULL].into_iter().collect()),
            nb.shared_ranges(&b)
        );
        // preds, then succs up to the furthest pred
        for _ in 0..20 {
            let m = nb.random_member(&mut rand::thread_rng()).unwrap();
            assert!(m == a || m == b);
        }
    }

    #[test]
    fn forward_set_trims_far_side() {
        let nb = five();
        let addrs = |v: Vec<NeighborInfo>| {
            v.into_iter().map(|n| n.addr.port()).collect::<Vec<_>>()
        };
        // between p1 and me: all preds, near succ only
        assert_eq!(vec![3000, 4000, 6000], addrs(nb.forward_set(&g(450))));
        // between me and s1: near pred only, all succs
        assert_eq!(vec![4000, 6000, 7000], addrs(nb.forward_set(&g(550))));
        // between p2 and p1: one on each side
        assert_eq!(vec![4000, 6000], addrs(nb.forward_set(&g(350))));
    }

    #[test]
    fn replica_set_of_full_leaf_set() {
        let nb = five();
        let ports = |v: Vec<SocketAddr>| {
            v.into_iter().map(|a| a.port()).collect::<Vec<_>>()
        };
        assert_eq!(
            vec![3000, 4000, 5000, 6000],
            ports(nb.replica_set_for(&g(450)))
        );
        assert_eq!(
            vec![4000, 5000, 6000, 7000],
            ports(nb.replica_set_for(&g(550)))
        );
    }

    #[test]
    fn replica_set_of_small_ring() {
        let a = n(100, 1000);
        let b = n(900, 9000);
        let nb = Neighbourhood::new(me(), &LeafSet::new(vec![a, b], vec![b, a]), 2);
        // two unique members: one pred, me, one succ
        assert_eq!(
            vec![1000, 5000, 9000],
            nb.replica_set_for(&g(450))
                .into_iter()
                .map(|a| a.port())
                .collect::<Vec<_>>()
        );
    }

    #[test]
    fn shared_ranges_by_position() {
        let nb = five();
        let r = |lo: u64, hi: u64| GuidRange::new(g(lo), g(hi).wrapping_sub_one());

        // immediate successor shares everything from p1 on
        let s1: BTreeSet<_> =
            [r(400, 500), r(500, 600), r(600, 700)].into_iter().collect();
        assert_eq!(Some(s1), nb.shared_ranges(&n(600, 6000)));

        // furthest successor shares only what lies between us
        let s2: BTreeSet<_> = [r(500, 600), r(600, 700)].into_iter().collect();
        assert_eq!(Some(s2), nb.shared_ranges(&n(700, 7000)));

        let p1: BTreeSet<_> =
            [r(300, 400), r(400, 500), r(500, 600)].into_iter().collect();
        assert_eq!(Some(p1), nb.shared_ranges(&n(400, 4000)));

        let p2: BTreeSet<_> = [r(300, 400), r(400, 500)].into_iter().collect();
        assert_eq!(Some(p2), nb.shared_ranges(&n(300, 3000)));

        assert_eq!(None, nb.shared_ranges(&n(800, 8000)));
        assert!(nb.valid_db(&n(700, 7000), &r(600, 700)));
        assert!(!nb.valid_db(&n(700, 7000), &r(300, 400)));
    }

    #[test]
    fn sync_timeout_grows_with_leaf_set() {
        let nb = five();
        // n = 4 * 2 * 2 * 1000 = 16000
        let n = 16000f64;
        assert_eq!(
            Duration::from_millis((n * n.log2()).ceil() as u64),
            nb.sync_timeout(Duration::from_secs(1))
        );
        let alone = Neighbourhood::alone(me());
        assert_eq!(
            Duration::from_secs(1),
            alone.sync_timeout(Duration::from_secs(1))
        );
    }
}
