//! Leaf-set snapshots.
//!
//! The overlay owns leaf-set membership. Consumers receive an immutable
//! [LeafSet] value on every change and derive everything else from it.

use crate::Guid;
use std::net::SocketAddr;

/// A ring member: where to reach it and where it sits on the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NeighborInfo {
    /// Transport address of the member.
    pub addr: SocketAddr,
    /// Ring position of the member.
    pub guid: Guid,
}

impl NeighborInfo {
    /// Construct a new neighbor descriptor.
    pub fn new(addr: SocketAddr, guid: Guid) -> Self {
        Self { addr, guid }
    }
}

impl std::fmt::Display for NeighborInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.guid, self.addr)
    }
}

/// The nearest predecessors and successors of a node, nearest first.
///
/// On a small ring the same member may appear on both sides.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeafSet {
    /// Counter-clockwise neighbours, `preds[0]` is the immediate
    /// predecessor.
    pub preds: Vec<NeighborInfo>,
    /// Clockwise neighbours, `succs[0]` is the immediate successor.
    pub succs: Vec<NeighborInfo>,
}

impl LeafSet {
    /// Construct a leaf set from predecessor and successor lists.
    pub fn new(preds: Vec<NeighborInfo>, succs: Vec<NeighborInfo>) -> Self {
        Self { preds, succs }
    }

    /// A node alone on the ring.
    pub fn is_empty(&self) -> bool {
        self.preds.is_empty()
    }

    /// Keep only the nearest `per_side` members on each side.
    pub fn trimmed(&self, per_side: usize) -> Self {
        Self {
            preds: self.preds.iter().take(per_side).copied().collect(),
            succs: self.succs.iter().take(per_side).copied().collect(),
        }
    }

    /// Is `addr` any member of this leaf set?
    pub fn contains_addr(&self, addr: &SocketAddr) -> bool {
        self.preds
            .iter()
            .chain(self.succs.iter())
            .any(|n| &n.addr == addr)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn n(i: u16) -> NeighborInfo {
        NeighborInfo::new(
            ([127, 0, 0, 1], 4000 + i).into(),
            Guid::from_high_u64(i as u64),
        )
    }

    #[test]
    fn trim_keeps_nearest() {
        let ls = LeafSet::new(vec![n(1), n(2), n(3)], vec![n(4), n(5)]);
        let t = ls.trimmed(2);
        assert_eq!(vec![n(1), n(2)], t.preds);
        assert_eq!(vec![n(4), n(5)], t.succs);
        assert!(t.contains_addr(&n(5).addr));
        assert!(!t.contains_addr(&n(3).addr));
        assert!(LeafSet::default().is_empty());
    }
}
