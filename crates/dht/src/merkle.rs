//! Time-bucketed Merkle tree.
//!
//! The tree covers key creation times `[0, 2^(root_level * expansion))`.
//! A node at `level` starting at `low` covers the half-open time range
//! `[low, low + 2^(level * expansion))`, and when it has children it has
//! exactly `2^expansion` of them, one per equal sub-range.
//!
//! Only materialised nodes are stored. A node keeps children only while
//! more than `2^expansion` keys fall under it; otherwise its hash is the
//! digest of the keys themselves. Level 0 nodes never split.
//!
//! Hashes are filled lazily. [MerkleTree::fill_holes] either completes a
//! node or asks the caller for one store scan, returned as a
//! [FillHolesState]. The caller performs the scan, calls
//! [FillHolesState::resolve] and passes the state back in. This repeats
//! until `fill_holes` returns `None`.

use crate::{combine_children, digest_keys, MAX_EXPANSION, TIME_BITS};
use bamboo_api::{Hash, Key, Timestamp, ZERO_HASH};
use std::collections::HashMap;

/// A scan request from [MerkleTree::fill_holes], and later its result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FillHolesState {
    /// More keys than this and the node must split instead.
    pub max_leaves_below: u64,
    /// First time covered by the scan.
    pub range_low: i64,
    /// Scan covers times strictly below this.
    pub range_high: i64,
    /// Digest of the scanned keys, `None` if there were too many.
    pub digest: Option<Hash>,
    /// How many keys the scan found, capped at `max_leaves_below + 1`.
    pub leaves_below: u64,
    /// Earliest expiry among the scanned keys.
    pub earliest_expiry_usec: i64,
}

impl FillHolesState {
    fn new(max_leaves_below: u64, range_low: i64, range_high: i64) -> Self {
        Self {
            max_leaves_below,
            range_low,
            range_high,
            digest: None,
            leaves_below: 0,
            earliest_expiry_usec: i64::MAX,
        }
    }

    /// How many keys the scan needs to read at most. One more than the
    /// maximum is enough to tell that the node must split.
    pub fn scan_limit(&self) -> usize {
        usize::try_from(self.max_leaves_below.saturating_add(1))
            .unwrap_or(usize::MAX)
    }

    /// Record the scan result. `keys` must be in key order and must not
    /// contain expired keys.
    pub fn resolve(&mut self, keys: &[Key]) {
        self.leaves_below = keys.len() as u64;
        if self.leaves_below > self.max_leaves_below {
            self.digest = None;
            return;
        }
        self.digest = Some(digest_keys(keys));
        self.earliest_expiry_usec = keys
            .iter()
            .map(Key::expiry_usec)
            .min()
            .unwrap_or(i64::MAX);
    }
}

impl std::fmt::Display for FillHolesState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "FillHolesState [{:x}, {:x}) max={} leaves={} digest={}",
            self.range_low,
            self.range_high,
            self.max_leaves_below,
            self.leaves_below,
            self.digest.is_some(),
        )
    }
}

/// A materialised tree node.
#[derive(Debug, Clone)]
pub struct Node {
    level: u32,
    low: i64,
    high: i64,
    hash: Option<Hash>,
    leaves_below: u64,
    earliest_expiry_usec: i64,
}

impl Node {
    fn new(level: u32, low: i64, high: i64) -> Self {
        Self {
            level,
            low,
            high,
            hash: None,
            leaves_below: 0,
            earliest_expiry_usec: i64::MAX,
        }
    }

    /// Level of this node, 0 being the finest.
    pub fn level(&self) -> u32 {
        self.level
    }

    /// First time covered.
    pub fn low(&self) -> i64 {
        self.low
    }

    /// End of the covered time range, exclusive.
    pub fn high(&self) -> i64 {
        self.high
    }

    /// The node hash, if computed.
    pub fn hash(&self) -> Option<&Hash> {
        self.hash.as_ref()
    }

    /// Number of keys under this node as of the last fill.
    pub fn leaves_below(&self) -> u64 {
        self.leaves_below
    }

    /// Earliest expiry of any key under this node as of the last fill.
    pub fn earliest_expiry_usec(&self) -> i64 {
        self.earliest_expiry_usec
    }

    /// Does `time_usec` fall in this node's range?
    pub fn covers(&self, time_usec: i64) -> bool {
        self.low <= time_usec && time_usec < self.high
    }

    /// A node is valid when its hash is computed and nothing below it has
    /// expired since. Like [Key::is_expired], a node is still valid at
    /// its earliest expiry.
    pub fn valid(&self, now: Timestamp) -> bool {
        self.hash.is_some() && self.earliest_expiry_usec >= now.as_micros()
    }
}

impl std::fmt::Display for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Node level={} [{:x}, {:x}) ",
            self.level, self.low, self.high
        )?;
        match &self.hash {
            None => f.write_str("invalid")?,
            Some(h) => write!(f, "hash=0x{}", bamboo_api::hex4(h))?,
        }
        write!(f, " leaves_below={}", self.leaves_below)
    }
}

/// A Merkle tree over the keys of one guid range.
#[derive(Debug)]
pub struct MerkleTree {
    expansion: u32,
    // nodes[level] maps a node's low time to the node
    nodes: Vec<HashMap<i64, Node>>,
}

impl MerkleTree {
    /// Create an empty tree with `2^expansion` children per internal node.
    ///
    /// `expansion` is clamped to `1..=MAX_EXPANSION`.
    pub fn new(expansion: u32) -> Self {
        let expansion = expansion.clamp(1, MAX_EXPANSION);
        let levels = (TIME_BITS / expansion + 1) as usize;
        Self {
            expansion,
            nodes: (0..levels).map(|_| HashMap::new()).collect(),
        }
    }

    /// The fan-out exponent.
    pub fn expansion(&self) -> u32 {
        self.expansion
    }

    /// Number of levels, the root being at `levels() - 1`.
    pub fn levels(&self) -> u32 {
        self.nodes.len() as u32
    }

    /// Address of the root node.
    pub fn root_addr(&self) -> (u32, i64) {
        (self.levels() - 1, 0)
    }

    /// The root node, materialised on first use.
    pub fn root(&mut self) -> &Node {
        let (level, low) = self.root_addr();
        let high = low + self.width(level);
        self.nodes[level as usize]
            .entry(low)
            .or_insert_with(|| Node::new(level, low, high))
    }

    /// Look up a materialised node.
    pub fn node(&self, level: u32, low: i64) -> Option<&Node> {
        self.nodes.get(level as usize)?.get(&low)
    }

    /// Every materialised node.
    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().flat_map(|m| m.values())
    }

    /// Does this node currently have children?
    pub fn has_children(&self, level: u32, low: i64) -> bool {
        level > 0
            && self
                .child_lows(level, low)
                .any(|c| self.node(level - 1, c).is_some())
    }

    /// True when the keys under this node are hashed directly rather
    /// than through child nodes.
    pub fn children_are_leaves(&self, level: u32, low: i64) -> bool {
        level == 0 || !self.has_children(level, low)
    }

    /// Hashes of this node's children in position order, empty if it has
    /// none.
    pub fn child_hashes(&self, level: u32, low: i64) -> Vec<Hash> {
        if !self.has_children(level, low) {
            return Vec::new();
        }
        self.child_lows(level, low)
            .map(|c| {
                self.node(level - 1, c)
                    .and_then(|n| n.hash)
                    .unwrap_or(ZERO_HASH)
            })
            .collect()
    }

    /// Low times of this node's children in position order.
    pub fn child_lows(
        &self,
        level: u32,
        low: i64,
    ) -> impl Iterator<Item = i64> {
        let step = if level == 0 { 0 } else { self.width(level - 1) };
        let count = if level == 0 { 0 } else { 1i64 << self.expansion };
        (0..count).map(move |i| low + i * step)
    }

    /// Clear the hash of every node on the path from the root to the
    /// finest materialised node covering `time_usec`. Siblings are left
    /// alone.
    pub fn invalidate_path(&mut self, time_usec: i64) {
        let (mut level, mut low) = self.root_addr();
        self.root();
        loop {
            let Some(node) = self.nodes[level as usize].get_mut(&low) else {
                break;
            };
            node.hash = None;
            if level == 0 || !node.covers(time_usec) {
                break;
            }
            let step = self.width(level - 1);
            low += ((time_usec - low) / step) * step;
            level -= 1;
        }
    }

    /// Bring the node at `(level, low)` up to date.
    ///
    /// Returns `None` once the node is valid, or when it is not
    /// materialised. Otherwise returns the scan needed next; resolve it
    /// and call again with it as `scan`.
    pub fn fill_holes(
        &mut self,
        level: u32,
        low: i64,
        scan: Option<&FillHolesState>,
        now: Timestamp,
    ) -> Option<FillHolesState> {
        let node = self.node(level, low)?;
        if node.valid(now) {
            return None;
        }
        tracing::trace!(%node, "fill_holes");

        if self.has_children(level, low) {
            self.fill_with_children(level, low, scan, now)
        } else {
            self.fill_without_children(level, low, scan, now)
        }
    }

    fn fill_with_children(
        &mut self,
        level: u32,
        low: i64,
        scan: Option<&FillHolesState>,
        now: Timestamp,
    ) -> Option<FillHolesState> {
        let child_level = level - 1;
        let child_width = self.width(child_level);
        let mut hashes = Vec::with_capacity(1 << self.expansion);
        let mut leaves_below = 0u64;
        let mut earliest_expiry_usec = i64::MAX;

        for child_low in self.child_lows(level, low).collect::<Vec<_>>() {
            self.nodes[child_level as usize]
                .entry(child_low)
                .or_insert_with(|| {
                    Node::new(child_level, child_low, child_low + child_width)
                });
            if let Some(req) =
                self.fill_holes(child_level, child_low, scan, now)
            {
                return Some(req);
            }
            let Some(child) = self.node(child_level, child_low) else {
                continue;
            };
            let Some(hash) = child.hash else {
                return Some(self.scan_request(child_level, child_low));
            };
            hashes.push(hash);
            leaves_below = leaves_below.saturating_add(child.leaves_below);
            earliest_expiry_usec =
                earliest_expiry_usec.min(child.earliest_expiry_usec);
        }

        if leaves_below <= self.max_leaves(level) {
            tracing::trace!(level, low, leaves_below, "collapsing children");
            self.remove_children(level, low);
            return self.fill_without_children(level, low, scan, now);
        }

        let hash = combine_children(&hashes);
        if let Some(node) = self.nodes[level as usize].get_mut(&low) {
            node.hash = Some(hash);
            node.leaves_below = leaves_below;
            node.earliest_expiry_usec = earliest_expiry_usec;
        }
        None
    }

    fn fill_without_children(
        &mut self,
        level: u32,
        low: i64,
        scan: Option<&FillHolesState>,
        now: Timestamp,
    ) -> Option<FillHolesState> {
        let request = self.scan_request(level, low);
        let Some(scan) = scan.filter(|s| {
            s.range_low == request.range_low
                && s.range_high == request.range_high
                && s.max_leaves_below == request.max_leaves_below
        }) else {
            return Some(request);
        };

        match scan.digest {
            Some(digest) => {
                if scan.earliest_expiry_usec < now.as_micros() {
                    // a key expired since the scan ran
                    return Some(request);
                }
                let node = self.nodes[level as usize].get_mut(&low)?;
                node.hash = Some(digest);
                node.leaves_below = scan.leaves_below;
                node.earliest_expiry_usec = scan.earliest_expiry_usec;
                None
            }
            None if scan.leaves_below > request.max_leaves_below => {
                tracing::trace!(level, low, "splitting into children");
                let child_level = level - 1;
                let child_width = self.width(child_level);
                for child_low in self.child_lows(level, low).collect::<Vec<_>>()
                {
                    self.nodes[child_level as usize].insert(
                        child_low,
                        Node::new(
                            child_level,
                            child_low,
                            child_low + child_width,
                        ),
                    );
                }
                self.fill_with_children(level, low, None, now)
            }
            None => {
                tracing::warn!(%scan, "scan has no digest but is under the limit");
                Some(request)
            }
        }
    }

    fn remove_children(&mut self, level: u32, low: i64) {
        if level == 0 {
            return;
        }
        for child_low in self.child_lows(level, low).collect::<Vec<_>>() {
            if self.nodes[level as usize - 1].remove(&child_low).is_some() {
                self.remove_children(level - 1, child_low);
            }
        }
    }

    fn scan_request(&self, level: u32, low: i64) -> FillHolesState {
        FillHolesState::new(
            self.max_leaves(level),
            low,
            low + self.width(level),
        )
    }

    fn width(&self, level: u32) -> i64 {
        1i64 << (level * self.expansion)
    }

    fn max_leaves(&self, level: u32) -> u64 {
        if level == 0 {
            u64::MAX
        } else {
            1u64 << self.expansion
        }
    }
}
