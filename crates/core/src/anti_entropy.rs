//! Anti-entropy between neighbours.
//!
//! At most one client session runs at a time. A session picks a random
//! neighbour and one range shared with it, then walks the two Merkle trees
//! from the root: matching nodes are skipped, mismatching internal nodes
//! queue their mismatching children, and mismatching leaf nodes are
//! reconciled by listing the peer's keys for that time range and fetching
//! every tuple missing locally. When nothing is left to visit the range
//! is marked synced with the peer.
//!
//! Every response is matched against the session's peer and the sequence
//! number of the request it answers. Anything else is a leftover from an
//! abandoned session and is dropped.

use crate::constant::*;
use crate::data_manager::Actor;
use crate::protocol::*;
use crate::tree_state::Resuming;
use bamboo_api::*;
use bamboo_dht::sha1;
use rand::Rng;
use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use tokio::time::Instant;

/// How an anti-entropy session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AeOutcome {
    /// Every mismatch was reconciled; the range is synced with the peer.
    Synced,
    /// The peer went quiet for too long.
    TimedOut,
    /// The peer refused the range or the tree layout.
    Rejected(RejectReason),
    /// The range stopped being shared with the peer mid-session.
    Abandoned,
}

/// Summary of a finished anti-entropy session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AeReport {
    /// The neighbour compared with.
    pub peer: SocketAddr,
    /// The range compared.
    pub range: GuidRange,
    /// Tree nodes requested from the peer.
    pub node_requests: u32,
    /// Key listings requested from the peer.
    pub key_requests: u32,
    /// Tuples fetched from the peer and stored.
    pub repaired: u32,
    /// How the session ended.
    pub outcome: AeOutcome,
}

#[derive(Debug)]
pub(crate) struct AeSession {
    pub id: u64,
    peer: NeighborInfo,
    range: GuidRange,
    /// The node being compared.
    level: u32,
    low: i64,
    nodes_to_do: VecDeque<(u32, i64)>,
    /// Sequence number of the outstanding node request.
    node_seq: Option<u64>,
    /// Sequence number of the outstanding key listing.
    keys_seq: Option<u64>,
    /// Tuples requested and not yet received.
    fetched_data: HashSet<Key>,
    last_activity: Instant,
    node_requests: u32,
    key_requests: u32,
    repaired: u32,
}

impl Actor {
    fn ae_session(&mut self, id: u64) -> Option<&mut AeSession> {
        match self.ae.as_mut() {
            Some(s) if s.id == id => Some(s),
            _ => {
                tracing::debug!(session = id, "stale anti-entropy session");
                None
            }
        }
    }

    fn ae_finish(&mut self, outcome: AeOutcome) {
        let Some(s) = self.ae.take() else {
            return;
        };
        let report = AeReport {
            peer: s.peer.addr,
            range: s.range,
            node_requests: s.node_requests,
            key_requests: s.key_requests,
            repaired: s.repaired,
            outcome,
        };
        tracing::debug!(?report, "anti-entropy session finished");
        self.last_report = Some(report);
    }

    pub(crate) fn ae_alarm(&mut self, now: Instant) {
        self.synced.expire(now);

        if let Some(s) = &self.ae {
            if now.duration_since(s.last_activity) <= AE_INACTIVITY_TIMEOUT {
                return;
            }
            tracing::warn!(
                peer = %s.peer,
                range = %s.range,
                "anti-entropy session timed out"
            );
            let (range, peer) = (s.range, s.peer.addr);
            self.synced.unsynced(range, peer);
            self.ae_finish(AeOutcome::TimedOut);
        }

        let mut rng = rand::thread_rng();
        let Some(peer) = self.hood.random_member(&mut rng) else {
            return;
        };
        let Some(ranges) = self.hood.shared_ranges(&peer) else {
            return;
        };
        if ranges.is_empty() {
            return;
        }
        let Some(range) = ranges
            .iter()
            .nth(rng.gen_range(0..ranges.len()))
            .copied()
        else {
            return;
        };

        let id = self.next_session;
        self.next_session += 1;
        let (level, low) = self.trees.tree_mut(range).root_addr();
        tracing::debug!(session = id, %peer, %range, "anti-entropy session");
        self.ae = Some(AeSession {
            id,
            peer,
            range,
            level,
            low,
            nodes_to_do: VecDeque::new(),
            node_seq: None,
            keys_seq: None,
            fetched_data: HashSet::new(),
            last_activity: now,
            node_requests: 0,
            key_requests: 0,
            repaired: 0,
        });
        self.trees
            .wait_for_ready(range, Resuming::AeTreeReady { session: id });
    }

    /// The session range was dropped with the old leaf set.
    pub(crate) fn ae_leaf_set_changed(&mut self) {
        let gone = self
            .ae
            .as_ref()
            .is_some_and(|s| !self.hood.valid_db(&s.peer, &s.range));
        if gone {
            self.ae_finish(AeOutcome::Abandoned);
        }
    }

    /// Ask the peer for the current node. The tree is up to date.
    pub(crate) fn ae_send_node_req(&mut self, session: u64) {
        let Some(s) = self.ae.as_ref().filter(|s| s.id == session) else {
            tracing::debug!(session, "stale anti-entropy session");
            return;
        };
        let (range, level, low, peer) = (s.range, s.level, s.low, s.peer.addr);
        let Some(node) = self.trees.tree(&range).and_then(|t| t.node(level, low))
        else {
            self.ae_next_node();
            return;
        };
        let expected_hash = node.hash().copied();
        let me = self.me.guid;
        let expansion = self.trees.expansion();
        let seq = self.next_seq();
        let Some(s) = self.ae_session(session) else {
            return;
        };
        s.node_seq = Some(seq);
        s.node_requests += 1;
        s.last_activity = Instant::now();
        self.send(
            peer,
            DmMessage::FetchNodeReq(FetchNodeReq {
                peer_guid: me,
                range,
                expansion,
                level,
                low_time: low,
                expected_hash,
                seq,
            }),
        );
    }

    /// Move on to the next queued node, or finish the session.
    pub(crate) fn ae_next_node(&mut self) {
        let timeout = self.hood.sync_timeout(self.config.ae_period());
        let Some(s) = self.ae.as_mut() else {
            return;
        };
        match s.nodes_to_do.pop_front() {
            Some((level, low)) => {
                s.level = level;
                s.low = low;
                let (range, session) = (s.range, s.id);
                self.trees
                    .wait_for_ready(range, Resuming::AeTreeReady { session });
            }
            None => {
                let (range, peer) = (s.range, s.peer.addr);
                self.synced.synced(range, peer, Instant::now(), timeout);
                self.ae_finish(AeOutcome::Synced);
            }
        }
    }

    pub(crate) fn ae_node_resp(&mut self, peer: SocketAddr, resp: FetchNodeResp) {
        let Some(s) = self.ae.as_mut() else {
            tracing::debug!(%peer, "node response without a session");
            return;
        };
        if s.peer.addr != peer || s.node_seq != Some(resp.seq) {
            tracing::debug!(%peer, seq = resp.seq, "stale node response");
            return;
        }
        s.node_seq = None;
        s.last_activity = Instant::now();
        let (range, session) = (s.range, s.id);
        self.trees
            .wait_for_ready(range, Resuming::AeNodeResp { session, resp });
    }

    /// Compare the peer's node with ours. The tree is up to date.
    pub(crate) fn ae_compare(&mut self, session: u64, resp: FetchNodeResp) {
        let Some(s) = self.ae.as_ref().filter(|s| s.id == session) else {
            tracing::debug!(session, "stale anti-entropy session");
            return;
        };
        let (range, level, low, peer) = (s.range, s.level, s.low, s.peer.addr);
        let Some(tree) = self.trees.tree(&range) else {
            return;
        };
        let Some(node) = tree.node(level, low) else {
            self.ae_next_node();
            return;
        };
        if node.hash() == Some(&resp.hash) {
            tracing::trace!(%peer, level, low, "node matches");
            self.ae_next_node();
            return;
        }

        let children = match resp.children {
            Some(children) if !tree.children_are_leaves(level, low) => {
                children
            }
            _ => {
                let (low_time, high_time) = (node.low(), node.high());
                let seq = self.next_seq();
                if let Some(s) = self.ae_session(session) {
                    s.keys_seq = Some(seq);
                    s.key_requests += 1;
                }
                tracing::debug!(%peer, level, low, "leaf mismatch, listing keys");
                self.send(
                    peer,
                    DmMessage::FetchKeysReq(FetchKeysReq {
                        range,
                        low_time,
                        high_time,
                        seq,
                    }),
                );
                return;
            }
        };

        let ours = tree.child_hashes(level, low);
        if ours.len() != children.len() {
            tracing::debug!(
                %peer,
                ours = ours.len(),
                theirs = children.len(),
                "child count mismatch"
            );
            self.ae_next_node();
            return;
        }
        let lows: Vec<i64> = tree.child_lows(level, low).collect();
        let todo: Vec<(u32, i64)> = ours
            .iter()
            .zip(children.iter())
            .zip(lows)
            .filter(|((a, b), _)| a != b)
            .map(|(_, child_low)| (level - 1, child_low))
            .collect();
        tracing::trace!(%peer, level, low, mismatched = todo.len(), "children compared");
        if let Some(s) = self.ae_session(session) {
            s.nodes_to_do.extend(todo);
        }
        self.ae_next_node();
    }

    pub(crate) fn ae_node_reject(
        &mut self,
        peer: SocketAddr,
        rej: FetchNodeReject,
    ) {
        let Some(s) = self.ae.as_mut() else {
            return;
        };
        if s.peer.addr != peer || s.node_seq != Some(rej.seq) {
            tracing::debug!(%peer, seq = rej.seq, "stale node reject");
            return;
        }
        s.node_seq = None;
        s.last_activity = Instant::now();
        let range = s.range;
        match rej.reason {
            RejectReason::NoSuchNode => self.ae_next_node(),
            RejectReason::BadGuidRange => {
                tracing::debug!(%peer, %range, "peer does not share range");
                self.synced.unsynced(range, peer);
                self.ae_finish(AeOutcome::Rejected(rej.reason));
            }
            reason => {
                tracing::warn!(%peer, %range, ?reason, "anti-entropy rejected");
                self.synced.unsynced(range, peer);
                self.ae_finish(AeOutcome::Rejected(reason));
            }
        }
    }

    pub(crate) async fn ae_keys_resp(
        &mut self,
        peer: SocketAddr,
        resp: FetchKeysResp,
    ) {
        let Some(s) = self.ae.as_mut() else {
            return;
        };
        if s.peer.addr != peer || s.keys_seq != Some(resp.seq) {
            tracing::debug!(%peer, seq = resp.seq, "stale keys response");
            return;
        }
        s.keys_seq = None;
        s.last_activity = Instant::now();
        let Some(keys) = resp.keys else {
            self.ae_next_node();
            return;
        };

        let now = Timestamp::now();
        let mut missing = Vec::new();
        for key in keys {
            if key.is_expired(now) {
                continue;
            }
            match self.store.get(key, now).await {
                Ok(Some(_)) => (),
                Ok(None) => missing.push(key),
                Err(err) => tracing::warn!(%key, ?err, "store lookup failed"),
            }
        }

        let Some(s) = self.ae.as_mut() else {
            return;
        };
        let mut requests = Vec::new();
        for key in missing {
            if s.fetched_data.insert(key) {
                requests.push(key);
            }
        }
        let idle = s.fetched_data.is_empty();
        tracing::debug!(%peer, missing = requests.len(), "keys compared");
        for key in requests {
            self.send(peer, DmMessage::FetchDataReq(FetchDataReq { key }));
        }
        if idle {
            self.ae_next_node();
        }
    }

    pub(crate) async fn ae_data_resp(
        &mut self,
        peer: SocketAddr,
        resp: FetchDataResp,
    ) {
        let Some(s) = self.ae.as_mut() else {
            return;
        };
        if s.peer.addr != peer || !s.fetched_data.remove(&resp.key) {
            tracing::debug!(%peer, key = %resp.key, "unrecognized data response");
            return;
        }
        s.last_activity = Instant::now();
        let range = s.range;
        let key = resp.key;

        match resp.data {
            None => tracing::debug!(%peer, %key, "peer no longer has tuple"),
            Some(_) if key.is_expired(Timestamp::now()) => {
                tracing::debug!(%peer, %key, "fetched tuple expired")
            }
            Some(data) => {
                let valid = if key.is_put {
                    sha1(&data) == key.data_hash
                } else {
                    sha1(&data) == key.secret_hash
                };
                if !valid {
                    tracing::warn!(%peer, %key, "fetched tuple fails its hash check");
                } else {
                    tracing::info!(%peer, %key, "repairing tuple from neighbour");
                    self.synced.unsynced(range, peer);
                    if let Some(s) = self.ae.as_mut() {
                        s.repaired += 1;
                    }
                    if let Err(err) = self.db_put(key, data).await {
                        tracing::warn!(%key, ?err, "failed to store fetched tuple");
                    }
                }
            }
        }

        let idle = self
            .ae
            .as_ref()
            .is_some_and(|s| s.fetched_data.is_empty() && s.keys_seq.is_none());
        if idle {
            self.ae_next_node();
        }
    }

    pub(crate) fn fetch_node_req(&mut self, peer: SocketAddr, req: FetchNodeReq) {
        let from = NeighborInfo::new(peer, req.peer_guid);
        let reason = if !self.hood.valid_db(&from, &req.range) {
            Some(RejectReason::BadGuidRange)
        } else if req.expansion != self.trees.expansion() {
            Some(RejectReason::BadExpansion)
        } else {
            None
        };
        if let Some(reason) = reason {
            tracing::debug!(%from, range = %req.range, ?reason, "rejecting node request");
            self.send(
                peer,
                DmMessage::FetchNodeReject(FetchNodeReject {
                    reason,
                    seq: req.seq,
                }),
            );
            return;
        }
        self.trees
            .wait_for_ready(req.range, Resuming::FetchNodeReq { peer, req });
    }

    /// Answer a node request. The tree is up to date.
    pub(crate) fn answer_node_req(&mut self, peer: SocketAddr, req: FetchNodeReq) {
        let found = self.trees.tree(&req.range).and_then(|tree| {
            let node = tree.node(req.level, req.low_time)?;
            let hash = *node.hash()?;
            let leaf = tree.children_are_leaves(req.level, req.low_time);
            let children = if !leaf && req.expected_hash != Some(hash) {
                Some(tree.child_hashes(req.level, req.low_time))
            } else {
                None
            };
            Some(FetchNodeResp {
                hash,
                leaf,
                children,
                seq: req.seq,
            })
        });
        let msg = match found {
            Some(resp) => DmMessage::FetchNodeResp(resp),
            None => DmMessage::FetchNodeReject(FetchNodeReject {
                reason: RejectReason::NoSuchNode,
                seq: req.seq,
            }),
        };
        self.send(peer, msg);
    }

    pub(crate) async fn fetch_keys_req(&mut self, peer: SocketAddr, req: FetchKeysReq) {
        let limit = (1usize << self.trees.expansion()) + 1;
        let keys = match self
            .store
            .scan_by_time(
                req.low_time,
                req.high_time,
                req.range,
                limit,
                Timestamp::now(),
            )
            .await
        {
            Ok(keys) => keys,
            Err(err) => {
                tracing::warn!(%peer, ?err, "key scan failed");
                Vec::new()
            }
        };
        let keys = if keys.is_empty() { None } else { Some(keys) };
        self.send(
            peer,
            DmMessage::FetchKeysResp(FetchKeysResp { keys, seq: req.seq }),
        );
    }

    pub(crate) async fn fetch_data_req(&mut self, peer: SocketAddr, req: FetchDataReq) {
        let data = match self.store.get(req.key, Timestamp::now()).await {
            Ok(data) => data,
            Err(err) => {
                tracing::warn!(%peer, key = %req.key, ?err, "store lookup failed");
                None
            }
        };
        self.send(
            peer,
            DmMessage::FetchDataResp(FetchDataResp { key: req.key, data }),
        );
    }
}
