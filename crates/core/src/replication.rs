//! Put and remove replication.
//!
//! The node a request is entered at (its root) stores the tuple and
//! forwards it to its forward set under one sequence number. Replicas
//! store and ack. The root completes the request once it has stored the
//! tuple and either enough replicas acked or every replica asked did.
//! A periodic sweep resends to silent replicas and eventually gives up.

use crate::data_manager::Actor;
use crate::error::*;
use crate::protocol::*;
use bamboo_api::*;
use bamboo_dht::sha1;
use bytes::Bytes;
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use tokio::sync::oneshot;
use tokio::time::Instant;

/// A put or remove entered at this node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutOrRemoveReq {
    /// Creation time in microseconds since the unix epoch.
    pub time_usec: i64,
    /// Time to live in seconds.
    pub ttl_sec: i32,
    /// Ring position of the tuple.
    pub guid: Guid,
    /// The value for a put, the removal secret for a remove.
    pub value: Bytes,
    /// Put or remove.
    pub is_put: bool,
    /// Address of the requesting client.
    pub client_id: IpAddr,
    /// For a remove, the hash of the value being removed.
    pub value_hash: Hash,
    /// Hash of the removal secret, [ZERO_HASH] if the put cannot be
    /// removed.
    pub secret_hash: Hash,
}

impl PutOrRemoveReq {
    /// A put created now.
    pub fn put(
        guid: Guid,
        value: Bytes,
        ttl_sec: i32,
        secret_hash: Hash,
        client_id: IpAddr,
    ) -> Self {
        Self {
            time_usec: Timestamp::now().as_micros(),
            ttl_sec,
            guid,
            value,
            is_put: true,
            client_id: client_id.to_canonical(),
            value_hash: ZERO_HASH,
            secret_hash,
        }
    }

    /// A remove, created now, of the put of a value hashing to
    /// `value_hash` whose secret hash is the hash of `secret`.
    pub fn remove(
        guid: Guid,
        value_hash: Hash,
        secret: Bytes,
        ttl_sec: i32,
        client_id: IpAddr,
    ) -> Self {
        Self {
            time_usec: Timestamp::now().as_micros(),
            ttl_sec,
            guid,
            secret_hash: sha1(&secret),
            value: secret,
            is_put: false,
            client_id: client_id.to_canonical(),
            value_hash,
        }
    }

    fn into_msg(self, seq: u64) -> PutOrRemoveMsg {
        PutOrRemoveMsg {
            time_usec: self.time_usec,
            ttl_sec: self.ttl_sec,
            guid: self.guid,
            value: self.value,
            is_put: self.is_put,
            client_id: self.client_id,
            seq,
            value_hash: self.value_hash,
            secret_hash: self.secret_hash,
        }
    }
}

impl PutOrRemoveMsg {
    /// The key the carried tuple is stored under.
    ///
    /// A put is keyed by the hash of its value. A remove is keyed by the
    /// hash of the value it removes, and is only valid when its secret
    /// hashes to its secret hash.
    pub fn to_key(&self) -> DataManagerResult<Key> {
        let mut key = Key {
            time_usec: self.time_usec,
            ttl_sec: self.ttl_sec,
            guid: self.guid,
            secret_hash: self.secret_hash,
            data_hash: self.value_hash,
            is_put: self.is_put,
            client_id: self.client_id,
        };
        if self.is_put {
            key.data_hash = sha1(&self.value);
        } else if sha1(&self.value) != self.secret_hash {
            return Err(DataManagerError::BadRemoveProof { key });
        }
        Ok(key)
    }
}

/// Completion of a [PutOrRemoveReq].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PutOrRemoveDone {
    /// The key the tuple was stored under.
    pub key: Key,
    /// How many replicas the tuple was forwarded to.
    pub expected_acks: usize,
    /// How many of them had acked at completion.
    pub acks: usize,
}

/// A request entered here that is still waiting for replica acks.
#[derive(Debug)]
pub(crate) struct PutOrRemoveState {
    /// When the request was last sent.
    start: Instant,
    stored: bool,
    expected: usize,
    unacked: HashSet<SocketAddr>,
    msg: PutOrRemoveMsg,
    key: Key,
    done: Option<oneshot::Sender<DataManagerResult<PutOrRemoveDone>>>,
}

impl PutOrRemoveState {
    fn acks(&self) -> usize {
        self.expected - self.unacked.len()
    }

    fn complete(&mut self) {
        if let Some(done) = self.done.take() {
            let _ = done.send(Ok(PutOrRemoveDone {
                key: self.key,
                expected_acks: self.expected,
                acks: self.acks(),
            }));
        }
    }
}

impl Actor {
    pub(crate) async fn put_or_remove_local(
        &mut self,
        req: PutOrRemoveReq,
        done: oneshot::Sender<DataManagerResult<PutOrRemoveDone>>,
    ) {
        let mut msg = req.into_msg(0);
        let key = match msg.to_key() {
            Ok(key) => key,
            Err(err) => {
                tracing::warn!(?err, "rejecting put or remove");
                let _ = done.send(Err(err));
                return;
            }
        };
        msg.seq = self.next_seq();
        let seq = msg.seq;
        let forward = self.hood.forward_set(&key.guid);
        tracing::debug!(%key, seq, replicas = forward.len(), "put or remove");

        self.pending.insert(
            seq,
            PutOrRemoveState {
                start: Instant::now(),
                stored: false,
                expected: forward.len(),
                unacked: forward.iter().map(|n| n.addr).collect(),
                msg: msg.clone(),
                key,
                done: Some(done),
            },
        );

        if let Err(err) = self.db_put(key, msg.value.clone()).await {
            tracing::warn!(%key, ?err, "failed to store put or remove");
            if let Some(mut st) = self.pending.remove(&seq) {
                if let Some(done) = st.done.take() {
                    let _ = done.send(Err(err.into()));
                }
            }
            return;
        }

        for peer in forward {
            self.send(peer.addr, DmMessage::PutOrRemove(msg.clone()));
        }

        if let Some(st) = self.pending.get_mut(&seq) {
            st.stored = true;
        }
        self.check_done(seq);
    }

    pub(crate) async fn put_or_remove_remote(
        &mut self,
        peer: SocketAddr,
        msg: PutOrRemoveMsg,
    ) {
        let key = match msg.to_key() {
            Ok(key) => key,
            Err(err) => {
                tracing::warn!(%peer, ?err, "dropping put or remove");
                return;
            }
        };
        match self.db_put(key, msg.value).await {
            Ok(out) => {
                tracing::info!(%peer, %key, stored = out.stored, "stored replica");
                self.send(
                    peer,
                    DmMessage::PutOrRemoveAck(PutOrRemoveAck { seq: msg.seq }),
                );
            }
            Err(err) => {
                tracing::warn!(%peer, %key, ?err, "failed to store replica")
            }
        }
    }

    pub(crate) async fn put_or_remove_ack(
        &mut self,
        peer: SocketAddr,
        ack: PutOrRemoveAck,
    ) {
        if self.discard_acked(peer, ack.seq).await {
            return;
        }
        let Some(st) = self.pending.get_mut(&ack.seq) else {
            tracing::debug!(%peer, seq = ack.seq, "ack for unknown put");
            return;
        };
        if !st.unacked.remove(&peer) {
            tracing::debug!(%peer, seq = ack.seq, "duplicate ack");
            return;
        }
        self.check_done(ack.seq);
    }

    fn check_done(&mut self, seq: u64) {
        let required = self.config.required_acks as usize;
        let Some(st) = self.pending.get_mut(&seq) else {
            return;
        };
        if !st.stored {
            return;
        }
        if st.acks() >= required || st.unacked.is_empty() {
            st.complete();
        }
        if st.unacked.is_empty() {
            tracing::debug!(key = %st.key, seq, acks = st.acks(), "all replicas acked");
            self.pending.remove(&seq);
        }
    }

    /// Resend to silent replicas or give up on them.
    pub(crate) fn ack_sweep(&mut self, now: Instant) {
        let retry = self.config.put_retry_time();
        let give_up = self.config.put_give_up_time();
        let required = self.config.required_acks as usize;
        let mut resend = Vec::new();

        self.pending.retain(|seq, st| {
            if st.stored && now > st.start + give_up {
                if st.acks() < required && !st.unacked.is_empty() {
                    tracing::warn!(
                        key = %st.key,
                        seq,
                        acks = st.acks(),
                        expected = st.expected,
                        "giving up on replica acks below quorum"
                    );
                }
                st.complete();
                return false;
            }
            if now > st.start + retry {
                tracing::debug!(key = %st.key, seq, unacked = st.unacked.len(), "resending");
                st.start = now;
                for peer in &st.unacked {
                    resend.push((*peer, st.msg.clone()));
                }
            }
            true
        });

        for (peer, msg) in resend {
            self.send(peer, DmMessage::PutOrRemove(msg));
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn client() -> IpAddr {
        [10, 0, 0, 1].into()
    }

    #[test]
    fn put_is_keyed_by_value_hash() {
        let req = PutOrRemoveReq::put(
            Guid::from_high_u64(1),
            Bytes::from_static(b"value"),
            60,
            sha1(b"secret"),
            client(),
        );
        let key = req.clone().into_msg(3).to_key().unwrap();
        assert_eq!(sha1(b"value"), key.data_hash);
        assert_eq!(sha1(b"secret"), key.secret_hash);
        assert!(key.is_put);
        assert_eq!(req.time_usec, key.time_usec);
    }

    #[test]
    fn remove_is_keyed_by_removed_value() {
        let req = PutOrRemoveReq::remove(
            Guid::from_high_u64(1),
            sha1(b"value"),
            Bytes::from_static(b"secret"),
            60,
            client(),
        );
        let key = req.into_msg(3).to_key().unwrap();
        assert_eq!(sha1(b"value"), key.data_hash);
        assert_eq!(sha1(b"secret"), key.secret_hash);
        assert!(!key.is_put);
    }

    #[test]
    fn remove_with_wrong_secret_is_rejected() {
        let mut req = PutOrRemoveReq::remove(
            Guid::from_high_u64(1),
            sha1(b"value"),
            Bytes::from_static(b"secret"),
            60,
            client(),
        );
        req.value = Bytes::from_static(b"guess");
        assert!(matches!(
            req.into_msg(3).to_key(),
            Err(DataManagerError::BadRemoveProof { .. })
        ));
    }
}
