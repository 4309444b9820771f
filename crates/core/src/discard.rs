//! Re-homing tuples this node is no longer responsible for.
//!
//! One tuple at a time is taken from the store's recycle index, starting
//! at a random guid. The router is asked for the replicas of its guid, the
//! tuple is sent to one of them under a fresh nonce, and the local copy is
//! deleted only once that replica acks the nonce. An attempt that sees no
//! ack in time is dropped and the tuple kept.

use crate::constant::*;
use crate::data_manager::{Actor, Command};
use crate::protocol::*;
use bamboo_api::*;
use bytes::Bytes;
use rand::Rng;
use std::net::SocketAddr;
use tokio::time::Instant;

#[derive(Debug)]
pub(crate) struct DiscardState {
    nonce: u64,
    key: Key,
    value: Bytes,
    deadline: Instant,
    sent_to: Option<SocketAddr>,
}

impl Actor {
    pub(crate) async fn discard_alarm(&mut self, now: Instant) {
        if let Some(ds) = &self.discard {
            if now < ds.deadline {
                return;
            }
            tracing::info!(key = %ds.key, "discard timed out, keeping tuple");
            self.discard = None;
        }
        self.start_discard().await;
    }

    async fn first_recycled(&self) -> Option<(Key, Bytes)> {
        let from = Guid::random(&mut rand::thread_rng());
        let found = match self.store.first_recycled(from).await {
            Ok(None) if from != Guid::MIN => {
                self.store.first_recycled(Guid::MIN).await
            }
            found => found,
        };
        match found {
            Ok(found) => found,
            Err(err) => {
                tracing::warn!(?err, "recycle scan failed");
                None
            }
        }
    }

    pub(crate) async fn start_discard(&mut self) {
        let Some((key, value)) = self.first_recycled().await else {
            tracing::trace!("nothing to discard");
            return;
        };
        let nonce = self.next_seq();
        tracing::debug!(%key, nonce, "discarding");
        self.discard = Some(DiscardState {
            nonce,
            key,
            value,
            deadline: Instant::now() + DISCARD_TIMEOUT,
            sent_to: None,
        });

        let router = self.router.clone();
        let cmd_send = self.cmd_send.clone();
        let iterative = self.config.iterative_routing;
        tokio::task::spawn(async move {
            let result = router.replica_set(key.guid, nonce, iterative).await;
            if let Some(cmd_send) = cmd_send.upgrade() {
                let _ = cmd_send.send(Command::ReplicaSet { nonce, result });
            }
        });
    }

    pub(crate) fn on_replica_set(
        &mut self,
        nonce: u64,
        result: BambooResult<ReplicaSet>,
    ) {
        let me = self.me.addr;
        let Some(ds) = self.discard.as_mut().filter(|ds| ds.nonce == nonce)
        else {
            tracing::debug!(nonce, "stale replica set");
            return;
        };
        let members: Vec<SocketAddr> = match result {
            Ok(rs) if rs.nonce == nonce => {
                rs.members.into_iter().filter(|m| *m != me).collect()
            }
            Ok(rs) => {
                tracing::debug!(nonce, got = rs.nonce, "replica set nonce mismatch");
                return;
            }
            Err(err) => {
                tracing::debug!(key = %ds.key, ?err, "replica set lookup failed");
                self.discard = None;
                return;
            }
        };
        if members.is_empty() {
            tracing::debug!(key = %ds.key, "no other replica to discard to");
            self.discard = None;
            return;
        }

        let peer = members[rand::thread_rng().gen_range(0..members.len())];
        ds.sent_to = Some(peer);
        let msg = PutOrRemoveMsg::from_key(&ds.key, ds.value.clone(), nonce);
        tracing::debug!(key = %ds.key, %peer, "handing tuple to replica");
        self.send(peer, DmMessage::PutOrRemove(msg));
    }

    /// Returns true if the ack was for the tuple being discarded.
    pub(crate) async fn discard_acked(&mut self, peer: SocketAddr, seq: u64) -> bool {
        let Some(ds) = self.discard.as_ref() else {
            return false;
        };
        if ds.nonce != seq {
            return false;
        }
        if ds.sent_to != Some(peer) {
            tracing::debug!(%peer, seq, "discard ack from unexpected peer");
            return true;
        }
        let key = ds.key;
        self.discard = None;
        tracing::info!(%key, %peer, "re-homed tuple");
        self.trees.invalidate(&key.guid, key.time_usec);
        if let Err(err) = self.store.delete(key).await {
            tracing::warn!(%key, ?err, "failed to delete re-homed tuple");
        }
        self.start_discard().await;
        true
    }
}
