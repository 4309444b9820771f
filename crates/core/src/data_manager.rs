//! The data manager is the storage side of a bamboo node.
//!
//! It consists of:
//! - Replication: puts and removes entered locally are stored and
//!   forwarded to the leaf set, and complete once enough replicas ack.
//! - Anti-entropy: once per period (plus jitter) the node compares one
//!   Merkle tree with a random neighbour and fetches what it lacks. It
//!   also answers the same requests from its neighbours.
//! - Discard: tuples outside this node's responsibility are handed to a
//!   replica of their guid and deleted once that replica acks.
//!
//! ### One task
//!
//! All protocol state lives in a single task. The [DataManager] handle,
//! the transport receive handler and background router lookups talk to
//! it over one command channel. Alarms are deadlines polled by the same
//! `select!` loop, so there is never more than one piece of code touching
//! the trees, the ack table or the anti-entropy session.
//!
//! ### Trees
//!
//! Merkle trees are filled lazily. Anything that needs an up to date tree
//! parks a continuation on it, and after every command the task fills
//! each tree with parked work and dispatches the continuations.

use crate::anti_entropy::{AeReport, AeSession};
use crate::config::*;
use crate::constant::*;
use crate::discard::DiscardState;
use crate::error::*;
use crate::neighbourhood::Neighbourhood;
use crate::protocol::*;
use crate::replication::{PutOrRemoveDone, PutOrRemoveReq, PutOrRemoveState};
use crate::synced::SyncedTable;
use crate::tree_state::{Resuming, TreeRegistry};
use bamboo_api::*;
use bytes::Bytes;
use rand::Rng;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

struct DropAbortHandle {
    name: String,
    handle: tokio::task::AbortHandle,
}

impl Drop for DropAbortHandle {
    fn drop(&mut self) {
        tracing::info!("Aborting: {}", self.name);
        self.handle.abort();
    }
}

pub(crate) enum Command {
    Recv {
        peer: SocketAddr,
        data: Bytes,
    },
    PutOrRemove {
        req: PutOrRemoveReq,
        done: oneshot::Sender<DataManagerResult<PutOrRemoveDone>>,
    },
    LeafSetChanged(LeafSet),
    ReplicaSetFor {
        guid: Guid,
        reply: oneshot::Sender<Vec<SocketAddr>>,
    },
    Synced {
        guid: Guid,
        peer: Option<SocketAddr>,
        reply: oneshot::Sender<bool>,
    },
    LastAeReport {
        reply: oneshot::Sender<Option<AeReport>>,
    },
    PendingPuts {
        reply: oneshot::Sender<usize>,
    },
    StartDiscard,
    ReplicaSet {
        nonce: u64,
        result: BambooResult<ReplicaSet>,
    },
}

/// Hands inbound messages to the data manager task.
#[derive(Debug)]
struct DmRecv(mpsc::UnboundedSender<Command>);

impl RecvHandler for DmRecv {
    fn recv(&self, peer: SocketAddr, data: Bytes, _meta: RecvMeta) {
        if self.0.send(Command::Recv { peer, data }).is_err() {
            tracing::trace!(%peer, "data manager closed, dropping message");
        }
    }
}

/// Handle to a running data manager.
///
/// Dropping the handle stops the data manager task.
pub struct DataManager {
    me: NeighborInfo,
    cmd_send: mpsc::UnboundedSender<Command>,
    _task: DropAbortHandle,
}

impl std::fmt::Debug for DataManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataManager").field("me", &self.me).finish()
    }
}

impl DataManager {
    /// Start a data manager for the node at `guid`.
    ///
    /// The node starts alone on the ring; call
    /// [DataManager::leaf_set_changed] once the overlay knows its
    /// neighbours. The data manager installs itself as the transport's
    /// receive handler. Must be called from within a tokio runtime.
    pub fn create(
        config: DataManagerConfig,
        guid: Guid,
        store: DynStore,
        transport: DynTransport,
        router: DynRouter,
    ) -> DataManagerResult<Arc<Self>> {
        config.validate()?;
        let me = NeighborInfo::new(transport.local_addr(), guid);
        let (cmd_send, cmd_recv) = mpsc::unbounded_channel();
        transport.register_handler(Arc::new(DmRecv(cmd_send.clone())));

        let now = Instant::now();
        let mut rng = rand::thread_rng();
        let ae_at = now + jitter(&mut rng, config.ae_period(), config.ae_period());
        let sweep_at = now + jitter(&mut rng, ACK_SWEEP_PERIOD, ACK_SWEEP_JITTER);
        let discard_at = now + jitter(&mut rng, DISCARD_PERIOD, DISCARD_PERIOD);

        let actor = Actor {
            trees: TreeRegistry::new(config.merkle_tree_expansion),
            config,
            me,
            store,
            transport,
            router,
            cmd_send: cmd_send.downgrade(),
            hood: Neighbourhood::alone(me),
            synced: SyncedTable::default(),
            next_seq: rng.gen::<u32>() as u64,
            pending: HashMap::new(),
            ae: None,
            next_session: 1,
            last_report: None,
            discard: None,
            ae_at,
            sweep_at,
            discard_at,
        };

        let handle = tokio::task::spawn(actor.run(cmd_recv)).abort_handle();
        tracing::info!(%me, "data manager started");

        Ok(Arc::new(Self {
            me,
            cmd_send,
            _task: DropAbortHandle {
                name: format!("data manager {me}"),
                handle,
            },
        }))
    }

    /// This node's ring position.
    pub fn guid(&self) -> Guid {
        self.me.guid
    }

    /// The transport address of this node.
    pub fn local_addr(&self) -> SocketAddr {
        self.me.addr
    }

    fn send_cmd(&self, cmd: Command) -> DataManagerResult<()> {
        self.cmd_send
            .send(cmd)
            .map_err(|_| DataManagerError::Closed)
    }

    async fn ask<T>(
        &self,
        f: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> DataManagerResult<T> {
        let (s, r) = oneshot::channel();
        self.send_cmd(f(s))?;
        r.await.map_err(|_| DataManagerError::Closed)
    }

    /// Store a put or remove entered at this node and replicate it.
    ///
    /// Resolves once the tuple is stored locally and enough replicas have
    /// acked, or once the node gives up waiting for them. A remove whose
    /// secret does not match its secret hash fails with
    /// [DataManagerError::BadRemoveProof].
    pub async fn put_or_remove(
        &self,
        req: PutOrRemoveReq,
    ) -> DataManagerResult<PutOrRemoveDone> {
        self.ask(|done| Command::PutOrRemove { req, done }).await?
    }

    /// The overlay reports a new leaf set.
    pub fn leaf_set_changed(&self, leaf_set: LeafSet) -> DataManagerResult<()> {
        self.send_cmd(Command::LeafSetChanged(leaf_set))
    }

    /// The replicas of `guid` as seen from this node, this node included.
    /// A router answering replica-set queries for this node calls this.
    pub async fn replica_set_for(
        &self,
        guid: Guid,
    ) -> DataManagerResult<Vec<SocketAddr>> {
        self.ask(|reply| Command::ReplicaSetFor { guid, reply }).await
    }

    /// Is the range holding `guid` synced with enough neighbours?
    pub async fn synced(&self, guid: Guid) -> DataManagerResult<bool> {
        self.ask(|reply| Command::Synced {
            guid,
            peer: None,
            reply,
        })
        .await
    }

    /// Is the range holding `guid` synced with `peer`?
    pub async fn synced_with(
        &self,
        guid: Guid,
        peer: SocketAddr,
    ) -> DataManagerResult<bool> {
        self.ask(|reply| Command::Synced {
            guid,
            peer: Some(peer),
            reply,
        })
        .await
    }

    /// Report of the last finished anti-entropy session.
    pub async fn last_ae_report(&self) -> DataManagerResult<Option<AeReport>> {
        self.ask(|reply| Command::LastAeReport { reply }).await
    }

    /// Puts and removes still waiting for replica acks.
    pub async fn pending_puts(&self) -> DataManagerResult<usize> {
        self.ask(|reply| Command::PendingPuts { reply }).await
    }

    /// Look for a tuple to re-home now rather than at the next alarm.
    pub fn start_discard(&self) -> DataManagerResult<()> {
        self.send_cmd(Command::StartDiscard)
    }
}

/// A random delay in `[base, base + spread)`.
pub(crate) fn jitter<R: Rng + ?Sized>(
    rng: &mut R,
    base: Duration,
    spread: Duration,
) -> Duration {
    let spread_ms = spread.as_millis() as u64;
    if spread_ms == 0 {
        return base;
    }
    base + Duration::from_millis(rng.gen_range(0..spread_ms))
}

/// The state owned by the data manager task.
pub(crate) struct Actor {
    pub config: DataManagerConfig,
    pub me: NeighborInfo,
    pub store: DynStore,
    pub transport: DynTransport,
    pub router: DynRouter,
    pub cmd_send: mpsc::WeakUnboundedSender<Command>,
    pub hood: Neighbourhood,
    pub trees: TreeRegistry,
    pub synced: SyncedTable,
    pub next_seq: u64,
    /// Puts and removes entered here, by sequence number.
    pub pending: HashMap<u64, PutOrRemoveState>,
    pub ae: Option<AeSession>,
    pub next_session: u64,
    pub last_report: Option<AeReport>,
    pub discard: Option<DiscardState>,
    ae_at: Instant,
    sweep_at: Instant,
    discard_at: Instant,
}

impl Actor {
    async fn run(mut self, mut cmd_recv: mpsc::UnboundedReceiver<Command>) {
        loop {
            let next = self.ae_at.min(self.sweep_at).min(self.discard_at);
            tokio::select! {
                cmd = cmd_recv.recv() => match cmd {
                    Some(cmd) => self.command(cmd).await,
                    None => break,
                },
                _ = tokio::time::sleep_until(next) => self.alarms().await,
            }
            self.drive_trees().await;
        }
        tracing::debug!(me = %self.me, "data manager task ended");
    }

    async fn command(&mut self, cmd: Command) {
        match cmd {
            Command::Recv { peer, data } => self.recv(peer, data).await,
            Command::PutOrRemove { req, done } => {
                self.put_or_remove_local(req, done).await
            }
            Command::LeafSetChanged(leaf_set) => {
                self.leaf_set_changed(leaf_set).await
            }
            Command::ReplicaSetFor { guid, reply } => {
                let _ = reply.send(self.hood.replica_set_for(&guid));
            }
            Command::Synced { guid, peer, reply } => {
                let now = Instant::now();
                let out = match peer {
                    Some(peer) => self.synced.synced_with(&guid, &peer, now),
                    None => {
                        self.hood.is_alone()
                            || self.synced.synced_count(&guid, now)
                                > self.hood.preds().len()
                    }
                };
                let _ = reply.send(out);
            }
            Command::LastAeReport { reply } => {
                let _ = reply.send(self.last_report.clone());
            }
            Command::PendingPuts { reply } => {
                let _ = reply.send(self.pending.len());
            }
            Command::StartDiscard => {
                if self.discard.is_none() {
                    self.start_discard().await;
                }
            }
            Command::ReplicaSet { nonce, result } => {
                self.on_replica_set(nonce, result)
            }
        }
    }

    async fn alarms(&mut self) {
        let now = Instant::now();
        if now >= self.ae_at {
            let period = self.config.ae_period();
            self.ae_at = now + jitter(&mut rand::thread_rng(), period, period);
            self.ae_alarm(now);
        }
        if now >= self.sweep_at {
            self.sweep_at = now
                + jitter(
                    &mut rand::thread_rng(),
                    ACK_SWEEP_PERIOD,
                    ACK_SWEEP_JITTER,
                );
            self.ack_sweep(now);
        }
        if now >= self.discard_at {
            self.discard_at = now
                + jitter(&mut rand::thread_rng(), DISCARD_PERIOD, DISCARD_PERIOD);
            self.discard_alarm(now).await;
        }
    }

    async fn recv(&mut self, peer: SocketAddr, data: Bytes) {
        let msg = match DmMessage::decode(data) {
            Ok(msg) => msg,
            Err(err) => {
                tracing::debug!(%peer, ?err, "dropping undecodable message");
                return;
            }
        };
        tracing::trace!(%peer, msg = msg.name(), "recv");
        match msg {
            DmMessage::PutOrRemove(msg) => {
                self.put_or_remove_remote(peer, msg).await
            }
            DmMessage::PutOrRemoveAck(ack) => self.put_or_remove_ack(peer, ack).await,
            DmMessage::FetchNodeReq(req) => self.fetch_node_req(peer, req),
            DmMessage::FetchNodeResp(resp) => self.ae_node_resp(peer, resp),
            DmMessage::FetchNodeReject(rej) => self.ae_node_reject(peer, rej),
            DmMessage::FetchKeysReq(req) => self.fetch_keys_req(peer, req).await,
            DmMessage::FetchKeysResp(resp) => self.ae_keys_resp(peer, resp).await,
            DmMessage::FetchDataReq(req) => self.fetch_data_req(peer, req).await,
            DmMessage::FetchDataResp(resp) => self.ae_data_resp(peer, resp).await,
        }
    }

    /// Fill every tree with parked work and resume what was waiting on it.
    async fn drive_trees(&mut self) {
        while let Some(range) = self.trees.next_pending() {
            if let Err(err) = self.trees.fill(range, &*self.store).await {
                let dropped = self.trees.take_waiters(&range).len();
                tracing::warn!(%range, ?err, dropped, "failed to fill merkle tree");
                continue;
            }
            for resuming in self.trees.take_waiters(&range) {
                self.on_tree_ready(range, resuming);
            }
        }
    }

    fn on_tree_ready(&mut self, range: GuidRange, resuming: Resuming) {
        tracing::trace!(%range, ?resuming, "tree ready");
        match resuming {
            Resuming::AeTreeReady { session } => self.ae_send_node_req(session),
            Resuming::AeNodeResp { session, resp } => {
                self.ae_compare(session, resp)
            }
            Resuming::AeNextNode { session } => {
                if self.ae.as_ref().is_some_and(|s| s.id == session) {
                    self.ae_next_node();
                }
            }
            Resuming::FetchNodeReq { peer, req } => {
                self.answer_node_req(peer, req)
            }
        }
    }

    async fn leaf_set_changed(&mut self, leaf_set: LeafSet) {
        let hood = Neighbourhood::new(self.me, &leaf_set, self.config.per_side());
        if hood == self.hood {
            return;
        }
        if hood.is_alone() {
            self.trees.clear();
            self.synced.clear();
        } else {
            self.trees.retain(hood.db_ranges());
            self.synced.retain_ranges(hood.db_ranges());
        }
        self.hood = hood;
        self.ae_leaf_set_changed();
        tracing::info!(
            me = %self.me,
            preds = self.hood.preds().len(),
            succs = self.hood.succs().len(),
            resp = %self.hood.responsibility(),
            "leaf set changed"
        );
        if let Err(err) = self
            .store
            .set_responsible_range(self.hood.responsibility())
            .await
        {
            tracing::warn!(?err, "failed to set responsible range");
        }
    }

    pub fn next_seq(&mut self) -> u64 {
        let out = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        out
    }

    /// Send a message reliably. Failures are not reported back; every
    /// caller recovers through its own timeout.
    pub fn send(&self, peer: SocketAddr, msg: DmMessage) {
        let name = msg.name();
        match self.transport.send(peer, msg.encode(), MESSAGE_TIMEOUT) {
            Ok(_) => tracing::trace!(%peer, msg = name, "sent"),
            Err(err) => {
                tracing::warn!(%peer, msg = name, ?err, "failed to send")
            }
        }
    }

    /// Store a tuple, invalidating every tree path it touches.
    pub async fn db_put(
        &mut self,
        key: Key,
        value: Bytes,
    ) -> BambooResult<PutOutcome> {
        self.trees.invalidate(&key.guid, key.time_usec);
        let out = self.store.put(key, value).await?;
        if let Some(inval) = out.invalidated {
            self.trees.invalidate(&inval.guid, inval.time_usec);
        }
        Ok(out)
    }
}
