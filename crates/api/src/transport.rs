//! The transport collaborator.
//!
//! A [Transport] delivers opaque datagrams to peers. Reliable sends report
//! their outcome through a [SendTicket]; unreliable sends report nothing.

use crate::*;
use std::net::SocketAddr;
use std::sync::Arc;

/// Identifies a reliable send so that it can be cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SendToken(pub u64);

/// Handle to an in-progress reliable send.
#[derive(Debug)]
pub struct SendTicket {
    /// Pass this to [Transport::cancel_send].
    pub token: SendToken,

    /// Resolves `true` when the peer acknowledged the message and `false`
    /// when the send timed out. Dropped without a value if the send was
    /// cancelled or the transport shut down.
    pub result: tokio::sync::oneshot::Receiver<bool>,
}

impl SendTicket {
    /// Wait for the outcome. Cancellation and shutdown count as failure.
    pub async fn outcome(self) -> bool {
        self.result.await.unwrap_or(false)
    }
}

/// Per-delivery metadata reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecvMeta {
    /// Which attempt of the sender delivered this message, 1 for the first
    /// transmission and 0 for unacknowledged sends.
    pub tries: u32,
    /// How long the message waited at the sender before this attempt.
    pub wait_ms: i32,
    /// The sender's smoothed rtt estimate towards us.
    pub est_rtt_ms: i32,
}

/// Receives inbound messages. Called from the transport task, so
/// implementations must hand work off rather than block.
pub trait RecvHandler: 'static + Send + Sync + std::fmt::Debug {
    /// A message arrived from `peer`.
    fn recv(&self, peer: SocketAddr, data: bytes::Bytes, meta: RecvMeta);
}

/// Trait-object [RecvHandler].
pub type DynRecvHandler = Arc<dyn RecvHandler>;

/// A datagram transport.
pub trait Transport: 'static + Send + Sync + std::fmt::Debug {
    /// The address peers reach this node at.
    fn local_addr(&self) -> SocketAddr;

    /// Send `data` reliably, giving up after `timeout`.
    fn send(
        &self,
        peer: SocketAddr,
        data: bytes::Bytes,
        timeout: std::time::Duration,
    ) -> BambooResult<SendTicket>;

    /// Send `data` once with no acknowledgement and no completion.
    fn send_nocc(&self, peer: SocketAddr, data: bytes::Bytes)
        -> BambooResult<()>;

    /// Suppress the completion of a reliable send. Best effort: a message
    /// already on the wire may still be delivered.
    fn cancel_send(&self, token: SendToken);

    /// Install the handler for inbound messages, replacing any previous
    /// one. Messages arriving with no handler installed are dropped.
    fn register_handler(&self, handler: DynRecvHandler);
}

/// Trait-object [Transport].
pub type DynTransport = Arc<dyn Transport>;
