//! The routing collaborator.

use crate::*;
use futures::future::BoxFuture;
use std::net::SocketAddr;
use std::sync::Arc;

/// Overlay routing, used to find where a key belongs.
pub trait Router: 'static + Send + Sync + std::fmt::Debug {
    /// Route a replica-set query to the root of `guid` and return the
    /// members that node reports as the replicas for it. `nonce` is echoed
    /// by the responder so stale answers can be recognised.
    fn replica_set(
        &self,
        guid: Guid,
        nonce: u64,
        iterative: bool,
    ) -> BoxFuture<'_, BambooResult<ReplicaSet>>;
}

/// Trait-object [Router].
pub type DynRouter = Arc<dyn Router>;

/// Answer to a replica-set query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaSet {
    /// Echo of the query nonce.
    pub nonce: u64,
    /// The replica members, the responder included.
    pub members: Vec<SocketAddr>,
}
