//! The storage collaborator.
//!
//! A node persists tuples through a [Store]. The data manager is the only
//! writer; it awaits each call before issuing the next, so implementations
//! need not order concurrent writes.

use crate::{BambooResult, Guid, GuidRange, Key, Timestamp};
use futures::future::BoxFuture;
use std::sync::Arc;

/// Result of a [Store::put].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PutOutcome {
    /// Did the store keep the new tuple?
    pub stored: bool,
    /// A tuple that stopped being visible because of this put. Either an
    /// older tuple that was replaced, or the new tuple itself if it lost
    /// the conflict. Merkle trees covering it must be invalidated.
    pub invalidated: Option<Key>,
}

/// Durable tuple storage.
///
/// Every tuple is visible until its expiry. Tuples whose guid falls
/// outside the current responsible range are additionally listed in a
/// "recycle" index, from which the discard process re-homes them.
pub trait Store: 'static + Send + Sync + std::fmt::Debug {
    /// Store a tuple, resolving conflicts with tuples that share its
    /// `(guid, secret_hash, data_hash)`.
    fn put(
        &self,
        key: Key,
        value: bytes::Bytes,
    ) -> BoxFuture<'_, BambooResult<PutOutcome>>;

    /// Fetch the value of an unexpired tuple.
    fn get(
        &self,
        key: Key,
        now: Timestamp,
    ) -> BoxFuture<'_, BambooResult<Option<bytes::Bytes>>>;

    /// List unexpired keys with `low_usec <= time_usec < high_usec` whose
    /// guid lies in `range`, in key order. At most `limit` keys are
    /// returned.
    fn scan_by_time(
        &self,
        low_usec: i64,
        high_usec: i64,
        range: GuidRange,
        limit: usize,
        now: Timestamp,
    ) -> BoxFuture<'_, BambooResult<Vec<Key>>>;

    /// Set the range this node is responsible for. Tuples outside it are
    /// listed in the recycle index, tuples inside it are removed from it.
    fn set_responsible_range(
        &self,
        range: GuidRange,
    ) -> BoxFuture<'_, BambooResult<()>>;

    /// The first recycled tuple whose guid is at or after `from`, not
    /// wrapping.
    fn first_recycled(
        &self,
        from: Guid,
    ) -> BoxFuture<'_, BambooResult<Option<(Key, bytes::Bytes)>>>;

    /// Delete a tuple, typically one that has been re-homed.
    fn delete(&self, key: Key) -> BoxFuture<'_, BambooResult<()>>;
}

/// Trait-object [Store].
pub type DynStore = Arc<dyn Store>;
