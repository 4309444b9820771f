//! The in-memory store implementation.
//!
//! This is NOT a durable store. It is for testing and simulation, holding
//! every tuple in ordered maps behind a single lock.

use bamboo_api::*;
use bytes::Bytes;
use futures::future::BoxFuture;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::{IpAddr, Ipv6Addr};
use std::sync::Arc;
use tokio::sync::RwLock;

#[cfg(test)]
mod test;

/// Tuples sharing this triple are in conflict, at most one is kept.
type Identity = (Guid, Hash, Hash);

fn identity(key: &Key) -> Identity {
    (key.guid, key.secret_hash, key.data_hash)
}

/// The smallest key at `time_usec` with guid `guid`.
fn floor_key(time_usec: i64, guid: Guid) -> Key {
    Key {
        time_usec,
        ttl_sec: i32::MIN,
        guid,
        secret_hash: ZERO_HASH,
        data_hash: ZERO_HASH,
        is_put: false,
        client_id: IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    }
}

/// An in-memory [Store].
#[derive(Debug)]
pub struct MemStore {
    inner: RwLock<MemStoreInner>,
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemStore {
    /// Construct a new, empty store responsible for the whole ring.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(MemStoreInner {
                tuples: BTreeMap::new(),
                by_identity: HashMap::new(),
                resp: GuidRange::FULL,
                recycled: BTreeSet::new(),
            }),
        }
    }

    /// Construct a new store as a [DynStore].
    pub fn create() -> DynStore {
        let out: DynStore = Arc::new(Self::new());
        out
    }

    /// Every stored key, expired or not, in key order.
    pub async fn keys(&self) -> Vec<Key> {
        self.inner.read().await.tuples.keys().copied().collect()
    }

    /// Number of stored tuples, expired or not.
    pub async fn len(&self) -> usize {
        self.inner.read().await.tuples.len()
    }

    /// Is the store empty?
    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.tuples.is_empty()
    }

    /// Number of tuples in the recycle index.
    pub async fn recycled_len(&self) -> usize {
        self.inner.read().await.recycled.len()
    }
}

#[derive(Debug)]
struct MemStoreInner {
    tuples: BTreeMap<Key, Bytes>,
    by_identity: HashMap<Identity, Key>,
    resp: GuidRange,
    recycled: BTreeSet<(Guid, Key)>,
}

impl MemStoreInner {
    fn insert(&mut self, key: Key, value: Bytes) {
        if !self.resp.contains(&key.guid) {
            self.recycled.insert((key.guid, key));
        }
        self.by_identity.insert(identity(&key), key);
        self.tuples.insert(key, value);
    }

    fn remove(&mut self, key: &Key) -> Option<Bytes> {
        let value = self.tuples.remove(key)?;
        let id = identity(key);
        if self.by_identity.get(&id) == Some(key) {
            self.by_identity.remove(&id);
        }
        self.recycled.remove(&(key.guid, *key));
        Some(value)
    }

    fn put(&mut self, key: Key, value: Bytes) -> PutOutcome {
        let Some(existing) = self.by_identity.get(&identity(&key)).copied()
        else {
            tracing::trace!(%key, "stored");
            self.insert(key, value);
            return PutOutcome {
                stored: true,
                invalidated: None,
            };
        };

        if existing == key {
            return PutOutcome {
                stored: true,
                invalidated: None,
            };
        }

        let replace = match (key.is_put, existing.is_put) {
            // the later expiry wins
            (true, true) | (false, false) => {
                key.expiry_usec() > existing.expiry_usec()
            }
            // an existing remove suppresses the put
            (true, false) => false,
            // a remove deletes the put
            (false, true) => true,
        };

        if replace {
            tracing::trace!(%key, %existing, "replaced");
            self.remove(&existing);
            self.insert(key, value);
            PutOutcome {
                stored: true,
                invalidated: Some(existing),
            }
        } else {
            tracing::trace!(%key, %existing, "lost conflict");
            PutOutcome {
                stored: false,
                invalidated: Some(key),
            }
        }
    }
}

impl Store for MemStore {
    fn put(
        &self,
        key: Key,
        value: Bytes,
    ) -> BoxFuture<'_, BambooResult<PutOutcome>> {
        Box::pin(async move { Ok(self.inner.write().await.put(key, value)) })
    }

    fn get(
        &self,
        key: Key,
        now: Timestamp,
    ) -> BoxFuture<'_, BambooResult<Option<Bytes>>> {
        Box::pin(async move {
            if key.is_expired(now) {
                return Ok(None);
            }
            Ok(self.inner.read().await.tuples.get(&key).cloned())
        })
    }

    fn scan_by_time(
        &self,
        low_usec: i64,
        high_usec: i64,
        range: GuidRange,
        limit: usize,
        now: Timestamp,
    ) -> BoxFuture<'_, BambooResult<Vec<Key>>> {
        Box::pin(async move {
            let lock = self.inner.read().await;
            Ok(lock
                .tuples
                .range(floor_key(low_usec, Guid::MIN)..)
                .map(|(k, _)| k)
                .take_while(|k| k.time_usec < high_usec)
                .filter(|k| range.contains(&k.guid) && !k.is_expired(now))
                .take(limit)
                .copied()
                .collect())
        })
    }

    fn set_responsible_range(
        &self,
        range: GuidRange,
    ) -> BoxFuture<'_, BambooResult<()>> {
        Box::pin(async move {
            let mut lock = self.inner.write().await;
            lock.resp = range;
            let recycled = lock
                .tuples
                .keys()
                .filter(|k| !range.contains(&k.guid))
                .map(|k| (k.guid, *k))
                .collect();
            lock.recycled = recycled;
            tracing::debug!(
                %range,
                recycled = lock.recycled.len(),
                "responsible range set"
            );
            Ok(())
        })
    }

    fn first_recycled(
        &self,
        from: Guid,
    ) -> BoxFuture<'_, BambooResult<Option<(Key, Bytes)>>> {
        Box::pin(async move {
            let now = Timestamp::now();
            let lock = self.inner.read().await;
            Ok(lock
                .recycled
                .range((from, floor_key(i64::MIN, from))..)
                .map(|(_, k)| k)
                .find(|k| !k.is_expired(now))
                .and_then(|k| {
                    lock.tuples.get(k).map(|v| (*k, v.clone()))
                }))
        })
    }

    fn delete(&self, key: Key) -> BoxFuture<'_, BambooResult<()>> {
        Box::pin(async move {
            if self.inner.write().await.remove(&key).is_some() {
                tracing::trace!(%key, "deleted");
            }
            Ok(())
        })
    }
}
