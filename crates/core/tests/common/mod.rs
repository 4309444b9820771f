#![allow(dead_code)]

use bamboo_api::*;
use bamboo_core::*;
use futures::future::BoxFuture;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Enable tracing with the RUST_LOG environment variable.
///
/// This is intended to be used in tests, so it defaults to DEBUG level.
pub fn enable_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(tracing::Level::DEBUG.into())
                .from_env_lossy(),
        )
        .try_init();
}

/// Answers every replica-set query with the same members.
#[derive(Debug, Default)]
pub struct FixedRouter(pub Mutex<Vec<SocketAddr>>);

impl Router for FixedRouter {
    fn replica_set(
        &self,
        _guid: Guid,
        nonce: u64,
        _iterative: bool,
    ) -> BoxFuture<'_, BambooResult<ReplicaSet>> {
        Box::pin(async move {
            let members = self.0.lock().unwrap().clone();
            if members.is_empty() {
                return Err(BambooError::other("no route"));
            }
            Ok(ReplicaSet { nonce, members })
        })
    }
}

pub struct TestNode {
    pub dm: Arc<DataManager>,
    pub store: Arc<MemStore>,
    pub transport: Arc<MemTransport>,
    pub router: Arc<FixedRouter>,
}

impl TestNode {
    pub fn new(net: &Arc<MemNetwork>, pos: u64, config: DataManagerConfig) -> Self {
        let store = Arc::new(MemStore::new());
        let transport = net.transport();
        let router = Arc::new(FixedRouter::default());
        let dm = DataManager::create(
            config,
            Guid::from_high_u64(pos),
            store.clone(),
            transport.clone(),
            router.clone(),
        )
        .unwrap();
        Self {
            dm,
            store,
            transport,
            router,
        }
    }

    pub fn info(&self) -> NeighborInfo {
        NeighborInfo::new(self.dm.local_addr(), self.dm.guid())
    }

    pub fn addr(&self) -> SocketAddr {
        self.dm.local_addr()
    }
}

pub fn config(desired_replicas: u32) -> DataManagerConfig {
    DataManagerConfig {
        desired_replicas,
        ..Default::default()
    }
}

/// A put created now with a day to live.
pub fn put(pos: u64, value: &'static [u8]) -> PutOrRemoveReq {
    PutOrRemoveReq::put(
        Guid::from_high_u64(pos),
        bytes::Bytes::from_static(value),
        86_400,
        ZERO_HASH,
        [10, 0, 0, 1].into(),
    )
}

/// A put tuple `age_secs` old, ready to seed a store with.
pub fn tuple(pos: u64, value: Vec<u8>, age_secs: i64) -> (Key, bytes::Bytes) {
    let key = Key {
        time_usec: Timestamp::now().as_micros() - age_secs * 1_000_000,
        ttl_sec: 86_400,
        guid: Guid::from_high_u64(pos),
        secret_hash: ZERO_HASH,
        data_hash: bamboo_dht::sha1(&value),
        is_put: true,
        client_id: [10, 0, 0, 1].into(),
    };
    (key, value.into())
}

/// Store tuples directly, bypassing replication.
pub async fn seed(store: &MemStore, tuples: &[(Key, bytes::Bytes)]) {
    for (key, value) in tuples {
        store.put(*key, value.clone()).await.unwrap();
    }
}

/// Poll `check` once a second until it holds, failing after `secs`.
pub async fn wait_for<F, Fut>(secs: u64, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..secs {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    panic!("condition not met within {secs}s");
}

#[derive(Debug)]
struct Collect(tokio::sync::mpsc::UnboundedSender<(SocketAddr, protocol::DmMessage)>);

impl RecvHandler for Collect {
    fn recv(&self, peer: SocketAddr, data: bytes::Bytes, _meta: RecvMeta) {
        if let Ok(msg) = protocol::DmMessage::decode(data) {
            let _ = self.0.send((peer, msg));
        }
    }
}

/// A peer speaking the wire protocol by hand.
pub struct RawPeer {
    pub transport: Arc<MemTransport>,
    pub guid: Guid,
    recv: tokio::sync::mpsc::UnboundedReceiver<(SocketAddr, protocol::DmMessage)>,
}

impl RawPeer {
    pub fn new(net: &Arc<MemNetwork>, pos: u64) -> Self {
        let transport = net.transport();
        let (s, recv) = tokio::sync::mpsc::unbounded_channel();
        transport.register_handler(Arc::new(Collect(s)));
        Self {
            transport,
            guid: Guid::from_high_u64(pos),
            recv,
        }
    }

    pub fn info(&self) -> NeighborInfo {
        NeighborInfo::new(self.transport.local_addr(), self.guid)
    }

    pub fn send(&self, to: SocketAddr, msg: protocol::DmMessage) {
        self.transport
            .send(to, msg.encode(), Duration::from_secs(10))
            .unwrap();
    }

    /// The next message `f` accepts, skipping the rest.
    pub async fn expect<T>(
        &mut self,
        f: impl Fn(SocketAddr, protocol::DmMessage) -> Option<T>,
    ) -> T {
        tokio::time::timeout(Duration::from_secs(30), async {
            loop {
                let (peer, msg) = self.recv.recv().await.unwrap();
                if let Some(out) = f(peer, msg) {
                    return out;
                }
            }
        })
        .await
        .expect("no matching message")
    }
}
