//! The in-process transport implementation.
//!
//! This is NOT a production module. It is for testing only. It only
//! reaches other [MemTransport]s created from the same [MemNetwork].

use bamboo_api::*;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

#[cfg(test)]
mod test;

#[derive(Debug, Default)]
struct NetInner {
    next_port: u16,
    nodes: HashMap<SocketAddr, Weak<MemTransport>>,
    unreachable: HashSet<SocketAddr>,
}

/// A set of transports that can reach each other.
///
/// Networks are independent of each other; there is no process-wide
/// registry.
#[derive(Debug, Default)]
pub struct MemNetwork {
    inner: Mutex<NetInner>,
}

impl MemNetwork {
    /// Construct a new, empty network.
    pub fn create() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach a new transport with a fresh loopback address.
    pub fn transport(self: &Arc<Self>) -> Arc<MemTransport> {
        let mut lock = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        lock.next_port = lock.next_port.wrapping_add(1).max(1);
        let addr: SocketAddr = ([127, 0, 0, 1], lock.next_port).into();
        let out = Arc::new(MemTransport {
            addr,
            net: self.clone(),
            handler: Mutex::new(None),
            next_token: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
        });
        lock.nodes.insert(addr, Arc::downgrade(&out));
        tracing::debug!(%addr, "mem transport attached");
        out
    }

    /// Drop every message towards `addr` until reset. Reliable sends to
    /// it then fail once their timeout passes.
    pub fn set_unreachable(&self, addr: SocketAddr, unreachable: bool) {
        let mut lock = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if unreachable {
            lock.unreachable.insert(addr);
        } else {
            lock.unreachable.remove(&addr);
        }
    }

    fn lookup(&self, addr: &SocketAddr) -> Option<Arc<MemTransport>> {
        let mut lock = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if lock.unreachable.contains(addr) {
            return None;
        }
        let out = lock.nodes.get(addr).and_then(Weak::upgrade);
        if out.is_none() {
            lock.nodes.remove(addr);
        }
        out
    }
}

/// A [Transport] that hands messages straight to the peer's handler.
///
/// Delivery to a reachable peer succeeds immediately. Sends to an
/// unreachable or unknown peer report failure after their timeout, the
/// way a real transport gives up on retransmission.
#[derive(Debug)]
pub struct MemTransport {
    addr: SocketAddr,
    net: Arc<MemNetwork>,
    handler: Mutex<Option<DynRecvHandler>>,
    next_token: AtomicU64,
    pending: Mutex<HashMap<SendToken, tokio::task::AbortHandle>>,
}

impl MemTransport {
    fn deliver(&self, peer: &SocketAddr, data: Bytes, meta: RecvMeta) -> bool {
        let Some(to) = self.net.lookup(peer) else {
            return false;
        };
        let handler = to
            .handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match handler {
            Some(handler) => {
                handler.recv(self.addr, data, meta);
                true
            }
            None => {
                tracing::debug!(%peer, "no handler, dropping message");
                false
            }
        }
    }
}

impl Transport for MemTransport {
    fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    fn send(
        &self,
        peer: SocketAddr,
        data: Bytes,
        timeout: Duration,
    ) -> BambooResult<SendTicket> {
        let token = SendToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        let (done, result) = tokio::sync::oneshot::channel();

        let meta = RecvMeta {
            tries: 1,
            ..Default::default()
        };
        if self.deliver(&peer, data, meta) {
            let _ = done.send(true);
        } else {
            let handle = tokio::task::spawn(async move {
                tokio::time::sleep(timeout).await;
                let _ = done.send(false);
            })
            .abort_handle();
            let mut pending =
                self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            pending.retain(|_, h| !h.is_finished());
            pending.insert(token, handle);
        }

        Ok(SendTicket { token, result })
    }

    fn send_nocc(&self, peer: SocketAddr, data: Bytes) -> BambooResult<()> {
        self.deliver(&peer, data, RecvMeta::default());
        Ok(())
    }

    fn cancel_send(&self, token: SendToken) {
        if let Some(handle) = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&token)
        {
            handle.abort();
        }
    }

    fn register_handler(&self, handler: DynRecvHandler) {
        *self.handler.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(handler);
    }
}

impl Drop for MemTransport {
    fn drop(&mut self) {
        for (_, handle) in self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
        {
            handle.abort();
        }
    }
}
