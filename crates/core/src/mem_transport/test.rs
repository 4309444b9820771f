use super::*;
use tokio::sync::mpsc;

#[derive(Debug)]
struct Collect(mpsc::UnboundedSender<(SocketAddr, Bytes)>);

impl RecvHandler for Collect {
    fn recv(&self, peer: SocketAddr, data: Bytes, _meta: RecvMeta) {
        let _ = self.0.send((peer, data));
    }
}

fn collect(t: &MemTransport) -> mpsc::UnboundedReceiver<(SocketAddr, Bytes)> {
    let (s, r) = mpsc::unbounded_channel();
    t.register_handler(Arc::new(Collect(s)));
    r
}

#[tokio::test(start_paused = true)]
async fn deliver_and_ack() {
    let net = MemNetwork::create();
    let a = net.transport();
    let b = net.transport();
    assert_ne!(a.local_addr(), b.local_addr());
    let mut b_recv = collect(&b);

    let ticket = a
        .send(b.local_addr(), Bytes::from_static(b"hello"), Duration::from_secs(5))
        .unwrap();
    assert!(ticket.outcome().await);
    let (from, data) = b_recv.recv().await.unwrap();
    assert_eq!(a.local_addr(), from);
    assert_eq!(&b"hello"[..], &data[..]);

    a.send_nocc(b.local_addr(), Bytes::from_static(b"nocc")).unwrap();
    assert_eq!(&b"nocc"[..], &b_recv.recv().await.unwrap().1[..]);
}

#[tokio::test(start_paused = true)]
async fn unreachable_peer_fails_after_timeout() {
    let net = MemNetwork::create();
    let a = net.transport();
    let b = net.transport();
    let _b_recv = collect(&b);
    net.set_unreachable(b.local_addr(), true);

    let start = tokio::time::Instant::now();
    let ticket = a
        .send(b.local_addr(), Bytes::from_static(b"x"), Duration::from_secs(5))
        .unwrap();
    assert!(!ticket.outcome().await);
    assert!(start.elapsed() >= Duration::from_secs(5));

    net.set_unreachable(b.local_addr(), false);
    let ticket = a
        .send(b.local_addr(), Bytes::from_static(b"x"), Duration::from_secs(5))
        .unwrap();
    assert!(ticket.outcome().await);
}

#[tokio::test(start_paused = true)]
async fn cancel_suppresses_completion() {
    let net = MemNetwork::create();
    let a = net.transport();
    let b = net.transport();
    let addr = b.local_addr();
    drop(b);

    let ticket = a
        .send(addr, Bytes::from_static(b"x"), Duration::from_secs(5))
        .unwrap();
    a.cancel_send(ticket.token);
    assert!(ticket.result.await.is_err());
}
