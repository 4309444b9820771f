//! The protocol state machine, free of any I/O.
//!
//! The engine is fed inbound datagrams, timer expiries and application
//! sends, each stamped with the current instant, and is polled for
//! outbound datagrams. [crate::UdpCc] pumps it against a real socket; the
//! tests in this module pump it by hand.

use crate::connection::{Connection, PendingSend};
use crate::dup::RecentlySeen;
use crate::error::*;
use crate::frame::{Framer, Packet, MAX_MSG_SIZE};
use crate::priority_queue::PriorityQueue;
use bamboo_api::RecvMeta;
use bytes::Bytes;
use rand::Rng;
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// Attempts are carried in the low 7 bits of a sequence number.
const MAX_ATTEMPT: u8 = 0x7f;

/// How long a timed out attempt may still be matched by a late ack.
const SECOND_CHANCE_RETENTION: Duration = Duration::from_secs(60);

/// Synthetic loss compounds once per this many seconds of send timeout.
const DROP_STEP_SECS: f64 = 5.0;

/// Pause before retrying a datagram the OS had no buffer space for.
pub(crate) const SEND_BACKOFF: Duration = Duration::from_millis(1);

/// Message ids wrap before shifting them left would overflow.
const MSG_ID_WRAP: i64 = i64::MAX >> 8;

fn seq_of(msg_id: i64, attempt: u8) -> i64 {
    (msg_id << 8) | attempt as i64
}

fn msg_id_of(seq: i64) -> i64 {
    seq >> 8
}

fn attempt_of(seq: i64) -> u32 {
    (seq & MAX_ATTEMPT as i64) as u32
}

fn millis_i32(d: Duration) -> i32 {
    d.as_millis().min(i32::MAX as u128) as i32
}

/// Allocates message ids. Lives on the transport handle so that a send
/// gets its token before the engine has seen it.
#[derive(Debug)]
pub(crate) struct MsgIds(AtomicI64);

impl MsgIds {
    /// Seed from a wall clock reading so that a restarted node does not
    /// reuse the ids its peers still remember.
    pub fn starting_at(now_ms: i64) -> Self {
        Self(AtomicI64::new((now_ms >> 8).rem_euclid(MSG_ID_WRAP)))
    }

    pub fn next(&self) -> i64 {
        let bump = |v: i64| if v + 1 >= MSG_ID_WRAP { 0 } else { v + 1 };
        match self
            .0
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(bump(v))
            }) {
            Ok(prev) | Err(prev) => bump(prev),
        }
    }
}

/// A datagram ready for the wire.
#[derive(Debug)]
pub(crate) struct Transmit {
    pub peer: SocketAddr,
    pub bytes: Bytes,
}

/// A message for the application.
#[derive(Debug)]
pub(crate) struct Delivery {
    pub peer: SocketAddr,
    pub payload: Bytes,
    pub meta: RecvMeta,
}

/// Connection statistics towards one peer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PeerStats {
    /// When we last put a packet on the wire for this peer.
    pub last_send: Instant,
    /// When we last heard from this peer.
    pub last_recv: Instant,
    /// Smoothed rtt in milliseconds, -1 if nothing was acked yet.
    pub latency_mean_ms: i64,
    /// Current congestion window.
    pub cwnd: f64,
    /// Messages queued or in flight.
    pub queued_msgs: usize,
}

#[derive(Debug, Default)]
struct Traffic {
    pkts_sent: u64,
    bytes_sent: u64,
    pkts_recv: u64,
    bytes_recv: u64,
}

#[derive(Debug)]
struct SecondChance {
    peer: SocketAddr,
    sent_at: Instant,
}

/// See module docs.
#[derive(Debug)]
pub(crate) struct UdpCcEngine {
    framer: Framer,
    timeout_factor: f64,
    timeout_diff_ms: f64,
    drop_probability: f64,

    conns: HashMap<SocketAddr, Connection>,
    /// Connections with something to write, served round-robin.
    rr: VecDeque<SocketAddr>,

    unacked: HashMap<i64, PendingSend>,
    ack_timers: PriorityQueue<Instant, i64>,
    second_chance: HashMap<i64, SecondChance>,
    second_chance_expiry: PriorityQueue<Instant, i64>,

    /// Message ids whose completion has not fired yet.
    live: HashSet<i64>,
    cancelled: HashSet<i64>,
    /// Sends lost to synthetic loss, failed at their deadline.
    dropped: PriorityQueue<Instant, (i64, oneshot::Sender<bool>)>,
    /// Datagrams the socket refused, retried ahead of anything new.
    blocked: VecDeque<Transmit>,
    blocked_until: Option<Instant>,

    recently_seen: RecentlySeen,
    traffic: Traffic,
}

impl UdpCcEngine {
    pub fn new(
        framer: Framer,
        timeout_factor: f64,
        timeout_diff_ms: f64,
        drop_probability: f64,
    ) -> Self {
        Self {
            framer,
            timeout_factor,
            timeout_diff_ms,
            drop_probability,
            conns: HashMap::new(),
            rr: VecDeque::new(),
            unacked: HashMap::new(),
            ack_timers: PriorityQueue::default(),
            second_chance: HashMap::new(),
            second_chance_expiry: PriorityQueue::default(),
            live: HashSet::new(),
            cancelled: HashSet::new(),
            dropped: PriorityQueue::default(),
            blocked: VecDeque::new(),
            blocked_until: None,
            recently_seen: RecentlySeen::default(),
            traffic: Traffic::default(),
        }
    }

    fn check_size(&self, len: usize) -> UdpCcResult<()> {
        if len > self.framer.max_payload() {
            return Err(UdpCcError::PacketTooLarge {
                size: len + MAX_MSG_SIZE - self.framer.max_payload(),
                max: MAX_MSG_SIZE,
            });
        }
        Ok(())
    }

    fn conn(&mut self, peer: SocketAddr, now: Instant) -> &mut Connection {
        self.conns
            .entry(peer)
            .or_insert_with(|| Connection::new(peer, now))
    }

    /// Put `peer` on the round-robin list if it has anything to write.
    fn schedule(&mut self, peer: SocketAddr) {
        if let Some(conn) = self.conns.get_mut(&peer) {
            if !conn.in_rr && conn.writable() {
                conn.in_rr = true;
                self.rr.push_back(peer);
            }
        }
    }

    /// Fire the completion of `msg_id`, unless it was cancelled.
    fn finish(
        &mut self,
        msg_id: i64,
        done: Option<oneshot::Sender<bool>>,
        ok: bool,
    ) {
        self.live.remove(&msg_id);
        if self.cancelled.remove(&msg_id) {
            tracing::trace!(msg_id, ok, "completion suppressed, cancelled");
            return;
        }
        if let Some(done) = done {
            let _ = done.send(ok);
        }
    }

    /// Queue a reliable send.
    pub fn send(
        &mut self,
        now: Instant,
        peer: SocketAddr,
        payload: Bytes,
        timeout: Duration,
        msg_id: i64,
        done: oneshot::Sender<bool>,
    ) -> UdpCcResult<()> {
        self.check_size(payload.len())?;
        self.live.insert(msg_id);

        if self.drop_probability > 0.0 {
            let steps = (timeout.as_secs_f64() / DROP_STEP_SECS).ceil().max(1.0);
            let p = self.drop_probability.powf(steps);
            if rand::thread_rng().gen::<f64>() < p {
                tracing::trace!(%peer, msg_id, "synthetic drop");
                self.dropped.push(now + timeout, (msg_id, done));
                return Ok(());
            }
        }

        self.conn(peer, now).send_q.push_back(PendingSend {
            peer,
            payload,
            msg_id,
            start: now,
            timeout,
            attempt: 0,
            sent_at: now,
            cut_ssthresh: true,
            done: Some(done),
        });
        self.schedule(peer);
        Ok(())
    }

    /// Queue an unacknowledged send.
    pub fn send_nocc(
        &mut self,
        now: Instant,
        peer: SocketAddr,
        payload: Bytes,
    ) -> UdpCcResult<()> {
        self.check_size(payload.len())?;
        self.conn(peer, now).nocc_q.push_back(payload);
        self.schedule(peer);
        Ok(())
    }

    /// Suppress the completion of `msg_id` if it has not fired yet.
    pub fn cancel(&mut self, msg_id: i64) {
        if self.live.contains(&msg_id) {
            self.cancelled.insert(msg_id);
        }
    }

    /// Hand back a datagram the socket could not take. Nothing is
    /// transmitted until [SEND_BACKOFF] has passed, then it goes first.
    pub fn requeue(&mut self, now: Instant, t: Transmit) {
        self.blocked.push_front(t);
        self.blocked_until = Some(now + SEND_BACKOFF);
    }

    /// The next datagram to put on the wire, if any.
    pub fn poll_transmit(&mut self, now: Instant) -> Option<Transmit> {
        if let Some(until) = self.blocked_until {
            if now < until {
                return None;
            }
            self.blocked_until = None;
        }
        if let Some(t) = self.blocked.pop_front() {
            return Some(t);
        }
        while let Some(peer) = self.rr.pop_front() {
            // taken out of the map so the queues and the engine tables
            // can be borrowed together
            let Some(mut conn) = self.conns.remove(&peer) else {
                continue;
            };
            conn.in_rr = false;
            let out = self.write_one(now, &mut conn);
            if conn.writable() {
                conn.in_rr = true;
                self.rr.push_back(peer);
            }
            self.conns.insert(peer, conn);
            if let Some(out) = out {
                self.traffic.pkts_sent += 1;
                self.traffic.bytes_sent += out.bytes.len() as u64;
                return Some(out);
            }
        }
        None
    }

    fn write_one(
        &mut self,
        now: Instant,
        conn: &mut Connection,
    ) -> Option<Transmit> {
        let can_either = conn.can_send_either();
        let can_nocc = conn.can_send_nocc();
        if can_either || can_nocc {
            let q = conn.next_q;
            conn.next_q ^= 1;
            if (q == 0 && can_either) || !can_nocc {
                if let Some(out) = self.send_msg(now, conn) {
                    return Some(out);
                }
            } else if let Some(payload) = conn.nocc_q.pop_front() {
                let ack = conn.ack_q.pop_front().unwrap_or(-1);
                let est = conn.latency_mean().clamp(-1, i32::MAX as i64);
                conn.last_send = now;
                return Some(Transmit {
                    peer: conn.addr,
                    bytes: self.framer.encode_data(
                        ack,
                        -1,
                        0,
                        est as i32,
                        &payload,
                    ),
                });
            }
        }
        let seq = conn.ack_q.pop_front()?;
        conn.last_send = now;
        Some(Transmit {
            peer: conn.addr,
            bytes: self.framer.encode_ack(seq),
        })
    }

    fn send_msg(
        &mut self,
        now: Instant,
        conn: &mut Connection,
    ) -> Option<Transmit> {
        loop {
            let retry = !conn.retry_q.is_empty();
            let mut p = if retry {
                conn.retry_q.pop_front()?
            } else {
                conn.send_q.pop_front()?
            };
            if self.cancelled.remove(&p.msg_id) {
                tracing::trace!(msg_id = p.msg_id, "skipping cancelled send");
                self.live.remove(&p.msg_id);
                continue;
            }
            if p.attempt >= MAX_ATTEMPT {
                tracing::debug!(
                    peer = %p.peer,
                    msg_id = p.msg_id,
                    "out of attempts"
                );
                let done = p.done.take();
                self.finish(p.msg_id, done, false);
                continue;
            }

            p.attempt += 1;
            if retry {
                p.cut_ssthresh = true;
            }
            let seq = seq_of(p.msg_id, p.attempt);
            let ack = conn.ack_q.pop_front().unwrap_or(-1);
            let wait_ms = millis_i32(now.duration_since(p.start));
            let est = conn.latency_mean().clamp(-1, i32::MAX as i64) as i32;
            let bytes =
                self.framer.encode_data(ack, seq, wait_ms, est, &p.payload);

            p.sent_at = now;
            conn.inf.insert(seq);
            conn.last_send = now;

            let rto_ms = (conn.rto as f64 * self.timeout_factor
                + self.timeout_diff_ms)
                .round()
                .max(0.0);
            self.ack_timers
                .push(now + Duration::from_millis(rto_ms as u64), seq);
            tracing::trace!(peer = %p.peer, seq, rto_ms, "sending");
            let peer = p.peer;
            self.unacked.insert(seq, p);
            return Some(Transmit { peer, bytes });
        }
    }

    /// Process one inbound datagram, returning any message it carries
    /// for the application.
    pub fn handle_datagram(
        &mut self,
        now: Instant,
        src: SocketAddr,
        data: Bytes,
    ) -> Option<Delivery> {
        self.traffic.pkts_recv += 1;
        self.traffic.bytes_recv += data.len() as u64;
        let pkt = match self.framer.decode(data) {
            Ok(pkt) => pkt,
            Err(err) => {
                tracing::debug!(%src, ?err, "dropping packet");
                return None;
            }
        };
        let data = match pkt {
            Packet::Ack(seq) => {
                self.handle_ack(now, seq);
                return None;
            }
            Packet::Data(data) => data,
        };
        if data.ack != -1 {
            self.handle_ack(now, data.ack);
        }

        let conn = self.conn(src, now);
        conn.last_recv = now;
        let mut tries = 0;
        if data.seq != -1 {
            conn.ack_q.push_back(data.seq);
            tries = attempt_of(data.seq);
        }
        self.schedule(src);

        if data.seq != -1
            && self.recently_seen.check(src, msg_id_of(data.seq))
        {
            tracing::trace!(%src, seq = data.seq, "duplicate");
            return None;
        }
        Some(Delivery {
            peer: src,
            payload: data.payload,
            meta: RecvMeta {
                tries,
                wait_ms: data.wait_ms,
                est_rtt_ms: data.est_rtt_ms,
            },
        })
    }

    fn handle_ack(&mut self, now: Instant, seq: i64) {
        if let Some(p) = self.unacked.remove(&seq) {
            let rtt = now.duration_since(p.sent_at).as_millis() as i64;
            if let Some(conn) = self.conns.get_mut(&p.peer) {
                conn.last_recv = now;
                conn.add_rtt_meas(rtt);
                conn.inf.remove(&seq);
                conn.consecutive_timeouts = 0;
            }
            self.schedule(p.peer);
            self.finish(p.msg_id, p.done, true);
        } else if let Some(sc) = self.second_chance.remove(&seq) {
            // late, but still a valid rtt sample
            let rtt = now.duration_since(sc.sent_at).as_millis() as i64;
            if let Some(conn) = self.conns.get_mut(&sc.peer) {
                conn.last_recv = now;
                conn.add_rtt_meas(rtt);
            }
        } else {
            tracing::debug!(seq, "ack for unknown message");
        }
    }

    fn ack_timeout(&mut self, now: Instant, seq: i64) {
        let Some(p) = self.unacked.remove(&seq) else {
            // acked in time
            return;
        };
        let peer = p.peer;
        self.second_chance.insert(
            seq,
            SecondChance {
                peer,
                sent_at: p.sent_at,
            },
        );
        self.second_chance_expiry
            .push(now + SECOND_CHANCE_RETENTION, seq);

        let mut failed = Vec::new();
        match self.conns.get_mut(&peer) {
            None => failed.push(p),
            Some(conn) => {
                if p.cut_ssthresh {
                    conn.consecutive_timeouts += 1;
                    conn.timeout();
                    tracing::debug!(
                        %peer,
                        seq,
                        rto = conn.rto,
                        ssthresh = conn.ssthresh,
                        consecutive = conn.consecutive_timeouts,
                        "ack timeout"
                    );
                    // one cut per burst of timeouts
                    for s in conn.inf.iter() {
                        if let Some(other) = self.unacked.get_mut(s) {
                            other.cut_ssthresh = false;
                        }
                    }
                }
                conn.inf.remove(&seq);
                conn.retry_q.push_back(p);
                drain_expired(&mut conn.retry_q, now, &mut failed);
                drain_expired(&mut conn.send_q, now, &mut failed);
            }
        }

        for mut p in failed {
            tracing::debug!(
                peer = %p.peer,
                msg_id = p.msg_id,
                attempts = p.attempt,
                "send timed out"
            );
            let done = p.done.take();
            self.finish(p.msg_id, done, false);
        }
        self.schedule(peer);
    }

    /// Fire every timer due at `now`.
    pub fn handle_timers(&mut self, now: Instant) {
        while let Some((_, seq)) = self.ack_timers.pop_due(now) {
            self.ack_timeout(now, seq);
        }
        while let Some((_, (msg_id, done))) = self.dropped.pop_due(now) {
            self.finish(msg_id, Some(done), false);
        }
        while let Some((_, seq)) = self.second_chance_expiry.pop_due(now) {
            self.second_chance.remove(&seq);
        }
    }

    /// When [Self::handle_timers] next has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        [
            self.ack_timers.first_priority(),
            self.blocked_until,
            self.dropped.first_priority(),
            self.second_chance_expiry.first_priority(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    pub fn peer_stats(&self, peer: &SocketAddr) -> Option<PeerStats> {
        self.conns.get(peer).map(|c| PeerStats {
            last_send: c.last_send,
            last_recv: c.last_recv,
            latency_mean_ms: c.latency_mean(),
            cwnd: c.cwnd,
            queued_msgs: c.queued(),
        })
    }

    pub fn queued_msgs_total(&self) -> usize {
        self.conns.values().map(Connection::queued).sum()
    }

    /// Received and duplicate message counts since the last call.
    pub fn take_dup_counts(&mut self) -> (u64, u64) {
        self.recently_seen.take_counts()
    }

    /// Log and reset the traffic counters.
    pub fn report_traffic(&mut self, period: Duration) {
        let t = std::mem::take(&mut self.traffic);
        let secs = period.as_secs_f64().max(f64::EPSILON);
        tracing::debug!(
            pkts_sent = t.pkts_sent,
            pkts_recv = t.pkts_recv,
            send_bps = (t.bytes_sent as f64 * 8.0 / secs) as u64,
            recv_bps = (t.bytes_recv as f64 * 8.0 / secs) as u64,
            queued = self.queued_msgs_total(),
            "bandwidth"
        );
    }
}

fn drain_expired(
    q: &mut VecDeque<PendingSend>,
    now: Instant,
    out: &mut Vec<PendingSend>,
) {
    let mut kept = VecDeque::with_capacity(q.len());
    for p in q.drain(..) {
        if p.deadline() <= now {
            out.push(p);
        } else {
            kept.push_back(p);
        }
    }
    *q = kept;
}

#[cfg(test)]
mod tests {
    use super::*;
    use oneshot::error::TryRecvError;

    const A: ([u8; 4], u16) = ([127, 0, 0, 1], 4001);
    const B: ([u8; 4], u16) = ([127, 0, 0, 1], 4002);

    fn engine() -> UdpCcEngine {
        crate::enable_tracing();
        UdpCcEngine::new(Framer::new(None).unwrap(), 1.0, 0.0, 0.0)
    }

    fn addr(a: ([u8; 4], u16)) -> SocketAddr {
        a.into()
    }

    #[test]
    fn msg_ids_wrap() {
        let ids = MsgIds::starting_at(0);
        assert_eq!(1, ids.next());
        assert_eq!(2, ids.next());
        let ids = MsgIds(AtomicI64::new(MSG_ID_WRAP - 2));
        assert_eq!(MSG_ID_WRAP - 1, ids.next());
        assert_eq!(0, ids.next());
        assert_eq!(1, ids.next());
    }

    #[test]
    fn delivers_and_acks() {
        let now = Instant::now();
        let mut a = engine();
        let mut b = engine();
        let (tx, mut rx) = oneshot::channel();
        a.send(now, addr(B), Bytes::from_static(b"hi"), Duration::from_secs(5), 7, tx)
            .unwrap();

        let t = a.poll_transmit(now).unwrap();
        assert_eq!(addr(B), t.peer);
        assert!(a.poll_transmit(now).is_none());

        let later = now + Duration::from_millis(40);
        let d = b.handle_datagram(later, addr(A), t.bytes).unwrap();
        assert_eq!(&b"hi"[..], &d.payload[..]);
        assert_eq!(1, d.meta.tries);
        assert_eq!(-1, d.meta.est_rtt_ms);

        let ack = b.poll_transmit(later).unwrap();
        assert_eq!(addr(A), ack.peer);
        assert_eq!(12, ack.bytes.len());
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));

        let acked_at = now + Duration::from_millis(80);
        assert!(a.handle_datagram(acked_at, addr(B), ack.bytes).is_none());
        assert_eq!(Ok(true), rx.try_recv());

        let stats = a.peer_stats(&addr(B)).unwrap();
        assert_eq!(80, stats.latency_mean_ms);
        assert_eq!(2.0, stats.cwnd);
        assert_eq!(0, stats.queued_msgs);
        assert_eq!(acked_at, stats.last_recv);
    }

    #[test]
    fn retransmission_is_acked_but_not_redelivered() {
        let now = Instant::now();
        let mut a = engine();
        let mut b = engine();
        let (tx, mut rx) = oneshot::channel();
        a.send(now, addr(B), Bytes::from_static(b"x"), Duration::from_secs(30), 1, tx)
            .unwrap();

        let first = a.poll_transmit(now).unwrap();
        assert!(b.handle_datagram(now, addr(A), first.bytes).is_some());
        // the ack is lost
        let _ = b.poll_transmit(now).unwrap();

        let t = now + Duration::from_secs(5);
        assert_eq!(Some(t), a.next_deadline());
        a.handle_timers(t);
        let second = a.poll_transmit(t).unwrap();
        assert!(b.handle_datagram(t, addr(A), second.bytes).is_none());
        let ack = b.poll_transmit(t).unwrap();
        a.handle_datagram(t + Duration::from_millis(20), addr(B), ack.bytes);
        assert_eq!(Ok(true), rx.try_recv());
        assert_eq!((2, 1), b.take_dup_counts());

        // the timeout cut the window, the ack grew it again
        let stats = a.peer_stats(&addr(B)).unwrap();
        assert_eq!(2.0, stats.cwnd);
    }

    #[test]
    fn refused_datagram_goes_first_after_backoff() {
        let now = Instant::now();
        let mut a = engine();
        let (tx, _rx) = oneshot::channel();
        a.send(now, addr(B), Bytes::from_static(b"one"), Duration::from_secs(30), 1, tx)
            .unwrap();

        let first = a.poll_transmit(now).unwrap();
        let first_bytes = first.bytes.clone();
        a.requeue(now, first);
        assert!(a.poll_transmit(now).is_none());
        assert_eq!(Some(now + SEND_BACKOFF), a.next_deadline());

        let later = now + SEND_BACKOFF;
        a.handle_timers(later);
        assert_eq!(first_bytes, a.poll_transmit(later).unwrap().bytes);
        assert!(a.poll_transmit(later).is_none());
        // only the retransmit timer is left
        assert!(a.next_deadline().is_some_and(|d| d > later));
    }

    #[test]
    fn total_loss_fails_after_timeout() {
        let start = Instant::now();
        let mut a = engine();
        let (tx, mut rx) = oneshot::channel();
        a.send(
            start,
            addr(B),
            Bytes::from_static(b"lost"),
            Duration::from_secs(12),
            3,
            tx,
        )
        .unwrap();

        let mut now = start;
        let mut attempts = 0;
        let failed_at = loop {
            a.handle_timers(now);
            while a.poll_transmit(now).is_some() {
                attempts += 1;
            }
            match rx.try_recv() {
                Ok(ok) => {
                    assert!(!ok);
                    break now;
                }
                Err(TryRecvError::Empty) => (),
                Err(e) => panic!("{e:?}"),
            }
            now += Duration::from_millis(100);
            assert!(now - start < Duration::from_secs(60));
        };
        let elapsed = failed_at - start;
        assert!(elapsed >= Duration::from_secs(12), "{elapsed:?}");
        assert!(elapsed <= Duration::from_secs(17), "{elapsed:?}");
        assert_eq!(3, attempts);
        assert_eq!(0, a.queued_msgs_total());
    }

    #[test]
    fn cancelled_send_never_completes() {
        let now = Instant::now();
        let mut a = engine();
        let (tx, mut rx) = oneshot::channel();
        a.send(now, addr(B), Bytes::from_static(b"x"), Duration::from_secs(5), 9, tx)
            .unwrap();
        a.cancel(9);
        assert!(a.poll_transmit(now).is_none());
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Closed)));

        // cancelling something unknown is a no-op
        a.cancel(10);
        let (tx, mut rx) = oneshot::channel();
        a.send(now, addr(B), Bytes::from_static(b"y"), Duration::from_secs(1), 10, tx)
            .unwrap();
        assert!(a.poll_transmit(now).is_some());
        a.handle_timers(now + Duration::from_secs(5));
        assert_eq!(Ok(false), rx.try_recv());
    }

    #[test]
    fn window_limits_messages_in_flight() {
        let now = Instant::now();
        let mut a = engine();
        let mut b = engine();
        let mut rxs = Vec::new();
        for id in 1..=3 {
            let (tx, rx) = oneshot::channel();
            a.send(now, addr(B), Bytes::from_static(b"m"), Duration::from_secs(5), id, tx)
                .unwrap();
            rxs.push(rx);
        }
        let t = a.poll_transmit(now).unwrap();
        assert!(a.poll_transmit(now).is_none());
        assert_eq!(3, a.peer_stats(&addr(B)).unwrap().queued_msgs);

        b.handle_datagram(now, addr(A), t.bytes);
        let ack = b.poll_transmit(now).unwrap();
        a.handle_datagram(now + Duration::from_millis(10), addr(B), ack.bytes);

        // cwnd is now 2
        assert!(a.poll_transmit(now).is_some());
        assert!(a.poll_transmit(now).is_some());
        assert!(a.poll_transmit(now).is_none());
    }

    #[test]
    fn acks_piggyback_on_data() {
        let now = Instant::now();
        let mut a = engine();
        let mut b = engine();
        let (tx, _rx) = oneshot::channel();
        a.send(now, addr(B), Bytes::from_static(b"q"), Duration::from_secs(5), 1, tx)
            .unwrap();
        let t = a.poll_transmit(now).unwrap();
        b.handle_datagram(now, addr(A), t.bytes);

        let (tx, _rx2) = oneshot::channel();
        b.send(now, addr(A), Bytes::from_static(b"r"), Duration::from_secs(5), 1, tx)
            .unwrap();
        let t = b.poll_transmit(now).unwrap();
        assert!(t.bytes.len() > 12);
        assert!(b.poll_transmit(now).is_none());
        a.handle_datagram(now, addr(B), t.bytes).unwrap();
        assert_eq!(0, a.peer_stats(&addr(B)).unwrap().latency_mean_ms);
    }

    #[test]
    fn unacknowledged_sends() {
        let now = Instant::now();
        let mut a = engine();
        let mut b = engine();
        a.send_nocc(now, addr(B), Bytes::from_static(b"unpaced")).unwrap();
        let t = a.poll_transmit(now).unwrap();
        let d = b.handle_datagram(now, addr(A), t.bytes).unwrap();
        assert_eq!(0, d.meta.tries);
        assert_eq!(0, d.meta.wait_ms);
        assert!(b.poll_transmit(now).is_none());
        assert_eq!((0, 0), b.take_dup_counts());
    }

    #[test]
    fn oversized_payload_is_refused() {
        let mut a = engine();
        let (tx, _rx) = oneshot::channel();
        let err = a
            .send(
                Instant::now(),
                addr(B),
                Bytes::from(vec![0; MAX_MSG_SIZE]),
                Duration::from_secs(1),
                1,
                tx,
            )
            .unwrap_err();
        assert!(matches!(err, UdpCcError::PacketTooLarge { .. }));
        assert!(a.send_nocc(Instant::now(), addr(B), Bytes::from(vec![0; MAX_MSG_SIZE])).is_err());
    }

    #[test]
    fn synthetic_loss_fails_at_deadline() {
        let now = Instant::now();
        let mut a = UdpCcEngine::new(Framer::new(None).unwrap(), 1.0, 0.0, 1.0);
        let (tx, mut rx) = oneshot::channel();
        a.send(now, addr(B), Bytes::from_static(b"x"), Duration::from_secs(3), 1, tx)
            .unwrap();
        assert!(a.poll_transmit(now).is_none());
        a.handle_timers(now + Duration::from_millis(2_999));
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
        a.handle_timers(now + Duration::from_secs(3));
        assert_eq!(Ok(false), rx.try_recv());
    }

    #[test]
    fn late_ack_updates_rtt_only() {
        let now = Instant::now();
        let mut a = engine();
        let mut b = engine();
        let (tx, mut rx) = oneshot::channel();
        a.send(now, addr(B), Bytes::from_static(b"x"), Duration::from_secs(4), 1, tx)
            .unwrap();
        let t = a.poll_transmit(now).unwrap();
        b.handle_datagram(now, addr(A), t.bytes);
        let ack = b.poll_transmit(now).unwrap();

        let late = now + Duration::from_secs(5);
        a.handle_timers(late);
        assert_eq!(Ok(false), rx.try_recv());
        a.handle_datagram(late, addr(B), ack.bytes);
        let stats = a.peer_stats(&addr(B)).unwrap();
        assert_eq!(5_000, stats.latency_mean_ms);
        assert_eq!(late, stats.last_recv);
    }
}
