//! Per-peer congestion state.
//!
//! Round-trip estimation follows Jacobson/Karels: `sa` is the mean rtt
//! scaled by 8 and `sv` the mean deviation scaled by 4, both in
//! milliseconds. The congestion window grows by one per ack in slow start
//! and by `1/cwnd` per ack afterwards; a timeout halves the threshold and
//! resets the window to one.

use bytes::Bytes;
use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// Retransmit timeouts never back off past this.
pub const MAX_RTO_MS: i64 = 5_000;

/// Upper bound of the congestion window.
pub const MAX_WND: f64 = 1_000_000.0;

// slack added to every rto estimate
const RTO_SLACK_MS: i64 = 10;

/// A reliable message waiting to be sent, or in flight.
#[derive(Debug)]
pub(crate) struct PendingSend {
    pub peer: SocketAddr,
    pub payload: Bytes,
    pub msg_id: i64,
    pub start: Instant,
    pub timeout: Duration,
    pub attempt: u8,
    pub sent_at: Instant,
    /// Whether a timeout of this attempt may cut the window. Cleared on
    /// siblings once one in-flight message has already cut it.
    pub cut_ssthresh: bool,
    pub done: Option<oneshot::Sender<bool>>,
}

impl PendingSend {
    pub fn deadline(&self) -> Instant {
        self.start + self.timeout
    }
}

/// State kept for each peer we talk to.
#[derive(Debug)]
pub(crate) struct Connection {
    pub addr: SocketAddr,
    pub sa: i64,
    pub sv: i64,
    pub rto: i64,
    pub cwnd: f64,
    pub ssthresh: f64,
    pub consecutive_timeouts: u32,

    /// Sequence numbers in flight.
    pub inf: HashSet<i64>,
    /// Sequence numbers we owe an ack for.
    pub ack_q: VecDeque<i64>,
    pub send_q: VecDeque<PendingSend>,
    pub retry_q: VecDeque<PendingSend>,
    /// Unacknowledged, uncontrolled sends.
    pub nocc_q: VecDeque<Bytes>,

    pub last_send: Instant,
    pub last_recv: Instant,

    /// 0: retry or send queue next, 1: nocc queue next.
    pub next_q: u8,
    pub in_rr: bool,
}

impl Connection {
    pub fn new(addr: SocketAddr, now: Instant) -> Self {
        Self {
            addr,
            sa: -1,
            sv: 0,
            rto: MAX_RTO_MS,
            cwnd: 1.0,
            ssthresh: MAX_WND,
            consecutive_timeouts: 0,
            inf: HashSet::new(),
            ack_q: VecDeque::new(),
            send_q: VecDeque::new(),
            retry_q: VecDeque::new(),
            nocc_q: VecDeque::new(),
            // so the peer does not look dead straight away
            last_send: now,
            last_recv: now,
            next_q: 0,
            in_rr: false,
        }
    }

    fn window_open(&self) -> bool {
        self.inf.len() < self.cwnd as usize
    }

    pub fn can_send_either(&self) -> bool {
        (!self.send_q.is_empty() || !self.retry_q.is_empty())
            && self.window_open()
    }

    pub fn can_send_nocc(&self) -> bool {
        !self.nocc_q.is_empty()
    }

    pub fn can_send_ack(&self) -> bool {
        !self.ack_q.is_empty()
    }

    /// Anything we could put on the wire right now?
    pub fn writable(&self) -> bool {
        self.can_send_ack() || self.can_send_nocc() || self.can_send_either()
    }

    /// Smoothed rtt in milliseconds, -1 before the first sample.
    pub fn latency_mean(&self) -> i64 {
        self.sa >> 3
    }

    /// Messages queued or in flight.
    pub fn queued(&self) -> usize {
        self.retry_q.len()
            + self.send_q.len()
            + self.nocc_q.len()
            + self.inf.len()
    }

    /// Feed one rtt sample and open the window.
    pub fn add_rtt_meas(&mut self, m: i64) {
        if self.sa == -1 {
            // first sample: timeout is four times the rtt
            self.sa = m << 3;
            self.sv = 0;
            self.rto = (m << 2) + RTO_SLACK_MS;
        } else {
            let mut m = m - (self.sa >> 3);
            self.sa += m;
            m = m.abs();
            m -= self.sv >> 2;
            self.sv += m;
            self.rto = (self.sa >> 3) + self.sv + RTO_SLACK_MS;
        }
        if self.rto > MAX_RTO_MS {
            tracing::trace!(
                conn = %self.addr,
                sa = self.sa,
                sv = self.sv,
                rto = self.rto,
                "huge rto"
            );
            self.rto = MAX_RTO_MS;
        }

        if self.cwnd < self.ssthresh {
            self.cwnd += 1.0;
        } else {
            self.cwnd += 1.0 / self.cwnd;
        }
        if self.cwnd > MAX_WND {
            self.cwnd = MAX_WND;
        }
    }

    /// An attempt timed out: back off and shrink the window.
    pub fn timeout(&mut self) {
        self.rto = (self.rto << 1).min(MAX_RTO_MS);
        self.ssthresh = self.cwnd / 2.0;
        self.cwnd = 1.0;
    }
}
