//! The tokio socket driver.

use crate::config::*;
use crate::engine::*;
use crate::error::*;
use crate::frame::{Framer, MAC_LEN, MAX_MSG_SIZE};
use bamboo_api::*;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, Interval};

/// How often bandwidth figures are logged.
const TRAFFIC_REPORT_PERIOD: Duration = Duration::from_secs(5);

#[cfg(unix)]
const ENOBUFS: i32 = libc::ENOBUFS;
// WSAENOBUFS
#[cfg(windows)]
const ENOBUFS: i32 = 10055;

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

enum Command {
    Send {
        peer: SocketAddr,
        payload: Bytes,
        timeout: Duration,
        msg_id: i64,
        done: oneshot::Sender<bool>,
    },
    SendNocc {
        peer: SocketAddr,
        payload: Bytes,
    },
    Cancel(i64),
    Stats {
        peer: SocketAddr,
        reply: oneshot::Sender<Option<PeerStats>>,
    },
    QueuedTotal {
        reply: oneshot::Sender<usize>,
    },
}

type HandlerSlot = Arc<Mutex<Option<DynRecvHandler>>>;

/// A congestion-controlled reliable datagram transport over one UDP
/// socket.
///
/// All protocol state lives in a single task that owns the socket. The
/// handle talks to it over a channel, so every method here is cheap and
/// never blocks on the network.
pub struct UdpCc {
    local_addr: SocketAddr,
    max_payload: usize,
    msg_ids: MsgIds,
    cmd_send: mpsc::UnboundedSender<Command>,
    handler: HandlerSlot,
    _task: Option<DropAbortHandle>,
}

impl std::fmt::Debug for UdpCc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpCc")
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

impl UdpCc {
    /// Bind the socket and start the transport.
    ///
    /// Unless `separate_thread` is configured, this must be called from
    /// within a tokio runtime, which will host the transport task.
    pub fn create(config: UdpCcConfig) -> UdpCcResult<Arc<Self>> {
        if !(0.0..=1.0).contains(&config.drop_probability) {
            return Err(UdpCcError::InvalidConfig(format!(
                "dropProbability {} not in [0, 1]",
                config.drop_probability
            )));
        }
        if config.timeout_factor.is_nan() || config.timeout_factor <= 0.0 {
            return Err(UdpCcError::InvalidConfig(format!(
                "timeoutFactor {} must be positive",
                config.timeout_factor
            )));
        }
        let bind: SocketAddr = config.bind_addr.parse().map_err(|_| {
            UdpCcError::InvalidConfig(format!(
                "bindAddr {:?} is not a socket address",
                config.bind_addr
            ))
        })?;

        let mac_key = match &config.mac_key_file {
            None => None,
            Some(path) => Some(read_mac_key(path)?),
        };
        let framer = Framer::new(mac_key.as_deref())?;
        let max_payload = framer.max_payload();

        let sock = std::net::UdpSocket::bind(bind)
            .map_err(|src| UdpCcError::Io { addr: bind, src })?;
        if config.sockbuf_size > SOCKBUF_MAX {
            tracing::warn!(
                sockbuf_size = config.sockbuf_size,
                max = SOCKBUF_MAX,
                "receive buffer size too large, keeping the OS default"
            );
        } else if config.sockbuf_size > 0 {
            socket2::SockRef::from(&sock)
                .set_recv_buffer_size(config.sockbuf_size)
                .map_err(|src| UdpCcError::Io { addr: bind, src })?;
            tracing::info!(
                sockbuf_size = config.sockbuf_size,
                "set receive buffer size"
            );
        }
        sock.set_nonblocking(true)
            .map_err(|src| UdpCcError::Io { addr: bind, src })?;
        let local_addr = sock
            .local_addr()
            .map_err(|src| UdpCcError::Io { addr: bind, src })?;

        let engine = UdpCcEngine::new(
            framer,
            config.timeout_factor,
            config.timeout_diff,
            config.drop_probability,
        );
        let (cmd_send, cmd_recv) = mpsc::unbounded_channel();
        let handler: HandlerSlot = Arc::new(Mutex::new(None));
        let pump = Pump {
            engine,
            cmd_recv,
            handler: handler.clone(),
            dup_period: config.track_duplicates_period(),
        };

        let task = if config.separate_thread {
            std::thread::Builder::new()
                .name(format!("udpcc-{local_addr}"))
                .spawn(move || {
                    let rt = match tokio::runtime::Builder::new_current_thread()
                        .enable_all()
                        .build()
                    {
                        Ok(rt) => rt,
                        Err(err) => fatal("udpcc runtime", &err),
                    };
                    rt.block_on(pump.run(sock));
                })
                .map_err(|src| UdpCcError::Io {
                    addr: local_addr,
                    src,
                })?;
            // the thread exits once the handle, and with it the command
            // channel, is dropped
            None
        } else {
            let handle = tokio::task::spawn(pump.run(sock)).abort_handle();
            Some(DropAbortHandle {
                name: format!("udpcc {local_addr}"),
                handle,
            })
        };

        tracing::info!(
            %local_addr,
            authenticated = mac_key.is_some(),
            separate_thread = config.separate_thread,
            "udpcc transport started"
        );

        let now_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or_default();

        Ok(Arc::new(Self {
            local_addr,
            max_payload,
            msg_ids: MsgIds::starting_at(now_ms),
            cmd_send,
            handler,
            _task: task,
        }))
    }

    /// Connection statistics towards `peer`, if we ever talked to it.
    pub async fn peer_stats(&self, peer: SocketAddr) -> Option<PeerStats> {
        let (reply, r) = oneshot::channel();
        self.cmd_send.send(Command::Stats { peer, reply }).ok()?;
        r.await.ok().flatten()
    }

    /// When we last sent a packet to `peer`.
    pub async fn last_send(&self, peer: SocketAddr) -> Option<Instant> {
        self.peer_stats(peer).await.map(|s| s.last_send)
    }

    /// When we last received a packet from `peer`.
    pub async fn last_recv(&self, peer: SocketAddr) -> Option<Instant> {
        self.peer_stats(peer).await.map(|s| s.last_recv)
    }

    /// Smoothed rtt towards `peer` in milliseconds, -1 if unknown.
    pub async fn latency_mean(&self, peer: SocketAddr) -> i64 {
        self.peer_stats(peer)
            .await
            .map(|s| s.latency_mean_ms)
            .unwrap_or(-1)
    }

    /// Messages queued or in flight towards `peer`.
    pub async fn queued_msgs(&self, peer: SocketAddr) -> usize {
        self.peer_stats(peer)
            .await
            .map(|s| s.queued_msgs)
            .unwrap_or(0)
    }

    /// Messages queued or in flight towards anyone.
    pub async fn queued_msgs_total(&self) -> usize {
        let (reply, r) = oneshot::channel();
        if self.cmd_send.send(Command::QueuedTotal { reply }).is_err() {
            return 0;
        }
        r.await.unwrap_or(0)
    }

    fn check_size(&self, len: usize) -> UdpCcResult<()> {
        if len > self.max_payload {
            return Err(UdpCcError::PacketTooLarge {
                size: len + MAX_MSG_SIZE - self.max_payload,
                max: MAX_MSG_SIZE,
            });
        }
        Ok(())
    }
}

impl Transport for UdpCc {
    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn send(
        &self,
        peer: SocketAddr,
        data: Bytes,
        timeout: Duration,
    ) -> BambooResult<SendTicket> {
        self.check_size(data.len())?;
        let msg_id = self.msg_ids.next();
        let (done, result) = oneshot::channel();
        self.cmd_send
            .send(Command::Send {
                peer,
                payload: data,
                timeout,
                msg_id,
                done,
            })
            .map_err(|_| UdpCcError::Closed)?;
        Ok(SendTicket {
            token: SendToken(msg_id as u64),
            result,
        })
    }

    fn send_nocc(&self, peer: SocketAddr, data: Bytes) -> BambooResult<()> {
        self.check_size(data.len())?;
        self.cmd_send
            .send(Command::SendNocc {
                peer,
                payload: data,
            })
            .map_err(|_| UdpCcError::Closed)?;
        Ok(())
    }

    fn cancel_send(&self, token: SendToken) {
        let _ = self.cmd_send.send(Command::Cancel(token.0 as i64));
    }

    fn register_handler(&self, handler: DynRecvHandler) {
        *self.handler.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(handler);
    }
}

fn read_mac_key(path: &str) -> UdpCcResult<Vec<u8>> {
    let mut key = std::fs::read(path).map_err(|e| {
        UdpCcError::InvalidConfig(format!("macKeyFile {path}: {e}"))
    })?;
    if key.len() < MAC_LEN {
        return Err(UdpCcError::InvalidConfig(format!(
            "macKeyFile {path}: need {MAC_LEN} bytes, found {}",
            key.len()
        )));
    }
    key.truncate(MAC_LEN);
    Ok(key)
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// The task that owns the socket and the engine.
struct Pump {
    engine: UdpCcEngine,
    cmd_recv: mpsc::UnboundedReceiver<Command>,
    handler: HandlerSlot,
    dup_period: Option<Duration>,
}

impl Pump {
    async fn run(mut self, sock: std::net::UdpSocket) {
        let sock = match tokio::net::UdpSocket::from_std(sock) {
            Ok(sock) => sock,
            Err(err) => fatal("udpcc socket", &err),
        };
        let mut buf = vec![0; MAX_MSG_SIZE];
        let start = Instant::now();
        let mut dup_report = self
            .dup_period
            .map(|p| tokio::time::interval_at(start + p, p));
        let mut traffic = Some(tokio::time::interval_at(
            start + TRAFFIC_REPORT_PERIOD,
            TRAFFIC_REPORT_PERIOD,
        ));

        loop {
            self.flush(&sock).await;
            let deadline = self.engine.next_deadline();
            tokio::select! {
                cmd = self.cmd_recv.recv() => match cmd {
                    Some(cmd) => self.command(cmd),
                    None => break,
                },
                res = sock.recv_from(&mut buf) => match res {
                    Ok((len, src)) => {
                        let data = Bytes::copy_from_slice(&buf[..len]);
                        if let Some(d) =
                            self.engine.handle_datagram(Instant::now(), src, data)
                        {
                            self.deliver(d);
                        }
                    }
                    Err(err) => tracing::warn!(?err, "udpcc recv error"),
                },
                _ = sleep_until(deadline) => {
                    self.engine.handle_timers(Instant::now());
                }
                _ = tick(&mut dup_report) => {
                    let (recv, dup) = self.engine.take_dup_counts();
                    let pct = if recv == 0 {
                        0.0
                    } else {
                        dup as f64 * 100.0 / recv as f64
                    };
                    tracing::info!("recv={recv} dup={dup} ({pct:.1}%)");
                }
                _ = tick(&mut traffic) => {
                    self.engine.report_traffic(TRAFFIC_REPORT_PERIOD);
                }
            }
        }
        tracing::info!("udpcc transport stopped");
    }

    fn command(&mut self, cmd: Command) {
        let now = Instant::now();
        match cmd {
            Command::Send {
                peer,
                payload,
                timeout,
                msg_id,
                done,
            } => {
                if let Err(err) =
                    self.engine.send(now, peer, payload, timeout, msg_id, done)
                {
                    tracing::warn!(%peer, ?err, "send refused");
                }
            }
            Command::SendNocc { peer, payload } => {
                if let Err(err) = self.engine.send_nocc(now, peer, payload) {
                    tracing::warn!(%peer, ?err, "send refused");
                }
            }
            Command::Cancel(msg_id) => self.engine.cancel(msg_id),
            Command::Stats { peer, reply } => {
                let _ = reply.send(self.engine.peer_stats(&peer));
            }
            Command::QueuedTotal { reply } => {
                let _ = reply.send(self.engine.queued_msgs_total());
            }
        }
    }

    fn deliver(&self, d: Delivery) {
        let handler = self
            .handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match handler {
            Some(handler) => handler.recv(d.peer, d.payload, d.meta),
            None => tracing::debug!(peer = %d.peer, "no handler, dropping"),
        }
    }

    async fn flush(&mut self, sock: &tokio::net::UdpSocket) {
        while let Some(t) = self.engine.poll_transmit(Instant::now()) {
            match sock.send_to(&t.bytes, t.peer).await {
                Ok(_) => (),
                Err(err) if err.raw_os_error() == Some(ENOBUFS) => {
                    tracing::trace!(peer = %t.peer, "no buffer space");
                    // the pump keeps receiving while the engine backs off
                    self.engine.requeue(Instant::now(), t);
                    return;
                }
                Err(err)
                    if matches!(
                        err.kind(),
                        std::io::ErrorKind::ConnectionRefused
                            | std::io::ErrorKind::ConnectionReset
                            | std::io::ErrorKind::InvalidInput
                    ) =>
                {
                    tracing::debug!(peer = %t.peer, ?err, "send failed");
                }
                Err(err) => fatal("udpcc send", &err),
            }
        }
    }
}
