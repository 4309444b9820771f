//! Packet framing.
//!
//! All integers are big-endian.
//!
//! Data packet:
//! - 4 bytes protocol version (0 plain, 1 authenticated)
//! - 8 bytes piggybacked ack sequence number (-1 if none)
//! - 8 bytes sequence number (-1 for unacknowledged sends)
//! - 4 bytes milliseconds the message waited at the sender
//! - 4 bytes sender's rtt estimate in milliseconds
//! - payload
//! - 20 bytes HMAC-SHA1 over everything before it (version 1 only)
//!
//! Ack packet: version and the acked sequence number, plus the HMAC for
//! version 1. Ack packets are recognised by their total length, 12 or 32
//! bytes.

use bamboo_api::{BambooError, BambooResult};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use hmac::{Hmac, Mac};
use sha1::Sha1;

type HmacSha1 = Hmac<Sha1>;

/// Largest datagram the transport will send or accept.
pub const MAX_MSG_SIZE: usize = 16 * 1024;

pub(crate) const MAC_LEN: usize = 20;
pub(crate) const DATA_HEADER_LEN: usize = 28;
const ACK_LEN: usize = 12;
const VERSION_PLAIN: u32 = 0;
const VERSION_MAC: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Packet {
    Ack(i64),
    Data(DataPacket),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DataPacket {
    pub ack: i64,
    pub seq: i64,
    pub wait_ms: i32,
    pub est_rtt_ms: i32,
    pub payload: Bytes,
}

/// Encodes and decodes packets, authenticating them when a key is set.
#[derive(Clone)]
pub(crate) struct Framer {
    mac: Option<HmacSha1>,
}

impl std::fmt::Debug for Framer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Framer")
            .field("authenticated", &self.mac.is_some())
            .finish()
    }
}

impl Framer {
    pub fn new(mac_key: Option<&[u8]>) -> BambooResult<Self> {
        let mac = mac_key
            .map(|k| {
                <HmacSha1 as Mac>::new_from_slice(k)
                    .map_err(|e| BambooError::config_src("mac key", e))
            })
            .transpose()?;
        Ok(Self { mac })
    }

    fn mac_len(&self) -> usize {
        if self.mac.is_some() {
            MAC_LEN
        } else {
            0
        }
    }

    fn version(&self) -> u32 {
        if self.mac.is_some() {
            VERSION_MAC
        } else {
            VERSION_PLAIN
        }
    }

    /// Largest payload that fits in one datagram.
    pub fn max_payload(&self) -> usize {
        MAX_MSG_SIZE - DATA_HEADER_LEN - self.mac_len()
    }

    pub fn encode_ack(&self, seq: i64) -> Bytes {
        let mut buf = BytesMut::with_capacity(ACK_LEN + self.mac_len());
        buf.put_u32(self.version());
        buf.put_i64(seq);
        self.seal(&mut buf);
        buf.freeze()
    }

    pub fn encode_data(
        &self,
        ack: i64,
        seq: i64,
        wait_ms: i32,
        est_rtt_ms: i32,
        payload: &[u8],
    ) -> Bytes {
        let mut buf = BytesMut::with_capacity(
            DATA_HEADER_LEN + payload.len() + self.mac_len(),
        );
        buf.put_u32(self.version());
        buf.put_i64(ack);
        buf.put_i64(seq);
        buf.put_i32(wait_ms);
        buf.put_i32(est_rtt_ms);
        buf.put_slice(payload);
        self.seal(&mut buf);
        buf.freeze()
    }

    fn seal(&self, buf: &mut BytesMut) {
        if let Some(mac) = &self.mac {
            let mut mac = mac.clone();
            mac.update(&buf[..]);
            buf.put_slice(&mac.finalize().into_bytes());
        }
    }

    /// Decode a received datagram. Errors describe why it was dropped.
    pub fn decode(&self, mut data: Bytes) -> BambooResult<Packet> {
        if data.len() < 4 {
            return Err(BambooError::decode(
                "datagram",
                format!("message < 4 bytes ({})", data.len()),
            ));
        }
        let version = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        match version {
            VERSION_PLAIN => {
                if self.mac.is_some() {
                    return Err(BambooError::unauthenticated(
                        "un-MAC'ed message",
                    ));
                }
                if data.len() < ACK_LEN {
                    return Err(BambooError::decode(
                        "datagram",
                        format!("message < {ACK_LEN} bytes"),
                    ));
                }
            }
            VERSION_MAC => {
                if data.len() < ACK_LEN + MAC_LEN {
                    return Err(BambooError::decode(
                        "datagram",
                        format!("message < {} bytes", ACK_LEN + MAC_LEN),
                    ));
                }
                let body_len = data.len() - MAC_LEN;
                if let Some(mac) = &self.mac {
                    let mut mac = mac.clone();
                    mac.update(&data[..body_len]);
                    if mac.verify_slice(&data[body_len..]).is_err() {
                        return Err(BambooError::unauthenticated(
                            "macs don't match",
                        ));
                    }
                }
                // a node without a key ignores the trailer
                data.truncate(body_len);
            }
            v => {
                return Err(BambooError::decode(
                    "datagram",
                    format!("unknown protocol 0x{v:x}"),
                ));
            }
        }

        data.advance(4);
        if data.len() == ACK_LEN - 4 {
            return Ok(Packet::Ack(data.get_i64()));
        }
        if data.len() < 16 {
            return Err(BambooError::decode("data header", "truncated"));
        }
        let ack = data.get_i64();
        let seq = data.get_i64();
        let (wait_ms, est_rtt_ms) = if data.len() >= 8 {
            (data.get_i32(), data.get_i32())
        } else {
            (-1, -1)
        };
        Ok(Packet::Data(DataPacket {
            ack,
            seq,
            wait_ms,
            est_rtt_ms,
            payload: data,
        }))
    }
}
