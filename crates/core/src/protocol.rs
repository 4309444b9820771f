//! Data manager wire messages.
//!
//! Every message starts with a one byte tag. Integers are big-endian,
//! guids and hashes are raw bytes, variable length fields carry a `u32`
//! length prefix, and keys use [Key::encode_wire].

use crate::error::*;
use bamboo_api::*;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::net::IpAddr;

const TAG_PUT_OR_REMOVE: u8 = 1;
const TAG_PUT_OR_REMOVE_ACK: u8 = 2;
const TAG_FETCH_NODE_REQ: u8 = 3;
const TAG_FETCH_NODE_RESP: u8 = 4;
const TAG_FETCH_NODE_REJECT: u8 = 5;
const TAG_FETCH_KEYS_REQ: u8 = 6;
const TAG_FETCH_KEYS_RESP: u8 = 7;
const TAG_FETCH_DATA_REQ: u8 = 8;
const TAG_FETCH_DATA_RESP: u8 = 9;

/// A put or remove forwarded from the root of a key to a replica, or
/// handed to a new home by the discard process.
///
/// For a remove, `value` is the secret whose hash must equal
/// `secret_hash`, and `value_hash` names the put being removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutOrRemoveMsg {
    /// Creation time in microseconds.
    pub time_usec: i64,
    /// Time to live in seconds.
    pub ttl_sec: i32,
    /// Ring position of the tuple.
    pub guid: Guid,
    /// The value, or the removal secret.
    pub value: Bytes,
    /// Put or remove.
    pub is_put: bool,
    /// Address of the requesting client.
    pub client_id: IpAddr,
    /// Echoed in the [PutOrRemoveAck].
    pub seq: u64,
    /// Hash of the removed value. Not sent for puts, whose hash the
    /// receiver computes.
    pub value_hash: Hash,
    /// Hash of the removal secret, [ZERO_HASH] if none.
    pub secret_hash: Hash,
}

impl PutOrRemoveMsg {
    /// Build the message that stores `key` with `value` on a peer.
    pub fn from_key(key: &Key, value: Bytes, seq: u64) -> Self {
        Self {
            time_usec: key.time_usec,
            ttl_sec: key.ttl_sec,
            guid: key.guid,
            value,
            is_put: key.is_put,
            client_id: key.client_id,
            seq,
            value_hash: key.data_hash,
            secret_hash: key.secret_hash,
        }
    }
}

/// Acknowledges a [PutOrRemoveMsg] once the tuple is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PutOrRemoveAck {
    /// The `seq` of the acknowledged message.
    pub seq: u64,
}

/// Ask a peer for one node of its Merkle tree over a shared range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchNodeReq {
    /// Ring position of the requester.
    pub peer_guid: Guid,
    /// The shared range the tree covers.
    pub range: GuidRange,
    /// The requester's tree expansion; both sides must agree.
    pub expansion: u32,
    /// Level of the requested node.
    pub level: u32,
    /// Low time of the requested node.
    pub low_time: i64,
    /// The requester's hash of the node. Children are only returned when
    /// the hashes differ.
    pub expected_hash: Option<Hash>,
    /// Echoed in the reply.
    pub seq: u64,
}

/// A tree node, answering a [FetchNodeReq].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchNodeResp {
    /// Hash of the node.
    pub hash: Hash,
    /// True when the node hashes its keys directly.
    pub leaf: bool,
    /// Child hashes in position order, when the node has children and the
    /// expected hash did not match.
    pub children: Option<Vec<Hash>>,
    /// The request's `seq`.
    pub seq: u64,
}

/// Why a [FetchNodeReq] was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// The range is not one the two nodes share.
    BadGuidRange,
    /// The trees use different expansions.
    BadExpansion,
    /// The node is not materialised in the responder's tree.
    NoSuchNode,
}

impl RejectReason {
    fn to_u8(self) -> u8 {
        match self {
            Self::BadGuidRange => 1,
            Self::BadExpansion => 2,
            Self::NoSuchNode => 3,
        }
    }

    fn from_u8(v: u8) -> DataManagerResult<Self> {
        match v {
            1 => Ok(Self::BadGuidRange),
            2 => Ok(Self::BadExpansion),
            3 => Ok(Self::NoSuchNode),
            v => Err(DataManagerError::decode(
                "reject reason",
                format!("unknown value {v}"),
            )),
        }
    }
}

/// A refused [FetchNodeReq].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchNodeReject {
    /// Why.
    pub reason: RejectReason,
    /// The request's `seq`.
    pub seq: u64,
}

/// Ask for the keys in one time bucket of a shared range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchKeysReq {
    /// Only keys whose guid lies in this range.
    pub range: GuidRange,
    /// First time of the bucket.
    pub low_time: i64,
    /// End of the bucket, exclusive.
    pub high_time: i64,
    /// Echoed in the reply.
    pub seq: u64,
}

/// Keys answering a [FetchKeysReq]; `None` when the bucket is empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchKeysResp {
    /// The keys, at most `2^expansion + 1` of them.
    pub keys: Option<Vec<Key>>,
    /// The request's `seq`.
    pub seq: u64,
}

/// Ask for the value of one tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchDataReq {
    /// The tuple.
    pub key: Key,
}

/// The value of a tuple, `None` if the responder no longer has it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchDataResp {
    /// The tuple.
    pub key: Key,
    /// Its value.
    pub data: Option<Bytes>,
}

/// Any data manager message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DmMessage {
    /// See [PutOrRemoveMsg].
    PutOrRemove(PutOrRemoveMsg),
    /// See [PutOrRemoveAck].
    PutOrRemoveAck(PutOrRemoveAck),
    /// See [FetchNodeReq].
    FetchNodeReq(FetchNodeReq),
    /// See [FetchNodeResp].
    FetchNodeResp(FetchNodeResp),
    /// See [FetchNodeReject].
    FetchNodeReject(FetchNodeReject),
    /// See [FetchKeysReq].
    FetchKeysReq(FetchKeysReq),
    /// See [FetchKeysResp].
    FetchKeysResp(FetchKeysResp),
    /// See [FetchDataReq].
    FetchDataReq(FetchDataReq),
    /// See [FetchDataResp].
    FetchDataResp(FetchDataResp),
}

impl DmMessage {
    /// Short name for log lines.
    pub fn name(&self) -> &'static str {
        match self {
            Self::PutOrRemove(_) => "PutOrRemoveMsg",
            Self::PutOrRemoveAck(_) => "PutOrRemoveAck",
            Self::FetchNodeReq(_) => "FetchMerkleTreeNodeReq",
            Self::FetchNodeResp(_) => "FetchMerkleTreeNodeResp",
            Self::FetchNodeReject(_) => "FetchMerkleTreeNodeReject",
            Self::FetchKeysReq(_) => "FetchKeysReq",
            Self::FetchKeysResp(_) => "FetchKeysResp",
            Self::FetchDataReq(_) => "FetchDataReq",
            Self::FetchDataResp(_) => "FetchDataResp",
        }
    }

    /// Encode for the transport.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            Self::PutOrRemove(m) => {
                buf.put_u8(TAG_PUT_OR_REMOVE);
                let has_secret = m.secret_hash != ZERO_HASH;
                if has_secret {
                    buf.put_u64(m.time_usec as u64 | SECRET_FLAG);
                } else {
                    buf.put_i64(m.time_usec);
                }
                buf.put_i32(m.ttl_sec);
                buf.put_slice(m.guid.as_bytes());
                put_bytes(&mut buf, &m.value);
                buf.put_u8(m.is_put as u8);
                put_ip(&mut buf, &m.client_id);
                buf.put_u64(m.seq);
                if !m.is_put {
                    buf.put_slice(&m.value_hash);
                }
                if has_secret {
                    buf.put_slice(&m.secret_hash);
                }
            }
            Self::PutOrRemoveAck(m) => {
                buf.put_u8(TAG_PUT_OR_REMOVE_ACK);
                buf.put_u64(m.seq);
            }
            Self::FetchNodeReq(m) => {
                buf.put_u8(TAG_FETCH_NODE_REQ);
                buf.put_slice(m.peer_guid.as_bytes());
                put_range(&mut buf, &m.range);
                buf.put_u32(m.expansion);
                buf.put_u32(m.level);
                buf.put_i64(m.low_time);
                match &m.expected_hash {
                    None => buf.put_u32(0),
                    Some(h) => {
                        buf.put_u32(HASH_LEN as u32);
                        buf.put_slice(h);
                    }
                }
                buf.put_u64(m.seq);
            }
            Self::FetchNodeResp(m) => {
                buf.put_u8(TAG_FETCH_NODE_RESP);
                buf.put_slice(&m.hash);
                buf.put_u8(m.leaf as u8);
                buf.put_u64(m.seq);
                match &m.children {
                    None => buf.put_u32(0),
                    Some(c) => {
                        buf.put_u32(c.len() as u32);
                        for h in c {
                            buf.put_slice(h);
                        }
                    }
                }
            }
            Self::FetchNodeReject(m) => {
                buf.put_u8(TAG_FETCH_NODE_REJECT);
                buf.put_u8(m.reason.to_u8());
                buf.put_u64(m.seq);
            }
            Self::FetchKeysReq(m) => {
                buf.put_u8(TAG_FETCH_KEYS_REQ);
                put_range(&mut buf, &m.range);
                buf.put_i64(m.low_time);
                buf.put_i64(m.high_time);
                buf.put_u64(m.seq);
            }
            Self::FetchKeysResp(m) => {
                buf.put_u8(TAG_FETCH_KEYS_RESP);
                match &m.keys {
                    None => buf.put_u32(0),
                    Some(keys) => {
                        buf.put_u32(keys.len() as u32);
                        for k in keys {
                            k.encode_wire(&mut buf);
                        }
                    }
                }
                buf.put_u64(m.seq);
            }
            Self::FetchDataReq(m) => {
                buf.put_u8(TAG_FETCH_DATA_REQ);
                m.key.encode_wire(&mut buf);
            }
            Self::FetchDataResp(m) => {
                buf.put_u8(TAG_FETCH_DATA_RESP);
                m.key.encode_wire(&mut buf);
                match &m.data {
                    None => buf.put_u8(0),
                    Some(d) => {
                        buf.put_u8(1);
                        put_bytes(&mut buf, d);
                    }
                }
            }
        }
        buf.freeze()
    }

    /// Decode a message received from the transport.
    pub fn decode(mut data: Bytes) -> DataManagerResult<Self> {
        need(&data, 1, "message tag")?;
        let out = match data.get_u8() {
            TAG_PUT_OR_REMOVE => {
                let what = "PutOrRemoveMsg";
                need(&data, 8 + 4 + GUID_LEN, what)?;
                let raw_time = data.get_u64();
                let ttl_sec = data.get_i32();
                let guid = Guid(get_array(&mut data));
                let value = get_bytes(&mut data, what)?;
                need(&data, 1, what)?;
                let is_put = data.get_u8() == 1;
                let client_id = get_ip(&mut data)
                    .map_err(|e| DataManagerError::decode(what, e))?;
                need(&data, 8, what)?;
                let seq = data.get_u64();
                let value_hash = if is_put {
                    ZERO_HASH
                } else {
                    need(&data, HASH_LEN, what)?;
                    get_array(&mut data)
                };
                let secret_hash = if raw_time & SECRET_FLAG != 0 {
                    need(&data, HASH_LEN, what)?;
                    get_array(&mut data)
                } else {
                    ZERO_HASH
                };
                Self::PutOrRemove(PutOrRemoveMsg {
                    time_usec: (raw_time & !SECRET_FLAG) as i64,
                    ttl_sec,
                    guid,
                    value,
                    is_put,
                    client_id,
                    seq,
                    value_hash,
                    secret_hash,
                })
            }
            TAG_PUT_OR_REMOVE_ACK => {
                need(&data, 8, "PutOrRemoveAck")?;
                Self::PutOrRemoveAck(PutOrRemoveAck {
                    seq: data.get_u64(),
                })
            }
            TAG_FETCH_NODE_REQ => {
                let what = "FetchMerkleTreeNodeReq";
                need(&data, GUID_LEN * 3 + 4 + 4 + 8 + 4, what)?;
                let peer_guid = Guid(get_array(&mut data));
                let range = get_range(&mut data);
                let expansion = data.get_u32();
                let level = data.get_u32();
                let low_time = data.get_i64();
                let expected_hash = match data.get_u32() as usize {
                    0 => None,
                    HASH_LEN => {
                        need(&data, HASH_LEN, what)?;
                        Some(get_array(&mut data))
                    }
                    n => {
                        return Err(DataManagerError::decode(
                            what,
                            format!("hash length {n}"),
                        ))
                    }
                };
                need(&data, 8, what)?;
                Self::FetchNodeReq(FetchNodeReq {
                    peer_guid,
                    range,
                    expansion,
                    level,
                    low_time,
                    expected_hash,
                    seq: data.get_u64(),
                })
            }
            TAG_FETCH_NODE_RESP => {
                let what = "FetchMerkleTreeNodeResp";
                need(&data, HASH_LEN + 1 + 8 + 4, what)?;
                let hash = get_array(&mut data);
                let leaf = data.get_u8() == 1;
                let seq = data.get_u64();
                let count = data.get_u32() as usize;
                let children = if count == 0 {
                    None
                } else {
                    need(&data, count.saturating_mul(HASH_LEN), what)?;
                    Some((0..count).map(|_| get_array(&mut data)).collect())
                };
                Self::FetchNodeResp(FetchNodeResp {
                    hash,
                    leaf,
                    children,
                    seq,
                })
            }
            TAG_FETCH_NODE_REJECT => {
                need(&data, 1 + 8, "FetchMerkleTreeNodeReject")?;
                let reason = RejectReason::from_u8(data.get_u8())?;
                Self::FetchNodeReject(FetchNodeReject {
                    reason,
                    seq: data.get_u64(),
                })
            }
            TAG_FETCH_KEYS_REQ => {
                need(&data, GUID_LEN * 2 + 8 * 3, "FetchKeysReq")?;
                Self::FetchKeysReq(FetchKeysReq {
                    range: get_range(&mut data),
                    low_time: data.get_i64(),
                    high_time: data.get_i64(),
                    seq: data.get_u64(),
                })
            }
            TAG_FETCH_KEYS_RESP => {
                let what = "FetchKeysResp";
                need(&data, 4, what)?;
                let count = data.get_u32() as usize;
                let keys = if count == 0 {
                    None
                } else {
                    let mut keys = Vec::with_capacity(count.min(1024));
                    for _ in 0..count {
                        keys.push(get_key(&mut data, what)?);
                    }
                    Some(keys)
                };
                need(&data, 8, what)?;
                Self::FetchKeysResp(FetchKeysResp {
                    keys,
                    seq: data.get_u64(),
                })
            }
            TAG_FETCH_DATA_REQ => Self::FetchDataReq(FetchDataReq {
                key: get_key(&mut data, "FetchDataReq")?,
            }),
            TAG_FETCH_DATA_RESP => {
                let what = "FetchDataResp";
                let key = get_key(&mut data, what)?;
                need(&data, 1, what)?;
                let data = match data.get_u8() {
                    0 => None,
                    _ => Some(get_bytes(&mut data, what)?),
                };
                Self::FetchDataResp(FetchDataResp { key, data })
            }
            tag => {
                return Err(DataManagerError::decode(
                    "message tag",
                    format!("unknown tag {tag}"),
                ))
            }
        };
        Ok(out)
    }
}

fn need(buf: &Bytes, n: usize, what: &'static str) -> DataManagerResult<()> {
    if buf.remaining() < n {
        return Err(DataManagerError::decode(what, "truncated"));
    }
    Ok(())
}

fn get_array<const N: usize>(buf: &mut Bytes) -> [u8; N] {
    let mut out = [0; N];
    buf.copy_to_slice(&mut out);
    out
}

fn put_bytes(buf: &mut BytesMut, b: &[u8]) {
    buf.put_u32(b.len() as u32);
    buf.put_slice(b);
}

fn get_bytes(buf: &mut Bytes, what: &'static str) -> DataManagerResult<Bytes> {
    need(buf, 4, what)?;
    let len = buf.get_u32() as usize;
    need(buf, len, what)?;
    Ok(buf.split_to(len))
}

fn put_range(buf: &mut BytesMut, range: &GuidRange) {
    buf.put_slice(range.low.as_bytes());
    buf.put_slice(range.high.as_bytes());
}

fn get_range(buf: &mut Bytes) -> GuidRange {
    let low = Guid(get_array(buf));
    let high = Guid(get_array(buf));
    GuidRange::new(low, high)
}

fn get_key(buf: &mut Bytes, what: &'static str) -> DataManagerResult<Key> {
    Key::decode_wire(buf).map_err(|e| DataManagerError::decode(what, e))
}

#[cfg(test)]
mod test {
    use super::*;
    use std::net::Ipv4Addr;

    fn key(is_put: bool, secret_hash: Hash) -> Key {
        Key {
            time_usec: 1_700_000_000_000_000,
            ttl_sec: 600,
            guid: Guid::from_high_u64(0xabcd),
            secret_hash,
            data_hash: [4; HASH_LEN],
            is_put,
            client_id: IpAddr::V4(Ipv4Addr::new(192, 168, 1, 9)),
        }
    }

    #[test]
    fn put_without_secret_carries_no_hashes() {
        let msg = PutOrRemoveMsg::from_key(
            &key(true, ZERO_HASH),
            Bytes::from_static(b"value"),
            7,
        );
        let enc = DmMessage::PutOrRemove(msg.clone()).encode();
        // tag, time, ttl, guid, len + value, is_put, ip, seq
        assert_eq!(1 + 8 + 4 + 20 + 4 + 5 + 1 + 5 + 8, enc.len());
        assert_eq!(0, enc[1] & 0x80);
        match DmMessage::decode(enc).unwrap() {
            DmMessage::PutOrRemove(back) => {
                assert_eq!(msg.value, back.value);
                assert_eq!(ZERO_HASH, back.value_hash);
                assert_eq!(7, back.seq);
            }
            m => panic!("unexpected {m:?}"),
        }
    }

    #[test]
    fn remove_with_secret_sets_time_flag() {
        let k = key(false, [9; HASH_LEN]);
        let msg =
            PutOrRemoveMsg::from_key(&k, Bytes::from_static(b"secret"), 3);
        let enc = DmMessage::PutOrRemove(msg.clone()).encode();
        assert_eq!(0x80, enc[1] & 0x80);
        assert_eq!(1 + 8 + 4 + 20 + 4 + 6 + 1 + 5 + 8 + 20 + 20, enc.len());
        // same flagged time field as a wire key
        let mut wire = Vec::new();
        k.encode_wire(&mut wire);
        assert_eq!(&wire[..8], &enc[1..9]);
        let raw = u64::from_be_bytes(enc[1..9].try_into().unwrap());
        assert_eq!(k.time_usec as u64, raw & !SECRET_FLAG);
        assert_eq!(
            DmMessage::PutOrRemove(msg),
            DmMessage::decode(enc).unwrap()
        );
    }

    #[test]
    fn node_response_children_are_optional() {
        let leaf = DmMessage::FetchNodeResp(FetchNodeResp {
            hash: [1; HASH_LEN],
            leaf: true,
            children: None,
            seq: 11,
        });
        let enc = leaf.encode();
        assert_eq!(1 + 20 + 1 + 8 + 4, enc.len());
        assert_eq!(leaf, DmMessage::decode(enc).unwrap());

        let inner = DmMessage::FetchNodeResp(FetchNodeResp {
            hash: [1; HASH_LEN],
            leaf: false,
            children: Some(vec![[2; HASH_LEN], [3; HASH_LEN]]),
            seq: 12,
        });
        assert_eq!(inner, DmMessage::decode(inner.encode()).unwrap());
    }

    #[test]
    fn empty_key_list_is_none() {
        let resp = DmMessage::FetchKeysResp(FetchKeysResp {
            keys: None,
            seq: 5,
        });
        let enc = resp.encode();
        assert_eq!(1 + 4 + 8, enc.len());
        assert_eq!(resp, DmMessage::decode(enc).unwrap());
    }

    #[test]
    fn bad_messages() {
        let err = DmMessage::decode(Bytes::new()).unwrap_err();
        assert!(err.to_string().contains("truncated"));

        let err = DmMessage::decode(Bytes::from_static(&[42])).unwrap_err();
        assert!(err.to_string().contains("unknown tag 42"));

        let err = DmMessage::decode(Bytes::from_static(&[
            TAG_FETCH_NODE_REJECT,
            9,
            0,
            0,
            0,
            0,
            0,
            0,
            0,
            1,
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("unknown value 9"));

        let mut enc = DmMessage::FetchDataReq(FetchDataReq {
            key: key(true, ZERO_HASH),
        })
        .encode()
        .to_vec();
        enc.truncate(enc.len() - 3);
        let err = DmMessage::decode(Bytes::from(enc)).unwrap_err();
        assert!(err.to_string().contains("FetchDataReq"));
    }
}
