//! Storage tuple identity.
//!
//! A [Key] names one stored `(key, value)` tuple. Two encodings exist:
//!
//! - The canonical encoding is fixed size ([KEY_CANONICAL_LEN] bytes) and is
//!   what Merkle digests are computed over, so it must be byte-identical
//!   on every node:
//!
//!   | bytes | field |
//!   |---|---|
//!   | 0-7 | `time_usec`, big-endian |
//!   | 8-11 | `ttl_sec`, big-endian |
//!   | 12-31 | `guid` |
//!   | 32-51 | `secret_hash` (zero when absent) |
//!   | 52-71 | `data_hash` |
//!   | 72 | `is_put` (1 or 0) |
//!   | 73-88 | `client_id` as IPv6 (IPv4 is v4-mapped) |
//!
//! - The wire encoding is compact: the sign bit of `time_usec` flags a
//!   non-zero `secret_hash`, which is only then included, and the client
//!   address is a family byte (4 or 6) followed by 4 or 16 octets.

use crate::{BambooError, BambooResult, Guid, Timestamp, GUID_LEN};
use bytes::{Buf, BufMut};
use std::cmp::Ordering;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Byte length of every digest in this system (SHA-1).
pub const HASH_LEN: usize = 20;

/// A SHA-1 digest.
pub type Hash = [u8; HASH_LEN];

/// The all-zero digest, meaning "no secret".
pub const ZERO_HASH: Hash = [0; HASH_LEN];

/// Length of [Key::canonical_bytes].
pub const KEY_CANONICAL_LEN: usize = 8 + 4 + GUID_LEN + HASH_LEN * 2 + 1 + 16;

/// Set in the wire time field when a secret hash follows the guid.
pub const SECRET_FLAG: u64 = 0x8000_0000_0000_0000;

/// The identity of a stored tuple.
///
/// Uniqueness is by the full tuple, not by guid alone: many values may be
/// stored under one guid. Keys are totally ordered by
/// `(time_usec, ttl_sec, guid, secret_hash, data_hash, is_put, client_id)`,
/// which matches the byte order of the canonical encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Key {
    /// Creation time, microseconds since the unix epoch. Never negative.
    pub time_usec: i64,
    /// Time to live in seconds, counted from `time_usec`.
    pub ttl_sec: i32,
    /// Ring position of the tuple.
    pub guid: Guid,
    /// Hash of the secret that authorises removal, or [ZERO_HASH].
    pub secret_hash: Hash,
    /// Hash of the value. For a remove, the hash of the value of the put
    /// being removed.
    pub data_hash: Hash,
    /// A put (true) or a remove (false).
    pub is_put: bool,
    /// Address of the client that issued the request. Decoders return
    /// v4-mapped IPv6 addresses as IPv4 so that equality, hashing and
    /// ordering agree.
    pub client_id: IpAddr,
}

impl Key {
    /// Expiry time in microseconds since the unix epoch.
    pub fn expiry_usec(&self) -> i64 {
        self.time_usec
            .saturating_add(self.ttl_sec as i64 * 1_000_000)
    }

    /// Has this tuple expired at `now`? A tuple is still live during the
    /// microsecond it expires.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.expiry_usec() < now.as_micros()
    }

    /// Does this key carry a removal secret?
    pub fn has_secret(&self) -> bool {
        self.secret_hash != ZERO_HASH
    }

    /// The client address as 16 octets, IPv4 being v4-mapped.
    pub fn client_octets(&self) -> [u8; 16] {
        match self.client_id {
            IpAddr::V4(a) => a.to_ipv6_mapped().octets(),
            IpAddr::V6(a) => a.octets(),
        }
    }

    /// Write the canonical, fixed-size encoding.
    pub fn encode_canonical(&self, buf: &mut impl BufMut) {
        buf.put_i64(self.time_usec);
        buf.put_i32(self.ttl_sec);
        buf.put_slice(&self.guid.0);
        buf.put_slice(&self.secret_hash);
        buf.put_slice(&self.data_hash);
        buf.put_u8(self.is_put as u8);
        buf.put_slice(&self.client_octets());
    }

    /// The canonical encoding as an array.
    pub fn canonical_bytes(&self) -> [u8; KEY_CANONICAL_LEN] {
        let mut out = [0; KEY_CANONICAL_LEN];
        self.encode_canonical(&mut &mut out[..]);
        out
    }

    /// Read a key in canonical encoding.
    pub fn decode_canonical(buf: &mut impl Buf) -> BambooResult<Self> {
        if buf.remaining() < KEY_CANONICAL_LEN {
            return Err(BambooError::decode("canonical key", "truncated"));
        }
        let time_usec = buf.get_i64();
        let ttl_sec = buf.get_i32();
        let guid = Guid(get_array(buf));
        let secret_hash = get_array(buf);
        let data_hash = get_array(buf);
        let is_put = buf.get_u8() == 1;
        let client: [u8; 16] = get_array(buf);
        Ok(Self {
            time_usec,
            ttl_sec,
            guid,
            secret_hash,
            data_hash,
            is_put,
            client_id: Ipv6Addr::from(client).to_canonical(),
        })
    }

    /// Length of [Key::encode_wire] output.
    pub fn wire_len(&self) -> usize {
        let secret = if self.has_secret() { HASH_LEN } else { 0 };
        let client = match self.client_id {
            IpAddr::V4(_) => 4,
            IpAddr::V6(_) => 16,
        };
        8 + 4 + GUID_LEN + secret + HASH_LEN + 1 + 1 + client
    }

    /// Write the compact wire encoding.
    pub fn encode_wire(&self, buf: &mut impl BufMut) {
        if self.has_secret() {
            buf.put_u64(self.time_usec as u64 | SECRET_FLAG);
        } else {
            buf.put_i64(self.time_usec);
        }
        buf.put_i32(self.ttl_sec);
        buf.put_slice(&self.guid.0);
        if self.has_secret() {
            buf.put_slice(&self.secret_hash);
        }
        buf.put_slice(&self.data_hash);
        buf.put_u8(self.is_put as u8);
        put_ip(buf, &self.client_id);
    }

    /// Read a key in wire encoding.
    pub fn decode_wire(buf: &mut impl Buf) -> BambooResult<Self> {
        need(buf, 8 + 4 + GUID_LEN, "key header")?;
        let raw_time = buf.get_u64();
        let ttl_sec = buf.get_i32();
        let guid = Guid(get_array(buf));
        let secret_hash = if raw_time & SECRET_FLAG != 0 {
            need(buf, HASH_LEN, "key secret hash")?;
            get_array(buf)
        } else {
            ZERO_HASH
        };
        need(buf, HASH_LEN + 1, "key data hash")?;
        let data_hash = get_array(buf);
        let is_put = buf.get_u8() == 1;
        let client_id = get_ip(buf)?;
        Ok(Self {
            time_usec: (raw_time & !SECRET_FLAG) as i64,
            ttl_sec,
            guid,
            secret_hash,
            data_hash,
            is_put,
            client_id,
        })
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        self.time_usec
            .cmp(&other.time_usec)
            .then(self.ttl_sec.cmp(&other.ttl_sec))
            .then(self.guid.cmp(&other.guid))
            .then(self.secret_hash.cmp(&other.secret_hash))
            .then(self.data_hash.cmp(&other.data_hash))
            .then(self.is_put.cmp(&other.is_put))
            .then(self.client_octets().cmp(&other.client_octets()))
    }
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "key={} {} secret_hash=0x{} data_hash=0x{} time_usec=0x{:x} ttl={} client_id={}",
            self.guid,
            if self.is_put { "put" } else { "remove" },
            hex4(&self.secret_hash),
            hex4(&self.data_hash),
            self.time_usec,
            self.ttl_sec,
            self.client_id,
        )
    }
}

/// First four bytes of a digest as hex, for log lines.
pub fn hex4(h: &[u8]) -> String {
    h.iter().take(4).map(|b| format!("{b:02x}")).collect()
}

/// Write an ip address as a family byte (4 or 6) and its octets.
pub fn put_ip(buf: &mut impl BufMut, ip: &IpAddr) {
    match ip {
        IpAddr::V4(a) => {
            buf.put_u8(4);
            buf.put_slice(&a.octets());
        }
        IpAddr::V6(a) => {
            buf.put_u8(6);
            buf.put_slice(&a.octets());
        }
    }
}

/// Read an ip address written by [put_ip]. A v4-mapped IPv6 address
/// comes back as IPv4.
pub fn get_ip(buf: &mut impl Buf) -> BambooResult<IpAddr> {
    need(buf, 1, "ip family")?;
    match buf.get_u8() {
        4 => {
            need(buf, 4, "ipv4 octets")?;
            let o: [u8; 4] = get_array(buf);
            Ok(IpAddr::V4(Ipv4Addr::from(o)))
        }
        6 => {
            need(buf, 16, "ipv6 octets")?;
            let o: [u8; 16] = get_array(buf);
            Ok(Ipv6Addr::from(o).to_canonical())
        }
        f => Err(BambooError::decode(
            "ip family",
            format!("unknown family {f}"),
        )),
    }
}

fn need(buf: &impl Buf, n: usize, what: &str) -> BambooResult<()> {
    if buf.remaining() < n {
        return Err(BambooError::decode(what, "truncated"));
    }
    Ok(())
}

fn get_array<const N: usize>(buf: &mut impl Buf) -> [u8; N] {
    let mut out = [0; N];
    buf.copy_to_slice(&mut out);
    out
}

#[cfg(test)]
mod test {
    use super::*;

    fn key(time_usec: i64, secret: Hash, client: IpAddr) -> Key {
        Key {
            time_usec,
            ttl_sec: 3600,
            guid: Guid::from_high_u64(0x1234),
            secret_hash: secret,
            data_hash: [7; HASH_LEN],
            is_put: true,
            client_id: client,
        }
    }

    #[test]
    fn wire_flags_secret_in_time_sign_bit() {
        let v4 = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let plain = key(1_000, ZERO_HASH, v4);
        let mut buf = Vec::new();
        plain.encode_wire(&mut buf);
        assert_eq!(plain.wire_len(), buf.len());
        assert_eq!(0, buf[0] & 0x80);
        assert_eq!(plain, Key::decode_wire(&mut &buf[..]).unwrap());

        let secret = key(1_000, [9; HASH_LEN], v4);
        let mut buf = Vec::new();
        secret.encode_wire(&mut buf);
        assert_eq!(secret.wire_len(), buf.len());
        assert_eq!(0x80, buf[0] & 0x80);
        assert_eq!(buf.len(), 20 + plain.wire_len());
        let back = Key::decode_wire(&mut &buf[..]).unwrap();
        assert_eq!(1_000, back.time_usec);
        assert_eq!([9; HASH_LEN], back.secret_hash);
    }

    #[test]
    fn canonical_encoding_is_fixed_size() {
        let v6 = IpAddr::V6("2001:db8::1".parse().unwrap());
        let v4 = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1));
        let a = key(5, ZERO_HASH, v4).canonical_bytes();
        let b = key(5, [1; HASH_LEN], v6).canonical_bytes();
        assert_eq!(KEY_CANONICAL_LEN, a.len());
        assert_eq!(KEY_CANONICAL_LEN, b.len());
        assert_eq!(
            key(5, ZERO_HASH, v4),
            Key::decode_canonical(&mut &a[..]).unwrap()
        );
        assert_eq!(
            key(5, [1; HASH_LEN], v6),
            Key::decode_canonical(&mut &b[..]).unwrap()
        );
    }

    #[test]
    fn ordering_matches_canonical_bytes() {
        let v4 = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let mut keys = vec![
            key(30, ZERO_HASH, v4),
            key(10, [2; HASH_LEN], v4),
            key(10, [1; HASH_LEN], v4),
            key(20, ZERO_HASH, IpAddr::V6("::2".parse().unwrap())),
            key(20, ZERO_HASH, v4),
        ];
        let mut by_bytes = keys.clone();
        keys.sort();
        by_bytes.sort_by_key(|k| k.canonical_bytes());
        assert_eq!(keys, by_bytes);
    }

    #[test]
    fn mapped_client_decodes_as_ipv4() {
        use std::collections::HashSet;
        let v4 = Ipv4Addr::new(10, 0, 0, 1);
        let mapped = key(1, ZERO_HASH, IpAddr::V6(v4.to_ipv6_mapped()));
        let plain = key(1, ZERO_HASH, IpAddr::V4(v4));
        assert_eq!(Ordering::Equal, mapped.cmp(&plain));

        let mut buf = Vec::new();
        mapped.encode_wire(&mut buf);
        let back = Key::decode_wire(&mut &buf[..]).unwrap();
        assert_eq!(IpAddr::V4(v4), back.client_id);
        assert_eq!(plain, back);

        let set: HashSet<Key> = [plain, back].into_iter().collect();
        assert_eq!(1, set.len());

        let mut buf = Vec::new();
        put_ip(&mut buf, &IpAddr::V6("2001:db8::1".parse().unwrap()));
        assert!(get_ip(&mut &buf[..]).unwrap().is_ipv6());
    }

    #[test]
    fn truncated_wire_key() {
        let k = key(1, [3; HASH_LEN], IpAddr::V4(Ipv4Addr::LOCALHOST));
        let mut buf = Vec::new();
        k.encode_wire(&mut buf);
        buf.truncate(40);
        let err = Key::decode_wire(&mut &buf[..]).unwrap_err();
        assert!(err.to_string().contains("truncated"));
    }

    #[test]
    fn expiry() {
        let k = key(1_000_000, ZERO_HASH, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(1_000_000 + 3600 * 1_000_000, k.expiry_usec());
        assert!(!k.is_expired(Timestamp::from_micros(2_000_000)));
        assert!(!k.is_expired(Timestamp::from_micros(k.expiry_usec())));
        assert!(k.is_expired(Timestamp::from_micros(k.expiry_usec() + 1)));
    }
}
