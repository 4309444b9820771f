//! Stateless SHA-1 digests.
//!
//! Each call builds and consumes its own hasher; nothing is shared between
//! call sites.

use bamboo_api::{Hash, Key};
use sha1::{Digest, Sha1};

/// SHA-1 of `data`.
pub fn sha1(data: &[u8]) -> Hash {
    Sha1::digest(data).into()
}

/// Digest of an ordered run of keys: SHA-1 over their concatenated
/// canonical encodings.
///
/// The empty run hashes like the empty string, so empty buckets agree
/// across nodes.
pub fn digest_keys<'a>(keys: impl IntoIterator<Item = &'a Key>) -> Hash {
    let mut hasher = Sha1::new();
    for key in keys {
        hasher.update(key.canonical_bytes());
    }
    hasher.finalize().into()
}

/// Digest of an internal node: SHA-1 over the concatenated child hashes
/// in position order.
pub fn combine_children<'a>(hashes: impl IntoIterator<Item = &'a Hash>) -> Hash {
    let mut hasher = Sha1::new();
    for h in hashes {
        hasher.update(h);
    }
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bamboo_api::{Guid, ZERO_HASH};

    #[test]
    fn known_vector() {
        assert_eq!(
            "a9993e364706816aba3e25717850c26c9cd0d89d",
            sha1(b"abc")
                .iter()
                .map(|b| format!("{b:02x}"))
                .collect::<String>()
        );
    }

    #[test]
    fn empty_runs_agree() {
        assert_eq!(sha1(b""), digest_keys(&[]));
        assert_eq!(sha1(b""), combine_children(&[]));
    }

    #[test]
    fn key_digest_is_order_sensitive() {
        let k = |t| Key {
            time_usec: t,
            ttl_sec: 60,
            guid: Guid::from_low_u64(1),
            secret_hash: ZERO_HASH,
            data_hash: ZERO_HASH,
            is_put: true,
            client_id: std::net::Ipv4Addr::LOCALHOST.into(),
        };
        let (a, b) = (k(1), k(2));
        assert_ne!(digest_keys([&a, &b]), digest_keys([&b, &a]));
        assert_eq!(digest_keys([&a, &b]), digest_keys(vec![&a, &b]));
    }
}
