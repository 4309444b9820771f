//! Ring identifiers.
//!
//! Nodes and storage keys share one 160-bit identifier space arranged as
//! a ring: arithmetic is modulo 2^160 and ranges may wrap past zero.

use rand::Rng;

/// Byte length of a [Guid].
pub const GUID_LEN: usize = 20;

/// A 160-bit ring identifier, stored big-endian.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Guid(pub [u8; GUID_LEN]);

impl Guid {
    /// The smallest identifier on the ring.
    pub const MIN: Guid = Guid([0; GUID_LEN]);

    /// The largest identifier on the ring.
    pub const MAX: Guid = Guid([0xff; GUID_LEN]);

    /// Build a guid whose low 64 bits are `v` and whose high bits are zero.
    pub fn from_low_u64(v: u64) -> Self {
        let mut out = [0; GUID_LEN];
        out[GUID_LEN - 8..].copy_from_slice(&v.to_be_bytes());
        Self(out)
    }

    /// Build a guid from its top 64 bits, the rest zero. Handy for placing
    /// identifiers at a fraction of the ring.
    pub fn from_high_u64(v: u64) -> Self {
        let mut out = [0; GUID_LEN];
        out[..8].copy_from_slice(&v.to_be_bytes());
        Self(out)
    }

    /// A uniformly random guid.
    pub fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let mut out = [0; GUID_LEN];
        rng.fill(&mut out[..]);
        Self(out)
    }

    /// The raw big-endian bytes.
    pub fn as_bytes(&self) -> &[u8; GUID_LEN] {
        &self.0
    }

    /// `self - 1` modulo 2^160, so zero wraps to [Guid::MAX].
    pub fn wrapping_sub_one(&self) -> Self {
        let mut out = self.0;
        for b in out.iter_mut().rev() {
            let (v, borrow) = b.overflowing_sub(1);
            *b = v;
            if !borrow {
                break;
            }
        }
        Self(out)
    }

    /// `self + 1` modulo 2^160.
    pub fn wrapping_add_one(&self) -> Self {
        let mut out = self.0;
        for b in out.iter_mut().rev() {
            let (v, carry) = b.overflowing_add(1);
            *b = v;
            if !carry {
                break;
            }
        }
        Self(out)
    }

    /// Is `query` within the inclusive ring interval `[low, high]`?
    ///
    /// When `low > high` the interval wraps through zero.
    pub fn in_range_mod(low: &Guid, high: &Guid, query: &Guid) -> bool {
        if low <= high {
            low <= query && query <= high
        } else {
            query >= low || query <= high
        }
    }
}

impl std::fmt::Display for Guid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("0x")?;
        for b in &self.0[..4] {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Guid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Guid(0x")?;
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        f.write_str(")")
    }
}

impl From<[u8; GUID_LEN]> for Guid {
    fn from(b: [u8; GUID_LEN]) -> Self {
        Self(b)
    }
}

/// An inclusive ring interval `[low, high]`.
///
/// A guid range is the unit of shared responsibility between this node
/// and its leaf-set neighbours: every range indexes one Merkle tree and
/// one entry of the synced-with table. Ordering is by `(low, high)`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GuidRange {
    /// First identifier in the range.
    pub low: Guid,
    /// Last identifier in the range.
    pub high: Guid,
}

impl GuidRange {
    /// The entire ring.
    pub const FULL: GuidRange = GuidRange {
        low: Guid::MIN,
        high: Guid::MAX,
    };

    /// Construct a new range.
    pub fn new(low: Guid, high: Guid) -> Self {
        Self { low, high }
    }

    /// Does this (possibly wrapping) range contain `guid`?
    pub fn contains(&self, guid: &Guid) -> bool {
        Guid::in_range_mod(&self.low, &self.high, guid)
    }
}

impl std::fmt::Display for GuidRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {}]", self.low, self.high)
    }
}

impl std::fmt::Debug for GuidRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "GuidRange{self}")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sub_one_wraps_at_zero() {
        assert_eq!(Guid::MAX, Guid::MIN.wrapping_sub_one());
        assert_eq!(Guid::from_low_u64(255), Guid::from_low_u64(256).wrapping_sub_one());
        assert_eq!(Guid::MIN, Guid::MAX.wrapping_add_one());
        assert_eq!(Guid::from_low_u64(256), Guid::from_low_u64(255).wrapping_add_one());
    }

    #[test]
    fn range_mod_plain_and_wrapping() {
        let a = Guid::from_high_u64(10);
        let b = Guid::from_high_u64(20);
        let mid = Guid::from_high_u64(15);
        let out = Guid::from_high_u64(25);

        assert!(Guid::in_range_mod(&a, &b, &a));
        assert!(Guid::in_range_mod(&a, &b, &b));
        assert!(Guid::in_range_mod(&a, &b, &mid));
        assert!(!Guid::in_range_mod(&a, &b, &out));

        // [20, 10] wraps through zero
        assert!(Guid::in_range_mod(&b, &a, &out));
        assert!(Guid::in_range_mod(&b, &a, &Guid::MIN));
        assert!(Guid::in_range_mod(&b, &a, &Guid::MAX));
        assert!(!Guid::in_range_mod(&b, &a, &mid));
    }

    #[test]
    fn range_ordering_is_low_then_high() {
        let r1 = GuidRange::new(Guid::from_low_u64(1), Guid::from_low_u64(9));
        let r2 = GuidRange::new(Guid::from_low_u64(1), Guid::from_low_u64(10));
        let r3 = GuidRange::new(Guid::from_low_u64(2), Guid::from_low_u64(0));
        assert!(r1 < r2);
        assert!(r2 < r3);
        assert!(GuidRange::FULL.contains(&Guid::random(&mut rand::thread_rng())));
    }

    #[test]
    fn display_is_short_hex() {
        assert_eq!("0xffffffff", Guid::MAX.to_string());
        assert_eq!("[0x00000000, 0xffffffff]", GuidRange::FULL.to_string());
    }
}
