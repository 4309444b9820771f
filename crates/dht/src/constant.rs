//! Constants used by the Merkle trees.

/// Bits of key time covered by the tallest possible tree. Levels are
/// `TIME_BITS / expansion + 1`, so the root spans at most `2^TIME_BITS`
/// microseconds.
pub const TIME_BITS: u32 = 62;

/// Largest supported expansion. Larger fan-outs leave the root too narrow
/// to cover present-day timestamps.
pub const MAX_EXPANSION: u32 = 15;
