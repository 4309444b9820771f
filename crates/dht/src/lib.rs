#![deny(missing_docs)]
//! Time-bucketed Merkle trees for bamboo anti-entropy.
//!
//! A [MerkleTree] summarises the keys a node holds for one guid range,
//! bucketed by key creation time, so that two nodes can find the buckets
//! they disagree on by comparing a handful of hashes.

pub mod constant;
pub mod hash;
pub mod merkle;

pub use constant::*;
pub use hash::*;
pub use merkle::*;
