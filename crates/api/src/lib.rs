#![deny(missing_docs)]
//! Bamboo api contains the basic types of a bamboo dht node and the
//! traits of the collaborators a node is built from: storage, transport
//! and overlay routing.
//!
//! If you want to run a node, please see the bamboo_core crate.

pub mod config;

mod error;
pub use error::*;

mod timestamp;
pub use timestamp::*;

mod guid;
pub use guid::*;

mod key;
pub use key::*;

mod leaf_set;
pub use leaf_set::*;

pub mod router;
pub use router::*;

pub mod store;
pub use store::*;

pub mod transport;
pub use transport::*;
