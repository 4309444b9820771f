#![deny(missing_docs)]
//! The data manager of a bamboo dht node.
//!
//! A [DataManager] keeps the tuples a node stores replicated across its
//! leaf set: it forwards puts and removes to replicas and tracks their
//! acks, repairs divergence with its neighbours through Merkle-tree
//! anti-entropy, and hands tuples it is no longer responsible for to
//! their new home.
//!
//! Storage, transport and routing are collaborators behind the
//! [bamboo_api] traits. [MemStore] and [MemNetwork] are in-process
//! implementations for tests and simulation.

mod anti_entropy;
pub use anti_entropy::{AeOutcome, AeReport};

pub mod config;
pub use config::*;

pub mod constant;

mod data_manager;
pub use data_manager::DataManager;

mod discard;

mod error;
pub use error::*;

mod mem_store;
pub use mem_store::MemStore;

mod mem_transport;
pub use mem_transport::{MemNetwork, MemTransport};

pub mod neighbourhood;

pub mod protocol;

mod replication;
pub use replication::{PutOrRemoveDone, PutOrRemoveReq};

mod synced;

mod tree_state;
