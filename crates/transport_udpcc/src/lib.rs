#![deny(missing_docs)]
//! A congestion-controlled, reliable datagram transport for bamboo.
//!
//! Messages are sent over UDP with per-peer AIMD congestion control,
//! Jacobson/Karels rtt estimation, bounded retransmission and duplicate
//! suppression. Packets can optionally be authenticated with HMAC-SHA1.
//!
//! The protocol itself is a sans-io state machine; [UdpCc] drives it
//! against a tokio UDP socket and implements
//! [bamboo_api::transport::Transport].

mod config;
pub use config::*;

mod connection;
mod dup;

mod engine;
pub use engine::PeerStats;

mod error;
pub use error::*;

mod frame;
pub use frame::MAX_MSG_SIZE;

mod priority_queue;
pub use priority_queue::*;

mod udpcc;
pub use udpcc::*;

/// Log to the test writer, filtered by RUST_LOG and defaulting to DEBUG.
#[cfg(test)]
pub(crate) fn enable_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(tracing::Level::DEBUG.into())
                .from_env_lossy(),
        )
        .try_init();
}
