use bamboo_api::BambooError;
use std::net::SocketAddr;

/// Errors raised by the udpcc transport.
#[derive(Debug, thiserror::Error)]
pub enum UdpCcError {
    /// A message does not fit in one datagram.
    #[error("packet too large: {size} bytes, max {max}")]
    PacketTooLarge {
        /// Encoded size of the packet.
        size: usize,
        /// Largest allowed packet.
        max: usize,
    },

    /// A configuration value is unusable.
    #[error("invalid udpcc config: {0}")]
    InvalidConfig(String),

    /// Socket setup failed.
    #[error("socket error on {addr}: {src}")]
    Io {
        /// Address involved.
        addr: SocketAddr,
        /// The OS error.
        #[source]
        src: std::io::Error,
    },

    /// The transport task is gone.
    #[error("udpcc transport has shut down")]
    Closed,

    /// A bamboo error.
    #[error("BambooError - {0}")]
    Bamboo(#[from] BambooError),
}

impl From<UdpCcError> for BambooError {
    fn from(e: UdpCcError) -> Self {
        match e {
            UdpCcError::Bamboo(e) => e,
            e @ UdpCcError::InvalidConfig(_) => {
                BambooError::config_src("udpcc", e)
            }
            e => BambooError::transport_src("udpcc", e),
        }
    }
}

/// Result type of the udpcc transport.
pub type UdpCcResult<T> = Result<T, UdpCcError>;

/// Log and abort. Reserved for socket failures that leave the node unable
/// to talk to anyone; a supervisor is expected to restart the process.
pub(crate) fn fatal(ctx: &str, err: &dyn std::fmt::Display) -> ! {
    tracing::error!("FATAL {ctx}: {err}");
    std::process::abort()
}
