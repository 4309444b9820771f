//! Configuration parameters for the udpcc transport.

use bamboo_api::config::ModConfig;

/// Name of the config section read by [UdpCc::create](crate::UdpCc::create).
pub const UDPCC_CONFIG_SECTION: &str = "udpCc";

/// Largest receive buffer size that will be requested from the OS.
pub const SOCKBUF_MAX: usize = 1_048_575;

/// Configuration parameters for [UdpCc](crate::UdpCc).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct UdpCcConfig {
    /// Local address to bind the socket to.
    ///
    /// Default: "0.0.0.0:0"
    pub bind_addr: String,

    /// Synthetic loss. A send with timeout `T` seconds is dropped before
    /// reaching the wire with probability `p^ceil(T/5)`, and then fails
    /// after `T` seconds.
    ///
    /// Default: 0.0
    pub drop_probability: f64,

    /// Run the socket pump on its own OS thread.
    ///
    /// Default: false
    pub separate_thread: bool,

    /// Socket receive buffer size in bytes. Applied only when in
    /// `1..=1048575`; 0 keeps the OS default.
    ///
    /// Default: 0
    pub sockbuf_size: usize,

    /// Multiplier applied to the retransmit timeout.
    ///
    /// Default: 1.0
    pub timeout_factor: f64,

    /// Milliseconds added to the retransmit timeout after scaling.
    ///
    /// Default: 0.0
    pub timeout_diff: f64,

    /// File holding a 20 byte HMAC-SHA1 key. When set, every packet is
    /// authenticated and unauthenticated packets are dropped.
    ///
    /// Default: none
    pub mac_key_file: Option<String>,

    /// Period in milliseconds of the received/duplicate message report.
    ///
    /// Default: 0 (off)
    pub track_duplicates_period_ms: u64,
}

impl Default for UdpCcConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:0".to_string(),
            drop_probability: 0.0,
            separate_thread: false,
            sockbuf_size: 0,
            timeout_factor: 1.0,
            timeout_diff: 0.0,
            mac_key_file: None,
            track_duplicates_period_ms: 0,
        }
    }
}

impl ModConfig for UdpCcConfig {}

impl UdpCcConfig {
    pub(crate) fn track_duplicates_period(
        &self,
    ) -> Option<std::time::Duration> {
        (self.track_duplicates_period_ms > 0).then(|| {
            std::time::Duration::from_millis(self.track_duplicates_period_ms)
        })
    }
}
