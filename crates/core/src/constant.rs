//! Timing constants of the data manager.

use std::time::Duration;

/// An anti-entropy session with no progress for this long is abandoned.
pub const AE_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(30);

/// A discard attempt without an ack after this long is abandoned and the
/// tuple is kept.
pub const DISCARD_TIMEOUT: Duration = Duration::from_secs(60);

/// Base period of the discard alarm; each round adds up to the same again.
pub const DISCARD_PERIOD: Duration = Duration::from_secs(5);

/// Base period of the put/remove ack sweep.
pub const ACK_SWEEP_PERIOD: Duration = Duration::from_secs(30);

/// Maximum jitter added to [ACK_SWEEP_PERIOD].
pub const ACK_SWEEP_JITTER: Duration = Duration::from_secs(60);

/// Transport timeout of every message the data manager sends.
pub const MESSAGE_TIMEOUT: Duration = Duration::from_secs(60);
