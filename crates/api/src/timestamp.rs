/// Wall-clock timestamp.
///
/// Internally i64 microseconds from unix epoch, which is also the unit
/// of a storage key's `time_usec` and of Merkle tree bucket bounds.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Construct a new timestamp of "now".
    pub fn now() -> Self {
        std::time::SystemTime::now().into()
    }

    /// Construct a timestamp from i64 microseconds since unix epoch.
    pub fn from_micros(micros: i64) -> Self {
        Self(micros)
    }

    /// Get the i64 microseconds since unix epoch.
    pub fn as_micros(&self) -> i64 {
        self.0
    }
}

impl From<std::time::SystemTime> for Timestamp {
    fn from(t: std::time::SystemTime) -> Self {
        // clocks before the epoch read as the epoch
        Self(
            t.duration_since(std::time::SystemTime::UNIX_EPOCH)
                .map(|d| d.as_micros() as i64)
                .unwrap_or_default(),
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::{Duration, SystemTime};

    #[test]
    fn from_system_time() {
        let t = SystemTime::UNIX_EPOCH + Duration::from_micros(1_500_000);
        assert_eq!(1_500_000, Timestamp::from(t).as_micros());
        let before = SystemTime::UNIX_EPOCH - Duration::from_secs(1);
        assert_eq!(0, Timestamp::from(before).as_micros());
    }

    #[test]
    fn now_fits_the_tree_span() {
        let now = Timestamp::now().as_micros();
        assert!(now > 0);
        assert!(now < 1 << 62);
    }
}
