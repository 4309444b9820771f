//! Configuration parameters for the data manager.

use crate::error::*;
use bamboo_api::config::ModConfig;
use bamboo_dht::MAX_EXPANSION;
use std::time::Duration;

/// Name of the config section read by
/// [DataManager::create](crate::DataManager::create).
pub const DATA_MANAGER_CONFIG_SECTION: &str = "dataManager";

/// Configuration parameters for [DataManager](crate::DataManager).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DataManagerConfig {
    /// Total replicas wanted for each tuple. Half of them are kept on each
    /// side of the ring, so this must be even.
    ///
    /// Default: 4294967294 (as many as the leaf set allows)
    pub desired_replicas: u32,

    /// Route replica-set queries iteratively rather than recursively.
    ///
    /// Default: false
    pub iterative_routing: bool,

    /// Log2 of the Merkle tree fan-out.
    ///
    /// Default: 5
    pub merkle_tree_expansion: u32,

    /// Base period of the anti-entropy alarm. Each round fires after a
    /// random delay between one and two periods.
    ///
    /// Default: 1000
    pub ae_period_ms: u64,

    /// Acknowledgements from replicas needed before a put or remove
    /// completes.
    ///
    /// Default: 4294967295 (every replica that was asked)
    pub required_acks: u32,

    /// Resend a put or remove to replicas that have not acked it after
    /// this long.
    ///
    /// Default: 60000
    pub put_retry_time_ms: u64,

    /// Stop waiting for replica acks after this long. When equal to the
    /// retry time nothing is ever resent.
    ///
    /// Default: 60000
    pub put_give_up_time_ms: u64,
}

impl Default for DataManagerConfig {
    fn default() -> Self {
        Self {
            desired_replicas: u32::MAX - 1,
            iterative_routing: false,
            merkle_tree_expansion: 5,
            ae_period_ms: 1000,
            required_acks: u32::MAX,
            put_retry_time_ms: 60_000,
            put_give_up_time_ms: 60_000,
        }
    }
}

impl ModConfig for DataManagerConfig {}

impl DataManagerConfig {
    /// Reject settings the data manager cannot run with.
    pub fn validate(&self) -> DataManagerResult<()> {
        if self.desired_replicas == 0 || self.desired_replicas % 2 != 0 {
            return Err(DataManagerError::InvalidConfig(format!(
                "desiredReplicas must be even and positive, got {}",
                self.desired_replicas
            )));
        }
        if !(1..=MAX_EXPANSION).contains(&self.merkle_tree_expansion) {
            return Err(DataManagerError::InvalidConfig(format!(
                "merkleTreeExpansion must be in 1..={MAX_EXPANSION}, got {}",
                self.merkle_tree_expansion
            )));
        }
        if self.ae_period_ms == 0 {
            return Err(DataManagerError::InvalidConfig(
                "aePeriodMs must be positive".into(),
            ));
        }
        if self.put_give_up_time_ms < self.put_retry_time_ms {
            tracing::warn!(
                retry = self.put_retry_time_ms,
                give_up = self.put_give_up_time_ms,
                "putGiveUpTimeMs is below putRetryTimeMs, puts are never retried"
            );
        }
        Ok(())
    }

    /// Leaf-set members kept on each side.
    pub(crate) fn per_side(&self) -> usize {
        (self.desired_replicas / 2) as usize
    }

    pub(crate) fn ae_period(&self) -> Duration {
        Duration::from_millis(self.ae_period_ms)
    }

    pub(crate) fn put_retry_time(&self) -> Duration {
        Duration::from_millis(self.put_retry_time_ms)
    }

    pub(crate) fn put_give_up_time(&self) -> Duration {
        Duration::from_millis(self.put_give_up_time_ms)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use bamboo_api::config::Config;

    #[test]
    fn defaults_and_section() {
        let config = Config::from_json_str(
            r#"{
              "dataManager": {
                "desiredReplicas": 4,
                "aePeriodMs": 250,
                "requiredAcks": 2
              }
            }"#,
        )
        .unwrap();
        let c: DataManagerConfig = config
            .get_module_config(DATA_MANAGER_CONFIG_SECTION)
            .unwrap();
        assert_eq!(4, c.desired_replicas);
        assert_eq!(2, c.per_side());
        assert_eq!(Duration::from_millis(250), c.ae_period());
        assert_eq!(2, c.required_acks);
        assert_eq!(5, c.merkle_tree_expansion);
        assert_eq!(c.put_retry_time(), c.put_give_up_time());
        c.validate().unwrap();

        DataManagerConfig::default().validate().unwrap();
    }

    #[test]
    fn odd_replicas_are_rejected() {
        for desired_replicas in [0, 3] {
            let err = DataManagerConfig {
                desired_replicas,
                ..Default::default()
            }
            .validate()
            .unwrap_err();
            assert!(err.to_string().contains("desiredReplicas"));
        }
    }

    #[test]
    fn expansion_is_bounded() {
        for merkle_tree_expansion in [0, MAX_EXPANSION + 1] {
            let err = DataManagerConfig {
                merkle_tree_expansion,
                ..Default::default()
            }
            .validate()
            .unwrap_err();
            assert!(err.to_string().contains("merkleTreeExpansion"));
        }
        DataManagerConfig {
            merkle_tree_expansion: MAX_EXPANSION,
            ..Default::default()
        }
        .validate()
        .unwrap();
    }
}
