use bamboo_api::{BambooError, Key};

/// Errors raised by the data manager.
#[derive(Debug, thiserror::Error)]
pub enum DataManagerError {
    /// A remove whose secret does not hash to the key's secret hash.
    #[error("bad remove proof for {key}")]
    BadRemoveProof {
        /// The key of the rejected remove.
        key: Key,
    },

    /// A configuration value is unusable.
    #[error("invalid data manager config: {0}")]
    InvalidConfig(String),

    /// A peer message could not be decoded.
    #[error("decode {what}: {reason}")]
    Decode {
        /// The message or field being decoded.
        what: &'static str,
        /// What was wrong with it.
        reason: String,
    },

    /// The data manager task is gone.
    #[error("data manager has shut down")]
    Closed,

    /// A bamboo error.
    #[error("BambooError - {0}")]
    Bamboo(#[from] BambooError),
}

impl DataManagerError {
    pub(crate) fn decode(what: &'static str, reason: impl ToString) -> Self {
        Self::Decode {
            what,
            reason: reason.to_string(),
        }
    }
}

impl From<DataManagerError> for BambooError {
    fn from(e: DataManagerError) -> Self {
        match e {
            DataManagerError::Bamboo(e) => e,
            e @ DataManagerError::InvalidConfig(_) => {
                BambooError::config_src("data manager", e)
            }
            e => BambooError::other_src("data manager", e),
        }
    }
}

/// Result type of the data manager.
pub type DataManagerResult<T> = Result<T, DataManagerError>;
