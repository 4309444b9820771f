//! Types for use when configuring bamboo node modules.
//!
//! A node configuration file is a single JSON object. Each module reads
//! its own named section and falls back to defaults for anything missing:
//!
//! ```json
//! {
//!   "dataManager": { "desiredReplicas": 4, "aePeriodMs": 1000 },
//!   "udpCc": { "bindAddr": "0.0.0.0:3630", "timeoutFactor": 1.5 }
//! }
//! ```

use crate::*;

/// helper transcode function
fn tc<S: serde::Serialize, D: serde::de::DeserializeOwned>(
    s: &S,
) -> BambooResult<D> {
    serde_json::from_str(
        &serde_json::to_string(s)
            .map_err(|e| BambooError::config_src("encode", e))?,
    )
    .map_err(|e| BambooError::config_src("decode", e))
}

/// Denotes a type used to configure a specific node module.
///
/// These are startup-time settings, the likes of which are found in a
/// configuration file. Module configs should tolerate missing properties
/// by deserializing with `#[serde(default)]`.
pub trait ModConfig:
    'static
    + Sized
    + Default
    + std::fmt::Debug
    + serde::Serialize
    + serde::de::DeserializeOwned
    + Send
    + Sync
{
}

/// Node configuration.
#[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct Config(serde_json::Map<String, serde_json::Value>);

impl Config {
    /// Parse a configuration from a JSON string.
    pub fn from_json_str(json: &str) -> BambooResult<Self> {
        serde_json::from_str(json)
            .map_err(|e| BambooError::config_src("parse config", e))
    }

    /// Read and parse a configuration file.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> BambooResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            BambooError::config_src(
                format!("read config {}", path.display()),
                e,
            )
        })?;
        Self::from_json_str(&json)
    }

    /// Add the default settings of a module under `module_name`, used
    /// when generating an example configuration file.
    pub fn add_default_module_config<M: ModConfig>(
        &mut self,
        module_name: String,
    ) -> BambooResult<()> {
        if self.0.contains_key(&module_name) {
            return Err(BambooError::config(format!(
                "Refusing to overwrite conflicting module name: {module_name}"
            )));
        }
        self.0.insert(module_name, tc(&M::default())?);
        Ok(())
    }

    /// Extract a module config. Sections that are absent yield the
    /// module's defaults.
    pub fn get_module_config<M: ModConfig>(
        &self,
        module_name: &str,
    ) -> BambooResult<M> {
        self.0
            .get(module_name)
            .map(tc)
            .unwrap_or_else(|| Ok(M::default()))
    }
}
