use crate::{
    error::{BridgeError, Result},
    invoke::ownership::OwnershipConventions,
    signature::FallbackPolicy,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Environment variable naming a JSON configuration file.
pub const CONFIG_ENV: &str = "OBJC_BRIDGE_CONFIG";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub fallback: FallbackPolicy,
    pub conventions: OwnershipConventions,
    /// Check that the receiver responds to a selector before sending it.
    pub check_responds: bool,
    /// Box host text, bytes and collections into foreign objects where an
    /// object is expected.
    pub autobox: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            fallback: FallbackPolicy::default(),
            conventions: OwnershipConventions::default(),
            check_responds: true,
            autobox: true,
        }
    }
}

impl BridgeConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| BridgeError::Config(e.to_string()))
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| BridgeError::Config(format!("{}: {e}", path.display())))?;
        Self::from_json(&text)
    }

    /// Load the file named by `OBJC_BRIDGE_CONFIG`, or the defaults when it
    /// is unset.
    pub fn from_env() -> Result<Self> {
        match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::from_path(path),
            None => Ok(Self::default()),
        }
    }
}
