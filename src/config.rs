//! Server configuration.
//!
//! Every field has a default, so a JSON file only needs the values it
//! changes:
//!
//! ```
//! use rpcwire_server::config::EngineConfig;
//!
//! let config = EngineConfig::from_json_str(r#"{
//!     "max_frame_size": 1048576,
//!     "security": { "require_sasl": true }
//! }"#).unwrap();
//!
//! assert_eq!(config.max_frame_size, 1024 * 1024);
//! assert!(config.security.require_sasl);
//! assert!(config.security.allow_fallback_to_simple);
//! ```

use std::path::Path;

use serde::Deserialize;

use crate::error::Result;
use crate::executor::DEFAULT_MAX_CONCURRENT_CALLS;
use crate::protocol::DEFAULT_MAX_FRAME_SIZE;
use crate::reservoir::ReservoirConfig;
use crate::security::SecurityConfig;

/// Per-server settings shared by every connection.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Largest accepted frame body in bytes.
    pub max_frame_size: u32,
    /// Maximum handlers running at once.
    pub max_concurrent_calls: usize,
    pub security: SecurityConfig,
    pub reservoir: ReservoirConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_concurrent_calls: DEFAULT_MAX_CONCURRENT_CALLS,
            security: SecurityConfig::default(),
            reservoir: ReservoirConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Parse from a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }
}
