//! Engine configuration.
//!
//! Loaded from TOML. Every section and field is optional:
//!
//! ```toml
//! [connections]
//! grace_ms = 2000
//!
//! [search]
//! include_content = true
//! max_results = 50
//!
//! [bus]
//! event_capacity = 256
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub connections: ConnectionsConfig,
    pub search: SearchConfig,
    pub bus: BusConfig,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionsConfig {
    /// Teardown grace window once a connection's refcount reaches zero.
    pub grace_ms: u64,
}

impl Default for ConnectionsConfig {
    fn default() -> Self {
        Self { grace_ms: 2000 }
    }
}

impl ConnectionsConfig {
    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Fall back to content tokens when the title does not match.
    pub include_content: bool,
    /// Cap on returned hits; `None` = unlimited.
    pub max_results: Option<usize>,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            include_content: true,
            max_results: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Capacity of the run-event broadcast channel.
    pub event_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self { event_capacity: 256 }
    }
}

impl EngineConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a file. A missing file is an error; callers that want
    /// defaults should not pass a path.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&content)?;
        tracing::debug!(path = %path.display(), "loaded engine config");
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.bus.event_capacity == 0 {
            return Err(ConfigError::Invalid("bus.event_capacity must be at least 1".into()));
        }
        if self.search.max_results == Some(0) {
            return Err(ConfigError::Invalid("search.max_results must be at least 1".into()));
        }
        Ok(())
    }
}
