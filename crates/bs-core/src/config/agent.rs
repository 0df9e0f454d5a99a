//! Agent configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::serde_utils::duration_secs;
use super::{InstallConfig, UploadPolicy};

/// Configuration for the host agent daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Address the JSON-lines listener binds to
    pub bind_address: String,

    /// Maximum number of simultaneously admitted connections
    pub max_connections: usize,

    /// Root under which per-connection working directories are created
    pub work_dir: PathBuf,

    /// How often the reaper scans for idle uploads
    #[serde(with = "duration_secs")]
    pub reaper_interval: Duration,

    /// Upload limits
    pub upload: UploadPolicy,

    /// Script execution settings
    pub install: InstallConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:5701".to_string(),
            max_connections: 1,
            work_dir: std::env::temp_dir(),
            reaper_interval: Duration::from_secs(60),
            upload: UploadPolicy::default(),
            install: InstallConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Check values the TOML schema cannot express
    pub fn validate(&self) -> Result<(), crate::error::ConfigError> {
        use crate::error::ConfigError;

        if self.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "max_connections must be at least 1".to_string(),
            ));
        }
        if self.reaper_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "reaper_interval must be non-zero".to_string(),
            ));
        }
        self.upload.validate()
    }
}
