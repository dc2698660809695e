//! Server configuration.
//!
//! Supports loading from YAML files with environment variable overrides.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use overwatch_core::SourceConfig;

/// Server configuration loaded from YAML with environment overrides.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    /// Directory for persistent state (workflows, alarms, events, snapshots).
    /// Override: `OVERWATCH_DATA_DIR`
    pub data_dir: Option<PathBuf>,

    /// Directory of workflow documents (JSON or YAML) deployed at startup.
    /// Override: `OVERWATCH_WORKFLOWS_DIR`
    pub workflows_dir: Option<PathBuf>,

    /// Sources started at boot.
    pub sources: Vec<SourceConfig>,

    /// Core runtime tuning; defaults apply to anything omitted.
    pub core: overwatch_core::Config,
}

impl ServerConfig {
    /// Loads configuration from a YAML file, then applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Applies environment variable overrides to the configuration.
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("OVERWATCH_DATA_DIR") {
            if !val.is_empty() {
                self.data_dir = Some(PathBuf::from(val));
            }
        }
        if let Ok(val) = std::env::var("OVERWATCH_WORKFLOWS_DIR") {
            if !val.is_empty() {
                self.workflows_dir = Some(PathBuf::from(val));
            }
        }
    }
}
