// rtunnel - CLI Config Module
// Where the CLI finds the daemon; request logic lives in rtunnel_common::daemon_client

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub use rtunnel_common::DaemonClientConfig;

/// CLI configuration (wrapper around DaemonClientConfig with file I/O)
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CliConfig {
    #[serde(flatten)]
    pub daemon_config: DaemonClientConfig,
}

impl CliConfig {
    /// Load CLI configuration, falling back to defaults when the file is missing
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path).context("Failed to read CLI configuration")?;
        toml::from_str(&contents).with_context(|| {
            format!("Failed to parse CLI configuration {}", path.display())
        })
    }

    /// Get the path to the CLI configuration file
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        Ok(config_dir.join("rtunnel").join("cli.toml"))
    }
}
