// rtunnel - Daemon Config Module
// Handles daemon configuration (control API listener, auth, engine, remote management)

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use rtunnel_common::{format_host_port, is_loopback_address};

use crate::tunnel::reconnect::ReconnectPolicy;
use crate::tunnel::ssh::SshEngineConfig;

/// Daemon configuration
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct DaemonConfig {
    /// Host the control API binds to
    #[serde(default = "default_bind_host")]
    pub bind_host: String,

    /// Port the control API binds to
    #[serde(default = "default_bind_port")]
    pub bind_port: u16,

    /// Path to authentication token file
    #[serde(default = "default_auth_token_path")]
    pub auth_token_path: PathBuf,

    /// Require the `X-Tunnel-Token` header on every API request
    #[serde(default = "default_require_auth")]
    pub require_auth: bool,

    /// SSH engine settings
    #[serde(default)]
    pub engine: EngineSettings,

    /// Dashboard connection, disabled when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_management: Option<RemoteManagementConfig>,
}

/// Settings handed to the SSH engine
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct EngineSettings {
    /// Broker used by tunnels that keep the default server address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_address: Option<String>,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Accept any broker host key (trust on every use)
    #[serde(default = "default_accept_host_keys")]
    pub accept_host_keys: bool,

    /// SHA256 fingerprints accepted when `accept_host_keys` is false
    #[serde(default)]
    pub trusted_host_keys: Vec<String>,

    #[serde(default = "default_usage_interval_ms")]
    pub usage_interval_ms: u64,
}

/// WebSocket connection to the management dashboard
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct RemoteManagementConfig {
    /// `ws://` or `wss://` endpoint
    pub url: String,

    /// Bearer token presented to the dashboard
    pub token: String,

    #[serde(default = "default_min_backoff_secs")]
    pub min_backoff_secs: u64,

    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
}

fn default_bind_host() -> String {
    "127.0.0.1".to_string()
}

fn default_bind_port() -> u16 {
    4300
}

fn default_auth_token_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("rtunnel")
        .join("daemon.token")
}

fn default_require_auth() -> bool {
    true
}

fn default_connect_timeout_secs() -> u64 {
    15
}

fn default_accept_host_keys() -> bool {
    true
}

fn default_usage_interval_ms() -> u64 {
    1000
}

fn default_min_backoff_secs() -> u64 {
    1
}

fn default_max_backoff_secs() -> u64 {
    60
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            server_address: None,
            connect_timeout_secs: default_connect_timeout_secs(),
            accept_host_keys: default_accept_host_keys(),
            trusted_host_keys: Vec::new(),
            usage_interval_ms: default_usage_interval_ms(),
        }
    }
}

impl EngineSettings {
    pub fn to_engine_config(&self) -> SshEngineConfig {
        SshEngineConfig {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs.max(1)),
            accept_host_keys: self.accept_host_keys,
            trusted_host_keys: self.trusted_host_keys.clone(),
            default_server: self.server_address.clone(),
            usage_interval: Duration::from_millis(self.usage_interval_ms.max(100)),
        }
    }
}

impl RemoteManagementConfig {
    /// Reconnection schedule for the dashboard connection (never gives up)
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        let initial = self.min_backoff_secs.max(1);
        ReconnectPolicy {
            initial_backoff: Duration::from_secs(initial),
            max_backoff: Duration::from_secs(self.max_backoff_secs.max(initial)),
            multiplier: 2.0,
            max_attempts: None,
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            bind_host: default_bind_host(),
            bind_port: default_bind_port(),
            auth_token_path: default_auth_token_path(),
            require_auth: default_require_auth(),
            engine: EngineSettings::default(),
            remote_management: None,
        }
    }
}

impl DaemonConfig {
    /// Address the control API listens on
    pub fn bind_address(&self) -> String {
        format_host_port(&self.bind_host, self.bind_port)
    }

    /// Validate the daemon configuration
    pub fn validate(&self) -> Result<()> {
        if !is_loopback_address(&self.bind_host) && !self.require_auth {
            anyhow::bail!(
                "Security violation: the control API binds to a non-loopback address ({}) \
                 but require_auth is false.\n\
                 \n\
                 To fix this:\n\
                 1. Set require_auth = true in daemon.toml, OR\n\
                 2. Use a loopback address (127.0.0.1, ::1 or localhost) for bind_host",
                self.bind_host
            );
        }

        if let Some(remote) = &self.remote_management {
            if !(remote.url.starts_with("ws://") || remote.url.starts_with("wss://")) {
                anyhow::bail!(
                    "remote_management.url must start with ws:// or wss:// (got {})",
                    remote.url
                );
            }
            if remote.token.trim().is_empty() {
                anyhow::bail!("remote_management.token must not be empty");
            }
        }

        Ok(())
    }

    /// Load daemon configuration from the default location, creating it on first run
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        if !config_path.exists() {
            info!("No daemon configuration found, using defaults");
            info!("Configuration will be saved to: {}", config_path.display());
            let config = Self::default();
            config.save_to(&config_path)?;
            return Ok(config);
        }

        let config = Self::load_from(&config_path)?;
        info!("Loaded daemon configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load and validate a configuration file
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents =
            fs::read_to_string(path).context("Failed to read daemon configuration")?;

        let config: Self =
            toml::from_str(&contents).context("Failed to parse daemon configuration")?;

        config
            .validate()
            .context("Configuration validation failed")?;

        Ok(config)
    }

    /// Save daemon configuration to `path`
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create configuration directory")?;
        }

        let contents =
            toml::to_string_pretty(self).context("Failed to serialize daemon configuration")?;

        fs::write(path, contents).context("Failed to write daemon configuration")?;

        // Restrictive permissions, the file may hold the dashboard token
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let permissions = fs::Permissions::from_mode(0o600);
            fs::set_permissions(path, permissions)
                .context("Failed to set config file permissions")?;
        }

        info!("Saved daemon configuration to: {}", path.display());
        Ok(())
    }

    /// Get the path to the daemon configuration file
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        Ok(config_dir.join("rtunnel").join("daemon.toml"))
    }
}

/// Write a CLI config snippet next to the daemon configuration
pub fn write_cli_config_snippet(config: &DaemonConfig, auth_token: Option<&str>) -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
    let snippet_path = config_dir.join("rtunnel").join("cli-config.snippet");

    fs::write(&snippet_path, cli_config_snippet(config, auth_token))
        .context("Failed to write CLI config snippet")?;

    info!("");
    info!("CLI configuration snippet written to:");
    info!("  {}", snippet_path.display());
    info!("To configure the CLI, run:");
    info!("  cp {} ~/.config/rtunnel/cli.toml", snippet_path.display());
    info!("");

    Ok(snippet_path)
}

fn cli_config_snippet(config: &DaemonConfig, auth_token: Option<&str>) -> String {
    let mut content = format!(
        "# CLI configuration for rtunnel\n\
         # Copy this to ~/.config/rtunnel/cli.toml\n\
         \n\
         daemon_host = \"{}\"\n\
         daemon_port = {}\n",
        config.bind_host, config.bind_port
    );
    if let Some(token) = auth_token {
        content.push_str(&format!("auth_token = \"{}\"\n", token));
    }
    content
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtunnel_common::DaemonClientConfig;
    use tempfile::TempDir;

    #[test]
    fn test_validate_loopback_without_auth() {
        for host in ["127.0.0.1", "::1", "localhost"] {
            let config = DaemonConfig {
                bind_host: host.to_string(),
                require_auth: false,
                ..Default::default()
            };
            assert!(config.validate().is_ok(), "{} should be accepted", host);
        }
    }

    #[test]
    fn test_validate_non_loopback_requires_auth() {
        let config = DaemonConfig {
            bind_host: "0.0.0.0".to_string(),
            require_auth: false,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Security violation"));

        let config = DaemonConfig {
            bind_host: "0.0.0.0".to_string(),
            require_auth: true,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_remote_management() {
        let mut config = DaemonConfig {
            remote_management: Some(RemoteManagementConfig {
                url: "https://dashboard.example.com".to_string(),
                token: "t".to_string(),
                min_backoff_secs: 1,
                max_backoff_secs: 60,
            }),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        if let Some(remote) = config.remote_management.as_mut() {
            remote.url = "wss://dashboard.example.com/agent".to_string();
        }
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_require_auth_is_true() {
        let config = DaemonConfig::default();
        assert!(config.require_auth);
        assert_eq!(config.bind_address(), "127.0.0.1:4300");
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rtunnel").join("daemon.toml");

        let mut config = DaemonConfig::default();
        config.bind_port = 4400;
        config.engine.server_address = Some("broker.internal:2222".to_string());
        config.save_to(&path).unwrap();

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        assert_eq!(DaemonConfig::load_from(&path).unwrap(), config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("daemon.toml");
        fs::write(
            &path,
            "bind_port = 5000\n\n[remote_management]\nurl = \"ws://127.0.0.1:9000\"\ntoken = \"abc\"\n",
        )
        .unwrap();

        let config = DaemonConfig::load_from(&path).unwrap();
        assert_eq!(config.bind_port, 5000);
        assert_eq!(config.bind_host, "127.0.0.1");
        assert_eq!(config.engine, EngineSettings::default());
        let remote = config.remote_management.unwrap();
        assert_eq!(remote.max_backoff_secs, 60);
        assert_eq!(
            remote.reconnect_policy().initial_backoff,
            Duration::from_secs(1)
        );
    }

    #[test]
    fn test_engine_config_conversion() {
        let settings = EngineSettings {
            connect_timeout_secs: 0,
            usage_interval_ms: 10,
            ..Default::default()
        };
        let engine = settings.to_engine_config();
        assert_eq!(engine.connect_timeout, Duration::from_secs(1));
        assert_eq!(engine.usage_interval, Duration::from_millis(100));
        assert!(engine.accept_host_keys);
    }

    #[test]
    fn test_cli_snippet_parses_as_client_config() {
        let config = DaemonConfig {
            bind_port: 4555,
            ..Default::default()
        };
        let snippet = cli_config_snippet(&config, Some("secret-token"));
        let client: DaemonClientConfig = toml::from_str(&snippet).unwrap();
        assert_eq!(client.daemon_host, "127.0.0.1");
        assert_eq!(client.daemon_port, 4555);
        assert_eq!(client.auth_token, "secret-token");
    }
}
