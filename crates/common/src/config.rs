// Configuration structures for rtunnel tunnels

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::forwarding::{AdditionalForwarding, BaseForwarding, Protocol};

/// Broker used when a configuration names none
pub const DEFAULT_SERVER_ADDRESS: &str = "a.rtunnel.dev:443";

/// Complete configuration of one tunnel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TunnelConfig {
    /// Caller-chosen identifier, unique among live tunnels
    pub config_id: String,
    /// Optional human-readable label
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Broker address (`host:port`)
    #[serde(default = "default_server_address")]
    pub server_address: String,
    /// Broker access token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Protocol of the base forwarding
    #[serde(default, rename = "type")]
    pub tunnel_type: Protocol,
    /// Base forwarding rule, `remotePort:localDomain:localPort`
    pub forwarding: String,
    /// Additional forwarding rules, applied in order after start
    #[serde(default)]
    pub additional_forwarding: Vec<String>,
    /// Directory to serve as static files instead of a local service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serve: Option<PathBuf>,
    /// Take over an existing session for the same token
    #[serde(default)]
    pub force: bool,
    /// Restart the tunnel automatically after the broker session drops
    #[serde(default)]
    pub auto_reconnect: bool,
    /// Initial delay between reconnection attempts in seconds
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval: u64,
    /// Maximum reconnection attempts (0 = unlimited)
    #[serde(default)]
    pub max_reconnect_attempts: u32,
    /// Connect to the local service over TLS, using this server name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_server_tls: Option<String>,
    /// Source addresses (IP or CIDR) allowed through the broker
    #[serde(default)]
    pub ip_whitelist: Vec<String>,
    /// Basic auth credentials required by the broker
    #[serde(default)]
    pub basic_auth: Vec<BasicAuth>,
    /// Bearer tokens accepted by the broker
    #[serde(default)]
    pub bearer_token_auth: Vec<String>,
    /// Header rewrites (`a:Name:Value`, `u:Name:Value`, `r:Name`)
    #[serde(default)]
    pub header_modification: Vec<String>,
    #[serde(default)]
    pub x_forwarded_for: bool,
    #[serde(default)]
    pub https_only: bool,
    #[serde(default)]
    pub original_request_url: bool,
    /// Let CORS preflight requests bypass authentication
    #[serde(default)]
    pub allow_preflight: bool,
}

/// Basic auth credential pair
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

/// Partial configuration applied on top of a running tunnel's configuration
///
/// `config_id` selects the tunnel. Every other field that is present replaces
/// the current value; absent fields keep it. Lists are replaced as a whole.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TunnelConfigUpdate {
    pub config_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub tunnel_type: Option<Protocol>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forwarding: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_forwarding: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serve: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub force: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_reconnect: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconnect_interval: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_reconnect_attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_server_tls: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_whitelist: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub basic_auth: Option<Vec<BasicAuth>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bearer_token_auth: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header_modification: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x_forwarded_for: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub https_only: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_request_url: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_preflight: Option<bool>,
}

fn default_server_address() -> String {
    DEFAULT_SERVER_ADDRESS.to_string()
}

fn default_reconnect_interval() -> u64 {
    5
}

impl TunnelConfig {
    /// Create a configuration with defaults for everything but the identity and base rule
    pub fn new(config_id: impl Into<String>, forwarding: impl Into<String>) -> Self {
        Self {
            config_id: config_id.into(),
            name: None,
            server_address: default_server_address(),
            token: None,
            tunnel_type: Protocol::default(),
            forwarding: forwarding.into(),
            additional_forwarding: Vec::new(),
            serve: None,
            force: false,
            auto_reconnect: false,
            reconnect_interval: default_reconnect_interval(),
            max_reconnect_attempts: 0,
            local_server_tls: None,
            ip_whitelist: Vec::new(),
            basic_auth: Vec::new(),
            bearer_token_auth: Vec::new(),
            header_modification: Vec::new(),
            x_forwarded_for: false,
            https_only: false,
            original_request_url: false,
            allow_preflight: false,
        }
    }

    /// Check that the config id is usable
    pub fn validate_identity(&self) -> Result<()> {
        if self.config_id.trim().is_empty() {
            return Err(Error::InvalidConfig(
                "config_id must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Validate the whole configuration
    pub fn validate(&self) -> Result<()> {
        self.validate_identity()?;

        if self.server_address.trim().is_empty() {
            return Err(Error::InvalidConfig(
                "server_address must not be empty".to_string(),
            ));
        }
        if self.auto_reconnect && self.reconnect_interval == 0 {
            return Err(Error::InvalidConfig(
                "reconnect_interval must be greater than 0 when auto_reconnect is set".to_string(),
            ));
        }

        self.base_forwarding()?;
        self.additional_rules()?;

        for header in &self.header_modification {
            validate_header_modification(header)?;
        }
        for auth in &self.basic_auth {
            if auth.username.is_empty() || auth.username.contains(':') {
                return Err(Error::InvalidConfig(format!(
                    "invalid basic auth username '{}'",
                    auth.username
                )));
            }
        }

        Ok(())
    }

    /// Parsed base forwarding rule
    pub fn base_forwarding(&self) -> Result<BaseForwarding> {
        BaseForwarding::parse(&self.forwarding)
    }

    /// Parsed additional forwarding rules, in configured order
    pub fn additional_rules(&self) -> Result<Vec<AdditionalForwarding>> {
        self.additional_forwarding
            .iter()
            .map(|rule| AdditionalForwarding::parse(rule))
            .collect()
    }

    /// Label for logs and tables
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.config_id)
    }

    /// Overlay an update on this configuration; the config id never changes
    pub fn merged(&self, update: &TunnelConfigUpdate) -> TunnelConfig {
        let mut merged = self.clone();

        macro_rules! overlay {
            ($($field:ident),* $(,)?) => {
                $(
                    if let Some(value) = &update.$field {
                        merged.$field = value.clone();
                    }
                )*
            };
        }

        overlay!(
            server_address,
            tunnel_type,
            forwarding,
            additional_forwarding,
            force,
            auto_reconnect,
            reconnect_interval,
            max_reconnect_attempts,
            ip_whitelist,
            basic_auth,
            bearer_token_auth,
            header_modification,
            x_forwarded_for,
            https_only,
            original_request_url,
            allow_preflight,
        );

        if let Some(name) = &update.name {
            merged.name = Some(name.clone());
        }
        if let Some(token) = &update.token {
            merged.token = Some(token.clone());
        }
        if let Some(serve) = &update.serve {
            merged.serve = Some(serve.clone());
        }
        if let Some(tls) = &update.local_server_tls {
            merged.local_server_tls = Some(tls.clone());
        }

        merged
    }
}

impl TunnelConfigUpdate {
    /// Empty update for `config_id`
    pub fn new(config_id: impl Into<String>) -> Self {
        Self {
            config_id: config_id.into(),
            ..Default::default()
        }
    }

    /// Whether the update changes anything
    pub fn is_empty(&self) -> bool {
        *self == Self::new(self.config_id.clone())
    }
}

fn validate_header_modification(header: &str) -> Result<()> {
    let mut parts = header.splitn(3, ':');
    let action = parts.next().unwrap_or_default();
    let name = parts.next().unwrap_or_default();
    let has_value = parts.next().is_some();

    let valid = !name.is_empty()
        && match action {
            "a" | "u" => has_value,
            "r" => true,
            _ => false,
        };

    if valid {
        Ok(())
    } else {
        Err(Error::InvalidConfig(format!(
            "invalid header modification '{}'",
            header
        )))
    }
}
