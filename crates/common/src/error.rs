// Error types for rtunnel

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("A tunnel with config id '{0}' is already running")]
    DuplicateConfig(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Tunnel state conflict: {0}")]
    InvalidState(String),

    #[error("Invalid domain: {0}")]
    InvalidDomain(String),

    #[error("Invalid protocol '{0}' (expected http, tcp, udp or tls)")]
    InvalidProtocol(String),

    #[error("Remote port required for {0} forwarding")]
    PortRequired(String),

    #[error("Invalid local port: {0}")]
    InvalidLocalPort(String),

    #[error("Invalid forwarding rule: {0}")]
    InvalidForwarding(String),

    #[error("Tunnel engine error: {0}")]
    Engine(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// Stable machine-readable code, used by the API and remote management replies
    pub fn code(&self) -> &'static str {
        match self {
            Error::InvalidConfig(_) => "invalid_config",
            Error::DuplicateConfig(_) => "duplicate_config",
            Error::NotFound(_) => "not_found",
            Error::InvalidState(_) => "invalid_state",
            Error::InvalidDomain(_) => "invalid_domain",
            Error::InvalidProtocol(_) => "invalid_protocol",
            Error::PortRequired(_) => "port_required",
            Error::InvalidLocalPort(_) => "invalid_local_port",
            Error::InvalidForwarding(_) => "invalid_forwarding",
            Error::Engine(_) => "engine",
            Error::Io(_) => "io",
            Error::Serialization(_) => "serialization",
            Error::Toml(_) => "toml",
        }
    }

    /// Whether the error was raised by input validation (before any engine call)
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::InvalidConfig(_)
                | Error::InvalidDomain(_)
                | Error::InvalidProtocol(_)
                | Error::PortRequired(_)
                | Error::InvalidLocalPort(_)
                | Error::InvalidForwarding(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
