// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 rtunnel Contributors

// rtunnel - Common Library
// Tunnel configuration, forwarding rules, API types and the daemon client

pub mod config;
pub mod daemon_client;
pub mod error;
pub mod forwarding;
pub mod network;
pub mod sse;
pub mod stats;
pub mod types;

pub use config::{BasicAuth, TunnelConfig, TunnelConfigUpdate, DEFAULT_SERVER_ADDRESS};
pub use daemon_client::{
    add_auth_header, create_daemon_client, DaemonClientConfig, AUTH_TOKEN_HEADER,
};
pub use error::{Error, Result};
pub use forwarding::{
    AdditionalForwarding, BaseForwarding, ForwardingOutcome, ForwardingRule, Protocol,
    ResolvedForwarding,
};
pub use network::{format_host_port, is_loopback_address};
pub use sse::EventListener;
pub use stats::normalize_stats;
pub use types::{
    CreateTunnelRequest, ErrorResponse, LocalTlsResponse, StartTunnelResult, TunnelEvent,
    TunnelStats, TunnelStatus, TunnelStatusResponse, TunnelSummary, TunnelsListResponse,
};

// Re-export commonly used external types
pub use chrono::{DateTime, Utc};
