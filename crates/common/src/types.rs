// Common types for rtunnel

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::TunnelConfig;
use crate::error::Error;
use crate::forwarding::ForwardingOutcome;

/// Lifecycle state of a single tunnel
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TunnelStatus {
    Created,  // instance exists, never started
    Starting, // engine start in flight
    Live,     // connected to the broker, forwarding traffic
    Stopped,  // stopped by request
    Errored,  // start failed or session lost
}

impl TunnelStatus {
    /// Check if the tunnel is forwarding traffic
    pub fn is_live(&self) -> bool {
        matches!(self, TunnelStatus::Live)
    }

    /// Check if the tunnel may be (re)started from this state
    pub fn can_start(&self) -> bool {
        matches!(self, TunnelStatus::Created | TunnelStatus::Errored)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelStatus::Created => "created",
            TunnelStatus::Starting => "starting",
            TunnelStatus::Live => "live",
            TunnelStatus::Stopped => "stopped",
            TunnelStatus::Errored => "errored",
        }
    }
}

impl fmt::Display for TunnelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TunnelStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "created" => Ok(TunnelStatus::Created),
            "starting" => Ok(TunnelStatus::Starting),
            "live" => Ok(TunnelStatus::Live),
            "stopped" => Ok(TunnelStatus::Stopped),
            "errored" => Ok(TunnelStatus::Errored),
            other => Err(Error::InvalidConfig(format!("unknown tunnel status '{other}'"))),
        }
    }
}

/// Normalized usage snapshot of a tunnel
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TunnelStats {
    /// Seconds since the tunnel went live
    pub elapsed_time: u64,
    pub num_live_connections: u64,
    pub num_total_connections: u64,
    pub num_total_req_bytes: u64,
    pub num_total_res_bytes: u64,
    pub num_total_tx_bytes: u64,
}

/// Events published for a tunnel (SSE stream, remote management pushes)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TunnelEvent {
    /// Usage statistics changed
    Stats {
        tunnel_id: String,
        stats: TunnelStats,
    },

    /// The engine reported an error
    Error {
        tunnel_id: String,
        error_no: u32,
        message: String,
        recoverable: bool,
    },

    /// The tunnel lost its broker session
    Disconnected {
        tunnel_id: String,
        error: String,
        messages: Vec<String>,
    },

    /// A background worker (engine session or file server) failed
    WorkerError { tunnel_id: String, error: String },

    /// Keep-alive for long-lived streams
    Heartbeat { timestamp: DateTime<Utc> },
}

impl TunnelEvent {
    /// Tunnel this event belongs to (heartbeats belong to none)
    pub fn tunnel_id(&self) -> Option<&str> {
        match self {
            TunnelEvent::Stats { tunnel_id, .. }
            | TunnelEvent::Error { tunnel_id, .. }
            | TunnelEvent::Disconnected { tunnel_id, .. }
            | TunnelEvent::WorkerError { tunnel_id, .. } => Some(tunnel_id),
            TunnelEvent::Heartbeat { .. } => None,
        }
    }
}

/// Snapshot of a managed tunnel as reported to callers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelSummary {
    pub tunnel_id: String,
    pub config_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tunnel_name: Option<String>,
    pub status: TunnelStatus,
    #[serde(default)]
    pub urls: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    pub config: TunnelConfig,
}

/// Result of starting a tunnel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartTunnelResult {
    pub tunnel_id: String,
    pub urls: Vec<String>,
    /// Outcome of each additional forwarding rule, in application order
    #[serde(default)]
    pub forwarding: Vec<ForwardingOutcome>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

/// Request body for creating (and starting) a tunnel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTunnelRequest {
    pub config: TunnelConfig,
    /// Reuse a known tunnel id instead of generating one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnel_id: Option<String>,
}

/// List of managed tunnels
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelsListResponse {
    pub tunnels: Vec<TunnelSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelStatusResponse {
    pub tunnel_id: String,
    pub status: TunnelStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalTlsResponse {
    pub tunnel_id: String,
    /// Server name used for TLS towards the local service, `None` when plain TCP
    pub local_server_tls: Option<String>,
}

/// Error body returned by the daemon API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(default)]
    pub code: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip_through_strings() {
        for status in [
            TunnelStatus::Created,
            TunnelStatus::Starting,
            TunnelStatus::Live,
            TunnelStatus::Stopped,
            TunnelStatus::Errored,
        ] {
            assert_eq!(status.as_str().parse::<TunnelStatus>().unwrap(), status);
        }
        assert!("connected".parse::<TunnelStatus>().is_err());
    }

    #[test]
    fn test_can_start() {
        assert!(TunnelStatus::Created.can_start());
        assert!(TunnelStatus::Errored.can_start());
        assert!(!TunnelStatus::Live.can_start());
        assert!(!TunnelStatus::Starting.can_start());
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let event = TunnelEvent::WorkerError {
            tunnel_id: "t1".to_string(),
            error: "boom".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "worker_error");
        assert_eq!(json["tunnel_id"], "t1");
        assert_eq!(event.tunnel_id(), Some("t1"));
    }
}
