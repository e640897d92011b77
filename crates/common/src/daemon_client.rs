// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 rtunnel Contributors

// rtunnel - Daemon Client Module
// HTTP client used by the CLI to drive the daemon's control API

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::{TunnelConfig, TunnelConfigUpdate};
use crate::network::format_host_port;
use crate::types::{
    CreateTunnelRequest, ErrorResponse, LocalTlsResponse, StartTunnelResult, TunnelStats,
    TunnelStatusResponse, TunnelSummary, TunnelsListResponse,
};

/// HTTP header carrying the daemon authentication token
pub const AUTH_TOKEN_HEADER: &str = "X-Tunnel-Token";

/// Client configuration for connecting to the daemon
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DaemonClientConfig {
    /// Daemon host (e.g., "127.0.0.1")
    #[serde(default = "default_daemon_host")]
    pub daemon_host: String,

    /// Daemon port (e.g., 4300)
    #[serde(default = "default_daemon_port")]
    pub daemon_port: u16,

    /// Authentication token (if daemon requires auth)
    #[serde(default)]
    pub auth_token: String,
}

fn default_daemon_host() -> String {
    "127.0.0.1".to_string()
}

fn default_daemon_port() -> u16 {
    4300
}

impl Default for DaemonClientConfig {
    fn default() -> Self {
        Self {
            daemon_host: default_daemon_host(),
            daemon_port: default_daemon_port(),
            auth_token: String::new(),
        }
    }
}

impl DaemonClientConfig {
    /// Base URL of the daemon API, e.g. `http://127.0.0.1:4300`
    pub fn daemon_base_url(&self) -> String {
        format!("http://{}", format_host_port(&self.daemon_host, self.daemon_port))
    }
}

/// Create an HTTP client configured to talk to the daemon
pub fn create_daemon_client() -> Result<Client> {
    Client::builder()
        .connect_timeout(Duration::from_secs(5))
        .build()
        .context("Failed to build daemon client")
}

/// Add authentication header to request if configured
pub fn add_auth_header(request: RequestBuilder, config: &DaemonClientConfig) -> RequestBuilder {
    if config.auth_token.is_empty() {
        request
    } else {
        request.header(AUTH_TOKEN_HEADER, &config.auth_token)
    }
}

/// Check that the daemon answers its health endpoint
pub async fn health_check(client: &Client, config: &DaemonClientConfig) -> Result<bool> {
    let url = format!("{}/api/health", config.daemon_base_url());
    match client.get(&url).timeout(Duration::from_secs(3)).send().await {
        Ok(resp) => Ok(resp.status().is_success()),
        Err(e) if e.is_connect() || e.is_timeout() => Ok(false),
        Err(e) => Err(e).context("Failed to query daemon health"),
    }
}

/// List every tunnel the daemon manages
pub async fn list_tunnels(client: &Client, config: &DaemonClientConfig) -> Result<Vec<TunnelSummary>> {
    let url = format!("{}/api/tunnels", config.daemon_base_url());
    let resp = send(add_auth_header(client.get(&url), config)).await?;
    let list: TunnelsListResponse = decode(resp).await?;
    Ok(list.tunnels)
}

/// Create a tunnel and start it
pub async fn create_tunnel(
    client: &Client,
    config: &DaemonClientConfig,
    tunnel: TunnelConfig,
) -> Result<StartTunnelResult> {
    let url = format!("{}/api/tunnels", config.daemon_base_url());
    let body = CreateTunnelRequest {
        config: tunnel,
        tunnel_id: None,
    };
    let resp = send(add_auth_header(client.post(&url), config).json(&body)).await?;
    decode(resp).await
}

/// Fetch one tunnel by id
pub async fn get_tunnel(
    client: &Client,
    config: &DaemonClientConfig,
    tunnel_id: &str,
) -> Result<TunnelSummary> {
    let url = format!("{}/api/tunnels/{}", config.daemon_base_url(), tunnel_id);
    let resp = send(add_auth_header(client.get(&url), config)).await?;
    decode(resp).await
}

/// Look up the tunnel currently holding `config_id`
pub async fn get_tunnel_by_config(
    client: &Client,
    config: &DaemonClientConfig,
    config_id: &str,
) -> Result<TunnelSummary> {
    let url = format!("{}/api/configs/{}", config.daemon_base_url(), config_id);
    let resp = send(add_auth_header(client.get(&url), config)).await?;
    decode(resp).await
}

/// Start a tunnel that was created earlier (or errored)
pub async fn start_tunnel(
    client: &Client,
    config: &DaemonClientConfig,
    tunnel_id: &str,
) -> Result<StartTunnelResult> {
    tunnel_action(client, config, tunnel_id, "start").await
}

/// Restart a tunnel with its current configuration
pub async fn restart_tunnel(
    client: &Client,
    config: &DaemonClientConfig,
    tunnel_id: &str,
) -> Result<StartTunnelResult> {
    tunnel_action(client, config, tunnel_id, "restart").await
}

/// Stop a tunnel and remove it from the daemon
pub async fn stop_tunnel(client: &Client, config: &DaemonClientConfig, tunnel_id: &str) -> Result<()> {
    let url = format!("{}/api/tunnels/{}/stop", config.daemon_base_url(), tunnel_id);
    send(add_auth_header(client.post(&url), config)).await?;
    Ok(())
}

/// Apply a configuration update to the tunnel holding `update.config_id`
pub async fn update_tunnel_config(
    client: &Client,
    config: &DaemonClientConfig,
    update: &TunnelConfigUpdate,
) -> Result<TunnelSummary> {
    let url = format!("{}/api/tunnels/config", config.daemon_base_url());
    let resp = send(add_auth_header(client.put(&url), config).json(update)).await?;
    decode(resp).await
}

/// Latest usage statistics, `None` once the tunnel has no stats yet
pub async fn get_tunnel_stats(
    client: &Client,
    config: &DaemonClientConfig,
    tunnel_id: &str,
) -> Result<Option<TunnelStats>> {
    tunnel_query(client, config, tunnel_id, "stats").await
}

/// Usage payload as the engine last reported it, before normalization
pub async fn get_raw_usage(
    client: &Client,
    config: &DaemonClientConfig,
    tunnel_id: &str,
) -> Result<serde_json::Value> {
    tunnel_query(client, config, tunnel_id, "usage").await
}

pub async fn get_tunnel_warnings(
    client: &Client,
    config: &DaemonClientConfig,
    tunnel_id: &str,
) -> Result<Vec<String>> {
    tunnel_query(client, config, tunnel_id, "warnings").await
}

pub async fn get_tunnel_urls(
    client: &Client,
    config: &DaemonClientConfig,
    tunnel_id: &str,
) -> Result<Vec<String>> {
    tunnel_query(client, config, tunnel_id, "urls").await
}

pub async fn get_tunnel_status(
    client: &Client,
    config: &DaemonClientConfig,
    tunnel_id: &str,
) -> Result<TunnelStatusResponse> {
    tunnel_query(client, config, tunnel_id, "status").await
}

pub async fn get_greet_message(
    client: &Client,
    config: &DaemonClientConfig,
    tunnel_id: &str,
) -> Result<Vec<String>> {
    tunnel_query(client, config, tunnel_id, "greet").await
}

pub async fn get_local_server_tls(
    client: &Client,
    config: &DaemonClientConfig,
    tunnel_id: &str,
) -> Result<LocalTlsResponse> {
    tunnel_query(client, config, tunnel_id, "tls").await
}

async fn tunnel_action(
    client: &Client,
    config: &DaemonClientConfig,
    tunnel_id: &str,
    action: &str,
) -> Result<StartTunnelResult> {
    let url = format!(
        "{}/api/tunnels/{}/{}",
        config.daemon_base_url(),
        tunnel_id,
        action
    );
    let resp = send(add_auth_header(client.post(&url), config)).await?;
    decode(resp).await
}

async fn tunnel_query<T: DeserializeOwned>(
    client: &Client,
    config: &DaemonClientConfig,
    tunnel_id: &str,
    what: &str,
) -> Result<T> {
    let url = format!(
        "{}/api/tunnels/{}/{}",
        config.daemon_base_url(),
        tunnel_id,
        what
    );
    let resp = send(add_auth_header(client.get(&url), config)).await?;
    decode(resp).await
}

/// Send a request and turn non-success responses into readable errors
async fn send(request: RequestBuilder) -> Result<Response> {
    let resp = request
        .send()
        .await
        .context("Failed to reach the daemon. Is rtunnel-daemon running?")?;

    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    if status == StatusCode::UNAUTHORIZED {
        anyhow::bail!(
            "Authentication failed: 401 Unauthorized\n\
             Set auth_token in ~/.config/rtunnel/cli.toml to the token in ~/.config/rtunnel/daemon.token"
        );
    }

    let body = resp.text().await.unwrap_or_default();
    match serde_json::from_str::<ErrorResponse>(&body) {
        Ok(err) => anyhow::bail!("{} ({})", err.error, status),
        Err(_) => anyhow::bail!("Daemon returned {}: {}", status, body),
    }
}

async fn decode<T: DeserializeOwned>(resp: Response) -> Result<T> {
    resp.json::<T>()
        .await
        .context("Failed to decode daemon response")
}
