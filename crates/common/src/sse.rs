// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 rtunnel Contributors

//! Server-Sent Events listener for a single tunnel's event stream
//!
//! Connects to `/api/tunnels/{id}/events` and yields [`TunnelEvent`] items
//! until the receiver is dropped or the tunnel goes away.

use anyhow::{Context, Result};
use futures_util::StreamExt;
use reqwest::StatusCode;
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};

use crate::daemon_client::{add_auth_header, create_daemon_client, DaemonClientConfig};
use crate::types::TunnelEvent;

/// How a single stream session ended
enum StreamEnd {
    /// Receiver dropped, stop for good
    Closed,
    /// Tunnel is no longer managed by the daemon
    TunnelGone,
    /// Connection dropped, reconnect
    Dropped,
}

/// Event listener for one tunnel's SSE stream
pub struct EventListener {
    config: DaemonClientConfig,
    tunnel_id: String,
}

impl EventListener {
    pub fn new(config: DaemonClientConfig, tunnel_id: impl Into<String>) -> Self {
        Self {
            config,
            tunnel_id: tunnel_id.into(),
        }
    }

    /// Start listening to tunnel events
    ///
    /// Reconnects with exponential backoff while the tunnel exists. The
    /// channel closes once the daemon answers 404 for the tunnel.
    pub fn listen(&self) -> mpsc::Receiver<TunnelEvent> {
        let (tx, rx) = mpsc::channel(100);

        let config = self.config.clone();
        let tunnel_id = self.tunnel_id.clone();
        tokio::spawn(async move {
            let mut backoff = Duration::from_secs(1);
            let max_backoff = Duration::from_secs(30);

            loop {
                match Self::stream_events(&config, &tunnel_id, &tx).await {
                    Ok(StreamEnd::Closed) | Ok(StreamEnd::TunnelGone) => break,
                    Ok(StreamEnd::Dropped) => {
                        backoff = Duration::from_secs(1);
                    }
                    Err(e) => tracing::warn!("Event stream error: {:#}", e),
                }

                if tx.is_closed() {
                    break;
                }

                sleep(backoff).await;
                backoff = (backoff * 2).min(max_backoff);
            }
        });

        rx
    }

    async fn stream_events(
        config: &DaemonClientConfig,
        tunnel_id: &str,
        tx: &mpsc::Sender<TunnelEvent>,
    ) -> Result<StreamEnd> {
        let url = format!(
            "{}/api/tunnels/{}/events",
            config.daemon_base_url(),
            tunnel_id
        );

        let client = create_daemon_client()?;
        let response = add_auth_header(client.get(&url), config)
            .send()
            .await
            .context("Failed to connect to event stream")?;

        if response.status() == StatusCode::NOT_FOUND {
            tracing::debug!("Tunnel {} no longer exists, closing event stream", tunnel_id);
            return Ok(StreamEnd::TunnelGone);
        }
        if !response.status().is_success() {
            anyhow::bail!("Event stream request failed: {}", response.status());
        }

        let mut stream = response.bytes_stream();
        let mut buffer = String::new();

        while let Some(chunk) = stream.next().await {
            let bytes = match chunk {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::error!("Error reading event stream: {}", e);
                    return Ok(StreamEnd::Dropped);
                }
            };

            let Ok(text) = std::str::from_utf8(&bytes) else {
                continue;
            };
            buffer.push_str(text);

            while let Some(pos) = buffer.find("\n\n") {
                let message: String = buffer.drain(..pos + 2).collect();
                if let Some(event) = parse_sse_message(&message) {
                    if tx.send(event).await.is_err() {
                        tracing::debug!("Receiver dropped, stopping event listener");
                        return Ok(StreamEnd::Closed);
                    }
                }
            }
        }

        Ok(StreamEnd::Dropped)
    }
}

/// Parse one SSE message (`data: {json}` lines) into a [`TunnelEvent`]
fn parse_sse_message(message: &str) -> Option<TunnelEvent> {
    for line in message.lines() {
        let Some(data) = line.strip_prefix("data:") else {
            continue;
        };
        match serde_json::from_str::<TunnelEvent>(data.trim_start()) {
            Ok(event) => return Some(event),
            Err(e) => tracing::warn!("Failed to parse SSE event: {} (error: {})", data, e),
        }
    }
    None
}
