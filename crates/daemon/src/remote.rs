// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 rtunnel Contributors

//! Remote management channel
//!
//! Keeps a WebSocket connection to the management dashboard open and executes
//! the tunnel commands it sends. Every request carries a `request_id` that is
//! echoed in the response. Stats of tunnels started over this channel are
//! pushed back as `{ "event": "stats", ... }` messages.

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, info, warn};

use rtunnel_common::{Error, TunnelConfig, TunnelConfigUpdate};

use crate::config::RemoteManagementConfig;
use crate::tunnel::TunnelManager;

/// Pushed messages waiting for a connection; older ones are dropped beyond this
const OUTBOUND_CAPACITY: usize = 512;

/// Commands accepted from the dashboard
#[derive(Debug, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
enum RemoteCommand {
    Start {
        config: TunnelConfig,
        #[serde(default)]
        tunnel_id: Option<String>,
    },
    Stop {
        tunnel_id: String,
    },
    Restart {
        tunnel_id: String,
    },
    UpdateConfig {
        update: TunnelConfigUpdate,
    },
    List,
    Get {
        tunnel_id: String,
    },
    GetByConfig {
        config_id: String,
    },
    GetStats {
        tunnel_id: String,
    },
    GetUrls {
        tunnel_id: String,
    },
    GetGreet {
        tunnel_id: String,
    },
}

#[derive(Debug, Serialize, PartialEq)]
struct RemoteResponse {
    request_id: Option<String>,
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<String>,
}

impl RemoteResponse {
    fn ok(request_id: Option<String>, data: Value) -> Self {
        Self {
            request_id,
            ok: true,
            data: Some(data),
            error: None,
            code: None,
        }
    }

    fn failed(request_id: Option<String>, error: impl ToString, code: &str) -> Self {
        Self {
            request_id,
            ok: false,
            data: None,
            error: Some(error.to_string()),
            code: Some(code.to_string()),
        }
    }
}

/// Spawn the dashboard connection; it runs until `shutdown` fires
pub fn spawn(
    config: RemoteManagementConfig,
    manager: TunnelManager,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = run(config, manager) => {}
            _ = shutdown.recv() => debug!("Remote management stopped"),
        }
    })
}

async fn run(config: RemoteManagementConfig, manager: TunnelManager) {
    let policy = config.reconnect_policy();
    let (outbound_tx, mut outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
    let mut attempt = 0;

    loop {
        match connect_and_serve(&config, &manager, &outbound_tx, &mut outbound_rx).await {
            Ok(()) => {
                info!("Dashboard closed the remote management connection");
                attempt = 0;
            }
            Err(e) => warn!("Remote management connection failed: {:#}", e),
        }

        attempt += 1;
        let delay = policy.delay(attempt);
        info!(
            "Reconnecting to the dashboard in {:?} (attempt {})",
            delay, attempt
        );
        sleep(delay).await;
    }
}

async fn connect_and_serve(
    config: &RemoteManagementConfig,
    manager: &TunnelManager,
    outbound_tx: &mpsc::Sender<Value>,
    outbound_rx: &mut mpsc::Receiver<Value>,
) -> anyhow::Result<()> {
    let mut request = config.url.as_str().into_client_request()?;
    request.headers_mut().insert(
        "Authorization",
        HeaderValue::from_str(&format!("Bearer {}", config.token))?,
    );

    debug!("Connecting to dashboard at {}", config.url);
    let (ws_stream, _response) = connect_async(request).await?;
    info!("Connected to dashboard at {}", config.url);

    let (mut ws_sink, mut ws_stream) = ws_stream.split();

    loop {
        tokio::select! {
            Some(pushed) = outbound_rx.recv() => {
                ws_sink.send(WsMessage::Text(pushed.to_string())).await?;
            }

            message = ws_stream.next() => {
                let Some(message) = message else {
                    return Ok(());
                };
                match message? {
                    WsMessage::Text(text) => {
                        let response = handle_request(manager, &text, outbound_tx).await;
                        let payload = serde_json::to_string(&response)?;
                        ws_sink.send(WsMessage::Text(payload)).await?;
                    }
                    WsMessage::Ping(data) => ws_sink.send(WsMessage::Pong(data)).await?,
                    WsMessage::Close(frame) => {
                        debug!("Dashboard sent close frame: {:?}", frame);
                        return Ok(());
                    }
                    _ => {}
                }
            }
        }
    }
}

/// Execute one dashboard request and build its response
async fn handle_request(
    manager: &TunnelManager,
    text: &str,
    outbound: &mpsc::Sender<Value>,
) -> RemoteResponse {
    let raw: Value = match serde_json::from_str(text) {
        Ok(raw) => raw,
        Err(e) => {
            return RemoteResponse::failed(None, format!("malformed request: {}", e), "malformed")
        }
    };
    let request_id = raw
        .get("request_id")
        .and_then(Value::as_str)
        .map(str::to_string);
    if request_id.is_none() {
        return RemoteResponse::failed(
            None,
            "malformed request: missing request_id",
            "malformed",
        );
    }

    let command: RemoteCommand = match serde_json::from_value(raw) {
        Ok(command) => command,
        Err(e) => {
            return RemoteResponse::failed(
                request_id,
                format!("malformed request: {}", e),
                "malformed",
            )
        }
    };
    debug!("Remote request {}", request_id.as_deref().unwrap_or_default());

    match execute(manager, command, outbound).await {
        Ok(data) => RemoteResponse::ok(request_id, data),
        Err(e) => RemoteResponse::failed(request_id, &e, e.code()),
    }
}

async fn execute(
    manager: &TunnelManager,
    command: RemoteCommand,
    outbound: &mpsc::Sender<Value>,
) -> rtunnel_common::Result<Value> {
    let value = match command {
        RemoteCommand::Start { config, tunnel_id } => {
            let result = manager.launch(config, tunnel_id).await?;
            push_stats(manager, &result.tunnel_id, outbound.clone())?;
            serde_json::to_value(result)?
        }
        RemoteCommand::Stop { tunnel_id } => {
            manager.stop_tunnel(&tunnel_id).await?;
            json!({ "tunnel_id": tunnel_id })
        }
        RemoteCommand::Restart { tunnel_id } => {
            serde_json::to_value(manager.restart_tunnel(&tunnel_id).await?)?
        }
        RemoteCommand::UpdateConfig { update } => {
            serde_json::to_value(manager.update_config(update).await?)?
        }
        RemoteCommand::List => serde_json::to_value(manager.list_tunnels())?,
        RemoteCommand::Get { tunnel_id } => serde_json::to_value(manager.get_tunnel(&tunnel_id)?)?,
        RemoteCommand::GetByConfig { config_id } => {
            serde_json::to_value(manager.get_tunnel_by_config(&config_id)?)?
        }
        RemoteCommand::GetStats { tunnel_id } => {
            serde_json::to_value(manager.get_tunnel_stats(&tunnel_id)?)?
        }
        RemoteCommand::GetUrls { tunnel_id } => {
            serde_json::to_value(manager.get_tunnel_urls(&tunnel_id)?)?
        }
        RemoteCommand::GetGreet { tunnel_id } => {
            serde_json::to_value(manager.get_greet_message(&tunnel_id)?)?
        }
    };
    Ok(value)
}

/// Forward stats of `tunnel_id` to the dashboard for as long as the tunnel lives
fn push_stats(
    manager: &TunnelManager,
    tunnel_id: &str,
    outbound: mpsc::Sender<Value>,
) -> Result<String, Error> {
    manager.register_stats_listener(tunnel_id, move |id, stats| {
        let message = json!({ "event": "stats", "tunnel_id": id, "stats": stats });
        if outbound.try_send(message).is_err() {
            debug!("Dashboard stats for tunnel {} dropped", id);
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::tunnel::testing::FakeEngine;

    fn setup() -> (
        TunnelManager,
        Arc<FakeEngine>,
        mpsc::Sender<Value>,
        mpsc::Receiver<Value>,
    ) {
        let engine = FakeEngine::new();
        let manager = TunnelManager::new(engine.clone());
        let (tx, rx) = mpsc::channel(16);
        (manager, engine, tx, rx)
    }

    #[tokio::test]
    async fn test_start_pushes_stats() {
        let (manager, engine, tx, mut rx) = setup();
        let request = json!({
            "request_id": "r1",
            "command": "start",
            "config": { "config_id": "remote", "forwarding": "0:localhost:3000" }
        });

        let response = handle_request(&manager, &request.to_string(), &tx).await;
        assert!(response.ok, "{:?}", response.error);
        assert_eq!(response.request_id.as_deref(), Some("r1"));
        let data = response.data.unwrap();
        assert_eq!(data["urls"][0], "https://remote.fake.test");

        engine.last().fire_usage(json!({ "numTotalConnections": 3 }));
        let pushed = rx.try_recv().unwrap();
        assert_eq!(pushed["event"], "stats");
        assert_eq!(pushed["tunnel_id"], data["tunnel_id"]);
        assert_eq!(pushed["stats"]["num_total_connections"], 3);
    }

    #[tokio::test]
    async fn test_query_and_stop_commands() {
        let (manager, _, tx, _rx) = setup();
        let result = manager
            .launch(TunnelConfig::new("q", "0:localhost:3000"), None)
            .await
            .unwrap();
        let id = result.tunnel_id;

        let greet = json!({ "request_id": "g", "command": "get_greet", "tunnel_id": id });
        let response = handle_request(&manager, &greet.to_string(), &tx).await;
        assert_eq!(response.data, Some(json!(["Welcome, q"])));

        let by_config = json!({
            "request_id": "c",
            "command": "get_by_config",
            "config_id": "q"
        });
        let response = handle_request(&manager, &by_config.to_string(), &tx).await;
        assert_eq!(response.data.unwrap()["tunnel_id"], json!(id));

        let list = json!({ "request_id": "l", "command": "list" });
        let response = handle_request(&manager, &list.to_string(), &tx).await;
        assert_eq!(response.data.unwrap().as_array().unwrap().len(), 1);

        let stop = json!({ "request_id": "s", "command": "stop", "tunnel_id": id });
        let response = handle_request(&manager, &stop.to_string(), &tx).await;
        assert!(response.ok);
        assert!(manager.list_tunnels().is_empty());

        let response = handle_request(&manager, &stop.to_string(), &tx).await;
        assert!(!response.ok);
        assert_eq!(response.code.as_deref(), Some("not_found"));
    }

    #[tokio::test]
    async fn test_update_config_command() {
        let (manager, _, tx, _rx) = setup();
        manager
            .launch(TunnelConfig::new("u", "0:localhost:3000"), None)
            .await
            .unwrap();

        let request = json!({
            "request_id": "u1",
            "command": "update_config",
            "update": { "config_id": "u", "name": "renamed" }
        });
        let response = handle_request(&manager, &request.to_string(), &tx).await;
        assert!(response.ok, "{:?}", response.error);
        assert_eq!(response.data.unwrap()["tunnel_name"], "renamed");
    }

    #[tokio::test]
    async fn test_malformed_requests() {
        let (manager, _, tx, _rx) = setup();

        let response = handle_request(&manager, "not json", &tx).await;
        assert!(!response.ok);
        assert_eq!(response.request_id, None);
        assert_eq!(response.code.as_deref(), Some("malformed"));

        let response = handle_request(&manager, r#"{"command":"list"}"#, &tx).await;
        assert_eq!(response.code.as_deref(), Some("malformed"));

        let response =
            handle_request(&manager, r#"{"request_id":"x","command":"explode"}"#, &tx).await;
        assert_eq!(response.request_id.as_deref(), Some("x"));
        assert_eq!(response.code.as_deref(), Some("malformed"));

        let response =
            handle_request(&manager, r#"{"request_id":"y","command":"get"}"#, &tx).await;
        assert_eq!(response.code.as_deref(), Some("malformed"));
    }

    #[test]
    fn test_response_serialization() {
        let ok = RemoteResponse::ok(Some("a".to_string()), json!([1]));
        assert_eq!(
            serde_json::to_value(&ok).unwrap(),
            json!({ "request_id": "a", "ok": true, "data": [1] })
        );

        let failed = RemoteResponse::failed(Some("b".to_string()), "nope", "engine");
        assert_eq!(
            serde_json::to_value(&failed).unwrap(),
            json!({ "request_id": "b", "ok": false, "error": "nope", "code": "engine" })
        );
    }
}
