// rtunnel - REST API Module
// HTTP endpoints for tunnel control plus a per-tunnel SSE event stream

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::sse::{Event, Sse},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use chrono::Utc;
use futures::{stream, Stream, StreamExt};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use rtunnel_common::{
    CreateTunnelRequest, Error, ErrorResponse, LocalTlsResponse, StartTunnelResult,
    TunnelConfigUpdate, TunnelEvent, TunnelStats, TunnelStatusResponse, TunnelSummary,
    TunnelsListResponse,
};

use crate::tunnel::TunnelManager;

/// Shared application state
pub struct AppState {
    pub tunnel_manager: TunnelManager,
    pub shutdown_tx: broadcast::Sender<()>,
}

/// Manager error rendered as a JSON error body
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        Self(error)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::DuplicateConfig(_) | Error::InvalidState(_) => StatusCode::CONFLICT,
            Error::Engine(_) => StatusCode::BAD_GATEWAY,
            e if e.is_validation() => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!("API request failed: {}", self.0);
        } else {
            debug!("API request rejected: {}", self.0);
        }
        let body = ErrorResponse {
            error: self.0.to_string(),
            code: self.0.code().to_string(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/tunnels", get(list_tunnels).post(create_tunnel))
        .route("/api/tunnels/config", put(update_config))
        .route("/api/tunnels/:id", get(get_tunnel))
        .route("/api/tunnels/:id/start", post(start_tunnel))
        .route("/api/tunnels/:id/stop", post(stop_tunnel))
        .route("/api/tunnels/:id/restart", post(restart_tunnel))
        .route("/api/tunnels/:id/stats", get(tunnel_stats))
        .route("/api/tunnels/:id/usage", get(raw_usage))
        .route("/api/tunnels/:id/warnings", get(tunnel_warnings))
        .route("/api/tunnels/:id/urls", get(tunnel_urls))
        .route("/api/tunnels/:id/status", get(tunnel_status))
        .route("/api/tunnels/:id/greet", get(greet_message))
        .route("/api/tunnels/:id/tls", get(local_server_tls))
        .route("/api/tunnels/:id/events", get(event_stream))
        .route("/api/configs/:config_id", get(get_tunnel_by_config))
        .with_state(state)
}

async fn health() -> &'static str {
    "OK"
}

async fn list_tunnels(State(state): State<Arc<AppState>>) -> Json<TunnelsListResponse> {
    Json(TunnelsListResponse {
        tunnels: state.tunnel_manager.list_tunnels(),
    })
}

/// Create a tunnel and start it right away
async fn create_tunnel(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateTunnelRequest>,
) -> ApiResult<(StatusCode, Json<StartTunnelResult>)> {
    info!("API: create tunnel for config {}", request.config.config_id);
    let result = state
        .tunnel_manager
        .launch(request.config, request.tunnel_id)
        .await?;
    Ok((StatusCode::CREATED, Json(result)))
}

async fn get_tunnel(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<TunnelSummary>> {
    Ok(Json(state.tunnel_manager.get_tunnel(&id)?))
}

async fn get_tunnel_by_config(
    State(state): State<Arc<AppState>>,
    Path(config_id): Path<String>,
) -> ApiResult<Json<TunnelSummary>> {
    Ok(Json(state.tunnel_manager.get_tunnel_by_config(&config_id)?))
}

async fn start_tunnel(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<StartTunnelResult>> {
    info!("API: start tunnel {}", id);
    Ok(Json(state.tunnel_manager.start_tunnel(&id).await?))
}

async fn stop_tunnel(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    info!("API: stop tunnel {}", id);
    state.tunnel_manager.stop_tunnel(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn restart_tunnel(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<StartTunnelResult>> {
    info!("API: restart tunnel {}", id);
    Ok(Json(state.tunnel_manager.restart_tunnel(&id).await?))
}

async fn update_config(
    State(state): State<Arc<AppState>>,
    Json(update): Json<TunnelConfigUpdate>,
) -> ApiResult<Json<TunnelSummary>> {
    info!("API: update configuration {}", update.config_id);
    Ok(Json(state.tunnel_manager.update_config(update).await?))
}

async fn tunnel_stats(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Option<TunnelStats>>> {
    Ok(Json(state.tunnel_manager.get_tunnel_stats(&id)?))
}

async fn raw_usage(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    Ok(Json(state.tunnel_manager.get_raw_usage(&id)?))
}

async fn tunnel_warnings(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<String>>> {
    Ok(Json(state.tunnel_manager.get_warnings(&id)?))
}

async fn tunnel_urls(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<String>>> {
    Ok(Json(state.tunnel_manager.get_tunnel_urls(&id)?))
}

async fn tunnel_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<TunnelStatusResponse>> {
    let status = state.tunnel_manager.get_tunnel_status(&id)?;
    Ok(Json(TunnelStatusResponse {
        tunnel_id: id,
        status,
    }))
}

async fn greet_message(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<String>>> {
    Ok(Json(state.tunnel_manager.get_greet_message(&id)?))
}

async fn local_server_tls(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<LocalTlsResponse>> {
    let local_server_tls = state.tunnel_manager.get_local_server_tls(&id)?;
    Ok(Json(LocalTlsResponse {
        tunnel_id: id,
        local_server_tls,
    }))
}

/// Listener registrations owned by one SSE stream, removed when the stream is dropped
struct StreamListeners {
    manager: TunnelManager,
    tunnel_id: String,
    stats: String,
    errors: String,
    disconnects: String,
    worker_errors: String,
}

impl StreamListeners {
    fn register(
        manager: &TunnelManager,
        tunnel_id: &str,
        tx: mpsc::Sender<TunnelEvent>,
    ) -> rtunnel_common::Result<Self> {
        let send = move |event: TunnelEvent| -> anyhow::Result<()> {
            tx.try_send(event)
                .map_err(|e| anyhow::anyhow!("event stream not keeping up: {}", e))
        };

        let stats = {
            let send = send.clone();
            manager.register_stats_listener(tunnel_id, move |id, stats| {
                send(TunnelEvent::Stats {
                    tunnel_id: id.to_string(),
                    stats: *stats,
                })
            })?
        };
        let errors = {
            let send = send.clone();
            manager.register_error_listener(tunnel_id, move |id, event| {
                send(TunnelEvent::Error {
                    tunnel_id: id.to_string(),
                    error_no: event.error_no,
                    message: event.message.clone(),
                    recoverable: event.recoverable,
                })
            })?
        };
        let disconnects = {
            let send = send.clone();
            manager.register_disconnect_listener(tunnel_id, move |id, event| {
                send(TunnelEvent::Disconnected {
                    tunnel_id: id.to_string(),
                    error: event.error.clone(),
                    messages: event.messages.clone(),
                })
            })?
        };
        let worker_errors = manager.register_worker_error_listener(tunnel_id, move |id, event| {
            send(TunnelEvent::WorkerError {
                tunnel_id: id.to_string(),
                error: event.error.clone(),
            })
        })?;

        Ok(Self {
            manager: manager.clone(),
            tunnel_id: tunnel_id.to_string(),
            stats,
            errors,
            disconnects,
            worker_errors,
        })
    }
}

impl Drop for StreamListeners {
    fn drop(&mut self) {
        let manager = &self.manager;
        manager.deregister_stats_listener(&self.tunnel_id, &self.stats);
        manager.deregister_error_listener(&self.tunnel_id, &self.errors);
        manager.deregister_disconnect_listener(&self.tunnel_id, &self.disconnects);
        manager.deregister_worker_error_listener(&self.tunnel_id, &self.worker_errors);
        debug!(
            "Event stream for tunnel {} closed ({} listener(s) left)",
            self.tunnel_id,
            manager.listener_count(&self.tunnel_id)
        );
    }
}

struct EventStreamState {
    rx: mpsc::Receiver<TunnelEvent>,
    heartbeat: Interval,
    _listeners: StreamListeners,
}

/// GET /api/tunnels/:id/events → SSE stream of one tunnel's events
///
/// Ends when the tunnel is stopped (its listeners are dropped) or the daemon shuts down.
async fn event_stream(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let (tx, rx) = mpsc::channel(256);
    let listeners = StreamListeners::register(&state.tunnel_manager, &id, tx)?;
    debug!("Event stream opened for tunnel {}", id);

    let mut heartbeat = interval(heartbeat_interval());
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick completes immediately
    heartbeat.reset();

    let events = stream::unfold(
        EventStreamState {
            rx,
            heartbeat,
            _listeners: listeners,
        },
        |mut state| async move {
            let event = tokio::select! {
                event = state.rx.recv() => event?,
                _ = state.heartbeat.tick() => TunnelEvent::Heartbeat { timestamp: Utc::now() },
            };
            Some((to_sse_event(&event), state))
        },
    );

    let mut shutdown_rx = state.shutdown_tx.subscribe();
    let shutdown_aware = events.take_until(async move {
        // A closed channel means the sender went away without a shutdown
        if let Err(broadcast::error::RecvError::Closed) = shutdown_rx.recv().await {
            std::future::pending::<()>().await;
        }
    });

    Ok(Sse::new(shutdown_aware))
}

fn event_name(event: &TunnelEvent) -> &'static str {
    match event {
        TunnelEvent::Stats { .. } => "stats",
        TunnelEvent::Error { .. } => "error",
        TunnelEvent::Disconnected { .. } => "disconnected",
        TunnelEvent::WorkerError { .. } => "worker_error",
        TunnelEvent::Heartbeat { .. } => "heartbeat",
    }
}

fn to_sse_event(event: &TunnelEvent) -> Result<Event, Infallible> {
    let data = serde_json::to_string(event).unwrap_or_else(|e| {
        tracing::error!("Failed to serialize tunnel event: {e}");
        "{}".to_string()
    });
    Ok(Event::default().event(event_name(event)).data(data))
}

#[cfg(not(test))]
fn heartbeat_interval() -> Duration {
    Duration::from_secs(10)
}

#[cfg(test)]
fn heartbeat_interval() -> Duration {
    Duration::from_millis(100)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use rtunnel_common::{TunnelConfig, TunnelStatus};

    use crate::tunnel::testing::FakeEngine;

    fn app() -> (Router, TunnelManager, Arc<FakeEngine>) {
        let (app, manager, engine, _) = app_with_shutdown();
        (app, manager, engine)
    }

    fn app_with_shutdown() -> (Router, TunnelManager, Arc<FakeEngine>, broadcast::Sender<()>) {
        let engine = FakeEngine::new();
        let manager = TunnelManager::new(engine.clone());
        let (shutdown_tx, _) = broadcast::channel(1);
        let state = Arc::new(AppState {
            tunnel_manager: manager.clone(),
            shutdown_tx: shutdown_tx.clone(),
        });
        (create_router(state), manager, engine, shutdown_tx)
    }

    fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn empty_request(method: &str, uri: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    async fn body_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn create_body(config_id: &str) -> Value {
        json!({
            "config": {
                "config_id": config_id,
                "forwarding": "0:localhost:3000",
                "additional_forwarding": ["db.example.com:5432:localhost:5432"]
            }
        })
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _, _) = app();
        let response = app.oneshot(empty_request("GET", "/api/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_create_starts_tunnel() {
        let (app, manager, _) = app();
        let response = app
            .oneshot(json_request("POST", "/api/tunnels", create_body("web")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let result: StartTunnelResult = serde_json::from_value(body_json(response).await).unwrap();
        assert_eq!(result.urls, vec!["https://web.fake.test".to_string()]);
        assert_eq!(result.forwarding.len(), 1);
        assert!(result.forwarding[0].is_ok());
        assert_eq!(
            manager.get_tunnel_status(&result.tunnel_id).unwrap(),
            TunnelStatus::Live
        );
    }

    #[tokio::test]
    async fn test_error_status_mapping() {
        let (app, _, engine) = app();

        let response = app
            .clone()
            .oneshot(json_request("POST", "/api/tunnels", create_body("web")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = app
            .clone()
            .oneshot(json_request("POST", "/api/tunnels", create_body("web")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(body_json(response).await["code"], "duplicate_config");

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/tunnels",
                json!({ "config": { "config_id": "bad", "forwarding": "localhost" } }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        engine.fail_start_for("0:localhost:4000");
        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/tunnels",
                json!({ "config": { "config_id": "broken", "forwarding": "0:localhost:4000" } }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

        let response = app
            .oneshot(empty_request("GET", "/api/tunnels/nope/urls"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["code"], "not_found");
    }

    #[tokio::test]
    async fn test_queries_and_stop() {
        let (app, manager, _) = app();
        let result = manager
            .launch(TunnelConfig::new("api", "0:localhost:3000"), None)
            .await
            .unwrap();
        let id = result.tunnel_id;

        let response = app
            .clone()
            .oneshot(empty_request("GET", &format!("/api/tunnels/{}/greet", id)))
            .await
            .unwrap();
        assert_eq!(body_json(response).await, json!(["Welcome, api"]));

        let response = app
            .clone()
            .oneshot(empty_request("GET", &format!("/api/tunnels/{}/status", id)))
            .await
            .unwrap();
        assert_eq!(body_json(response).await["status"], "live");

        let response = app
            .clone()
            .oneshot(empty_request("GET", &format!("/api/tunnels/{}/stats", id)))
            .await
            .unwrap();
        assert_eq!(body_json(response).await, Value::Null);

        let response = app
            .clone()
            .oneshot(empty_request("GET", &format!("/api/tunnels/{}/usage", id)))
            .await
            .unwrap();
        assert_eq!(body_json(response).await, Value::Null);

        let response = app
            .clone()
            .oneshot(empty_request("GET", &format!("/api/tunnels/{}/warnings", id)))
            .await
            .unwrap();
        assert_eq!(body_json(response).await, json!([]));

        let response = app
            .clone()
            .oneshot(empty_request("GET", "/api/tunnels"))
            .await
            .unwrap();
        let list: TunnelsListResponse = serde_json::from_value(body_json(response).await).unwrap();
        assert_eq!(list.tunnels.len(), 1);
        assert_eq!(list.tunnels[0].config_id, "api");

        let response = app
            .clone()
            .oneshot(empty_request("POST", &format!("/api/tunnels/{}/stop", id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(manager.list_tunnels().is_empty());

        let response = app
            .oneshot(empty_request("POST", &format!("/api/tunnels/{}/stop", id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_update_by_config_id() {
        let (app, manager, _) = app();
        let result = manager
            .launch(TunnelConfig::new("upd", "0:localhost:3000"), None)
            .await
            .unwrap();

        let response = app
            .oneshot(json_request(
                "PUT",
                "/api/tunnels/config",
                json!({ "config_id": "upd", "forwarding": "0:localhost:3001" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let summary: TunnelSummary = serde_json::from_value(body_json(response).await).unwrap();
        assert_eq!(summary.tunnel_id, result.tunnel_id);
        assert_eq!(summary.config.forwarding, "0:localhost:3001");
        assert_eq!(summary.status, TunnelStatus::Live);
    }

    #[tokio::test]
    async fn test_event_stream_delivers_and_deregisters() {
        let (app, manager, engine) = app();
        let result = manager
            .launch(TunnelConfig::new("sse", "0:localhost:3000"), None)
            .await
            .unwrap();
        let id = result.tunnel_id;

        let response = app
            .oneshot(empty_request("GET", &format!("/api/tunnels/{}/events", id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(manager.listener_count(&id), 4);

        engine
            .last()
            .fire_usage(json!({ "numLiveConnections": 2, "numTotalConnections": 5 }));

        let mut body = response.into_body().into_data_stream();
        let mut seen = String::new();
        let found = tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(Ok(chunk)) = body.next().await {
                seen.push_str(&String::from_utf8_lossy(&chunk));
                if seen.contains("event: stats") {
                    return true;
                }
            }
            false
        })
        .await
        .unwrap_or(false);
        assert!(found, "no stats event in: {}", seen);
        assert!(seen.contains("\"num_live_connections\":2"));

        drop(body);
        assert_eq!(manager.listener_count(&id), 0);
    }

    #[tokio::test]
    async fn test_event_stream_heartbeats_and_ends_on_stop() {
        let (app, manager, _) = app();
        let result = manager
            .launch(TunnelConfig::new("hb", "0:localhost:3000"), None)
            .await
            .unwrap();
        let id = result.tunnel_id;

        let response = app
            .oneshot(empty_request("GET", &format!("/api/tunnels/{}/events", id)))
            .await
            .unwrap();
        let mut body = response.into_body().into_data_stream();

        let chunk = tokio::time::timeout(Duration::from_secs(1), body.next())
            .await
            .expect("heartbeat timed out")
            .expect("stream ended")
            .unwrap();
        assert!(String::from_utf8_lossy(&chunk).contains("heartbeat"));

        manager.stop_tunnel(&id).await.unwrap();
        let ended = tokio::time::timeout(Duration::from_secs(5), async {
            while body.next().await.is_some() {}
        })
        .await;
        assert!(ended.is_ok(), "event stream kept running after stop");
    }

    #[tokio::test]
    async fn test_event_stream_ends_on_shutdown() {
        let (app, manager, _, shutdown_tx) = app_with_shutdown();
        let result = manager
            .launch(TunnelConfig::new("down", "0:localhost:3000"), None)
            .await
            .unwrap();
        let id = result.tunnel_id;

        let response = app
            .oneshot(empty_request("GET", &format!("/api/tunnels/{}/events", id)))
            .await
            .unwrap();
        let mut body = response.into_body().into_data_stream();

        let chunk = tokio::time::timeout(Duration::from_secs(1), body.next())
            .await
            .expect("heartbeat timed out")
            .expect("stream ended")
            .unwrap();
        assert!(String::from_utf8_lossy(&chunk).contains("heartbeat"));

        shutdown_tx.send(()).unwrap();
        let ended = tokio::time::timeout(Duration::from_secs(5), async {
            while body.next().await.is_some() {}
        })
        .await;
        assert!(ended.is_ok(), "event stream kept running after shutdown");
        drop(body);
        assert_eq!(manager.listener_count(&id), 0);
        // The tunnel itself is left to the shutdown sequence
        assert_eq!(manager.get_tunnel_status(&id).unwrap(), TunnelStatus::Live);
    }

    #[tokio::test]
    async fn test_get_by_config_id() {
        let (app, manager, _) = app();
        let result = manager
            .launch(TunnelConfig::new("lookup", "0:localhost:3000"), None)
            .await
            .unwrap();

        let response = app
            .clone()
            .oneshot(empty_request("GET", "/api/configs/lookup"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let summary: TunnelSummary = serde_json::from_value(body_json(response).await).unwrap();
        assert_eq!(summary.tunnel_id, result.tunnel_id);

        let response = app
            .oneshot(empty_request("GET", "/api/configs/missing"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_start_while_starting_is_conflict() {
        let (app, manager, engine) = app();
        let tunnel = manager
            .create_tunnel(TunnelConfig::new("busy", "0:localhost:3000"), None)
            .await
            .unwrap();
        engine.last().set_status(TunnelStatus::Starting);

        let response = app
            .oneshot(empty_request(
                "POST",
                &format!("/api/tunnels/{}/start", tunnel.tunnel_id),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(body_json(response).await["code"], "invalid_state");
    }

    #[tokio::test]
    async fn test_event_stream_unknown_tunnel() {
        let (app, _, _) = app();
        let response = app
            .oneshot(empty_request("GET", "/api/tunnels/missing/events"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
