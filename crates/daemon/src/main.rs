// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 rtunnel Contributors

// rtunnel - Daemon
// Hosts the tunnel manager behind the control API

mod api;
mod auth;
mod config;
mod remote;
mod tunnel;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use api::{create_router, AppState};
use config::DaemonConfig;
use tunnel::ssh::SshEngine;
use tunnel::TunnelManager;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rtunnel_daemon=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("rtunnel daemon starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let daemon_config = DaemonConfig::load()?;
    info!("Authentication required: {}", daemon_config.require_auth);

    let auth_token = if daemon_config.require_auth {
        let (token, was_new) = auth::load_or_generate_token(&daemon_config.auth_token_path)?;
        if was_new {
            config::write_cli_config_snippet(&daemon_config, Some(token.as_str()))?;
        }
        Some(token)
    } else {
        info!("Authentication disabled - API endpoints are publicly accessible");
        None
    };

    let engine = SshEngine::new(daemon_config.engine.to_engine_config());
    let tunnel_manager = TunnelManager::new(Arc::new(engine));

    // Closes SSE streams and the dashboard connection on shutdown
    let (shutdown_tx, _) = broadcast::channel(1);

    if let Some(remote) = daemon_config.remote_management.clone() {
        info!("Remote management enabled: {}", remote.url);
        remote::spawn(remote, tunnel_manager.clone(), shutdown_tx.subscribe());
    }

    let state = Arc::new(AppState {
        tunnel_manager: tunnel_manager.clone(),
        shutdown_tx: shutdown_tx.clone(),
    });

    let app = match auth_token {
        Some(token) => create_router(state).layer(axum::middleware::from_fn_with_state(
            auth::AuthState::new(token),
            auth::auth_middleware,
        )),
        None => create_router(state),
    }
    .layer(TraceLayer::new_for_http());

    let bind_address = daemon_config.bind_address();
    let listener = tokio::net::TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("Failed to bind to {}", bind_address))?;

    info!("Daemon listening on {}", bind_address);
    info!("Daemon started successfully");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(tunnel_manager, shutdown_tx))
        .await
        .context("Control API server error")?;

    info!("Daemon shut down");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM, stop all tunnels, then close open streams
async fn shutdown_signal(tunnel_manager: TunnelManager, shutdown_tx: broadcast::Sender<()>) {
    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("Failed to install SIGTERM handler");

    #[cfg(unix)]
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down");
        }
    };

    #[cfg(not(unix))]
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Received Ctrl+C, shutting down");
    }

    tunnel_manager.stop_all_tunnels().await;
    info!("All tunnels stopped");

    let _ = shutdown_tx.send(());
}
