// rtunnel - Static file serving worker
// Serves a directory on the base forwarding's local port so the tunnel has something to expose

use std::path::{Path, PathBuf};

use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use rtunnel_common::format_host_port;

/// Status reported by a running worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServeMessage {
    /// Listening on the given address
    Started(String),
    /// Non-fatal issue
    Warning(String),
    /// The worker stopped serving
    Error(String),
}

/// Handle to the file server task; aborts the task when dropped
#[derive(Debug)]
pub struct ServeWorker {
    handle: JoinHandle<()>,
}

impl ServeWorker {
    /// Check that `path` is a directory we can serve
    pub fn check_path(path: &Path) -> Result<PathBuf, String> {
        match path.canonicalize() {
            Ok(dir) if dir.is_dir() => Ok(dir),
            Ok(_) => Err(format!(
                "serve path {} is not a directory, nothing is served",
                path.display()
            )),
            Err(e) => Err(format!(
                "serve path {} is not accessible ({}), nothing is served",
                path.display(),
                e
            )),
        }
    }

    /// Spawn the file server for `dir` on `host:port`
    pub fn spawn(
        dir: PathBuf,
        host: String,
        port: u16,
        messages: mpsc::UnboundedSender<ServeMessage>,
    ) -> Self {
        let handle = tokio::spawn(async move {
            let address = format_host_port(&host, port);
            let listener = match TcpListener::bind((host.as_str(), port)).await {
                Ok(listener) => listener,
                Err(e) => {
                    let _ = messages.send(ServeMessage::Error(format!(
                        "failed to bind file server to {}: {}",
                        address, e
                    )));
                    return;
                }
            };

            if is_empty_dir(&dir).await {
                let _ = messages.send(ServeMessage::Warning(format!(
                    "serve directory {} is empty",
                    dir.display()
                )));
            }

            info!("Serving {} on {}", dir.display(), address);
            let _ = messages.send(ServeMessage::Started(address.clone()));

            let app = Router::new()
                .fallback_service(ServeDir::new(&dir).append_index_html_on_directories(true))
                .layer(TraceLayer::new_for_http());

            match axum::serve(listener, app).await {
                Ok(()) => debug!("File server on {} stopped", address),
                Err(e) => {
                    let _ = messages.send(ServeMessage::Error(format!(
                        "file server on {} failed: {}",
                        address, e
                    )));
                }
            }
        });

        Self { handle }
    }

    pub fn abort(&self) {
        self.handle.abort();
    }
}

impl Drop for ServeWorker {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn is_empty_dir(dir: &Path) -> bool {
    match tokio::fs::read_dir(dir).await {
        Ok(mut entries) => matches!(entries.next_entry().await, Ok(None)),
        Err(_) => false,
    }
}
