// rtunnel - Tunnel engine seam
// The engine owns the broker protocol; the manager only drives it through these traits

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use rtunnel_common::{TunnelConfig, TunnelStatus};

/// Factory for tunnel instances
#[async_trait]
pub trait TunnelEngine: Send + Sync {
    /// Create an instance for `config`. The instance is not started.
    async fn create(&self, config: &TunnelConfig) -> Result<Arc<dyn TunnelInstance>>;
}

/// One tunnel session as seen by the manager
#[async_trait]
pub trait TunnelInstance: Send + Sync {
    /// Connect to the broker and return the public URLs
    async fn start(&self) -> Result<Vec<String>>;

    async fn stop(&self) -> Result<()>;

    fn status(&self) -> TunnelStatus;

    /// Configuration the instance was created from
    fn config(&self) -> TunnelConfig;

    /// Last raw usage payload, in whatever shape the engine reports it
    fn latest_usage(&self) -> Value;

    fn greet_message(&self) -> Vec<String>;

    fn local_server_tls(&self) -> Option<String>;

    fn urls(&self) -> Vec<String>;

    /// Forward `hostname_or_port` (`domain:port` or a bare port) to `target` on a live session
    async fn request_additional_forwarding(&self, hostname_or_port: &str, target: &str)
        -> Result<()>;

    /// Install the single event handler; replaces any previous one
    fn set_event_handler(&self, handler: Arc<dyn EngineEventHandler>);
}

/// Callbacks fired by an instance. Called from engine tasks, must not block.
pub trait EngineEventHandler: Send + Sync {
    fn on_usage(&self, raw: Value);

    fn on_error(&self, error_no: u32, message: &str, recoverable: bool);

    fn on_disconnected(&self, error: &str, messages: &[String]);

    fn on_worker_error(&self, error: &str);
}
