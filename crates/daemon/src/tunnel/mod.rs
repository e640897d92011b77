// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 rtunnel Contributors

// rtunnel - Tunnel Module
// Lifecycle manager: owns every tunnel's identity, engine instance and listeners

pub mod engine;
pub mod listeners;
pub mod reconnect;
pub mod registry;
pub mod serve;
pub mod ssh;
#[cfg(test)]
pub(crate) mod testing;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use serde_json::Value;
use tokio::sync::{mpsc, Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use rtunnel_common::{
    normalize_stats, AdditionalForwarding, Error, ForwardingOutcome, Result, StartTunnelResult,
    TunnelConfig, TunnelConfigUpdate, TunnelStats, TunnelStatus, TunnelSummary,
};

use engine::{EngineEventHandler, TunnelEngine};
use listeners::{DisconnectEvent, ErrorEvent, ListenerHub, WorkerErrorEvent};
use reconnect::ReconnectPolicy;
use registry::{ManagedTunnel, Registry};
use serve::{ServeMessage, ServeWorker};

/// Manages all tunnels
///
/// Cheap to clone; every clone drives the same set of tunnels.
#[derive(Clone)]
pub struct TunnelManager {
    inner: Arc<Inner>,
}

struct Inner {
    engine: Arc<dyn TunnelEngine>,
    registry: Registry,
    listeners: ListenerHub,
    stats: Mutex<HashMap<String, TunnelStats>>,
    generation: AtomicU64,
    reconnecting: Mutex<HashSet<String>>,
    /// Serializes start, stop, restart and update of one tunnel id
    tunnel_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl Inner {
    fn is_current(&self, tunnel_id: &str, generation: u64) -> bool {
        matches!(
            self.registry.get_by_tunnel_id(tunnel_id),
            Ok(tunnel) if tunnel.generation == generation
        )
    }

    fn clear_stats(&self, tunnel_id: &str) {
        self.stats
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(tunnel_id);
    }

    fn begin_reconnect(&self, tunnel_id: &str) -> bool {
        self.reconnecting
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(tunnel_id.to_string())
    }

    fn end_reconnect(&self, tunnel_id: &str) {
        self.reconnecting
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(tunnel_id);
    }

    async fn lock_tunnel(&self, tunnel_id: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .tunnel_locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(tunnel_id.to_string())
            .or_default()
            .clone();
        lock.lock_owned().await
    }

    /// Forget the lock of a tunnel id that left the registry
    ///
    /// Kept while another operation still waits on it.
    fn release_tunnel_lock(&self, tunnel_id: &str, guard: OwnedMutexGuard<()>) {
        let mut locks = self.tunnel_locks.lock().unwrap_or_else(|e| e.into_inner());
        let unused = locks.get(tunnel_id).is_some_and(|lock| {
            Arc::ptr_eq(lock, OwnedMutexGuard::mutex(&guard)) && Arc::strong_count(lock) == 2
        });
        if unused {
            locks.remove(tunnel_id);
        }
        drop(locks);
        drop(guard);
    }
}

impl TunnelManager {
    pub fn new(engine: Arc<dyn TunnelEngine>) -> Self {
        Self {
            inner: Arc::new(Inner {
                engine,
                registry: Registry::new(),
                listeners: ListenerHub::new(),
                stats: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(0),
                reconnecting: Mutex::new(HashSet::new()),
                tunnel_locks: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Create a tunnel without starting it
    ///
    /// `tunnel_id` is reused when given (restart, update), otherwise a fresh
    /// UUID is assigned. This is the only place tunnels enter the registry.
    pub async fn create_tunnel(
        &self,
        config: TunnelConfig,
        tunnel_id: Option<String>,
    ) -> Result<Arc<ManagedTunnel>> {
        config.validate_identity()?;
        if self.inner.registry.contains_config(&config.config_id) {
            return Err(Error::DuplicateConfig(config.config_id.clone()));
        }
        config.validate()?;

        let tunnel_id = tunnel_id.unwrap_or_else(|| Uuid::new_v4().to_string());

        let instance = self.inner.engine.create(&config).await.map_err(|e| {
            error!("Failed to create tunnel {}: {:#}", tunnel_id, e);
            Error::Engine(format!("{:#}", e))
        })?;

        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
        let tunnel = Arc::new(ManagedTunnel::new(
            tunnel_id.clone(),
            generation,
            config,
            instance.clone(),
        ));

        // Loses against a concurrent create for the same config id
        if let Err(e) = self.inner.registry.insert(tunnel.clone()) {
            if let Err(stop_err) = instance.stop().await {
                debug!(
                    "Stopping unregistered instance for config {}: {:#}",
                    tunnel.config_id, stop_err
                );
            }
            return Err(e);
        }

        instance.set_event_handler(Arc::new(TunnelEvents {
            inner: Arc::downgrade(&self.inner),
            tunnel_id: tunnel_id.clone(),
            generation,
        }));

        info!(
            "Created tunnel {} for config {}",
            tunnel_id,
            tunnel.tunnel_config.display_name()
        );
        Ok(tunnel)
    }

    /// Start a created (or errored) tunnel and return its public URLs
    pub async fn start_tunnel(&self, tunnel_id: &str) -> Result<StartTunnelResult> {
        let guard = self.inner.lock_tunnel(tunnel_id).await;
        let result = self.start_locked(tunnel_id).await;
        if matches!(result, Err(Error::NotFound(_))) {
            self.inner.release_tunnel_lock(tunnel_id, guard);
        }
        result
    }

    async fn start_locked(&self, tunnel_id: &str) -> Result<StartTunnelResult> {
        let tunnel = self.inner.registry.get_by_tunnel_id(tunnel_id)?;

        match tunnel.instance.status() {
            TunnelStatus::Live => {
                debug!("Tunnel {} is already live", tunnel_id);
                return Ok(StartTunnelResult {
                    tunnel_id: tunnel_id.to_string(),
                    urls: tunnel.instance.urls(),
                    forwarding: Vec::new(),
                    warnings: tunnel.warnings(),
                });
            }
            TunnelStatus::Starting => {
                return Err(Error::InvalidState(format!(
                    "tunnel {} is already starting",
                    tunnel_id
                )));
            }
            _ => {}
        }

        info!(
            "Starting tunnel {} ({})",
            tunnel_id,
            tunnel.tunnel_config.display_name()
        );
        let urls = tunnel.instance.start().await.map_err(|e| {
            error!("Failed to start tunnel {}: {:#}", tunnel_id, e);
            Error::Engine(format!("{:#}", e))
        })?;

        let forwarding = self.apply_additional_forwarding(&tunnel).await;
        self.launch_serve_worker(&tunnel);

        info!("Tunnel {} is live: {}", tunnel_id, urls.join(", "));
        Ok(StartTunnelResult {
            tunnel_id: tunnel_id.to_string(),
            urls,
            forwarding,
            warnings: tunnel.warnings(),
        })
    }

    /// Create and start in one step; nothing stays registered if the start fails
    pub async fn launch(
        &self,
        config: TunnelConfig,
        tunnel_id: Option<String>,
    ) -> Result<StartTunnelResult> {
        let tunnel = self.create_tunnel(config, tunnel_id).await?;
        match self.start_tunnel(&tunnel.tunnel_id).await {
            Ok(result) => Ok(result),
            Err(e) => {
                if let Err(stop_err) = self.stop_tunnel(&tunnel.tunnel_id).await {
                    debug!(
                        "Cleanup of tunnel {} after failed start: {}",
                        tunnel.tunnel_id, stop_err
                    );
                }
                Err(e)
            }
        }
    }

    /// Stop a tunnel and forget it
    ///
    /// Registry entries, stats and listeners are removed even when the engine
    /// fails to stop; that failure is returned afterwards.
    pub async fn stop_tunnel(&self, tunnel_id: &str) -> Result<()> {
        let guard = self.inner.lock_tunnel(tunnel_id).await;
        let tunnel = match self.inner.registry.remove(tunnel_id) {
            Ok(tunnel) => tunnel,
            Err(e) => {
                self.inner.release_tunnel_lock(tunnel_id, guard);
                return Err(e);
            }
        };
        info!(
            "Stopping tunnel {} ({})",
            tunnel_id,
            tunnel.tunnel_config.display_name()
        );

        let result = tunnel.instance.stop().await;
        tunnel.stop_serve_worker();
        self.inner.clear_stats(tunnel_id);
        self.inner.listeners.clear_tunnel(tunnel_id);
        self.inner.release_tunnel_lock(tunnel_id, guard);

        result.map_err(|e| {
            error!("Failed to stop tunnel {}: {:#}", tunnel_id, e);
            Error::Engine(format!("{:#}", e))
        })
    }

    /// Stop and recreate a tunnel from its own configuration
    ///
    /// Tunnel id, config id and listener registrations are kept.
    pub async fn restart_tunnel(&self, tunnel_id: &str) -> Result<StartTunnelResult> {
        let guard = self.inner.lock_tunnel(tunnel_id).await;
        let result = self.restart_locked(tunnel_id).await;
        if matches!(result, Err(Error::NotFound(_))) {
            self.inner.release_tunnel_lock(tunnel_id, guard);
        }
        result
    }

    async fn restart_locked(&self, tunnel_id: &str) -> Result<StartTunnelResult> {
        let old = self.inner.registry.get_by_tunnel_id(tunnel_id)?;
        let snapshot = old.instance.config();
        info!("Restarting tunnel {}", tunnel_id);

        if let Err(e) = old.instance.stop().await {
            warn!("Failed to stop tunnel {} before restart: {:#}", tunnel_id, e);
        }
        self.teardown(&old);

        let result = match self
            .create_tunnel(snapshot.clone(), Some(tunnel_id.to_string()))
            .await
        {
            Ok(tunnel) => self.start_or_discard(&tunnel).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(result) => Ok(result),
            Err(e) => {
                error!("Restart of tunnel {} failed: {}", tunnel_id, e);
                self.rollback(tunnel_id, snapshot, true).await;
                Err(e)
            }
        }
    }

    /// Apply a partial configuration to the tunnel holding `update.config_id`
    ///
    /// The tunnel is rebuilt under the same tunnel id and restarted if it was
    /// live. On failure the previous configuration is restored.
    pub async fn update_config(&self, update: TunnelConfigUpdate) -> Result<TunnelSummary> {
        // The config id may move to another tunnel id while we wait for the lock
        let (old, _guard) = loop {
            let tunnel_id = self
                .inner
                .registry
                .get_by_config_id(&update.config_id)?
                .tunnel_id
                .clone();
            let guard = self.inner.lock_tunnel(&tunnel_id).await;
            match self.inner.registry.get_by_config_id(&update.config_id) {
                Ok(old) if old.tunnel_id == tunnel_id => break (old, guard),
                Ok(_) => self.inner.release_tunnel_lock(&tunnel_id, guard),
                Err(e) => {
                    self.inner.release_tunnel_lock(&tunnel_id, guard);
                    return Err(e);
                }
            }
        };
        let snapshot = old.tunnel_config.clone();
        let merged = snapshot.merged(&update);
        merged.validate()?;

        let tunnel_id = old.tunnel_id.clone();
        let was_running = matches!(
            old.instance.status(),
            TunnelStatus::Live | TunnelStatus::Starting
        );
        info!(
            "Updating configuration of tunnel {} (config {}, running: {})",
            tunnel_id, update.config_id, was_running
        );

        if was_running {
            if let Err(e) = old.instance.stop().await {
                warn!("Failed to stop tunnel {} before update: {:#}", tunnel_id, e);
            }
        }
        self.teardown(&old);

        let result = match self.create_tunnel(merged, Some(tunnel_id.clone())).await {
            Ok(tunnel) if was_running => self.start_or_discard(&tunnel).await.map(|_| tunnel),
            other => other,
        };

        match result {
            Ok(tunnel) => Ok(tunnel.summary()),
            Err(e) => {
                error!("Update of tunnel {} failed: {}", tunnel_id, e);
                self.rollback(&tunnel_id, snapshot, was_running).await;
                Err(e)
            }
        }
    }

    /// Stop every tunnel (best effort) and clear all state
    pub async fn stop_all_tunnels(&self) {
        let tunnel_ids: Vec<String> = self
            .inner
            .registry
            .all()
            .iter()
            .map(|tunnel| tunnel.tunnel_id.clone())
            .collect();
        info!("Stopping {} tunnel(s)", tunnel_ids.len());

        for tunnel_id in tunnel_ids {
            match self.stop_tunnel(&tunnel_id).await {
                Ok(()) | Err(Error::NotFound(_)) => {}
                Err(e) => warn!("Failed to stop tunnel {} during shutdown: {}", tunnel_id, e),
            }
        }

        // Created while the loop above ran
        for tunnel in self.inner.registry.drain() {
            if let Err(e) = tunnel.instance.stop().await {
                warn!(
                    "Failed to stop tunnel {} during shutdown: {:#}",
                    tunnel.tunnel_id, e
                );
            }
            tunnel.stop_serve_worker();
        }

        self.inner
            .stats
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.inner.listeners.clear_all();
        self.inner
            .reconnecting
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    pub fn list_tunnels(&self) -> Vec<TunnelSummary> {
        self.inner
            .registry
            .all()
            .iter()
            .map(|tunnel| tunnel.summary())
            .collect()
    }

    pub fn get_tunnel(&self, tunnel_id: &str) -> Result<TunnelSummary> {
        Ok(self.inner.registry.get_by_tunnel_id(tunnel_id)?.summary())
    }

    pub fn get_tunnel_by_config(&self, config_id: &str) -> Result<TunnelSummary> {
        Ok(self.inner.registry.get_by_config_id(config_id)?.summary())
    }

    /// Latest normalized usage, `None` until the engine has reported any
    pub fn get_tunnel_stats(&self, tunnel_id: &str) -> Result<Option<TunnelStats>> {
        self.inner.registry.get_by_tunnel_id(tunnel_id)?;
        Ok(self
            .inner
            .stats
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(tunnel_id)
            .copied())
    }

    pub fn get_tunnel_urls(&self, tunnel_id: &str) -> Result<Vec<String>> {
        Ok(self.inner.registry.get_by_tunnel_id(tunnel_id)?.instance.urls())
    }

    pub fn get_tunnel_status(&self, tunnel_id: &str) -> Result<TunnelStatus> {
        Ok(self.inner.registry.get_by_tunnel_id(tunnel_id)?.instance.status())
    }

    pub fn get_greet_message(&self, tunnel_id: &str) -> Result<Vec<String>> {
        Ok(self
            .inner
            .registry
            .get_by_tunnel_id(tunnel_id)?
            .instance
            .greet_message())
    }

    pub fn get_warnings(&self, tunnel_id: &str) -> Result<Vec<String>> {
        Ok(self.inner.registry.get_by_tunnel_id(tunnel_id)?.warnings())
    }

    /// Usage payload exactly as the engine last reported it
    pub fn get_raw_usage(&self, tunnel_id: &str) -> Result<Value> {
        Ok(self
            .inner
            .registry
            .get_by_tunnel_id(tunnel_id)?
            .instance
            .latest_usage())
    }

    pub fn get_local_server_tls(&self, tunnel_id: &str) -> Result<Option<String>> {
        Ok(self
            .inner
            .registry
            .get_by_tunnel_id(tunnel_id)?
            .instance
            .local_server_tls())
    }

    pub fn register_stats_listener<F>(&self, tunnel_id: &str, listener: F) -> Result<String>
    where
        F: Fn(&str, &TunnelStats) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.inner.registry.get_by_tunnel_id(tunnel_id)?;
        Ok(self.inner.listeners.stats.register(tunnel_id, listener))
    }

    pub fn register_error_listener<F>(&self, tunnel_id: &str, listener: F) -> Result<String>
    where
        F: Fn(&str, &ErrorEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.inner.registry.get_by_tunnel_id(tunnel_id)?;
        Ok(self.inner.listeners.errors.register(tunnel_id, listener))
    }

    pub fn register_disconnect_listener<F>(&self, tunnel_id: &str, listener: F) -> Result<String>
    where
        F: Fn(&str, &DisconnectEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.inner.registry.get_by_tunnel_id(tunnel_id)?;
        Ok(self.inner.listeners.disconnects.register(tunnel_id, listener))
    }

    pub fn register_worker_error_listener<F>(
        &self,
        tunnel_id: &str,
        listener: F,
    ) -> Result<String>
    where
        F: Fn(&str, &WorkerErrorEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.inner.registry.get_by_tunnel_id(tunnel_id)?;
        Ok(self.inner.listeners.worker_errors.register(tunnel_id, listener))
    }

    /// Listeners of every kind registered for `tunnel_id`
    pub fn listener_count(&self, tunnel_id: &str) -> usize {
        self.inner.listeners.total(tunnel_id)
    }

    pub fn deregister_stats_listener(&self, tunnel_id: &str, listener_id: &str) {
        self.inner.listeners.stats.deregister(tunnel_id, listener_id);
    }

    pub fn deregister_error_listener(&self, tunnel_id: &str, listener_id: &str) {
        self.inner.listeners.errors.deregister(tunnel_id, listener_id);
    }

    pub fn deregister_disconnect_listener(&self, tunnel_id: &str, listener_id: &str) {
        self.inner
            .listeners
            .disconnects
            .deregister(tunnel_id, listener_id);
    }

    pub fn deregister_worker_error_listener(&self, tunnel_id: &str, listener_id: &str) {
        self.inner
            .listeners
            .worker_errors
            .deregister(tunnel_id, listener_id);
    }

    /// Submit every additional forwarding rule; failures are recorded, never fatal
    async fn apply_additional_forwarding(&self, tunnel: &ManagedTunnel) -> Vec<ForwardingOutcome> {
        let mut outcomes = Vec::with_capacity(tunnel.additional_forwarding.len());

        for rule in &tunnel.additional_forwarding {
            let resolved = match AdditionalForwarding::parse(rule) {
                Ok(parsed) => parsed.resolve(),
                Err(e) => {
                    warn!(
                        "Skipping additional forwarding '{}' for tunnel {}: {}",
                        rule, tunnel.tunnel_id, e
                    );
                    tunnel.add_warning(format!("additional forwarding '{}': {}", rule, e));
                    outcomes.push(ForwardingOutcome {
                        rule: rule.clone(),
                        hostname: String::new(),
                        target: String::new(),
                        error: Some(e.to_string()),
                    });
                    continue;
                }
            };

            let hostname = resolved.hostname();
            let target = resolved.target();
            let error = match tunnel
                .instance
                .request_additional_forwarding(&hostname, &target)
                .await
            {
                Ok(()) => {
                    info!(
                        "Tunnel {}: forwarding {} -> {}",
                        tunnel.tunnel_id, hostname, target
                    );
                    None
                }
                Err(e) => {
                    warn!(
                        "Tunnel {}: additional forwarding {} -> {} failed: {:#}",
                        tunnel.tunnel_id, hostname, target, e
                    );
                    tunnel.add_warning(format!(
                        "additional forwarding {} -> {} failed: {}",
                        hostname, target, e
                    ));
                    Some(format!("{:#}", e))
                }
            };

            outcomes.push(ForwardingOutcome {
                rule: rule.clone(),
                hostname,
                target,
                error,
            });
        }

        outcomes
    }

    fn launch_serve_worker(&self, tunnel: &Arc<ManagedTunnel>) {
        let Some(path) = &tunnel.serve else {
            return;
        };

        let dir = match ServeWorker::check_path(path) {
            Ok(dir) => dir,
            Err(warning) => {
                warn!("Tunnel {}: {}", tunnel.tunnel_id, warning);
                tunnel.add_warning(warning);
                return;
            }
        };
        let base = match tunnel.tunnel_config.base_forwarding() {
            Ok(base) => base,
            Err(e) => {
                tunnel.add_warning(format!("cannot serve {}: {}", dir.display(), e));
                return;
            }
        };

        let (tx, mut rx) = mpsc::unbounded_channel();
        tunnel.set_serve_worker(ServeWorker::spawn(
            dir,
            base.local_domain.clone(),
            base.local_port,
            tx,
        ));

        let weak_tunnel = Arc::downgrade(tunnel);
        let weak_inner = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let Some(tunnel) = weak_tunnel.upgrade() else {
                    break;
                };
                match message {
                    ServeMessage::Started(address) => {
                        debug!("Tunnel {}: file server listening on {}", tunnel.tunnel_id, address)
                    }
                    ServeMessage::Warning(warning) => {
                        warn!("Tunnel {}: {}", tunnel.tunnel_id, warning);
                        tunnel.add_warning(warning);
                    }
                    ServeMessage::Error(err) => {
                        error!("Tunnel {}: {}", tunnel.tunnel_id, err);
                        tunnel.add_warning(err.clone());
                        if let Some(inner) = weak_inner.upgrade() {
                            if inner.is_current(&tunnel.tunnel_id, tunnel.generation) {
                                inner
                                    .listeners
                                    .worker_errors
                                    .dispatch(&tunnel.tunnel_id, &WorkerErrorEvent { error: err });
                            }
                        }
                    }
                }
            }
        });
    }

    /// Detach a tunnel that is being replaced; listeners are left alone
    fn teardown(&self, tunnel: &Arc<ManagedTunnel>) {
        tunnel.stop_serve_worker();
        if !self.inner.registry.remove_current(tunnel) {
            debug!(
                "Tunnel {} was already replaced in the registry",
                tunnel.tunnel_id
            );
        }
        self.inner.clear_stats(&tunnel.tunnel_id);
    }

    /// Start a freshly created replacement, tearing it down again if the start fails
    async fn start_or_discard(&self, tunnel: &Arc<ManagedTunnel>) -> Result<StartTunnelResult> {
        match self.start_locked(&tunnel.tunnel_id).await {
            Ok(result) => Ok(result),
            Err(e) => {
                if let Err(stop_err) = tunnel.instance.stop().await {
                    debug!(
                        "Stopping failed replacement of tunnel {}: {:#}",
                        tunnel.tunnel_id, stop_err
                    );
                }
                self.teardown(tunnel);
                Err(e)
            }
        }
    }

    /// Recreate a tunnel from its pre-change snapshot
    ///
    /// The restored tunnel stays registered even if it cannot be started again.
    async fn rollback(&self, tunnel_id: &str, snapshot: TunnelConfig, was_running: bool) {
        warn!("Rolling back tunnel {} to its previous configuration", tunnel_id);

        let tunnel = match self
            .create_tunnel(snapshot, Some(tunnel_id.to_string()))
            .await
        {
            Ok(tunnel) => tunnel,
            Err(e) => {
                error!("Rollback of tunnel {} failed: {}", tunnel_id, e);
                return;
            }
        };

        if was_running {
            if let Err(e) = self.start_locked(&tunnel.tunnel_id).await {
                error!(
                    "Rolled back tunnel {} could not be restarted: {}",
                    tunnel_id, e
                );
                tunnel.add_warning(format!("restart after rollback failed: {}", e));
            }
        }
    }
}

/// Engine callbacks of one tunnel, forwarded to the listener hub
///
/// Events from an instance that has since been replaced are dropped.
struct TunnelEvents {
    inner: Weak<Inner>,
    tunnel_id: String,
    generation: u64,
}

impl TunnelEvents {
    fn current(&self) -> Option<Arc<Inner>> {
        let inner = self.inner.upgrade()?;
        if inner.is_current(&self.tunnel_id, self.generation) {
            Some(inner)
        } else {
            debug!(
                "Dropping event from a replaced instance of tunnel {}",
                self.tunnel_id
            );
            None
        }
    }
}

impl EngineEventHandler for TunnelEvents {
    fn on_usage(&self, raw: Value) {
        let Some(inner) = self.current() else {
            return;
        };
        let stats = normalize_stats(&raw);
        inner
            .stats
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(self.tunnel_id.clone(), stats);
        inner.listeners.stats.dispatch(&self.tunnel_id, &stats);
    }

    fn on_error(&self, error_no: u32, message: &str, recoverable: bool) {
        let Some(inner) = self.current() else {
            return;
        };
        if recoverable {
            warn!("Tunnel {} error {}: {}", self.tunnel_id, error_no, message);
        } else {
            error!("Tunnel {} error {}: {}", self.tunnel_id, error_no, message);
        }
        inner.listeners.errors.dispatch(
            &self.tunnel_id,
            &ErrorEvent {
                error_no,
                message: message.to_string(),
                recoverable,
            },
        );
    }

    fn on_disconnected(&self, error: &str, messages: &[String]) {
        let Some(inner) = self.current() else {
            return;
        };
        warn!("Tunnel {} disconnected: {}", self.tunnel_id, error);
        inner.listeners.disconnects.dispatch(
            &self.tunnel_id,
            &DisconnectEvent {
                error: error.to_string(),
                messages: messages.to_vec(),
            },
        );

        let config = match inner.registry.get_by_tunnel_id(&self.tunnel_id) {
            Ok(tunnel) => tunnel.tunnel_config.clone(),
            Err(_) => return,
        };
        if config.auto_reconnect {
            reconnect::spawn_supervisor(
                TunnelManager { inner },
                self.tunnel_id.clone(),
                ReconnectPolicy::from_config(&config),
            );
        }
    }

    fn on_worker_error(&self, error: &str) {
        let Some(inner) = self.current() else {
            return;
        };
        error!("Tunnel {} worker error: {}", self.tunnel_id, error);
        inner.listeners.worker_errors.dispatch(
            &self.tunnel_id,
            &WorkerErrorEvent {
                error: error.to_string(),
            },
        );
    }
}
