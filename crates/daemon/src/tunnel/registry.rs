// rtunnel - Tunnel registry
// Dual-keyed store of managed tunnels (by tunnel id and by config id)

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use rtunnel_common::{Error, Result, TunnelConfig, TunnelSummary};

use super::engine::TunnelInstance;
use super::serve::ServeWorker;

/// A tunnel owned by the manager
///
/// Created once per engine instance. Restart and update build a new
/// `ManagedTunnel` instead of mutating this one.
pub struct ManagedTunnel {
    pub tunnel_id: String,
    pub config_id: String,
    pub tunnel_name: Option<String>,
    pub instance: Arc<dyn TunnelInstance>,
    /// Snapshot the instance was created from
    pub tunnel_config: TunnelConfig,
    pub additional_forwarding: Vec<String>,
    pub serve: Option<PathBuf>,
    /// Distinguishes this tunnel from earlier ones that used the same tunnel id
    pub(crate) generation: u64,
    serve_worker: Mutex<Option<ServeWorker>>,
    warnings: Mutex<Vec<String>>,
}

impl fmt::Debug for ManagedTunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedTunnel")
            .field("tunnel_id", &self.tunnel_id)
            .field("config_id", &self.config_id)
            .field("tunnel_name", &self.tunnel_name)
            .field("generation", &self.generation)
            .field("status", &self.instance.status())
            .finish_non_exhaustive()
    }
}

impl ManagedTunnel {
    pub(crate) fn new(
        tunnel_id: String,
        generation: u64,
        config: TunnelConfig,
        instance: Arc<dyn TunnelInstance>,
    ) -> Self {
        Self {
            tunnel_id,
            config_id: config.config_id.clone(),
            tunnel_name: config.name.clone(),
            instance,
            additional_forwarding: config.additional_forwarding.clone(),
            serve: config.serve.clone(),
            tunnel_config: config,
            generation,
            serve_worker: Mutex::new(None),
            warnings: Mutex::new(Vec::new()),
        }
    }

    pub fn add_warning(&self, warning: impl Into<String>) {
        self.warnings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(warning.into());
    }

    pub fn warnings(&self) -> Vec<String> {
        self.warnings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub(crate) fn set_serve_worker(&self, worker: ServeWorker) {
        let previous = self
            .serve_worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(worker);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Abort the file server, if one runs
    pub(crate) fn stop_serve_worker(&self) -> bool {
        let worker = self
            .serve_worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        match worker {
            Some(worker) => {
                worker.abort();
                true
            }
            None => false,
        }
    }

    #[cfg(test)]
    pub fn has_serve_worker(&self) -> bool {
        self.serve_worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    pub fn summary(&self) -> TunnelSummary {
        TunnelSummary {
            tunnel_id: self.tunnel_id.clone(),
            config_id: self.config_id.clone(),
            tunnel_name: self.tunnel_name.clone(),
            status: self.instance.status(),
            urls: self.instance.urls(),
            warnings: self.warnings(),
            config: self.tunnel_config.clone(),
        }
    }
}

#[derive(Default)]
struct Maps {
    by_tunnel_id: HashMap<String, Arc<ManagedTunnel>>,
    by_config_id: HashMap<String, Arc<ManagedTunnel>>,
}

/// Both maps live behind one lock so they are always mutated together
#[derive(Default)]
pub struct Registry {
    maps: RwLock<Maps>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Maps> {
        self.maps.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Maps> {
        self.maps.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert under both keys; fails without changes if either key is taken
    pub fn insert(&self, tunnel: Arc<ManagedTunnel>) -> Result<()> {
        let mut maps = self.write();

        if maps.by_config_id.contains_key(&tunnel.config_id) {
            return Err(Error::DuplicateConfig(tunnel.config_id.clone()));
        }
        if maps.by_tunnel_id.contains_key(&tunnel.tunnel_id) {
            return Err(Error::InvalidState(format!(
                "tunnel id {} is already in use",
                tunnel.tunnel_id
            )));
        }

        maps.by_config_id
            .insert(tunnel.config_id.clone(), tunnel.clone());
        maps.by_tunnel_id.insert(tunnel.tunnel_id.clone(), tunnel);
        Ok(())
    }

    pub fn get_by_tunnel_id(&self, tunnel_id: &str) -> Result<Arc<ManagedTunnel>> {
        self.read()
            .by_tunnel_id
            .get(tunnel_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("tunnel {}", tunnel_id)))
    }

    pub fn get_by_config_id(&self, config_id: &str) -> Result<Arc<ManagedTunnel>> {
        self.read()
            .by_config_id
            .get(config_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("config {}", config_id)))
    }

    pub fn contains_config(&self, config_id: &str) -> bool {
        self.read().by_config_id.contains_key(config_id)
    }

    /// Remove from both maps; `NotFound` if the tunnel id is unknown
    pub fn remove(&self, tunnel_id: &str) -> Result<Arc<ManagedTunnel>> {
        let mut maps = self.write();
        let tunnel = maps
            .by_tunnel_id
            .remove(tunnel_id)
            .ok_or_else(|| Error::NotFound(format!("tunnel {}", tunnel_id)))?;
        maps.by_config_id.remove(&tunnel.config_id);
        Ok(tunnel)
    }

    /// Remove `tunnel` only if it is still the registered one for its tunnel id
    pub fn remove_current(&self, tunnel: &ManagedTunnel) -> bool {
        let mut maps = self.write();
        let is_current = maps
            .by_tunnel_id
            .get(&tunnel.tunnel_id)
            .is_some_and(|entry| entry.generation == tunnel.generation);
        if is_current {
            maps.by_tunnel_id.remove(&tunnel.tunnel_id);
            maps.by_config_id.remove(&tunnel.config_id);
        }
        is_current
    }

    /// All tunnels, ordered by config id
    pub fn all(&self) -> Vec<Arc<ManagedTunnel>> {
        let mut tunnels: Vec<_> = self.read().by_tunnel_id.values().cloned().collect();
        tunnels.sort_by(|a, b| a.config_id.cmp(&b.config_id));
        tunnels
    }

    /// Empty both maps and return what they held
    pub fn drain(&self) -> Vec<Arc<ManagedTunnel>> {
        let mut maps = self.write();
        maps.by_config_id.clear();
        maps.by_tunnel_id.drain().map(|(_, tunnel)| tunnel).collect()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        let maps = self.read();
        debug_assert_eq!(maps.by_tunnel_id.len(), maps.by_config_id.len());
        maps.by_tunnel_id.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
