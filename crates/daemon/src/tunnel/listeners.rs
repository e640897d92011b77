// rtunnel - Listener Hub
// Per-tunnel callback registries for stats, error, disconnect and worker-error events

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, warn};
use uuid::Uuid;

use rtunnel_common::TunnelStats;

/// Engine error reported for a tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorEvent {
    pub error_no: u32,
    pub message: String,
    pub recoverable: bool,
}

/// Broker session loss
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectEvent {
    pub error: String,
    pub messages: Vec<String>,
}

/// Failure of a background worker (engine session task or file server)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerErrorEvent {
    pub error: String,
}

/// Callback invoked with the tunnel id and the event
pub type Listener<E> = Arc<dyn Fn(&str, &E) -> anyhow::Result<()> + Send + Sync>;

/// Registry for one event kind
pub struct ListenerSet<E> {
    kind: &'static str,
    entries: Mutex<HashMap<String, Vec<(String, Listener<E>)>>>,
}

impl<E> ListenerSet<E> {
    fn new(kind: &'static str) -> Self {
        Self {
            kind,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<(String, Listener<E>)>>> {
        // Listeners run outside the lock, so a poisoned map is still consistent
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add a listener and return its id
    pub fn register<F>(&self, tunnel_id: &str, listener: F) -> String
    where
        F: Fn(&str, &E) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let listener_id = Uuid::new_v4().to_string();
        let listener: Listener<E> = Arc::new(listener);
        self.lock()
            .entry(tunnel_id.to_string())
            .or_default()
            .push((listener_id.clone(), listener));
        debug!(
            "Registered {} listener {} for tunnel {}",
            self.kind, listener_id, tunnel_id
        );
        listener_id
    }

    /// Remove a listener; unknown ids are logged and ignored
    pub fn deregister(&self, tunnel_id: &str, listener_id: &str) -> bool {
        let mut entries = self.lock();
        let removed = match entries.get_mut(tunnel_id) {
            Some(listeners) => {
                let before = listeners.len();
                listeners.retain(|(id, _)| id != listener_id);
                let removed = listeners.len() != before;
                if listeners.is_empty() {
                    entries.remove(tunnel_id);
                }
                removed
            }
            None => false,
        };

        if !removed {
            debug!(
                "No {} listener {} registered for tunnel {}",
                self.kind, listener_id, tunnel_id
            );
        }
        removed
    }

    /// Invoke every listener of `tunnel_id` in registration order
    pub fn dispatch(&self, tunnel_id: &str, event: &E) {
        let snapshot: Vec<(String, Listener<E>)> = match self.lock().get(tunnel_id) {
            Some(listeners) => listeners.clone(),
            None => return,
        };

        for (listener_id, listener) in snapshot {
            match catch_unwind(AssertUnwindSafe(|| listener(tunnel_id, event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(
                    "{} listener {} for tunnel {} failed: {:#}",
                    self.kind, listener_id, tunnel_id, e
                ),
                Err(_) => warn!(
                    "{} listener {} for tunnel {} panicked",
                    self.kind, listener_id, tunnel_id
                ),
            }
        }
    }

    pub fn clear(&self, tunnel_id: &str) {
        self.lock().remove(tunnel_id);
    }

    fn clear_all(&self) {
        self.lock().clear();
    }

    pub fn count(&self, tunnel_id: &str) -> usize {
        self.lock().get(tunnel_id).map_or(0, Vec::len)
    }
}

/// The four listener registries of the manager
pub struct ListenerHub {
    pub stats: ListenerSet<TunnelStats>,
    pub errors: ListenerSet<ErrorEvent>,
    pub disconnects: ListenerSet<DisconnectEvent>,
    pub worker_errors: ListenerSet<WorkerErrorEvent>,
}

impl ListenerHub {
    pub fn new() -> Self {
        Self {
            stats: ListenerSet::new("stats"),
            errors: ListenerSet::new("error"),
            disconnects: ListenerSet::new("disconnect"),
            worker_errors: ListenerSet::new("worker-error"),
        }
    }

    /// Drop every registration of one tunnel
    pub fn clear_tunnel(&self, tunnel_id: &str) {
        self.stats.clear(tunnel_id);
        self.errors.clear(tunnel_id);
        self.disconnects.clear(tunnel_id);
        self.worker_errors.clear(tunnel_id);
    }

    pub fn clear_all(&self) {
        self.stats.clear_all();
        self.errors.clear_all();
        self.disconnects.clear_all();
        self.worker_errors.clear_all();
    }

    /// Total registrations of one tunnel across all kinds
    pub fn total(&self, tunnel_id: &str) -> usize {
        self.stats.count(tunnel_id)
            + self.errors.count(tunnel_id)
            + self.disconnects.count(tunnel_id)
            + self.worker_errors.count(tunnel_id)
    }
}

impl Default for ListenerHub {
    fn default() -> Self {
        Self::new()
    }
}
