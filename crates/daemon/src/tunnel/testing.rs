// In-memory engine used by the manager and API tests

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::Value;

use rtunnel_common::{TunnelConfig, TunnelStatus};

use super::engine::{EngineEventHandler, TunnelEngine, TunnelInstance};

/// Scriptable engine: failures are keyed by the base forwarding rule
#[derive(Default)]
pub struct FakeEngine {
    instances: Mutex<Vec<Arc<FakeInstance>>>,
    failing_starts: Mutex<HashSet<String>>,
    failing_stops: Mutex<HashSet<String>>,
    rejected_hostnames: Mutex<HashSet<String>>,
    pending_create_failures: AtomicUsize,
    create_delay: Mutex<Option<Duration>>,
}

impl FakeEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Instances built from this forwarding rule fail to start
    pub fn fail_start_for(&self, forwarding: &str) {
        self.failing_starts
            .lock()
            .unwrap()
            .insert(forwarding.to_string());
    }

    pub fn allow_start_for(&self, forwarding: &str) {
        self.failing_starts.lock().unwrap().remove(forwarding);
    }

    pub fn fail_stop_for(&self, forwarding: &str) {
        self.failing_stops
            .lock()
            .unwrap()
            .insert(forwarding.to_string());
    }

    pub fn reject_hostname(&self, hostname: &str) {
        self.rejected_hostnames
            .lock()
            .unwrap()
            .insert(hostname.to_string());
    }

    pub fn fail_next_creates(&self, count: usize) {
        self.pending_create_failures.store(count, Ordering::SeqCst);
    }

    /// Every later `create` sleeps this long before building the instance
    pub fn delay_creates(&self, delay: Duration) {
        *self.create_delay.lock().unwrap() = Some(delay);
    }

    pub fn instances(&self) -> Vec<Arc<FakeInstance>> {
        self.instances.lock().unwrap().clone()
    }

    /// Most recently created instance
    pub fn last(&self) -> Arc<FakeInstance> {
        self.instances
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no instance created yet")
    }
}

#[async_trait]
impl TunnelEngine for FakeEngine {
    async fn create(&self, config: &TunnelConfig) -> Result<Arc<dyn TunnelInstance>> {
        let pending = self.pending_create_failures.load(Ordering::SeqCst);
        if pending > 0 {
            self.pending_create_failures
                .store(pending - 1, Ordering::SeqCst);
            bail!("engine refused to create {}", config.config_id);
        }
        let delay = *self.create_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let instance = Arc::new(FakeInstance {
            config: config.clone(),
            status: Mutex::new(TunnelStatus::Created),
            handler: Mutex::new(None),
            forwarded: Mutex::new(Vec::new()),
            fail_start: self
                .failing_starts
                .lock()
                .unwrap()
                .contains(&config.forwarding),
            fail_stop: self
                .failing_stops
                .lock()
                .unwrap()
                .contains(&config.forwarding),
            rejected_hostnames: self.rejected_hostnames.lock().unwrap().clone(),
            stop_calls: AtomicUsize::new(0),
            stop_delay: Mutex::new(None),
            latest_usage: Mutex::new(Value::Null),
        });
        self.instances.lock().unwrap().push(instance.clone());
        Ok(instance)
    }
}

pub struct FakeInstance {
    config: TunnelConfig,
    status: Mutex<TunnelStatus>,
    handler: Mutex<Option<Arc<dyn EngineEventHandler>>>,
    forwarded: Mutex<Vec<(String, String)>>,
    fail_start: bool,
    fail_stop: bool,
    rejected_hostnames: HashSet<String>,
    stop_calls: AtomicUsize,
    stop_delay: Mutex<Option<Duration>>,
    latest_usage: Mutex<Value>,
}

impl FakeInstance {
    fn handler(&self) -> Arc<dyn EngineEventHandler> {
        self.handler
            .lock()
            .unwrap()
            .clone()
            .expect("event handler not installed")
    }

    pub fn fire_usage(&self, raw: Value) {
        *self.latest_usage.lock().unwrap() = raw.clone();
        self.handler().on_usage(raw);
    }

    pub fn fire_error(&self, error_no: u32, message: &str, recoverable: bool) {
        self.handler().on_error(error_no, message, recoverable);
    }

    pub fn fire_disconnected(&self, error: &str) {
        *self.status.lock().unwrap() = TunnelStatus::Errored;
        self.handler()
            .on_disconnected(error, &["session closed by broker".to_string()]);
    }

    pub fn fire_worker_error(&self, error: &str) {
        self.handler().on_worker_error(error);
    }

    pub fn set_status(&self, status: TunnelStatus) {
        *self.status.lock().unwrap() = status;
    }

    pub fn has_handler(&self) -> bool {
        self.handler.lock().unwrap().is_some()
    }

    pub fn forwarded(&self) -> Vec<(String, String)> {
        self.forwarded.lock().unwrap().clone()
    }

    /// `stop` sleeps this long before the session goes down
    pub fn delay_stop(&self, delay: Duration) {
        *self.stop_delay.lock().unwrap() = Some(delay);
    }

    pub fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TunnelInstance for FakeInstance {
    async fn start(&self) -> Result<Vec<String>> {
        if self.fail_start {
            *self.status.lock().unwrap() = TunnelStatus::Errored;
            bail!("broker rejected {}", self.config.forwarding);
        }
        *self.status.lock().unwrap() = TunnelStatus::Live;
        Ok(self.urls())
    }

    async fn stop(&self) -> Result<()> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.stop_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        *self.status.lock().unwrap() = TunnelStatus::Stopped;
        if self.fail_stop {
            bail!("session did not close cleanly");
        }
        Ok(())
    }

    fn status(&self) -> TunnelStatus {
        *self.status.lock().unwrap()
    }

    fn config(&self) -> TunnelConfig {
        self.config.clone()
    }

    fn latest_usage(&self) -> Value {
        self.latest_usage.lock().unwrap().clone()
    }

    fn greet_message(&self) -> Vec<String> {
        vec![format!("Welcome, {}", self.config.config_id)]
    }

    fn local_server_tls(&self) -> Option<String> {
        self.config.local_server_tls.clone()
    }

    fn urls(&self) -> Vec<String> {
        if self.status().is_live() {
            vec![format!("https://{}.fake.test", self.config.config_id)]
        } else {
            Vec::new()
        }
    }

    async fn request_additional_forwarding(&self, hostname_or_port: &str, target: &str) -> Result<()> {
        if self.rejected_hostnames.contains(hostname_or_port) {
            bail!("forwarding {} refused", hostname_or_port);
        }
        self.forwarded
            .lock()
            .unwrap()
            .push((hostname_or_port.to_string(), target.to_string()));
        Ok(())
    }

    fn set_event_handler(&self, handler: Arc<dyn EngineEventHandler>) {
        *self.handler.lock().unwrap() = Some(handler);
    }
}
