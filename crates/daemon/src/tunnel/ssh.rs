// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 rtunnel Contributors

// rtunnel - SSH tunnel engine
// Remote port forwarding against the broker using russh

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use russh::client::{self, Handle, Msg};
use russh::keys::ssh_key::HashAlg;
use russh::{Channel, ChannelMsg, Disconnect};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use serde_json::{json, Value};
use tokio::io::{copy_bidirectional, AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;
use tracing::{debug, error, info, warn};

use rtunnel_common::network::unwrap_brackets;
use rtunnel_common::{Protocol, TunnelConfig, TunnelStatus, DEFAULT_SERVER_ADDRESS};

use super::engine::{EngineEventHandler, TunnelEngine, TunnelInstance};

const DEFAULT_BROKER_PORT: u16 = 443;
const GREETING_WINDOW: Duration = Duration::from_secs(3);
const GREETING_IDLE: Duration = Duration::from_millis(500);

/// Error numbers reported through `on_error`
pub const ERR_LOCAL_DIAL: u32 = 1;
pub const ERR_LOCAL_TLS: u32 = 2;

/// Engine settings shared by every tunnel
#[derive(Debug, Clone)]
pub struct SshEngineConfig {
    pub connect_timeout: Duration,
    /// Accept any broker host key
    pub accept_host_keys: bool,
    /// SHA256 fingerprints accepted when `accept_host_keys` is off
    pub trusted_host_keys: Vec<String>,
    /// Replaces the built-in default broker for tunnels that did not pick one
    pub default_server: Option<String>,
    /// How often usage is sampled and the session checked
    pub usage_interval: Duration,
}

impl Default for SshEngineConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(15),
            accept_host_keys: true,
            trusted_host_keys: Vec::new(),
            default_server: None,
            usage_interval: Duration::from_secs(1),
        }
    }
}

/// Engine that talks to the broker over SSH
pub struct SshEngine {
    config: SshEngineConfig,
}

impl SshEngine {
    pub fn new(config: SshEngineConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl TunnelEngine for SshEngine {
    async fn create(&self, config: &TunnelConfig) -> Result<Arc<dyn TunnelInstance>> {
        let server = match &self.config.default_server {
            Some(default) if config.server_address == DEFAULT_SERVER_ADDRESS => default.clone(),
            _ => config.server_address.clone(),
        };
        let (broker_host, broker_port) = broker_address(&server)?;
        let base = config.base_forwarding()?;

        let local_tls = match &config.local_server_tls {
            Some(sni) => Some(local_tls_connector(sni)?),
            None => None,
        };

        let shared = Arc::new(Shared {
            config_id: config.config_id.clone(),
            base_target: base.target(),
            local_tls,
            routes: RwLock::new(Vec::new()),
            status: RwLock::new(TunnelStatus::Created),
            urls: RwLock::new(Vec::new()),
            greeting: RwLock::new(Vec::new()),
            handler: RwLock::new(None),
            counters: Counters::default(),
        });

        Ok(Arc::new(SshTunnel {
            config: config.clone(),
            engine: self.config.clone(),
            broker_host,
            broker_port,
            remote_port: base.remote_port,
            shared,
            session: Arc::new(tokio::sync::Mutex::new(None)),
            monitor: Mutex::new(None),
        }))
    }
}

/// Where a forwarded connection goes
#[derive(Debug, Clone, PartialEq, Eq)]
struct Route {
    address: String,
    port: u32,
    target: String,
}

/// Pick the local target for a connection the broker forwarded to `address:port`
fn route_for<'a>(routes: &'a [Route], address: &str, port: u32) -> Option<&'a str> {
    routes
        .iter()
        .find(|r| r.address == address && r.port == port)
        .or_else(|| {
            routes
                .iter()
                .find(|r| !r.address.is_empty() && r.address == address)
        })
        .or_else(|| routes.iter().find(|r| r.port != 0 && r.port == port))
        .map(|r| r.target.as_str())
}

#[derive(Default)]
struct Counters {
    started_at: Mutex<Option<Instant>>,
    live: AtomicU64,
    total: AtomicU64,
    req_bytes: AtomicU64,
    res_bytes: AtomicU64,
}

impl Counters {
    fn reset(&self) {
        *self.started_at.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
        for counter in [&self.live, &self.total, &self.req_bytes, &self.res_bytes] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    fn opened(&self) {
        self.live.fetch_add(1, Ordering::Relaxed);
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    fn closed(&self, req_bytes: u64, res_bytes: u64) {
        self.live.fetch_sub(1, Ordering::Relaxed);
        self.req_bytes.fetch_add(req_bytes, Ordering::Relaxed);
        self.res_bytes.fetch_add(res_bytes, Ordering::Relaxed);
    }

    /// Usage in the broker's wire shape
    fn usage(&self) -> Value {
        let elapsed = self
            .started_at
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .map(|started| started.elapsed().as_secs())
            .unwrap_or(0);
        let req = self.req_bytes.load(Ordering::Relaxed);
        let res = self.res_bytes.load(Ordering::Relaxed);
        json!({
            "elapsedTime": elapsed,
            "numLiveConnections": self.live.load(Ordering::Relaxed),
            "numTotalConnections": self.total.load(Ordering::Relaxed),
            "numTotalReqBytes": req,
            "numTotalResBytes": res,
            "numTotalTxBytes": req + res,
        })
    }
}

/// State reachable from both the instance and the russh handler
struct Shared {
    config_id: String,
    base_target: String,
    local_tls: Option<(TlsConnector, ServerName<'static>)>,
    routes: RwLock<Vec<Route>>,
    status: RwLock<TunnelStatus>,
    urls: RwLock<Vec<String>>,
    greeting: RwLock<Vec<String>>,
    handler: RwLock<Option<Arc<dyn EngineEventHandler>>>,
    counters: Counters,
}

impl Shared {
    fn status(&self) -> TunnelStatus {
        *self.status.read().unwrap_or_else(|e| e.into_inner())
    }

    fn set_status(&self, status: TunnelStatus) {
        *self.status.write().unwrap_or_else(|e| e.into_inner()) = status;
    }

    fn handler(&self) -> Option<Arc<dyn EngineEventHandler>> {
        self.handler.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn add_route(&self, route: Route) {
        self.routes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(route);
    }

    fn target_for(&self, address: &str, port: u32) -> String {
        let routes = self.routes.read().unwrap_or_else(|e| e.into_inner());
        route_for(&routes, address, port)
            .unwrap_or(&self.base_target)
            .to_string()
    }

    fn emit_usage(&self) {
        if let Some(handler) = self.handler() {
            handler.on_usage(self.counters.usage());
        }
    }

    fn emit_error(&self, error_no: u32, message: &str) {
        debug!("Tunnel {}: {}", self.config_id, message);
        if let Some(handler) = self.handler() {
            handler.on_error(error_no, message, true);
        }
    }

    fn session_lost(&self, reason: &str) {
        self.set_status(TunnelStatus::Errored);
        let messages = self
            .greeting
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(handler) = self.handler() {
            handler.on_disconnected(reason, &messages);
        }
    }

    fn worker_failed(&self, error: &str) {
        if let Some(handler) = self.handler() {
            handler.on_worker_error(error);
        }
    }
}

type BrokerSession = Arc<tokio::sync::Mutex<Option<Handle<BrokerHandler>>>>;

/// One broker session
struct SshTunnel {
    config: TunnelConfig,
    engine: SshEngineConfig,
    broker_host: String,
    broker_port: u16,
    remote_port: u16,
    shared: Arc<Shared>,
    session: BrokerSession,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl SshTunnel {
    async fn connect(&self) -> Result<Handle<BrokerHandler>> {
        let mut cfg = client::Config::default();
        cfg.nodelay = true;
        cfg.keepalive_interval = Some(Duration::from_secs(30));
        cfg.keepalive_max = 3;
        let cfg = Arc::new(cfg);

        let handler = BrokerHandler {
            shared: self.shared.clone(),
            accept_host_keys: self.engine.accept_host_keys,
            trusted_host_keys: self.engine.trusted_host_keys.clone(),
        };

        let addr = (self.broker_host.as_str(), self.broker_port);
        info!(
            "Tunnel {}: connecting to broker {}:{}",
            self.config.config_id, self.broker_host, self.broker_port
        );
        let mut session = tokio::time::timeout(
            self.engine.connect_timeout,
            client::connect(cfg, addr, handler),
        )
        .await
        .map_err(|_| {
            anyhow!(
                "connection to {}:{} timed out after {:?}",
                self.broker_host,
                self.broker_port,
                self.engine.connect_timeout
            )
        })?
        .with_context(|| format!("failed to connect to {}:{}", self.broker_host, self.broker_port))?;

        let user = broker_username(&self.config);
        let auth = match &self.config.token {
            Some(token) => session.authenticate_password(user, token.clone()).await,
            None => session.authenticate_none(user).await,
        }
        .context("authentication with the broker failed")?;
        if !auth.success() {
            bail!("broker rejected the credentials");
        }

        Ok(session)
    }

    /// Open the console channel and read the broker greeting
    async fn open_console(&self, session: &Handle<BrokerHandler>) -> Result<Channel<Msg>> {
        let mut console = session
            .channel_open_session()
            .await
            .context("failed to open broker console")?;
        let command = advanced_options_command(&self.config);
        if command.is_empty() {
            console.request_shell(true).await?;
        } else {
            debug!("Tunnel {}: console command {}", self.config.config_id, command);
            console.exec(true, command).await?;
        }

        let lines = read_greeting(&mut console).await;
        let (mut urls, greeting) = split_console_lines(lines);
        if urls.is_empty() {
            urls.push(fallback_url(
                self.config.tunnel_type,
                &self.broker_host,
                self.remote_port,
            ));
        }
        *self.shared.urls.write().unwrap_or_else(|e| e.into_inner()) = urls;
        *self.shared.greeting.write().unwrap_or_else(|e| e.into_inner()) = greeting;

        Ok(console)
    }

    async fn establish(&self) -> Result<Channel<Msg>> {
        let mut session = self.connect().await?;

        session
            .tcpip_forward("0.0.0.0", u32::from(self.remote_port))
            .await
            .context("broker refused the base forwarding")?;
        self.shared.add_route(Route {
            address: String::new(),
            port: u32::from(self.remote_port),
            target: self.shared.base_target.clone(),
        });

        let console = self.open_console(&session).await?;
        *self.session.lock().await = Some(session);
        Ok(console)
    }

    async fn close_session(&self) -> Result<()> {
        let Some(session) = self.session.lock().await.take() else {
            return Ok(());
        };
        if session.is_closed() {
            return Ok(());
        }
        session
            .disconnect(Disconnect::ByApplication, "tunnel stopped", "en")
            .await
            .context("failed to close the broker session")
    }

    fn abort_monitor(&self) {
        let task = self.monitor.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            task.abort();
        }
    }
}

#[async_trait]
impl TunnelInstance for SshTunnel {
    async fn start(&self) -> Result<Vec<String>> {
        self.abort_monitor();
        if let Err(e) = self.close_session().await {
            debug!("Tunnel {}: dropping previous session: {:#}", self.config.config_id, e);
        }

        self.shared.set_status(TunnelStatus::Starting);
        self.shared
            .routes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.shared.counters.reset();

        let console = match self.establish().await {
            Ok(console) => console,
            Err(e) => {
                self.shared.set_status(TunnelStatus::Errored);
                if let Err(close_err) = self.close_session().await {
                    debug!("Tunnel {}: {:#}", self.config.config_id, close_err);
                }
                return Err(e);
            }
        };

        self.shared.set_status(TunnelStatus::Live);
        let task = tokio::spawn(monitor(
            self.shared.clone(),
            self.session.clone(),
            console,
            self.engine.usage_interval,
        ));
        *self.monitor.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);

        Ok(self.urls())
    }

    async fn stop(&self) -> Result<()> {
        self.shared.set_status(TunnelStatus::Stopped);
        self.abort_monitor();
        self.close_session().await
    }

    fn status(&self) -> TunnelStatus {
        self.shared.status()
    }

    fn config(&self) -> TunnelConfig {
        self.config.clone()
    }

    fn latest_usage(&self) -> Value {
        self.shared.counters.usage()
    }

    fn greet_message(&self) -> Vec<String> {
        self.shared
            .greeting
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn local_server_tls(&self) -> Option<String> {
        self.config.local_server_tls.clone()
    }

    fn urls(&self) -> Vec<String> {
        if !self.shared.status().is_live() {
            return Vec::new();
        }
        self.shared
            .urls
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    async fn request_additional_forwarding(&self, hostname_or_port: &str, target: &str) -> Result<()> {
        let (address, port) = split_hostname(hostname_or_port)?;

        let mut guard = self.session.lock().await;
        let session = guard
            .as_mut()
            .ok_or_else(|| anyhow!("tunnel {} is not connected", self.config.config_id))?;
        session
            .tcpip_forward(address.clone(), port)
            .await
            .with_context(|| format!("broker refused forwarding {}", hostname_or_port))?;
        drop(guard);

        self.shared.add_route(Route {
            address,
            port,
            target: target.to_string(),
        });
        Ok(())
    }

    fn set_event_handler(&self, handler: Arc<dyn EngineEventHandler>) {
        *self.shared.handler.write().unwrap_or_else(|e| e.into_inner()) = Some(handler);
    }
}

/// Watch the session, publish usage and follow the broker console
async fn monitor(
    shared: Arc<Shared>,
    session: BrokerSession,
    console: Channel<Msg>,
    interval: Duration,
) {
    let mut console = Some(console);
    let mut ticker = tokio::time::interval(interval);
    let mut last_usage = Value::Null;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let closed = match session.lock().await.as_ref() {
                    Some(handle) => handle.is_closed(),
                    None => return,
                };
                if closed {
                    warn!("Tunnel {}: broker session closed", shared.config_id);
                    shared.session_lost("broker session closed");
                    return;
                }

                let usage = shared.counters.usage();
                if usage != last_usage {
                    last_usage = usage;
                    shared.emit_usage();
                }
            }
            message = next_console_lines(&mut console) => match message {
                Some(lines) => {
                    if !lines.is_empty() {
                        shared
                            .greeting
                            .write()
                            .unwrap_or_else(|e| e.into_inner())
                            .extend(lines);
                    }
                }
                None => {
                    console = None;
                    if shared.status().is_live() {
                        error!("Tunnel {}: broker console closed", shared.config_id);
                        shared.worker_failed("broker console closed");
                    }
                }
            }
        }
    }
}

async fn next_console_lines(console: &mut Option<Channel<Msg>>) -> Option<Vec<String>> {
    let Some(channel) = console.as_mut() else {
        return std::future::pending().await;
    };
    match channel.wait().await {
        Some(ChannelMsg::Data { data }) | Some(ChannelMsg::ExtendedData { data, .. }) => {
            Some(text_lines(&data))
        }
        Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => None,
        Some(_) => Some(Vec::new()),
    }
}

async fn read_greeting(console: &mut Channel<Msg>) -> Vec<String> {
    let deadline = Instant::now() + GREETING_WINDOW;
    let mut lines = Vec::new();

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let wait = if lines.is_empty() {
            remaining
        } else {
            remaining.min(GREETING_IDLE)
        };
        match tokio::time::timeout(wait, console.wait()).await {
            Ok(Some(ChannelMsg::Data { data })) | Ok(Some(ChannelMsg::ExtendedData { data, .. })) => {
                lines.extend(text_lines(&data));
            }
            Ok(Some(ChannelMsg::Eof)) | Ok(Some(ChannelMsg::Close)) | Ok(None) | Err(_) => break,
            Ok(Some(_)) => {}
        }
    }
    lines
}

fn text_lines(data: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(data)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(String::from)
        .collect()
}

/// Separate public URLs from the rest of the broker greeting
fn split_console_lines(lines: Vec<String>) -> (Vec<String>, Vec<String>) {
    const SCHEMES: [&str; 5] = ["http://", "https://", "tcp://", "udp://", "tls://"];
    lines
        .into_iter()
        .partition(|line| SCHEMES.iter().any(|scheme| line.starts_with(scheme)))
}

fn fallback_url(protocol: Protocol, broker_host: &str, remote_port: u16) -> String {
    if remote_port == 0 {
        format!("{}://{}", protocol, broker_host)
    } else {
        format!("{}://{}:{}", protocol, broker_host, remote_port)
    }
}

/// `host[:port]` of the broker, port 443 when omitted
fn broker_address(server: &str) -> Result<(String, u16)> {
    let server = server.trim();
    let (host, port) = match server.rsplit_once(':') {
        // A bare IPv6 literal has colons but no port
        Some((host, port)) if !host.ends_with(':') && (!host.contains(':') || host.ends_with(']')) => {
            let port = port
                .parse::<u16>()
                .map_err(|_| anyhow!("invalid broker port in '{}'", server))?;
            (host, port)
        }
        _ => (server, DEFAULT_BROKER_PORT),
    };

    let host = unwrap_brackets(host);
    if host.is_empty() {
        bail!("broker address '{}' has no host", server);
    }
    Ok((host.to_string(), port))
}

/// Username carrying the tunnel options: `[token+]protocol[+force]`
fn broker_username(config: &TunnelConfig) -> String {
    let mut parts = Vec::with_capacity(3);
    if let Some(token) = config.token.as_deref().filter(|t| !t.is_empty()) {
        parts.push(token.to_string());
    }
    parts.push(config.tunnel_type.to_string());
    if config.force {
        parts.push("force".to_string());
    }
    parts.join("+")
}

/// Console command carrying the access and header options
fn advanced_options_command(config: &TunnelConfig) -> String {
    let mut args = Vec::new();

    if !config.ip_whitelist.is_empty() {
        args.push(format!("w:{}", config.ip_whitelist.join(",")));
    }
    for auth in &config.basic_auth {
        args.push(format!("b:{}:{}", auth.username, auth.password));
    }
    for token in &config.bearer_token_auth {
        args.push(format!("k:{}", token));
    }
    args.extend(config.header_modification.iter().cloned());
    for (enabled, flag) in [
        (config.x_forwarded_for, "x:xff"),
        (config.https_only, "x:https"),
        (config.original_request_url, "x:fullurl"),
        (config.allow_preflight, "x:passpreflight"),
    ] {
        if enabled {
            args.push(flag.to_string());
        }
    }

    args.iter()
        .map(|arg| quote_arg(arg))
        .collect::<Vec<_>>()
        .join(" ")
}

fn quote_arg(arg: &str) -> String {
    if arg.chars().any(|c| c.is_whitespace() || c == '"' || c == '\\') {
        format!("\"{}\"", arg.replace('\\', "\\\\").replace('"', "\\\""))
    } else {
        arg.to_string()
    }
}

/// `domain:port` or a bare port, as submitted for additional forwarding
fn split_hostname(hostname_or_port: &str) -> Result<(String, u32)> {
    let (address, port) = match hostname_or_port.rsplit_once(':') {
        Some((domain, port)) => (domain.to_string(), port),
        None => (String::new(), hostname_or_port),
    };
    let port = port
        .parse::<u16>()
        .map_err(|_| anyhow!("invalid forwarding port in '{}'", hostname_or_port))?;
    Ok((address, u32::from(port)))
}

fn local_tls_connector(sni: &str) -> Result<(TlsConnector, ServerName<'static>)> {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    let server_name = ServerName::try_from(sni.to_string())
        .map_err(|e| anyhow!("invalid local TLS server name '{}': {}", sni, e))?;
    Ok((TlsConnector::from(Arc::new(config)), server_name))
}

/// russh callbacks for one broker session
struct BrokerHandler {
    shared: Arc<Shared>,
    accept_host_keys: bool,
    trusted_host_keys: Vec<String>,
}

impl client::Handler for BrokerHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh::keys::ssh_key::PublicKey,
    ) -> Result<bool, Self::Error> {
        let fingerprint = server_public_key.fingerprint(HashAlg::Sha256).to_string();
        if self.accept_host_keys {
            debug!("Accepting broker host key {}", fingerprint);
            return Ok(true);
        }
        if self.trusted_host_keys.iter().any(|k| k == &fingerprint) {
            return Ok(true);
        }
        warn!(
            "Tunnel {}: untrusted broker host key {}",
            self.shared.config_id, fingerprint
        );
        Ok(false)
    }

    fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> impl std::future::Future<Output = Result<(), Self::Error>> + Send {
        let shared = self.shared.clone();
        let target = shared.target_for(connected_address, connected_port);
        debug!(
            "Tunnel {}: connection from {}:{} -> {}",
            shared.config_id, originator_address, originator_port, target
        );
        async move {
            // The copy loop must not run on the session task
            tokio::spawn(proxy_connection(shared, channel, target));
            Ok(())
        }
    }
}

async fn proxy_connection(shared: Arc<Shared>, channel: Channel<Msg>, target: String) {
    shared.counters.opened();

    let stream = match TcpStream::connect(&target).await {
        Ok(stream) => stream,
        Err(e) => {
            shared.emit_error(
                ERR_LOCAL_DIAL,
                &format!("failed to connect to local server {}: {}", target, e),
            );
            let _ = channel.close().await;
            shared.counters.closed(0, 0);
            return;
        }
    };

    let result = match &shared.local_tls {
        Some((connector, server_name)) => {
            match connector.connect(server_name.clone(), stream).await {
                Ok(tls) => pipe(channel, tls).await,
                Err(e) => {
                    shared.emit_error(
                        ERR_LOCAL_TLS,
                        &format!("TLS handshake with local server {} failed: {}", target, e),
                    );
                    let _ = channel.close().await;
                    shared.counters.closed(0, 0);
                    return;
                }
            }
        }
        None => pipe(channel, stream).await,
    };

    match result {
        Ok((req_bytes, res_bytes)) => shared.counters.closed(req_bytes, res_bytes),
        Err(e) => {
            debug!("Tunnel {}: forwarded connection ended: {}", shared.config_id, e);
            shared.counters.closed(0, 0);
        }
    }
}

/// Copy until either side closes; returns (broker -> local, local -> broker) byte counts
async fn pipe<S>(channel: Channel<Msg>, mut local: S) -> std::io::Result<(u64, u64)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut remote = channel.into_stream();
    let result = copy_bidirectional(&mut remote, &mut local).await;
    let _ = remote.shutdown().await;
    result
}
