// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 rtunnel Contributors

// rtunnel - CLI Client
// Command-line interface for tunnels managed by rtunnel-daemon

mod config;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use comfy_table::{Attribute, Cell, Color, ContentArrangement, Table};
use indicatif::{ProgressBar, ProgressStyle};
use reqwest::Client;

use rtunnel_common::daemon_client;
use rtunnel_common::{
    create_daemon_client, DaemonClientConfig, EventListener, Protocol, StartTunnelResult,
    TunnelConfig, TunnelConfigUpdate, TunnelEvent, TunnelStats, TunnelStatus, TunnelSummary,
};

#[derive(Parser)]
#[command(name = "rtunnel")]
#[command(about = "rtunnel CLI - expose local services through a tunnel broker", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create and start a tunnel
    Start {
        /// Base forwarding rule, remotePort:localDomain:localPort
        #[arg(short = 'R', long = "forwarding")]
        forwarding: String,

        /// Additional forwarding rule, [protocol//][remoteDomain:]remotePort:localDomain:localPort
        #[arg(short = 'A', long = "additional")]
        additional: Vec<String>,

        /// Configuration id (defaults to the name, then the base rule)
        #[arg(long)]
        config_id: Option<String>,

        /// Human-readable tunnel name
        #[arg(short, long)]
        name: Option<String>,

        /// Tunnel protocol: http, tcp, udp or tls
        #[arg(short = 't', long = "type", default_value = "http")]
        tunnel_type: Protocol,

        /// Broker access token
        #[arg(long)]
        token: Option<String>,

        /// Broker address (host:port)
        #[arg(long)]
        server: Option<String>,

        /// Serve this directory instead of a local service
        #[arg(long)]
        serve: Option<PathBuf>,

        /// Connect to the local service over TLS using this server name
        #[arg(long)]
        local_tls: Option<String>,

        /// Restart the tunnel when the broker session drops
        #[arg(long)]
        auto_reconnect: bool,

        /// Take over an existing session for the same token
        #[arg(long)]
        force: bool,

        /// Keep running and print the tunnel's events
        #[arg(short, long)]
        watch: bool,
    },

    /// Stop a tunnel
    Stop {
        /// Tunnel id or config id
        tunnel: String,
    },

    /// Restart a tunnel with its current configuration
    Restart {
        /// Tunnel id or config id
        tunnel: String,
    },

    /// Change the configuration of a tunnel
    Update {
        /// Config id of the tunnel
        config_id: String,

        #[arg(short, long)]
        name: Option<String>,

        #[arg(short = 'R', long = "forwarding")]
        forwarding: Option<String>,

        /// Replaces all additional forwarding rules
        #[arg(short = 'A', long = "additional")]
        additional: Option<Vec<String>>,

        #[arg(long)]
        token: Option<String>,

        #[arg(long)]
        server: Option<String>,

        #[arg(long)]
        auto_reconnect: Option<bool>,
    },

    /// List tunnels
    List {
        /// Output as JSON for scripting
        #[arg(short, long)]
        json: bool,
    },

    /// Show status, URLs and greeting of a tunnel
    Status {
        /// Tunnel id or config id
        tunnel: String,
    },

    /// Show usage statistics of a tunnel
    Stats {
        /// Tunnel id or config id
        tunnel: String,

        /// Print the engine's usage payload as JSON instead of the table
        #[arg(long)]
        raw: bool,
    },

    /// Stream events of a tunnel
    Watch {
        /// Tunnel id or config id
        tunnel: String,
    },

    /// Daemon management
    Daemon {
        #[command(subcommand)]
        action: DaemonCommands,
    },
}

#[derive(Subcommand)]
enum DaemonCommands {
    /// Check whether the daemon is reachable
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let cli = Cli::parse();
    let client = create_daemon_client()?;
    let daemon = config::CliConfig::load()?.daemon_config;

    match cli.command {
        Commands::Start {
            forwarding,
            additional,
            config_id,
            name,
            tunnel_type,
            token,
            server,
            serve,
            local_tls,
            auto_reconnect,
            force,
            watch,
        } => {
            let mut tunnel = TunnelConfig::new(
                config_id
                    .or_else(|| name.clone())
                    .unwrap_or_else(|| forwarding.clone()),
                forwarding,
            );
            tunnel.name = name;
            tunnel.tunnel_type = tunnel_type;
            tunnel.additional_forwarding = additional;
            tunnel.token = token;
            if let Some(server) = server {
                tunnel.server_address = server;
            }
            tunnel.serve = serve;
            tunnel.local_server_tls = local_tls;
            tunnel.auto_reconnect = auto_reconnect;
            tunnel.force = force;

            let result = start_tunnel(&client, &daemon, tunnel).await?;
            if watch {
                watch_events(&daemon, &result.tunnel_id).await?;
            }
        }
        Commands::Stop { tunnel } => {
            let summary = resolve_tunnel(&client, &daemon, &tunnel).await?;
            println!(
                "{}",
                format!("Stopping tunnel '{}' ({})", summary.config_id, summary.tunnel_id)
                    .yellow()
            );
            daemon_client::stop_tunnel(&client, &daemon, &summary.tunnel_id).await?;
            println!("{}", "✓ Tunnel stopped".green().bold());
        }
        Commands::Restart { tunnel } => {
            let summary = resolve_tunnel(&client, &daemon, &tunnel).await?;
            let spinner = spinner(format!("Restarting tunnel '{}'", summary.config_id));
            let result = daemon_client::restart_tunnel(&client, &daemon, &summary.tunnel_id).await;
            spinner.finish_and_clear();
            announce_started(&result?);
        }
        Commands::Update {
            config_id,
            name,
            forwarding,
            additional,
            token,
            server,
            auto_reconnect,
        } => {
            let update = TunnelConfigUpdate {
                name,
                forwarding,
                additional_forwarding: additional,
                token,
                server_address: server,
                auto_reconnect,
                ..TunnelConfigUpdate::new(config_id)
            };
            if update.is_empty() {
                anyhow::bail!(
                    "Nothing to update. Pass at least one option, see 'rtunnel update --help'"
                );
            }

            let spinner = spinner(format!("Updating tunnel '{}'", update.config_id));
            let summary = daemon_client::update_tunnel_config(&client, &daemon, &update).await;
            spinner.finish_and_clear();
            let summary = summary?;
            println!("{}", "✓ Configuration updated".green().bold());
            print_summary(&summary);
        }
        Commands::List { json } => {
            let tunnels = daemon_client::list_tunnels(&client, &daemon).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&tunnels)?);
            } else if tunnels.is_empty() {
                println!("{}", "No tunnels running.".yellow());
                println!("Start one with: {}", "rtunnel start -R 0:localhost:3000".cyan());
            } else {
                print_tunnels_table(&tunnels);
            }
        }
        Commands::Status { tunnel } => {
            let summary = resolve_tunnel(&client, &daemon, &tunnel).await?;
            print_summary(&summary);
            let greeting =
                daemon_client::get_greet_message(&client, &daemon, &summary.tunnel_id).await?;
            if !greeting.is_empty() {
                println!();
                for line in greeting {
                    println!("  {}", line.dimmed());
                }
            }
        }
        Commands::Stats { tunnel, raw: true } => {
            let summary = resolve_tunnel(&client, &daemon, &tunnel).await?;
            let usage = daemon_client::get_raw_usage(&client, &daemon, &summary.tunnel_id).await?;
            println!("{}", serde_json::to_string_pretty(&usage)?);
        }
        Commands::Stats { tunnel, raw: false } => {
            let summary = resolve_tunnel(&client, &daemon, &tunnel).await?;
            match daemon_client::get_tunnel_stats(&client, &daemon, &summary.tunnel_id).await? {
                Some(stats) => print_stats(&stats),
                None => println!("{}", "No usage reported yet.".dimmed()),
            }
        }
        Commands::Watch { tunnel } => {
            let summary = resolve_tunnel(&client, &daemon, &tunnel).await?;
            watch_events(&daemon, &summary.tunnel_id).await?;
        }
        Commands::Daemon {
            action: DaemonCommands::Status,
        } => {
            let url = daemon.daemon_base_url();
            if daemon_client::health_check(&client, &daemon).await? {
                println!("{} {}", "✓ Daemon is running at".green(), url.cyan());
                let tunnels = daemon_client::list_tunnels(&client, &daemon).await?;
                let live = tunnels.iter().filter(|t| t.status.is_live()).count();
                println!("  {} tunnel(s), {} live", tunnels.len(), live);
            } else {
                println!("{} {}", "✗ Daemon is not reachable at".red(), url);
                println!("  Start it with: {}", "rtunnel-daemon".cyan());
            }
        }
    }

    Ok(())
}

fn spinner(message: String) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    spinner.set_message(message);
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner
}

async fn start_tunnel(
    client: &Client,
    daemon: &DaemonClientConfig,
    tunnel: TunnelConfig,
) -> Result<StartTunnelResult> {
    let spinner = spinner(format!("Starting tunnel '{}'", tunnel.display_name()));
    let result = daemon_client::create_tunnel(client, daemon, tunnel).await;
    spinner.finish_and_clear();

    let result = result?;
    announce_started(&result);
    Ok(result)
}

fn announce_started(result: &StartTunnelResult) {
    println!(
        "{}",
        format!("✓ Tunnel {} is live", result.tunnel_id).green().bold()
    );
    for url in &result.urls {
        println!("  {}", url.cyan().underline());
    }

    for outcome in &result.forwarding {
        match &outcome.error {
            None => println!(
                "  {} {} → {}",
                "+".green(),
                outcome.hostname,
                outcome.target
            ),
            Some(error) => println!(
                "  {} {}: {}",
                "✗".red(),
                outcome.rule,
                error.red()
            ),
        }
    }
    for warning in &result.warnings {
        println!("  {} {}", "!".yellow(), warning.yellow());
    }
}

/// Find a tunnel by tunnel id, falling back to config id
async fn resolve_tunnel(
    client: &Client,
    daemon: &DaemonClientConfig,
    key: &str,
) -> Result<TunnelSummary> {
    let tunnels = daemon_client::list_tunnels(client, daemon).await?;
    find_tunnel(tunnels, key).with_context(|| format!("No tunnel with id or config id '{}'", key))
}

fn find_tunnel(tunnels: Vec<TunnelSummary>, key: &str) -> Option<TunnelSummary> {
    let by_config = tunnels.iter().position(|t| t.config_id == key);
    let by_id = tunnels.iter().position(|t| t.tunnel_id == key);
    by_id.or(by_config).map(|i| tunnels[i].clone())
}

fn colored_status(status: TunnelStatus) -> Cell {
    let color = match status {
        TunnelStatus::Live => Color::Green,
        TunnelStatus::Starting | TunnelStatus::Created => Color::Yellow,
        TunnelStatus::Stopped => Color::DarkGrey,
        TunnelStatus::Errored => Color::Red,
    };
    Cell::new(status.as_str()).fg(color)
}

fn print_tunnels_table(tunnels: &[TunnelSummary]) {
    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);

    table.set_header(
        ["Config", "Tunnel ID", "Status", "Forwarding", "URLs"]
            .into_iter()
            .map(|title| {
                Cell::new(title)
                    .add_attribute(Attribute::Bold)
                    .fg(Color::Cyan)
            }),
    );

    for tunnel in tunnels {
        let forwarding = std::iter::once(tunnel.config.forwarding.clone())
            .chain(tunnel.config.additional_forwarding.iter().cloned())
            .collect::<Vec<_>>()
            .join("\n");
        let urls = if tunnel.urls.is_empty() {
            "-".to_string()
        } else {
            tunnel.urls.join("\n")
        };

        table.add_row(vec![
            Cell::new(tunnel.config.display_name()).fg(Color::Green),
            Cell::new(&tunnel.tunnel_id).fg(Color::DarkGrey),
            colored_status(tunnel.status),
            Cell::new(forwarding),
            Cell::new(urls),
        ]);
    }

    println!();
    println!("{}", table);
    println!();
    println!("{} tunnel(s)", tunnels.len().to_string().cyan());
}

fn print_summary(summary: &TunnelSummary) {
    println!();
    println!(
        "{} {}",
        summary.config.display_name().bold(),
        format!("({})", summary.tunnel_id).dimmed()
    );
    println!("  Status:     {}", summary.status);
    println!("  Type:       {}", summary.config.tunnel_type);
    println!("  Server:     {}", summary.config.server_address);
    println!("  Forwarding: {}", summary.config.forwarding);
    for rule in &summary.config.additional_forwarding {
        println!("              {}", rule);
    }
    for url in &summary.urls {
        println!("  URL:        {}", url.cyan());
    }
    if summary.config.auto_reconnect {
        println!("  Reconnect:  every {}s", summary.config.reconnect_interval);
    }
    for warning in &summary.warnings {
        println!("  {} {}", "!".yellow(), warning.yellow());
    }
}

fn print_stats(stats: &TunnelStats) {
    let mut table = Table::new();
    table.set_header(vec![
        Cell::new("Metric").add_attribute(Attribute::Bold),
        Cell::new("Value").add_attribute(Attribute::Bold),
    ]);
    table.add_row(vec!["Elapsed".to_string(), format_elapsed(stats.elapsed_time)]);
    table.add_row(vec![
        "Live connections".to_string(),
        stats.num_live_connections.to_string(),
    ]);
    table.add_row(vec![
        "Total connections".to_string(),
        stats.num_total_connections.to_string(),
    ]);
    table.add_row(vec![
        "Request bytes".to_string(),
        format_bytes(stats.num_total_req_bytes),
    ]);
    table.add_row(vec![
        "Response bytes".to_string(),
        format_bytes(stats.num_total_res_bytes),
    ]);
    table.add_row(vec![
        "Transferred".to_string(),
        format_bytes(stats.num_total_tx_bytes),
    ]);
    println!("{}", table);
}

fn format_elapsed(secs: u64) -> String {
    format!("{:02}:{:02}:{:02}", secs / 3600, secs % 3600 / 60, secs % 60)
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

/// Print events of one tunnel until Ctrl+C or until the tunnel goes away
async fn watch_events(daemon: &DaemonClientConfig, tunnel_id: &str) -> Result<()> {
    println!(
        "{}",
        "Watching tunnel events. Press Ctrl+C to stop.".dimmed()
    );

    let mut events = EventListener::new(daemon.clone(), tunnel_id).listen();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => {
                let Some(event) = event else {
                    println!("{}", "Tunnel is gone, event stream closed.".yellow());
                    break;
                };
                print_event(&event);
            }
        }
    }

    Ok(())
}

fn print_event(event: &TunnelEvent) {
    match event {
        TunnelEvent::Stats { stats, .. } => println!(
            "{} live {} / total {} connections, {} transferred",
            "stats".cyan(),
            stats.num_live_connections,
            stats.num_total_connections,
            format_bytes(stats.num_total_tx_bytes)
        ),
        TunnelEvent::Error {
            error_no,
            message,
            recoverable,
            ..
        } => {
            let line = format!("error {}: {}", error_no, message);
            if *recoverable {
                println!("{}", line.yellow());
            } else {
                eprintln!("{}", line.red());
            }
        }
        TunnelEvent::Disconnected { error, messages, .. } => {
            println!("{}", format!("disconnected: {}", error).yellow().bold());
            for message in messages {
                println!("  {}", message.dimmed());
            }
        }
        TunnelEvent::WorkerError { error, .. } => {
            eprintln!("{}", format!("worker error: {}", error).red())
        }
        // Heartbeats only keep the connection alive
        TunnelEvent::Heartbeat { .. } => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(tunnel_id: &str, config_id: &str) -> TunnelSummary {
        TunnelSummary {
            tunnel_id: tunnel_id.to_string(),
            config_id: config_id.to_string(),
            tunnel_name: None,
            status: TunnelStatus::Live,
            urls: Vec::new(),
            warnings: Vec::new(),
            config: TunnelConfig::new(config_id, "0:localhost:3000"),
        }
    }

    #[test]
    fn test_find_tunnel_prefers_tunnel_id() {
        let tunnels = vec![summary("aaa", "bbb"), summary("bbb", "web")];
        assert_eq!(find_tunnel(tunnels.clone(), "bbb").unwrap().tunnel_id, "bbb");
        assert_eq!(find_tunnel(tunnels.clone(), "web").unwrap().tunnel_id, "bbb");
        assert!(find_tunnel(tunnels, "nope").is_none());
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KiB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MiB");
    }

    #[test]
    fn test_format_elapsed() {
        assert_eq!(format_elapsed(0), "00:00:00");
        assert_eq!(format_elapsed(3725), "01:02:05");
    }

    #[test]
    fn test_cli_parses_start() {
        let cli = Cli::try_parse_from([
            "rtunnel",
            "start",
            "-R",
            "0:localhost:3000",
            "-A",
            "db.example.com:5432:localhost:5432",
            "-A",
            "8080",
            "--type",
            "tcp",
            "--auto-reconnect",
        ])
        .unwrap();
        match cli.command {
            Commands::Start {
                additional,
                tunnel_type,
                auto_reconnect,
                watch,
                ..
            } => {
                assert_eq!(additional.len(), 2);
                assert_eq!(tunnel_type, Protocol::Tcp);
                assert!(auto_reconnect);
                assert!(!watch);
            }
            _ => panic!("expected start"),
        }
    }

    #[test]
    fn test_cli_parses_raw_stats() {
        let cli = Cli::try_parse_from(["rtunnel", "stats", "web", "--raw"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Stats { ref tunnel, raw: true } if tunnel == "web"
        ));
    }

    #[test]
    fn test_cli_rejects_unknown_type() {
        let parsed =
            Cli::try_parse_from(["rtunnel", "start", "-R", "0:localhost:3000", "--type", "ftp"]);
        assert!(parsed.is_err());
    }
}
