//! Locator Node - standalone location registry node over TCP.
//!
//! Joins a cluster through the given peers, optionally registers some
//! endpoints on behalf of local services, and withdraws them on Ctrl-C.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use locator_core::{
    ComponentId, ComponentType, Connection, Location, LocationService, NodeId, TcpTransport,
    TcpTransportConfig,
};
use std::net::SocketAddr;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "locator-node")]
#[command(about = "Distributed location registry node")]
struct Args {
    /// Port to listen on for peers (0 = auto-assign)
    #[arg(short, long, default_value = "0")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Peer address to join through (repeatable)
    #[arg(long = "peer", value_name = "ADDR")]
    peers: Vec<SocketAddr>,

    /// Node id (random by default)
    #[arg(long)]
    node_id: Option<String>,

    /// Register an HTTP service as name=port/path (repeatable)
    #[arg(long = "http", value_name = "NAME=PORT/PATH", value_parser = parse_http)]
    http: Vec<HttpArg>,

    /// Register a TCP service as name=port (repeatable)
    #[arg(long = "tcp", value_name = "NAME=PORT", value_parser = parse_tcp)]
    tcp: Vec<TcpArg>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Debug, Clone)]
struct HttpArg {
    name: String,
    port: u16,
    path: String,
}

#[derive(Debug, Clone)]
struct TcpArg {
    name: String,
    port: u16,
}

fn split_name(raw: &str) -> std::result::Result<(&str, &str), String> {
    match raw.split_once('=') {
        Some((name, rest)) if !name.is_empty() => Ok((name, rest)),
        _ => Err(format!("expected NAME=..., got '{}'", raw)),
    }
}

fn parse_port(raw: &str) -> std::result::Result<u16, String> {
    raw.parse()
        .map_err(|_| format!("invalid port '{}'", raw))
}

fn parse_http(raw: &str) -> std::result::Result<HttpArg, String> {
    let (name, rest) = split_name(raw)?;
    let (port, path) = match rest.split_once('/') {
        Some((port, path)) => (port, format!("/{}", path)),
        None => (rest, "/".to_string()),
    };
    Ok(HttpArg {
        name: name.to_string(),
        port: parse_port(port)?,
        path,
    })
}

fn parse_tcp(raw: &str) -> std::result::Result<TcpArg, String> {
    let (name, port) = split_name(raw)?;
    Ok(TcpArg {
        name: name.to_string(),
        port: parse_port(port)?,
    })
}

fn locations(args: &Args) -> Result<Vec<Location>> {
    let mut locations = Vec::new();
    for http in &args.http {
        let id = ComponentId::new(http.name.clone(), ComponentType::Service)?;
        locations.push(Location::http(
            Connection::http(id),
            args.host.clone(),
            http.port,
            http.path.clone(),
        )?);
    }
    for tcp in &args.tcp {
        let id = ComponentId::new(tcp.name.clone(), ComponentType::Service)?;
        locations.push(Location::tcp(Connection::tcp(id), args.host.clone(), tcp.port)?);
    }
    Ok(locations)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    info!("Starting Locator node");

    let bind: SocketAddr = format!("{}:{}", args.host, args.port)
        .parse()
        .with_context(|| format!("invalid bind address {}:{}", args.host, args.port))?;

    let mut config = TcpTransportConfig::new(bind).advertise_host(args.host.clone());
    if let Some(node_id) = &args.node_id {
        config = config.node_id(NodeId::new(node_id.clone()));
    }
    for peer in &args.peers {
        config = config.seed(*peer);
    }

    let transport = TcpTransport::start(config).await?;
    for peer in &args.peers {
        match transport.ping(*peer).await {
            Ok(rtt) => info!("Peer {} answered in {:?}", peer, rtt),
            Err(e) => warn!("Peer {} not answering yet: {}", peer, e),
        }
    }
    let service = LocationService::new(transport.clone()).await?;

    for location in locations(&args)? {
        service
            .register(location.clone())
            .await
            .map_err(|e| anyhow!("failed to register {}: {}", location, e))?;
        info!("Registered {}", location);
    }

    // Print port for supervising processes to read (intentional stdout)
    println!("LOCATOR_PORT={}", transport.local_addr().port());

    info!(
        "Node {} listening on {}",
        service.node_id(),
        transport.local_addr()
    );

    let mut health = service.watch_health();
    let health_task = tokio::spawn(async move {
        while health.changed().await.is_ok() {
            let report = health.borrow_and_update().clone();
            match report.last_error {
                Some(err) if report.status != locator_core::HealthStatus::Healthy => {
                    warn!(
                        "Replication {:?} ({} peers): {}",
                        report.status, report.known_members, err
                    );
                }
                _ => info!(
                    "Replication {:?} ({} peers)",
                    report.status, report.known_members
                ),
            }
        }
    });

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, withdrawing registrations");

    let withdrawn = service.shutdown().await;
    health_task.abort();
    transport.shutdown();
    info!("Withdrew {} registrations, exiting", withdrawn);

    Ok(())
}
