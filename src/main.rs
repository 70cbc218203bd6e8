//! PeerLock - Distributed Mutual Exclusion with Coordinator Election
//!
//! Runs a node with an operator console, serves the peer directory, and
//! inspects running nodes.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use peerlock::config::{LoggingConfig, PeerLockConfig};
use peerlock::directory::{InMemoryDirectory, PeerDirectory, RemoteDirectory};
use peerlock::mutex::{Grant, NodeState};
use peerlock::network::{NetworkClient, NetworkServer, Transport};
use peerlock::node::{Node, NodeSettings};
use peerlock::protocol::Message;

/// PeerLock - Distributed Mutual Exclusion with Coordinator Election
#[derive(Parser)]
#[command(name = "peerlock")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "peerlock.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a node with an interactive console
    Start,

    /// Serve an in-memory peer directory
    Directory {
        /// Address to listen on
        #[arg(short, long, default_value = "127.0.0.1:7600")]
        listen: String,
    },

    /// Query the status of a running node
    Status {
        /// Node address to query
        #[arg(short, long, default_value = "127.0.0.1:7701")]
        address: String,
    },

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "peerlock.toml")]
        output: PathBuf,

        /// Node ID
        #[arg(long, default_value = "ricart.PeerA")]
        node_id: String,
    },

    /// Validate configuration file
    Validate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // The node's own logging section applies only when starting one
    let logging = match cli.command {
        Commands::Start => PeerLockConfig::from_file(&cli.config)
            .map(|c| c.logging)
            .unwrap_or_default(),
        _ => LoggingConfig::default(),
    };
    let level = cli.log_level.as_deref().unwrap_or(&logging.level);
    init_logging(level, &logging.format);

    match cli.command {
        Commands::Start => run_start(cli.config).await,
        Commands::Directory { listen } => run_directory(listen).await,
        Commands::Status { address } => run_status(address).await,
        Commands::Init { output, node_id } => run_init(output, node_id),
        Commands::Validate => run_validate(cli.config),
    }
}

/// Initialize logging
fn init_logging(level: &str, format: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Start a node and hand the terminal to the operator console
async fn run_start(config_path: PathBuf) -> anyhow::Result<()> {
    let config = match PeerLockConfig::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load configuration from {:?}: {}", config_path, e);
            tracing::error!("Run `peerlock init` to generate a starting point");
            return Err(e.into());
        }
    };
    tracing::info!("Loaded configuration for node: {}", config.node.id);

    // A call must complete within one heartbeat period
    let transport: Arc<dyn Transport> = Arc::new(NetworkClient::new(
        config.timing.connect_timeout(),
        config.timing.heartbeat_interval(),
    ));
    let directory: Arc<dyn PeerDirectory> = Arc::new(RemoteDirectory::new(
        config.directory.address.clone(),
        Arc::clone(&transport),
    ));
    let node = Node::new(NodeSettings::from_config(&config), transport, directory);

    let server = Arc::new(NetworkServer::new(
        config.node.bind_address.clone(),
        node.clone(),
        config.network.max_inbound_calls,
    ));
    let server_handle = {
        let server = Arc::clone(&server);
        tokio::spawn(async move {
            if let Err(e) = server.start().await {
                tracing::error!("Network server error: {}", e);
            }
        })
    };

    if let Err(e) = node.start().await {
        tracing::error!("Failed to start node: {}", e);
        server.stop();
        return Err(e.into());
    }

    let console = run_console(&node).await;

    if node.current_state().await == NodeState::Held {
        if let Err(e) = node.release_critical_section().await {
            tracing::warn!("Failed to release on exit: {}", e);
        }
    }
    node.shutdown();
    server.stop();
    server_handle.abort();

    tracing::info!("PeerLock shutdown complete");
    console
}

fn print_console_help() {
    println!("Commands:");
    println!("  request (p)   enter the critical section");
    println!("  release (l)   leave the critical section");
    println!("  status  (s)   show node status");
    println!("  quit    (q)   leave the group");
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Cannot listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}

/// Wait for the critical section unless `interrupt` completes first
async fn request_until(node: &Node, interrupt: impl Future<Output = ()>) -> Option<peerlock::Result<Grant>> {
    tokio::select! {
        result = node.request_critical_section() => Some(result),
        _ = interrupt => None,
    }
}

async fn run_console(node: &Arc<Node>) -> anyhow::Result<()> {
    print_console_help();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read console input")? else {
                    break;
                };
                match line.trim().to_lowercase().as_str() {
                    "" => {}
                    "request" | "p" => match request_until(node, ctrl_c()).await {
                        Some(Ok(grant)) if grant.missing.is_empty() => {
                            println!("Granted with ticket {} ({} replies)", grant.ticket, grant.replies);
                        }
                        Some(Ok(grant)) => {
                            println!(
                                "Granted with ticket {} without replies from {}",
                                grant.ticket,
                                grant.missing.join(", ")
                            );
                        }
                        Some(Err(e)) => println!("Request failed: {}", e),
                        None => {
                            tracing::info!("Received shutdown signal while waiting for the critical section");
                            break;
                        }
                    },
                    "release" | "l" => match node.release_critical_section().await {
                        Ok(answered) => println!("Released ({} deferred requests answered)", answered),
                        Err(e) => println!("Release failed: {}", e),
                    },
                    "status" | "s" => println!("{}", node.status().await),
                    "quit" | "q" => break,
                    other => {
                        println!("Unknown command '{}'", other);
                        print_console_help();
                    }
                }
            }
            _ = ctrl_c() => {
                tracing::info!("Received shutdown signal");
                break;
            }
        }
    }
    Ok(())
}

/// Serve the peer directory
async fn run_directory(listen: String) -> anyhow::Result<()> {
    tracing::info!("Starting peer directory on {}", listen);

    let directory = Arc::new(InMemoryDirectory::new());
    let server = NetworkServer::new(listen, directory, 256);

    tokio::select! {
        result = server.start() => {
            if let Err(e) = result {
                tracing::error!("Directory server error: {}", e);
                return Err(e.into());
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
            server.stop();
        }
    }
    Ok(())
}

/// Query a running node
async fn run_status(address: String) -> anyhow::Result<()> {
    let client = NetworkClient::new(Duration::from_secs(2), Duration::from_secs(5));

    let response = client
        .send(&address, Message::StatusRequest)
        .await
        .with_context(|| format!("failed to reach {}", address))?;

    match response {
        Message::StatusResponse {
            node_id,
            state,
            coordinator,
            peers,
        } => {
            println!("Node:        {}", node_id);
            println!("State:       {}", state);
            println!("Coordinator: {}", coordinator.as_deref().unwrap_or("(unknown)"));
            println!("Peers ({}):", peers.len());
            for peer in peers {
                println!("  {}", peer);
            }
            Ok(())
        }
        Message::Error { code, message } => {
            anyhow::bail!("{} rejected the status request ({:?}): {}", address, code, message)
        }
        other => anyhow::bail!("unexpected response from {}: {}", address, other.type_name()),
    }
}

/// Initialize configuration file
fn run_init(output: PathBuf, node_id: String) -> anyhow::Result<()> {
    let config = PeerLockConfig::sample(&node_id);
    config.validate()?;

    let content = toml::to_string_pretty(&config).context("failed to render configuration")?;
    std::fs::write(&output, format!("# PeerLock Configuration\n\n{}", content))
        .with_context(|| format!("failed to write {}", output.display()))?;

    println!("Configuration file created: {}", output.display());
    println!("\nSet bind_address and directory.address for your network.");
    println!("Then start with: peerlock --config {} start", output.display());
    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> anyhow::Result<()> {
    match PeerLockConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Node ID:          {}", config.node.id);
            println!("  Bind Address:     {}", config.node.bind_address);
            println!("  Advertise:        {}", config.advertise_address());
            println!("  Directory:        {}", config.directory.address);
            println!("  Heartbeat:        {} ms (timeout {} ms)",
                config.timing.heartbeat_interval_ms,
                config.timing.heartbeat_timeout_ms);
            println!("  Request Timeout:  {} ms ({})",
                config.timing.request_timeout_ms,
                config.mutex.on_request_timeout);
            println!("  Election Timeout: {} ms", config.timing.election_timeout_ms);
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e.into())
        }
    }
}
