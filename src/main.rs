//! Replicore - Cluster membership and transaction routing node
//!
//! Runs one core or replicant node: storage, RPC server, liveness loop
//! and the HTTP admin API.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use replicore::api::HttpServer;
use replicore::config::ReplicoreConfig;
use replicore::error::Result;
use replicore::node::{ClusterNode, NodeOptions};
use replicore::rpc::{RpcServer, TcpRpc};
use replicore::types::NodeName;

/// Replicore - Cluster membership and transaction routing node
#[derive(Parser)]
#[command(name = "replicore")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "replicore.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the node
    Start {
        /// Join the cluster of this node once started (host:port)
        #[arg(long)]
        join: Option<String>,
    },

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "replicore.toml")]
        output: PathBuf,

        /// Node name (host:port other nodes dial)
        #[arg(long, default_value = "127.0.0.1:4370")]
        name: String,

        /// Node role (core or replicant)
        #[arg(long, default_value = "core")]
        role: String,
    },

    /// Validate configuration file
    Validate,

    /// Show node information
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // The configured level applies unless overridden on the command line
    let level = cli.log_level.clone().unwrap_or_else(|| {
        ReplicoreConfig::from_file(&cli.config)
            .map(|c| c.logging.level)
            .unwrap_or_else(|_| "info".to_string())
    });
    init_logging(&level);

    match cli.command {
        Commands::Start { join } => run_start(cli.config, join).await,
        Commands::Init { output, name, role } => run_init(output, name, role),
        Commands::Validate => run_validate(cli.config),
        Commands::Info => run_info(cli.config),
    }
}

/// Initialize logging
fn init_logging(level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Start the node
async fn run_start(config_path: PathBuf, join: Option<String>) -> Result<()> {
    tracing::info!("Starting replicore node...");

    let config = match ReplicoreConfig::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load configuration from {:?}: {}", config_path, e);
            return Err(e);
        }
    };
    tracing::info!(
        "Loaded configuration for node {} ({})",
        config.node.name,
        config.node.role
    );

    if let Err(e) = std::fs::create_dir_all(config.data_dir()) {
        tracing::error!("Failed to create data directory {:?}: {}", config.data_dir(), e);
        return Err(e.into());
    }

    let rpc = Arc::new(TcpRpc::new(config.connect_timeout(), config.rpc_timeout()));
    let node = Arc::new(ClusterNode::build(NodeOptions::from_config(&config), rpc));

    if let Err(e) = node.start().await {
        tracing::error!("Failed to start storage: {}", e);
        return Err(e);
    }

    let rpc_server = RpcServer::new(
        config.bind_address().to_string(),
        Arc::clone(node.dispatcher()),
    );
    let http_server = HttpServer::new(config.api.clone(), Arc::clone(&node));
    let liveness = node.spawn_liveness();

    if let Some(target) = join {
        let join_node = Arc::clone(&node);
        tokio::spawn(async move {
            let target = NodeName::new(target);
            match join_node.membership().join_cluster(&target).await {
                Ok(()) => tracing::info!("Joined cluster via {}", target),
                Err(e) => tracing::error!("Failed to join cluster via {}: {}", target, e),
            }
        });
    }

    tokio::select! {
        result = rpc_server.start() => {
            if let Err(e) = result {
                tracing::error!("RPC server error: {}", e);
            }
        }
        result = http_server.start(), if config.api.enabled => {
            if let Err(e) = result {
                tracing::error!("HTTP server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
        }
    }

    rpc_server.stop();
    node.shutdown().await?;
    let _ = liveness.await;

    tracing::info!("Node stopped");
    Ok(())
}

/// Initialize a new configuration file
fn run_init(output: PathBuf, name: String, role: String) -> Result<()> {
    let data_name = name.replace(':', "-");
    let config_content = format!(
        r#"# Replicore Configuration
# Generated configuration file

[node]
name = "{name}"
role = "{role}"
data_dir = "/var/lib/replicore/{data_name}"
# bind_address = "0.0.0.0:4370"

[cluster]
seeds = []
# seeds = ["10.0.0.2:4370", "10.0.0.3:4370"]
heartbeat_interval_ms = 1000
rpc_timeout_ms = 15000
connect_timeout_ms = 5000
core_node_wait_ms = 5000

[storage]
poll_interval_ms = 1000
table_wait_timeout_ms = 30000
table_wait_rounds = 0

[api]
enabled = true
bind_address = "0.0.0.0:8470"

[logging]
level = "info"
"#
    );

    // Refuse to write something that would not load back
    ReplicoreConfig::from_str(&config_content)?;

    std::fs::write(&output, config_content)?;
    println!("Configuration file created: {}", output.display());
    println!("\nEdit the file to configure seeds and the data directory.");
    println!("Then start with: replicore --config {} start", output.display());

    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> Result<()> {
    match ReplicoreConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Node: {}", config.node.name);
            println!("  Role: {}", config.node.role);
            println!("  Bind Address: {}", config.bind_address());
            println!("  Seeds: {}", config.seeds().len());
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

/// Show node information
fn run_info(config_path: PathBuf) -> Result<()> {
    let config = ReplicoreConfig::from_file(&config_path)?;

    println!("Replicore Node Information");
    println!("==========================");
    println!();
    println!("Node:             {}", config.node.name);
    println!("Role:             {}", config.node.role);
    println!("Bind Address:     {}", config.bind_address());
    println!("Data Directory:   {}", config.data_dir().display());
    println!();
    println!("Cluster Configuration:");
    println!("  Seeds:          {:?}", config.cluster.seeds);
    println!("  Heartbeat:      {} ms", config.cluster.heartbeat_interval_ms);
    println!("  RPC Timeout:    {} ms", config.cluster.rpc_timeout_ms);
    println!("  Core Node Wait: {} ms", config.cluster.core_node_wait_ms);
    println!();
    println!("Storage Waits:");
    println!("  Poll Interval:  {} ms", config.storage.poll_interval_ms);
    println!("  Table Wait:     {} ms", config.storage.table_wait_timeout_ms);
    println!("  Table Rounds:   {}", config.storage.table_wait_rounds);
    println!();
    println!("API:              {} (enabled: {})", config.api.bind_address, config.api.enabled);

    Ok(())
}
