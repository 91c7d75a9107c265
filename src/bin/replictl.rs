//! Replictl - Command line tool for managing replicore clusters
//!
//! Usage:
//!   replictl status              - Show local node status
//!   replictl nodes [--filter]    - List cluster nodes
//!   replictl view                - Show running and stopped nodes
//!   replictl join <node>         - Join the cluster of <node>
//!   replictl leave [--via node]  - Leave the cluster
//!   replictl remove <node>       - Remove a stopped node from the cluster

use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;

use replicore::config::ReplicoreConfig;

const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:8470";

/// Replicore Cluster Control Tool
#[derive(Parser)]
#[command(name = "replictl")]
#[command(about = "Control and monitor replicore clusters", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "/etc/replicore/replicore.toml")]
    config: PathBuf,

    /// API endpoint to connect to (overrides config)
    #[arg(short, long)]
    endpoint: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show status of the local node
    Status,
    /// List cluster nodes
    Nodes {
        /// Which nodes to list: all, running or stopped
        #[arg(long, default_value = "all")]
        filter: String,
    },
    /// Show running and stopped cluster nodes
    View,
    /// Show the cluster status of one node
    NodeStatus {
        /// Node name (host:port)
        node: String,
    },
    /// Join the cluster that <node> belongs to
    Join {
        /// Node name (host:port)
        node: String,
    },
    /// Leave the cluster
    Leave {
        /// Ask this peer to perform the removal
        #[arg(long)]
        via: Option<String>,
    },
    /// Remove a stopped node from the cluster
    Remove {
        /// Node name (host:port)
        node: String,
    },
    /// Run a transaction procedure
    Tx {
        /// Shard name
        #[arg(long, default_value = "local_content")]
        shard: String,
        /// Run as a read-only transaction
        #[arg(long)]
        read_only: bool,
        /// Procedure name (e.g. kv.get)
        procedure: String,
        /// Procedure arguments as JSON
        #[arg(default_value = "{}")]
        args: String,
    },
}

// ============ API Response Types ============

#[derive(Debug, Deserialize)]
struct StatusResponse {
    node: String,
    role: String,
    storage: String,
    schema_copy_type: String,
    #[serde(default)]
    tables: Vec<TableEntry>,
    #[serde(default)]
    shards_up: Vec<String>,
    uptime_seconds: u64,
}

#[derive(Debug, Deserialize)]
struct TableEntry {
    name: String,
    spec: TableSpec,
}

#[derive(Debug, Deserialize)]
struct TableSpec {
    shard: serde_json::Value,
    copy_type: String,
}

#[derive(Debug, Deserialize)]
struct ClusterView {
    running_nodes: Vec<String>,
    stopped_nodes: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct NodeStatusResponse {
    node: String,
    status: String,
}

#[derive(Debug, Deserialize)]
struct ValueResponse {
    value: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
    code: String,
}

// ============ Main ============

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let client = ApiClient::new(resolve_endpoint(&cli));

    let result = match &cli.command {
        Commands::Status => show_status(&client).await,
        Commands::Nodes { filter } => list_nodes(&client, filter).await,
        Commands::View => show_view(&client).await,
        Commands::NodeStatus { node } => show_node_status(&client, node).await,
        Commands::Join { node } => join(&client, node).await,
        Commands::Leave { via } => leave(&client, via.as_deref()).await,
        Commands::Remove { node } => remove(&client, node).await,
        Commands::Tx {
            shard,
            read_only,
            procedure,
            args,
        } => run_tx(&client, shard, *read_only, procedure, args).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

/// Endpoint from the command line, else the config's API address
fn resolve_endpoint(cli: &Cli) -> String {
    if let Some(endpoint) = &cli.endpoint {
        return endpoint.trim_end_matches('/').to_string();
    }

    match ReplicoreConfig::from_file(&cli.config) {
        Ok(config) => {
            let addr = config.api.bind_address;
            match addr.strip_prefix("0.0.0.0:") {
                Some(port) => format!("http://127.0.0.1:{}", port),
                None => format!("http://{}", addr),
            }
        }
        Err(_) => DEFAULT_ENDPOINT.to_string(),
    }
}

/// `LocalContent` or `{"Named": "orders"}` as a plain shard name
fn shard_name(shard: &serde_json::Value) -> String {
    match shard {
        serde_json::Value::String(s) if s == "LocalContent" => "local_content".to_string(),
        serde_json::Value::Object(map) => map
            .get("Named")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| shard.to_string()),
        other => other.to_string(),
    }
}

// ============ Client ============

struct ApiClient {
    endpoint: String,
    http: reqwest::Client,
}

impl ApiClient {
    fn new(endpoint: String) -> Self {
        Self {
            endpoint,
            http: reqwest::Client::new(),
        }
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{}", self.endpoint, path);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("failed to reach {}", url))?;
        Self::decode(response).await
    }

    async fn post<T: DeserializeOwned>(&self, path: &str, body: serde_json::Value) -> Result<T> {
        let url = format!("{}{}", self.endpoint, path);
        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("failed to reach {}", url))?;
        Self::decode(response).await
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        let status = response.status();
        if status.is_success() {
            return Ok(response.json().await?);
        }

        match response.json::<ErrorResponse>().await {
            Ok(err) => Err(anyhow!("{} ({})", err.error, err.code)),
            Err(_) => Err(anyhow!("API error: {}", status)),
        }
    }
}

// ============ Commands ============

async fn show_status(client: &ApiClient) -> Result<()> {
    let status: StatusResponse = client.get("/status").await?;

    println!();
    println!("Node Status");
    println!("===========");
    println!();
    println!("Node:         {}", status.node);
    println!("Role:         {}", status.role);
    println!("Storage:      {}", status.storage);
    println!("Schema Copy:  {}", status.schema_copy_type);
    println!("Uptime:       {}s", status.uptime_seconds);
    println!("Shards Up:    {}", status.shards_up.join(", "));
    println!();

    if !status.tables.is_empty() {
        println!("{:<30} {:<20} {:<12}", "TABLE", "SHARD", "COPY TYPE");
        println!("{}", "-".repeat(62));
        for table in &status.tables {
            println!(
                "{:<30} {:<20} {:<12}",
                table.name,
                shard_name(&table.spec.shard),
                table.spec.copy_type
            );
        }
        println!();
    }

    Ok(())
}

async fn list_nodes(client: &ApiClient, filter: &str) -> Result<()> {
    if !matches!(filter, "all" | "running" | "stopped") {
        bail!("unknown filter '{}', expected all, running or stopped", filter);
    }

    let nodes: Vec<String> = client
        .get(&format!("/cluster/nodes?filter={}", filter))
        .await?;

    for node in nodes {
        println!("{}", node);
    }
    Ok(())
}

async fn show_view(client: &ApiClient) -> Result<()> {
    let view: ClusterView = client.get("/cluster").await?;

    println!();
    println!("Replicore Cluster (replictl v{})", env!("CARGO_PKG_VERSION"));
    println!("================================");
    println!();
    println!(
        "Running: {}  |  Stopped: {}",
        view.running_nodes.len(),
        view.stopped_nodes.len()
    );
    println!();
    println!("{:<30} {:<10}", "NODE", "STATUS");
    println!("{}", "-".repeat(40));

    for node in &view.running_nodes {
        let status = format!("{:<10}", "running");
        println!("{:<30} \x1b[32m{}\x1b[0m", node, status);
    }
    for node in &view.stopped_nodes {
        let status = format!("{:<10}", "stopped");
        println!("{:<30} \x1b[31m{}\x1b[0m", node, status);
    }
    println!();

    Ok(())
}

async fn show_node_status(client: &ApiClient, node: &str) -> Result<()> {
    let status: NodeStatusResponse = client.get(&format!("/cluster/nodes/{}", node)).await?;
    println!("{}: {}", status.node, status.status);
    Ok(())
}

async fn join(client: &ApiClient, node: &str) -> Result<()> {
    let _: serde_json::Value = client
        .post("/cluster/join", json!({ "node": node }))
        .await?;
    println!("✓ Joined cluster via {}", node);
    Ok(())
}

async fn leave(client: &ApiClient, via: Option<&str>) -> Result<()> {
    let _: serde_json::Value = client.post("/cluster/leave", json!({ "via": via })).await?;
    println!("✓ Left the cluster");
    Ok(())
}

async fn remove(client: &ApiClient, node: &str) -> Result<()> {
    let _: serde_json::Value = client
        .post("/cluster/remove", json!({ "node": node }))
        .await?;
    println!("✓ Removed {} from the cluster", node);
    Ok(())
}

async fn run_tx(
    client: &ApiClient,
    shard: &str,
    read_only: bool,
    procedure: &str,
    args: &str,
) -> Result<()> {
    let args: serde_json::Value =
        serde_json::from_str(args).context("procedure arguments must be JSON")?;
    let path = if read_only { "/tx/ro" } else { "/tx/rw" };

    let result: ValueResponse = client
        .post(
            path,
            json!({ "shard": shard, "procedure": procedure, "args": args }),
        )
        .await?;
    println!("{}", serde_json::to_string_pretty(&result.value)?);
    Ok(())
}
