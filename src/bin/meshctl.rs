//! MeshCtl - Command line tool for ChatMesh nodes
//!
//! Usage:
//!   meshctl status                             - Show node status
//!   meshctl coordinator                        - Show who the node follows
//!   meshctl state                              - Dump the replicated dataset
//!   meshctl send login '{"user": "alice"}'     - Submit a client request

use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};

use chatmesh::config::ChatMeshConfig;
use chatmesh::node::{ClientRequest, ClientResponse, NodeStatus};

/// ChatMesh Node Control Tool
#[derive(Parser)]
#[command(name = "meshctl")]
#[command(about = "Control and monitor ChatMesh nodes", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "chatmesh.toml")]
    config: PathBuf,

    /// API endpoint to connect to (overrides config)
    #[arg(short, long)]
    endpoint: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show status of the node
    Status,
    /// Show the node's election state and coordinator
    Coordinator,
    /// Print the replicated dataset as JSON
    State,
    /// Submit a client request
    Send {
        /// Service name (login, users, channel, channels, publish, message)
        service: String,
        /// JSON payload
        #[arg(default_value = "{}")]
        payload: String,
        /// Logical clock to attach to the request
        #[arg(long, default_value_t = 0)]
        clock: u64,
    },
    /// Check configuration file for errors
    CheckConfig {
        /// Path to config file to check (defaults to --config path)
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let endpoint = cli.endpoint.clone().unwrap_or_else(|| endpoint_from_config(&cli.config));

    let result = match &cli.command {
        Commands::Status => show_status(&endpoint).await,
        Commands::Coordinator => show_coordinator(&endpoint).await,
        Commands::State => show_state(&endpoint).await,
        Commands::Send { service, payload, clock } => send(&endpoint, service, payload, *clock).await,
        Commands::CheckConfig { file } => {
            let config_path = file.clone().unwrap_or_else(|| cli.config.clone());
            check_config(&config_path)
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

/// Derive the API endpoint from the config file, falling back to localhost
fn endpoint_from_config(path: &PathBuf) -> String {
    let fallback = "http://127.0.0.1:8080".to_string();
    let Ok(config) = ChatMeshConfig::from_file(path) else {
        return fallback;
    };

    let addr = config.api.bind_address;
    if let Some(port) = addr.strip_prefix("0.0.0.0:") {
        format!("http://127.0.0.1:{}", port)
    } else {
        format!("http://{}", addr)
    }
}

// ============ Commands ============

async fn fetch_status(endpoint: &str) -> anyhow::Result<NodeStatus> {
    let url = format!("{}/status", endpoint);
    let response = reqwest::Client::new()
        .get(&url)
        .send()
        .await
        .with_context(|| format!("cannot reach {}", url))?;

    if !response.status().is_success() {
        bail!("API error: {}", response.status());
    }
    Ok(response.json().await?)
}

async fn show_status(endpoint: &str) -> anyhow::Result<()> {
    let status = fetch_status(endpoint).await?;

    println!();
    println!("Node Status");
    println!("===========");
    println!();
    println!("Node ID:        {} (rank {})", status.node_id, status.rank);
    println!("Address:        {}", status.address);
    println!("Election:       {:?}", status.state);
    match &status.coordinator {
        Some(coordinator) => println!("Coordinator:    {}", coordinator),
        None => println!("Coordinator:    (none)"),
    }
    println!("Ready:          {}", status.ready);
    println!("Logical Clock:  {}", status.logical_clock);
    println!(
        "Physical Time:  {} (offset {} ms)",
        status.physical_time.format("%H:%M:%S%.3f"),
        status.physical_offset_ms
    );
    println!();
    println!(
        "Dataset:        {} users, {} channels, {} messages, {} publications",
        status.users, status.channels, status.messages, status.publications
    );
    println!("Operations:     {}", status.operations);
    println!("Elections:      {}", status.elections_started);
    println!("Sync Rounds:    {}", status.sync_rounds);
    println!();

    if !status.peers.is_empty() {
        println!("{:<20} {:>6}  {:<24} SUSPECTED", "PEER", "RANK", "ADDRESS");
        for peer in &status.peers {
            let suspected = status.suspected.contains(&peer.node_id);
            println!(
                "{:<20} {:>6}  {:<24} {}",
                peer.node_id,
                peer.rank,
                peer.address,
                if suspected { "yes" } else { "" }
            );
        }
        println!();
    }

    Ok(())
}

async fn show_coordinator(endpoint: &str) -> anyhow::Result<()> {
    let status = fetch_status(endpoint).await?;
    match status.coordinator {
        Some(coordinator) => println!("{} [{:?}]", coordinator, status.state),
        None => println!("(none) [{:?}]", status.state),
    }
    Ok(())
}

async fn show_state(endpoint: &str) -> anyhow::Result<()> {
    let url = format!("{}/state", endpoint);
    let response = reqwest::Client::new().get(&url).send().await?;

    if !response.status().is_success() {
        bail!("API error: {}", response.status());
    }

    let state: serde_json::Value = response.json().await?;
    println!("{}", serde_json::to_string_pretty(&state)?);
    Ok(())
}

async fn send(endpoint: &str, service: &str, payload: &str, clock: u64) -> anyhow::Result<()> {
    let payload: serde_json::Value = serde_json::from_str(payload).context("payload is not valid JSON")?;
    let request = ClientRequest::new(service, payload, clock);

    let url = format!("{}/request", endpoint);
    let response = reqwest::Client::new().post(&url).json(&request).send().await?;

    if !response.status().is_success() {
        bail!("API error: {}", response.status());
    }

    let response: ClientResponse = response.json().await?;
    println!("{}", serde_json::to_string_pretty(&response)?);

    if !response.is_ok() {
        bail!("request rejected: {}", response.error_code().unwrap_or("unknown"));
    }
    Ok(())
}

fn check_config(path: &PathBuf) -> anyhow::Result<()> {
    println!("Checking configuration: {}", path.display());

    let config = ChatMeshConfig::from_file(path)?;
    config.validate_node()?;

    println!("✓ Configuration is valid");
    println!("  Node ID:  {}", config.node.id);
    println!("  Registry: {}", config.registry.address);
    println!("  API:      {}", config.api.bind_address);
    Ok(())
}
