//! ChatMesh - Replicated Messaging Backend
//!
//! Runs either a chat server node or the membership registry.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use chatmesh::api::HttpServer;
use chatmesh::config::ChatMeshConfig;
use chatmesh::network::{NetworkClient, NetworkServer};
use chatmesh::node::{Node, NodeSettings};
use chatmesh::registry::{
    Registry, RegistryRequest, RegistryResponse, RegistryServer, RemoteRegistry, Stamped,
};
use chatmesh::error::{Error, Result};

const INBOUND_CAPACITY: usize = 1024;

/// ChatMesh - Replicated Messaging Backend
#[derive(Parser)]
#[command(name = "chatmesh")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "chatmesh.toml")]
    config: PathBuf,

    /// Log level override (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a chat server node
    Node {
        /// Starting physical clock skew in milliseconds
        #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
        clock_offset_ms: i64,
    },

    /// Start the membership registry
    Registry,

    /// List every member the registry has seen
    Members {
        /// Registry address (defaults to the configured one)
        #[arg(short, long)]
        address: Option<String>,
    },

    /// Remove a member from the registry; it gets a new rank if it comes back
    Remove {
        /// Node ID to remove
        node_id: String,

        /// Registry address (defaults to the configured one)
        #[arg(short, long)]
        address: Option<String>,
    },

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "chatmesh.toml")]
        output: PathBuf,

        /// Node ID
        #[arg(long, default_value = "servidor_1")]
        node_id: String,
    },

    /// Validate configuration file
    Validate,

    /// Show node information
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Node { clock_offset_ms } => {
            let config = load_config(&cli.config)?;
            init_logging(&config, cli.log_level.as_deref());
            run_node(config, clock_offset_ms).await
        }
        Commands::Registry => {
            let config = load_config(&cli.config)?;
            init_logging(&config, cli.log_level.as_deref());
            run_registry(config).await
        }
        Commands::Members { address } => {
            let config = ChatMeshConfig::from_file(&cli.config).unwrap_or_default();
            init_logging(&config, cli.log_level.as_deref());
            run_members(&config, address).await
        }
        Commands::Remove { node_id, address } => {
            let config = ChatMeshConfig::from_file(&cli.config).unwrap_or_default();
            init_logging(&config, cli.log_level.as_deref());
            run_remove(&config, &node_id, address).await
        }
        Commands::Init { output, node_id } => run_init(output, node_id),
        Commands::Validate => run_validate(cli.config),
        Commands::Info => run_info(cli.config),
    }
}

fn load_config(path: &Path) -> Result<ChatMeshConfig> {
    ChatMeshConfig::from_file(path).map_err(|e| {
        eprintln!("Failed to load configuration from {:?}: {}", path, e);
        e
    })
}

fn init_logging(config: &ChatMeshConfig, level_override: Option<&str>) {
    let level = level_override.unwrap_or(&config.logging.level);
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if config.logging.format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Start a chat server node
async fn run_node(config: ChatMeshConfig, clock_offset_ms: i64) -> Result<()> {
    config.validate_node()?;
    tracing::info!("Starting ChatMesh node '{}'", config.node.id);

    if config.node.persist {
        std::fs::create_dir_all(config.data_dir()).map_err(|e| {
            tracing::error!("Failed to create data directory {:?}: {}", config.data_dir(), e);
            e
        })?;
    }

    let server = Arc::new(NetworkServer::bind(&config.node.bind_address).await?);
    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
    let network_task = {
        let server = server.clone();
        tokio::spawn(async move {
            if let Err(e) = server.serve_forwarding(inbound_tx).await {
                tracing::error!("Network server error: {}", e);
            }
        })
    };

    let registry = Arc::new(RemoteRegistry::new(
        config.registry.address.clone(),
        config.registry_timeout(),
    ));
    let transport = Arc::new(NetworkClient::new(config.connect_timeout(), config.registry_timeout()));

    let mut settings = NodeSettings::from_config(&config);
    settings.initial_offset_ms = clock_offset_ms;

    let (handle, mut node_task) = Node::spawn(settings, registry, transport, inbound_rx).await?;
    tracing::info!("Node {} is up", handle.identity());

    let api = HttpServer::new(config.api.clone(), handle.clone());
    let api_task = tokio::spawn(async move {
        if let Err(e) = api.start().await {
            tracing::error!("HTTP API error: {}", e);
        }
    });

    let signalled = tokio::select! {
        _ = tokio::signal::ctrl_c() => true,
        _ = &mut node_task => false,
    };

    if signalled {
        tracing::info!("Received shutdown signal");
        handle.shutdown().await;
        let _ = node_task.await;
    } else {
        tracing::warn!("Dispatch loop exited");
    }

    server.stop();
    api_task.abort();
    let _ = network_task.await;
    tracing::info!("ChatMesh node stopped");
    Ok(())
}

/// Start the membership registry
async fn run_registry(config: ChatMeshConfig) -> Result<()> {
    let server = Arc::new(
        RegistryServer::bind(
            &config.registry.bind_address,
            config.liveness_window(),
            config.sweep_interval(),
        )
        .await?,
    );

    let serving = {
        let server = server.clone();
        tokio::spawn(async move { server.run().await })
    };

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal");
    server.stop();

    match serving.await {
        Ok(result) => result,
        Err(e) => Err(Error::Internal(format!("registry task failed: {}", e))),
    }
}

/// List registry members, including inactive ones
async fn run_members(config: &ChatMeshConfig, address: Option<String>) -> Result<()> {
    let address = address.unwrap_or_else(|| config.registry.address.clone());
    let registry = RemoteRegistry::new(address.clone(), config.registry_timeout());

    match registry.call(Stamped::new(0, RegistryRequest::ListAll)).await?.body {
        RegistryResponse::Members { entries } => {
            println!("Members of {}", address);
            println!("{:<20} {:>6}  {:<24} {:<8} LAST HEARTBEAT", "NODE", "RANK", "ADDRESS", "ACTIVE");
            for entry in entries {
                println!(
                    "{:<20} {:>6}  {:<24} {:<8} {}",
                    entry.node_id,
                    entry.rank,
                    entry.address,
                    entry.active,
                    entry.last_heartbeat_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
            Ok(())
        }
        RegistryResponse::Error { message } => Err(Error::Registry(message)),
        other => Err(Error::Registry(format!("Unexpected response: {}", other.type_name()))),
    }
}

/// Drop one member from the registry
async fn run_remove(config: &ChatMeshConfig, node_id: &str, address: Option<String>) -> Result<()> {
    let address = address.unwrap_or_else(|| config.registry.address.clone());
    let registry = RemoteRegistry::new(address.clone(), config.registry_timeout());

    if registry.deregister(node_id, 0).await?.body {
        println!("Removed '{}' from {}", node_id, address);
    } else {
        println!("{} does not know '{}'", address, node_id);
    }
    Ok(())
}

/// Initialize a new configuration file
fn run_init(output: PathBuf, node_id: String) -> Result<()> {
    let config_content = format!(r#"# ChatMesh Configuration
# Generated configuration file

[node]
id = "{node_id}"
bind_address = "0.0.0.0:5561"
# advertise_address = "{node_id}:5561"
data_dir = "/var/lib/chatmesh/{node_id}"
persist = false

[registry]
address = "127.0.0.1:5559"
bind_address = "0.0.0.0:5559"
liveness_window_secs = 30
sweep_interval_secs = 10
heartbeat_interval_ms = 5000
request_timeout_ms = 3000

[election]
ok_timeout_ms = 2000
coordinator_timeout_ms = 5000
ping_interval_ms = 1000

[sync]
every_operations = 10
window_ms = 1000

[replication]
bootstrap_timeout_ms = 3000
connect_timeout_ms = 1000

[api]
enabled = true
bind_address = "0.0.0.0:8080"

[logging]
level = "info"
format = "pretty"
"#);

    std::fs::write(&output, config_content)?;
    println!("Configuration written to {:?}", output);
    println!("Edit node.id, node.advertise_address and registry.address before starting.");
    Ok(())
}

/// Validate configuration file
fn run_validate(config_path: PathBuf) -> Result<()> {
    let checked = ChatMeshConfig::from_file(&config_path).and_then(|config| {
        config.validate_node()?;
        Ok(config)
    });

    match checked {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Node ID: {}", config.node.id);
            println!("  Advertise Address: {}", config.advertise_address());
            println!("  Registry: {}", config.registry.address);
            println!("  Sync Every: {} operations", config.sync.every_operations);
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
    let config = ChatMeshConfig::from_file(&config_path)?;

    println!("ChatMesh Node Information");
    println!("=========================");
    println!();
    println!("Node ID:          {}", config.node.id);
    println!("Bind Address:     {}", config.node.bind_address);
    println!("Advertise:        {}", config.advertise_address());
    println!("Data Directory:   {}", config.data_dir().display());
    println!("Persist:          {}", config.node.persist);
    println!();
    println!("Registry:");
    println!("  Address:        {}", config.registry.address);
    println!("  Liveness:       {} s", config.registry.liveness_window_secs);
    println!("  Heartbeat:      {} ms", config.registry.heartbeat_interval_ms);
    println!();
    println!("Election:");
    println!("  OK Timeout:     {} ms", config.election.ok_timeout_ms);
    println!("  Coord Timeout:  {} ms", config.election.coordinator_timeout_ms);
    println!("  Ping Interval:  {} ms", config.election.ping_interval_ms);
    println!();
    println!("Clock Sync:");
    println!("  Every:          {} operations", config.sync.every_operations);
    println!("  Window:         {} ms", config.sync.window_ms);

    Ok(())
}
