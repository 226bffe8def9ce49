//! WolfElect - Lease-Backed Leader Election
//!
//! Command line front end: runs a coordinator, manages its configuration
//! and identity, and inspects live membership.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wolfelect::config::{ElectorConfig, LoggingConfig};
use wolfelect::error::Result;
use wolfelect::identity::{ensure_identity, key_path};
use wolfelect::state::fetch_snapshot;
use wolfelect::store::{CoordinationStore, EtcdStore};
use wolfelect::Coordinator;

/// WolfElect - Lease-Backed Leader Election
#[derive(Parser)]
#[command(name = "wolfelect")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "wolfelect.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a coordinator until interrupted
    Start,

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "wolfelect.toml")]
        output: PathBuf,

        /// Directory holding the node key
        #[arg(long, default_value = "/var/lib/wolfelect")]
        data_dir: PathBuf,

        /// etcd endpoint (repeatable)
        #[arg(long = "endpoint")]
        endpoints: Vec<String>,
    },

    /// Validate configuration file
    Validate,

    /// Create or load the node identity and print it
    Identity,

    /// List live members and the computed leader
    Members {
        /// Print the snapshot as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start => run_start(cli.config, cli.log_level).await,
        Commands::Init { output, data_dir, endpoints } => {
            init_logging(&LoggingConfig::default(), cli.log_level.as_deref());
            run_init(output, data_dir, endpoints)
        }
        Commands::Validate => {
            init_logging(&LoggingConfig::default(), cli.log_level.as_deref());
            run_validate(cli.config)
        }
        Commands::Identity => {
            init_logging(&LoggingConfig::default(), cli.log_level.as_deref());
            run_identity(cli.config)
        }
        Commands::Members { json } => {
            init_logging(&LoggingConfig::default(), cli.log_level.as_deref());
            run_members(cli.config, json).await
        }
    }
}

/// Initialize logging
fn init_logging(logging: &LoggingConfig, level_override: Option<&str>) {
    let level = level_override.unwrap_or(logging.level.as_str());
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if logging.format == "compact" {
        registry.with(tracing_subscriber::fmt::layer().compact()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Run a coordinator until Ctrl+C
async fn run_start(config_path: PathBuf, log_level: Option<String>) -> Result<()> {
    let config = match ElectorConfig::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load configuration from {:?}: {}", config_path, e);
            eprintln!("Please check that the config file exists and is valid TOML");
            return Err(e);
        }
    };
    init_logging(&config.logging, log_level.as_deref());
    tracing::info!("Loaded configuration from {:?}", config_path);

    let coordinator = match Coordinator::start(config).await {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to start coordinator: {}", e);
            return Err(e);
        }
    };

    let mut changes = coordinator.subscribe();
    loop {
        tokio::select! {
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
                if *changes.borrow_and_update() {
                    tracing::info!("Node {} is now the LEADER", coordinator.self_id());
                } else {
                    tracing::info!(
                        "Node {} is now a FOLLOWER (leader: {})",
                        coordinator.self_id(),
                        coordinator
                            .current_leader()
                            .map(|id| id.to_string())
                            .unwrap_or_else(|| "unknown".into())
                    );
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received shutdown signal");
                break;
            }
        }
    }

    coordinator.stop().await
}

/// Write a commented configuration template
fn run_init(output: PathBuf, data_dir: PathBuf, endpoints: Vec<String>) -> Result<()> {
    let endpoints = if endpoints.is_empty() {
        vec!["http://127.0.0.1:2379".to_string()]
    } else {
        endpoints
    };
    let endpoint_list = endpoints
        .iter()
        .map(|e| format!("\"{}\"", e))
        .collect::<Vec<_>>()
        .join(", ");

    let config_content = format!(r#"# WolfElect Configuration
# Generated configuration file

[node]
data_dir = "{data_dir}"
# name = "worker-1"

[store]
endpoints = [{endpoint_list}]
lease_ttl_secs = 5
dial_timeout_ms = 5000
request_timeout_ms = 5000

[election]
interval_ms = 5000
query_timeout_ms = 3000
# "retry" keeps electing through store outages, "halt" stops the loop on the first error
on_store_error = "retry"
retry_backoff_min_ms = 500
retry_backoff_max_ms = 5000
# 0 = retry forever
max_consecutive_failures = 0

[logging]
level = "info"
format = "pretty"
"#, data_dir = data_dir.display());

    // Refuse to write a template we could not load back
    ElectorConfig::from_str(&config_content)?;

    std::fs::write(&output, config_content)?;
    println!("Configuration file created: {}", output.display());
    println!("Then start with: wolfelect start --config {}", output.display());

    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> Result<()> {
    match ElectorConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Data Directory: {}", config.data_dir().display());
            println!("  Endpoints:      {}", config.store.endpoints.join(", "));
            println!("  Lease TTL:      {:?}", config.lease_ttl());
            println!("  Interval:       {:?}", config.election.interval());
            println!("  On Store Error: {:?}", config.election.on_store_error);
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

/// Show node identity
fn run_identity(config_path: PathBuf) -> Result<()> {
    let config = ElectorConfig::from_file(&config_path)?;
    let identity = ensure_identity(config.data_dir())?;

    println!("Node ID:   {}", identity.node_id());
    println!("Key ID:    {}", identity.key_id());
    println!("Key File:  {}", key_path(config.data_dir()).display());

    Ok(())
}

/// One read-only membership scan
async fn run_members(config_path: PathBuf, json: bool) -> Result<()> {
    let config = ElectorConfig::from_file(&config_path)?;
    let store = EtcdStore::connect(
        &config.store.endpoints,
        config.dial_timeout(),
        config.request_timeout(),
    )
    .await?;

    let snapshot = fetch_snapshot(&store, config.election.query_timeout()).await;
    store.close().await?;
    let snapshot = snapshot?;

    if json {
        let rendered = serde_json::to_string_pretty(&snapshot)
            .map_err(|e| wolfelect::Error::Store(format!("failed to render snapshot: {}", e)))?;
        println!("{}", rendered);
        return Ok(());
    }

    println!("Live members: {}", snapshot.len());
    for member in snapshot.members() {
        let marker = if Some(member) == snapshot.leader() { " (leader)" } else { "" };
        println!("  {}{}", member, marker);
    }
    if snapshot.is_empty() {
        println!("  (none)");
    }

    Ok(())
}
