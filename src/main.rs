//! DewiCom - LAN Push-to-Talk Intercom
//!
//! Runs one intercom node: leader election, relay and discovery.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dewicom::config::DewiComConfig;
use dewicom::host::Host;
use dewicom::id::NodeId;
use dewicom::network;

/// DewiCom - LAN Push-to-Talk Intercom
#[derive(Parser)]
#[command(name = "dewicom")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "dewicom.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the DewiCom node
    Start {
        /// IPv4 address to advertise (detected when omitted)
        #[arg(short, long)]
        address: Option<std::net::Ipv4Addr>,
    },

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "dewicom.toml")]
        output: PathBuf,
    },

    /// Validate configuration file
    Validate,

    /// Show node information
    Info,

    /// Query a running node
    Status {
        /// Discovery address to query (host:port)
        #[arg(short, long, default_value = "localhost:3001")]
        address: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start { address } => {
            let config = load_or_default(&cli.config, cli.log_level.as_deref())?;
            run_start(config, address).await
        }
        Commands::Init { output } => {
            init_logging(cli.log_level.as_deref().unwrap_or("info"), "pretty");
            run_init(&output)
        }
        Commands::Validate => {
            init_logging(cli.log_level.as_deref().unwrap_or("info"), "pretty");
            run_validate(&cli.config)
        }
        Commands::Info => {
            let config = load_or_default(&cli.config, cli.log_level.as_deref())?;
            run_info(&config)
        }
        Commands::Status { address } => {
            init_logging(cli.log_level.as_deref().unwrap_or("warn"), "pretty");
            run_status(&address).await
        }
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

/// Load the config file, falling back to defaults when it does not exist.
/// Logging is initialized here because its settings live in the file.
fn load_or_default(path: &Path, log_level: Option<&str>) -> anyhow::Result<DewiComConfig> {
    let (config, missing) = if path.exists() {
        let config = DewiComConfig::from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
        (config, false)
    } else {
        (DewiComConfig::default(), true)
    };

    init_logging(log_level.unwrap_or(config.logging.level.as_str()), &config.logging.format);
    if missing {
        tracing::warn!("{} not found, using default configuration", path.display());
    }
    Ok(config)
}

/// Start the DewiCom node
async fn run_start(mut config: DewiComConfig, address: Option<std::net::Ipv4Addr>) -> anyhow::Result<()> {
    if address.is_some() {
        config.node.address = address;
    }

    let host = Host::new(config).context("Failed to determine the node address")?;
    tracing::info!("DewiCom {} starting on {}", dewicom::VERSION, host.address());

    let mut target = host.relay_target();
    tokio::spawn(async move {
        while target.changed().await.is_ok() {
            if let Some(url) = target.borrow_and_update().clone() {
                tracing::info!("Relay target: {}", url);
            }
        }
    });

    host.run(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
        }
    })
    .await
    .context("Node failed")?;

    tracing::info!("DewiCom stopped");
    Ok(())
}

/// Initialize configuration file
fn run_init(output: &Path) -> anyhow::Result<()> {
    if output.exists() {
        anyhow::bail!("{} already exists", output.display());
    }

    let content = format!(
        "# DewiCom Configuration\n# Generated configuration file\n\n{}",
        DewiComConfig::default().to_toml()?
    );
    std::fs::write(output, content)
        .with_context(|| format!("Failed to write {}", output.display()))?;

    println!("Configuration written to {}", output.display());
    Ok(())
}

/// Validate configuration file
fn run_validate(path: &Path) -> anyhow::Result<()> {
    match DewiComConfig::from_file(path) {
        Ok(_) => {
            println!("Configuration is valid: {}", path.display());
            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            Err(e.into())
        }
    }
}

/// Show node information
fn run_info(config: &DewiComConfig) -> anyhow::Result<()> {
    let address = network::resolve_address(config.node.address)
        .context("Failed to determine the node address")?;
    let node_id = NodeId::derive(address, config.node.priority_boost);

    println!("DewiCom Node Information");
    println!("========================");
    println!();
    println!("Address:          {}", address);
    println!("Node ID:          {}{}", node_id, if node_id.is_boosted() { " (boosted)" } else { "" });
    println!();
    println!("Election:");
    println!("  Group:          {}:{}", config.election.group, config.election.port);
    println!("  Heartbeat:      {} ms", config.election.heartbeat_interval_ms);
    println!("  Leader timeout: {} ms", config.election.leader_timeout_ms);
    println!("  Election wait:  {} ms", config.election.election_wait_ms);
    println!();
    println!("Relay:");
    println!("  Websocket:      {}", config.relay.ws_bind_address);
    println!("  Discovery:      {}", config.relay.http_bind_address);
    println!("  Mode:           {}", config.relay.mode);
    println!("  Channels:");
    for channel in &config.relay.channels {
        println!("    {:<10} {:<10} {}", channel.id, channel.name, channel.color);
    }

    Ok(())
}

/// Query a running node's discovery listener
async fn run_status(address: &str) -> anyhow::Result<()> {
    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(5))
        .build()?;

    for (title, path) in [
        ("Node", "/api/discovery"),
        ("Leader", "/api/leader"),
        ("Channels", "/api/channels"),
    ] {
        let url = format!("http://{}{}", address, path);
        let body: serde_json::Value = client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("Failed to reach {}", url))?
            .json()
            .await
            .with_context(|| format!("Invalid response from {}", url))?;

        println!("{}:", title);
        println!("{}", serde_json::to_string_pretty(&body)?);
        println!();
    }

    Ok(())
}
