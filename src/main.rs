//! workmesh - Distributed work manager
//!
//! Nodes share their free work slots with each other and place work on the
//! node with the most room.

mod config;
mod engine;
mod network;
mod node;
mod protocol;
mod transport;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use config::Config;
use engine::LogRunner;
use network::{resolve_endpoint, Client};
use node::{Node, NodeSettings};
use protocol::{Address, SubmitMode, WorkItem};

/// workmesh - Distributed work manager
#[derive(Parser)]
#[command(name = "workmesh")]
#[command(author = "workmesh Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Share work slots across a cluster of nodes", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a node
    Serve {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Endpoint (host:port) of a node to join; repeatable
        #[arg(short, long)]
        seed: Vec<String>,

        /// Node name to log
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Print the peer set of a node
    Peers {
        /// Node endpoint (host:port)
        endpoint: String,
    },

    /// Measure the round-trip time to a node
    Ping {
        endpoint: String,
    },

    /// Print the statistics a node keeps about itself
    Stats {
        endpoint: String,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Submit a work item to a node
    Submit {
        endpoint: String,

        /// Work item name
        name: String,

        #[arg(short, long, value_enum, default_value_t = Mode::Do)]
        mode: Mode,

        /// Use the long-running pool
        #[arg(long)]
        long: bool,

        /// Payload bytes (UTF-8)
        #[arg(short = 'd', long)]
        payload: Option<String>,
    },

    /// Show current configuration
    Config {
        /// Generate sample configuration
        #[arg(long)]
        generate: bool,

        /// Output path for generated config
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Mode {
    Do,
    Start,
    Schedule,
}

impl From<Mode> for SubmitMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Do => SubmitMode::Do,
            Mode::Start => SubmitMode::Start,
            Mode::Schedule => SubmitMode::Schedule,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default().unwrap_or_default()
    };

    // Initialize logging
    let level = if cli.verbose || config.general.verbose {
        "debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    let client = Client::new(config.network_settings());

    match cli.command {
        Commands::Serve { port, seed, name } => {
            run_node(config, port, seed, name).await?;
        }
        Commands::Peers { endpoint } => {
            let mut peers: Vec<_> = client.peers(&endpoint).await?.into_iter().collect();
            peers.sort_by(|a, b| a.id.cmp(&b.id));
            for peer in peers {
                println!("{}", peer);
            }
        }
        Commands::Ping { endpoint } => {
            let rtt = client.ping(&endpoint).await?;
            println!("{}: {:.3} ms", endpoint, rtt.as_secs_f64() * 1000.0);
        }
        Commands::Stats { endpoint, json } => {
            let address = node_at(&client, &endpoint).await?;
            let stats = client.statistics(&endpoint, &address).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("Statistics for {}", address);
                println!("  short-running free:     {}", stats.short_running_free);
                println!("  long-running free:      {}", stats.long_running_free);
                println!("  do_work accepted:       {}", stats.do_work_accepted);
                println!("  do_work rejected:       {}", stats.do_work_rejected);
                println!("  start_work accepted:    {}", stats.start_work_accepted);
                println!("  start_work rejected:    {}", stats.start_work_rejected);
                println!("  schedule_work accepted: {}", stats.schedule_work_accepted);
                println!("  schedule_work rejected: {}", stats.schedule_work_rejected);
                println!("  work successful:        {}", stats.work_successful);
                println!("  work failed:            {}", stats.work_failed);
            }
        }
        Commands::Submit {
            endpoint,
            name,
            mode,
            long,
            payload,
        } => {
            let address = node_at(&client, &endpoint).await?;
            let mut work = WorkItem::new(name, payload.unwrap_or_default().into_bytes());
            if long {
                work = work.long_running();
            }
            let work_id = work.id;

            match client.submit(&address, mode.into(), work).await? {
                Some(delay) => println!("{} started on {} after {} ms", work_id, address, delay),
                None => println!("{} accepted by {}", work_id, address),
            }
        }
        Commands::Config { generate, output } => {
            if generate {
                let sample = config::generate_sample_config()?;
                if let Some(path) = output {
                    std::fs::write(&path, &sample)?;
                    println!("Configuration written to: {}", path.display());
                } else {
                    println!("{}", sample);
                }
            } else {
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }
    }

    Ok(())
}

/// Run a node until Ctrl+C
async fn run_node(
    config: Config,
    port: Option<u16>,
    seeds: Vec<String>,
    name: Option<String>,
) -> anyhow::Result<()> {
    let mut network = config.network_settings();
    if let Some(port) = port {
        network.port = port;
    }
    let seeds = if seeds.is_empty() {
        config.cluster.seeds.clone()
    } else {
        seeds
    };
    let name = name.unwrap_or_else(|| config.general.name.clone());

    let settings = NodeSettings {
        node_id: config.general.node_id.clone(),
        advertise_host: config.advertise_host(),
        network,
        engine: config.engine_settings(),
        selector: config.routing.selector,
        runner: Arc::new(LogRunner),
        sweep_interval: config.sweep_interval(),
    };

    let node = Node::start(settings).await?;

    println!("\n========================================");
    println!("  workmesh node running");
    println!("========================================");
    println!("  Name:     {}", name);
    println!("  Address:  {}", node.address());
    println!("  Protocol: v{}", protocol::PROTOCOL_VERSION);
    println!(
        "  Slots:    {} short / {} long",
        config.engine.short_running_slots, config.engine.long_running_slots
    );
    println!("========================================");

    let mut joined = false;
    for seed in &seeds {
        match node.join(seed).await {
            Ok(announced) => {
                println!("Joined cluster via {} ({} peers notified)", seed, announced);
                joined = true;
                break;
            }
            Err(e) => tracing::warn!(seed = %seed, error = %e, "Failed to join via seed"),
        }
    }
    if !seeds.is_empty() && !joined {
        tracing::warn!("No seed reachable; running as a single-node cluster");
    }

    println!("\nPress Ctrl+C to stop.\n");
    tokio::signal::ctrl_c().await?;
    println!("\nShutting down...");

    node.shutdown().await;
    Ok(())
}

/// Find the address of the node serving `endpoint` in its own peer set
async fn node_at(client: &Client, endpoint: &str) -> anyhow::Result<Address> {
    let peers = client.peers(endpoint).await?;

    if let Some(address) = peers.iter().find(|p| p.endpoint == endpoint) {
        return Ok(address.clone());
    }

    // The node may advertise a different name for the same socket
    let target = resolve_endpoint(endpoint).await?;
    for peer in peers {
        if let Ok(addr) = resolve_endpoint(&peer.endpoint).await {
            if addr == target {
                return Ok(peer);
            }
        }
    }

    anyhow::bail!("{} does not list itself among its peers", endpoint)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::NetworkConfig;

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::try_parse_from([
            "workmesh", "serve", "-p", "0", "-s", "a:1", "-s", "b:2",
        ])
        .unwrap();
        match cli.command {
            Commands::Serve { port, seed, name } => {
                assert_eq!(port, Some(0));
                assert_eq!(seed, vec!["a:1".to_string(), "b:2".to_string()]);
                assert!(name.is_none());
            }
            _ => panic!("expected serve"),
        }

        let cli = Cli::try_parse_from([
            "workmesh", "submit", "10.0.0.1:24900", "build", "--mode", "schedule", "--long",
        ])
        .unwrap();
        match cli.command {
            Commands::Submit { mode, long, .. } => {
                assert_eq!(SubmitMode::from(mode), SubmitMode::Schedule);
                assert!(long);
            }
            _ => panic!("expected submit"),
        }

        assert!(Cli::try_parse_from(["workmesh", "ping"]).is_err());
    }

    #[tokio::test]
    async fn test_node_at_finds_self() {
        let node = Node::start(NodeSettings {
            node_id: Some("self".to_string()),
            network: NetworkConfig::loopback(),
            ..NodeSettings::default()
        })
        .await
        .unwrap();
        let client = Client::new(NetworkConfig::loopback());

        let endpoint = node.address().endpoint.clone();
        assert_eq!(node_at(&client, &endpoint).await.unwrap(), *node.address());

        node.shutdown().await;
    }
}
