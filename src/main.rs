//! devp2p Crawler
//!
//! Keeps a persistent view of the reachable nodes of an Ethereum-style
//! devp2p network.
//!
//! ## Commands
//!
//! - **crawl**: revalidate a node set and grow it from discovery, then save it
//! - **client**: like crawl, but peer with every compatible node and stay connected
//! - **probe**: handshake with one node and print its Hello
//! - **filter**: keep the nodes of a set that complete the Status exchange
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      DEVP2P CRAWLER                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Input set iterator     ──┐                                 │
//! │  Discovery lookups (v4) ──┼─→ fan-in ─→ worker pool         │
//! │                           ┘      │                          │
//! │  Node update  ←──────────────────┘                          │
//! │    skip recent → peer (client) → request record → score     │
//! │  Node set (JSON)        ←── saved at exit / periodically    │
//! │  Live peers (RLPx)      ←── served until closed             │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use anyhow::{bail, Context};
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod config;
mod crawler;
mod crypto;
mod discovery;
mod filter;
mod registry;
mod rlpx;
mod types;

#[cfg(test)]
mod tests;

use config::{parse_duration, CrawlerConfig};
use crawler::{Engine, EngineConfig, Mode};
use discovery::{Discv4Resolver, IterNodes, NodeIterator, RandomNodes};
use rlpx::{Dialer, DialerConfig, MessageCounter};
use types::{parse_bootnodes, Node};

/// devp2p crawler - node discovery, revalidation and peering
#[derive(Parser, Debug)]
#[command(name = "devp2p-crawler")]
#[command(version)]
#[command(about = "Crawl and revalidate devp2p network nodes", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Path to configuration file
    #[arg(short, long, global = true, default_value = "crawler.toml")]
    config: PathBuf,

    /// Data directory for the node key
    #[arg(short, long, global = true, default_value = "./data")]
    data_dir: PathBuf,

    /// Path to node key file
    #[arg(long, global = true)]
    key_file: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// UDP address for the discovery service
    #[arg(long, global = true)]
    discovery_addr: Option<SocketAddr>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Revalidate a node set and extend it from discovery
    Crawl(CrawlArgs),

    /// Crawl while peering with compatible nodes, until interrupted
    Client(ClientArgs),

    /// Handshake with a single node and print its Hello
    Probe {
        /// Node as enode:// URL, enr: record or 0x-prefixed record
        node: String,
    },

    /// Keep the nodes of a set that complete the eth handshake
    Filter(FilterArgs),

    /// Generate a new node key and exit
    GenerateKey,
}

#[derive(ClapArgs, Debug)]
struct CrawlArgs {
    /// Node set file, read at start and written at exit
    nodes_file: PathBuf,

    /// Comma-separated bootnodes
    #[arg(short, long)]
    bootnodes: Option<String>,

    /// Crawl time after the input set is revalidated (0 = unlimited)
    #[arg(short, long, value_parser = parse_duration)]
    timeout: Option<Duration>,

    /// Number of concurrent workers
    #[arg(short, long)]
    parallel: Option<usize>,

    /// Minimum time between two checks of the same node
    #[arg(short = 'r', long, value_parser = parse_duration)]
    revalidation_interval: Option<Duration>,
}

#[derive(ClapArgs, Debug)]
struct ClientArgs {
    /// Node set file, read at start and saved periodically
    nodes_file: PathBuf,

    /// Comma-separated bootnodes
    #[arg(short, long)]
    bootnodes: Option<String>,

    /// Network id peers must advertise
    #[arg(short, long)]
    network_id: Option<u64>,

    /// Number of concurrent workers
    #[arg(short, long)]
    parallel: Option<usize>,

    /// Minimum time between two checks of the same node
    #[arg(short = 'r', long, value_parser = parse_duration)]
    revalidation_interval: Option<Duration>,

    /// Time between node set saves
    #[arg(long, value_parser = parse_duration)]
    save_interval: Option<Duration>,
}

#[derive(ClapArgs, Debug)]
struct FilterArgs {
    /// Node set file to filter
    nodes_file: PathBuf,

    /// Keep only nodes on this network
    #[arg(short, long)]
    network_id: Option<u64>,

    /// Output file, `-` for stdout
    #[arg(short, long, default_value = "-")]
    output: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Logs go to stderr, stdout carries node sets
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with_writer(std::io::stderr)
        .init();

    info!("🌐 devp2p crawler v{}", env!("CARGO_PKG_VERSION"));

    match &args.command {
        Command::Crawl(cmd) => run_crawl(&args, cmd).await,
        Command::Client(cmd) => run_client(&args, cmd).await,
        Command::Probe { node } => run_probe(&args, node).await,
        Command::Filter(cmd) => run_filter(&args, cmd).await,
        Command::GenerateKey => generate_key(&args).await,
    }
}

fn load_config(args: &Args) -> anyhow::Result<CrawlerConfig> {
    let config = CrawlerConfig::load_or_default(&args.config)
        .with_context(|| format!("failed to load config {:?}", args.config))?;
    Ok(config.with_discovery_addr(args.discovery_addr))
}

fn bootnodes(config: &CrawlerConfig) -> anyhow::Result<Vec<Node>> {
    let nodes = parse_bootnodes(&config.bootnode_list())?;
    if nodes.is_empty() {
        bail!("no bootnodes given, use --bootnodes or the config file");
    }
    Ok(nodes)
}

/// Cancel `token` on Ctrl+C
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("🛑 Shutdown signal received");
            token.cancel();
        }
    });
}

async fn run_crawl(args: &Args, cmd: &CrawlArgs) -> anyhow::Result<()> {
    let config = load_config(args)?
        .with_bootnodes(cmd.bootnodes.as_deref())
        .with_parallel(cmd.parallel)
        .with_timeout(cmd.timeout)
        .with_revalidate_interval(cmd.revalidation_interval);
    config.validate()?;

    let bootnodes = bootnodes(&config)?;
    let key = crypto::load_or_generate_key(&args.data_dir, args.key_file.as_ref()).await?;
    info!("📝 Node ID: {}", crypto::node_id(&key));

    let nodes = registry::load(&cmd.nodes_file).await?;

    info!("⚙️  Crawl configuration:");
    info!("   Workers: {}", config.parallel);
    info!("   Revalidation interval: {:?}", config.revalidate_interval());
    match config.timeout() {
        Some(timeout) => info!("   Timeout: {:?}", timeout),
        None => info!("   Timeout: none"),
    }

    let disc = discovery::start_discovery(&key, config.discovery_addr, &bootnodes).await?;
    let input: Box<dyn NodeIterator> = Box::new(IterNodes::new(nodes.nodes()));
    let sources: Vec<Box<dyn NodeIterator>> = vec![Box::new(RandomNodes::new(disc.clone()))];

    let engine = Arc::new(Engine::new(
        EngineConfig::from_config(&config),
        Mode::Crawl,
        nodes,
        Arc::new(Discv4Resolver::new(disc.clone())),
    ));

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let result = engine.run(input, sources, cancel, None).await;
    disc.close().await;
    registry::save(&cmd.nodes_file, &result).await?;

    let stats = result.stats();
    info!(
        "💾 Saved {} nodes ({} with record, avg score {:.2}) to {:?}",
        stats.total_nodes, stats.with_record, stats.average_score, cmd.nodes_file
    );
    Ok(())
}

async fn run_client(args: &Args, cmd: &ClientArgs) -> anyhow::Result<()> {
    let config = load_config(args)?
        .with_bootnodes(cmd.bootnodes.as_deref())
        .with_network_id(cmd.network_id)
        .with_parallel(cmd.parallel)
        .with_revalidate_interval(cmd.revalidation_interval)
        .with_save_interval(cmd.save_interval);
    config.validate_client()?;

    let Some(network_id) = config.network_id else {
        bail!("--network-id is required in client mode");
    };

    let bootnodes = bootnodes(&config)?;
    let key = crypto::load_or_generate_key(&args.data_dir, args.key_file.as_ref()).await?;
    info!("📝 Node ID: {}", crypto::node_id(&key));

    let nodes = registry::load(&cmd.nodes_file).await?;

    info!("⚙️  Client configuration:");
    info!("   Network ID: {}", network_id);
    info!("   Workers: {}", config.parallel);
    info!("   Revalidation interval: {:?}", config.revalidate_interval());
    info!("   Save interval: {:?}", config.save_interval());

    let disc = discovery::start_discovery(&key, config.discovery_addr, &bootnodes).await?;
    let input: Box<dyn NodeIterator> = Box::new(IterNodes::new(nodes.nodes()));
    let sources: Vec<Box<dyn NodeIterator>> = vec![Box::new(RandomNodes::new(disc.clone()))];

    let sink = Arc::new(MessageCounter::new());
    let mode = Mode::Client {
        transport: Arc::new(Dialer::new(key, DialerConfig::from_config(&config))),
        sink: sink.clone(),
        network_id,
    };

    let engine = Arc::new(Engine::new(
        EngineConfig::from_config(&config),
        mode,
        nodes,
        Arc::new(Discv4Resolver::new(disc.clone())),
    ));

    info!("✅ Client started");
    info!("   Press Ctrl+C to shutdown gracefully");

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let result = engine.run(input, sources, cancel, Some(cmd.nodes_file.clone())).await;
    disc.close().await;
    registry::save(&cmd.nodes_file, &result).await?;

    info!("💾 Saved {} nodes to {:?}", result.len(), cmd.nodes_file);
    info!("📨 Messages received: {}", sink.snapshot());
    info!("👋 Client shutting down");
    Ok(())
}

async fn run_probe(args: &Args, node: &str) -> anyhow::Result<()> {
    let config = load_config(args)?;
    let node: Node = node.parse()?;
    let key = crypto::load_or_generate_key(&args.data_dir, args.key_file.as_ref()).await?;

    let hello = rlpx::probe::probe(&node, key, DialerConfig::from_config(&config)).await?;

    info!("🤝 Hello from {}", node.id);
    info!("   Protocol version: {}", hello.protocol_version);
    info!("   Client: {}", hello.client_name);
    for cap in &hello.capabilities {
        info!("   Capability: {}", cap);
    }
    info!("   Listen port: {}", hello.listen_port);
    Ok(())
}

async fn run_filter(args: &Args, cmd: &FilterArgs) -> anyhow::Result<()> {
    let config = load_config(args)?.with_network_id(cmd.network_id);
    config.validate()?;

    let key = crypto::load_or_generate_key(&args.data_dir, args.key_file.as_ref()).await?;
    let nodes = registry::load(&cmd.nodes_file).await?;
    if nodes.is_empty() {
        warn!("Node set {:?} is empty", cmd.nodes_file);
    }

    let transport = Arc::new(Dialer::new(key, DialerConfig::from_config(&config)));
    let filtered = filter::filter_nodes(&nodes, transport, config.parallel, config.network_id).await;

    registry::save(&cmd.output, &filtered).await?;
    Ok(())
}

/// Generate a new node key, refusing to overwrite an existing one
async fn generate_key(args: &Args) -> anyhow::Result<()> {
    let key_path = args
        .key_file
        .clone()
        .unwrap_or_else(|| args.data_dir.join(crypto::DEFAULT_KEY_FILE));

    if key_path.exists() {
        bail!("key file {:?} already exists", key_path);
    }

    let key = crypto::generate_key();
    crypto::save_key(&key, &key_path).await?;

    info!("🔑 New node key generated");
    info!("   Node ID: {}", crypto::node_id(&key));
    info!("   Public key: {}", hex::encode(types::raw_pubkey(&crypto::public_key(&key))));
    info!("   Key saved to: {:?}", key_path);
    Ok(())
}
