//! Crawler Engine
//!
//! Merges the node sources, runs a pool of workers over the merged stream
//! and keeps the node set current.
//!
//! Two modes share the loop:
//! - **crawl**: refresh records only; ends when the sources are exhausted
//!   or the crawl timeout fires after the input set has been revalidated.
//! - **client**: peer with every compatible node before refreshing its
//!   record, keep those connections open and save the set periodically;
//!   runs until cancelled.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use crate::config::CrawlerConfig;
use crate::discovery::{NodeIterator, Resolver};
use crate::registry::{self, NodeSet};
use crate::rlpx::{MessageSink, Transport};
use crate::types::Node;

mod fanin;
pub mod metrics;
mod peers;
mod update;

pub use metrics::{Outcome, UpdateCounters, UpdateCounts};
pub use peers::LivePeers;

/// Shortest status or save period
const MIN_TICK: Duration = Duration::from_millis(100);

/// Engine parameters, fixed for one run
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub revalidate_interval: Duration,
    pub parallel: usize,
    /// Crawl mode: stop this long after the input set is done
    pub timeout: Option<Duration>,
    pub save_interval: Duration,
    pub status_interval: Duration,
}

impl EngineConfig {
    pub fn from_config(config: &CrawlerConfig) -> Self {
        Self {
            revalidate_interval: config.revalidate_interval(),
            parallel: config.parallel.max(1),
            timeout: config.timeout(),
            save_interval: config.save_interval(),
            status_interval: Duration::from_secs(config.status_interval_secs),
        }
    }
}

/// What the engine does with each node beyond refreshing its record
pub enum Mode {
    Crawl,
    Client {
        transport: Arc<dyn Transport>,
        sink: Arc<dyn MessageSink>,
        network_id: u64,
    },
}

pub struct Engine {
    config: EngineConfig,
    mode: Mode,
    nodes: RwLock<NodeSet>,
    resolver: Arc<dyn Resolver>,
    counters: UpdateCounters,
    peers: Arc<LivePeers>,
    peer_tasks: TaskTracker,
    shutdown: CancellationToken,
}

impl Engine {
    pub fn new(config: EngineConfig, mode: Mode, nodes: NodeSet, resolver: Arc<dyn Resolver>) -> Self {
        Self {
            config,
            mode,
            nodes: RwLock::new(nodes),
            resolver,
            counters: UpdateCounters::new(),
            peers: Arc::new(LivePeers::new()),
            peer_tasks: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn counts(&self) -> UpdateCounts {
        self.counters.snapshot()
    }

    pub async fn live_peers(&self) -> usize {
        self.peers.len().await
    }

    /// Copy of the current node set
    pub async fn snapshot(&self) -> NodeSet {
        self.nodes.read().await.clone()
    }

    /// Run until the sources end, the crawl timeout fires or `cancel` is triggered
    ///
    /// `input` walks the loaded node set; `discovery` are the live sources.
    /// In client mode the set is saved to `save_path` every save interval.
    /// Returns the final node set once every worker and peer has stopped.
    pub async fn run(
        self: Arc<Self>,
        input: Box<dyn NodeIterator>,
        discovery: Vec<Box<dyn NodeIterator>>,
        cancel: CancellationToken,
        save_path: Option<PathBuf>,
    ) -> NodeSet {
        let closed = CancellationToken::new();
        let mut fanin = fanin::spawn(input, discovery, closed.clone());
        let workers = self.clone().spawn_workers(fanin.nodes, closed.clone());

        let is_client = matches!(self.mode, Mode::Client { .. });
        let status_every = self.config.status_interval.max(MIN_TICK);
        let save_every = self.config.save_interval.max(MIN_TICK);
        let mut status = tokio::time::interval_at(Instant::now() + status_every, status_every);
        let mut save = tokio::time::interval_at(Instant::now() + save_every, save_every);
        let saving = is_client && save_path.is_some();

        let mut input_done = false;
        let mut sources_done = false;
        let mut deadline: Option<Instant> = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("🛑 Crawl cancelled");
                    break;
                }
                _ = &mut fanin.input_done, if !input_done => {
                    input_done = true;
                    info!("✅ Input set revalidated");
                    if !is_client {
                        deadline = self.config.timeout.map(|t| Instant::now() + t);
                    }
                }
                _ = fanin.tasks.wait(), if !sources_done => {
                    sources_done = true;
                    info!("✅ All node sources exhausted");
                    if !is_client {
                        break;
                    }
                }
                _ = wait_deadline(deadline) => {
                    info!("⏱️  Crawl timeout reached");
                    break;
                }
                _ = status.tick() => {
                    self.log_status().await;
                }
                _ = save.tick(), if saving => {
                    if let Some(path) = &save_path {
                        self.save_to(path).await;
                    }
                }
            }
        }

        // Exhausted sources leave the workers to drain the channel; anything else stops them now
        if !sources_done || is_client {
            closed.cancel();
        }
        fanin.tasks.wait().await;
        workers.wait().await;

        self.shutdown.cancel();
        self.peer_tasks.close();
        self.peer_tasks.wait().await;

        self.log_status().await;
        self.snapshot().await
    }

    fn spawn_workers(self: Arc<Self>, nodes: mpsc::Receiver<Node>, closed: CancellationToken) -> TaskTracker {
        let nodes = Arc::new(Mutex::new(nodes));
        let workers = TaskTracker::new();

        for _ in 0..self.config.parallel {
            let engine = self.clone();
            let nodes = nodes.clone();
            let closed = closed.clone();
            workers.spawn(async move {
                loop {
                    let node = tokio::select! {
                        _ = closed.cancelled() => break,
                        node = async { nodes.lock().await.recv().await } => node,
                    };
                    let Some(node) = node else { break };
                    engine.update_node(node).await;
                }
            });
        }

        workers.close();
        workers
    }

    /// Encode under the read lock, write after releasing it
    async fn save_to(&self, path: &Path) {
        let encoded = {
            let nodes = self.nodes.read().await;
            registry::encode(&nodes)
        };

        let result = match encoded {
            Ok(content) => registry::write(path, &content).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => debug!("💾 Node set saved to {:?}", path),
            Err(e) => error!("Failed to save node set: {}", e),
        }
    }

    /// Node count and update outcomes, plus live peers and message totals in client mode
    pub async fn status_line(&self) -> String {
        let total = self.nodes.read().await.len();
        let counts = self.counts();

        match &self.mode {
            Mode::Crawl => format!("{} nodes, {}", total, counts),
            Mode::Client { sink, .. } => format!(
                "{} nodes, {} live peers, {}, messages: {}",
                total,
                self.live_peers().await,
                counts,
                sink.totals()
            ),
        }
    }

    async fn log_status(&self) {
        info!("📊 Status: {}", self.status_line().await);
    }
}

async fn wait_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}
