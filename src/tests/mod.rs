// Tests module
// Engine scenarios run against in-memory fakes of the discovery and
// transport seams.

pub mod engine;

use alloy_primitives::{FixedBytes, B256, U256};
use async_trait::async_trait;
use discv5::enr::CombinedKey;
use discv5::Enr;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::crawler::EngineConfig;
use crate::discovery::{NodeIterator, ResolveError, Resolver};
use crate::rlpx::messages::{Capability, ForkId, BASE_PROTOCOL_VERSION, ETH_VERSION};
use crate::rlpx::{Connection, DisconnectReason, Hello, MessageSink, RlpxError, Status, Transport};
use crate::types::Node;

// =========================================================================
// HELPER FUNCTIONS
// =========================================================================

/// A node with a fresh signed record on 127.0.0.1
pub fn test_node() -> Node {
    let key = CombinedKey::generate_secp256k1();
    let enr = Enr::builder()
        .ip4(Ipv4Addr::LOCALHOST)
        .tcp4(30303)
        .udp4(30303)
        .build(&key)
        .unwrap();
    Node::from_enr(enr).unwrap()
}

pub fn engine_config(timeout: Option<Duration>) -> EngineConfig {
    EngineConfig {
        revalidate_interval: Duration::from_secs(600),
        parallel: 4,
        timeout,
        save_interval: Duration::from_millis(100),
        status_interval: Duration::from_secs(1),
    }
}

pub fn test_status(network_id: u64) -> Status {
    Status {
        version: ETH_VERSION,
        network_id,
        total_difficulty: U256::ZERO,
        head: B256::ZERO,
        genesis: B256::ZERO,
        fork_id: ForkId { hash: FixedBytes::ZERO, next: 0 },
    }
}

// =========================================================================
// FAKES
// =========================================================================

/// Resolver that either always answers with the node itself or always fails
pub struct FakeResolver {
    fail: bool,
    calls: AtomicUsize,
}

impl FakeResolver {
    pub fn answering() -> Arc<Self> {
        Arc::new(Self { fail: false, calls: AtomicUsize::new(0) })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self { fail: true, calls: AtomicUsize::new(0) })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Resolver for FakeResolver {
    async fn request_enr(&self, node: &Node) -> Result<Node, ResolveError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            Err(ResolveError::Request("no response".to_string()))
        } else {
            Ok(node.clone())
        }
    }
}

/// Iterator that never yields and counts how often it is closed
pub struct PendingIterator {
    closes: Arc<AtomicUsize>,
}

impl PendingIterator {
    pub fn new(closes: Arc<AtomicUsize>) -> Self {
        Self { closes }
    }
}

#[async_trait]
impl NodeIterator for PendingIterator {
    async fn next_node(&mut self) -> Option<Node> {
        std::future::pending::<()>().await;
        None
    }

    fn close(&mut self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Transport whose peers all advertise one network id
///
/// Connections serve until `hangup` is cancelled. `open` counts
/// connections dialed and not yet closed.
pub struct FakeTransport {
    network_id: u64,
    dials: AtomicUsize,
    open: Arc<AtomicI64>,
    hangup: CancellationToken,
}

impl FakeTransport {
    pub fn new(network_id: u64) -> Arc<Self> {
        Arc::new(Self {
            network_id,
            dials: AtomicUsize::new(0),
            open: Arc::new(AtomicI64::new(0)),
            hangup: CancellationToken::new(),
        })
    }

    pub fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    pub fn open(&self) -> i64 {
        self.open.load(Ordering::SeqCst)
    }

    /// Make every serving peer disconnect
    pub fn hang_up(&self) {
        self.hangup.cancel();
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn dial(&self, _node: &Node) -> Result<Box<dyn Connection>, RlpxError> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        self.open.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeConnection {
            network_id: self.network_id,
            open: self.open.clone(),
            hangup: self.hangup.clone(),
            closed: false,
        }))
    }
}

struct FakeConnection {
    network_id: u64,
    open: Arc<AtomicI64>,
    hangup: CancellationToken,
    closed: bool,
}

#[async_trait]
impl Connection for FakeConnection {
    async fn peer(&mut self) -> Result<(Hello, Status), RlpxError> {
        let hello = Hello {
            protocol_version: BASE_PROTOCOL_VERSION,
            client_name: "fake/v0".to_string(),
            capabilities: vec![Capability::eth()],
            listen_port: 30303,
            id: [1u8; 64],
            rest: Default::default(),
        };
        Ok((hello, test_status(self.network_id)))
    }

    async fn read_and_serve(&mut self, _sink: Arc<dyn MessageSink>) -> Result<(), RlpxError> {
        self.hangup.cancelled().await;
        Err(RlpxError::Disconnected(DisconnectReason::ClientQuitting))
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.open.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// Poll `cond` every 10ms for up to 5s
pub async fn eventually<F, Fut>(mut cond: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..500 {
        if cond().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
