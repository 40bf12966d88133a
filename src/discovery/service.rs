//! discv4 Discovery Service
//!
//! One UDP socket shared by the receive loop, the record resolver and the
//! random lookups. Replies are routed to waiting requests by sender and
//! packet type; requests wait for the endpoint proof (ping/pong in both
//! directions) before asking a node anything.

use alloy_primitives::{keccak256, B256};
use anyhow::{anyhow, bail};
use async_trait::async_trait;
use discv5::enr::CombinedKey;
use discv5::Enr;
use rand::RngCore;
use secp256k1::{All, PublicKey, Secp256k1, SecretKey};
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::packet::{
    decode_packet, encode_packet, expiration, kind, EnrRequest, EnrResponse, Endpoint, FindNode, Message,
    NeighbourRecord, Neighbours, Packet, Ping, Pong, MAX_NEIGHBOURS, MAX_PACKET_SIZE,
};
use super::table::{distance_cmp, Table, BUCKET_SIZE};
use super::{DiscoveryError, NodeIterator, ResolveError, Resolver};
use crate::types::{Node, NodeId, RawPublicKey};

/// Time allowed for each reply
const RESPONSE_TIMEOUT: Duration = Duration::from_millis(500);

/// A completed ping/pong stays valid this long
const BOND_EXPIRATION: Duration = Duration::from_secs(24 * 60 * 60);

/// Concurrent FindNode queries per lookup round
const ALPHA: usize = 3;

/// Pause between lookups that found nothing
const LOOKUP_BACKOFF: Duration = Duration::from_secs(2);

/// Last endpoint proof in each direction
#[derive(Debug, Default, Clone, Copy)]
struct Bond {
    /// They answered our ping
    pong_received: Option<Instant>,
    /// They pinged us, so they hold our endpoint proof
    ping_received: Option<Instant>,
}

fn fresh(at: Option<Instant>) -> bool {
    at.is_some_and(|t| t.elapsed() < BOND_EXPIRATION)
}

struct Pending {
    id: u64,
    from: NodeId,
    kind: u8,
    tx: mpsc::UnboundedSender<Message>,
}

/// Bind and start the discovery service
///
/// Fails when bootnodes were given but none of them has a UDP endpoint.
pub async fn start_discovery(key: &SecretKey, addr: SocketAddr, bootnodes: &[Node]) -> anyhow::Result<Arc<Discv4>> {
    let usable: Vec<Node> = bootnodes
        .iter()
        .filter(|node| {
            let ok = node.udp_addr().is_some();
            if !ok {
                warn!("Bootnode {} has no UDP endpoint, skipping for discovery", node.id.short());
            }
            ok
        })
        .cloned()
        .collect();
    if !bootnodes.is_empty() && usable.is_empty() {
        bail!("none of the {} bootnodes has a UDP endpoint", bootnodes.len());
    }

    let socket = UdpSocket::bind(addr)
        .await
        .map_err(|e| anyhow!("failed to bind discovery socket {}: {}", addr, e))?;
    let local_addr = socket.local_addr()?;

    let disc = Arc::new(Discv4::new(socket, *key, local_addr, usable)?);
    tokio::spawn(disc.clone().run());

    info!("🔭 Discovery listening on {}", local_addr);
    info!("   Local node: {}", disc.local_node().enode_url());
    info!("   Local record: {}", disc.local_record.to_base64());
    info!("   Bootnodes: {}", disc.bootnodes.len());

    Ok(disc)
}

pub struct Discv4 {
    socket: UdpSocket,
    secp: Secp256k1<All>,
    key: SecretKey,
    pubkey: PublicKey,
    local_id: NodeId,
    local_addr: SocketAddr,
    local_record: Enr,
    bootnodes: Vec<Node>,
    table: RwLock<Table>,
    bonds: Mutex<HashMap<NodeId, Bond>>,
    pending: std::sync::Mutex<Vec<Pending>>,
    next_pending: AtomicU64,
    shutdown: CancellationToken,
}

impl Discv4 {
    fn new(socket: UdpSocket, key: SecretKey, local_addr: SocketAddr, bootnodes: Vec<Node>) -> anyhow::Result<Self> {
        let secp = Secp256k1::new();
        let pubkey = PublicKey::from_secret_key(&secp, &key);

        let mut secret = key.secret_bytes();
        let enr_key = CombinedKey::secp256k1_from_bytes(&mut secret)
            .map_err(|e| anyhow!("invalid node key: {:?}", e))?;
        let mut builder = Enr::builder();
        if !local_addr.ip().is_unspecified() {
            builder.ip(local_addr.ip());
        }
        if local_addr.is_ipv4() {
            builder.udp4(local_addr.port());
        } else {
            builder.udp6(local_addr.port());
        }
        let local_record = builder
            .build(&enr_key)
            .map_err(|e| anyhow!("failed to build local record: {:?}", e))?;

        let local_id = NodeId::from_pubkey(&pubkey);
        Ok(Self {
            socket,
            secp,
            key,
            pubkey,
            local_id,
            local_addr,
            local_record,
            bootnodes,
            table: RwLock::new(Table::new(local_id)),
            bonds: Mutex::new(HashMap::new()),
            pending: std::sync::Mutex::new(Vec::new()),
            next_pending: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        })
    }

    /// Our own node, as others reach it
    pub fn local_node(&self) -> Node {
        Node::new(
            self.pubkey,
            Some(self.local_addr.ip()),
            None,
            Some(self.local_addr.port()),
        )
    }

    /// Stop the receive loop
    pub async fn close(&self) {
        let known = self.table.read().await.len();
        self.shutdown.cancel();
        info!("🔭 Discovery stopped, {} nodes in table", known);
    }

    // =========================================================================
    // RECEIVE LOOP
    // =========================================================================

    async fn run(self: Arc<Self>) {
        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        loop {
            let (len, from) = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok(received) => received,
                    Err(e) => {
                        trace!("Discovery receive error: {}", e);
                        continue;
                    }
                },
            };

            match decode_packet(&self.secp, &buf[..len]) {
                Ok(packet) => self.clone().handle(packet, from).await,
                Err(e) => trace!("Dropping packet from {}: {}", from, e),
            }
        }
    }

    async fn handle(self: Arc<Self>, packet: Packet, from: SocketAddr) {
        let sender = NodeId::from_pubkey(&packet.sender);

        match &packet.message {
            Message::Ping(ping) => {
                let pong = Message::Pong(Pong {
                    to: Endpoint::new(from, ping.from.tcp_port),
                    ping_hash: packet.hash,
                    expiration: expiration(),
                    enr_seq: Some(self.local_record.seq()),
                });
                self.send_logged(from, &pong).await;

                let bonded = {
                    let mut bonds = self.bonds.lock().await;
                    let bond = bonds.entry(sender).or_default();
                    bond.ping_received = Some(Instant::now());
                    fresh(bond.pong_received)
                };

                // Verify the sender in turn, so it can query us and we can query it
                if !bonded {
                    let node = Node::new(packet.sender, Some(from.ip()), Some(ping.from.tcp_port), Some(from.port()));
                    let disc = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = disc.ping(&node, from).await {
                            trace!("Ping back to {} failed: {}", node.id.short(), e);
                        }
                    });
                }
            }
            Message::Pong(_) => {
                self.bonds.lock().await.entry(sender).or_default().pong_received = Some(Instant::now());
            }
            Message::FindNode(request) => {
                if !self.is_bonded(&sender).await {
                    trace!("Ignoring FindNode from unbonded {}", sender.short());
                } else {
                    let target = NodeId::new(keccak256(request.target).0);
                    let closest = self.table.read().await.closest(&target, BUCKET_SIZE);
                    let records: Vec<NeighbourRecord> = closest.iter().filter_map(NeighbourRecord::from_node).collect();
                    for chunk in records.chunks(MAX_NEIGHBOURS) {
                        let reply = Message::Neighbours(Neighbours {
                            nodes: chunk.to_vec(),
                            expiration: expiration(),
                        });
                        self.send_logged(from, &reply).await;
                    }
                }
            }
            Message::EnrRequest(_) => {
                if self.is_bonded(&sender).await {
                    let reply = Message::EnrResponse(EnrResponse {
                        request_hash: packet.hash,
                        record: self.local_record.clone(),
                    });
                    self.send_logged(from, &reply).await;
                }
            }
            Message::Neighbours(_) | Message::EnrResponse(_) => {}
        }

        self.deliver(sender, packet.message);
    }

    /// Hand a reply to every request waiting on it
    fn deliver(&self, from: NodeId, message: Message) {
        let pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        for waiter in pending.iter().filter(|p| p.from == from && p.kind == message.kind()) {
            let _ = waiter.tx.send(message.clone());
        }
    }

    // =========================================================================
    // REQUESTS
    // =========================================================================

    async fn send(&self, to: SocketAddr, message: &Message) -> Result<B256, DiscoveryError> {
        let (packet, hash) = encode_packet(&self.secp, &self.key, message)?;
        self.socket.send_to(&packet, to).await?;
        Ok(hash)
    }

    async fn send_logged(&self, to: SocketAddr, message: &Message) {
        if let Err(e) = self.send(to, message).await {
            trace!("Failed to send {:#x} to {}: {}", message.kind(), to, e);
        }
    }

    /// Register interest in replies of `kind` from `from`, before sending the request
    fn expect(&self, from: NodeId, kind: u8) -> Expect<'_> {
        let id = self.next_pending.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Pending { id, from, kind, tx });
        Expect { disc: self, id, rx }
    }

    async fn is_bonded(&self, id: &NodeId) -> bool {
        self.bonds.lock().await.get(id).is_some_and(|b| fresh(b.pong_received))
    }

    async fn pinged_us(&self, id: &NodeId) -> bool {
        self.bonds.lock().await.get(id).is_some_and(|b| fresh(b.ping_received))
    }

    /// Ping and wait for the Pong, then give the node time to ping us back
    async fn ping(&self, node: &Node, addr: SocketAddr) -> Result<(), DiscoveryError> {
        let mut pong = self.expect(node.id, kind::PONG);
        let mut their_ping = self.expect(node.id, kind::PING);

        let ping = Message::Ping(Ping {
            from: Endpoint::new(self.local_addr, 0),
            to: Endpoint::new(addr, node.tcp_port.unwrap_or(0)),
            expiration: expiration(),
            enr_seq: Some(self.local_record.seq()),
        });
        let hash = self.send(addr, &ping).await?;

        let answered = pong
            .recv("pong", |m| match m {
                Message::Pong(p) if p.ping_hash == hash => Some(()),
                _ => None,
            })
            .await;
        if let Err(e) = answered {
            self.table.write().await.remove(&node.id);
            return Err(e);
        }

        if !self.pinged_us(&node.id).await {
            let _ = their_ping.recv("ping", |m| matches!(m, Message::Ping(_)).then_some(())).await;
        }

        self.table.write().await.add(node.clone());
        Ok(())
    }

    async fn ensure_bond(&self, node: &Node) -> Result<SocketAddr, DiscoveryError> {
        let addr = node.udp_addr().ok_or(DiscoveryError::NoEndpoint)?;
        if !self.is_bonded(&node.id).await {
            self.ping(node, addr).await?;
        }
        Ok(addr)
    }

    /// Ask `node` for the nodes it knows closest to `target`
    pub async fn find_node(&self, node: &Node, target: RawPublicKey) -> Result<Vec<Node>, DiscoveryError> {
        let addr = self.ensure_bond(node).await?;
        let mut replies = self.expect(node.id, kind::NEIGHBOURS);
        self.send(addr, &Message::FindNode(FindNode { target, expiration: expiration() }))
            .await?;

        // Replies arrive in several packets; collect until a bucket is full or time is up
        let mut found = Vec::new();
        let mut answered = false;
        let deadline = Instant::now() + RESPONSE_TIMEOUT;
        while found.len() < BUCKET_SIZE {
            match tokio::time::timeout_at(deadline, replies.rx.recv()).await {
                Ok(Some(Message::Neighbours(reply))) => {
                    answered = true;
                    found.extend(reply.nodes.iter().filter_map(NeighbourRecord::to_node));
                }
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => break,
            }
        }

        if answered {
            Ok(found)
        } else {
            Err(DiscoveryError::Timeout("neighbours"))
        }
    }

    /// Fetch the current signed record of `node`
    pub async fn request_enr(&self, node: &Node) -> Result<Enr, DiscoveryError> {
        let addr = self.ensure_bond(node).await?;
        let mut replies = self.expect(node.id, kind::ENR_RESPONSE);
        let hash = self
            .send(addr, &Message::EnrRequest(EnrRequest { expiration: expiration() }))
            .await?;

        replies
            .recv("enr response", |m| match m {
                Message::EnrResponse(r) if r.request_hash == hash => Some(r.record),
                _ => None,
            })
            .await
    }

    /// Iterative lookup towards `target`, returning every node learned on the way
    pub async fn lookup(&self, target: RawPublicKey) -> Vec<Node> {
        let target_id = NodeId::new(keccak256(target).0);

        let mut candidates = self.table.read().await.closest(&target_id, BUCKET_SIZE);
        if candidates.is_empty() {
            candidates = self.bootnodes.clone();
        }

        let mut seen: HashSet<NodeId> = candidates.iter().map(|n| n.id).collect();
        seen.insert(self.local_id);
        let mut asked: HashSet<NodeId> = HashSet::new();
        let mut found = Vec::new();

        loop {
            candidates.sort_by(|a, b| distance_cmp(&target_id, &a.id, &b.id));
            candidates.truncate(BUCKET_SIZE);

            let batch: Vec<Node> = candidates
                .iter()
                .filter(|n| !asked.contains(&n.id))
                .take(ALPHA)
                .cloned()
                .collect();
            if batch.is_empty() {
                break;
            }
            asked.extend(batch.iter().map(|n| n.id));

            let replies = futures::future::join_all(batch.iter().map(|n| self.find_node(n, target))).await;
            for (node, reply) in batch.iter().zip(replies) {
                match reply {
                    Ok(nodes) => {
                        for neighbour in nodes {
                            if seen.insert(neighbour.id) {
                                candidates.push(neighbour.clone());
                                found.push(neighbour);
                            }
                        }
                    }
                    Err(e) => trace!("FindNode to {} failed: {}", node.id.short(), e),
                }
            }
        }

        trace!("Lookup asked {} nodes, learned {}", asked.len(), found.len());
        found
    }
}

/// Replies routed to one waiting request; unregisters itself on drop
struct Expect<'a> {
    disc: &'a Discv4,
    id: u64,
    rx: mpsc::UnboundedReceiver<Message>,
}

impl Expect<'_> {
    /// First reply `accept` maps to a value, within the response timeout
    async fn recv<T>(&mut self, what: &'static str, mut accept: impl FnMut(Message) -> Option<T>) -> Result<T, DiscoveryError> {
        let deadline = Instant::now() + RESPONSE_TIMEOUT;
        loop {
            match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                Ok(Some(message)) => {
                    if let Some(value) = accept(message) {
                        return Ok(value);
                    }
                }
                Ok(None) | Err(_) => return Err(DiscoveryError::Timeout(what)),
            }
        }
    }
}

impl Drop for Expect<'_> {
    fn drop(&mut self) {
        self.disc
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|p| p.id != self.id);
    }
}

// =============================================================================
// RESOLVER
// =============================================================================

/// Resolver that asks nodes for their record with an ENRRequest
pub struct Discv4Resolver {
    disc: Arc<Discv4>,
}

impl Discv4Resolver {
    pub fn new(disc: Arc<Discv4>) -> Self {
        Self { disc }
    }
}

#[async_trait]
impl Resolver for Discv4Resolver {
    async fn request_enr(&self, node: &Node) -> Result<Node, ResolveError> {
        let record = self.disc.request_enr(node).await?;
        let fresh = Node::from_enr(record)?;
        if fresh.id != node.id {
            return Err(ResolveError::WrongSigner(fresh.id));
        }
        Ok(fresh)
    }
}

// =============================================================================
// RANDOM LOOKUPS
// =============================================================================

fn random_target() -> RawPublicKey {
    let mut target = [0u8; 64];
    rand::thread_rng().fill_bytes(&mut target);
    target
}

/// Endless iterator over the nodes learned by random-target lookups
pub struct RandomNodes {
    disc: Arc<Discv4>,
    buffer: VecDeque<Node>,
    closed: bool,
}

impl RandomNodes {
    pub fn new(disc: Arc<Discv4>) -> Self {
        Self {
            disc,
            buffer: VecDeque::new(),
            closed: false,
        }
    }
}

#[async_trait]
impl NodeIterator for RandomNodes {
    async fn next_node(&mut self) -> Option<Node> {
        loop {
            if self.closed {
                return None;
            }
            if let Some(node) = self.buffer.pop_front() {
                return Some(node);
            }

            let found = self.disc.lookup(random_target()).await;
            if found.is_empty() {
                debug!("Random lookup found no nodes");
                tokio::time::sleep(LOOKUP_BACKOFF).await;
            } else {
                self.buffer.extend(found);
            }
        }
    }

    fn close(&mut self) {
        self.closed = true;
        self.buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> SecretKey {
        SecretKey::new(&mut rand::thread_rng())
    }

    fn loopback() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 0))
    }

    #[tokio::test]
    async fn test_enode_only_bootnodes_reach_lookup() {
        let b = start_discovery(&key(), loopback(), &[]).await.unwrap();
        let enode: Node = b.local_node().enode_url().parse().unwrap();
        assert!(enode.record.is_none());

        let a = start_discovery(&key(), loopback(), &[enode]).await.unwrap();
        assert_eq!(a.bootnodes.len(), 1);

        // The bootnode answers, so the lookup leaves it in our table
        a.lookup(random_target()).await;
        assert_eq!(a.table.read().await.len(), 1);

        a.close().await;
        b.close().await;
    }

    #[tokio::test]
    async fn test_bootnodes_without_udp_endpoint_fail() {
        let secp = Secp256k1::new();
        let (_, pk) = secp.generate_keypair(&mut rand::thread_rng());
        let unreachable = Node::new(pk, None, None, None);

        let result = start_discovery(&key(), loopback(), &[unreachable]).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_request_enr_over_loopback() {
        let b = start_discovery(&key(), loopback(), &[]).await.unwrap();
        let b_node = b.local_node();
        let a = start_discovery(&key(), loopback(), &[b_node.clone()]).await.unwrap();

        let resolver = Discv4Resolver::new(a.clone());
        let fresh = resolver.request_enr(&b_node).await.unwrap();
        assert_eq!(fresh.id, b_node.id);
        assert_eq!(fresh.seq(), b.local_record.seq());
        assert_eq!(fresh.udp_port, Some(b_node.udp_port.unwrap()));

        a.close().await;
        b.close().await;
    }

    #[tokio::test]
    async fn test_lookup_learns_nodes_from_bootnode() {
        let boot = start_discovery(&key(), loopback(), &[]).await.unwrap();
        let boot_node = boot.local_node();

        // A third node introduces itself to the bootnode first
        let c = start_discovery(&key(), loopback(), &[boot_node.clone()]).await.unwrap();
        c.request_enr(&boot_node).await.unwrap();
        let c_id = c.local_node().id;
        let mut known = false;
        for _ in 0..50 {
            if boot.table.read().await.len() > 0 {
                known = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(known);

        let a = start_discovery(&key(), loopback(), &[boot_node]).await.unwrap();
        let found = a.lookup(random_target()).await;
        assert!(found.iter().any(|n| n.id == c_id));

        a.close().await;
        c.close().await;
        boot.close().await;
    }

    #[tokio::test]
    async fn test_request_enr_without_endpoint() {
        let a = start_discovery(&key(), loopback(), &[]).await.unwrap();
        let secp = Secp256k1::new();
        let (_, pk) = secp.generate_keypair(&mut rand::thread_rng());

        let result = a.request_enr(&Node::new(pk, None, None, None)).await;
        assert!(matches!(result, Err(DiscoveryError::NoEndpoint)));
        a.close().await;
    }
}
