//! Discovery Module
//!
//! Capability seams between the crawler engine and the discv4 UDP
//! protocol: a [`Resolver`] that refreshes one node's signed record, and
//! [`NodeIterator`]s that produce candidate nodes.

use async_trait::async_trait;

use crate::types::{Node, NodeId};

mod packet;
mod service;
mod table;

pub use packet::PacketError;
pub use service::{start_discovery, Discv4, Discv4Resolver, RandomNodes};

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("packet error: {0}")]
    Packet(#[from] PacketError),

    #[error("node has no udp endpoint")]
    NoEndpoint,

    #[error("no {0} received")]
    Timeout(&'static str),
}

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("record request failed: {0}")]
    Request(String),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error("record signed by another node ({0})")]
    WrongSigner(NodeId),

    #[error("invalid record returned: {0}")]
    InvalidRecord(#[from] crate::types::NodeParseError),
}

/// Refreshes a node's signed record over the discovery protocol
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Ask the node for its current record
    async fn request_enr(&self, node: &Node) -> Result<Node, ResolveError>;
}

/// A source of discovered nodes
#[async_trait]
pub trait NodeIterator: Send {
    /// Next node, or `None` once the source is exhausted
    async fn next_node(&mut self) -> Option<Node>;

    /// Release the source. Called exactly once, after the last `next_node`.
    fn close(&mut self);
}

/// Iterator over a fixed list of nodes
pub struct IterNodes {
    nodes: std::vec::IntoIter<Node>,
}

impl IterNodes {
    pub fn new(nodes: Vec<Node>) -> Self {
        Self { nodes: nodes.into_iter() }
    }
}

#[async_trait]
impl NodeIterator for IterNodes {
    async fn next_node(&mut self) -> Option<Node> {
        self.nodes.next()
    }

    fn close(&mut self) {
        self.nodes = Vec::new().into_iter();
    }
}
