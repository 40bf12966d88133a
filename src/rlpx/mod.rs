//! RLPx Transport Module
//!
//! Encrypted point-to-point connections to devp2p peers: dialing, the
//! Hello/Status handshake and serving a live peer's messages.
//!
//! The engine only sees the [`Transport`] and [`Connection`] traits.

use async_trait::async_trait;
use std::sync::Arc;

use crate::types::Node;

mod conn;
pub mod ecies;
pub mod messages;
pub mod probe;
pub mod sink;

pub use conn::{Dialer, DialerConfig};
pub use messages::{DisconnectReason, Hello, Status};
pub use sink::{MessageCounter, MessageSink};

#[derive(Debug, thiserror::Error)]
pub enum RlpxError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0} timed out")]
    Timeout(&'static str),

    #[error("handshake failed: {0}")]
    Auth(&'static str),

    #[error("frame mac mismatch")]
    MacMismatch,

    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("rlp decode error: {0}")]
    Rlp(#[from] alloy_rlp::Error),

    #[error("snappy error: {0}")]
    Snappy(#[from] snap::Error),

    #[error("unexpected message code {0:#x}")]
    UnexpectedMessage(u64),

    #[error("disconnect received: {0}")]
    Disconnected(DisconnectReason),

    #[error("invalid disconnect message")]
    InvalidDisconnect,

    #[error("peer does not support eth")]
    NoEthCapability,

    #[error("node has no tcp endpoint")]
    NoEndpoint,

    #[error("network id mismatch: expected {expected}, got {actual}")]
    NetworkMismatch { expected: u64, actual: u64 },
}

/// Opens authenticated connections to nodes
#[async_trait]
pub trait Transport: Send + Sync {
    async fn dial(&self, node: &Node) -> Result<Box<dyn Connection>, RlpxError>;
}

/// One established connection
#[async_trait]
pub trait Connection: Send {
    /// Protocol handshake followed by the Status exchange
    async fn peer(&mut self) -> Result<(Hello, Status), RlpxError>;

    /// Serve the peer until the connection fails or is closed
    async fn read_and_serve(&mut self, sink: Arc<dyn MessageSink>) -> Result<(), RlpxError>;

    async fn close(&mut self);
}
