//! Node Update
//!
//! The per-node state machine run by every worker: skip nodes checked
//! recently, peer first in client mode, refresh the record, then score
//! and store or evict.

use std::sync::Arc;
use tracing::{debug, info};

use super::metrics::Outcome;
use super::{Engine, Mode};
use crate::registry::scoring::{self, Refresh};
use crate::rlpx::{MessageSink, RlpxError, Transport};
use crate::types::Node;

impl Engine {
    /// Run one node through the state machine and count the outcome
    pub async fn update_node(&self, node: Node) -> Outcome {
        let outcome = self.classify(node).await;
        self.counters.record(outcome);
        outcome
    }

    async fn classify(&self, node: Node) -> Outcome {
        let now = scoring::now();

        {
            let nodes = self.nodes.read().await;
            let last_check = nodes.get(&node.id).and_then(|entry| entry.last_check);
            if scoring::is_recent(last_check, now, self.config.revalidate_interval) {
                return Outcome::SkippedRecent;
            }
        }

        if let Mode::Client { transport, sink, network_id } = &self.mode {
            if let Err(e) = self.peer_check(&node, transport, sink, *network_id).await {
                debug!("Peer check of {} failed: {}", node.id.short(), e);
                return Outcome::SkippedIncompatible;
            }
        }

        let refreshed = match self.resolver.request_enr(&node).await {
            Ok(refreshed) => Some(refreshed),
            Err(e) => {
                debug!("Record request to {} failed: {}", node.id.short(), e);
                None
            }
        };

        // Re-read under the write lock: another worker may have updated this node meanwhile
        let mut nodes = self.nodes.write().await;
        let mut entry = nodes.get(&node.id).cloned().unwrap_or_default();

        match scoring::apply(&mut entry, refreshed.as_ref(), now) {
            Refresh::Added => {
                nodes.insert(node.id, entry);
                Outcome::Added
            }
            Refresh::Updated | Refresh::Decayed => {
                nodes.insert(node.id, entry);
                Outcome::Updated
            }
            Refresh::Evicted => {
                nodes.remove(&node.id);
                Outcome::Removed
            }
            Refresh::NeverResponded => Outcome::SkippedIncompatible,
        }
    }

    /// Make sure a live, compatible connection to `node` exists
    ///
    /// Dials and runs the handshake unless the node is already a live peer.
    /// On a matching network id the connection is kept and served in the
    /// background until it fails or the engine shuts down.
    async fn peer_check(
        &self,
        node: &Node,
        transport: &Arc<dyn Transport>,
        sink: &Arc<dyn MessageSink>,
        network_id: u64,
    ) -> Result<(), RlpxError> {
        if self.peers.contains(&node.id).await {
            return Ok(());
        }

        let mut conn = transport.dial(node).await?;

        let (hello, status) = match conn.peer().await {
            Ok(handshake) => handshake,
            Err(e) => {
                conn.close().await;
                return Err(e);
            }
        };

        if status.network_id != network_id {
            conn.close().await;
            return Err(RlpxError::NetworkMismatch { expected: network_id, actual: status.network_id });
        }

        if !self.peers.insert(node.id).await {
            // Lost the race to another worker peering the same node
            conn.close().await;
            return Ok(());
        }

        info!("🤝 Peered with {} ({}, {})", node.id.short(), hello.client_name, status);

        let peers = self.peers.clone();
        let sink = sink.clone();
        let shutdown = self.shutdown.clone();
        let id = node.id;

        self.peer_tasks.spawn(async move {
            tokio::select! {
                result = conn.read_and_serve(sink) => {
                    if let Err(e) = result {
                        debug!("Peer {} dropped: {}", id.short(), e);
                    }
                }
                _ = shutdown.cancelled() => {}
            }
            conn.close().await;
            peers.remove(&id).await;
        });

        Ok(())
    }
}
