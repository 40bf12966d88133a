//! Node Set Filter
//!
//! Handshake with every recorded node of a set and keep the ones that
//! answer, optionally only those on a given network.

use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tracing::{debug, info};

use crate::registry::NodeSet;
use crate::rlpx::{RlpxError, Status, Transport};
use crate::types::Node;

/// Dial and peer every node with a record, at most `parallel` at a time
///
/// Returns the entries of the nodes that completed the Status exchange and,
/// when `network_id` is set, advertised that network.
pub async fn filter_nodes(
    nodes: &NodeSet,
    transport: Arc<dyn Transport>,
    parallel: usize,
    network_id: Option<u64>,
) -> NodeSet {
    let candidates = nodes.nodes();
    info!("🔍 Checking {} nodes ({} in parallel)", candidates.len(), parallel);

    let matched: Vec<Node> = stream::iter(candidates)
        .map(|node| {
            let transport = transport.clone();
            async move {
                match handshake(transport.as_ref(), &node).await {
                    Ok(status) if network_id.map_or(true, |id| id == status.network_id) => Some(node),
                    Ok(status) => {
                        debug!("{} is on network {}", node.id.short(), status.network_id);
                        None
                    }
                    Err(e) => {
                        debug!("{} failed handshake: {}", node.id.short(), e);
                        None
                    }
                }
            }
        })
        .buffer_unordered(parallel.max(1))
        .filter_map(|node| async move { node })
        .collect()
        .await;

    let filtered: NodeSet = matched
        .iter()
        .filter_map(|node| nodes.get(&node.id).map(|entry| (node.id, entry.clone())))
        .collect();

    info!("✅ {} of {} nodes matched", filtered.len(), nodes.len());
    filtered
}

async fn handshake(transport: &dyn Transport, node: &Node) -> Result<Status, RlpxError> {
    let mut conn = transport.dial(node).await?;
    let result = conn.peer().await;
    conn.close().await;

    let (hello, status) = result?;
    info!("🤝 {} {} caps=[{}] {}", node.id.short(), hello.client_name, join_caps(&hello), status);
    Ok(status)
}

fn join_caps(hello: &crate::rlpx::Hello) -> String {
    hello
        .capabilities
        .iter()
        .map(|c| c.to_string())
        .collect::<Vec<_>>()
        .join(",")
}
