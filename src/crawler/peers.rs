//! Live Peers
//!
//! Node ids with an open, serving connection. Guarded by its own lock so
//! peering never waits on the node set.

use std::collections::HashSet;
use tokio::sync::Mutex;

use crate::types::NodeId;

#[derive(Default)]
pub struct LivePeers {
    ids: Mutex<HashSet<NodeId>>,
}

impl LivePeers {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn contains(&self, id: &NodeId) -> bool {
        self.ids.lock().await.contains(id)
    }

    /// Claim the slot for `id`; false when a connection already holds it
    pub async fn insert(&self, id: NodeId) -> bool {
        self.ids.lock().await.insert(id)
    }

    pub async fn remove(&self, id: &NodeId) {
        self.ids.lock().await.remove(id);
    }

    pub async fn len(&self) -> usize {
        self.ids.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_single_slot_per_node() {
        let peers = LivePeers::new();
        let id = NodeId::new([1u8; 32]);

        assert!(peers.insert(id).await);
        assert!(!peers.insert(id).await);
        assert!(peers.contains(&id).await);
        assert_eq!(peers.len().await, 1);

        peers.remove(&id).await;
        assert!(!peers.contains(&id).await);
        assert!(peers.insert(id).await);
    }
}
