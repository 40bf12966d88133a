//! Routing Table
//!
//! Kademlia buckets indexed by the log distance between node ids. Only
//! nodes that answered one of our pings are kept.

use std::cmp::Ordering;

use crate::types::{Node, NodeId};

/// Nodes per bucket, also the size of a lookup result
pub const BUCKET_SIZE: usize = 16;

const NUM_BUCKETS: usize = 256;

/// Number of the highest differing bit between two ids, 0 when equal
pub fn log_distance(a: &NodeId, b: &NodeId) -> usize {
    for (i, (x, y)) in a.as_bytes().iter().zip(b.as_bytes()).enumerate() {
        let diff = x ^ y;
        if diff != 0 {
            return (32 - i) * 8 - diff.leading_zeros() as usize;
        }
    }
    0
}

/// Order `a` and `b` by XOR distance to `target`
pub fn distance_cmp(target: &NodeId, a: &NodeId, b: &NodeId) -> Ordering {
    let t = target.as_bytes();
    for i in 0..32 {
        let da = a.as_bytes()[i] ^ t[i];
        let db = b.as_bytes()[i] ^ t[i];
        if da != db {
            return da.cmp(&db);
        }
    }
    Ordering::Equal
}

pub struct Table {
    local: NodeId,
    buckets: Vec<Vec<Node>>,
}

impl Table {
    pub fn new(local: NodeId) -> Self {
        Self {
            local,
            buckets: vec![Vec::new(); NUM_BUCKETS],
        }
    }

    /// Insert or refresh `node`. Returns false when the node is us or its bucket is full.
    pub fn add(&mut self, node: Node) -> bool {
        let distance = log_distance(&self.local, &node.id);
        if distance == 0 {
            return false;
        }

        let bucket = &mut self.buckets[distance - 1];
        if let Some(existing) = bucket.iter_mut().find(|n| n.id == node.id) {
            *existing = node;
            return true;
        }
        if bucket.len() >= BUCKET_SIZE {
            return false;
        }
        bucket.push(node);
        true
    }

    pub fn remove(&mut self, id: &NodeId) {
        let distance = log_distance(&self.local, id);
        if distance > 0 {
            self.buckets[distance - 1].retain(|n| n.id != *id);
        }
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(Vec::len).sum()
    }

    /// Up to `count` nodes closest to `target`, nearest first
    pub fn closest(&self, target: &NodeId, count: usize) -> Vec<Node> {
        let mut nodes: Vec<Node> = self.buckets.iter().flatten().cloned().collect();
        nodes.sort_by(|a, b| distance_cmp(target, &a.id, &b.id));
        nodes.truncate(count);
        nodes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id_with_first_byte(b: u8) -> NodeId {
        let mut bytes = [0u8; 32];
        bytes[0] = b;
        NodeId::new(bytes)
    }

    fn random_node() -> Node {
        let secp = secp256k1::Secp256k1::new();
        let (_, pk) = secp.generate_keypair(&mut rand::thread_rng());
        Node::new(pk, Some([10, 0, 0, 1].into()), Some(30303), Some(30303))
    }

    #[test]
    fn test_log_distance() {
        let zero = NodeId::default();
        assert_eq!(log_distance(&zero, &zero), 0);
        assert_eq!(log_distance(&zero, &id_with_first_byte(0x80)), 256);
        assert_eq!(log_distance(&zero, &id_with_first_byte(0x01)), 249);

        let mut last = [0u8; 32];
        last[31] = 1;
        assert_eq!(log_distance(&zero, &NodeId::new(last)), 1);
    }

    #[test]
    fn test_distance_cmp() {
        let target = id_with_first_byte(0x10);
        let near = id_with_first_byte(0x11);
        let far = id_with_first_byte(0x90);
        assert_eq!(distance_cmp(&target, &near, &far), Ordering::Less);
        assert_eq!(distance_cmp(&target, &far, &near), Ordering::Greater);
        assert_eq!(distance_cmp(&target, &near, &near), Ordering::Equal);
    }

    #[test]
    fn test_add_skips_local_and_refreshes_known() {
        let node = random_node();
        let mut table = Table::new(node.id);
        assert!(!table.add(node.clone()));
        assert_eq!(table.len(), 0);

        let other = random_node();
        assert!(table.add(other.clone()));
        assert!(table.add(other.clone()));
        assert_eq!(table.len(), 1);

        table.remove(&other.id);
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn test_closest_ordered_and_bounded() {
        let mut table = Table::new(NodeId::default());
        for _ in 0..40 {
            table.add(random_node());
        }

        let target = random_node().id;
        let closest = table.closest(&target, BUCKET_SIZE);
        assert_eq!(closest.len(), BUCKET_SIZE.min(table.len()));
        assert!(closest
            .windows(2)
            .all(|w| distance_cmp(&target, &w[0].id, &w[1].id) != Ordering::Greater));
    }
}
