//! Node Registry Module
//!
//! The node set is the crawler's only durable state: every node ever seen,
//! its latest signed record, its liveness score and the times of the last
//! check and last response.

use chrono::{DateTime, Utc};
use discv5::Enr;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

use crate::types::{Node, NodeId};

mod storage;
pub mod scoring;

pub use storage::{encode, load, save, write};

/// One entry of the node set
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeEntry {
    /// Sequence number of the stored record
    #[serde(default)]
    pub seq: u64,

    /// Latest signed record, absent if the node never answered
    #[serde(default, skip_serializing_if = "Option::is_none", with = "enr_serde")]
    pub record: Option<Enr>,

    /// Liveness score
    #[serde(default, skip_serializing_if = "is_zero")]
    pub score: i64,

    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "zero_time::deserialize")]
    pub first_response: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "zero_time::deserialize")]
    pub last_response: Option<DateTime<Utc>>,

    /// Last contact attempt, successful or not
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "zero_time::deserialize")]
    pub last_check: Option<DateTime<Utc>>,
}

fn is_zero(score: &i64) -> bool {
    *score == 0
}

/// Older files write unset times as `0001-01-01T00:00:00Z`
mod zero_time {
    use chrono::{DateTime, Datelike, Utc};
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let time: Option<DateTime<Utc>> = Option::deserialize(deserializer)?;
        Ok(time.filter(|t| t.year() > 1))
    }
}

/// Records travel in their `enr:` text form
mod enr_serde {
    use discv5::Enr;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::str::FromStr;

    pub fn serialize<S>(record: &Option<Enr>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match record {
            Some(enr) => serializer.serialize_str(&enr.to_base64()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Enr>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text: Option<String> = Option::deserialize(deserializer)?;
        text.map(|s| Enr::from_str(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

/// Mapping from node id to entry, kept sorted by id
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeSet {
    entries: BTreeMap<NodeId, NodeEntry>,
}

/// Summary of a node set
#[derive(Debug, Clone, Default)]
pub struct RegistryStats {
    /// Total entries
    pub total_nodes: usize,

    /// Entries carrying a signed record
    pub with_record: usize,

    /// Average node score
    pub average_score: f64,
}

impl NodeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &NodeId) -> Option<&NodeEntry> {
        self.entries.get(id)
    }

    pub fn insert(&mut self, id: NodeId, entry: NodeEntry) {
        self.entries.insert(id, entry);
    }

    pub fn remove(&mut self, id: &NodeId) -> Option<NodeEntry> {
        self.entries.remove(id)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Contactable nodes of the set, ordered by id
    ///
    /// Entries without a record have no endpoint and are left out.
    pub fn nodes(&self) -> Vec<Node> {
        self.entries
            .iter()
            .filter_map(|(id, entry)| {
                let enr = entry.record.clone()?;
                match Node::from_enr(enr) {
                    Ok(node) => Some(node),
                    Err(e) => {
                        debug!("Skipping stored record of {}: {}", id.short(), e);
                        None
                    }
                }
            })
            .collect()
    }

    /// Get node set statistics
    pub fn stats(&self) -> RegistryStats {
        let average_score = if self.entries.is_empty() {
            0.0
        } else {
            self.entries.values().map(|e| e.score as f64).sum::<f64>() / self.entries.len() as f64
        };

        RegistryStats {
            total_nodes: self.entries.len(),
            with_record: self.entries.values().filter(|e| e.record.is_some()).count(),
            average_score,
        }
    }
}

impl FromIterator<(NodeId, NodeEntry)> for NodeSet {
    fn from_iter<I: IntoIterator<Item = (NodeId, NodeEntry)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}
