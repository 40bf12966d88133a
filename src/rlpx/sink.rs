//! Message Sink
//!
//! Write-only destination for the protocol messages live peers send us.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use super::messages::codes;
use crate::types::NodeId;

/// Receives every eth message read from a live peer
pub trait MessageSink: Send + Sync {
    fn record(&self, peer: &NodeId, code: u64, payload: &[u8]);

    /// Totals recorded so far
    fn totals(&self) -> MessageCounts;
}

/// Message counters by kind
#[derive(Default)]
pub struct MessageCounter {
    pub block_hashes: AtomicU64,
    pub blocks: AtomicU64,
    pub headers: AtomicU64,
    pub bodies: AtomicU64,
    pub transactions: AtomicU64,
    pub tx_announcements: AtomicU64,
    pub requests: AtomicU64,
    pub other: AtomicU64,
    /// Payload bytes across all kinds
    pub bytes: AtomicU64,
}

/// Point-in-time copy of a [`MessageCounter`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MessageCounts {
    pub block_hashes: u64,
    pub blocks: u64,
    pub headers: u64,
    pub bodies: u64,
    pub transactions: u64,
    pub tx_announcements: u64,
    pub requests: u64,
    pub other: u64,
    pub bytes: u64,
}

impl MessageCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MessageCounts {
        MessageCounts {
            block_hashes: self.block_hashes.load(Ordering::Relaxed),
            blocks: self.blocks.load(Ordering::Relaxed),
            headers: self.headers.load(Ordering::Relaxed),
            bodies: self.bodies.load(Ordering::Relaxed),
            transactions: self.transactions.load(Ordering::Relaxed),
            tx_announcements: self.tx_announcements.load(Ordering::Relaxed),
            requests: self.requests.load(Ordering::Relaxed),
            other: self.other.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
        }
    }
}

impl MessageSink for MessageCounter {
    fn record(&self, _peer: &NodeId, code: u64, payload: &[u8]) {
        let counter = match code {
            codes::NEW_BLOCK_HASHES => &self.block_hashes,
            codes::NEW_BLOCK => &self.blocks,
            codes::BLOCK_HEADERS => &self.headers,
            codes::BLOCK_BODIES => &self.bodies,
            codes::TRANSACTIONS | codes::POOLED_TRANSACTIONS => &self.transactions,
            codes::NEW_POOLED_TRANSACTION_HASHES => &self.tx_announcements,
            codes::GET_BLOCK_HEADERS | codes::GET_BLOCK_BODIES | codes::GET_POOLED_TRANSACTIONS => &self.requests,
            _ => &self.other,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(payload.len() as u64, Ordering::Relaxed);
    }

    fn totals(&self) -> MessageCounts {
        self.snapshot()
    }
}

impl fmt::Display for MessageCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "hashes={} blocks={} headers={} bodies={} txs={} tx_announces={} requests={} other={} bytes={}",
            self.block_hashes,
            self.blocks,
            self.headers,
            self.bodies,
            self.transactions,
            self.tx_announcements,
            self.requests,
            self.other,
            self.bytes
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_by_kind() {
        let counter = MessageCounter::new();
        let peer = NodeId::default();

        counter.record(&peer, codes::TRANSACTIONS, &[0u8; 10]);
        counter.record(&peer, codes::POOLED_TRANSACTIONS, &[0u8; 5]);
        counter.record(&peer, codes::NEW_BLOCK, &[]);
        counter.record(&peer, codes::GET_BLOCK_BODIES, &[]);
        counter.record(&peer, 0x30, &[]);

        let counts = counter.snapshot();
        assert_eq!(counts.transactions, 2);
        assert_eq!(counts.blocks, 1);
        assert_eq!(counts.requests, 1);
        assert_eq!(counts.other, 1);
        assert_eq!(counts.bytes, 15);
    }
}
