//! Update Counters
//!
//! One counter per node update outcome, read by the periodic status log.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Result of running one node through the update state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Added,
    Updated,
    Removed,
    SkippedRecent,
    SkippedIncompatible,
}

#[derive(Default)]
pub struct UpdateCounters {
    pub added: AtomicU64,
    pub updated: AtomicU64,
    pub removed: AtomicU64,
    pub skipped_recent: AtomicU64,
    pub skipped_incompatible: AtomicU64,
}

/// Point-in-time copy of [`UpdateCounters`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateCounts {
    pub added: u64,
    pub updated: u64,
    pub removed: u64,
    pub skipped_recent: u64,
    pub skipped_incompatible: u64,
}

impl UpdateCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, outcome: Outcome) {
        let counter = match outcome {
            Outcome::Added => &self.added,
            Outcome::Updated => &self.updated,
            Outcome::Removed => &self.removed,
            Outcome::SkippedRecent => &self.skipped_recent,
            Outcome::SkippedIncompatible => &self.skipped_incompatible,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> UpdateCounts {
        UpdateCounts {
            added: self.added.load(Ordering::Relaxed),
            updated: self.updated.load(Ordering::Relaxed),
            removed: self.removed.load(Ordering::Relaxed),
            skipped_recent: self.skipped_recent.load(Ordering::Relaxed),
            skipped_incompatible: self.skipped_incompatible.load(Ordering::Relaxed),
        }
    }
}

impl UpdateCounts {
    pub fn total(&self) -> u64 {
        self.added + self.updated + self.removed + self.skipped_recent + self.skipped_incompatible
    }
}

impl fmt::Display for UpdateCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "added={} updated={} removed={} ignored(recent)={} ignored(incompatible)={}",
            self.added, self.updated, self.removed, self.skipped_recent, self.skipped_incompatible
        )
    }
}
