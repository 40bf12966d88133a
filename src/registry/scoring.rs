//! Node Scoring
//!
//! The score counts liveness checks: +1 for every answered record request,
//! halved for every unanswered one. A node whose score reaches zero is
//! dropped from the set.

use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use std::time::Duration;

use super::NodeEntry;
use crate::types::Node;

/// Outcome of one record refresh applied to an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refresh {
    /// First ever successful response
    Added,
    /// Successful response from a node that answered before
    Updated,
    /// Failure, score halved and still positive
    Decayed,
    /// Failure, score dropped to zero
    Evicted,
    /// Failure from a node that never answered
    NeverResponded,
}

/// Current time at one-second resolution
pub fn now() -> DateTime<Utc> {
    truncate(Utc::now())
}

/// Drop sub-second precision
pub fn truncate(t: DateTime<Utc>) -> DateTime<Utc> {
    t.duration_trunc(TimeDelta::seconds(1)).unwrap_or(t)
}

/// Whether a node checked at `last_check` is still inside the revalidation window at `now`
pub fn is_recent(last_check: Option<DateTime<Utc>>, now: DateTime<Utc>, interval: Duration) -> bool {
    let Some(last_check) = last_check else {
        return false;
    };
    let Ok(interval) = TimeDelta::from_std(interval) else {
        return false;
    };
    now.signed_duration_since(last_check) < interval
}

/// Apply a refresh result to an entry
///
/// `refreshed` is the node returned by the resolver on success, `None` on failure.
/// `last_check` is stamped in every case.
pub fn apply(entry: &mut NodeEntry, refreshed: Option<&Node>, now: DateTime<Utc>) -> Refresh {
    entry.last_check = Some(now);

    match refreshed {
        Some(node) => {
            entry.score += 1;
            entry.seq = node.seq();
            if node.record.is_some() {
                entry.record = node.record.clone();
            }
            entry.last_response = Some(now);

            if entry.first_response.is_none() {
                entry.first_response = Some(now);
                Refresh::Added
            } else {
                Refresh::Updated
            }
        }
        None if entry.score == 0 => Refresh::NeverResponded,
        None => {
            entry.score /= 2;
            if entry.score <= 0 {
                Refresh::Evicted
            } else {
                Refresh::Decayed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn test_node() -> Node {
        let secp = secp256k1::Secp256k1::new();
        let (_, pk) = secp.generate_keypair(&mut rand::thread_rng());
        Node::new(pk, None, None, None)
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_truncate() {
        let t = Utc.timestamp_opt(1_700_000_000, 999_000_000).unwrap();
        assert_eq!(truncate(t), Utc.timestamp_opt(1_700_000_000, 0).unwrap());
    }

    #[test]
    fn test_success_increments_and_stamps_first_response_once() {
        let node = test_node();
        let mut entry = NodeEntry::default();

        assert_eq!(apply(&mut entry, Some(&node), at(0)), Refresh::Added);
        assert_eq!(entry.score, 1);
        assert_eq!(entry.first_response, Some(at(0)));

        assert_eq!(apply(&mut entry, Some(&node), at(10)), Refresh::Updated);
        assert_eq!(entry.score, 2);
        assert_eq!(entry.first_response, Some(at(0)));
        assert_eq!(entry.last_response, Some(at(10)));
        assert_eq!(entry.last_check, Some(at(10)));
    }

    #[test]
    fn test_failure_halves_score() {
        let mut entry = NodeEntry { score: 7, ..Default::default() };

        assert_eq!(apply(&mut entry, None, at(0)), Refresh::Decayed);
        assert_eq!(entry.score, 3);
        assert_eq!(apply(&mut entry, None, at(1)), Refresh::Decayed);
        assert_eq!(entry.score, 1);
        assert_eq!(apply(&mut entry, None, at(2)), Refresh::Evicted);
        assert_eq!(entry.score, 0);
        assert_eq!(entry.last_check, Some(at(2)));
        assert_eq!(entry.last_response, None);
    }

    #[test]
    fn test_failure_at_zero_is_not_decremented() {
        let mut entry = NodeEntry::default();
        assert_eq!(apply(&mut entry, None, at(0)), Refresh::NeverResponded);
        assert_eq!(entry.score, 0);
    }

    #[test]
    fn test_is_recent_window() {
        let interval = Duration::from_secs(600);
        assert!(!is_recent(None, at(0), interval));
        assert!(is_recent(Some(at(0)), at(599), interval));
        assert!(!is_recent(Some(at(0)), at(600), interval));
        assert!(!is_recent(Some(at(0)), at(601), interval));
    }
}
