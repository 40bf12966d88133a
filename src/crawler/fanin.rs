//! Iterator Fan-In
//!
//! Every node source gets its own task that forwards into one shared
//! channel. Cancelling the `closed` token stops all of them; each task
//! closes its own iterator exactly once on the way out.

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::trace;

use crate::discovery::NodeIterator;
use crate::types::Node;

/// Handles for the running fan-in tasks
pub struct FanIn {
    /// Merged node stream; ends once every source is exhausted
    pub nodes: mpsc::Receiver<Node>,
    /// Fires when the input set iterator is done
    pub input_done: oneshot::Receiver<()>,
    /// Tracks the forwarding tasks
    pub tasks: TaskTracker,
}

/// Spawn one forwarding task per iterator
pub fn spawn(
    input: Box<dyn NodeIterator>,
    discovery: Vec<Box<dyn NodeIterator>>,
    closed: CancellationToken,
) -> FanIn {
    let (tx, rx) = mpsc::channel(1);
    let (done_tx, done_rx) = oneshot::channel();
    let tasks = TaskTracker::new();

    {
        let tx = tx.clone();
        let closed = closed.clone();
        tasks.spawn(async move {
            let count = forward(input, tx, closed).await;
            trace!("Input set iterator finished after {} nodes", count);
            let _ = done_tx.send(());
        });
    }

    for iterator in discovery {
        tasks.spawn(forward(iterator, tx.clone(), closed.clone()));
    }

    tasks.close();

    FanIn { nodes: rx, input_done: done_rx, tasks }
}

/// Pump one iterator into the channel until it ends or `closed` fires
async fn forward(mut iterator: Box<dyn NodeIterator>, tx: mpsc::Sender<Node>, closed: CancellationToken) -> usize {
    let mut count = 0;

    loop {
        let node = tokio::select! {
            _ = closed.cancelled() => break,
            node = iterator.next_node() => node,
        };
        let Some(node) = node else { break };

        tokio::select! {
            _ = closed.cancelled() => break,
            sent = tx.send(node) => {
                if sent.is_err() {
                    break;
                }
                count += 1;
            }
        }
    }

    iterator.close();
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::IterNodes;
    use crate::tests::{test_node, PendingIterator};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_merges_all_sources() {
        let input = vec![test_node(), test_node()];
        let extra = vec![test_node(), test_node(), test_node()];

        let mut fanin = spawn(
            Box::new(IterNodes::new(input)),
            vec![Box::new(IterNodes::new(extra))],
            CancellationToken::new(),
        );

        let mut received = 0;
        while fanin.nodes.recv().await.is_some() {
            received += 1;
        }
        assert_eq!(received, 5);
        assert!(fanin.input_done.await.is_ok());
        fanin.tasks.wait().await;
    }

    #[tokio::test]
    async fn test_keeps_per_source_order() {
        let input: Vec<_> = (0..4).map(|_| test_node()).collect();
        let expected: Vec<_> = input.iter().map(|n| n.id).collect();

        let mut fanin = spawn(Box::new(IterNodes::new(input)), vec![], CancellationToken::new());

        let mut ids = Vec::new();
        while let Some(node) = fanin.nodes.recv().await {
            ids.push(node.id);
        }
        assert_eq!(ids, expected);
    }

    #[tokio::test]
    async fn test_cancel_closes_blocked_iterators() {
        let closes = Arc::new(AtomicUsize::new(0));
        let closed = CancellationToken::new();

        let fanin = spawn(
            Box::new(PendingIterator::new(closes.clone())),
            vec![Box::new(PendingIterator::new(closes.clone()))],
            closed.clone(),
        );

        closed.cancel();
        fanin.tasks.wait().await;
        assert_eq!(closes.load(Ordering::SeqCst), 2);
    }
}
