// Engine Tests
// Crawl mode: update state machine, fan-in termination and persistence

#[cfg(test)]
mod tests {
    use crate::crawler::{Engine, Mode, Outcome};
    use crate::discovery::{IterNodes, NodeIterator};
    use crate::registry::{self, scoring, NodeEntry, NodeSet};
    use crate::tests::{engine_config, test_node, FakeResolver, PendingIterator};
    use crate::types::Node;
    use chrono::TimeDelta;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};
    use tempfile::tempdir;
    use tokio_util::sync::CancellationToken;

    // =========================================================================
    // HELPER FUNCTIONS
    // =========================================================================

    fn entry_for(node: &Node, score: i64) -> NodeEntry {
        NodeEntry {
            seq: node.seq(),
            record: node.record.clone(),
            score,
            ..Default::default()
        }
    }

    fn crawler(nodes: NodeSet, resolver: Arc<FakeResolver>, timeout: Option<Duration>) -> Arc<Engine> {
        Arc::new(Engine::new(engine_config(timeout), Mode::Crawl, nodes, resolver))
    }

    fn input_of(nodes: &NodeSet) -> Box<dyn NodeIterator> {
        Box::new(IterNodes::new(nodes.nodes()))
    }

    // =========================================================================
    // STATE MACHINE
    // =========================================================================

    #[tokio::test]
    async fn test_new_node_is_added() {
        let node = test_node();
        let engine = crawler(NodeSet::new(), FakeResolver::answering(), None);

        assert_eq!(engine.update_node(node.clone()).await, Outcome::Added);

        let nodes = engine.snapshot().await;
        let entry = nodes.get(&node.id).unwrap();
        assert_eq!(entry.score, 1);
        assert_eq!(entry.seq, node.seq());
        assert!(entry.record.is_some());
        assert!(entry.first_response.is_some());
        assert_eq!(entry.first_response, entry.last_response);
        assert_eq!(entry.last_check, entry.last_response);
    }

    #[tokio::test]
    async fn test_known_node_is_updated_and_keeps_first_response() {
        let node = test_node();
        let first = scoring::now() - TimeDelta::hours(2);
        let mut entry = entry_for(&node, 3);
        entry.first_response = Some(first);
        entry.last_check = Some(first);

        let mut nodes = NodeSet::new();
        nodes.insert(node.id, entry);
        let engine = crawler(nodes, FakeResolver::answering(), None);

        assert_eq!(engine.update_node(node.clone()).await, Outcome::Updated);

        let nodes = engine.snapshot().await;
        let entry = nodes.get(&node.id).unwrap();
        assert_eq!(entry.score, 4);
        assert_eq!(entry.first_response, Some(first));
        assert!(entry.last_response.unwrap() > first);
    }

    #[tokio::test]
    async fn test_failure_halves_score() {
        let node = test_node();
        let mut nodes = NodeSet::new();
        nodes.insert(node.id, entry_for(&node, 5));
        let engine = crawler(nodes, FakeResolver::failing(), None);

        assert_eq!(engine.update_node(node.clone()).await, Outcome::Updated);

        let nodes = engine.snapshot().await;
        let entry = nodes.get(&node.id).unwrap();
        assert_eq!(entry.score, 2);
        assert!(entry.last_check.is_some());
        assert!(entry.last_response.is_none());
    }

    #[tokio::test]
    async fn test_unknown_node_that_never_answers_is_not_stored() {
        let node = test_node();
        let engine = crawler(NodeSet::new(), FakeResolver::failing(), None);

        assert_eq!(engine.update_node(node.clone()).await, Outcome::SkippedIncompatible);
        assert!(engine.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_recently_checked_node_is_skipped() {
        let node = test_node();
        let mut entry = entry_for(&node, 2);
        entry.last_check = Some(scoring::now() - TimeDelta::seconds(30));

        let mut nodes = NodeSet::new();
        nodes.insert(node.id, entry.clone());
        let resolver = FakeResolver::answering();
        let engine = crawler(nodes, resolver.clone(), None);

        assert_eq!(engine.update_node(node.clone()).await, Outcome::SkippedRecent);
        assert_eq!(resolver.calls(), 0);
        assert_eq!(engine.snapshot().await.get(&node.id), Some(&entry));
    }

    #[tokio::test]
    async fn test_check_after_interval_is_processed() {
        let node = test_node();
        let mut entry = entry_for(&node, 2);
        entry.last_check = Some(scoring::now() - TimeDelta::seconds(601));

        let mut nodes = NodeSet::new();
        nodes.insert(node.id, entry);
        let resolver = FakeResolver::answering();
        let engine = crawler(nodes, resolver.clone(), None);

        assert_eq!(engine.update_node(node).await, Outcome::Added);
        assert_eq!(resolver.calls(), 1);
    }

    #[tokio::test]
    async fn test_score_one_failure_evicts_then_skips() {
        let node = test_node();
        let mut nodes = NodeSet::new();
        nodes.insert(node.id, entry_for(&node, 1));
        let engine = crawler(nodes, FakeResolver::failing(), None);

        assert_eq!(engine.update_node(node.clone()).await, Outcome::Removed);
        assert!(!engine.snapshot().await.contains(&node.id));

        assert_eq!(engine.update_node(node.clone()).await, Outcome::SkippedIncompatible);
        assert!(!engine.snapshot().await.contains(&node.id));

        let counts = engine.counts();
        assert_eq!(counts.removed, 1);
        assert_eq!(counts.skipped_incompatible, 1);
    }

    // =========================================================================
    // RUN LOOP
    // =========================================================================

    #[tokio::test]
    async fn test_empty_input_times_out_with_empty_set() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nodes.json");

        let nodes = registry::load(&path).await.unwrap();
        let closes = Arc::new(AtomicUsize::new(0));
        let engine = crawler(nodes.clone(), FakeResolver::failing(), Some(Duration::from_secs(1)));

        let started = Instant::now();
        let result = engine
            .clone()
            .run(
                input_of(&nodes),
                vec![Box::new(PendingIterator::new(closes.clone()))],
                CancellationToken::new(),
                None,
            )
            .await;

        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(closes.load(Ordering::SeqCst), 1);

        registry::save(&path, &result).await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{}");
    }

    #[tokio::test]
    async fn test_run_ends_when_sources_are_exhausted() {
        let mut nodes = NodeSet::new();
        let known: Vec<Node> = (0..3).map(|_| test_node()).collect();
        for node in &known {
            nodes.insert(node.id, entry_for(node, 2));
        }
        let discovered: Vec<Node> = (0..5).map(|_| test_node()).collect();

        let engine = crawler(nodes.clone(), FakeResolver::answering(), None);
        let result = engine
            .clone()
            .run(
                input_of(&nodes),
                vec![Box::new(IterNodes::new(discovered.clone()))],
                CancellationToken::new(),
                None,
            )
            .await;

        assert_eq!(result.len(), 8);
        for node in &known {
            assert_eq!(result.get(&node.id).unwrap().score, 3);
        }
        for node in &discovered {
            assert_eq!(result.get(&node.id).unwrap().score, 1);
        }

        let counts = engine.counts();
        assert_eq!(counts.added, 8);
        assert_eq!(counts.total(), 8);
    }

    #[tokio::test]
    async fn test_failing_score_one_node_is_evicted_by_crawl() {
        let node = test_node();
        let mut nodes = NodeSet::new();
        nodes.insert(node.id, entry_for(&node, 1));

        let engine = crawler(nodes.clone(), FakeResolver::failing(), None);
        let result = engine.clone().run(input_of(&nodes), vec![], CancellationToken::new(), None).await;
        assert!(result.is_empty());

        // A second crawl of the same node finds nothing to decay
        let engine = crawler(result, FakeResolver::failing(), None);
        let result = engine
            .clone()
            .run(
                Box::new(IterNodes::new(vec![node])),
                vec![],
                CancellationToken::new(),
                None,
            )
            .await;
        assert!(result.is_empty());
        assert_eq!(engine.counts().skipped_incompatible, 1);
    }

    #[tokio::test]
    async fn test_duplicate_node_from_two_sources_yields_one_entry() {
        let node = test_node();
        let engine = crawler(NodeSet::new(), FakeResolver::answering(), None);

        let result = engine
            .clone()
            .run(
                Box::new(IterNodes::new(vec![node.clone()])),
                vec![Box::new(IterNodes::new(vec![node.clone()]))],
                CancellationToken::new(),
                None,
            )
            .await;

        assert_eq!(result.len(), 1);
        assert!(result.contains(&node.id));

        let counts = engine.counts();
        assert_eq!(counts.added, 1);
        assert_eq!(counts.total(), 2);
    }

    #[tokio::test]
    async fn test_cancel_stops_unbounded_crawl() {
        let closes = Arc::new(AtomicUsize::new(0));
        let engine = crawler(NodeSet::new(), FakeResolver::answering(), None);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(engine.clone().run(
            Box::new(IterNodes::new(vec![])),
            vec![Box::new(PendingIterator::new(closes.clone()))],
            cancel.clone(),
            None,
        ));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!handle.is_finished());

        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
        assert!(result.is_empty());
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }
}
