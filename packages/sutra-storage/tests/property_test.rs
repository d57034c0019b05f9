//! Property tests for the engine's universal invariants

use proptest::collection::vec;
use proptest::prelude::*;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use sutra_storage::{
    AdaptiveReconcilerConfig, AssociationRecord, AssociationType, ConceptId, ConceptNode,
    ConcurrentConfig, ConcurrentMemory, GraphSnapshot, HnswConfig, HnswContainer,
};
use tempfile::TempDir;

fn engine_config(dir: &TempDir) -> ConcurrentConfig {
    ConcurrentConfig {
        storage_path: dir.path().to_path_buf(),
        dimension: 4,
        write_log_capacity: 10_000,
        reconciler: AdaptiveReconcilerConfig {
            base_interval_ms: 2,
            ..Default::default()
        },
        ..Default::default()
    }
}

fn wait_for<F: Fn() -> bool>(condition: F) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        std::thread::sleep(Duration::from_millis(2));
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]

    /// After a quiescent flush, concept_count equals the number of distinct
    /// (normalized) contents learned, regardless of duplicates in the input.
    #[test]
    fn concept_count_matches_distinct_ids(
        contents in vec("[a-z]{1,12}( [a-z]{1,12}){0,3}", 1..40)
    ) {
        let dir = TempDir::new().unwrap();
        let engine = ConcurrentMemory::open(engine_config(&dir)).unwrap();

        let mut distinct = HashSet::new();
        for content in &contents {
            let id = engine
                .learn_concept(content, vec![1.0, 0.0, 0.0, 0.0], 1.0, 0.9, Default::default())
                .unwrap();
            distinct.insert(id);
        }

        engine.flush().unwrap();
        prop_assert_eq!(engine.snapshot_info().concept_count, distinct.len());

        // Restart and replay: same contents, same ids
        engine.shutdown();
        drop(engine);

        let reopened = ConcurrentMemory::open(engine_config(&dir)).unwrap();
        prop_assert_eq!(reopened.snapshot_info().concept_count, distinct.len());
        for id in &distinct {
            prop_assert!(reopened.query_concept(id).is_some());
        }
        reopened.shutdown();
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// Search results are sorted by score descending with deterministic
    /// id tie-breaks, and never exceed min(k, total).
    #[test]
    fn vector_search_sorted_and_bounded(
        seeds in vec(0u64..1000, 1..30),
        k in 1usize..10
    ) {
        let dir = TempDir::new().unwrap();
        let container = HnswContainer::load_or_build(
            dir.path().join("storage.idx"),
            HnswConfig { dimension: 4, ..Default::default() },
            &HashMap::new(),
        ).unwrap();

        let mut inserted = HashSet::new();
        for &seed in &seeds {
            let id = ConceptId::from_key(seed + 1);
            let v = [
                (seed % 7) as f32 + 0.1,
                (seed % 5) as f32,
                (seed % 3) as f32,
                1.0,
            ];
            container.insert(id, &v).unwrap();
            inserted.insert(id);
        }

        let results = container.search(&[1.0, 0.5, 0.5, 1.0], k, 64);
        prop_assert!(results.len() <= k.min(inserted.len()));

        for pair in results.windows(2) {
            let ordered = pair[0].1 > pair[1].1
                || (pair[0].1 == pair[1].1 && pair[0].0 < pair[1].0);
            prop_assert!(ordered, "results out of order: {:?}", pair);
        }
    }
}

fn build_snapshot(edges: &[(u8, u8)]) -> GraphSnapshot {
    let mut snapshot = GraphSnapshot::new(1);
    let mut nodes: HashMap<ConceptId, ConceptNode> = HashMap::new();

    let node_for = |n: u8| {
        ConceptNode::new(
            ConceptId([n, 0, 0, 0, 0, 0, 0, 1]),
            Arc::from(format!("node {}", n)),
            None,
            1.0,
            0.9,
            Default::default(),
            1000,
        )
    };

    for &(src, tgt) in edges {
        let source_id = ConceptId([src, 0, 0, 0, 0, 0, 0, 1]);
        let target_id = ConceptId([tgt, 0, 0, 0, 0, 0, 0, 1]);
        nodes.entry(source_id).or_insert_with(|| node_for(src));
        nodes.entry(target_id).or_insert_with(|| node_for(tgt));
        let record =
            AssociationRecord::new(source_id, target_id, AssociationType::Semantic, 0.8);
        nodes.get_mut(&source_id).unwrap().add_edge(record);
    }

    for (id, node) in nodes {
        snapshot.concepts.insert(id, node);
    }
    snapshot.update_stats();
    snapshot
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Any returned path starts at the source, ends at the target, respects
    /// the depth bound, and every hop is a real edge.
    #[test]
    fn find_path_returns_valid_paths(
        edges in vec((0u8..12, 0u8..12), 1..40),
        start in 0u8..12,
        end in 0u8..12,
        max_depth in 1usize..8
    ) {
        let snapshot = build_snapshot(&edges);
        let start_id = ConceptId([start, 0, 0, 0, 0, 0, 0, 1]);
        let end_id = ConceptId([end, 0, 0, 0, 0, 0, 0, 1]);

        if let Some(path) = snapshot.find_path(start_id, end_id, max_depth) {
            prop_assert_eq!(path[0], start_id);
            prop_assert_eq!(*path.last().unwrap(), end_id);
            prop_assert!(path.len() - 1 <= max_depth);

            for hop in path.windows(2) {
                let node = snapshot.get_concept(&hop[0]).unwrap();
                prop_assert!(
                    node.neighbors.contains(&hop[1]),
                    "missing edge {:?} -> {:?}",
                    hop[0],
                    hop[1]
                );
            }
        }
    }
}
