//! End-to-end engine scenarios
//!
//! Exercises the full stack: learn/query/search/path, durability across
//! restarts, and back-pressure, against a real data directory per test.

use std::time::{Duration, Instant};
use sutra_storage::{
    AdaptiveReconcilerConfig, AssociationType, ConceptId, ConcurrentConfig, ConcurrentMemory,
    StorageError,
};
use tempfile::TempDir;

fn engine_config(dir: &TempDir) -> ConcurrentConfig {
    ConcurrentConfig {
        storage_path: dir.path().to_path_buf(),
        dimension: 4,
        write_log_capacity: 10_000,
        reconciler: AdaptiveReconcilerConfig {
            base_interval_ms: 5,
            ..Default::default()
        },
        ..Default::default()
    }
}

fn wait_for<F: Fn() -> bool>(condition: F) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn basic_learn_query() {
    let dir = TempDir::new().unwrap();
    let engine = ConcurrentMemory::open(engine_config(&dir)).unwrap();

    let id = engine
        .learn_concept(
            "hello world",
            vec![1.0, 0.0, 0.0, 0.0],
            0.5,
            0.9,
            Default::default(),
        )
        .unwrap();

    // Deterministic 16-hex id derived from content
    assert_eq!(id.to_hex().len(), 16);
    assert_eq!(id, ConceptId::from_content("hello world"));

    wait_for(|| engine.query_concept(&id).is_some());
    let node = engine.query_concept(&id).unwrap();
    assert_eq!(node.content.as_ref(), "hello world");
    assert_eq!(node.embedding.as_ref().unwrap().as_ref(), &[1.0, 0.0, 0.0, 0.0]);
    assert_eq!(node.strength, 0.5);

    engine.shutdown();
}

#[test]
fn duplicate_learn_strengthens() {
    let dir = TempDir::new().unwrap();
    let engine = ConcurrentMemory::open(engine_config(&dir)).unwrap();

    let embedding = vec![1.0, 0.0, 0.0, 0.0];
    let id1 = engine
        .learn_concept("repeated", embedding.clone(), 0.5, 0.9, Default::default())
        .unwrap();
    let id2 = engine
        .learn_concept("repeated", embedding, 0.8, 0.9, Default::default())
        .unwrap();
    assert_eq!(id1, id2);

    wait_for(|| {
        engine
            .query_concept(&id1)
            .map(|n| n.strength == 0.8)
            .unwrap_or(false)
    });
    assert_eq!(engine.snapshot_info().concept_count, 1);

    engine.shutdown();
}

#[test]
fn vector_search_ranking() {
    let dir = TempDir::new().unwrap();
    let engine = ConcurrentMemory::open(engine_config(&dir)).unwrap();

    let a = engine
        .learn_concept("first", vec![1.0, 0.0, 0.0, 0.0], 1.0, 0.9, Default::default())
        .unwrap();
    let b = engine
        .learn_concept("second", vec![0.9, 0.1, 0.0, 0.0], 1.0, 0.9, Default::default())
        .unwrap();
    let _c = engine
        .learn_concept("third", vec![0.0, 1.0, 0.0, 0.0], 1.0, 0.9, Default::default())
        .unwrap();

    wait_for(|| engine.snapshot_info().concept_count == 3);

    let results = engine
        .vector_search(&[1.0, 0.0, 0.0, 0.0], 2, 64, None)
        .unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].0, a);
    assert_eq!(results[1].0, b);
    assert!(
        results[0].1 > results[1].1,
        "scores must strictly decrease: {:?}",
        results
    );

    engine.shutdown();
}

#[test]
fn path_finding_insertion_order_tiebreak() {
    let dir = TempDir::new().unwrap();
    let engine = ConcurrentMemory::open(engine_config(&dir)).unwrap();

    let names = ["A", "B", "C", "D"];
    let ids: Vec<ConceptId> = names
        .iter()
        .enumerate()
        .map(|(i, name)| {
            let mut v = vec![0.0; 4];
            v[i] = 1.0;
            engine
                .learn_concept(name, v, 1.0, 0.9, Default::default())
                .unwrap()
        })
        .collect();
    let (a, b, c, d) = (ids[0], ids[1], ids[2], ids[3]);

    engine.learn_association(a, b, AssociationType::Causal, 0.9).unwrap();
    engine.learn_association(b, c, AssociationType::Causal, 0.9).unwrap();
    engine.learn_association(a, d, AssociationType::Causal, 0.9).unwrap();
    engine.learn_association(d, c, AssociationType::Causal, 0.9).unwrap();

    wait_for(|| engine.snapshot_info().edge_count == 4);

    // A->B->C and A->D->C tie on length; A->B was inserted first
    let path = engine.find_path(a, c, 2).unwrap();
    assert_eq!(path, vec![a, b, c]);

    // Depth bound respected
    assert!(engine.find_path(a, c, 1).is_none());

    engine.shutdown();
}

#[test]
fn crash_recovery_replays_wal() {
    let dir = TempDir::new().unwrap();

    let ids: Vec<ConceptId> = {
        let engine = ConcurrentMemory::open(engine_config(&dir)).unwrap();
        let ids = (0..1000)
            .map(|i| {
                engine
                    .learn_concept(
                        &format!("concept number {}", i),
                        vec![(i % 10) as f32, 1.0, 0.0, 0.0],
                        1.0,
                        0.9,
                        Default::default(),
                    )
                    .unwrap()
            })
            .collect();
        // Simulated crash: no flush, just drop. Every accepted learn is
        // already durable in the WAL.
        drop(engine);
        ids
    };

    let engine = ConcurrentMemory::open(engine_config(&dir)).unwrap();
    assert_eq!(engine.snapshot_info().concept_count, 1000);
    for id in &ids {
        assert!(engine.query_concept(id).is_some());
    }

    engine.shutdown();
}

#[test]
fn backpressure_rejects_excess_writes() {
    let dir = TempDir::new().unwrap();
    let mut config = engine_config(&dir);
    config.write_log_capacity = 4;
    // Park the reconciler so nothing drains during the burst
    config.reconciler.min_interval_ms = 10_000;
    config.reconciler.high_interval_ms = 10_000;
    config.reconciler.base_interval_ms = 10_000;
    config.reconciler.max_interval_ms = 10_000;

    let engine = ConcurrentMemory::open(config).unwrap();
    std::thread::sleep(Duration::from_millis(50));

    // 8 concurrent learns racing for the 4 queue slots
    let results: Vec<Result<ConceptId, StorageError>> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let engine = &engine;
                scope.spawn(move || {
                    engine.learn_concept(
                        &format!("burst {}", i),
                        vec![i as f32, 0.0, 0.0, 1.0],
                        1.0,
                        0.9,
                        Default::default(),
                    )
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let accepted = results.iter().filter(|r| r.is_ok()).count();
    let rejected = results
        .iter()
        .filter(|r| matches!(r, Err(StorageError::Backpressure)))
        .count();

    // Exactly four fit; the rest see back-pressure, and every accepted
    // learn is already durable in the WAL
    assert_eq!(accepted, 4);
    assert_eq!(rejected, 4);

    drop(engine);
}

#[test]
fn snapshot_roundtrip_identical_modulo_generation() {
    let dir = TempDir::new().unwrap();

    let (a, b) = {
        let engine = ConcurrentMemory::open(engine_config(&dir)).unwrap();
        let a = engine
            .learn_concept("alpha", vec![1.0, 0.0, 0.0, 0.0], 0.4, 0.8, Default::default())
            .unwrap();
        let b = engine
            .learn_concept("beta", vec![0.0, 1.0, 0.0, 0.0], 0.9, 0.7, Default::default())
            .unwrap();
        engine
            .learn_association(a, b, AssociationType::Hierarchical, 0.6)
            .unwrap();
        engine.flush().unwrap();
        engine.shutdown();
        (a, b)
    };

    let engine = ConcurrentMemory::open(engine_config(&dir)).unwrap();
    let info = engine.snapshot_info();
    assert_eq!(info.concept_count, 2);
    assert_eq!(info.edge_count, 1);

    let node_a = engine.query_concept(&a).unwrap();
    assert_eq!(node_a.content.as_ref(), "alpha");
    assert_eq!(node_a.strength, 0.4);
    assert_eq!(node_a.confidence, 0.8);
    assert_eq!(engine.neighbors(&a), vec![b]);

    let node_b = engine.query_concept(&b).unwrap();
    assert_eq!(node_b.embedding.as_ref().unwrap().as_ref(), &[0.0, 1.0, 0.0, 0.0]);

    engine.shutdown();
}

#[test]
fn readers_never_block_under_write_load() {
    use std::sync::Arc;

    let dir = TempDir::new().unwrap();
    let engine = Arc::new(ConcurrentMemory::open(engine_config(&dir)).unwrap());

    let seed = engine
        .learn_concept("seed", vec![1.0, 0.0, 0.0, 0.0], 1.0, 0.9, Default::default())
        .unwrap();
    wait_for(|| engine.query_concept(&seed).is_some());

    let writer = {
        let engine = Arc::clone(&engine);
        std::thread::spawn(move || {
            for i in 0..500 {
                let _ = engine.learn_concept(
                    &format!("writer {}", i),
                    vec![i as f32, 1.0, 0.0, 0.0],
                    1.0,
                    0.9,
                    Default::default(),
                );
            }
        })
    };

    let reader = {
        let engine = Arc::clone(&engine);
        std::thread::spawn(move || {
            let mut slowest = Duration::ZERO;
            for _ in 0..2000 {
                let start = Instant::now();
                let node = engine.query_concept(&seed);
                slowest = slowest.max(start.elapsed());
                assert!(node.is_some());
            }
            slowest
        })
    };

    writer.join().unwrap();
    let slowest = reader.join().unwrap();
    // A read is a pointer load plus map lookups; generous bound for CI noise
    assert!(
        slowest < Duration::from_millis(50),
        "reader stalled for {:?}",
        slowest
    );

    engine.shutdown();
}
