/// Sharded Storage - single-node horizontal scaling
///
/// Routes concepts across N independent ConcurrentMemory shards (each with
/// its own WAL, snapshot and HNSW index) by `fnv1a(concept_id) mod N`.
/// Single-shard writes go to the owning shard directly; associations whose
/// endpoints live on different shards run through the two-phase-commit
/// coordinator so no dangling edge can survive a crash.
use crate::concurrent_memory::{
    ConcurrentConfig, ConcurrentMemory, ConcurrentStats, MAX_PATH_DEPTH,
};
use crate::error::{Result, StorageError};
use crate::read_view::ConceptNode;
use crate::txn_coordinator::{AssocOp, TransactionCoordinator, TxnOutcome};
use crate::types::{fnv1a, AssociationType, ConceptId, ConceptMetadata};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use sutra_protocol::ConceptType;

const TXN_TIMEOUT: Duration = Duration::from_secs(5);

/// Sharding configuration
#[derive(Debug, Clone)]
pub struct ShardConfig {
    /// Number of shards; must be 1, 4, 8 or 16
    pub num_shards: u32,
    /// Base storage path
    pub base_path: PathBuf,
    /// Per-shard configuration (storage_path is overridden per shard)
    pub shard_config: ConcurrentConfig,
}

/// Sharded storage manager
pub struct ShardedStorage {
    config: ShardConfig,
    shards: Vec<Arc<ConcurrentMemory>>,
    /// 2PC coordinator; absent in single-shard deployments, which never
    /// produce cross-shard edges
    coordinator: Option<TransactionCoordinator>,
}

impl ShardedStorage {
    /// Open all shards and resolve in-doubt cross-shard transactions
    pub fn open(config: ShardConfig) -> Result<Self> {
        if !crate::config::VALID_SHARD_COUNTS.contains(&config.num_shards) {
            return Err(StorageError::Protocol(format!(
                "unsupported shard count {}",
                config.num_shards
            )));
        }

        std::fs::create_dir_all(&config.base_path).map_err(StorageError::from_io)?;

        let mut shards = Vec::with_capacity(config.num_shards as usize);
        for shard_id in 0..config.num_shards {
            let shard_path = if config.num_shards == 1 {
                config.base_path.clone()
            } else {
                config.base_path.join(format!("shard_{:04}", shard_id))
            };

            let mut shard_config = config.shard_config.clone();
            shard_config.storage_path = shard_path;

            let shard = ConcurrentMemory::open(shard_config)?;
            log::info!(
                "shard {} ready at {:?} ({} concepts)",
                shard_id,
                shard.config().storage_path,
                shard.snapshot_info().concept_count
            );
            shards.push(Arc::new(shard));
        }

        let coordinator = if config.num_shards > 1 {
            Some(TransactionCoordinator::open(
                config.base_path.join("coord.log"),
                TXN_TIMEOUT,
            )?)
        } else {
            None
        };

        let storage = Self {
            config,
            shards,
            coordinator,
        };
        storage.recover_in_doubt()?;
        Ok(storage)
    }

    /// Complete or roll back transactions that crashed between prepare and
    /// outcome, using the coordinator log as the source of truth.
    fn recover_in_doubt(&self) -> Result<()> {
        for shard in &self.shards {
            for txn_id in shard.take_in_doubt() {
                let outcome = self
                    .coordinator
                    .as_ref()
                    .map(|c| c.outcome(txn_id))
                    .unwrap_or(TxnOutcome::Aborted);
                match outcome {
                    TxnOutcome::Committed => {
                        log::info!("recovery: completing committed txn {}", txn_id);
                        shard.commit_txn(txn_id)?;
                    }
                    TxnOutcome::Aborted | TxnOutcome::InFlight => {
                        log::info!("recovery: rolling back txn {}", txn_id);
                        shard.abort_txn(txn_id)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn shard_id_for(&self, id: ConceptId) -> u32 {
        (fnv1a(&id) % self.config.num_shards as u64) as u32
    }

    fn shard_for(&self, id: ConceptId) -> &Arc<ConcurrentMemory> {
        &self.shards[self.shard_id_for(id) as usize]
    }

    // ========================
    // WRITE API
    // ========================

    pub fn learn_concept(
        &self,
        content: &str,
        embedding: Vec<f32>,
        strength: f32,
        confidence: f32,
        metadata: ConceptMetadata,
    ) -> Result<ConceptId> {
        let id = ConceptId::from_content(content);
        self.shard_for(id)
            .learn_concept(content, embedding, strength, confidence, metadata)
    }

    /// Learn an association, transparently using 2PC when the endpoints
    /// live on different shards.
    pub fn learn_association(
        &self,
        source: ConceptId,
        target: ConceptId,
        assoc_type: AssociationType,
        confidence: f32,
    ) -> Result<u64> {
        let source_shard = self.shard_id_for(source);
        let target_shard = self.shard_id_for(target);

        if source_shard == target_shard {
            return self.shards[source_shard as usize].learn_association(
                source,
                target,
                assoc_type,
                confidence,
            );
        }

        self.learn_association_2pc(source, target, source_shard, target_shard, assoc_type, confidence)
    }

    fn learn_association_2pc(
        &self,
        source: ConceptId,
        target: ConceptId,
        source_shard: u32,
        target_shard: u32,
        assoc_type: AssociationType,
        confidence: f32,
    ) -> Result<u64> {
        let coordinator = self
            .coordinator
            .as_ref()
            .ok_or_else(|| StorageError::internal("cross-shard edge without coordinator"))?;

        let txn_id = coordinator.begin(AssocOp {
            source,
            target,
            source_shard,
            target_shard,
            assoc_type: assoc_type as u32,
            confidence,
        })?;

        let src = &self.shards[source_shard as usize];
        let tgt = &self.shards[target_shard as usize];

        // Phase 1: prepare both participants
        let prepare = src
            .prepare_association(txn_id, source, target, assoc_type, confidence, true)
            .and_then(|_| {
                coordinator.mark_prepared(txn_id, source_shard)?;
                tgt.prepare_association(txn_id, source, target, assoc_type, confidence, false)
            })
            .and_then(|_| {
                coordinator.mark_prepared(txn_id, target_shard)?;
                Ok(())
            });

        if let Err(e) = prepare {
            coordinator.abort(txn_id)?;
            // Roll back whichever participants got prepared
            src.abort_txn(txn_id)?;
            tgt.abort_txn(txn_id)?;
            coordinator.complete(txn_id);
            return Err(e);
        }

        // Phase 2: durable outcome, then apply on both shards
        coordinator.commit(txn_id)?;
        let lsn = src.commit_txn(txn_id)?;
        tgt.commit_txn(txn_id)?;
        coordinator.complete(txn_id);

        Ok(lsn)
    }

    /// Learn a concept plus extracted associations. Same-shard edges join
    /// the concept's WAL group; cross-shard edges run 2PC afterwards.
    pub fn learn_with_associations(
        &self,
        content: &str,
        embedding: Vec<f32>,
        strength: f32,
        confidence: f32,
        metadata: ConceptMetadata,
        edges: &[(ConceptId, AssociationType, f32)],
    ) -> Result<(ConceptId, u32)> {
        let id = ConceptId::from_content(content);
        let home = self.shard_id_for(id);

        let (local, remote): (Vec<_>, Vec<_>) = edges
            .iter()
            .copied()
            .partition(|&(target, _, _)| self.shard_id_for(target) == home);

        let (id, mut created) = self.shards[home as usize].learn_with_associations(
            content, embedding, strength, confidence, metadata, &local,
        )?;

        for (target, assoc_type, edge_confidence) in remote {
            // Cross-shard extraction targets are advisory like local ones:
            // failures drop the edge, never the learn
            match self.learn_association(id, target, assoc_type, edge_confidence) {
                Ok(_) => created += 1,
                Err(StorageError::NotFound(_)) => {}
                Err(e) => log::warn!("cross-shard edge dropped: {}", e),
            }
        }

        Ok((id, created))
    }

    // ========================
    // READ API
    // ========================

    pub fn query_concept(&self, id: &ConceptId) -> Option<ConceptNode> {
        self.shard_for(*id).query_concept(id)
    }

    pub fn neighbors(&self, id: &ConceptId) -> Vec<ConceptId> {
        self.shard_for(*id).neighbors(id)
    }

    pub fn contains(&self, id: &ConceptId) -> bool {
        self.shard_for(*id).contains(id)
    }

    /// k-NN across all shards in parallel, merged by score (ties by id)
    pub fn vector_search(
        &self,
        query: &[f32],
        k: usize,
        ef_search: usize,
        organization_filter: Option<&str>,
    ) -> Result<Vec<(ConceptId, f32)>> {
        let per_shard: Vec<Result<Vec<(ConceptId, f32)>>> = self
            .shards
            .par_iter()
            .map(|shard| shard.vector_search(query, k, ef_search, organization_filter))
            .collect();

        let mut merged = Vec::with_capacity(k * self.shards.len());
        for result in per_shard {
            merged.extend(result?);
        }

        merged.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        merged.truncate(k);
        Ok(merged)
    }

    /// BFS shortest path; neighbor lookups route to the owning shard, so
    /// paths may cross shard boundaries.
    pub fn find_path(
        &self,
        start: ConceptId,
        end: ConceptId,
        max_depth: usize,
    ) -> Option<Vec<ConceptId>> {
        if self.shards.len() == 1 {
            return self.shards[0].find_path(start, end, max_depth);
        }

        use std::collections::VecDeque;
        let max_depth = max_depth.min(MAX_PATH_DEPTH);

        if self.query_concept(&start).is_none() {
            return None;
        }
        if start == end {
            return Some(vec![start]);
        }

        let mut queue = VecDeque::new();
        let mut parent: HashMap<ConceptId, ConceptId> = HashMap::new();
        queue.push_back((start, 0usize));
        parent.insert(start, start);

        while let Some((current, depth)) = queue.pop_front() {
            if depth >= max_depth {
                continue;
            }
            for neighbor in self.neighbors(&current) {
                if parent.contains_key(&neighbor) {
                    continue;
                }
                parent.insert(neighbor, current);
                if neighbor == end {
                    let mut path = vec![neighbor];
                    let mut cursor = current;
                    while cursor != start {
                        path.push(cursor);
                        cursor = parent[&cursor];
                    }
                    path.push(start);
                    path.reverse();
                    return Some(path);
                }
                queue.push_back((neighbor, depth + 1));
            }
        }
        None
    }

    pub fn query_by_metadata(
        &self,
        concept_type: Option<ConceptType>,
        organization_id: Option<&str>,
        tags: &[String],
        attributes: &HashMap<String, String>,
        limit: usize,
    ) -> Vec<ConceptNode> {
        let mut results = Vec::new();
        for shard in &self.shards {
            if results.len() >= limit {
                break;
            }
            results.extend(shard.query_by_metadata(
                concept_type,
                organization_id,
                tags,
                attributes,
                limit - results.len(),
            ));
        }
        results
    }

    // ========================
    // SYSTEM API
    // ========================

    /// Flush every shard in parallel
    pub fn flush(&self) -> Result<()> {
        self.shards
            .par_iter()
            .map(|shard| shard.flush())
            .collect::<Result<Vec<_>>>()?;
        Ok(())
    }

    pub fn stats(&self) -> AggregatedStats {
        let shard_stats: Vec<ConcurrentStats> =
            self.shards.iter().map(|shard| shard.stats()).collect();

        AggregatedStats {
            num_shards: self.config.num_shards,
            total_concepts: shard_stats.iter().map(|s| s.snapshot.concept_count).sum(),
            total_edges: shard_stats.iter().map(|s| s.snapshot.edge_count).sum(),
            max_generation: shard_stats
                .iter()
                .map(|s| s.snapshot.generation)
                .max()
                .unwrap_or(0),
            total_written: shard_stats.iter().map(|s| s.write_log.written).sum(),
            total_rejected: shard_stats.iter().map(|s| s.write_log.rejected).sum(),
            total_pending: shard_stats.iter().map(|s| s.write_log.pending).sum(),
            total_reconciliations: shard_stats
                .iter()
                .map(|s| s.reconciler.reconciliations)
                .sum(),
            shard_stats,
        }
    }

    pub fn is_read_only(&self) -> bool {
        self.shards.iter().any(|s| s.is_read_only())
    }

    pub fn dimension(&self) -> usize {
        self.config.shard_config.dimension
    }

    pub fn num_shards(&self) -> u32 {
        self.config.num_shards
    }

    pub fn shutdown(&self) {
        for shard in &self.shards {
            shard.shutdown();
        }
    }
}

/// Aggregated statistics across all shards
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedStats {
    pub num_shards: u32,
    pub total_concepts: usize,
    pub total_edges: usize,
    pub max_generation: u64,
    pub total_written: u64,
    pub total_rejected: u64,
    pub total_pending: usize,
    pub total_reconciliations: u64,
    pub shard_stats: Vec<ConcurrentStats>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconciler::AdaptiveReconcilerConfig;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    fn test_config(dir: &TempDir, num_shards: u32) -> ShardConfig {
        ShardConfig {
            num_shards,
            base_path: dir.path().to_path_buf(),
            shard_config: ConcurrentConfig {
                storage_path: PathBuf::from("overridden-per-shard"),
                dimension: 4,
                write_log_capacity: 1000,
                reconciler: AdaptiveReconcilerConfig {
                    base_interval_ms: 5,
                    ..Default::default()
                },
                ..Default::default()
            },
        }
    }

    fn wait_for<F: Fn() -> bool>(condition: F) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_routing_distributes() {
        let dir = TempDir::new().unwrap();
        let storage = ShardedStorage::open(test_config(&dir, 4)).unwrap();

        for i in 0..64 {
            let mut v = vec![0.0; 4];
            v[i % 4] = 1.0;
            storage
                .learn_concept(&format!("concept {}", i), v, 1.0, 0.9, Default::default())
                .unwrap();
        }

        wait_for(|| storage.stats().total_concepts == 64);

        let stats = storage.stats();
        let non_empty = stats
            .shard_stats
            .iter()
            .filter(|s| s.snapshot.concept_count > 0)
            .count();
        assert!(non_empty >= 3, "concepts should spread across shards");

        storage.shutdown();
    }

    #[test]
    fn test_invalid_shard_count() {
        let dir = TempDir::new().unwrap();
        assert!(ShardedStorage::open(test_config(&dir, 3)).is_err());
    }

    #[test]
    fn test_cross_shard_association_and_path() {
        let dir = TempDir::new().unwrap();
        let storage = ShardedStorage::open(test_config(&dir, 4)).unwrap();

        let a = storage
            .learn_concept("first", vec![1.0, 0.0, 0.0, 0.0], 1.0, 0.9, Default::default())
            .unwrap();
        let b = storage
            .learn_concept("second", vec![0.0, 1.0, 0.0, 0.0], 1.0, 0.9, Default::default())
            .unwrap();

        storage
            .learn_association(a, b, AssociationType::Causal, 0.8)
            .unwrap();

        wait_for(|| storage.neighbors(&a) == vec![b]);

        let path = storage.find_path(a, b, 2).unwrap();
        assert_eq!(path, vec![a, b]);

        storage.shutdown();
    }

    #[test]
    fn test_cross_shard_association_missing_target() {
        let dir = TempDir::new().unwrap();
        let storage = ShardedStorage::open(test_config(&dir, 4)).unwrap();

        let a = storage
            .learn_concept("present", vec![1.0, 0.0, 0.0, 0.0], 1.0, 0.9, Default::default())
            .unwrap();
        let ghost = ConceptId::from_content("never learned");

        let err = storage
            .learn_association(a, ghost, AssociationType::Semantic, 0.8)
            .unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));

        // The abort left no dangling edge behind
        wait_for(|| storage.stats().total_pending == 0);
        assert!(storage.neighbors(&a).is_empty());

        storage.shutdown();
    }

    #[test]
    fn test_sharded_search_merges() {
        let dir = TempDir::new().unwrap();
        let storage = ShardedStorage::open(test_config(&dir, 4)).unwrap();

        for i in 0..16 {
            let angle = i as f32 / 16.0;
            storage
                .learn_concept(
                    &format!("vec {}", i),
                    vec![1.0 - angle, angle, 0.0, 0.0],
                    1.0,
                    0.9,
                    Default::default(),
                )
                .unwrap();
        }

        wait_for(|| storage.stats().total_concepts == 16);

        let results = storage
            .vector_search(&[1.0, 0.0, 0.0, 0.0], 5, 64, None)
            .unwrap();
        assert_eq!(results.len(), 5);
        for pair in results.windows(2) {
            assert!(pair[0].1 >= pair[1].1);
        }

        storage.shutdown();
    }

    #[test]
    fn test_sharded_restart() {
        let dir = TempDir::new().unwrap();

        let (a, b) = {
            let storage = ShardedStorage::open(test_config(&dir, 4)).unwrap();
            let a = storage
                .learn_concept("alpha", vec![1.0, 0.0, 0.0, 0.0], 1.0, 0.9, Default::default())
                .unwrap();
            let b = storage
                .learn_concept("beta", vec![0.0, 1.0, 0.0, 0.0], 1.0, 0.9, Default::default())
                .unwrap();
            storage
                .learn_association(a, b, AssociationType::Semantic, 0.7)
                .unwrap();
            storage.flush().unwrap();
            storage.shutdown();
            (a, b)
        };

        let storage = ShardedStorage::open(test_config(&dir, 4)).unwrap();
        assert_eq!(storage.stats().total_concepts, 2);
        assert!(storage.query_concept(&a).is_some());
        wait_for(|| storage.neighbors(&a) == vec![b]);

        storage.shutdown();
    }
}
