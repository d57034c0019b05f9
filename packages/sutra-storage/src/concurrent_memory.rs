/// Concurrent Memory - main coordinator for burst-tolerant storage
///
/// Unified API that hides the write/read plane separation:
/// - Writes: validate, WAL append (blocks until durable), WriteLog push
///   (non-blocking), return
/// - Reads: one atomic snapshot load plus synchronous lookups; never touch
///   the WAL or the WriteLog
/// - A background adaptive reconciler merges continuously and persists
///
/// Startup: mmap snapshot, load HNSW, replay the WAL tail, publish the
/// initial ReadView, start the reconciler.
use crate::config::EngineConfig;
use crate::error::{Result, StorageError};
use crate::hnsw_container::{HnswConfig, HnswContainer};
use crate::read_view::{ConceptNode, GraphSnapshot, ReadView};
use crate::reconciler::{
    apply_entry, AdaptiveReconciler, AdaptiveReconcilerConfig, AdaptiveReconcilerStats,
    PersistContext,
};
use crate::snapshot::load_snapshot;
use crate::types::{
    current_timestamp_us, AssociationRecord, AssociationType, ConceptId, ConceptMetadata,
};
use crate::wal::{PreparedEdge, Wal, WalKind, WalRecord};
use crate::write_log::{WriteEntry, WriteLog, WriteLogError, WriteLogStats};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use sutra_protocol::{ConceptType, MAX_CONTENT_SIZE};

/// Path depth cap for find_path
pub const MAX_PATH_DEPTH: usize = 16;

/// How long flush() waits for the reconciler to drain before persisting
const FLUSH_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Concurrent memory configuration
#[derive(Debug, Clone)]
pub struct ConcurrentConfig {
    /// Storage base path (one directory per shard)
    pub storage_path: PathBuf,

    /// Deployment-wide embedding dimension D
    pub dimension: usize,

    /// WriteLog capacity before back-pressure
    pub write_log_capacity: usize,

    /// Concept quota; exceeding it fails the learn with QuotaExceeded
    pub max_concepts: Option<u64>,

    /// Continue past mid-log WAL corruption instead of refusing to start
    pub force_recovery: bool,

    pub reconciler: AdaptiveReconcilerConfig,
}

impl Default for ConcurrentConfig {
    fn default() -> Self {
        Self {
            storage_path: PathBuf::from("./storage"),
            dimension: 768,
            write_log_capacity: 100_000,
            max_concepts: None,
            force_recovery: false,
            reconciler: AdaptiveReconcilerConfig::default(),
        }
    }
}

impl ConcurrentConfig {
    pub fn from_engine(engine: &EngineConfig, storage_path: PathBuf) -> Self {
        Self {
            storage_path,
            dimension: engine.dimension,
            write_log_capacity: engine.write_log_capacity,
            max_concepts: engine.max_concepts,
            force_recovery: engine.force_recovery,
            reconciler: engine.reconciler.clone(),
        }
    }
}

/// Snapshot metadata
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub generation: u64,
    pub timestamp: u64,
    pub concept_count: usize,
    pub edge_count: usize,
}

/// Complete system statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrentStats {
    pub write_log: WriteLogStats,
    pub reconciler: AdaptiveReconcilerStats,
    pub snapshot: SnapshotInfo,
}

/// Main concurrent memory system (one shard)
pub struct ConcurrentMemory {
    /// Write plane
    write_log: Arc<WriteLog>,

    /// Read plane (immutable snapshots)
    read_view: Arc<ReadView>,

    /// Vector index, mutated only inside the reconciler's publish section
    hnsw: Arc<HnswContainer>,

    /// Durability
    wal: Arc<Wal>,
    persist: Arc<PersistContext>,

    /// Background reconciler
    reconciler: Mutex<AdaptiveReconciler>,

    /// Ids accepted by this shard, including writes still in flight toward
    /// the next snapshot; backs referential-integrity checks and the quota
    known_ids: DashMap<ConceptId, ()>,

    /// 2PC: prepared-but-undecided transactions
    prepared: Mutex<HashMap<u64, Option<PreparedEdge>>>,

    /// Transactions recovered in-doubt from the WAL, awaiting the coordinator
    in_doubt: Mutex<Vec<u64>>,

    /// Disk-full latch; when set every write is refused
    read_only: Arc<AtomicBool>,

    /// First LSN past everything pushed to the WriteLog; flush() waits for
    /// the reconciler's applied frontier to reach it
    push_frontier: AtomicU64,

    config: ConcurrentConfig,
}

impl ConcurrentMemory {
    /// Open (or create) a shard at `config.storage_path` and start its
    /// reconciler.
    pub fn open(config: ConcurrentConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.storage_path).map_err(StorageError::from_io)?;

        let snapshot_path = config.storage_path.join("storage.dat");
        let index_path = config.storage_path.join("storage.idx");
        let wal_path = config.storage_path.join("wal.log");

        // 1. mmap the durable snapshot
        let (mut snapshot, vectors) = if snapshot_path.exists() {
            let loaded = load_snapshot(&snapshot_path)?;
            if loaded.dimension != config.dimension {
                return Err(StorageError::Corruption(format!(
                    "snapshot dimension {} does not match deployment dimension {}",
                    loaded.dimension, config.dimension
                )));
            }
            (loaded.snapshot, loaded.vectors)
        } else {
            (GraphSnapshot::new(0), HashMap::new())
        };

        // 2. load or rebuild the vector index
        let hnsw = Arc::new(HnswContainer::load_or_build(
            &index_path,
            HnswConfig {
                dimension: config.dimension,
                ..Default::default()
            },
            &vectors,
        )?);

        // 3. replay WAL records past the last checkpoint
        let (wal, tail) = Wal::open(&wal_path, config.force_recovery)?;
        let wal = Arc::new(wal);

        let mut prepared: HashMap<u64, Option<PreparedEdge>> = HashMap::new();
        let replayed = Self::replay_tail(&mut snapshot, &hnsw, tail, &mut prepared)?;
        if replayed > 0 {
            snapshot.generation += 1;
            snapshot.update_stats();
            log::info!("replayed {} WAL records into generation {}", replayed, snapshot.generation);
        }

        let in_doubt: Vec<u64> = prepared.keys().copied().collect();
        if !in_doubt.is_empty() {
            log::warn!("{} in-doubt transactions await coordinator recovery", in_doubt.len());
        }

        let known_ids = DashMap::new();
        for id in snapshot.concepts.keys() {
            known_ids.insert(*id, ());
        }

        // 4. publish the initial ReadView
        let read_view = Arc::new(ReadView::with_initial(snapshot));

        let read_only = Arc::new(AtomicBool::new(false));
        let persist = Arc::new(PersistContext::new(
            snapshot_path,
            config.dimension,
            Arc::clone(&hnsw),
            Arc::clone(&wal),
            Arc::clone(&read_only),
        ));
        // Everything replayed above is covered by the in-memory snapshot
        persist
            .applied_frontier
            .store(wal.next_lsn(), Ordering::Release);

        let write_log = Arc::new(WriteLog::new(config.write_log_capacity));

        let mut reconciler = AdaptiveReconciler::new(
            config.reconciler.clone(),
            Arc::clone(&write_log),
            Arc::clone(&read_view),
            Arc::clone(&hnsw),
            Arc::clone(&persist),
        );
        reconciler.start();

        Ok(Self {
            write_log,
            read_view,
            hnsw,
            wal,
            persist,
            reconciler: Mutex::new(reconciler),
            known_ids,
            prepared: Mutex::new(prepared),
            in_doubt: Mutex::new(in_doubt),
            read_only,
            push_frontier: AtomicU64::new(0),
            config,
        })
    }

    fn replay_tail(
        snapshot: &mut GraphSnapshot,
        hnsw: &HnswContainer,
        tail: Vec<WalRecord>,
        prepared: &mut HashMap<u64, Option<PreparedEdge>>,
    ) -> Result<usize> {
        let mut applied = 0usize;

        for record in tail {
            let lsn = record.lsn;
            match record.kind {
                WalKind::Checkpoint { .. } => {}
                WalKind::LearnConcept {
                    id,
                    content,
                    embedding,
                    strength,
                    confidence,
                    metadata,
                } => {
                    let embedding = if embedding.is_empty() {
                        None
                    } else {
                        Some(Arc::from(embedding.into_boxed_slice()))
                    };
                    let entry = WriteEntry::AddConcept {
                        lsn,
                        id,
                        content: Arc::from(content),
                        embedding,
                        strength,
                        confidence,
                        metadata,
                        timestamp: current_timestamp_us(),
                    };
                    if let Err(e) = apply_entry(snapshot, hnsw, entry) {
                        log::warn!("replay skipped concept at lsn {}: {}", lsn, e);
                    } else {
                        applied += 1;
                    }
                }
                WalKind::LearnAssoc {
                    source,
                    target,
                    assoc_type,
                    confidence,
                } => {
                    let record = AssociationRecord {
                        source_id: source,
                        target_id: target,
                        assoc_type,
                        confidence,
                        created: current_timestamp_us(),
                    };
                    let entry = WriteEntry::AddAssociation { lsn, record };
                    if let Err(e) = apply_entry(snapshot, hnsw, entry) {
                        log::warn!("replay skipped association at lsn {}: {}", lsn, e);
                    } else {
                        applied += 1;
                    }
                }
                WalKind::Delete { id } => {
                    let entry = WriteEntry::DeleteConcept {
                        lsn,
                        id,
                        timestamp: current_timestamp_us(),
                    };
                    if let Err(e) = apply_entry(snapshot, hnsw, entry) {
                        log::warn!("replay skipped delete at lsn {}: {}", lsn, e);
                    } else {
                        applied += 1;
                    }
                }
                WalKind::Prepared { txn_id, edge } => {
                    prepared.insert(txn_id, edge);
                }
                WalKind::Commit { txn_id } => {
                    if let Some(Some(edge)) = prepared.remove(&txn_id) {
                        let record = AssociationRecord {
                            source_id: edge.source,
                            target_id: edge.target,
                            assoc_type: edge.assoc_type,
                            confidence: edge.confidence,
                            created: current_timestamp_us(),
                        };
                        let entry = WriteEntry::AddAssociation { lsn, record };
                        if let Err(e) = apply_entry(snapshot, hnsw, entry) {
                            log::warn!("replay skipped committed edge (txn {}): {}", txn_id, e);
                        } else {
                            applied += 1;
                        }
                    }
                }
                WalKind::Abort { txn_id } => {
                    prepared.remove(&txn_id);
                }
            }
        }

        Ok(applied)
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.read_only.load(Ordering::SeqCst) {
            return Err(StorageError::DiskFull);
        }
        Ok(())
    }

    fn wal_append(&self, kind: WalKind) -> Result<u64> {
        match self.wal.append(kind) {
            Ok(lsn) => Ok(lsn),
            Err(StorageError::DiskFull) => {
                self.read_only.store(true, Ordering::SeqCst);
                log::error!("disk full on WAL append; engine is now read-only");
                Err(StorageError::DiskFull)
            }
            Err(e) => Err(e),
        }
    }

    fn push_entry(&self, entry: WriteEntry) -> Result<()> {
        let lsn = entry.lsn();
        match self.write_log.push(entry) {
            Ok(()) => {
                self.push_frontier.fetch_max(lsn + 1, Ordering::Release);
                Ok(())
            }
            Err(WriteLogError::Full) => Err(StorageError::Backpressure),
            Err(WriteLogError::Disconnected) => Err(StorageError::internal("write log closed")),
        }
    }

    fn stamp_metadata(&self, mut metadata: ConceptMetadata, timestamp: u64) -> ConceptMetadata {
        if metadata.created_at == 0 {
            metadata.created_at = timestamp;
        }
        metadata.last_accessed = timestamp;
        metadata
    }

    fn validate_learn(&self, content: &str, embedding: &[f32]) -> Result<ConceptId> {
        if content.len() > MAX_CONTENT_SIZE {
            return Err(StorageError::Protocol(format!(
                "content too large: {} bytes (max {})",
                content.len(),
                MAX_CONTENT_SIZE
            )));
        }
        if embedding.len() != self.config.dimension {
            return Err(StorageError::DimMismatch {
                expected: self.config.dimension,
                got: embedding.len(),
            });
        }

        let id = ConceptId::from_content(content);
        if let Some(max) = self.config.max_concepts {
            if !self.known_ids.contains_key(&id) && self.known_ids.len() as u64 >= max {
                return Err(StorageError::QuotaExceeded(format!(
                    "concept quota of {} reached",
                    max
                )));
            }
        }
        Ok(id)
    }

    // ========================
    // WRITE API
    // ========================

    /// Learn a concept; id is derived from the normalized content
    pub fn learn_concept(
        &self,
        content: &str,
        embedding: Vec<f32>,
        strength: f32,
        confidence: f32,
        metadata: ConceptMetadata,
    ) -> Result<ConceptId> {
        self.ensure_writable()?;
        let id = self.validate_learn(content, &embedding)?;

        // Fast-fail before paying for the fsync
        if self.write_log.is_full() {
            return Err(StorageError::Backpressure);
        }

        let timestamp = current_timestamp_us();
        let metadata = self.stamp_metadata(metadata, timestamp);

        let lsn = self.wal_append(WalKind::LearnConcept {
            id,
            content: content.to_string(),
            embedding: embedding.clone(),
            strength,
            confidence,
            metadata: metadata.clone(),
        })?;

        self.push_entry(WriteEntry::AddConcept {
            lsn,
            id,
            content: Arc::from(content),
            embedding: Some(Arc::from(embedding.into_boxed_slice())),
            strength,
            confidence,
            metadata,
            timestamp,
        })?;

        self.known_ids.insert(id, ());
        Ok(id)
    }

    /// Learn an association; both endpoints must already exist on this shard
    pub fn learn_association(
        &self,
        source: ConceptId,
        target: ConceptId,
        assoc_type: AssociationType,
        confidence: f32,
    ) -> Result<u64> {
        self.ensure_writable()?;
        if !self.known_ids.contains_key(&source) {
            return Err(StorageError::NotFound(source));
        }
        if !self.known_ids.contains_key(&target) {
            return Err(StorageError::NotFound(target));
        }
        if self.write_log.is_full() {
            return Err(StorageError::Backpressure);
        }

        let record = AssociationRecord::new(source, target, assoc_type, confidence);
        let lsn = self.wal_append(WalKind::LearnAssoc {
            source,
            target,
            assoc_type: assoc_type as u32,
            confidence,
        })?;

        self.push_entry(WriteEntry::AddAssociation { lsn, record })?;
        Ok(lsn)
    }

    /// Learn a concept together with its extracted associations in a single
    /// WAL group commit. Targets that do not exist are dropped (the
    /// extractor is advisory).
    pub fn learn_with_associations(
        &self,
        content: &str,
        embedding: Vec<f32>,
        strength: f32,
        confidence: f32,
        metadata: ConceptMetadata,
        edges: &[(ConceptId, AssociationType, f32)],
    ) -> Result<(ConceptId, u32)> {
        self.ensure_writable()?;
        let id = self.validate_learn(content, &embedding)?;

        if self.write_log.is_full() {
            return Err(StorageError::Backpressure);
        }

        let timestamp = current_timestamp_us();
        let metadata = self.stamp_metadata(metadata, timestamp);

        let resolved: Vec<(ConceptId, AssociationType, f32)> = edges
            .iter()
            .copied()
            .filter(|&(target, _, _)| target != id && self.known_ids.contains_key(&target))
            .collect();

        let mut kinds = Vec::with_capacity(1 + resolved.len());
        kinds.push(WalKind::LearnConcept {
            id,
            content: content.to_string(),
            embedding: embedding.clone(),
            strength,
            confidence,
            metadata: metadata.clone(),
        });
        for &(target, assoc_type, edge_confidence) in &resolved {
            kinds.push(WalKind::LearnAssoc {
                source: id,
                target,
                assoc_type: assoc_type as u32,
                confidence: edge_confidence,
            });
        }

        let lsns = match self.wal.append_batch(&kinds) {
            Ok(lsns) => lsns,
            Err(StorageError::DiskFull) => {
                self.read_only.store(true, Ordering::SeqCst);
                return Err(StorageError::DiskFull);
            }
            Err(e) => return Err(e),
        };

        self.push_entry(WriteEntry::AddConcept {
            lsn: lsns[0],
            id,
            content: Arc::from(content),
            embedding: Some(Arc::from(embedding.into_boxed_slice())),
            strength,
            confidence,
            metadata,
            timestamp,
        })?;
        self.known_ids.insert(id, ());

        let mut created = 0u32;
        for (&(target, assoc_type, edge_confidence), &lsn) in resolved.iter().zip(&lsns[1..]) {
            let record = AssociationRecord::new(id, target, assoc_type, edge_confidence);
            if self
                .push_entry(WriteEntry::AddAssociation { lsn, record })
                .is_ok()
            {
                created += 1;
            }
        }

        Ok((id, created))
    }

    /// Delete a concept (internal; not reachable from the wire protocol)
    pub fn delete_concept(&self, id: ConceptId) -> Result<u64> {
        self.ensure_writable()?;
        if !self.known_ids.contains_key(&id) {
            return Err(StorageError::NotFound(id));
        }
        if self.write_log.is_full() {
            return Err(StorageError::Backpressure);
        }

        let lsn = self.wal_append(WalKind::Delete { id })?;
        self.push_entry(WriteEntry::DeleteConcept {
            lsn,
            id,
            timestamp: current_timestamp_us(),
        })?;
        self.known_ids.remove(&id);
        Ok(lsn)
    }

    // ========================
    // 2PC PARTICIPANT API
    // ========================

    /// Phase 1: validate the resident endpoint and durably reserve the
    /// transaction. The source shard carries the edge payload.
    pub fn prepare_association(
        &self,
        txn_id: u64,
        source: ConceptId,
        target: ConceptId,
        assoc_type: AssociationType,
        confidence: f32,
        holds_source: bool,
    ) -> Result<()> {
        self.ensure_writable()?;

        let resident = if holds_source { source } else { target };
        if !self.known_ids.contains_key(&resident) {
            return Err(StorageError::NotFound(resident));
        }
        if self.write_log.is_full() {
            return Err(StorageError::Backpressure);
        }

        let edge = holds_source.then(|| PreparedEdge {
            source,
            target,
            assoc_type: assoc_type as u32,
            confidence,
        });

        self.wal_append(WalKind::Prepared {
            txn_id,
            edge: edge.clone(),
        })?;
        self.prepared.lock().insert(txn_id, edge);
        Ok(())
    }

    /// Phase 2 (commit): log the outcome and apply the prepared edge.
    /// Returns the LSN of the Commit record.
    pub fn commit_txn(&self, txn_id: u64) -> Result<u64> {
        let lsn = self.wal_append(WalKind::Commit { txn_id })?;

        if let Some(Some(edge)) = self.prepared.lock().remove(&txn_id) {
            let record = AssociationRecord {
                source_id: edge.source,
                target_id: edge.target,
                assoc_type: edge.assoc_type,
                confidence: edge.confidence,
                created: current_timestamp_us(),
            };
            self.push_entry(WriteEntry::AddAssociation { lsn, record })?;
        }
        Ok(lsn)
    }

    /// Phase 2 (abort): log the outcome and drop the prepared edge
    pub fn abort_txn(&self, txn_id: u64) -> Result<()> {
        self.wal_append(WalKind::Abort { txn_id })?;
        self.prepared.lock().remove(&txn_id);
        Ok(())
    }

    /// Transactions left prepared-but-undecided by a crash
    pub fn take_in_doubt(&self) -> Vec<u64> {
        std::mem::take(&mut *self.in_doubt.lock())
    }

    // ========================
    // READ API (never blocks)
    // ========================

    pub fn query_concept(&self, id: &ConceptId) -> Option<ConceptNode> {
        self.read_view.load().get_concept(id).cloned()
    }

    /// Out-neighbors in insertion order
    pub fn neighbors(&self, id: &ConceptId) -> Vec<ConceptId> {
        self.read_view.load().get_neighbors(id)
    }

    pub fn neighbors_weighted(&self, id: &ConceptId) -> Vec<(ConceptId, f32)> {
        self.read_view.load().get_neighbors_weighted(id)
    }

    /// k-NN over the vector index, scored descending with ties broken by id
    pub fn vector_search(
        &self,
        query: &[f32],
        k: usize,
        ef_search: usize,
        organization_filter: Option<&str>,
    ) -> Result<Vec<(ConceptId, f32)>> {
        if query.len() != self.config.dimension {
            return Err(StorageError::DimMismatch {
                expected: self.config.dimension,
                got: query.len(),
            });
        }

        let snapshot = self.read_view.load();

        // Over-fetch when filtering so the post-filter cut still fills k
        let fetch = if organization_filter.is_some() {
            k.saturating_mul(4).max(k)
        } else {
            k
        };

        let mut results: Vec<(ConceptId, f32)> = self
            .hnsw
            .search(query, fetch, ef_search)
            .into_iter()
            .filter(|(id, _)| match snapshot.get_concept(id) {
                // The index may briefly know vectors the published snapshot
                // does not; those are invisible to readers
                None => false,
                Some(node) => match organization_filter {
                    None => true,
                    Some(org) => node.metadata.organization_id.as_deref() == Some(org),
                },
            })
            .collect();

        results.truncate(k);
        Ok(results)
    }

    /// Shortest BFS path, depth capped at 16
    pub fn find_path(
        &self,
        start: ConceptId,
        end: ConceptId,
        max_depth: usize,
    ) -> Option<Vec<ConceptId>> {
        let depth = max_depth.min(MAX_PATH_DEPTH);
        self.read_view.load().find_path(start, end, depth)
    }

    /// Scan concepts matching the metadata filter (no secondary index)
    pub fn query_by_metadata(
        &self,
        concept_type: Option<ConceptType>,
        organization_id: Option<&str>,
        tags: &[String],
        attributes: &HashMap<String, String>,
        limit: usize,
    ) -> Vec<ConceptNode> {
        let snapshot = self.read_view.load();
        snapshot
            .concepts
            .values()
            .filter(|node| {
                if let Some(ct) = concept_type {
                    if node.metadata.concept_type != ct {
                        return false;
                    }
                }
                if let Some(org) = organization_id {
                    if node.metadata.organization_id.as_deref() != Some(org) {
                        return false;
                    }
                }
                if !tags.iter().all(|t| node.metadata.tags.contains(t)) {
                    return false;
                }
                attributes
                    .iter()
                    .all(|(k, v)| node.metadata.attributes.get(k) == Some(v))
            })
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn contains(&self, id: &ConceptId) -> bool {
        self.known_ids.contains_key(id)
    }

    pub fn snapshot(&self) -> Arc<GraphSnapshot> {
        self.read_view.load()
    }

    pub fn snapshot_info(&self) -> SnapshotInfo {
        let snap = self.read_view.load();
        SnapshotInfo {
            generation: snap.generation,
            timestamp: snap.timestamp,
            concept_count: snap.concept_count,
            edge_count: snap.edge_count,
        }
    }

    // ========================
    // SYSTEM API
    // ========================

    /// Force snapshot + index persistence and a WAL checkpoint, after the
    /// reconciler has drained everything pending.
    pub fn flush(&self) -> Result<()> {
        let deadline = Instant::now() + FLUSH_DRAIN_TIMEOUT;
        loop {
            let drained = self.write_log.pending() == 0;
            let applied = self.persist.applied_frontier.load(Ordering::Acquire)
                >= self.push_frontier.load(Ordering::Acquire);
            if drained && applied {
                break;
            }
            if Instant::now() >= deadline {
                return Err(StorageError::Timeout(
                    "write log did not drain before flush".into(),
                ));
            }
            std::thread::sleep(Duration::from_millis(1));
        }

        let snapshot = self.read_view.load();
        self.persist.persist(&snapshot)
    }

    pub fn stats(&self) -> ConcurrentStats {
        ConcurrentStats {
            write_log: self.write_log.stats(),
            reconciler: self.reconciler.lock().stats(),
            snapshot: self.snapshot_info(),
        }
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &ConcurrentConfig {
        &self.config
    }

    pub fn dimension(&self) -> usize {
        self.config.dimension
    }

    /// Flush, then stop the reconciler. Anything a failed flush leaves
    /// behind is still durable in the WAL.
    pub fn shutdown(&self) {
        if let Err(e) = self.flush() {
            log::warn!("flush on shutdown failed: {}", e);
        }
        self.reconciler.lock().stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> ConcurrentConfig {
        ConcurrentConfig {
            storage_path: dir.path().to_path_buf(),
            dimension: 4,
            write_log_capacity: 1000,
            reconciler: AdaptiveReconcilerConfig {
                base_interval_ms: 5,
                ..Default::default()
            },
            ..Default::default()
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
    fn test_learn_and_query() {
        let dir = TempDir::new().unwrap();
        let memory = ConcurrentMemory::open(test_config(&dir)).unwrap();

        let id = memory
            .learn_concept(
                "hello world",
                vec![1.0, 0.0, 0.0, 0.0],
                0.5,
                0.9,
                ConceptMetadata::default(),
            )
            .unwrap();
        assert_eq!(id, ConceptId::from_content("hello world"));

        wait_for(|| memory.query_concept(&id).is_some());

        let node = memory.query_concept(&id).unwrap();
        assert_eq!(node.content.as_ref(), "hello world");
        assert_eq!(node.strength, 0.5);
        assert_eq!(node.confidence, 0.9);
        assert_eq!(node.embedding.as_ref().unwrap().as_ref(), &[1.0, 0.0, 0.0, 0.0]);

        memory.shutdown();
    }

    #[test]
    fn test_duplicate_learn_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let memory = ConcurrentMemory::open(test_config(&dir)).unwrap();

        let id1 = memory
            .learn_concept(
                "same content",
                vec![1.0, 0.0, 0.0, 0.0],
                0.5,
                0.9,
                ConceptMetadata::default(),
            )
            .unwrap();
        let id2 = memory
            .learn_concept(
                "same content",
                vec![1.0, 0.0, 0.0, 0.0],
                0.8,
                0.7,
                ConceptMetadata::default(),
            )
            .unwrap();
        assert_eq!(id1, id2);

        wait_for(|| {
            memory
                .query_concept(&id1)
                .map(|n| n.strength == 0.8)
                .unwrap_or(false)
        });

        assert_eq!(memory.snapshot_info().concept_count, 1);
        memory.shutdown();
    }

    #[test]
    fn test_association_requires_endpoints() {
        let dir = TempDir::new().unwrap();
        let memory = ConcurrentMemory::open(test_config(&dir)).unwrap();

        let a = memory
            .learn_concept("a", vec![1.0, 0.0, 0.0, 0.0], 1.0, 0.9, Default::default())
            .unwrap();
        let missing = ConceptId::from_content("never learned");

        let err = memory
            .learn_association(a, missing, AssociationType::Semantic, 0.8)
            .unwrap_err();
        assert!(matches!(err, StorageError::NotFound(id) if id == missing));

        memory.shutdown();
    }

    #[test]
    fn test_dim_mismatch() {
        let dir = TempDir::new().unwrap();
        let memory = ConcurrentMemory::open(test_config(&dir)).unwrap();

        let err = memory
            .learn_concept("a", vec![1.0, 0.0], 1.0, 0.9, Default::default())
            .unwrap_err();
        assert!(matches!(
            err,
            StorageError::DimMismatch {
                expected: 4,
                got: 2
            }
        ));

        let err = memory.vector_search(&[1.0], 5, 64, None).unwrap_err();
        assert!(matches!(err, StorageError::DimMismatch { .. }));

        memory.shutdown();
    }

    #[test]
    fn test_vector_search_ranking() {
        let dir = TempDir::new().unwrap();
        let memory = ConcurrentMemory::open(test_config(&dir)).unwrap();

        let a = memory
            .learn_concept("a", vec![1.0, 0.0, 0.0, 0.0], 1.0, 0.9, Default::default())
            .unwrap();
        let b = memory
            .learn_concept("b", vec![0.9, 0.1, 0.0, 0.0], 1.0, 0.9, Default::default())
            .unwrap();
        let _c = memory
            .learn_concept("c", vec![0.0, 1.0, 0.0, 0.0], 1.0, 0.9, Default::default())
            .unwrap();

        wait_for(|| memory.snapshot_info().concept_count == 3);

        let results = memory
            .vector_search(&[1.0, 0.0, 0.0, 0.0], 2, 64, None)
            .unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, a);
        assert_eq!(results[1].0, b);
        assert!(results[0].1 > results[1].1);

        memory.shutdown();
    }

    #[test]
    fn test_org_filtered_search() {
        let dir = TempDir::new().unwrap();
        let memory = ConcurrentMemory::open(test_config(&dir)).unwrap();

        let meta_org = ConceptMetadata::with_organization(
            ConceptType::DomainConcept,
            "acme".to_string(),
        );
        let a = memory
            .learn_concept("a", vec![1.0, 0.0, 0.0, 0.0], 1.0, 0.9, meta_org)
            .unwrap();
        let _b = memory
            .learn_concept("b", vec![0.99, 0.01, 0.0, 0.0], 1.0, 0.9, Default::default())
            .unwrap();

        wait_for(|| memory.snapshot_info().concept_count == 2);

        let results = memory
            .vector_search(&[1.0, 0.0, 0.0, 0.0], 2, 64, Some("acme"))
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, a);

        memory.shutdown();
    }

    #[test]
    fn test_find_path_scenario() {
        let dir = TempDir::new().unwrap();
        let memory = ConcurrentMemory::open(test_config(&dir)).unwrap();

        let ids: Vec<ConceptId> = ["A", "B", "C", "D"]
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let mut v = vec![0.0; 4];
                v[i] = 1.0;
                memory
                    .learn_concept(name, v, 1.0, 0.9, Default::default())
                    .unwrap()
            })
            .collect();

        memory
            .learn_association(ids[0], ids[1], AssociationType::Causal, 0.9)
            .unwrap();
        memory
            .learn_association(ids[1], ids[2], AssociationType::Causal, 0.9)
            .unwrap();
        memory
            .learn_association(ids[0], ids[3], AssociationType::Causal, 0.9)
            .unwrap();
        memory
            .learn_association(ids[3], ids[2], AssociationType::Causal, 0.9)
            .unwrap();

        wait_for(|| memory.snapshot_info().edge_count == 4);

        let path = memory.find_path(ids[0], ids[2], 2).unwrap();
        assert_eq!(path, vec![ids[0], ids[1], ids[2]]);

        memory.shutdown();
    }

    #[test]
    fn test_backpressure() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir);
        config.write_log_capacity = 4;
        // Park the reconciler so the queue cannot drain
        config.reconciler.base_interval_ms = 10_000;
        config.reconciler.max_interval_ms = 10_000;
        config.reconciler.high_interval_ms = 10_000;
        config.reconciler.min_interval_ms = 10_000;

        let memory = ConcurrentMemory::open(config).unwrap();
        // Give the reconciler time to enter its long sleep
        std::thread::sleep(Duration::from_millis(50));

        // 8 concurrent producers racing for 4 queue slots
        let results: Vec<std::result::Result<ConceptId, StorageError>> =
            std::thread::scope(|scope| {
                let handles: Vec<_> = (0..8)
                    .map(|i| {
                        let memory = &memory;
                        scope.spawn(move || {
                            memory.learn_concept(
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
        let backpressured = results
            .iter()
            .filter(|r| matches!(r, Err(StorageError::Backpressure)))
            .count();

        assert_eq!(accepted, 4);
        assert_eq!(backpressured, 4);

        // Drop without flushing; the parked reconciler exits on its own
        drop(memory);
    }

    #[test]
    fn test_quota() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir);
        config.max_concepts = Some(2);
        let memory = ConcurrentMemory::open(config).unwrap();

        memory
            .learn_concept("one", vec![1.0, 0.0, 0.0, 0.0], 1.0, 0.9, Default::default())
            .unwrap();
        memory
            .learn_concept("two", vec![0.0, 1.0, 0.0, 0.0], 1.0, 0.9, Default::default())
            .unwrap();

        let err = memory
            .learn_concept("three", vec![0.0, 0.0, 1.0, 0.0], 1.0, 0.9, Default::default())
            .unwrap_err();
        assert!(matches!(err, StorageError::QuotaExceeded(_)));

        // Re-learning an existing concept is not gated by the quota
        assert!(memory
            .learn_concept("one", vec![1.0, 0.0, 0.0, 0.0], 1.0, 0.9, Default::default())
            .is_ok());

        memory.shutdown();
    }

    #[test]
    fn test_flush_and_restart() {
        let dir = TempDir::new().unwrap();

        let id = {
            let memory = ConcurrentMemory::open(test_config(&dir)).unwrap();
            let id = memory
                .learn_concept(
                    "durable concept",
                    vec![1.0, 0.0, 0.0, 0.0],
                    0.6,
                    0.9,
                    Default::default(),
                )
                .unwrap();
            memory.flush().unwrap();
            memory.shutdown();
            id
        };

        let memory = ConcurrentMemory::open(test_config(&dir)).unwrap();
        let node = memory.query_concept(&id).unwrap();
        assert_eq!(node.content.as_ref(), "durable concept");
        assert_eq!(node.strength, 0.6);
        assert_eq!(memory.snapshot_info().concept_count, 1);

        memory.shutdown();
    }

    #[test]
    fn test_wal_replay_without_flush() {
        let dir = TempDir::new().unwrap();

        let ids: Vec<ConceptId> = {
            let memory = ConcurrentMemory::open(test_config(&dir)).unwrap();
            let ids = (0..50)
                .map(|i| {
                    memory
                        .learn_concept(
                            &format!("unflushed {}", i),
                            vec![i as f32, 1.0, 0.0, 0.0],
                            1.0,
                            0.9,
                            Default::default(),
                        )
                        .unwrap()
                })
                .collect();
            // No flush: drop with whatever the reconciler managed. The WAL
            // records survive and replay on restart.
            drop(memory);
            ids
        };

        let memory = ConcurrentMemory::open(test_config(&dir)).unwrap();
        assert_eq!(memory.snapshot_info().concept_count, 50);
        for id in ids {
            assert!(memory.query_concept(&id).is_some());
        }

        memory.shutdown();
    }

    #[test]
    fn test_generation_monotonic_across_restart() {
        let dir = TempDir::new().unwrap();

        let gen_before = {
            let memory = ConcurrentMemory::open(test_config(&dir)).unwrap();
            memory
                .learn_concept("g", vec![1.0, 0.0, 0.0, 0.0], 1.0, 0.9, Default::default())
                .unwrap();
            memory.flush().unwrap();
            let g = memory.snapshot_info().generation;
            memory.shutdown();
            g
        };

        let memory = ConcurrentMemory::open(test_config(&dir)).unwrap();
        assert!(memory.snapshot_info().generation >= gen_before);
        memory.shutdown();
    }
}
