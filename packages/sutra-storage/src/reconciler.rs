/// Adaptive Reconciler - self-tuning background reconciliation
///
/// Runs in a dedicated thread per shard, invisible to readers and writers:
/// drains the write log, applies mutations to a structurally-shared copy of
/// the current snapshot, updates the vector index, atomically publishes the
/// new ReadView, and periodically persists snapshot + index and checkpoints
/// the WAL.
///
/// The drain interval adapts to load using an EMA of queue depth:
/// - utilization < 20%: 100 ms (idle, save CPU)
/// - 20% - 70%: 10 ms (normal)
/// - above 70%: 5 ms down to 1 ms, linear in pressure (aggressive drain)
use crate::error::{Result, StorageError};
use crate::hnsw_container::HnswContainer;
use crate::read_view::{ConceptNode, GraphSnapshot, ReadView};
use crate::snapshot::write_snapshot;
use crate::types::ConceptId;
use crate::wal::Wal;
use crate::write_log::{WriteEntry, WriteLog};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Adaptive reconciler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptiveReconcilerConfig {
    /// Interval at normal load (milliseconds)
    pub base_interval_ms: u64,

    /// Interval floor under saturation (milliseconds)
    pub min_interval_ms: u64,

    /// Interval where the high-load ramp starts (milliseconds)
    pub high_interval_ms: u64,

    /// Interval when idle (milliseconds); also the staleness bound, so a
    /// non-empty queue is always drained within this window
    pub max_interval_ms: u64,

    /// Max batch size per reconciliation
    pub max_batch_size: usize,

    /// Persist snapshot + index + WAL checkpoint every N non-empty batches
    pub persist_every_batches: u64,

    /// ... or after this many seconds since the last persist
    pub persist_interval_secs: u64,

    /// EMA alpha for smoothing (0-1, higher = more reactive)
    pub ema_alpha: f64,

    /// Look-back window for trend analysis (reconciliation cycles)
    pub trend_window_size: usize,
}

impl Default for AdaptiveReconcilerConfig {
    fn default() -> Self {
        Self {
            base_interval_ms: 10,
            min_interval_ms: 1,
            high_interval_ms: 5,
            max_interval_ms: 100,
            max_batch_size: 10_000,
            persist_every_batches: 64,
            persist_interval_secs: 30,
            ema_alpha: 0.3,
            trend_window_size: 50,
        }
    }
}

impl AdaptiveReconcilerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.min_interval_ms == 0 {
            anyhow::bail!("min_interval_ms must be > 0");
        }
        if self.min_interval_ms > self.high_interval_ms {
            anyhow::bail!(
                "min_interval_ms ({}) must be <= high_interval_ms ({})",
                self.min_interval_ms,
                self.high_interval_ms
            );
        }
        if self.high_interval_ms > self.base_interval_ms {
            anyhow::bail!(
                "high_interval_ms ({}) must be <= base_interval_ms ({})",
                self.high_interval_ms,
                self.base_interval_ms
            );
        }
        if self.base_interval_ms > self.max_interval_ms {
            anyhow::bail!(
                "base_interval_ms ({}) must be <= max_interval_ms ({})",
                self.base_interval_ms,
                self.max_interval_ms
            );
        }
        if self.max_batch_size == 0 {
            anyhow::bail!("max_batch_size must be > 0");
        }
        if self.ema_alpha <= 0.0 || self.ema_alpha > 1.0 {
            anyhow::bail!("ema_alpha must be in (0.0, 1.0], got {}", self.ema_alpha);
        }
        if self.trend_window_size == 0 {
            anyhow::bail!("trend_window_size must be > 0");
        }
        Ok(())
    }
}

/// Reconciler health classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Recommendation {
    Good,
    Warning,
    Critical,
}

/// Reconciler statistics with predictive metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptiveReconcilerStats {
    pub reconciliations: u64,
    pub entries_processed: u64,
    pub snapshot_persists: u64,
    pub running: bool,

    pub queue_depth: usize,
    pub queue_capacity: usize,
    pub queue_utilization: f64,

    pub current_interval_ms: u64,
    pub processing_rate_per_sec: f64,
    pub interval_adjustments: u64,

    pub predicted_queue_depth: usize,
    pub health_score: f64,
    pub recommendation: Recommendation,
}

/// Workload trend analyzer
struct TrendAnalyzer {
    /// Recent queue depths (circular buffer)
    queue_history: VecDeque<usize>,

    /// EMA of queue depth
    queue_ema: f64,

    /// EMA of processing rate (entries/sec)
    rate_ema: f64,

    ema_alpha: f64,
    window_size: usize,
}

impl TrendAnalyzer {
    fn new(ema_alpha: f64, window_size: usize) -> Self {
        Self {
            queue_history: VecDeque::with_capacity(window_size),
            queue_ema: 0.0,
            rate_ema: 0.0,
            ema_alpha,
            window_size,
        }
    }

    fn update(&mut self, queue_depth: usize, processing_rate: f64) {
        if self.queue_history.is_empty() {
            self.queue_ema = queue_depth as f64;
            self.rate_ema = processing_rate;
        } else {
            self.queue_ema =
                self.ema_alpha * queue_depth as f64 + (1.0 - self.ema_alpha) * self.queue_ema;
            self.rate_ema =
                self.ema_alpha * processing_rate + (1.0 - self.ema_alpha) * self.rate_ema;
        }

        self.queue_history.push_back(queue_depth);
        if self.queue_history.len() > self.window_size {
            self.queue_history.pop_front();
        }
    }

    /// Predict queue depth for the next cycle via linear extrapolation
    fn predict_next_queue_depth(&self) -> usize {
        if self.queue_history.len() < 2 {
            return self.queue_ema as usize;
        }

        let take = self.queue_history.len().min(5);
        let recent_avg: f64 = self
            .queue_history
            .iter()
            .rev()
            .take(take)
            .map(|&x| x as f64)
            .sum::<f64>()
            / take as f64;
        let old_avg: f64 = self
            .queue_history
            .iter()
            .take(take)
            .map(|&x| x as f64)
            .sum::<f64>()
            / take as f64;
        let slope = recent_avg - old_avg;

        (self.queue_ema + slope).max(0.0) as usize
    }

    /// Map smoothed utilization to a drain interval
    fn optimal_interval(&self, config: &AdaptiveReconcilerConfig, queue_capacity: usize) -> u64 {
        let utilization = self.queue_ema / queue_capacity as f64;

        let interval = if utilization < 0.20 {
            config.max_interval_ms
        } else if utilization <= 0.70 {
            config.base_interval_ms
        } else {
            // Linear ramp from high_interval_ms at 70% to min_interval_ms at 100%
            let pressure = ((utilization - 0.70) / 0.30).min(1.0);
            let range = (config.high_interval_ms - config.min_interval_ms) as f64;
            config.high_interval_ms - (range * pressure) as u64
        };

        interval
            .max(config.min_interval_ms)
            .min(config.max_interval_ms)
    }

    /// Health score (0.0 = critical, 1.0 = excellent)
    fn health_score(&self, queue_capacity: usize) -> f64 {
        let utilization = self.queue_ema / queue_capacity as f64;

        if utilization < 0.30 {
            1.0
        } else if utilization < 0.70 {
            1.0 - (utilization - 0.30) * 1.25
        } else if utilization < 0.90 {
            0.5 - (utilization - 0.70) * 1.5
        } else {
            0.2 - (utilization - 0.90) * 2.0
        }
        .max(0.0)
    }
}

fn recommendation_for(health_score: f64) -> Recommendation {
    if health_score > 0.5 {
        Recommendation::Good
    } else if health_score > 0.2 {
        Recommendation::Warning
    } else {
        Recommendation::Critical
    }
}

/// Shared persistence state: serializes snapshot/index/checkpoint writes
/// between the reconciler's periodic persist and an explicit `flush()`.
pub struct PersistContext {
    pub snapshot_path: PathBuf,
    pub dimension: usize,
    pub hnsw: Arc<HnswContainer>,
    pub wal: Arc<Wal>,
    /// First WAL LSN NOT covered by the published ReadView; the checkpoint
    /// keeps everything from it onward
    pub applied_frontier: Arc<AtomicU64>,
    /// Set when a persist hits disk-full; the engine then refuses writes
    pub read_only: Arc<AtomicBool>,
    lock: Mutex<()>,
}

impl PersistContext {
    pub fn new(
        snapshot_path: PathBuf,
        dimension: usize,
        hnsw: Arc<HnswContainer>,
        wal: Arc<Wal>,
        read_only: Arc<AtomicBool>,
    ) -> Self {
        Self {
            snapshot_path,
            dimension,
            hnsw,
            wal,
            applied_frontier: Arc::new(AtomicU64::new(0)),
            read_only,
            lock: Mutex::new(()),
        }
    }

    /// HNSW save, then snapshot write, then WAL checkpoint — in that order,
    /// so a crash between steps never loses acknowledged data.
    pub fn persist(&self, snapshot: &GraphSnapshot) -> Result<()> {
        let _guard = self.lock.lock();
        let keep_from = self.applied_frontier.load(Ordering::Acquire);
        let result = self
            .hnsw
            .save()
            .and_then(|_| write_snapshot(&self.snapshot_path, snapshot, self.dimension))
            .and_then(|_| {
                self.wal
                    .checkpoint(snapshot.generation, keep_from)
                    .map(|_| ())
            });

        if matches!(result, Err(StorageError::DiskFull)) {
            self.read_only.store(true, Ordering::SeqCst);
            log::error!("disk full during persist; engine is now read-only");
        }
        result
    }
}

/// Adaptive reconciler with self-optimization
pub struct AdaptiveReconciler {
    config: AdaptiveReconcilerConfig,
    write_log: Arc<WriteLog>,
    read_view: Arc<ReadView>,
    hnsw: Arc<HnswContainer>,
    persist: Arc<PersistContext>,

    /// Control
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,

    /// Metrics
    reconciliations: Arc<AtomicU64>,
    entries_processed: Arc<AtomicU64>,
    snapshot_persists: Arc<AtomicU64>,
    interval_adjustments: Arc<AtomicU64>,
    current_interval_ms: Arc<AtomicU64>,

    trend_analyzer: Arc<Mutex<TrendAnalyzer>>,
}

impl AdaptiveReconciler {
    pub fn new(
        config: AdaptiveReconcilerConfig,
        write_log: Arc<WriteLog>,
        read_view: Arc<ReadView>,
        hnsw: Arc<HnswContainer>,
        persist: Arc<PersistContext>,
    ) -> Self {
        let trend_analyzer = Arc::new(Mutex::new(TrendAnalyzer::new(
            config.ema_alpha,
            config.trend_window_size,
        )));

        Self {
            current_interval_ms: Arc::new(AtomicU64::new(config.base_interval_ms)),
            config,
            write_log,
            read_view,
            hnsw,
            persist,
            running: Arc::new(AtomicBool::new(false)),
            thread_handle: None,
            reconciliations: Arc::new(AtomicU64::new(0)),
            entries_processed: Arc::new(AtomicU64::new(0)),
            snapshot_persists: Arc::new(AtomicU64::new(0)),
            interval_adjustments: Arc::new(AtomicU64::new(0)),
            trend_analyzer,
        }
    }

    /// Start the reconciliation thread
    pub fn start(&mut self) {
        if self.running.load(Ordering::Relaxed) {
            return;
        }

        self.running.store(true, Ordering::Relaxed);

        let worker = Worker {
            config: self.config.clone(),
            write_log: Arc::clone(&self.write_log),
            read_view: Arc::clone(&self.read_view),
            hnsw: Arc::clone(&self.hnsw),
            persist: Arc::clone(&self.persist),
            running: Arc::clone(&self.running),
            reconciliations: Arc::clone(&self.reconciliations),
            entries_processed: Arc::clone(&self.entries_processed),
            snapshot_persists: Arc::clone(&self.snapshot_persists),
            interval_adjustments: Arc::clone(&self.interval_adjustments),
            current_interval_ms: Arc::clone(&self.current_interval_ms),
            trend_analyzer: Arc::clone(&self.trend_analyzer),
        };

        let handle = thread::spawn(move || worker.run());

        self.thread_handle = Some(handle);
        log::info!(
            "adaptive reconciler started (base interval: {}ms)",
            self.config.base_interval_ms
        );
    }

    /// Stop the thread after it drains what is still queued. Nothing is
    /// persisted here; un-checkpointed records replay from the WAL.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);

        if let Some(handle) = self.thread_handle.take() {
            handle.join().ok();
        }
        log::info!("adaptive reconciler stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> AdaptiveReconcilerStats {
        let write_stats = self.write_log.stats();
        let queue_depth = write_stats.pending;
        let queue_capacity = write_stats.capacity;
        let queue_utilization = queue_depth as f64 / queue_capacity as f64;

        let analyzer = self.trend_analyzer.lock();
        let predicted_queue_depth = analyzer.predict_next_queue_depth();
        let health_score = analyzer.health_score(queue_capacity);
        let processing_rate = analyzer.rate_ema;
        drop(analyzer);

        AdaptiveReconcilerStats {
            reconciliations: self.reconciliations.load(Ordering::Relaxed),
            entries_processed: self.entries_processed.load(Ordering::Relaxed),
            snapshot_persists: self.snapshot_persists.load(Ordering::Relaxed),
            running: self.running.load(Ordering::Relaxed),
            queue_depth,
            queue_capacity,
            queue_utilization,
            current_interval_ms: self.current_interval_ms.load(Ordering::Relaxed),
            processing_rate_per_sec: processing_rate,
            interval_adjustments: self.interval_adjustments.load(Ordering::Relaxed),
            predicted_queue_depth,
            health_score,
            recommendation: recommendation_for(health_score),
        }
    }
}

impl Drop for AdaptiveReconciler {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Worker {
    config: AdaptiveReconcilerConfig,
    write_log: Arc<WriteLog>,
    read_view: Arc<ReadView>,
    hnsw: Arc<HnswContainer>,
    persist: Arc<PersistContext>,
    running: Arc<AtomicBool>,
    reconciliations: Arc<AtomicU64>,
    entries_processed: Arc<AtomicU64>,
    snapshot_persists: Arc<AtomicU64>,
    interval_adjustments: Arc<AtomicU64>,
    current_interval_ms: Arc<AtomicU64>,
    trend_analyzer: Arc<Mutex<TrendAnalyzer>>,
}

impl Worker {
    fn run(self) {
        let mut cycle_count = 0u64;
        let mut batches_since_persist = 0u64;
        let mut last_persist = Instant::now();
        let mut dirty_since_persist = false;

        loop {
            let keep_running = self.running.load(Ordering::Relaxed);

            let cycle_start = Instant::now();
            let batch = self.write_log.drain_batch(self.config.max_batch_size);
            let batch_size = batch.len();

            if !batch.is_empty() {
                self.apply_and_publish(batch);
                batches_since_persist += 1;
                dirty_since_persist = true;
            }

            let should_persist = dirty_since_persist
                && (batches_since_persist >= self.config.persist_every_batches
                    || last_persist.elapsed().as_secs() >= self.config.persist_interval_secs);

            if should_persist {
                let snapshot = self.read_view.load();
                match self.persist.persist(&snapshot) {
                    Ok(()) => {
                        self.snapshot_persists.fetch_add(1, Ordering::Relaxed);
                        batches_since_persist = 0;
                        dirty_since_persist = false;
                        last_persist = Instant::now();
                    }
                    Err(e) => {
                        log::error!("periodic persist failed: {}", e);
                        // Back off; retry on the next persist trigger
                        last_persist = Instant::now();
                    }
                }
            }

            if !keep_running && self.write_log.pending() == 0 {
                // Stop without persisting: anything not yet checkpointed is
                // still in the WAL and replays on the next open
                break;
            }

            // Update trend + interval
            let cycle_duration = cycle_start.elapsed();
            let processing_rate = if cycle_duration.as_secs_f64() > 0.0 {
                batch_size as f64 / cycle_duration.as_secs_f64()
            } else {
                0.0
            };
            let queue_depth = self.write_log.pending();

            {
                let mut analyzer = self.trend_analyzer.lock();
                analyzer.update(queue_depth, processing_rate);

                if cycle_count % 10 == 0 {
                    let new_interval =
                        analyzer.optimal_interval(&self.config, self.write_log.capacity());
                    let old_interval = self.current_interval_ms.load(Ordering::Relaxed);

                    if new_interval != old_interval {
                        self.current_interval_ms.store(new_interval, Ordering::Relaxed);
                        self.interval_adjustments.fetch_add(1, Ordering::Relaxed);

                        log::debug!(
                            "reconcile interval adjusted: {}ms -> {}ms (queue: {}/{}, rate: {:.0}/sec)",
                            old_interval,
                            new_interval,
                            queue_depth,
                            self.write_log.capacity(),
                            processing_rate
                        );
                    }
                }

                if cycle_count % 100 == 0 {
                    let health = analyzer.health_score(self.write_log.capacity());
                    if recommendation_for(health) != Recommendation::Good {
                        log::warn!(
                            "reconciler backlog: {}/{} (predicted next: {}, health: {:.2})",
                            queue_depth,
                            self.write_log.capacity(),
                            analyzer.predict_next_queue_depth(),
                            health
                        );
                    }
                }
            }

            cycle_count += 1;

            if keep_running {
                let interval = self.current_interval_ms.load(Ordering::Relaxed);
                self.sleep_interruptibly(Duration::from_millis(interval));
            }
        }
    }

    /// Sleep in small slices so stop() does not wait out a long idle interval
    fn sleep_interruptibly(&self, total: Duration) {
        let slice = Duration::from_millis(10);
        let deadline = Instant::now() + total;
        while Instant::now() < deadline {
            if !self.running.load(Ordering::Relaxed) {
                return;
            }
            thread::sleep(slice.min(deadline - Instant::now()));
        }
    }

    /// Apply a batch in FIFO order, update the index, publish atomically
    fn apply_and_publish(&self, batch: Vec<WriteEntry>) {
        let current = self.read_view.load();

        // Structural sharing via im::HashMap makes this clone cheap
        let mut new_snapshot = GraphSnapshot {
            concepts: current.concepts.clone(),
            generation: current.generation + 1,
            timestamp: crate::types::current_timestamp_us(),
            concept_count: current.concept_count,
            edge_count: current.edge_count,
        };

        let batch_size = batch.len();
        let mut high_lsn = 0u64;
        for entry in batch {
            high_lsn = high_lsn.max(entry.lsn());
            if let Err(e) = apply_entry(&mut new_snapshot, &self.hnsw, entry) {
                // Per-record failures are logged and skipped; the WAL record
                // still counts as processed
                log::warn!("skipped write entry: {}", e);
            }
        }

        new_snapshot.update_stats();
        self.read_view.store(new_snapshot);
        self.persist
            .applied_frontier
            .fetch_max(high_lsn + 1, Ordering::Release);

        self.reconciliations.fetch_add(1, Ordering::Relaxed);
        self.entries_processed
            .fetch_add(batch_size as u64, Ordering::Relaxed);
    }
}

/// Apply a single write entry to the snapshot and vector index
pub fn apply_entry(
    snapshot: &mut GraphSnapshot,
    hnsw: &HnswContainer,
    entry: WriteEntry,
) -> Result<()> {
    match entry {
        WriteEntry::AddConcept {
            id,
            content,
            embedding,
            strength,
            confidence,
            metadata,
            timestamp,
            ..
        } => {
            match snapshot.concepts.get_mut(&id) {
                Some(existing) => {
                    existing.merge_learn(strength, confidence, &metadata, timestamp);
                }
                None => {
                    if let Some(vec) = &embedding {
                        hnsw.insert(id, vec)?;
                    }
                    let node = ConceptNode::new(
                        id, content, embedding, strength, confidence, metadata, timestamp,
                    );
                    snapshot.concepts.insert(id, node);
                }
            }
            Ok(())
        }

        WriteEntry::AddAssociation { record, .. } => {
            match snapshot.concepts.get_mut(&record.source_id) {
                Some(source) => {
                    source.add_edge(record);
                    Ok(())
                }
                None => Err(StorageError::NotFound(record.source_id)),
            }
        }

        WriteEntry::DeleteConcept { id, .. } => {
            if snapshot.concepts.remove(&id).is_none() {
                return Err(StorageError::NotFound(id));
            }
            hnsw.remove(id)?;

            // Drop in-edges pointing at the deleted concept
            let sources: Vec<ConceptId> = snapshot
                .concepts
                .iter()
                .filter(|(_, node)| node.neighbors.contains(&id))
                .map(|(source, _)| *source)
                .collect();
            for source in sources {
                if let Some(node) = snapshot.concepts.get_mut(&source) {
                    node.neighbors.retain(|n| *n != id);
                    node.edges.retain(|e| e.target_id != id);
                }
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hnsw_container::HnswConfig;
    use std::collections::HashMap;
    use sutra_protocol::ConceptMetadata;
    use tempfile::TempDir;

    fn test_setup(dir: &TempDir) -> (Arc<WriteLog>, Arc<ReadView>, AdaptiveReconciler) {
        let write_log = Arc::new(WriteLog::new(1000));
        let read_view = Arc::new(ReadView::new());
        let hnsw = Arc::new(
            HnswContainer::load_or_build(
                dir.path().join("storage.idx"),
                HnswConfig {
                    dimension: 4,
                    ..Default::default()
                },
                &HashMap::new(),
            )
            .unwrap(),
        );
        let (wal, _) = Wal::open(dir.path().join("wal.log"), false).unwrap();
        let persist = Arc::new(PersistContext::new(
            dir.path().join("storage.dat"),
            4,
            Arc::clone(&hnsw),
            Arc::new(wal),
            Arc::new(AtomicBool::new(false)),
        ));

        let reconciler = AdaptiveReconciler::new(
            AdaptiveReconcilerConfig {
                base_interval_ms: 5,
                ..Default::default()
            },
            Arc::clone(&write_log),
            Arc::clone(&read_view),
            hnsw,
            persist,
        );
        (write_log, read_view, reconciler)
    }

    fn concept_entry(n: u8) -> WriteEntry {
        WriteEntry::AddConcept {
            lsn: n as u64,
            id: ConceptId([n; 8]),
            content: Arc::from(format!("concept {}", n)),
            embedding: Some(Arc::from(vec![n as f32, 0.0, 0.0, 1.0].into_boxed_slice())),
            strength: 1.0,
            confidence: 0.9,
            metadata: ConceptMetadata::default(),
            timestamp: crate::types::current_timestamp_us(),
        }
    }

    #[test]
    fn test_reconcile_publishes_new_generation() {
        let dir = TempDir::new().unwrap();
        let (write_log, read_view, mut reconciler) = test_setup(&dir);

        reconciler.start();

        write_log.push(concept_entry(1)).unwrap();
        write_log.push(concept_entry(2)).unwrap();

        thread::sleep(Duration::from_millis(150));

        let snapshot = read_view.load();
        assert!(snapshot.generation >= 1);
        assert_eq!(snapshot.concept_count, 2);
        assert!(snapshot.contains(&ConceptId([1; 8])));

        reconciler.stop();
    }

    #[test]
    fn test_association_requires_endpoint() {
        let dir = TempDir::new().unwrap();
        let (write_log, read_view, mut reconciler) = test_setup(&dir);
        reconciler.start();

        write_log.push(concept_entry(1)).unwrap();
        write_log.push(concept_entry(2)).unwrap();
        write_log
            .push(WriteEntry::AddAssociation {
                lsn: 100,
                record: crate::types::AssociationRecord::new(
                    ConceptId([1; 8]),
                    ConceptId([2; 8]),
                    crate::types::AssociationType::Semantic,
                    0.8,
                ),
            })
            .unwrap();
        // Missing source: logged and skipped without wedging the loop
        write_log
            .push(WriteEntry::AddAssociation {
                lsn: 100,
                record: crate::types::AssociationRecord::new(
                    ConceptId([99; 8]),
                    ConceptId([2; 8]),
                    crate::types::AssociationType::Semantic,
                    0.8,
                ),
            })
            .unwrap();

        thread::sleep(Duration::from_millis(150));

        let snapshot = read_view.load();
        assert_eq!(snapshot.get_neighbors(&ConceptId([1; 8])), vec![ConceptId([2; 8])]);
        assert_eq!(snapshot.edge_count, 1);

        reconciler.stop();
    }

    #[test]
    fn test_duplicate_learn_merges() {
        let dir = TempDir::new().unwrap();
        let (write_log, read_view, mut reconciler) = test_setup(&dir);
        reconciler.start();

        let id = ConceptId([1; 8]);
        for strength in [0.5f32, 0.8, 0.3] {
            write_log
                .push(WriteEntry::AddConcept {
                    lsn: 0,
                    id,
                    content: Arc::from("same concept"),
                    embedding: None,
                    strength,
                    confidence: strength,
                    metadata: ConceptMetadata::default(),
                    timestamp: crate::types::current_timestamp_us(),
                })
                .unwrap();
        }

        thread::sleep(Duration::from_millis(150));

        let snapshot = read_view.load();
        assert_eq!(snapshot.concept_count, 1);
        let node = snapshot.get_concept(&id).unwrap();
        // max(0.5, 0.8, 0.3) — strength never regresses
        assert_eq!(node.strength, 0.8);
        // last learn's confidence wins
        assert_eq!(node.confidence, 0.3);

        reconciler.stop();
    }

    #[test]
    fn test_delete_removes_in_edges() {
        let dir = TempDir::new().unwrap();
        let (write_log, read_view, mut reconciler) = test_setup(&dir);
        reconciler.start();

        write_log.push(concept_entry(1)).unwrap();
        write_log.push(concept_entry(2)).unwrap();
        write_log
            .push(WriteEntry::AddAssociation {
                lsn: 100,
                record: crate::types::AssociationRecord::new(
                    ConceptId([1; 8]),
                    ConceptId([2; 8]),
                    crate::types::AssociationType::Semantic,
                    0.8,
                ),
            })
            .unwrap();
        thread::sleep(Duration::from_millis(100));

        write_log
            .push(WriteEntry::DeleteConcept {
                lsn: 101,
                id: ConceptId([2; 8]),
                timestamp: crate::types::current_timestamp_us(),
            })
            .unwrap();
        thread::sleep(Duration::from_millis(100));

        let snapshot = read_view.load();
        assert!(!snapshot.contains(&ConceptId([2; 8])));
        assert!(snapshot.get_neighbors(&ConceptId([1; 8])).is_empty());

        reconciler.stop();
    }

    #[test]
    fn test_trend_analyzer_prediction() {
        let mut analyzer = TrendAnalyzer::new(0.3, 50);

        for i in 0..20 {
            analyzer.update(i * 100, 1000.0);
        }

        assert!(analyzer.predict_next_queue_depth() > 1500);
    }

    #[test]
    fn test_interval_mapping() {
        let config = AdaptiveReconcilerConfig::default();
        let mut analyzer = TrendAnalyzer::new(1.0, 50); // alpha 1.0: no smoothing

        analyzer.update(1_000, 5000.0); // 1% utilization
        assert_eq!(analyzer.optimal_interval(&config, 100_000), 100);

        analyzer.update(50_000, 5000.0); // 50%
        assert_eq!(analyzer.optimal_interval(&config, 100_000), 10);

        analyzer.update(100_000, 1000.0); // saturated
        assert_eq!(analyzer.optimal_interval(&config, 100_000), 1);

        analyzer.update(80_000, 1000.0); // 80%: inside the 5ms -> 1ms ramp
        let interval = analyzer.optimal_interval(&config, 100_000);
        assert!((1..=5).contains(&interval));
    }

    #[test]
    fn test_health_and_recommendation() {
        let mut analyzer = TrendAnalyzer::new(1.0, 50);

        analyzer.update(10_000, 1000.0);
        let health = analyzer.health_score(100_000);
        assert!(health > 0.8);
        assert_eq!(recommendation_for(health), Recommendation::Good);

        analyzer.update(95_000, 1000.0);
        let health = analyzer.health_score(100_000);
        assert!(health < 0.2);
        assert_eq!(recommendation_for(health), Recommendation::Critical);
    }

    #[test]
    fn test_config_validation() {
        assert!(AdaptiveReconcilerConfig::default().validate().is_ok());

        let bad = AdaptiveReconcilerConfig {
            min_interval_ms: 0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());

        let bad = AdaptiveReconcilerConfig {
            base_interval_ms: 200,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }
}
