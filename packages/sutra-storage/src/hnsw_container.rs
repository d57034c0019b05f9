/// HNSW Container - persistent approximate-nearest-neighbor index
///
/// Wraps a USearch index (cosine metric, single-file format, mmap load).
/// Concept ids are 8 bytes, so they are used directly as USearch keys and no
/// id-mapping sidecar is needed.
///
/// Consistency contract: the index is mutated only by the reconciler inside
/// the critical section that publishes a new ReadView, so `search` always
/// sees the vector set of the current generation.
use crate::error::{Result, StorageError};
use crate::types::ConceptId;
use anyhow::Context;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Instant;
use usearch::ffi::{IndexOptions, MetricKind, ScalarKind};
use usearch::Index;

#[derive(Debug, Clone)]
pub struct HnswConfig {
    /// Vector dimension (deployment-wide D)
    pub dimension: usize,
    /// Max neighbors (M parameter)
    pub max_neighbors: usize,
    /// Construction parameter (ef_construction)
    pub ef_construction: usize,
    /// Query-time expansion floor
    pub ef_search: usize,
}

impl Default for HnswConfig {
    fn default() -> Self {
        Self {
            dimension: 768,
            max_neighbors: 16,
            ef_construction: 200,
            ef_search: 64,
        }
    }
}

/// HNSW container with persistence support
pub struct HnswContainer {
    /// Path to the index file (storage.idx)
    path: PathBuf,
    index: RwLock<Index>,
    config: HnswConfig,
    /// Track if the index needs saving
    dirty: RwLock<bool>,
}

impl HnswContainer {
    fn make_index(config: &HnswConfig) -> Result<Index> {
        Index::new(&IndexOptions {
            dimensions: config.dimension,
            metric: MetricKind::Cos,
            quantization: ScalarKind::F32,
            connectivity: config.max_neighbors,
            expansion_add: config.ef_construction,
            expansion_search: config.ef_search,
            multi: false,
        })
        .context("Failed to create USearch index")
        .map_err(StorageError::internal)
    }

    /// Load the index from disk, or build it from `vectors` when the file is
    /// absent, unreadable, or from an incompatible format version.
    pub fn load_or_build(
        path: impl AsRef<Path>,
        config: HnswConfig,
        vectors: &HashMap<ConceptId, Vec<f32>>,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let index = Self::make_index(&config)?;
        let start = Instant::now();

        if path.exists() {
            match index.load(path.to_str().unwrap_or_default()) {
                Ok(()) => {
                    log::info!(
                        "loaded HNSW index: {} vectors in {:.2}ms",
                        index.size(),
                        start.elapsed().as_secs_f64() * 1000.0
                    );

                    let container = Self {
                        path,
                        index: RwLock::new(index),
                        config,
                        dirty: RwLock::new(false),
                    };
                    container.reconcile_missing(vectors)?;
                    return Ok(container);
                }
                Err(e) => {
                    // Version mismatch or damaged file: rebuild below
                    log::warn!("HNSW index load failed, rebuilding: {}", e);
                }
            }
        }

        let index = Self::make_index(&config)?;
        if !vectors.is_empty() {
            log::info!("building HNSW index from {} vectors", vectors.len());
            index
                .reserve(vectors.len())
                .context("Failed to reserve index capacity")
                .map_err(StorageError::internal)?;
            for (id, vector) in vectors {
                index
                    .add(id.as_key(), vector)
                    .context("Failed to add vector to index")
                    .map_err(StorageError::internal)?;
            }
            log::info!(
                "built HNSW index with {} vectors in {:.2}s",
                vectors.len(),
                start.elapsed().as_secs_f64()
            );
        }

        Ok(Self {
            path,
            index: RwLock::new(index),
            config,
            dirty: RwLock::new(!vectors.is_empty()),
        })
    }

    /// Insert vectors the loaded file does not know about yet (the snapshot
    /// may be newer than the last index save)
    fn reconcile_missing(&self, vectors: &HashMap<ConceptId, Vec<f32>>) -> Result<()> {
        let index = self.index.read();
        let missing: Vec<_> = vectors
            .iter()
            .filter(|(id, _)| !index.contains(id.as_key()))
            .collect();
        if missing.is_empty() {
            return Ok(());
        }

        log::info!("adding {} vectors missing from loaded index", missing.len());
        index
            .reserve(index.size() + missing.len())
            .context("Failed to reserve capacity for incremental inserts")
            .map_err(StorageError::internal)?;
        for (id, vector) in missing {
            index
                .add(id.as_key(), vector)
                .context("Failed to add vector to index")
                .map_err(StorageError::internal)?;
        }
        drop(index);
        *self.dirty.write() = true;
        Ok(())
    }

    /// Insert or replace a single vector (reconciler only)
    pub fn insert(&self, id: ConceptId, vector: &[f32]) -> Result<()> {
        if vector.len() != self.config.dimension {
            return Err(StorageError::DimMismatch {
                expected: self.config.dimension,
                got: vector.len(),
            });
        }

        let index = self.index.read();
        if index.contains(id.as_key()) {
            // Content-derived ids make re-learn embeddings identical; nothing
            // to update.
            return Ok(());
        }
        index
            .reserve(index.size() + 1)
            .context("Failed to reserve capacity for insert")
            .map_err(StorageError::internal)?;
        index
            .add(id.as_key(), vector)
            .context("Failed to add vector to index")
            .map_err(StorageError::internal)?;
        drop(index);

        *self.dirty.write() = true;
        Ok(())
    }

    /// Remove a concept's vector (reconciler only, on delete)
    pub fn remove(&self, id: ConceptId) -> Result<()> {
        let index = self.index.read();
        if index.contains(id.as_key()) {
            index
                .remove(id.as_key())
                .context("Failed to remove vector from index")
                .map_err(StorageError::internal)?;
            drop(index);
            *self.dirty.write() = true;
        }
        Ok(())
    }

    /// Search k nearest neighbors, scored by cosine similarity descending
    /// with ties broken by id.
    pub fn search(&self, query: &[f32], k: usize, _ef_search: usize) -> Vec<(ConceptId, f32)> {
        let index = self.index.read();
        let matches = match index.search(query, k) {
            Ok(m) => m,
            Err(e) => {
                log::error!("HNSW search failed: {}", e);
                return Vec::new();
            }
        };

        let mut results: Vec<(ConceptId, f32)> = matches
            .keys
            .iter()
            .zip(matches.distances.iter())
            .map(|(key, distance)| {
                // Cosine distance -> cosine similarity
                let score = 1.0 - distance.min(1.0);
                (ConceptId::from_key(*key), score)
            })
            .collect();

        results.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        results
    }

    /// Save the index to its single file, if dirty
    pub fn save(&self) -> Result<()> {
        if !*self.dirty.read() {
            log::debug!("HNSW index is clean, skipping save");
            return Ok(());
        }

        let start = Instant::now();
        let index = self.index.read();
        index
            .save(self.path.to_str().unwrap_or_default())
            .context("Failed to save USearch index")
            .map_err(StorageError::internal)?;
        let count = index.size();
        drop(index);

        *self.dirty.write() = false;
        log::info!(
            "saved HNSW index with {} vectors in {:.2}ms",
            count,
            start.elapsed().as_secs_f64() * 1000.0
        );
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.index.read().size()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_dirty(&self) -> bool {
        *self.dirty.read()
    }

    pub fn dimension(&self) -> usize {
        self.config.dimension
    }
}
