/// Storage trait for the learning pipeline and TCP server
///
/// Both ConcurrentMemory and ShardedStorage implement this, so the upper
/// layers work with either deployment shape.
use crate::concurrent_memory::ConcurrentMemory;
use crate::error::Result;
use crate::read_view::ConceptNode;
use crate::sharded_storage::ShardedStorage;
use crate::types::{AssociationType, ConceptId, ConceptMetadata};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use sutra_protocol::ConceptType;

/// Uniform stats summary across deployment shapes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSummary {
    pub concepts: u64,
    pub edges: u64,
    pub generation: u64,
    pub written: u64,
    pub rejected: u64,
    pub pending: u64,
    pub reconciliations: u64,
}

/// Common storage operations for the engine's upper layers
pub trait GraphStorage: Send + Sync + 'static {
    fn learn_concept(
        &self,
        content: &str,
        embedding: Vec<f32>,
        strength: f32,
        confidence: f32,
        metadata: ConceptMetadata,
    ) -> Result<ConceptId>;

    fn learn_association(
        &self,
        source: ConceptId,
        target: ConceptId,
        assoc_type: AssociationType,
        confidence: f32,
    ) -> Result<u64>;

    fn learn_with_associations(
        &self,
        content: &str,
        embedding: Vec<f32>,
        strength: f32,
        confidence: f32,
        metadata: ConceptMetadata,
        edges: &[(ConceptId, AssociationType, f32)],
    ) -> Result<(ConceptId, u32)>;

    fn query_concept(&self, id: &ConceptId) -> Option<ConceptNode>;

    fn neighbors(&self, id: &ConceptId) -> Vec<ConceptId>;

    fn contains(&self, id: &ConceptId) -> bool;

    fn vector_search(
        &self,
        query: &[f32],
        k: usize,
        ef_search: usize,
        organization_filter: Option<&str>,
    ) -> Result<Vec<(ConceptId, f32)>>;

    fn find_path(
        &self,
        start: ConceptId,
        end: ConceptId,
        max_depth: usize,
    ) -> Option<Vec<ConceptId>>;

    fn query_by_metadata(
        &self,
        concept_type: Option<ConceptType>,
        organization_id: Option<&str>,
        tags: &[String],
        attributes: &HashMap<String, String>,
        limit: usize,
    ) -> Vec<ConceptNode>;

    fn flush(&self) -> Result<()>;

    fn summary(&self) -> StorageSummary;

    fn dimension(&self) -> usize;

    fn shutdown(&self);
}

impl GraphStorage for ConcurrentMemory {
    fn learn_concept(
        &self,
        content: &str,
        embedding: Vec<f32>,
        strength: f32,
        confidence: f32,
        metadata: ConceptMetadata,
    ) -> Result<ConceptId> {
        ConcurrentMemory::learn_concept(self, content, embedding, strength, confidence, metadata)
    }

    fn learn_association(
        &self,
        source: ConceptId,
        target: ConceptId,
        assoc_type: AssociationType,
        confidence: f32,
    ) -> Result<u64> {
        ConcurrentMemory::learn_association(self, source, target, assoc_type, confidence)
    }

    fn learn_with_associations(
        &self,
        content: &str,
        embedding: Vec<f32>,
        strength: f32,
        confidence: f32,
        metadata: ConceptMetadata,
        edges: &[(ConceptId, AssociationType, f32)],
    ) -> Result<(ConceptId, u32)> {
        ConcurrentMemory::learn_with_associations(
            self, content, embedding, strength, confidence, metadata, edges,
        )
    }

    fn query_concept(&self, id: &ConceptId) -> Option<ConceptNode> {
        ConcurrentMemory::query_concept(self, id)
    }

    fn neighbors(&self, id: &ConceptId) -> Vec<ConceptId> {
        ConcurrentMemory::neighbors(self, id)
    }

    fn contains(&self, id: &ConceptId) -> bool {
        ConcurrentMemory::contains(self, id)
    }

    fn vector_search(
        &self,
        query: &[f32],
        k: usize,
        ef_search: usize,
        organization_filter: Option<&str>,
    ) -> Result<Vec<(ConceptId, f32)>> {
        ConcurrentMemory::vector_search(self, query, k, ef_search, organization_filter)
    }

    fn find_path(
        &self,
        start: ConceptId,
        end: ConceptId,
        max_depth: usize,
    ) -> Option<Vec<ConceptId>> {
        ConcurrentMemory::find_path(self, start, end, max_depth)
    }

    fn query_by_metadata(
        &self,
        concept_type: Option<ConceptType>,
        organization_id: Option<&str>,
        tags: &[String],
        attributes: &HashMap<String, String>,
        limit: usize,
    ) -> Vec<ConceptNode> {
        ConcurrentMemory::query_by_metadata(
            self,
            concept_type,
            organization_id,
            tags,
            attributes,
            limit,
        )
    }

    fn flush(&self) -> Result<()> {
        ConcurrentMemory::flush(self)
    }

    fn summary(&self) -> StorageSummary {
        let stats = self.stats();
        StorageSummary {
            concepts: stats.snapshot.concept_count as u64,
            edges: stats.snapshot.edge_count as u64,
            generation: stats.snapshot.generation,
            written: stats.write_log.written,
            rejected: stats.write_log.rejected,
            pending: stats.write_log.pending as u64,
            reconciliations: stats.reconciler.reconciliations,
        }
    }

    fn dimension(&self) -> usize {
        ConcurrentMemory::dimension(self)
    }

    fn shutdown(&self) {
        ConcurrentMemory::shutdown(self)
    }
}

impl GraphStorage for ShardedStorage {
    fn learn_concept(
        &self,
        content: &str,
        embedding: Vec<f32>,
        strength: f32,
        confidence: f32,
        metadata: ConceptMetadata,
    ) -> Result<ConceptId> {
        ShardedStorage::learn_concept(self, content, embedding, strength, confidence, metadata)
    }

    fn learn_association(
        &self,
        source: ConceptId,
        target: ConceptId,
        assoc_type: AssociationType,
        confidence: f32,
    ) -> Result<u64> {
        ShardedStorage::learn_association(self, source, target, assoc_type, confidence)
    }

    fn learn_with_associations(
        &self,
        content: &str,
        embedding: Vec<f32>,
        strength: f32,
        confidence: f32,
        metadata: ConceptMetadata,
        edges: &[(ConceptId, AssociationType, f32)],
    ) -> Result<(ConceptId, u32)> {
        ShardedStorage::learn_with_associations(
            self, content, embedding, strength, confidence, metadata, edges,
        )
    }

    fn query_concept(&self, id: &ConceptId) -> Option<ConceptNode> {
        ShardedStorage::query_concept(self, id)
    }

    fn neighbors(&self, id: &ConceptId) -> Vec<ConceptId> {
        ShardedStorage::neighbors(self, id)
    }

    fn contains(&self, id: &ConceptId) -> bool {
        ShardedStorage::contains(self, id)
    }

    fn vector_search(
        &self,
        query: &[f32],
        k: usize,
        ef_search: usize,
        organization_filter: Option<&str>,
    ) -> Result<Vec<(ConceptId, f32)>> {
        ShardedStorage::vector_search(self, query, k, ef_search, organization_filter)
    }

    fn find_path(
        &self,
        start: ConceptId,
        end: ConceptId,
        max_depth: usize,
    ) -> Option<Vec<ConceptId>> {
        ShardedStorage::find_path(self, start, end, max_depth)
    }

    fn query_by_metadata(
        &self,
        concept_type: Option<ConceptType>,
        organization_id: Option<&str>,
        tags: &[String],
        attributes: &HashMap<String, String>,
        limit: usize,
    ) -> Vec<ConceptNode> {
        ShardedStorage::query_by_metadata(
            self,
            concept_type,
            organization_id,
            tags,
            attributes,
            limit,
        )
    }

    fn flush(&self) -> Result<()> {
        ShardedStorage::flush(self)
    }

    fn summary(&self) -> StorageSummary {
        let stats = self.stats();
        StorageSummary {
            concepts: stats.total_concepts as u64,
            edges: stats.total_edges as u64,
            generation: stats.max_generation,
            written: stats.total_written,
            rejected: stats.total_rejected,
            pending: stats.total_pending as u64,
            reconciliations: stats.total_reconciliations,
        }
    }

    fn dimension(&self) -> usize {
        ShardedStorage::dimension(self)
    }

    fn shutdown(&self) {
        ShardedStorage::shutdown(self)
    }
}
