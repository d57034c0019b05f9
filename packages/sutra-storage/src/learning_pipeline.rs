//! Unified learning pipeline: embedding + association extraction + storage
//!
//! Server-side orchestration for LearnConceptV2 / LearnBatch, so clients
//! never call the embedding service themselves. Steps:
//!
//! 1. The concept id is the first 16 hex chars of SHA-256 over the
//!    normalized content (see `ConceptId::from_content`)
//! 2. Embedding fetch: 5s timeout, 2 retries with exponential backoff;
//!    final failure surfaces EmbeddingUnavailable with no partial state
//! 3. Association extraction (bounded at 2s): targets that resolve to
//!    existing concepts become edges, the rest are dropped
//! 4. Atomic store: one WAL group commit for the concept and its edges

use crate::association_extractor::{AssociationExtractor, AssociationExtractorConfig};
use crate::embedding_client::{EmbeddingClient, EmbeddingConfig};
use crate::error::{Result, StorageError};
use crate::storage_trait::GraphStorage;
use crate::types::{AssociationType, ConceptId};
use std::sync::Arc;
use std::time::Duration;
use sutra_protocol::LearnOptions;
use tracing::{debug, info, warn};

const EXTRACTION_TIMEOUT: Duration = Duration::from_secs(2);

pub struct LearningPipeline {
    embedding_client: EmbeddingClient,
    extractor: Arc<AssociationExtractor>,
}

impl LearningPipeline {
    pub fn new(embedding_url: String, dimension: usize) -> Result<Self> {
        let embedding_client =
            EmbeddingClient::new(EmbeddingConfig::new(embedding_url, dimension))?;
        let extractor = Arc::new(AssociationExtractor::new(
            AssociationExtractorConfig::default(),
        ));
        Ok(Self {
            embedding_client,
            extractor,
        })
    }

    /// Learn a single concept end-to-end.
    ///
    /// Returns the concept id and how many extracted associations were
    /// stored with it.
    pub async fn learn_concept<S: GraphStorage>(
        &self,
        storage: &S,
        content: &str,
        options: &LearnOptions,
    ) -> Result<(ConceptId, u32)> {
        debug!("pipeline learn_concept (len={})", content.len());

        let embedding = self.embedding_client.embed(content).await?;

        let edges = if options.extract_associations {
            self.resolve_associations(storage, content, options).await
        } else {
            Vec::new()
        };

        let metadata = options.metadata.clone().unwrap_or_default();
        let (id, created) = storage.learn_with_associations(
            content,
            embedding,
            options.strength,
            options.confidence,
            metadata,
            &edges,
        )?;

        debug!("stored concept {} with {} associations", id, created);
        Ok((id, created))
    }

    /// Learn a batch of concepts with a single embedding round-trip
    pub async fn learn_batch<S: GraphStorage>(
        &self,
        storage: &S,
        contents: &[String],
        options: &LearnOptions,
    ) -> Result<Vec<ConceptId>> {
        info!("pipeline learn_batch count={}", contents.len());

        let embeddings = self.embedding_client.embed_batch(contents).await?;

        let mut concept_ids = Vec::with_capacity(contents.len());
        for (content, embedding) in contents.iter().zip(embeddings) {
            let edges = if options.extract_associations {
                self.resolve_associations(storage, content, options).await
            } else {
                Vec::new()
            };

            let metadata = options.metadata.clone().unwrap_or_default();
            let (id, _) = storage.learn_with_associations(
                content,
                embedding,
                options.strength,
                options.confidence,
                metadata,
                &edges,
            )?;
            concept_ids.push(id);
        }

        Ok(concept_ids)
    }

    /// Run the extractor (bounded) and keep only targets that already exist
    async fn resolve_associations<S: GraphStorage>(
        &self,
        storage: &S,
        content: &str,
        options: &LearnOptions,
    ) -> Vec<(ConceptId, AssociationType, f32)> {
        let extractor = Arc::clone(&self.extractor);
        let text = content.to_string();

        let extracted = match tokio::time::timeout(
            EXTRACTION_TIMEOUT,
            tokio::task::spawn_blocking(move || extractor.extract(&text)),
        )
        .await
        {
            Ok(Ok(list)) => list,
            Ok(Err(e)) => {
                warn!("association extraction panicked: {}", e);
                return Vec::new();
            }
            Err(_) => {
                // The extractor is advisory; a timeout drops the edges,
                // never the learn
                warn!("association extraction timed out");
                return Vec::new();
            }
        };

        extracted
            .into_iter()
            .filter(|a| a.confidence >= options.min_association_confidence)
            .take(options.max_associations_per_concept)
            .filter_map(|a| {
                let target = ConceptId::from_content(&a.target_term);
                if storage.contains(&target) {
                    Some((target, a.kind, a.confidence))
                } else {
                    debug!("dropping association to unknown target '{}'", a.target_term);
                    None
                }
            })
            .collect()
    }
}
