/// Sutra Storage - concurrent knowledge graph storage engine
///
/// A single-node, embeddable store for a temporal knowledge graph
/// (concepts + typed associations + dense embeddings). Not a database.
///
/// Key Features:
/// - Lock-free write ingestion with a durable WAL
/// - Immutable read snapshots published atomically to readers
/// - Adaptive background reconciliation under varying load
/// - Persistent HNSW vector index kept consistent with the store
/// - Transactional sharding (2PC) for cross-shard associations
/// - Length-prefixed binary TCP protocol
mod association_extractor;
mod concurrent_memory;
mod config;
mod embedding_client;
mod error;
mod hnsw_container;
mod learning_pipeline;
mod read_view;
mod reconciler;
mod sharded_storage;
mod snapshot;
mod storage_trait;
mod tcp_server;
mod tls;
mod txn_coordinator;
mod types;
mod wal;
mod write_log;

pub use association_extractor::{AssociationExtractor, AssociationExtractorConfig, ExtractedAssoc};
pub use concurrent_memory::{
    ConcurrentConfig, ConcurrentMemory, ConcurrentStats, SnapshotInfo, MAX_PATH_DEPTH,
};
pub use config::{ConfigError, DeploymentMeta, EngineConfig, FileConfig, VALID_SHARD_COUNTS};
pub use embedding_client::{EmbeddingClient, EmbeddingConfig};
pub use error::{Result, StorageError};
pub use hnsw_container::{HnswConfig, HnswContainer};
pub use learning_pipeline::LearningPipeline;
pub use read_view::{ConceptNode, GraphSnapshot, ReadView};
pub use reconciler::{
    AdaptiveReconciler, AdaptiveReconcilerConfig, AdaptiveReconcilerStats, Recommendation,
};
pub use sharded_storage::{AggregatedStats, ShardConfig, ShardedStorage};
pub use snapshot::{load_snapshot, write_snapshot, LoadedSnapshot};
pub use storage_trait::{GraphStorage, StorageSummary};
pub use tcp_server::StorageServer;
pub use tls::build_acceptor;
pub use txn_coordinator::{AssocOp, TransactionCoordinator, TxnOutcome};
pub use types::{
    fnv1a, normalize_content, AssociationRecord, AssociationType, ConceptId, ConceptMetadata,
    ConceptRecord, ConceptType,
};
pub use wal::{PreparedEdge, Wal, WalKind, WalRecord};
pub use write_log::{WriteEntry, WriteLog, WriteLogError, WriteLogStats};

/// Version of the storage format
pub const STORAGE_VERSION: u32 = 0;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(STORAGE_VERSION, 0);
    }
}
