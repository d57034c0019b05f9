//! TCP storage server speaking the length-prefixed binary protocol
//!
//! Each accepted connection runs in its own task; requests on a connection
//! are handled sequentially, so responses come back in request order.
//! Frames over 16 MiB, unknown protocol versions and undecodable payloads
//! drop the connection. A full WriteLog answers `Error{"backpressure"}` and
//! the client retries with jitter.

use crate::error::StorageError;
use crate::learning_pipeline::LearningPipeline;
use crate::storage_trait::GraphStorage;
use crate::types::{AssociationType, ConceptId};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use sutra_protocol::{
    read_message, write_message, ConceptSummary, ProtocolError, StorageRequest, StorageResponse,
    VectorMatch, MAX_BATCH_SIZE, MAX_CONTENT_SIZE,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::signal;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

/// Caps beyond the frame limit
const MAX_SEARCH_K: u32 = 1000;
const MAX_QUERY_LIMIT: u32 = 1000;

/// Storage server state
pub struct StorageServer<S: GraphStorage> {
    storage: Arc<S>,
    /// Present when an embedding service is configured; LearnConceptV2 and
    /// LearnBatch are rejected without it
    pipeline: Option<LearningPipeline>,
    tls: Option<TlsAcceptor>,
    start_time: Instant,
}

impl<S: GraphStorage> StorageServer<S> {
    pub fn new(storage: Arc<S>, pipeline: Option<LearningPipeline>) -> Self {
        Self {
            storage,
            pipeline,
            tls: None,
            start_time: Instant::now(),
        }
    }

    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls = Some(acceptor);
        self
    }

    /// Start serving; blocks until ctrl-c, then flushes and stops
    pub async fn serve(self: Arc<Self>, addr: SocketAddr) -> std::io::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!(
            "storage server listening on {} ({})",
            addr,
            if self.tls.is_some() { "tls" } else { "plaintext" }
        );

        let shutdown = signal::ctrl_c();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let server = Arc::clone(&self);
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream, peer_addr).await {
                                    debug!("client {} ended: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("accept error: {}", e);
                        }
                    }
                }
                _ = &mut shutdown => {
                    info!("shutdown signal received, flushing storage");
                    if let Err(e) = self.storage.flush() {
                        error!("flush on shutdown failed: {}", e);
                    }
                    self.storage.shutdown();
                    break;
                }
            }
        }

        Ok(())
    }

    async fn handle_connection(
        &self,
        stream: TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<(), ProtocolError> {
        stream.set_nodelay(true)?;
        debug!("client connected: {}", peer_addr);

        match &self.tls {
            Some(acceptor) => {
                let stream = acceptor.accept(stream).await?;
                self.request_loop(stream, peer_addr).await
            }
            None => self.request_loop(stream, peer_addr).await,
        }
    }

    async fn request_loop<IO>(
        &self,
        mut stream: IO,
        peer_addr: SocketAddr,
    ) -> Result<(), ProtocolError>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let mut request_count = 0u64;

        loop {
            let request: StorageRequest = match read_message(&mut stream).await {
                Ok(request) => request,
                Err(ProtocolError::ConnectionClosed) => {
                    debug!(
                        "client {} disconnected after {} requests",
                        peer_addr, request_count
                    );
                    return Ok(());
                }
                Err(e) => {
                    // Malformed frame, oversize or bad version: the stream
                    // is no longer trustworthy, drop the connection
                    warn!("protocol error from {}: {}", peer_addr, e);
                    return Err(e);
                }
            };

            let response = self.handle_request(request).await;
            write_message(&mut stream, &response).await?;
            request_count += 1;
        }
    }

    async fn handle_request(&self, request: StorageRequest) -> StorageResponse {
        match request {
            StorageRequest::LearnConcept {
                content,
                embedding,
                strength,
                confidence,
                metadata,
            } => {
                if content.len() > MAX_CONTENT_SIZE {
                    return StorageResponse::Error {
                        message: format!(
                            "content too large: {} bytes (max {})",
                            content.len(),
                            MAX_CONTENT_SIZE
                        ),
                    };
                }
                if let Some(ref meta) = metadata {
                    if let Err(e) = meta.validate() {
                        return StorageResponse::Error {
                            message: e.to_string(),
                        };
                    }
                }

                match self.storage.learn_concept(
                    &content,
                    embedding,
                    strength,
                    confidence,
                    metadata.unwrap_or_default(),
                ) {
                    Ok(id) => StorageResponse::LearnConceptOk {
                        concept_id: id.to_hex(),
                    },
                    Err(e) => error_response(e),
                }
            }

            StorageRequest::LearnConceptV2 { content, options } => {
                if content.len() > MAX_CONTENT_SIZE {
                    return StorageResponse::Error {
                        message: format!(
                            "content too large: {} bytes (max {})",
                            content.len(),
                            MAX_CONTENT_SIZE
                        ),
                    };
                }
                let pipeline = match &self.pipeline {
                    Some(pipeline) => pipeline,
                    None => {
                        return StorageResponse::Error {
                            message: "embedding service not configured".to_string(),
                        }
                    }
                };

                match pipeline
                    .learn_concept(self.storage.as_ref(), &content, &options)
                    .await
                {
                    Ok((id, associations_created)) => StorageResponse::LearnConceptV2Ok {
                        concept_id: id.to_hex(),
                        associations_created,
                    },
                    Err(e) => error_response(e),
                }
            }

            StorageRequest::LearnBatch { contents, options } => {
                if contents.len() > MAX_BATCH_SIZE {
                    return StorageResponse::Error {
                        message: format!(
                            "batch too large: {} items (max {})",
                            contents.len(),
                            MAX_BATCH_SIZE
                        ),
                    };
                }
                if let Some(oversize) = contents.iter().position(|c| c.len() > MAX_CONTENT_SIZE) {
                    return StorageResponse::Error {
                        message: format!("batch item {} exceeds content size limit", oversize),
                    };
                }
                let pipeline = match &self.pipeline {
                    Some(pipeline) => pipeline,
                    None => {
                        return StorageResponse::Error {
                            message: "embedding service not configured".to_string(),
                        }
                    }
                };

                match pipeline
                    .learn_batch(self.storage.as_ref(), &contents, &options)
                    .await
                {
                    Ok(ids) => StorageResponse::LearnBatchOk {
                        concept_ids: ids.iter().map(|id| id.to_hex()).collect(),
                    },
                    Err(e) => error_response(e),
                }
            }

            StorageRequest::LearnAssociation {
                source_id,
                target_id,
                assoc_type,
                confidence,
            } => {
                let (source, target) = match (
                    ConceptId::from_hex(&source_id),
                    ConceptId::from_hex(&target_id),
                ) {
                    (Some(s), Some(t)) => (s, t),
                    _ => {
                        return StorageResponse::Error {
                            message: "invalid concept id".to_string(),
                        }
                    }
                };
                let assoc_type = match AssociationType::from_u32(assoc_type) {
                    Some(t) => t,
                    None => {
                        return StorageResponse::Error {
                            message: format!("unknown association type {}", assoc_type),
                        }
                    }
                };

                match self
                    .storage
                    .learn_association(source, target, assoc_type, confidence)
                {
                    Ok(sequence) => StorageResponse::LearnAssociationOk { sequence },
                    Err(e) => error_response(e),
                }
            }

            StorageRequest::QueryConcept { concept_id } => {
                let id = match ConceptId::from_hex(&concept_id) {
                    Some(id) => id,
                    None => {
                        return StorageResponse::Error {
                            message: "invalid concept id".to_string(),
                        }
                    }
                };

                match self.storage.query_concept(&id) {
                    Some(node) => StorageResponse::QueryConceptOk {
                        found: true,
                        concept_id: id.to_hex(),
                        content: node.content.to_string(),
                        embedding: node
                            .embedding
                            .as_deref()
                            .map(|v| v.to_vec())
                            .unwrap_or_default(),
                        strength: node.strength,
                        confidence: node.confidence,
                        metadata: Some(node.metadata),
                    },
                    None => StorageResponse::QueryConceptOk {
                        found: false,
                        concept_id: String::new(),
                        content: String::new(),
                        embedding: Vec::new(),
                        strength: 0.0,
                        confidence: 0.0,
                        metadata: None,
                    },
                }
            }

            StorageRequest::GetNeighbors { concept_id } => {
                let id = match ConceptId::from_hex(&concept_id) {
                    Some(id) => id,
                    None => {
                        return StorageResponse::Error {
                            message: "invalid concept id".to_string(),
                        }
                    }
                };
                let neighbor_ids = self
                    .storage
                    .neighbors(&id)
                    .iter()
                    .map(|n| n.to_hex())
                    .collect();
                StorageResponse::GetNeighborsOk { neighbor_ids }
            }

            StorageRequest::FindPath {
                start_id,
                end_id,
                max_depth,
            } => {
                let (start, end) =
                    match (ConceptId::from_hex(&start_id), ConceptId::from_hex(&end_id)) {
                        (Some(s), Some(e)) => (s, e),
                        _ => {
                            return StorageResponse::Error {
                                message: "invalid concept id".to_string(),
                            }
                        }
                    };

                match self.storage.find_path(start, end, max_depth as usize) {
                    Some(path) => StorageResponse::FindPathOk {
                        found: true,
                        path: path.iter().map(|id| id.to_hex()).collect(),
                    },
                    None => StorageResponse::FindPathOk {
                        found: false,
                        path: Vec::new(),
                    },
                }
            }

            StorageRequest::VectorSearch {
                query_vector,
                k,
                ef_search,
                organization_id,
            } => {
                let k = k.min(MAX_SEARCH_K);
                match self.storage.vector_search(
                    &query_vector,
                    k as usize,
                    ef_search as usize,
                    organization_id.as_deref(),
                ) {
                    Ok(results) => StorageResponse::VectorSearchOk {
                        results: results
                            .into_iter()
                            .map(|(id, score)| VectorMatch {
                                concept_id: id.to_hex(),
                                score,
                            })
                            .collect(),
                    },
                    Err(e) => error_response(e),
                }
            }

            StorageRequest::QueryByMetadata {
                concept_type,
                organization_id,
                tags,
                attributes,
                limit,
            } => {
                let limit = limit.min(MAX_QUERY_LIMIT) as usize;
                let concepts = self
                    .storage
                    .query_by_metadata(
                        concept_type,
                        organization_id.as_deref(),
                        &tags,
                        &attributes,
                        limit,
                    )
                    .into_iter()
                    .map(|node| ConceptSummary {
                        concept_id: node.id.to_hex(),
                        content_preview: node.content.chars().take(200).collect(),
                        metadata: node.metadata,
                    })
                    .collect();
                StorageResponse::QueryByMetadataOk { concepts }
            }

            StorageRequest::GetStats => {
                let summary = self.storage.summary();
                StorageResponse::StatsOk {
                    concepts: summary.concepts,
                    edges: summary.edges,
                    generation: summary.generation,
                    written: summary.written,
                    rejected: summary.rejected,
                    pending: summary.pending,
                    reconciliations: summary.reconciliations,
                    uptime_seconds: self.start_time.elapsed().as_secs(),
                }
            }

            StorageRequest::Flush => match self.storage.flush() {
                Ok(()) => StorageResponse::FlushOk,
                Err(e) => error_response(e),
            },

            StorageRequest::HealthCheck => StorageResponse::HealthCheckOk {
                healthy: true,
                status: "ok".to_string(),
                uptime_seconds: self.start_time.elapsed().as_secs(),
            },
        }
    }
}

/// Map a storage error onto the wire. Everything except Internal is safe to
/// return verbatim; clients match on "backpressure" to retry with jitter.
fn error_response(e: StorageError) -> StorageResponse {
    StorageResponse::Error {
        message: e.to_string(),
    }
}
