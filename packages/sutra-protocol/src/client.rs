//! Async TCP client for the storage protocol
//!
//! One client per connection; requests on a connection are processed
//! sequentially by the server, so responses come back in request order.

use crate::{
    read_message, write_message, ConceptMetadata, LearnOptions, ProtocolError, Result,
    StorageRequest, StorageResponse, VectorMatch,
};
use std::time::Duration;
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::time::timeout;
use tracing::debug;

/// Default per-request timeout
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct StorageClient {
    stream: TcpStream,
    request_timeout: Duration,
}

impl StorageClient {
    /// Connect to a storage server
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    /// Send a request and wait for its response
    pub async fn request(&mut self, request: StorageRequest) -> Result<StorageResponse> {
        write_message(&mut self.stream, &request).await?;

        let response = timeout(self.request_timeout, read_message(&mut self.stream))
            .await
            .map_err(|_| ProtocolError::Timeout)??;

        debug!("storage response: {:?}", response);
        Ok(response)
    }

    /// Learn a concept with a client-supplied embedding
    pub async fn learn_concept(
        &mut self,
        content: String,
        embedding: Vec<f32>,
        strength: f32,
        confidence: f32,
        metadata: Option<ConceptMetadata>,
    ) -> Result<String> {
        let response = self
            .request(StorageRequest::LearnConcept {
                content,
                embedding,
                strength,
                confidence,
                metadata,
            })
            .await?;

        match response {
            StorageResponse::LearnConceptOk { concept_id } => Ok(concept_id),
            StorageResponse::Error { message } => Err(ProtocolError::ServerError(message)),
            other => Err(ProtocolError::ServerError(format!(
                "unexpected response: {:?}",
                other
            ))),
        }
    }

    /// Learn a concept with a server-computed embedding
    pub async fn learn_concept_v2(
        &mut self,
        content: String,
        options: LearnOptions,
    ) -> Result<(String, u32)> {
        let response = self
            .request(StorageRequest::LearnConceptV2 { content, options })
            .await?;

        match response {
            StorageResponse::LearnConceptV2Ok {
                concept_id,
                associations_created,
            } => Ok((concept_id, associations_created)),
            StorageResponse::Error { message } => Err(ProtocolError::ServerError(message)),
            other => Err(ProtocolError::ServerError(format!(
                "unexpected response: {:?}",
                other
            ))),
        }
    }

    pub async fn learn_association(
        &mut self,
        source_id: String,
        target_id: String,
        assoc_type: u32,
        confidence: f32,
    ) -> Result<u64> {
        let response = self
            .request(StorageRequest::LearnAssociation {
                source_id,
                target_id,
                assoc_type,
                confidence,
            })
            .await?;

        match response {
            StorageResponse::LearnAssociationOk { sequence } => Ok(sequence),
            StorageResponse::Error { message } => Err(ProtocolError::ServerError(message)),
            other => Err(ProtocolError::ServerError(format!(
                "unexpected response: {:?}",
                other
            ))),
        }
    }

    pub async fn vector_search(
        &mut self,
        query_vector: Vec<f32>,
        k: u32,
        ef_search: u32,
        organization_id: Option<String>,
    ) -> Result<Vec<VectorMatch>> {
        let response = self
            .request(StorageRequest::VectorSearch {
                query_vector,
                k,
                ef_search,
                organization_id,
            })
            .await?;

        match response {
            StorageResponse::VectorSearchOk { results } => Ok(results),
            StorageResponse::Error { message } => Err(ProtocolError::ServerError(message)),
            other => Err(ProtocolError::ServerError(format!(
                "unexpected response: {:?}",
                other
            ))),
        }
    }

    pub async fn find_path(
        &mut self,
        start_id: String,
        end_id: String,
        max_depth: u32,
    ) -> Result<Option<Vec<String>>> {
        let response = self
            .request(StorageRequest::FindPath {
                start_id,
                end_id,
                max_depth,
            })
            .await?;

        match response {
            StorageResponse::FindPathOk { found: true, path } => Ok(Some(path)),
            StorageResponse::FindPathOk { found: false, .. } => Ok(None),
            StorageResponse::Error { message } => Err(ProtocolError::ServerError(message)),
            other => Err(ProtocolError::ServerError(format!(
                "unexpected response: {:?}",
                other
            ))),
        }
    }

    pub async fn flush(&mut self) -> Result<()> {
        match self.request(StorageRequest::Flush).await? {
            StorageResponse::FlushOk => Ok(()),
            StorageResponse::Error { message } => Err(ProtocolError::ServerError(message)),
            other => Err(ProtocolError::ServerError(format!(
                "unexpected response: {:?}",
                other
            ))),
        }
    }

    pub async fn health_check(&mut self) -> Result<bool> {
        match self.request(StorageRequest::HealthCheck).await? {
            StorageResponse::HealthCheckOk { healthy, .. } => Ok(healthy),
            StorageResponse::Error { message } => Err(ProtocolError::ServerError(message)),
            other => Err(ProtocolError::ServerError(format!(
                "unexpected response: {:?}",
                other
            ))),
        }
    }
}
