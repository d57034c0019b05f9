//! Sutra Custom Binary Protocol
//!
//! Length-prefixed binary protocol for all client/storage communication.
//!
//! Message Format:
//! ```text
//! [4 bytes: big-endian frame length][1 byte: protocol version][N bytes: bincode payload]
//! ```
//!
//! The frame length covers the version byte plus the payload. bincode gives
//! deterministic field-ordered encoding with little-endian scalars and
//! length-prefixed strings/byte arrays.

pub mod client;
pub mod error;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub use client::StorageClient;
pub use error::{ProtocolError, Result};

/// Protocol version for compatibility checking. Unknown versions are rejected.
pub const PROTOCOL_VERSION: u8 = 0;

/// Maximum frame size (16MB) - prevents DoS
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Maximum items in a LearnBatch request
pub const MAX_BATCH_SIZE: usize = 1000;

/// Maximum concept content size (1 MiB)
pub const MAX_CONTENT_SIZE: usize = 1024 * 1024;

// ============================================================================
// Core Data Types
// ============================================================================

/// Concept types for different data categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ConceptType {
    /// General knowledge concepts (default)
    DomainConcept = 0,
    /// User account data
    User = 10,
    /// Organization/tenant
    Organization = 12,
    /// Chat conversation thread
    Conversation = 20,
    /// Individual message in a conversation
    Message = 21,
}

impl ConceptType {
    pub fn name(&self) -> &'static str {
        match self {
            ConceptType::DomainConcept => "domain_concept",
            ConceptType::User => "user",
            ConceptType::Organization => "organization",
            ConceptType::Conversation => "conversation",
            ConceptType::Message => "message",
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(ConceptType::DomainConcept),
            10 => Some(ConceptType::User),
            12 => Some(ConceptType::Organization),
            20 => Some(ConceptType::Conversation),
            21 => Some(ConceptType::Message),
            _ => None,
        }
    }
}

impl Default for ConceptType {
    fn default() -> Self {
        ConceptType::DomainConcept
    }
}

/// Metadata carried by every concept
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConceptMetadata {
    /// Concept type classification
    pub concept_type: ConceptType,

    /// Organization ID for multi-tenancy
    pub organization_id: Option<String>,

    /// Custom tags for filtering/search
    pub tags: Vec<String>,

    /// Extensible key-value metadata
    pub attributes: std::collections::HashMap<String, String>,

    /// Creation timestamp (microseconds since epoch, set by the engine)
    pub created_at: u64,

    /// Last access timestamp (microseconds since epoch)
    pub last_accessed: u64,
}

impl ConceptMetadata {
    pub fn new(concept_type: ConceptType) -> Self {
        Self {
            concept_type,
            organization_id: None,
            tags: Vec::new(),
            attributes: std::collections::HashMap::new(),
            created_at: 0,
            last_accessed: 0,
        }
    }

    pub fn with_organization(concept_type: ConceptType, org_id: String) -> Self {
        Self {
            organization_id: Some(org_id),
            ..Self::new(concept_type)
        }
    }

    /// Validate metadata limits
    pub fn validate(&self) -> Result<()> {
        if let Some(ref org_id) = self.organization_id {
            if org_id.is_empty() {
                return Err(ProtocolError::ValidationError(
                    "organization_id cannot be empty".to_string(),
                ));
            }
            if org_id.len() > 128 {
                return Err(ProtocolError::ValidationError(
                    "organization_id too long (max 128 chars)".to_string(),
                ));
            }
        }

        if self.tags.len() > 100 {
            return Err(ProtocolError::ValidationError(
                "Too many tags (max 100)".to_string(),
            ));
        }

        if self.attributes.len() > 100 {
            return Err(ProtocolError::ValidationError(
                "Too many attributes (max 100)".to_string(),
            ));
        }

        Ok(())
    }
}

impl Default for ConceptMetadata {
    fn default() -> Self {
        Self::new(ConceptType::DomainConcept)
    }
}

/// Options for the server-side learning pipeline (LearnConceptV2 / LearnBatch)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearnOptions {
    pub extract_associations: bool,
    pub min_association_confidence: f32,
    pub max_associations_per_concept: usize,
    pub strength: f32,
    pub confidence: f32,
    pub metadata: Option<ConceptMetadata>,
}

impl Default for LearnOptions {
    fn default() -> Self {
        Self {
            extract_associations: true,
            min_association_confidence: 0.5,
            max_associations_per_concept: 10,
            strength: 1.0,
            confidence: 1.0,
            metadata: None,
        }
    }
}

// ============================================================================
// Storage Protocol Messages
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StorageRequest {
    /// Learn with a client-supplied embedding (V1)
    LearnConcept {
        content: String,
        embedding: Vec<f32>,
        strength: f32,
        confidence: f32,
        metadata: Option<ConceptMetadata>,
    },
    /// Learn with a server-computed embedding (V2, drives the learning pipeline)
    LearnConceptV2 {
        content: String,
        options: LearnOptions,
    },
    LearnBatch {
        contents: Vec<String>,
        options: LearnOptions,
    },
    LearnAssociation {
        source_id: String,
        target_id: String,
        assoc_type: u32,
        confidence: f32,
    },
    QueryConcept {
        concept_id: String,
    },
    GetNeighbors {
        concept_id: String,
    },
    FindPath {
        start_id: String,
        end_id: String,
        max_depth: u32,
    },
    VectorSearch {
        query_vector: Vec<f32>,
        k: u32,
        ef_search: u32,
        /// Optional organization filter for multi-tenant search
        organization_id: Option<String>,
    },
    /// Query concepts by metadata filters
    QueryByMetadata {
        concept_type: Option<ConceptType>,
        organization_id: Option<String>,
        tags: Vec<String>,
        attributes: std::collections::HashMap<String, String>,
        limit: u32,
    },
    GetStats,
    Flush,
    HealthCheck,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StorageResponse {
    LearnConceptOk {
        concept_id: String,
    },
    LearnConceptV2Ok {
        concept_id: String,
        associations_created: u32,
    },
    LearnBatchOk {
        concept_ids: Vec<String>,
    },
    LearnAssociationOk {
        sequence: u64,
    },
    QueryConceptOk {
        found: bool,
        concept_id: String,
        content: String,
        embedding: Vec<f32>,
        strength: f32,
        confidence: f32,
        metadata: Option<ConceptMetadata>,
    },
    GetNeighborsOk {
        neighbor_ids: Vec<String>,
    },
    FindPathOk {
        found: bool,
        path: Vec<String>,
    },
    VectorSearchOk {
        results: Vec<VectorMatch>,
    },
    QueryByMetadataOk {
        concepts: Vec<ConceptSummary>,
    },
    StatsOk {
        concepts: u64,
        edges: u64,
        generation: u64,
        written: u64,
        rejected: u64,
        pending: u64,
        reconciliations: u64,
        uptime_seconds: u64,
    },
    FlushOk,
    HealthCheckOk {
        healthy: bool,
        status: String,
        uptime_seconds: u64,
    },
    Error {
        message: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorMatch {
    pub concept_id: String,
    pub score: f32,
}

/// Concept summary for metadata queries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConceptSummary {
    pub concept_id: String,
    /// First 200 chars of content
    pub content_preview: String,
    pub metadata: ConceptMetadata,
}

// ============================================================================
// Framing
// ============================================================================

/// Write a length-prefixed, version-tagged frame.
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = bincode::serialize(message)?;
    let frame_len = body.len() + 1;
    if frame_len > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(frame_len, MAX_FRAME_SIZE));
    }

    writer.write_u32(frame_len as u32).await?;
    writer.write_u8(PROTOCOL_VERSION).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a length-prefixed, version-tagged frame.
///
/// Oversize frames are rejected before any payload is buffered; the caller
/// must drop the connection since the stream is no longer framed.
pub async fn read_message<R, T>(reader: &mut R) -> Result<T>
where
    R: AsyncRead + Unpin,
    T: for<'de> Deserialize<'de>,
{
    let frame_len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(ProtocolError::ConnectionClosed)
        }
        Err(e) => return Err(e.into()),
    };

    if frame_len == 0 {
        return Err(ProtocolError::EmptyFrame);
    }
    if frame_len > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(frame_len, MAX_FRAME_SIZE));
    }

    let version = reader.read_u8().await?;
    if version != PROTOCOL_VERSION {
        return Err(ProtocolError::VersionMismatch(version, PROTOCOL_VERSION));
    }

    let mut body = vec![0u8; frame_len - 1];
    reader.read_exact(&mut body).await?;

    Ok(bincode::deserialize(&body)?)
}
