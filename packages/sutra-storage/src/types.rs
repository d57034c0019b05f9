/// Core types for the Sutra storage engine
use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use unicode_normalization::UnicodeNormalization;

pub use sutra_protocol::{ConceptMetadata, ConceptType};

/// Concept ID: 8 bytes, rendered as 16 hex characters.
///
/// Derived deterministically as the first 8 bytes of the SHA-256 digest of
/// the normalized concept content, so learning the same content twice yields
/// the same id.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Pod, Zeroable, Serialize, Deserialize,
)]
#[repr(C)]
pub struct ConceptId(pub [u8; 8]);

impl ConceptId {
    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }

    /// Derive the id for a piece of content (normalizes first)
    pub fn from_content(content: &str) -> Self {
        let normalized = normalize_content(content);
        let digest = Sha256::digest(normalized.as_bytes());
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        Self(bytes)
    }

    /// Parse a 16-hex-character id string
    pub fn from_hex(s: &str) -> Option<Self> {
        let decoded = hex::decode(s).ok()?;
        if decoded.len() != 8 {
            return None;
        }
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&decoded);
        Some(Self(bytes))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// The id as a u64 key (big-endian, so hex ordering matches key ordering).
    /// Used directly as the HNSW key.
    pub fn as_key(&self) -> u64 {
        u64::from_be_bytes(self.0)
    }

    pub fn from_key(key: u64) -> Self {
        Self(key.to_be_bytes())
    }
}

impl fmt::Display for ConceptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Normalize content for id derivation: NFKC, lowercase, collapsed whitespace.
pub fn normalize_content(content: &str) -> String {
    let folded: String = content.nfkc().collect::<String>().to_lowercase();
    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Association type enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum AssociationType {
    Semantic = 0,
    Causal = 1,
    Temporal = 2,
    Hierarchical = 3,
    Compositional = 4,
}

impl AssociationType {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Semantic),
            1 => Some(Self::Causal),
            2 => Some(Self::Temporal),
            3 => Some(Self::Hierarchical),
            4 => Some(Self::Compositional),
            _ => None,
        }
    }
}

/// Fixed-size concept record in the snapshot file (64 bytes, 64-byte aligned)
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C, packed)] // packed to avoid padding
pub struct ConceptRecord {
    pub concept_id: ConceptId, // 8 bytes
    pub strength: f32,         // 4 bytes
    pub confidence: f32,       // 4 bytes
    pub created: u64,          // 8 bytes
    pub last_accessed: u64,    // 8 bytes
    pub content_offset: u64,   // 8 bytes
    pub content_length: u32,   // 4 bytes
    pub embedding_offset: u64, // 8 bytes
    pub metadata_offset: u64,  // 8 bytes
    pub metadata_length: u32,  // 4 bytes
} // Total: 64 bytes

/// Fixed-size association record in the snapshot file (32 bytes)
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C, packed)] // packed to avoid padding
pub struct AssociationRecord {
    pub source_id: ConceptId, // 8 bytes
    pub target_id: ConceptId, // 8 bytes
    pub assoc_type: u32,      // 4 bytes
    pub confidence: f32,      // 4 bytes
    pub created: u64,         // 8 bytes
} // Total: 32 bytes

impl AssociationRecord {
    pub fn new(
        source: ConceptId,
        target: ConceptId,
        assoc_type: AssociationType,
        confidence: f32,
    ) -> Self {
        Self {
            source_id: source,
            target_id: target,
            assoc_type: assoc_type as u32,
            confidence,
            created: current_timestamp_us(),
        }
    }
}

/// FNV-1a hash of a concept id, used for shard routing
pub fn fnv1a(id: &ConceptId) -> u64 {
    let mut hash = 0xcbf29ce484222325u64;
    for &byte in &id.0 {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

/// Get current timestamp in microseconds
pub fn current_timestamp_us() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}
