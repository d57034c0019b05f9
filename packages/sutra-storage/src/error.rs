//! Error taxonomy surfaced by the storage engine
//!
//! Every kind except `Internal` is safe to return verbatim to clients.
//! `Internal` is logged with its correlation id at the point of mapping so
//! operators can cross-reference.

use crate::types::ConceptId;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum StorageError {
    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimMismatch { expected: usize, got: usize },

    #[error("concept not found: {0}")]
    NotFound(ConceptId),

    #[error("backpressure")]
    Backpressure,

    #[error("disk full")]
    DiskFull,

    #[error("embedding service unavailable: {0}")]
    EmbeddingUnavailable(String),

    #[error("corrupted storage: {0}")]
    Corruption(String),

    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("internal error [{correlation_id}]")]
    Internal { correlation_id: String },
}

pub type Result<T> = std::result::Result<T, StorageError>;

static CORRELATION_COUNTER: AtomicU64 = AtomicU64::new(0);

impl StorageError {
    /// Wrap an unexpected failure, logging the detail with a correlation id.
    pub fn internal(detail: impl std::fmt::Display) -> Self {
        let seq = CORRELATION_COUNTER.fetch_add(1, Ordering::Relaxed);
        let secs = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let correlation_id = format!("{:x}-{:04x}", secs, seq & 0xffff);
        log::error!("internal error [{}]: {}", correlation_id, detail);
        Self::Internal { correlation_id }
    }

    /// Map an I/O failure: out-of-space becomes DiskFull, anything else Internal.
    pub fn from_io(e: std::io::Error) -> Self {
        // ENOSPC
        if e.raw_os_error() == Some(28) {
            StorageError::DiskFull
        } else {
            StorageError::internal(e)
        }
    }

    /// True for errors the engine can surface to a client as-is.
    pub fn is_client_safe(&self) -> bool {
        !matches!(self, StorageError::Internal { .. })
    }
}
