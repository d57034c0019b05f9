/// Bounded lock-free write log feeding the reconciler
///
/// Producers (learn callers) push after the WAL fsync returns; the single
/// consumer is the reconciler. Writers never block: when the queue is full
/// the push fails immediately with back-pressure and the client is expected
/// to retry with jitter.
use crate::types::{AssociationRecord, ConceptId};
use crossbeam::channel::{bounded, Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use sutra_protocol::ConceptMetadata;

/// Default capacity before back-pressure
pub const DEFAULT_WRITE_LOG_CAPACITY: usize = 100_000;

/// Write log entry types. Each carries the LSN of its WAL record so the
/// reconciler can report how far the published snapshot has advanced.
#[derive(Debug, Clone)]
pub enum WriteEntry {
    /// Add or merge a concept
    AddConcept {
        lsn: u64,
        id: ConceptId,
        content: Arc<str>,
        embedding: Option<Arc<[f32]>>,
        strength: f32,
        confidence: f32,
        metadata: ConceptMetadata,
        timestamp: u64,
    },

    /// Add an association between concepts
    AddAssociation { lsn: u64, record: AssociationRecord },

    /// Delete a concept and every edge touching it
    DeleteConcept {
        lsn: u64,
        id: ConceptId,
        timestamp: u64,
    },
}

impl WriteEntry {
    pub fn lsn(&self) -> u64 {
        match self {
            WriteEntry::AddConcept { lsn, .. } => *lsn,
            WriteEntry::AddAssociation { lsn, .. } => *lsn,
            WriteEntry::DeleteConcept { lsn, .. } => *lsn,
        }
    }
}

/// Bounded MPSC write log
pub struct WriteLog {
    sender: Sender<WriteEntry>,
    receiver: Receiver<WriteEntry>,
    capacity: usize,

    /// Accepted entries
    written: Arc<AtomicU64>,
    /// Pushes refused with back-pressure
    rejected: Arc<AtomicU64>,
}

impl WriteLog {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = bounded(capacity);

        Self {
            sender,
            receiver,
            capacity,
            written: Arc::new(AtomicU64::new(0)),
            rejected: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Append an entry (non-blocking). A full queue is an immediate error;
    /// nothing is evicted to make room.
    pub fn push(&self, entry: WriteEntry) -> Result<(), WriteLogError> {
        match self.sender.try_send(entry) {
            Ok(()) => {
                self.written.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                Err(WriteLogError::Full)
            }
            Err(TrySendError::Disconnected(_)) => Err(WriteLogError::Disconnected),
        }
    }

    /// True when the next push would be refused
    pub fn is_full(&self) -> bool {
        self.sender.is_full()
    }

    /// Drain up to N entries (for the reconciler)
    pub fn drain_batch(&self, max_entries: usize) -> Vec<WriteEntry> {
        let mut batch = Vec::with_capacity(max_entries.min(self.receiver.len()));

        for _ in 0..max_entries {
            match self.receiver.try_recv() {
                Ok(entry) => batch.push(entry),
                Err(_) => break,
            }
        }

        batch
    }

    /// Drain all available entries
    pub fn drain_all(&self) -> Vec<WriteEntry> {
        self.drain_batch(self.capacity)
    }

    pub fn pending(&self) -> usize {
        self.receiver.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> WriteLogStats {
        WriteLogStats {
            written: self.written.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            pending: self.receiver.len(),
            capacity: self.capacity,
        }
    }
}

impl Default for WriteLog {
    fn default() -> Self {
        Self::new(DEFAULT_WRITE_LOG_CAPACITY)
    }
}

/// Write log statistics
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WriteLogStats {
    pub written: u64,
    pub rejected: u64,
    pub pending: usize,
    pub capacity: usize,
}

/// Write log errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteLogError {
    /// Log is full (back-pressure)
    Full,
    /// Channel disconnected
    Disconnected,
}

impl std::fmt::Display for WriteLogError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Full => write!(f, "Write log full (backpressure)"),
            Self::Disconnected => write!(f, "Write log disconnected"),
        }
    }
}

impl std::error::Error for WriteLogError {}
