/// Two-Phase Commit (2PC) Transaction Coordinator
///
/// Ensures atomicity for associations spanning multiple shards:
/// 1. PREPARE: each involved shard validates its endpoint and writes a
///    Prepared record to its own WAL
/// 2. COMMIT: on unanimous prepare the coordinator logs the outcome, then
///    every shard logs Commit and applies; any prepare failure aborts all
///
/// Coordinator state is WAL-backed in `coord.log`, so in-flight
/// transactions survive a crash: recovery matches participant WALs holding
/// Prepared-without-outcome against the coordinator log and completes or
/// rolls back.
use crate::error::{Result, StorageError};
use crate::types::{AssociationType, ConceptId};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Transaction state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Preparing,
    Prepared,
    Committed,
    Aborted,
}

/// Durable outcome of a transaction, from the coordinator log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnOutcome {
    Committed,
    Aborted,
    /// Begin logged but no outcome: presumed abort
    InFlight,
}

/// Transaction participant (shard)
#[derive(Debug, Clone)]
pub struct Participant {
    pub shard_id: u32,
    pub state: TxnState,
}

/// Cross-shard association operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssocOp {
    pub source: ConceptId,
    pub target: ConceptId,
    pub source_shard: u32,
    pub target_shard: u32,
    pub assoc_type: u32,
    pub confidence: f32,
}

impl AssocOp {
    pub fn assoc_type(&self) -> AssociationType {
        AssociationType::from_u32(self.assoc_type).unwrap_or(AssociationType::Semantic)
    }
}

/// Active transaction record
#[derive(Debug, Clone)]
pub struct Transaction {
    pub txn_id: u64,
    pub op: AssocOp,
    pub participants: Vec<Participant>,
    pub started_at: Instant,
    pub state: TxnState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum LogEvent {
    Begin { op: AssocOp },
    Committed,
    Aborted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LogRecord {
    txn_id: u64,
    event: LogEvent,
}

/// Append-only coordinator log, CRC-framed like the shard WALs
struct CoordinatorLog {
    file: File,
}

impl CoordinatorLog {
    fn open(path: &Path) -> Result<(Self, Vec<LogRecord>)> {
        let records = if path.exists() {
            Self::read_all(path)?
        } else {
            Vec::new()
        };

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(StorageError::from_io)?;

        Ok((Self { file }, records))
    }

    fn append(&mut self, record: &LogRecord) -> Result<()> {
        let payload = bincode::serialize(record).map_err(StorageError::internal)?;
        let crc = crc32fast::hash(&payload);

        let mut buf = Vec::with_capacity(8 + payload.len());
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&crc.to_le_bytes());
        buf.extend_from_slice(&payload);

        self.file.write_all(&buf).map_err(StorageError::from_io)?;
        self.file.sync_data().map_err(StorageError::from_io)?;
        Ok(())
    }

    fn read_all(path: &Path) -> Result<Vec<LogRecord>> {
        let mut data = Vec::new();
        File::open(path)
            .map_err(StorageError::from_io)?
            .read_to_end(&mut data)
            .map_err(StorageError::from_io)?;

        let mut records = Vec::new();
        let mut offset = 0usize;
        while offset + 8 <= data.len() {
            let len = u32::from_le_bytes(data[offset..offset + 4].try_into().unwrap()) as usize;
            let crc = u32::from_le_bytes(data[offset + 4..offset + 8].try_into().unwrap());
            let end = offset + 8 + len;
            if end > data.len() {
                // torn tail
                break;
            }
            let payload = &data[offset + 8..end];
            if crc32fast::hash(payload) != crc {
                if end == data.len() {
                    break;
                }
                return Err(StorageError::Corruption(format!(
                    "coordinator log crc mismatch at offset {}",
                    offset
                )));
            }
            let record: LogRecord = bincode::deserialize(payload)
                .map_err(|e| StorageError::Corruption(format!("coordinator log: {}", e)))?;
            records.push(record);
            offset = end;
        }
        Ok(records)
    }
}

/// Transaction coordinator (manages the 2PC protocol)
pub struct TransactionCoordinator {
    log: Mutex<CoordinatorLog>,
    /// Active transactions (txn_id -> Transaction)
    active: RwLock<HashMap<u64, Transaction>>,
    /// Durable outcomes recovered from the log at open
    recovered: HashMap<u64, TxnOutcome>,
    next_txn_id: AtomicU64,
    /// Transaction timeout
    timeout: Duration,
    path: PathBuf,
}

impl TransactionCoordinator {
    /// Open the coordinator, replaying its log for crash recovery
    pub fn open(path: impl AsRef<Path>, timeout: Duration) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let (log, records) = CoordinatorLog::open(&path)?;

        let mut recovered: HashMap<u64, TxnOutcome> = HashMap::new();
        let mut max_txn = 0u64;
        for record in records {
            max_txn = max_txn.max(record.txn_id);
            match record.event {
                LogEvent::Begin { .. } => {
                    recovered.insert(record.txn_id, TxnOutcome::InFlight);
                }
                LogEvent::Committed => {
                    recovered.insert(record.txn_id, TxnOutcome::Committed);
                }
                LogEvent::Aborted => {
                    recovered.insert(record.txn_id, TxnOutcome::Aborted);
                }
            }
        }

        let in_flight = recovered
            .values()
            .filter(|o| **o == TxnOutcome::InFlight)
            .count();
        if in_flight > 0 {
            log::warn!("coordinator recovered {} in-flight transactions", in_flight);
        }

        Ok(Self {
            log: Mutex::new(log),
            active: RwLock::new(HashMap::new()),
            recovered,
            next_txn_id: AtomicU64::new(max_txn + 1),
            timeout,
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Durable outcome for a transaction found in-doubt on a participant.
    /// Unknown transactions are presumed aborted (the Begin never made it
    /// to disk).
    pub fn outcome(&self, txn_id: u64) -> TxnOutcome {
        self.recovered
            .get(&txn_id)
            .copied()
            .unwrap_or(TxnOutcome::Aborted)
    }

    /// Start a transaction: durably log Begin, then track participants
    pub fn begin(&self, op: AssocOp) -> Result<u64> {
        let txn_id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);

        self.log.lock().append(&LogRecord {
            txn_id,
            event: LogEvent::Begin { op: op.clone() },
        })?;

        let mut participants = vec![Participant {
            shard_id: op.source_shard,
            state: TxnState::Preparing,
        }];
        if op.source_shard != op.target_shard {
            participants.push(Participant {
                shard_id: op.target_shard,
                state: TxnState::Preparing,
            });
        }

        self.active.write().insert(
            txn_id,
            Transaction {
                txn_id,
                op,
                participants,
                started_at: Instant::now(),
                state: TxnState::Preparing,
            },
        );

        log::debug!("2PC: started transaction {}", txn_id);
        Ok(txn_id)
    }

    /// Mark a participant as prepared; returns true when all are
    pub fn mark_prepared(&self, txn_id: u64, shard_id: u32) -> Result<bool> {
        let mut active = self.active.write();
        let txn = active
            .get_mut(&txn_id)
            .ok_or_else(|| StorageError::internal(format!("unknown txn {}", txn_id)))?;

        if txn.started_at.elapsed() > self.timeout {
            txn.state = TxnState::Aborted;
            return Err(StorageError::Timeout(format!("transaction {}", txn_id)));
        }

        let participant = txn
            .participants
            .iter_mut()
            .find(|p| p.shard_id == shard_id)
            .ok_or_else(|| {
                StorageError::internal(format!("shard {} not in txn {}", shard_id, txn_id))
            })?;
        participant.state = TxnState::Prepared;

        let all_prepared = txn
            .participants
            .iter()
            .all(|p| p.state == TxnState::Prepared);
        if all_prepared {
            txn.state = TxnState::Prepared;
            log::debug!("2PC: all participants prepared for txn {}", txn_id);
        }
        Ok(all_prepared)
    }

    /// Phase 2 decision: durably log Committed
    pub fn commit(&self, txn_id: u64) -> Result<()> {
        {
            let active = self.active.read();
            let txn = active
                .get(&txn_id)
                .ok_or_else(|| StorageError::internal(format!("unknown txn {}", txn_id)))?;
            if txn.state != TxnState::Prepared {
                return Err(StorageError::internal(format!(
                    "txn {} not prepared (state {:?})",
                    txn_id, txn.state
                )));
            }
        }

        self.log.lock().append(&LogRecord {
            txn_id,
            event: LogEvent::Committed,
        })?;

        if let Some(txn) = self.active.write().get_mut(&txn_id) {
            txn.state = TxnState::Committed;
            for p in &mut txn.participants {
                p.state = TxnState::Committed;
            }
        }
        log::debug!("2PC: transaction {} committed", txn_id);
        Ok(())
    }

    /// Phase 2 decision: durably log Aborted
    pub fn abort(&self, txn_id: u64) -> Result<()> {
        self.log.lock().append(&LogRecord {
            txn_id,
            event: LogEvent::Aborted,
        })?;

        if let Some(txn) = self.active.write().get_mut(&txn_id) {
            txn.state = TxnState::Aborted;
            for p in &mut txn.participants {
                p.state = TxnState::Aborted;
            }
        }
        log::warn!("2PC: transaction {} aborted", txn_id);
        Ok(())
    }

    /// Remove a finished transaction from the active set
    pub fn complete(&self, txn_id: u64) {
        if let Some(txn) = self.active.write().remove(&txn_id) {
            log::debug!(
                "2PC: transaction {} done (state: {:?}, duration: {:?})",
                txn_id,
                txn.state,
                txn.started_at.elapsed()
            );
        }
    }

    pub fn get_transaction(&self, txn_id: u64) -> Option<Transaction> {
        self.active.read().get(&txn_id).cloned()
    }

    /// Abort and drop transactions past the timeout (call periodically)
    pub fn cleanup_timedout(&self) -> Result<usize> {
        let timed_out: Vec<u64> = {
            let active = self.active.read();
            active
                .iter()
                .filter(|(_, txn)| txn.started_at.elapsed() > self.timeout)
                .map(|(id, _)| *id)
                .collect()
        };

        for txn_id in &timed_out {
            self.abort(*txn_id)?;
            self.complete(*txn_id);
        }
        Ok(timed_out.len())
    }

    pub fn stats(&self) -> TxnCoordinatorStats {
        let active = self.active.read();

        let mut preparing = 0;
        let mut prepared = 0;
        for txn in active.values() {
            match txn.state {
                TxnState::Preparing => preparing += 1,
                TxnState::Prepared => prepared += 1,
                _ => {}
            }
        }

        TxnCoordinatorStats {
            active_count: active.len(),
            preparing,
            prepared,
        }
    }
}

/// Transaction coordinator statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxnCoordinatorStats {
    pub active_count: usize,
    pub preparing: usize,
    pub prepared: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_op(source_shard: u32, target_shard: u32) -> AssocOp {
        AssocOp {
            source: ConceptId([1; 8]),
            target: ConceptId([2; 8]),
            source_shard,
            target_shard,
            assoc_type: AssociationType::Causal as u32,
            confidence: 0.8,
        }
    }

    #[test]
    fn test_same_shard_single_participant() {
        let dir = TempDir::new().unwrap();
        let coordinator =
            TransactionCoordinator::open(dir.path().join("coord.log"), Duration::from_secs(5))
                .unwrap();

        let txn_id = coordinator.begin(sample_op(0, 0)).unwrap();
        let txn = coordinator.get_transaction(txn_id).unwrap();
        assert_eq!(txn.participants.len(), 1);
    }

    #[test]
    fn test_2pc_protocol() {
        let dir = TempDir::new().unwrap();
        let coordinator =
            TransactionCoordinator::open(dir.path().join("coord.log"), Duration::from_secs(5))
                .unwrap();

        let txn_id = coordinator.begin(sample_op(0, 1)).unwrap();

        assert!(!coordinator.mark_prepared(txn_id, 0).unwrap());
        assert!(coordinator.mark_prepared(txn_id, 1).unwrap());

        coordinator.commit(txn_id).unwrap();
        let txn = coordinator.get_transaction(txn_id).unwrap();
        assert_eq!(txn.state, TxnState::Committed);

        coordinator.complete(txn_id);
        assert!(coordinator.get_transaction(txn_id).is_none());
    }

    #[test]
    fn test_commit_requires_all_prepared() {
        let dir = TempDir::new().unwrap();
        let coordinator =
            TransactionCoordinator::open(dir.path().join("coord.log"), Duration::from_secs(5))
                .unwrap();

        let txn_id = coordinator.begin(sample_op(0, 1)).unwrap();
        coordinator.mark_prepared(txn_id, 0).unwrap();

        assert!(coordinator.commit(txn_id).is_err());
        coordinator.abort(txn_id).unwrap();
    }

    #[test]
    fn test_outcomes_survive_restart() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("coord.log");

        let (committed, in_flight) = {
            let coordinator =
                TransactionCoordinator::open(&path, Duration::from_secs(5)).unwrap();

            let committed = coordinator.begin(sample_op(0, 1)).unwrap();
            coordinator.mark_prepared(committed, 0).unwrap();
            coordinator.mark_prepared(committed, 1).unwrap();
            coordinator.commit(committed).unwrap();

            // Begin logged, crash before an outcome
            let in_flight = coordinator.begin(sample_op(1, 2)).unwrap();
            (committed, in_flight)
        };

        let coordinator = TransactionCoordinator::open(&path, Duration::from_secs(5)).unwrap();
        assert_eq!(coordinator.outcome(committed), TxnOutcome::Committed);
        assert_eq!(coordinator.outcome(in_flight), TxnOutcome::InFlight);
        // A txn the log never saw is presumed aborted
        assert_eq!(coordinator.outcome(9999), TxnOutcome::Aborted);
    }

    #[test]
    fn test_txn_ids_monotonic_across_restart() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("coord.log");

        let first = {
            let coordinator =
                TransactionCoordinator::open(&path, Duration::from_secs(5)).unwrap();
            coordinator.begin(sample_op(0, 1)).unwrap()
        };

        let coordinator = TransactionCoordinator::open(&path, Duration::from_secs(5)).unwrap();
        let second = coordinator.begin(sample_op(0, 1)).unwrap();
        assert!(second > first);
    }

    #[test]
    fn test_cleanup_timedout() {
        let dir = TempDir::new().unwrap();
        let coordinator =
            TransactionCoordinator::open(dir.path().join("coord.log"), Duration::from_millis(10))
                .unwrap();

        for _ in 0..3 {
            coordinator.begin(sample_op(0, 1)).unwrap();
        }
        assert_eq!(coordinator.stats().active_count, 3);

        std::thread::sleep(Duration::from_millis(30));

        let cleaned = coordinator.cleanup_timedout().unwrap();
        assert_eq!(cleaned, 3);
        assert_eq!(coordinator.stats().active_count, 0);
    }
}
