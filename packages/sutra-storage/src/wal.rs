/// Write-Ahead Log (WAL) for durability and crash recovery
///
/// Every accepted mutation is logged here before it becomes visible. On
/// crash, the log is replayed from the last checkpoint to restore state.
///
/// Frame layout (little-endian):
/// ```text
/// [u32 payload length][u32 crc32 of payload][bincode(WalRecord)]
/// ```
///
/// Appends are serialized by a single mutex; fsync uses natural group
/// commit: the append that acquires the sync token syncs everything written
/// so far, and concurrent appenders piggyback on that fsync instead of
/// issuing their own.
use crate::error::{Result, StorageError};
use crate::types::ConceptId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use sutra_protocol::ConceptMetadata;

/// WAL record kind
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum WalKind {
    LearnConcept {
        id: ConceptId,
        content: String,
        embedding: Vec<f32>,
        strength: f32,
        confidence: f32,
        metadata: ConceptMetadata,
    },
    LearnAssoc {
        source: ConceptId,
        target: ConceptId,
        assoc_type: u32,
        confidence: f32,
    },
    Delete {
        id: ConceptId,
    },
    /// Marks that all earlier records are captured in a durable snapshot
    /// with this generation; truncation point for replay.
    Checkpoint {
        generation: u64,
    },
    /// 2PC: this shard has validated and reserved the transaction. The
    /// source shard carries the edge payload; the target shard logs None.
    Prepared {
        txn_id: u64,
        edge: Option<PreparedEdge>,
    },
    /// 2PC: the transaction outcome is commit; apply the prepared edge.
    Commit {
        txn_id: u64,
    },
    /// 2PC: the transaction outcome is abort; drop the prepared edge.
    Abort {
        txn_id: u64,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PreparedEdge {
    pub source: ConceptId,
    pub target: ConceptId,
    pub assoc_type: u32,
    pub confidence: f32,
}

/// WAL entry: dense monotonic LSN plus the operation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WalRecord {
    pub lsn: u64,
    pub kind: WalKind,
}

struct WalWriter {
    file: File,
    next_lsn: u64,
    /// Current file length, used to roll back partial frames on write error
    len: u64,
}

/// Write-Ahead Log
pub struct Wal {
    path: PathBuf,
    writer: Mutex<WalWriter>,
    /// First LSN not yet known durable on disk
    sync_frontier: Mutex<u64>,
}

impl Wal {
    /// Open (or create) the log at `path`.
    ///
    /// Returns the log plus all records after the last checkpoint, ready to
    /// re-apply. Mid-log corruption fails the open unless `force` is set;
    /// a torn tail record is always discarded silently.
    pub fn open(path: impl AsRef<Path>, force: bool) -> Result<(Self, Vec<WalRecord>)> {
        let path = path.as_ref().to_path_buf();

        let scan = if path.exists() {
            match read_records(&path) {
                Ok(scan) => scan,
                Err(ScanError::Corrupt {
                    valid,
                    valid_len,
                    detail,
                }) if force => {
                    log::warn!("WAL corruption forced past, suffix discarded: {}", detail);
                    Scan {
                        records: valid,
                        valid_len,
                    }
                }
                Err(ScanError::Corrupt { detail, .. }) => {
                    return Err(StorageError::Corruption(format!("wal: {}", detail)))
                }
                Err(ScanError::Io(e)) => return Err(StorageError::from_io(e)),
            }
        } else {
            Scan {
                records: Vec::new(),
                valid_len: 0,
            }
        };
        let records = scan.records;

        // Retained post-checkpoint records keep their original LSNs, so the
        // positional last record is not necessarily the newest
        let next_lsn = records.iter().map(|r| r.lsn + 1).max().unwrap_or(0);

        // Drop torn-tail or forced-past bytes so new appends continue from a
        // clean frame boundary
        if path.exists() {
            let existing_len = std::fs::metadata(&path)
                .map_err(StorageError::from_io)?
                .len();
            if existing_len > scan.valid_len {
                let f = OpenOptions::new()
                    .write(true)
                    .open(&path)
                    .map_err(StorageError::from_io)?;
                f.set_len(scan.valid_len).map_err(StorageError::from_io)?;
                f.sync_data().map_err(StorageError::from_io)?;
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(StorageError::from_io)?;
        let len = scan.valid_len;

        // Replay yields only records newer than the last checkpoint
        let after_checkpoint = records_after_checkpoint(records);

        Ok((
            Self {
                path,
                writer: Mutex::new(WalWriter {
                    file,
                    next_lsn,
                    len,
                }),
                sync_frontier: Mutex::new(next_lsn),
            },
            after_checkpoint,
        ))
    }

    /// Append a record; returns its LSN only once the record is durable.
    pub fn append(&self, kind: WalKind) -> Result<u64> {
        let lsn = self.write_frames(std::slice::from_ref(&kind))?[0];
        self.sync_to(lsn)?;
        Ok(lsn)
    }

    /// Append several records as one unit with a single fsync.
    pub fn append_batch(&self, kinds: &[WalKind]) -> Result<Vec<u64>> {
        let lsns = self.write_frames(kinds)?;
        if let Some(&last) = lsns.last() {
            self.sync_to(last)?;
        }
        Ok(lsns)
    }

    fn write_frames(&self, kinds: &[WalKind]) -> Result<Vec<u64>> {
        let mut w = self.writer.lock();
        let start_len = w.len;
        let mut lsns = Vec::with_capacity(kinds.len());
        let mut buf = Vec::new();

        for kind in kinds {
            let lsn = w.next_lsn + lsns.len() as u64;
            let record = WalRecord {
                lsn,
                kind: kind.clone(),
            };
            encode_frame(&record, &mut buf).map_err(StorageError::internal)?;
            lsns.push(lsn);
        }

        if let Err(e) = w.file.write_all(&buf) {
            // No partial record may remain
            let _ = w.file.set_len(start_len);
            return Err(StorageError::from_io(e));
        }
        w.len = start_len + buf.len() as u64;
        w.next_lsn += lsns.len() as u64;
        Ok(lsns)
    }

    /// Block until everything up to and including `lsn` is fsynced
    /// (group commit).
    fn sync_to(&self, lsn: u64) -> Result<()> {
        loop {
            let mut frontier = self.sync_frontier.lock();
            if *frontier > lsn {
                return Ok(());
            }
            // Snapshot the high-water mark before syncing: only frames
            // already written are covered by this fsync.
            let (next, res) = {
                let w = self.writer.lock();
                (w.next_lsn, w.file.sync_data())
            };
            res.map_err(StorageError::from_io)?;
            if next > *frontier {
                *frontier = next;
            }
        }
    }

    /// Write a checkpoint record and truncate records already captured in
    /// the durable snapshot.
    ///
    /// `keep_from` is the first LSN the persisted snapshot does NOT cover;
    /// records at or past it (appended but not yet reconciled) are retained
    /// after the checkpoint so they replay on restart. The log is atomically
    /// replaced via temp + fsync + rename.
    pub fn checkpoint(&self, generation: u64, keep_from: u64) -> Result<u64> {
        let mut w = self.writer.lock();

        // The writer lock serializes appends, so the on-disk log is stable
        // while we rewrite it
        let existing = match read_records(&self.path) {
            Ok(scan) => scan.records,
            Err(ScanError::Corrupt { detail, .. }) => {
                return Err(StorageError::Corruption(format!("wal: {}", detail)))
            }
            Err(ScanError::Io(e)) => return Err(StorageError::from_io(e)),
        };

        let lsn = w.next_lsn;
        let checkpoint = WalRecord {
            lsn,
            kind: WalKind::Checkpoint { generation },
        };

        let mut buf = Vec::new();
        encode_frame(&checkpoint, &mut buf).map_err(StorageError::internal)?;
        for record in existing
            .iter()
            .filter(|r| r.lsn >= keep_from && !matches!(r.kind, WalKind::Checkpoint { .. }))
        {
            encode_frame(record, &mut buf).map_err(StorageError::internal)?;
        }

        let tmp = self.path.with_extension("log.tmp");
        {
            let mut f = File::create(&tmp).map_err(StorageError::from_io)?;
            f.write_all(&buf).map_err(StorageError::from_io)?;
            f.sync_all().map_err(StorageError::from_io)?;
        }
        std::fs::rename(&tmp, &self.path).map_err(StorageError::from_io)?;
        sync_parent_dir(&self.path)?;

        w.file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .map_err(StorageError::from_io)?;
        w.len = buf.len() as u64;
        w.next_lsn = lsn + 1;
        drop(w);

        // Writer lock released first: sync_to acquires frontier then writer,
        // so taking them in the opposite order here would deadlock
        let mut frontier = self.sync_frontier.lock();
        *frontier = (*frontier).max(lsn + 1);
        drop(frontier);

        log::debug!("WAL checkpoint at lsn {} (generation {})", lsn, generation);
        Ok(lsn)
    }

    /// Next LSN to be assigned
    pub fn next_lsn(&self) -> u64 {
        self.writer.lock().next_lsn
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// fsync the directory containing `path` so a rename is durable
pub(crate) fn sync_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        let dir = File::open(parent).map_err(StorageError::from_io)?;
        dir.sync_all().map_err(StorageError::from_io)?;
    }
    Ok(())
}

fn encode_frame(record: &WalRecord, out: &mut Vec<u8>) -> anyhow::Result<()> {
    let payload = bincode::serialize(record)?;
    let crc = crc32fast::hash(&payload);
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&crc.to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(())
}

struct Scan {
    records: Vec<WalRecord>,
    /// Byte length of the valid frame prefix
    valid_len: u64,
}

enum ScanError {
    Io(std::io::Error),
    Corrupt {
        valid: Vec<WalRecord>,
        valid_len: u64,
        detail: String,
    },
}

/// Read every valid record in the log.
///
/// A truncated frame at the end of the file is a torn write and is
/// discarded. A full frame with a bad CRC, or garbage followed by more
/// data, is corruption.
fn read_records(path: &Path) -> std::result::Result<Scan, ScanError> {
    let mut file = File::open(path).map_err(ScanError::Io)?;
    let mut data = Vec::new();
    file.read_to_end(&mut data).map_err(ScanError::Io)?;

    let mut records = Vec::new();
    let mut offset = 0usize;

    while offset < data.len() {
        let remaining = data.len() - offset;
        if remaining < 8 {
            // torn length/crc prefix
            break;
        }
        let len = u32::from_le_bytes(data[offset..offset + 4].try_into().unwrap()) as usize;
        let crc = u32::from_le_bytes(data[offset + 4..offset + 8].try_into().unwrap());
        let frame_end = offset + 8 + len;
        if frame_end > data.len() {
            // torn payload
            break;
        }
        let payload = &data[offset + 8..frame_end];
        if crc32fast::hash(payload) != crc {
            if frame_end == data.len() {
                // torn write clipped the final frame
                break;
            }
            return Err(ScanError::Corrupt {
                valid: records,
                valid_len: offset as u64,
                detail: format!("crc mismatch at offset {}", offset),
            });
        }
        match bincode::deserialize::<WalRecord>(payload) {
            Ok(record) => records.push(record),
            Err(e) => {
                return Err(ScanError::Corrupt {
                    valid: records,
                    valid_len: offset as u64,
                    detail: format!("undecodable record at offset {}: {}", offset, e),
                })
            }
        }
        offset = frame_end;
    }

    Ok(Scan {
        records,
        valid_len: offset as u64,
    })
}

/// Keep only records after the last checkpoint (including the checkpoint
/// itself, so callers can read the durable generation).
fn records_after_checkpoint(records: Vec<WalRecord>) -> Vec<WalRecord> {
    let last_checkpoint = records
        .iter()
        .rposition(|r| matches!(r.kind, WalKind::Checkpoint { .. }));
    match last_checkpoint {
        Some(idx) => records.into_iter().skip(idx).collect(),
        None => records,
    }
}
