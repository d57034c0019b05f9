/// SnapshotFile - durable form of the latest published ReadView
///
/// Layout (little-endian):
/// ```text
/// [FileHeader (128B)]
/// [ConceptArena  (64B * concept_count, 64-byte aligned)]
/// [EdgeArena     (32B * edge_count)]
/// [VectorArena   (D * 4B per embedded concept, 32-byte aligned)]
/// [BlobArena     (raw content bytes + bincode metadata, offsets in records)]
/// [u32 crc32 over everything before it]
/// ```
///
/// The file is replaced atomically on every persist: write temp + fsync +
/// rename + fsync(parent). It starts at 512 MiB sparse and grows by
/// doubling; readers mmap it read-only.
use crate::error::{Result, StorageError};
use crate::read_view::{ConceptNode, GraphSnapshot};
use crate::types::{AssociationRecord, ConceptId, ConceptRecord};
use crate::wal::sync_parent_dir;
use bytemuck::{Pod, Zeroable};
use memmap2::Mmap;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use sutra_protocol::ConceptMetadata;

const MAGIC: [u8; 8] = *b"SUTRASNP";
const FORMAT_VERSION: u32 = 0;
const HEADER_SIZE: usize = 128;
const CONCEPT_RECORD_SIZE: usize = 64;
const EDGE_RECORD_SIZE: usize = 32;

/// Initial sparse size; the file grows by doubling past this.
const INITIAL_FILE_SIZE: u64 = 512 * 1024 * 1024;

/// Sentinel for "no embedding stored"
const NO_EMBEDDING: u64 = u64::MAX;

#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C, packed)]
struct FileHeader {
    magic: [u8; 8],     // 8
    version: u32,       // 4
    dimension: u32,     // 4
    generation: u64,    // 8
    concept_count: u64, // 8
    edge_count: u64,    // 8
    concept_off: u64,   // 8
    edge_off: u64,      // 8
    vector_off: u64,    // 8
    blob_off: u64,      // 8
    /// Bytes covered by the trailing CRC; the CRC itself sits here
    data_len: u64, // 8
    reserved: [u8; HEADER_SIZE - 80],
}

/// Align `offset` up to `alignment` bytes
fn align_up(offset: u64, alignment: u64) -> u64 {
    let mask = alignment - 1;
    (offset + mask) & !mask
}

/// Result of loading a snapshot file
pub struct LoadedSnapshot {
    pub snapshot: GraphSnapshot,
    /// Embeddings keyed by concept, for rebuilding the vector index
    pub vectors: HashMap<ConceptId, Vec<f32>>,
    pub dimension: usize,
}

/// Atomically persist a snapshot to `path`.
pub fn write_snapshot(path: &Path, snapshot: &GraphSnapshot, dimension: usize) -> Result<()> {
    let mut concept_records = Vec::with_capacity(snapshot.concepts.len());
    let mut edge_records: Vec<AssociationRecord> = Vec::new();
    let mut vector_arena: Vec<u8> = Vec::new();
    let mut blob_arena: Vec<u8> = Vec::new();

    let concept_off = align_up(HEADER_SIZE as u64, 64);
    let edge_off = align_up(
        concept_off + (snapshot.concepts.len() * CONCEPT_RECORD_SIZE) as u64,
        8,
    );
    let total_edges: usize = snapshot.concepts.values().map(|n| n.edges.len()).sum();
    let vector_off = align_up(edge_off + (total_edges * EDGE_RECORD_SIZE) as u64, 32);

    for node in snapshot.concepts.values() {
        let embedding_offset = match &node.embedding {
            Some(vec) => {
                let off = vector_off + vector_arena.len() as u64;
                for v in vec.iter() {
                    vector_arena.extend_from_slice(&v.to_le_bytes());
                }
                off
            }
            None => NO_EMBEDDING,
        };

        // Blob offsets are arena-relative until the arena base is known
        let content_offset = blob_arena.len() as u64;
        blob_arena.extend_from_slice(node.content.as_bytes());
        let content_length = node.content.len() as u32;

        let metadata_offset = blob_arena.len() as u64;
        let metadata_bytes =
            bincode::serialize(&node.metadata).map_err(StorageError::internal)?;
        blob_arena.extend_from_slice(&metadata_bytes);
        let metadata_length = metadata_bytes.len() as u32;

        concept_records.push(ConceptRecord {
            concept_id: node.id,
            strength: node.strength,
            confidence: node.confidence,
            created: node.created,
            last_accessed: node.last_accessed,
            content_offset,
            content_length,
            embedding_offset,
            metadata_offset,
            metadata_length,
        });

        // Edges grouped by source, in the node's insertion order, so the
        // reload rebuilds identical neighbor ordering
        edge_records.extend_from_slice(&node.edges);
    }

    let blob_off = align_up(vector_off + vector_arena.len() as u64, 8);
    for record in &mut concept_records {
        record.content_offset += blob_off;
        record.metadata_offset += blob_off;
    }

    let data_len = blob_off + blob_arena.len() as u64;

    let header = FileHeader {
        magic: MAGIC,
        version: FORMAT_VERSION,
        dimension: dimension as u32,
        generation: snapshot.generation,
        concept_count: concept_records.len() as u64,
        edge_count: edge_records.len() as u64,
        concept_off,
        edge_off,
        vector_off,
        blob_off,
        data_len,
        reserved: [0; HEADER_SIZE - 80],
    };

    let mut buf = vec![0u8; data_len as usize];
    buf[..HEADER_SIZE].copy_from_slice(bytemuck::bytes_of(&header));
    for (i, record) in concept_records.iter().enumerate() {
        let off = concept_off as usize + i * CONCEPT_RECORD_SIZE;
        buf[off..off + CONCEPT_RECORD_SIZE].copy_from_slice(bytemuck::bytes_of(record));
    }
    for (i, record) in edge_records.iter().enumerate() {
        let off = edge_off as usize + i * EDGE_RECORD_SIZE;
        buf[off..off + EDGE_RECORD_SIZE].copy_from_slice(bytemuck::bytes_of(record));
    }
    buf[vector_off as usize..vector_off as usize + vector_arena.len()]
        .copy_from_slice(&vector_arena);
    buf[blob_off as usize..blob_off as usize + blob_arena.len()].copy_from_slice(&blob_arena);

    let crc = crc32fast::hash(&buf);

    // Atomic swap: temp + fsync + rename + fsync(parent)
    let tmp = path.with_extension("dat.tmp");
    {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)
            .map_err(StorageError::from_io)?;
        file.write_all(&buf).map_err(StorageError::from_io)?;
        file.write_all(&crc.to_le_bytes())
            .map_err(StorageError::from_io)?;

        // Sparse headroom: 512 MiB floor, then doubling
        let target = file_size_for(data_len + 4);
        file.set_len(target).map_err(StorageError::from_io)?;
        file.sync_all().map_err(StorageError::from_io)?;
    }
    std::fs::rename(&tmp, path).map_err(StorageError::from_io)?;
    sync_parent_dir(path)?;

    log::debug!(
        "snapshot persisted: generation={} concepts={} edges={}",
        snapshot.generation,
        concept_records.len(),
        edge_records.len()
    );
    Ok(())
}

fn file_size_for(data_len: u64) -> u64 {
    let mut size = INITIAL_FILE_SIZE;
    while size < data_len {
        size *= 2;
    }
    size
}

/// Load a snapshot file via mmap. Verifies magic, version and the trailing
/// CRC; any mismatch is `Corruption` and the engine must refuse to serve.
pub fn load_snapshot(path: &Path) -> Result<LoadedSnapshot> {
    let file = File::open(path).map_err(StorageError::from_io)?;
    let mmap = unsafe { Mmap::map(&file) }.map_err(StorageError::from_io)?;

    if mmap.len() < HEADER_SIZE + 4 {
        return Err(StorageError::Corruption("snapshot file too small".into()));
    }

    let header: FileHeader = bytemuck::pod_read_unaligned(&mmap[..HEADER_SIZE]);
    if header.magic != MAGIC {
        return Err(StorageError::Corruption("snapshot magic mismatch".into()));
    }
    if header.version != FORMAT_VERSION {
        return Err(StorageError::Corruption(format!(
            "snapshot version {} unsupported",
            { header.version }
        )));
    }

    let data_len = header.data_len as usize;
    if data_len + 4 > mmap.len() {
        return Err(StorageError::Corruption("snapshot truncated".into()));
    }
    let stored_crc = u32::from_le_bytes(mmap[data_len..data_len + 4].try_into().unwrap());
    if crc32fast::hash(&mmap[..data_len]) != stored_crc {
        return Err(StorageError::Corruption("snapshot crc mismatch".into()));
    }

    let dimension = header.dimension as usize;
    let mut snapshot = GraphSnapshot::new(header.generation);
    let mut vectors = HashMap::with_capacity(header.concept_count as usize);

    for i in 0..header.concept_count as usize {
        let off = header.concept_off as usize + i * CONCEPT_RECORD_SIZE;
        let record: ConceptRecord =
            bytemuck::pod_read_unaligned(&mmap[off..off + CONCEPT_RECORD_SIZE]);

        let content_start = record.content_offset as usize;
        let content_end = content_start + record.content_length as usize;
        if content_end > data_len {
            return Err(StorageError::Corruption("content blob out of bounds".into()));
        }
        let content = std::str::from_utf8(&mmap[content_start..content_end])
            .map_err(|_| StorageError::Corruption("content blob is not UTF-8".into()))?;

        let meta_start = record.metadata_offset as usize;
        let meta_end = meta_start + record.metadata_length as usize;
        if meta_end > data_len {
            return Err(StorageError::Corruption(
                "metadata blob out of bounds".into(),
            ));
        }
        let metadata: ConceptMetadata = bincode::deserialize(&mmap[meta_start..meta_end])
            .map_err(|e| StorageError::Corruption(format!("metadata blob undecodable: {}", e)))?;

        let embedding = if record.embedding_offset == NO_EMBEDDING {
            None
        } else {
            let start = record.embedding_offset as usize;
            let end = start + dimension * 4;
            if end > data_len {
                return Err(StorageError::Corruption("vector arena out of bounds".into()));
            }
            let vec: Vec<f32> = mmap[start..end]
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes(c.try_into().unwrap()))
                .collect();
            vectors.insert(record.concept_id, vec.clone());
            Some(Arc::from(vec.into_boxed_slice()))
        };

        let mut node = ConceptNode::new(
            record.concept_id,
            Arc::from(content),
            embedding,
            record.strength,
            record.confidence,
            metadata,
            record.created,
        );
        node.last_accessed = record.last_accessed;
        snapshot.concepts.insert(record.concept_id, node);
    }

    for i in 0..header.edge_count as usize {
        let off = header.edge_off as usize + i * EDGE_RECORD_SIZE;
        let record: AssociationRecord =
            bytemuck::pod_read_unaligned(&mmap[off..off + EDGE_RECORD_SIZE]);

        let source = record.source_id;
        match snapshot.concepts.get_mut(&source) {
            Some(node) => node.add_edge(record),
            None => {
                return Err(StorageError::Corruption(format!(
                    "edge references missing source {}",
                    source
                )))
            }
        }
    }

    snapshot.update_stats();

    log::info!(
        "snapshot loaded: generation={} concepts={} edges={}",
        snapshot.generation,
        snapshot.concept_count,
        snapshot.edge_count
    );

    Ok(LoadedSnapshot {
        snapshot,
        vectors,
        dimension,
    })
}
