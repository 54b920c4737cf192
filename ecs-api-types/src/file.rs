use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{CodingMeta, FileStatus, INVALID_CONTAINER_ID, MD5_DIGEST_LENGTH};

/// Identity of a file within the proxy: namespace plus client-visible name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileKey {
    pub namespace_id: u8,
    pub name: String,
}

impl FileKey {
    pub fn new(namespace_id: u8, name: impl Into<String>) -> Self {
        Self {
            namespace_id,
            name: name.into(),
        }
    }
}

impl std::fmt::Display for FileKey {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace_id, self.name)
    }
}

/// Metadata of a single chunk. Chunk data travels separately; the metadata
/// record is owned by the file it belongs to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMeta {
    pub namespace_id: u8,
    pub fuuid: Uuid,
    pub chunk_id: u16,
    pub file_version: i32,
    pub size: u32,
    pub md5: [u8; MD5_DIGEST_LENGTH],
}

impl ChunkMeta {
    /// Canonical chunk name used as the storage key on agents.
    pub fn chunk_name(&self) -> String {
        format!("{}-{}-{}", self.namespace_id, self.fuuid.as_simple(), self.chunk_id)
    }

    /// Whether two records refer to the same stored bytes.
    pub fn matches(&self, other: &ChunkMeta) -> bool {
        self.namespace_id == other.namespace_id
            && self.fuuid == other.fuuid
            && self.chunk_id == other.chunk_id
            && self.size == other.size
            && self.md5 == other.md5
    }
}

/// Staging-tier state of a file, tracked alongside the backend metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedInfo {
    pub size: u64,
    pub mtime: i64,
    pub storage_class: String,
}

/// Full metadata record of one file version.
///
/// `chunks`, `container_ids` and `corrupted` always have equal length
/// (`num_stripes * chunks_per_stripe`); a container id of
/// [`INVALID_CONTAINER_ID`] marks the chunk at that position as lost.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileMeta {
    pub namespace_id: u8,
    pub name: String,
    pub uuid: Uuid,
    pub version: i32,
    pub size: u64,
    /// Offset of the operation currently applied to this record.
    pub offset: u64,
    /// Length of the operation currently applied to this record.
    pub length: u64,
    pub ctime: i64,
    pub mtime: i64,
    pub atime: i64,
    pub md5: [u8; MD5_DIGEST_LENGTH],
    pub storage_class: String,
    pub coding: CodingMeta,
    pub num_stripes: u32,
    pub chunks: Vec<ChunkMeta>,
    pub container_ids: Vec<i32>,
    pub corrupted: Vec<bool>,
    pub status: FileStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub staged: Option<StagedInfo>,
}

impl FileMeta {
    pub fn new(namespace_id: u8, name: impl Into<String>) -> Self {
        Self {
            namespace_id,
            name: name.into(),
            uuid: Uuid::nil(),
            version: 0,
            ..Default::default()
        }
    }

    pub fn key(&self) -> FileKey {
        FileKey::new(self.namespace_id, self.name.clone())
    }

    pub fn num_chunks(&self) -> usize {
        self.chunks.len()
    }

    pub fn chunks_per_stripe(&self) -> usize {
        if self.num_stripes == 0 {
            0
        } else {
            self.chunks.len() / self.num_stripes as usize
        }
    }

    /// Allocate the chunk, container-id and corruption arrays for
    /// `num_chunks` positions, all marked unassigned.
    pub fn init_chunks(&mut self, num_chunks: usize) {
        self.chunks = vec![ChunkMeta::default(); num_chunks];
        self.container_ids = vec![INVALID_CONTAINER_ID; num_chunks];
        self.corrupted = vec![false; num_chunks];
        for (i, chunk) in self.chunks.iter_mut().enumerate() {
            chunk.namespace_id = self.namespace_id;
            chunk.fuuid = self.uuid;
            chunk.chunk_id = i as u16;
            chunk.file_version = self.version;
        }
    }

    /// Assign a fresh per-operation uuid; every write and repair gets one.
    pub fn regen_uuid(&mut self) {
        self.uuid = Uuid::new_v4();
    }

    /// Positions of one stripe as a chunk index range.
    pub fn stripe_range(&self, stripe: usize) -> std::ops::Range<usize> {
        let cps = self.chunks_per_stripe();
        stripe * cps..(stripe + 1) * cps
    }

    /// Copy the name, policy and version-control fields, but none of the
    /// chunk state, from `src`.
    pub fn copy_storage_policy(&mut self, src: &FileMeta) {
        self.storage_class = src.storage_class.clone();
        self.coding = src.coding.params();
    }

    pub fn set_timestamps(&mut self, ctime: i64, mtime: i64, atime: i64) {
        self.ctime = ctime;
        self.mtime = mtime;
        self.atime = atime;
    }
}

/// Listing entry returned to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileInfo {
    pub namespace_id: u8,
    pub name: String,
    pub version: i32,
    pub size: u64,
    pub ctime: i64,
    pub atime: i64,
    pub mtime: i64,
}

/// Journaled chunk operation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JournalOp {
    Write,
    Delete,
}

/// A journal record is *pre* while the chunk request is in flight and
/// *post* once the outcome is known; dangling records are resolved by the
/// journal reconciler after a crash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JournalPhase {
    Pre,
    Post,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalRecord {
    pub chunk: ChunkMeta,
    pub container_id: i32,
    pub op: JournalOp,
    pub phase: JournalPhase,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn chunk_name_is_canonical() {
        let mut chunk = ChunkMeta::default();
        chunk.namespace_id = 7;
        chunk.fuuid = Uuid::nil();
        chunk.chunk_id = 3;
        assert_eq!(
            chunk.chunk_name(),
            format!("7-{}-3", Uuid::nil().as_simple())
        );
    }

    #[test]
    fn init_chunks_assigns_positions() {
        let mut meta = FileMeta::new(1, "a");
        meta.regen_uuid();
        meta.version = 2;
        meta.init_chunks(8);
        meta.num_stripes = 2;
        assert_eq!(meta.chunks.len(), 8);
        assert_eq!(meta.chunks_per_stripe(), 4);
        assert_eq!(meta.stripe_range(1), 4..8);
        assert!(meta.container_ids.iter().all(|&id| id == INVALID_CONTAINER_ID));
        assert_eq!(meta.chunks[5].chunk_id, 5);
        assert_eq!(meta.chunks[5].file_version, 2);
        assert_eq!(meta.chunks[5].fuuid, meta.uuid);
    }
}
