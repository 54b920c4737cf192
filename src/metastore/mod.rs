//! Metadata store contract.
//!
//! The proxy keeps all file metadata, journals, queues and advisory locks in
//! an external key-value service; this module fixes the interface the rest
//! of the proxy depends on. The in-memory reference implementation in
//! [`memory`] backs tests and single-node deployments; production stores
//! plug in behind the same trait.

use ecs_api_types::{FileInfo, FileKey, FileMeta, FileStatus, JournalOp, JournalRecord};

mod memory;

pub use memory::MemoryMetaStore;

#[derive(Debug, thiserror::Error)]
#[error("metadata store error: {0}")]
pub struct MetaStoreError(pub String);

pub type Result<T> = std::result::Result<T, MetaStoreError>;

pub trait MetaStore: Send + Sync {
    // ------------- //
    // file metadata //
    // ------------- //

    /// Insert or replace the metadata record of `(key, meta.version)`.
    fn put_meta(&self, meta: &FileMeta) -> Result<()>;

    /// Fetch one version of a file, or the newest with
    /// [`ecs_api_types::LATEST_VERSION`].
    fn get_meta(&self, key: &FileKey, version: i32) -> Result<Option<FileMeta>>;

    /// Remove a file and all of its versions. Returns whether it existed.
    fn delete_meta(&self, key: &FileKey) -> Result<bool>;

    /// Remove a single version of a file.
    fn delete_meta_version(&self, key: &FileKey, version: i32) -> Result<bool>;

    /// Move a file (all versions and its journal) to a new name. Fails if
    /// the destination exists.
    fn rename_meta(&self, from: &FileKey, to: &FileKey) -> Result<bool>;

    /// Replace the chunk state (chunks, container ids, corruption flags) of
    /// the stored record matching `meta.version`.
    fn update_chunks(&self, meta: &FileMeta) -> Result<bool>;

    fn update_file_status(&self, key: &FileKey, version: i32, status: FileStatus) -> Result<bool>;

    fn list_files(&self, namespace_id: u8, prefix: &str, with_versions: bool)
        -> Result<Vec<FileInfo>>;

    /// Every file in every namespace, newest version only.
    fn all_files(&self) -> Result<Vec<FileInfo>>;

    fn file_count(&self) -> Result<u64>;

    fn file_limit(&self) -> u64;

    // -------------- //
    // advisory locks //
    // -------------- //

    /// Try to take the advisory lock of a file. Returns false when another
    /// holder has it; the caller decides how to back off and retry.
    fn lock_file(&self, key: &FileKey) -> Result<bool>;

    fn unlock_file(&self, key: &FileKey) -> Result<bool>;

    // ------- //
    // journal //
    // ------- //

    fn add_journal_record(&self, key: &FileKey, record: JournalRecord) -> Result<()>;

    /// Promote the matching *pre* record to *post*.
    fn promote_journal_record(
        &self,
        key: &FileKey,
        chunk_id: u16,
        container_id: i32,
        op: JournalOp,
    ) -> Result<bool>;

    fn remove_journal_record(
        &self,
        key: &FileKey,
        chunk_id: u16,
        container_id: i32,
        op: JournalOp,
    ) -> Result<bool>;

    fn file_journal(&self, key: &FileKey) -> Result<Vec<JournalRecord>>;

    fn files_with_journal(&self) -> Result<Vec<FileKey>>;

    // ------------ //
    // repair queue //
    // ------------ //

    /// Queue a file for repair; duplicates are ignored.
    fn mark_file_for_repair(&self, key: &FileKey) -> Result<bool>;

    /// Peek at most `batch` queued files, leaving them queued until
    /// [`MetaStore::remove_file_from_repair`] confirms the repair.
    fn files_for_repair(&self, batch: usize) -> Result<Vec<FileKey>>;

    fn remove_file_from_repair(&self, key: &FileKey) -> Result<bool>;

    fn num_files_to_repair(&self) -> Result<u64>;

    // ---------------------- //
    // background-task queue  //
    // ---------------------- //

    fn mark_file_for_task_check(&self, key: &FileKey) -> Result<bool>;

    fn next_file_for_task_check(&self) -> Result<Option<FileKey>>;

    // --------------- //
    // staging queues  //
    // --------------- //

    fn mark_file_for_writeback(&self, key: &FileKey) -> Result<bool>;

    fn files_for_writeback(&self) -> Result<Vec<FileKey>>;

    fn remove_file_from_writeback(&self, key: &FileKey) -> Result<bool>;
}
