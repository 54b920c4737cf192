//! File-level operations of the proxy.
//!
//! The facade owns the metadata store, the coordinator, the chunk manager
//! and the staging tier. Every mutating operation runs under the per-file
//! advisory lock; reads see only committed metadata and take no lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};

use ecs_api_types::{CodingMeta, FileKey, FileMeta, JournalOp, INVALID_CONTAINER_ID};
use ecs_config::{Config, StorageClassRegistry};

use crate::chunk_manager::ChunkManager;
use crate::coordinator::ProxyCoordinator;
use crate::error::{ProxyError, Result};
use crate::metastore::MetaStore;
use crate::server::BgTaskProgress;
use crate::staging::Staging;
use crate::tools::epoch_now;

pub mod dedup;

mod modify;
mod read;
mod repair;
mod status;
mod transfer;
mod write;

use dedup::{DedupNone, Deduplication};

pub struct Proxy {
    config: Arc<Config>,
    classes: StorageClassRegistry,
    metastore: Arc<dyn MetaStore>,
    coordinator: Arc<ProxyCoordinator>,
    chunk_manager: Arc<ChunkManager>,
    staging: Option<Arc<Staging>>,
    dedup: Arc<dyn Deduplication>,
    bg_progress: Arc<BgTaskProgress>,
    repair_in_flight: AtomicU64,
}

impl Proxy {
    pub fn new(
        config: Arc<Config>,
        classes: StorageClassRegistry,
        metastore: Arc<dyn MetaStore>,
        coordinator: Arc<ProxyCoordinator>,
        chunk_manager: Arc<ChunkManager>,
        staging: Option<Arc<Staging>>,
        bg_progress: Arc<BgTaskProgress>,
    ) -> Self {
        Self {
            config,
            classes,
            metastore,
            coordinator,
            chunk_manager,
            staging,
            dedup: Arc::new(DedupNone),
            bg_progress,
            repair_in_flight: AtomicU64::new(0),
        }
    }

    /// Replace the deduplication hook (the default stores everything).
    pub fn set_dedup(&mut self, dedup: Arc<dyn Deduplication>) {
        self.dedup = dedup;
    }

    pub(crate) fn dedup(&self) -> &Arc<dyn Deduplication> {
        &self.dedup
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn coordinator(&self) -> &Arc<ProxyCoordinator> {
        &self.coordinator
    }

    pub fn chunk_manager(&self) -> &Arc<ChunkManager> {
        &self.chunk_manager
    }

    pub fn metastore(&self) -> &Arc<dyn MetaStore> {
        &self.metastore
    }

    pub(crate) fn staging(&self) -> Option<&Arc<Staging>> {
        self.staging.as_ref()
    }

    /// Resolve the namespace of a request; the sentinel `0xff` (and an
    /// absent id) fall back to the proxy's own namespace.
    pub fn resolve_namespace(&self, namespace_id: Option<u8>) -> u8 {
        match namespace_id {
            Some(id) if id != u8::MAX => id,
            _ => self.config.proxy.namespace_id,
        }
    }

    /// Resolve a storage class name to its coding parameters.
    pub(crate) fn resolve_storage_class(&self, name: &str) -> Result<(String, CodingMeta)> {
        self.classes
            .resolve(name)
            .ok_or_else(|| ProxyError::InvalidArguments(format!("unknown storage class '{name}'")))
    }

    pub(crate) fn classes(&self) -> &StorageClassRegistry {
        &self.classes
    }

    /// Acquire the advisory lock of a file, retrying with back-off. The
    /// returned guard unlocks on drop.
    pub(crate) async fn lock_file(&self, key: &FileKey) -> Result<FileLockGuard<'_>> {
        let attempts = self.config.retry.num.max(1);
        let interval = std::time::Duration::from_millis(self.config.retry.interval);
        for attempt in 0..attempts {
            if self.metastore.lock_file(key)? {
                return Ok(FileLockGuard { proxy: self, key: key.clone() });
            }
            debug!("lock of {key} busy, attempt {}/{attempts}", attempt + 1);
            tokio::time::sleep(interval).await;
        }
        Err(ProxyError::MetadataConflict(format!(
            "unable to lock {key} after {attempts} attempts"
        )))
    }

    /// Fetch the newest committed metadata of a file.
    pub(crate) fn get_meta(&self, key: &FileKey) -> Result<Option<FileMeta>> {
        Ok(self.metastore.get_meta(key, ecs_api_types::LATEST_VERSION)?)
    }

    /// Remove the write-journal records of every stored chunk position of a
    /// committed operation.
    pub(crate) fn clear_write_journal(&self, file: &FileMeta) {
        let key = file.key();
        for (chunk, &container_id) in file.chunks.iter().zip(&file.container_ids) {
            if container_id == INVALID_CONTAINER_ID {
                continue;
            }
            if let Err(err) =
                self.metastore
                    .remove_journal_record(&key, chunk.chunk_id, container_id, JournalOp::Write)
            {
                warn!("unable to clear journal record of {key} chunk {} - {err}", chunk.chunk_id);
            }
        }
    }

    /// Delete the chunks of one committed file version and drop its
    /// metadata record. Chunk deletions are journaled so the reconciler can
    /// finish them after a crash.
    pub(crate) async fn delete_version_data(&self, file: &FileMeta) -> Result<()> {
        let key = file.key();
        let (status, _) = self
            .coordinator
            .check_container_liveness(&file.container_ids, true, false)
            .await;
        for (i, chunk) in file.chunks.iter().enumerate() {
            if status[i] && file.container_ids[i] != INVALID_CONTAINER_ID {
                self.chunk_manager
                    .journal_pre_delete(&key, chunk, file.container_ids[i]);
            }
        }
        let num_failed = self.chunk_manager.delete_file(file, &status).await?;
        if num_failed > 0 {
            // chunks on unreachable containers stay behind as orphans; their
            // journal records let the reconciler retry the deletion
            info!(
                "delete {key} version {}: {num_failed} chunk deletes pending reconciliation",
                file.version
            );
        }
        for (i, chunk) in file.chunks.iter().enumerate() {
            if status[i] && file.container_ids[i] != INVALID_CONTAINER_ID {
                self.chunk_manager.journal_remove(
                    &key,
                    chunk.chunk_id,
                    file.container_ids[i],
                    JournalOp::Delete,
                );
            }
        }
        self.metastore.delete_meta_version(&key, file.version)?;
        Ok(())
    }

    /// Build a fresh metadata record for a write of `size` bytes.
    pub(crate) fn prepare_new_file(
        &self,
        key: &FileKey,
        version: i32,
        size: u64,
        class_name: String,
        coding: CodingMeta,
    ) -> Result<FileMeta> {
        let num_stripes = self.num_stripes_for(&coding, size)?;
        let chunks_per_stripe = self.chunk_manager.num_chunks_per_stripe(&coding)?;
        let mut file = FileMeta::new(key.namespace_id, key.name.clone());
        file.version = version;
        file.regen_uuid();
        file.size = size;
        file.storage_class = class_name;
        file.coding = coding;
        file.num_stripes = num_stripes as u32;
        file.init_chunks(num_stripes * chunks_per_stripe);
        let now = epoch_now();
        file.set_timestamps(now, now, now);
        Ok(file)
    }

    pub(crate) fn num_stripes_for(&self, coding: &CodingMeta, size: u64) -> Result<usize> {
        let stripe_size = self.chunk_manager.max_data_size_per_stripe(coding)?;
        if stripe_size == 0 {
            return Err(ProxyError::InvalidArguments("zero stripe size".into()));
        }
        Ok((((size.max(1)) + stripe_size - 1) / stripe_size) as usize)
    }

    pub(crate) fn repair_in_flight(&self) -> u64 {
        self.repair_in_flight.load(Ordering::SeqCst)
    }

    pub(crate) fn track_repair<'a>(&'a self) -> RepairTicket<'a> {
        self.repair_in_flight.fetch_add(1, Ordering::SeqCst);
        RepairTicket { proxy: self }
    }

    pub(crate) fn bg_progress(&self) -> &Arc<BgTaskProgress> {
        &self.bg_progress
    }
}

/// Advisory-lock guard; unlocks when dropped.
pub(crate) struct FileLockGuard<'a> {
    proxy: &'a Proxy,
    key: FileKey,
}

impl Drop for FileLockGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.proxy.metastore.unlock_file(&self.key) {
            warn!("unable to unlock {} - {err}", self.key);
        }
    }
}

/// Keeps the in-flight repair counter accurate across early returns.
pub(crate) struct RepairTicket<'a> {
    proxy: &'a Proxy,
}

impl Drop for RepairTicket<'_> {
    fn drop(&mut self) {
        self.proxy.repair_in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}
