//! Whole-file writes.

use log::{debug, info};

use ecs_api_types::{FileKey, FileMeta, FileStatus, StagedInfo};

use crate::error::{ProxyError, Result};
use crate::tools::digest::Md5Digest;
use crate::tools::epoch_now;

use super::Proxy;

impl Proxy {
    /// Store a new file (or a new version of an existing one).
    ///
    /// With staging enabled the data is acknowledged once it hits the local
    /// staging store; the writeback worker later pushes it to the backend
    /// through [`Proxy::write_data_as_version`].
    pub async fn write_file(
        &self,
        namespace_id: u8,
        name: &str,
        storage_class: &str,
        data: &[u8],
    ) -> Result<u64> {
        if data.is_empty() {
            return Err(ProxyError::InvalidArguments("cannot write an empty file".into()));
        }
        let started = std::time::Instant::now();
        let key = FileKey::new(namespace_id, name);
        let (class_name, coding) = self.resolve_storage_class(storage_class)?;

        if let Some(staging) = self.staging() {
            let _lock = self.lock_file(&key).await?;
            staging
                .overwrite_file(&key, data)
                .map_err(|err| ProxyError::Internal(format!("staging write failed - {err}")))?;
            let existing = self.get_meta(&key)?;
            let version = existing.map(|m| m.version + 1).unwrap_or(0);
            let mut file =
                self.prepare_new_file(&key, version, data.len() as u64, class_name, coding)?;
            file.staged = Some(StagedInfo {
                size: data.len() as u64,
                mtime: epoch_now(),
                storage_class: file.storage_class.clone(),
            });
            self.metastore.put_meta(&file)?;
            let _ = staging.pin(&key);
            self.metastore.mark_file_for_writeback(&key)?;
            info!("write {key}: staged {} bytes", data.len());
            return Ok(data.len() as u64);
        }

        let _lock = self.lock_file(&key).await?;
        let existing = self.get_meta(&key)?;
        let version = existing.as_ref().map(|m| m.version + 1).unwrap_or(0);
        let file = self
            .write_data_as_version(&key, version, class_name, coding, data)
            .await?;

        // a replaced version is dropped in whole when versioning is off
        if let Some(old) = existing {
            if self.config.misc.overwrite_files {
                self.delete_version_data(&old).await?;
            }
        }

        info!(
            "write {key}: stored {} bytes in {} stripes as version {} in {:.3}s",
            data.len(),
            file.num_stripes,
            file.version,
            started.elapsed().as_secs_f64()
        );
        Ok(data.len() as u64)
    }

    /// The backend write pipeline: encode and store every stripe, then
    /// commit the metadata. Used by both the direct write path and the
    /// staging writeback worker. The caller holds the advisory lock.
    pub(crate) async fn write_data_as_version(
        &self,
        key: &FileKey,
        version: i32,
        class_name: String,
        coding: ecs_api_types::CodingMeta,
        data: &[u8],
    ) -> Result<FileMeta> {
        // give the deduplication hook a chance to shrink the payload
        let scan = self.dedup().scan(key.namespace_id, &key.name, data);

        let result = self
            .write_stripes(key, version, class_name, coding, &scan.data_to_store)
            .await;
        if let Some(commit_id) = &scan.commit_id {
            match &result {
                Ok(_) => self.dedup().commit(commit_id),
                Err(_) => self.dedup().abort(commit_id),
            }
        }
        result
    }

    async fn write_stripes(
        &self,
        key: &FileKey,
        version: i32,
        class_name: String,
        coding: ecs_api_types::CodingMeta,
        data: &[u8],
    ) -> Result<FileMeta> {
        let mut file =
            self.prepare_new_file(key, version, data.len() as u64, class_name, coding)?;

        let num_containers = self.chunk_manager.num_required_containers(&file.coding)?;
        let min_containers = self.chunk_manager.min_num_required_containers(&file.coding)?;
        let spare = self
            .coordinator
            .find_spare_containers(&[], &[], num_containers, file.size, &file.coding)
            .await;
        if spare.len() < min_containers {
            return Err(ProxyError::InsufficientCapacity {
                needed: min_containers,
                selected: spare.len(),
            });
        }

        let stripe_size = self.chunk_manager.max_data_size_per_stripe(&file.coding)? as usize;
        let mut digest = Md5Digest::new()
            .map_err(|err| ProxyError::Internal(format!("md5 init failed - {err}")))?;
        let mut bg_pending = false;

        for stripe_id in 0..file.num_stripes as usize {
            let start = stripe_id * stripe_size;
            let end = (start + stripe_size).min(data.len());
            let stripe_data = &data[start..end];
            debug!("write {key}: stripe {stripe_id} covers [{start}, {end})");

            match self
                .chunk_manager
                .write_file_stripe(&mut file, stripe_id, stripe_data, &spare, false)
                .await
            {
                Ok(outcome) => bg_pending |= outcome.bg_pending,
                Err(err) if stripe_id == 0 => return Err(err),
                Err(err) => {
                    // earlier stripes already committed; roll them back
                    let all = vec![true; file.num_chunks()];
                    let _ = self.chunk_manager.delete_file(&file, &all).await;
                    self.clear_write_journal(&file);
                    return Err(ProxyError::Partial(Box::new(err)));
                }
            }

            digest
                .update(stripe_data)
                .map_err(|err| ProxyError::Internal(format!("md5 update failed - {err}")))?;
        }

        file.md5 = digest
            .finish()
            .map_err(|err| ProxyError::Internal(format!("md5 finish failed - {err}")))?;
        if bg_pending {
            file.status = FileStatus::BgTaskPending;
        }

        self.metastore.put_meta(&file)?;
        if bg_pending {
            self.metastore.mark_file_for_task_check(key)?;
        } else {
            self.clear_write_journal(&file);
        }
        Ok(file)
    }
}
