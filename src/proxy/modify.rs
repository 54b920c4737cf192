//! Appends and overwrites.

use log::{debug, info, warn};

use ecs_api_types::{FileKey, FileMeta, FileStatus};

use crate::error::{ProxyError, Result};
use crate::tools::digest::Md5Digest;
use crate::tools::epoch_now;

use super::Proxy;

impl Proxy {
    /// Append data at the end of a file.
    ///
    /// Appends must start exactly at the current size, and the current size
    /// must be stripe-aligned (only the final stripe of a file may be
    /// short). Appending zero bytes is a no-op.
    pub async fn append_file(
        &self,
        namespace_id: u8,
        name: &str,
        offset: u64,
        data: &[u8],
    ) -> Result<u64> {
        self.modify_file(namespace_id, name, offset, data, true).await
    }

    /// Overwrite part of a file in place. `offset + data.len()` must stay
    /// within the current size; unaligned ranges are widened to whole
    /// stripes by an internal read-patch-rewrite.
    pub async fn overwrite_file(
        &self,
        namespace_id: u8,
        name: &str,
        offset: u64,
        data: &[u8],
    ) -> Result<u64> {
        self.modify_file(namespace_id, name, offset, data, false).await
    }

    async fn modify_file(
        &self,
        namespace_id: u8,
        name: &str,
        offset: u64,
        data: &[u8],
        is_append: bool,
    ) -> Result<u64> {
        let key = FileKey::new(namespace_id, name);
        let _lock = self.lock_file(&key).await?;
        let old = self.get_meta(&key)?.ok_or(ProxyError::NotFound)?;

        // appending nothing changes neither size nor version
        if is_append && data.is_empty() {
            if offset != old.size {
                return Err(ProxyError::InvalidArguments(format!(
                    "append offset {offset} does not match file size {}",
                    old.size
                )));
            }
            return Ok(old.size);
        }
        if data.is_empty() {
            return Err(ProxyError::InvalidArguments("empty overwrite".into()));
        }

        // the most recent data may live in staging
        if let (Some(staging), Some(staged)) = (self.staging(), &old.staged) {
            if staged.mtime >= old.mtime && staging.exists(&key) {
                return self
                    .modify_staged_file(&key, old, offset, data, is_append)
                    .await;
            }
        }

        let stripe_size = self.chunk_manager.max_data_size_per_stripe(&old.coding)?;

        if is_append {
            if offset != old.size {
                return Err(ProxyError::InvalidArguments(format!(
                    "append offset {offset} does not match file size {}",
                    old.size
                )));
            }
            if old.size % stripe_size != 0 {
                return Err(ProxyError::InvalidArguments(format!(
                    "cannot append to a file of unaligned size {} (stripe size {stripe_size})",
                    old.size
                )));
            }
            self.append_stripes(&key, old, data).await
        } else {
            if offset + data.len() as u64 > old.size {
                return Err(ProxyError::InvalidArguments(format!(
                    "overwrite range [{offset}, {}) exceeds file size {}",
                    offset + data.len() as u64,
                    old.size
                )));
            }
            self.overwrite_stripes(&key, old, offset, data).await
        }
    }

    async fn modify_staged_file(
        &self,
        key: &FileKey,
        mut old: FileMeta,
        offset: u64,
        data: &[u8],
        is_append: bool,
    ) -> Result<u64> {
        let staging = self.staging().unwrap();
        let staged = old.staged.as_mut().unwrap();
        if is_append && offset != staged.size {
            return Err(ProxyError::InvalidArguments(format!(
                "append offset {offset} does not match staged size {}",
                staged.size
            )));
        }
        if !is_append && offset + data.len() as u64 > staged.size {
            return Err(ProxyError::InvalidArguments(format!(
                "overwrite range exceeds staged size {}",
                staged.size
            )));
        }
        staging
            .write_file(key, offset, data)
            .map_err(|err| ProxyError::Internal(format!("staging write failed - {err}")))?;
        staged.size = staged.size.max(offset + data.len() as u64);
        staged.mtime = epoch_now();
        let new_size = staged.size;
        old.size = new_size;
        self.metastore.put_meta(&old)?;
        self.metastore.mark_file_for_writeback(key)?;
        debug!("{key}: modified staged copy, size now {new_size}");
        Ok(new_size)
    }

    /// Append whole stripes after the current end of the file.
    async fn append_stripes(&self, key: &FileKey, old: FileMeta, data: &[u8]) -> Result<u64> {
        let stripe_size = self.chunk_manager.max_data_size_per_stripe(&old.coding)? as usize;
        let chunks_per_stripe = old.chunks_per_stripe();
        let old_stripes = old.num_stripes as usize;
        let new_stripes = (data.len() + stripe_size - 1) / stripe_size;

        // the new record: previous stripes carried over verbatim
        let mut file = old.clone();
        file.version = old.version + 1;
        file.size = old.size + data.len() as u64;
        file.num_stripes = (old_stripes + new_stripes) as u32;
        file.chunks
            .resize((old_stripes + new_stripes) * chunks_per_stripe, Default::default());
        file.container_ids
            .resize((old_stripes + new_stripes) * chunks_per_stripe, ecs_api_types::INVALID_CONTAINER_ID);
        file.corrupted
            .resize((old_stripes + new_stripes) * chunks_per_stripe, false);
        file.status = FileStatus::None;

        let num_containers = self.chunk_manager.num_required_containers(&file.coding)?;
        let min_containers = self.chunk_manager.min_num_required_containers(&file.coding)?;
        let spare = self
            .coordinator
            .find_spare_containers(&[], &[], num_containers, data.len() as u64, &file.coding)
            .await;
        if spare.len() < min_containers {
            return Err(ProxyError::InsufficientCapacity {
                needed: min_containers,
                selected: spare.len(),
            });
        }

        // digest inputs are gathered before any stripe changes hands
        let old_content = if old.size > 0 {
            self.read_backend_range(&old, 0, old.size).await?
        } else {
            Vec::new()
        };

        let mut bg_pending = false;
        for s in 0..new_stripes {
            let start = s * stripe_size;
            let end = (start + stripe_size).min(data.len());
            match self
                .chunk_manager
                .write_file_stripe(&mut file, old_stripes + s, &data[start..end], &spare, false)
                .await
            {
                Ok(outcome) => bg_pending |= outcome.bg_pending,
                Err(err) => {
                    // drop the stripes of this append that already committed
                    if s > 0 {
                        let mut touched = vec![false; file.num_chunks()];
                        for slot in touched
                            .iter_mut()
                            .skip(old_stripes * chunks_per_stripe)
                            .take(s * chunks_per_stripe)
                        {
                            *slot = true;
                        }
                        let _ = self.chunk_manager.delete_file(&file, &touched).await;
                        self.clear_write_journal(&file);
                        return Err(ProxyError::Partial(Box::new(err)));
                    }
                    return Err(err);
                }
            }
        }

        file.md5 = digest_of(&[&old_content[..], data])?;
        let now = epoch_now();
        file.mtime = now;
        file.atime = now;
        if bg_pending {
            file.status = FileStatus::BgTaskPending;
        }
        self.metastore.put_meta(&file)?;
        if bg_pending {
            self.metastore.mark_file_for_task_check(key)?;
        } else {
            self.clear_write_journal(&file);
        }
        if self.config.misc.overwrite_files {
            self.metastore.delete_meta_version(key, old.version)?;
        }

        info!(
            "append {key}: size {} -> {} (version {})",
            old.size, file.size, file.version
        );
        Ok(file.size)
    }

    /// Overwrite the stripes covering a byte range, widening unaligned
    /// ranges by reading and patching the surrounding stripes first.
    async fn overwrite_stripes(
        &self,
        key: &FileKey,
        old: FileMeta,
        offset: u64,
        data: &[u8],
    ) -> Result<u64> {
        let stripe_size = self.chunk_manager.max_data_size_per_stripe(&old.coding)?;
        let chunks_per_stripe = old.chunks_per_stripe();
        let length = data.len() as u64;

        // widen to stripe boundaries
        let astart = offset / stripe_size * stripe_size;
        let aend = ((offset + length + stripe_size - 1) / stripe_size * stripe_size).min(old.size);
        let mut patched;
        if astart == offset && (offset + length == aend || offset + length == old.size) {
            patched = data.to_vec();
        } else {
            debug!(
                "overwrite {key}: widening [{offset}, {}) to [{astart}, {aend})",
                offset + length
            );
            patched = self.read_backend_range(&old, astart, aend - astart).await?;
            let at = (offset - astart) as usize;
            patched[at..at + data.len()].copy_from_slice(data);
        }

        let start_stripe = (astart / stripe_size) as usize;
        let end_stripe = (((astart + patched.len() as u64) + stripe_size - 1) / stripe_size) as usize;

        // untouched content around the widened range, read before the
        // rewrite replaces the stripes in place
        let prefix = if astart > 0 {
            self.read_backend_range(&old, 0, astart).await?
        } else {
            Vec::new()
        };
        let suffix_start = astart + patched.len() as u64;
        let suffix = if suffix_start < old.size {
            self.read_backend_range(&old, suffix_start, old.size - suffix_start)
                .await?
        } else {
            Vec::new()
        };

        // versioned mode writes fresh chunk names and can roll back by
        // deletion; overwrite mode reuses the names so agents keep the
        // previous version for revert
        let versioned = !self.config.misc.overwrite_files;

        let mut file = old.clone();
        file.version = old.version + 1;
        file.status = FileStatus::None;
        if versioned {
            file.regen_uuid();
        }
        for stripe_id in start_stripe..end_stripe {
            for position in file.stripe_range(stripe_id) {
                file.chunks[position].fuuid = file.uuid;
                file.chunks[position].file_version = file.version;
            }
        }

        let mut bg_pending = false;
        let mut committed_stripes = Vec::new();
        for stripe_id in start_stripe..end_stripe {
            let start = (stripe_id - start_stripe) * stripe_size as usize;
            let end = (start + stripe_size as usize).min(patched.len());
            // overwritten stripes land on their existing containers
            let spare: Vec<i32> =
                old.container_ids[stripe_id * chunks_per_stripe..(stripe_id + 1) * chunks_per_stripe].to_vec();
            let result = self
                .chunk_manager
                .write_file_stripe(
                    &mut file,
                    stripe_id,
                    &patched[start..end],
                    &spare,
                    !versioned,
                )
                .await;
            match result {
                Ok(outcome) => {
                    bg_pending |= outcome.bg_pending;
                    committed_stripes.push(stripe_id);
                }
                Err(err) => {
                    warn!("overwrite {key}: stripe {stripe_id} failed, rolling back - {err}");
                    let mut touched = vec![false; file.num_chunks()];
                    for &s in &committed_stripes {
                        for slot in touched.iter_mut().skip(s * chunks_per_stripe).take(chunks_per_stripe) {
                            *slot = true;
                        }
                    }
                    if versioned {
                        let _ = self.chunk_manager.delete_file(&file, &touched).await;
                    } else {
                        let _ = self.chunk_manager.revert_file(&file, &touched).await;
                    }
                    self.clear_write_journal(&file);
                    if committed_stripes.is_empty() {
                        return Err(err);
                    }
                    return Err(ProxyError::Partial(Box::new(err)));
                }
            }
        }

        file.md5 = digest_of(&[&prefix[..], &patched[..], &suffix[..]])?;
        let now = epoch_now();
        file.mtime = now;
        file.atime = now;
        if bg_pending {
            file.status = FileStatus::BgTaskPending;
        }
        self.metastore.put_meta(&file)?;
        if bg_pending {
            self.metastore.mark_file_for_task_check(key)?;
        } else {
            self.clear_write_journal(&file);
        }
        if self.config.misc.overwrite_files {
            self.metastore.delete_meta_version(key, old.version)?;
        }

        info!(
            "overwrite {key}: [{offset}, {}) rewritten (version {})",
            offset + length,
            file.version
        );
        Ok(offset + length)
    }

}

/// Full-content digest over a sequence of byte ranges.
fn digest_of(parts: &[&[u8]]) -> Result<[u8; 16]> {
    let mut digest = Md5Digest::new()
        .map_err(|err| ProxyError::Internal(format!("md5 init failed - {err}")))?;
    for part in parts {
        digest
            .update(part)
            .map_err(|err| ProxyError::Internal(format!("md5 update failed - {err}")))?;
    }
    digest
        .finish()
        .map_err(|err| ProxyError::Internal(format!("md5 finish failed - {err}")))
}
