//! Delete, rename and server-side copy.

use log::{info, warn};

use ecs_api_types::{FileKey, LATEST_VERSION};

use crate::error::{ProxyError, Result};
use crate::tools::epoch_now;

use super::Proxy;

impl Proxy {
    /// Delete a file: all versions of its metadata, its chunks on every
    /// alive container, and any staged copy. Chunks on unreachable
    /// containers are left as orphans for the journal reconciler.
    pub async fn delete_file(&self, namespace_id: u8, name: &str) -> Result<()> {
        let key = FileKey::new(namespace_id, name);
        let _lock = self.lock_file(&key).await?;

        let newest = self.get_meta(&key)?.ok_or(ProxyError::NotFound)?;

        // every version owns chunks of its own
        for version in (0..=newest.version).rev() {
            if let Some(meta) = self.metastore.get_meta(&key, version)? {
                self.delete_version_data(&meta).await?;
            }
        }
        self.metastore.delete_meta(&key)?;
        self.metastore.remove_file_from_repair(&key)?;

        if let Some(staging) = self.staging() {
            let _ = staging.delete_file(&key);
            self.metastore.remove_file_from_writeback(&key)?;
        }

        info!("delete {key}: removed");
        Ok(())
    }

    /// Rename a file. Only the metadata key changes; chunks and their ids
    /// stay untouched, and the whole version history follows the name.
    pub async fn rename_file(&self, namespace_id: u8, old_name: &str, new_name: &str) -> Result<()> {
        let from = FileKey::new(namespace_id, old_name);
        let to = FileKey::new(namespace_id, new_name);
        if old_name == new_name {
            return Err(ProxyError::InvalidArguments("rename onto itself".into()));
        }

        let _from_lock = self.lock_file(&from).await?;
        let _to_lock = self.lock_file(&to).await?;

        if self.get_meta(&from)?.is_none() {
            return Err(ProxyError::NotFound);
        }
        if self.get_meta(&to)?.is_some() {
            return Err(ProxyError::MetadataConflict(format!("file {to} already exists")));
        }
        if !self
            .metastore
            .rename_meta(&from, &to)
            .map_err(|err| ProxyError::MetadataConflict(err.to_string()))?
        {
            return Err(ProxyError::NotFound);
        }

        if let Some(staging) = self.staging() {
            if staging.exists(&from) {
                if let Err(err) = staging.rename_file(&from, &to) {
                    warn!("rename {from}: staged copy not moved - {err}");
                }
            }
        }

        info!("rename {from} -> {to}");
        Ok(())
    }

    /// Server-side copy. The agents duplicate each chunk in place under
    /// the destination's chunk names; no data moves through the proxy.
    /// Copies the whole file and preserves content, digest and policy.
    pub async fn copy_file(
        &self,
        namespace_id: u8,
        src_name: &str,
        dst_name: &str,
    ) -> Result<u64> {
        let src_key = FileKey::new(namespace_id, src_name);
        let dst_key = FileKey::new(namespace_id, dst_name);
        if src_name == dst_name {
            return Err(ProxyError::InvalidArguments("copy onto itself".into()));
        }

        let _src_lock = self.lock_file(&src_key).await?;
        let _dst_lock = self.lock_file(&dst_key).await?;

        let src = self.get_meta(&src_key)?.ok_or(ProxyError::NotFound)?;
        let existing_dst = self.metastore.get_meta(&dst_key, LATEST_VERSION)?;

        let mut dst = src.clone();
        dst.name = dst_key.name.clone();
        dst.version = existing_dst.as_ref().map(|m| m.version + 1).unwrap_or(0);
        dst.regen_uuid();
        for (i, chunk) in dst.chunks.iter_mut().enumerate() {
            chunk.fuuid = dst.uuid;
            chunk.file_version = dst.version;
            dst.container_ids[i] = ecs_api_types::INVALID_CONTAINER_ID;
        }
        let now = epoch_now();
        dst.set_timestamps(now, now, now);

        self.chunk_manager
            .copy_file(&src, &mut dst, 0, src.size)
            .await?;

        self.metastore.put_meta(&dst)?;
        if let Some(old_dst) = existing_dst {
            if self.config.misc.overwrite_files {
                self.delete_version_data(&old_dst).await?;
            }
        }

        info!("copy {src_key} -> {dst_key}: {} bytes", src.size);
        Ok(src.size)
    }
}
