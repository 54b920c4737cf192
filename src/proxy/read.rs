//! Whole-file and ranged reads.

use log::{debug, info};

use ecs_api_types::{FileKey, FileMeta};

use crate::error::{ProxyError, Result};

use super::Proxy;

impl Proxy {
    /// Read a whole file. Reads take no lock and see committed metadata
    /// only; missing chunks are tolerated up to `n - k` per stripe.
    pub async fn read_file(&self, namespace_id: u8, name: &str) -> Result<(FileMeta, Vec<u8>)> {
        let key = FileKey::new(namespace_id, name);
        let meta = self.get_meta(&key)?.ok_or(ProxyError::NotFound)?;

        // serve from staging when the staged copy is current
        if let (Some(staging), Some(staged)) = (self.staging(), &meta.staged) {
            if staged.mtime >= meta.mtime && staging.exists(&key) {
                let data = staging
                    .read_file(&key)
                    .map_err(|err| ProxyError::Internal(format!("staging read failed - {err}")))?;
                debug!("read {key}: served {} bytes from staging", data.len());
                return Ok((meta, data));
            }
        }

        let started = std::time::Instant::now();
        let data = self.read_backend_range(&meta, 0, meta.size).await?;
        info!(
            "read {key}: {} bytes in {:.3}s",
            data.len(),
            started.elapsed().as_secs_f64()
        );
        Ok((meta, data))
    }

    /// Read `[offset, offset + length)` of a file.
    pub async fn read_file_range(
        &self,
        namespace_id: u8,
        name: &str,
        offset: u64,
        length: u64,
    ) -> Result<(FileMeta, Vec<u8>)> {
        let key = FileKey::new(namespace_id, name);
        let meta = self.get_meta(&key)?.ok_or(ProxyError::NotFound)?;
        if offset + length > meta.size {
            return Err(ProxyError::InvalidArguments(format!(
                "range [{offset}, {}) exceeds file size {}",
                offset + length,
                meta.size
            )));
        }

        if let (Some(staging), Some(staged)) = (self.staging(), &meta.staged) {
            if staged.mtime >= meta.mtime && staging.exists(&key) {
                let data = staging
                    .read_file_range(&key, offset, length)
                    .map_err(|err| ProxyError::Internal(format!("staging read failed - {err}")))?;
                return Ok((meta, data));
            }
        }

        let data = self.read_backend_range(&meta, offset, length).await?;
        info!("read {key}: {} bytes at offset {offset}", data.len());
        Ok((meta, data))
    }

    /// Read a byte range through the stripe pipeline, decoding only the
    /// stripes the range touches.
    pub(crate) async fn read_backend_range(
        &self,
        meta: &FileMeta,
        offset: u64,
        length: u64,
    ) -> Result<Vec<u8>> {
        if length == 0 {
            return Ok(Vec::new());
        }
        let stripe_size = self.chunk_manager.max_data_size_per_stripe(&meta.coding)?;
        let chunks_per_stripe = meta.chunks_per_stripe();
        let start_stripe = (offset / stripe_size) as usize;
        let end_stripe = (((offset + length) + stripe_size - 1) / stripe_size) as usize;

        let (status, num_failed) = self
            .coordinator
            .check_container_liveness(&meta.container_ids, true, false)
            .await;
        if num_failed > 0 {
            debug!(
                "read {}: {num_failed} containers down, degraded read",
                meta.key()
            );
        }

        let mut data = Vec::with_capacity(length as usize);
        for stripe_id in start_stripe..end_stripe {
            let stripe_status = &status[stripe_id * chunks_per_stripe..(stripe_id + 1) * chunks_per_stripe];
            let stripe_data = self
                .chunk_manager
                .read_file_stripe(meta, stripe_id, stripe_status)
                .await?;
            data.extend_from_slice(&stripe_data);
        }

        // trim the surrounding stripe bytes off the requested range
        let skip = (offset - start_stripe as u64 * stripe_size) as usize;
        let mut data = data.split_off(skip.min(data.len()));
        data.truncate(length as usize);
        Ok(data)
    }
}
