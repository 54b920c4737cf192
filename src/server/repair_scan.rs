//! Repair scanner: periodic file liveness scan and batched chunk-checksum
//! scan with sampling.

use std::sync::Arc;

use log::{debug, info, warn};
use rand::Rng;

use ecs_api_types::{ChunkScanSamplingPolicy, FileKey, INVALID_CONTAINER_ID};

use crate::proxy::Proxy;
use crate::tools::epoch_now;

pub(super) fn tick_fn(
    proxy: Arc<Proxy>,
    handle: tokio::runtime::Handle,
) -> impl FnMut() + Send + 'static {
    let chunk_scan_interval = proxy.config().recovery.scan_chunk_interval;
    let mut last_chunk_scan = epoch_now();
    move || {
        file_scan(&proxy, &handle);
        if chunk_scan_interval > 0 && last_chunk_scan + chunk_scan_interval as i64 <= epoch_now() {
            chunk_scan(&proxy, &handle);
            last_chunk_scan = epoch_now();
        }
    }
}

/// Enumerate all files and queue any with failed chunks that has not been
/// modified recently.
fn file_scan(proxy: &Proxy, handle: &tokio::runtime::Handle) {
    let grace = proxy.config().recovery.trigger_start_interval as i64;
    let files = match proxy.metastore().all_files() {
        Ok(files) => files,
        Err(err) => {
            warn!("repair scan: unable to list files - {err}");
            return;
        }
    };

    let mut queued = 0;
    for info in files {
        let key = FileKey::new(info.namespace_id, &info.name);
        let meta = match proxy.metastore().get_meta(&key, ecs_api_types::LATEST_VERSION) {
            Ok(Some(meta)) => meta,
            Ok(None) => continue,
            Err(err) => {
                warn!("repair scan: unable to load {key} - {err}");
                continue;
            }
        };
        if meta.num_chunks() == 0 {
            continue;
        }
        let (_, num_failed) = handle.block_on(proxy.coordinator().check_container_liveness(
            &meta.container_ids,
            true,
            false,
        ));
        let num_corrupt = meta.corrupted.iter().filter(|c| **c).count();
        if num_failed + num_corrupt == 0 {
            continue;
        }
        // leave freshly-modified files alone; a writer may still be at work
        if meta.mtime + grace > epoch_now() {
            debug!("repair scan: {key} modified recently, skipping");
            continue;
        }
        match proxy.metastore().mark_file_for_repair(&key) {
            Ok(true) => {
                queued += 1;
                info!("repair scan: queued {key} ({num_failed} chunks down, {num_corrupt} corrupt)");
            }
            Ok(false) => {}
            Err(err) => warn!("repair scan: unable to queue {key} - {err}"),
        }
    }
    if queued > 0 {
        info!("repair scan: {queued} files queued for repair");
    }
}

/// Verify stored chunk checksums in container batches, subject to the
/// sampling policy; corrupt chunks are marked failed and their file queued.
fn chunk_scan(proxy: &Proxy, handle: &tokio::runtime::Handle) {
    let config = proxy.config();
    let policy = config.recovery.chunk_scan_sampling_policy;
    let rate = config.recovery.chunk_scan_sampling_rate;
    let batch_size = config.recovery.scan_chunk_batch_size.max(1);

    let files = match proxy.metastore().all_files() {
        Ok(files) => files,
        Err(err) => {
            warn!("chunk scan: unable to list files - {err}");
            return;
        }
    };

    let mut rng = rand::thread_rng();
    let mut scanned = 0usize;
    for info in files {
        if scanned >= batch_size {
            break;
        }
        let key = FileKey::new(info.namespace_id, &info.name);
        let mut meta = match proxy.metastore().get_meta(&key, ecs_api_types::LATEST_VERSION) {
            Ok(Some(meta)) => meta,
            _ => continue,
        };
        if meta.num_chunks() == 0 {
            continue;
        }
        if policy == ChunkScanSamplingPolicy::FileLevel && !rng.gen_bool(rate.clamp(0.0, 1.0)) {
            continue;
        }

        let sampled = sample_positions(&meta, policy, rate, &mut rng);
        if sampled.is_empty() {
            continue;
        }
        scanned += sampled.len();

        // one batched verification per container, driven by the manager
        let corrupted = match handle.block_on(proxy.chunk_manager().verify_file_checksums(&meta)) {
            Ok(corrupted) => corrupted,
            Err(err) => {
                warn!("chunk scan: verification of {key} failed - {err}");
                continue;
            }
        };

        let mut found = false;
        for &position in &sampled {
            if corrupted.get(position).copied().unwrap_or(false) {
                meta.container_ids[position] = INVALID_CONTAINER_ID;
                meta.corrupted[position] = true;
                found = true;
            }
        }
        if found {
            warn!("chunk scan: {key} has corrupt chunks, queueing for repair");
            if let Err(err) = proxy.metastore().update_chunks(&meta) {
                warn!("chunk scan: unable to mark corrupt chunks of {key} - {err}");
                continue;
            }
            let _ = proxy.metastore().mark_file_for_repair(&key);
        }
    }
}

/// Chunk positions of a file selected by the sampling policy.
fn sample_positions(
    meta: &ecs_api_types::FileMeta,
    policy: ChunkScanSamplingPolicy,
    rate: f64,
    rng: &mut impl Rng,
) -> Vec<usize> {
    let rate = rate.clamp(0.0, 1.0);
    let num_chunks = meta.num_chunks();
    let chunks_per_stripe = meta.chunks_per_stripe().max(1);
    match policy {
        ChunkScanSamplingPolicy::None | ChunkScanSamplingPolicy::FileLevel => {
            // file-level sampling already decided on the whole file
            (0..num_chunks).collect()
        }
        ChunkScanSamplingPolicy::ChunkLevel => (0..num_chunks)
            .filter(|_| rng.gen_bool(rate))
            .collect(),
        ChunkScanSamplingPolicy::StripeLevel => {
            let mut out = Vec::new();
            for stripe in 0..(num_chunks / chunks_per_stripe) {
                if rng.gen_bool(rate) {
                    out.extend(stripe * chunks_per_stripe..(stripe + 1) * chunks_per_stripe);
                }
            }
            out
        }
        ChunkScanSamplingPolicy::ContainerLevel => {
            let mut containers: Vec<i32> = meta
                .container_ids
                .iter()
                .copied()
                .filter(|&id| id != INVALID_CONTAINER_ID)
                .collect();
            containers.sort();
            containers.dedup();
            let chosen: Vec<i32> = containers
                .into_iter()
                .filter(|_| rng.gen_bool(rate))
                .collect();
            (0..num_chunks)
                .filter(|&i| chosen.contains(&meta.container_ids[i]))
                .collect()
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use ecs_api_types::FileMeta;

    fn test_meta() -> FileMeta {
        let mut meta = FileMeta::new(0, "a");
        meta.regen_uuid();
        meta.init_chunks(8);
        meta.num_stripes = 2;
        for (i, id) in meta.container_ids.iter_mut().enumerate() {
            *id = (i % 4) as i32 + 1;
        }
        meta
    }

    #[test]
    fn sampling_none_scans_everything() {
        let meta = test_meta();
        let mut rng = rand::thread_rng();
        let all = sample_positions(&meta, ChunkScanSamplingPolicy::None, 0.0, &mut rng);
        assert_eq!(all.len(), 8);
    }

    #[test]
    fn sampling_rate_bounds() {
        let meta = test_meta();
        let mut rng = rand::thread_rng();
        for policy in [
            ChunkScanSamplingPolicy::ChunkLevel,
            ChunkScanSamplingPolicy::StripeLevel,
            ChunkScanSamplingPolicy::ContainerLevel,
        ] {
            assert!(sample_positions(&meta, policy, 0.0, &mut rng).is_empty());
            assert_eq!(sample_positions(&meta, policy, 1.0, &mut rng).len(), 8);
        }
    }

    #[test]
    fn stripe_sampling_keeps_whole_stripes() {
        let meta = test_meta();
        let mut rng = rand::thread_rng();
        for _ in 0..16 {
            let sampled =
                sample_positions(&meta, ChunkScanSamplingPolicy::StripeLevel, 0.5, &mut rng);
            assert!(sampled.len() % 4 == 0);
        }
    }
}
