//! Background chunk commitment.
//!
//! The write pipeline hands over the redundancy requests it did not wait
//! for; this worker joins them, verifies the replies and patches the file
//! metadata for anything that failed, so a stripe never silently loses
//! redundancy.

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use log::{debug, info, warn};

use ecs_api_types::{FileStatus, JournalOp, INVALID_CONTAINER_ID};
use ecs_client::Opcode;

use crate::chunk_manager::{BgChunkTask, BgWriteEntry};
use crate::proxy::Proxy;
use crate::tools::RunningFlag;

use super::BgTaskProgress;

/// A write entry whose background task has been joined; only the fields
/// still needed for metadata patching survive past that point.
struct CommittedEntry {
    position: usize,
    container_id: i32,
    chunk: ecs_api_types::ChunkMeta,
}

pub(super) fn spawn(
    proxy: Arc<Proxy>,
    handle: tokio::runtime::Handle,
    bg_tasks: Receiver<BgChunkTask>,
    progress: Arc<BgTaskProgress>,
    running: RunningFlag,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("bg-chunk-writer".to_string())
        .spawn(move || {
            info!("bg-chunk-writer worker started");
            while running.is_running() {
                let task = match bg_tasks.recv_timeout(std::time::Duration::from_millis(500)) {
                    Ok(task) => task,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                };
                process_task(&proxy, &handle, &progress, task);
            }
            info!("bg-chunk-writer worker stopped");
        })
        .expect("unable to spawn worker thread")
}

pub(super) fn process_task(
    proxy: &Proxy,
    handle: &tokio::runtime::Handle,
    progress: &BgTaskProgress,
    task: BgChunkTask,
) {
    let BgChunkTask {
        key,
        version,
        task_name,
        entries,
    } = task;
    progress.begin(&task_name, entries.len());

    let verify = proxy.config().data_integrity.verify_chunk_checksum;
    let mut failed_positions = Vec::new();
    let mut confirmed = Vec::new();

    for entry in entries {
        let BgWriteEntry {
            position,
            container_id,
            chunk,
            handle: task_handle,
        } = entry;
        let result = handle.block_on(task_handle);
        let ok = match result {
            Ok(Ok(reply)) if reply.is_success_for(Opcode::PutChunkReq) => {
                !verify
                    || reply
                        .chunks
                        .first()
                        .map(|c| c.meta.md5 == chunk.md5)
                        .unwrap_or(false)
            }
            Ok(Ok(reply)) => {
                debug!(
                    "bg write of {key} chunk {} answered {:?}",
                    chunk.chunk_id, reply.opcode
                );
                false
            }
            Ok(Err(err)) => {
                debug!("bg write of {key} chunk {} failed - {err}", chunk.chunk_id);
                false
            }
            Err(err) => {
                debug!("bg write task of {key} chunk {} died - {err}", chunk.chunk_id);
                false
            }
        };
        let entry = CommittedEntry {
            position,
            container_id,
            chunk,
        };
        if ok {
            confirmed.push(entry);
        } else {
            warn!(
                "bg write of {key} chunk {} to container id = {} failed",
                entry.chunk.chunk_id, entry.container_id
            );
            failed_positions.push(entry);
        }
        progress.advance(&task_name);
    }

    // patch the metadata: failed positions lose their container, confirmed
    // ones drop their journal record
    let metastore = proxy.metastore();
    match metastore.get_meta(&key, version) {
        Ok(Some(mut meta)) => {
            let mut changed = false;
            for entry in &failed_positions {
                if meta
                    .chunks
                    .get(entry.position)
                    .map(|c| c.matches(&entry.chunk))
                    .unwrap_or(false)
                {
                    meta.container_ids[entry.position] = INVALID_CONTAINER_ID;
                    changed = true;
                }
            }
            if changed {
                if let Err(err) = metastore.update_chunks(&meta) {
                    warn!("bg write of {key}: unable to mark failed chunks - {err}");
                }
                let _ = metastore.mark_file_for_repair(&key);
            }
            if failed_positions.is_empty() {
                let _ = metastore.update_file_status(&key, version, FileStatus::AllBgTasksCompleted);
            } else {
                let _ =
                    metastore.update_file_status(&key, version, FileStatus::PartBgTaskCompleted);
            }
        }
        Ok(None) => {
            // metadata not committed (yet); the deferred-commit checker
            // reconciles once it is
            debug!("bg write of {key}: no metadata record for version {version}");
        }
        Err(err) => warn!("bg write of {key}: metadata lookup failed - {err}"),
    }

    for entry in confirmed {
        if let Err(err) = metastore.remove_journal_record(
            &key,
            entry.chunk.chunk_id,
            entry.container_id,
            JournalOp::Write,
        ) {
            warn!("bg write of {key}: journal cleanup failed - {err}");
        }
    }

    progress.finish(&task_name);
}
