//! Journal reconciler.
//!
//! After a crash, journal records describe chunk writes and deletes whose
//! outcome never made it into the metadata. Each record on an alive
//! container resolves to exactly one of: already committed, commit now
//! (the chunk exists and verifies), orphan cleanup (delete the chunk), or
//! a re-issued delete.

use std::sync::Arc;

use log::{debug, info, warn};

use ecs_api_types::{
    FileKey, FileMeta, JournalOp, JournalRecord, LATEST_VERSION,
};

use crate::proxy::Proxy;

pub(super) fn tick_fn(
    proxy: Arc<Proxy>,
    handle: tokio::runtime::Handle,
) -> impl FnMut() + Send + 'static {
    move || {
        let files = match proxy.metastore().files_with_journal() {
            Ok(files) => files,
            Err(err) => {
                warn!("journal check: unable to list journals - {err}");
                return;
            }
        };

        for key in files {
            // a held lock means the operation is still in flight
            match proxy.metastore().lock_file(&key) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(err) => {
                    warn!("journal check: unable to lock {key} - {err}");
                    continue;
                }
            }
            if let Err(err) = reconcile_file(&proxy, &handle, &key) {
                warn!("journal check of {key} failed - {err}");
            }
            let _ = proxy.metastore().unlock_file(&key);
        }
    }
}

fn reconcile_file(
    proxy: &Proxy,
    handle: &tokio::runtime::Handle,
    key: &FileKey,
) -> crate::error::Result<()> {
    let records = proxy.metastore().file_journal(key)?;
    if records.is_empty() {
        return Ok(());
    }
    let meta = proxy.metastore().get_meta(key, LATEST_VERSION)?;

    for record in records {
        // requests against offline containers wait for the next tick
        let (status, _) = handle.block_on(proxy.coordinator().check_container_liveness(
            &[record.container_id],
            true,
            false,
        ));
        if !status[0] {
            debug!(
                "journal check: container id = {} of {key} chunk {} is offline, skipping",
                record.container_id, record.chunk.chunk_id
            );
            continue;
        }

        let resolved = match record.op {
            JournalOp::Write => reconcile_write(proxy, handle, key, meta.as_ref(), &record)?,
            JournalOp::Delete => reconcile_delete(proxy, handle, key, meta.as_ref(), &record)?,
        };
        if resolved {
            proxy.metastore().remove_journal_record(
                key,
                record.chunk.chunk_id,
                record.container_id,
                record.op,
            )?;
        }
    }
    Ok(())
}

fn reconcile_write(
    proxy: &Proxy,
    handle: &tokio::runtime::Handle,
    key: &FileKey,
    meta: Option<&FileMeta>,
    record: &JournalRecord,
) -> crate::error::Result<bool> {
    let position = record.chunk.chunk_id as usize;

    // committed already: the metadata carries exactly this chunk
    if let Some(meta) = meta {
        let committed = meta
            .chunks
            .get(position)
            .map(|c| c.matches(&record.chunk))
            .unwrap_or(false)
            && meta.container_ids.get(position) == Some(&record.container_id);
        if committed {
            debug!("journal check: {key} chunk {position} already committed");
            return Ok(true);
        }
    }

    // the record belongs to the current version only; anything else is an
    // orphan of a failed or superseded operation
    let current = meta
        .map(|m| m.version == record.chunk.file_version && m.uuid == record.chunk.fuuid)
        .unwrap_or(false);

    let probe = single_chunk_file(key, record);
    if current {
        let corrupted = handle.block_on(proxy.chunk_manager().verify_file_checksums(&probe))?;
        if !corrupted[0] {
            // the chunk landed intact; commit it
            let mut meta = meta.unwrap().clone();
            if position < meta.chunks.len() {
                info!(
                    "journal check: committing {key} chunk {position} in container id = {}",
                    record.container_id
                );
                meta.chunks[position] = record.chunk.clone();
                meta.container_ids[position] = record.container_id;
                meta.corrupted[position] = false;
                proxy.metastore().update_chunks(&meta)?;
                return Ok(true);
            }
        }
    }

    // absent, corrupt or stale: make sure nothing is left behind
    info!(
        "journal check: deleting orphan chunk {} of {key} from container id = {}",
        record.chunk.chunk_name(),
        record.container_id
    );
    let failed = handle.block_on(proxy.chunk_manager().delete_file(&probe, &[true]))?;
    Ok(failed == 0)
}

fn reconcile_delete(
    proxy: &Proxy,
    handle: &tokio::runtime::Handle,
    key: &FileKey,
    meta: Option<&FileMeta>,
    record: &JournalRecord,
) -> crate::error::Result<bool> {
    let position = record.chunk.chunk_id as usize;

    // the chunk was re-committed after the delete was journaled; the
    // record is stale
    if let Some(meta) = meta {
        let recommitted = meta
            .chunks
            .get(position)
            .map(|c| c.matches(&record.chunk))
            .unwrap_or(false)
            && meta.container_ids.get(position) == Some(&record.container_id);
        if recommitted {
            return Ok(true);
        }
    }

    info!(
        "journal check: re-issuing delete of {key} chunk {} on container id = {}",
        record.chunk.chunk_id, record.container_id
    );
    let probe = single_chunk_file(key, record);
    let failed = handle.block_on(proxy.chunk_manager().delete_file(&probe, &[true]))?;
    Ok(failed == 0)
}

/// A one-chunk file record used to address a journaled chunk on its
/// container.
fn single_chunk_file(key: &FileKey, record: &JournalRecord) -> FileMeta {
    let mut file = FileMeta::new(key.namespace_id, key.name.clone());
    file.uuid = record.chunk.fuuid;
    file.version = record.chunk.file_version;
    file.num_stripes = 1;
    file.chunks = vec![record.chunk.clone()];
    file.container_ids = vec![record.container_id];
    file.corrupted = vec![false];
    file
}
