//! Deferred-commit checker: reconciles files whose redundancy was written
//! in the background.

use std::sync::Arc;

use log::{debug, info, warn};

use ecs_api_types::{FileStatus, INVALID_CONTAINER_ID, LATEST_VERSION};

use crate::proxy::Proxy;

pub(super) fn tick_fn(
    proxy: Arc<Proxy>,
    handle: tokio::runtime::Handle,
) -> impl FnMut() + Send + 'static {
    move || {
        // drain the queue first so a busy file requeued below is not
        // popped again within the same tick
        let mut pending = Vec::new();
        loop {
            match proxy.metastore().next_file_for_task_check() {
                Ok(Some(key)) => pending.push(key),
                Ok(None) => break,
                Err(err) => {
                    warn!("task check: queue read failed - {err}");
                    break;
                }
            }
        }

        for key in pending {
            // skip (and requeue) files that a writer currently holds
            match proxy.metastore().lock_file(&key) {
                Ok(true) => {}
                Ok(false) => {
                    let _ = proxy.metastore().mark_file_for_task_check(&key);
                    continue;
                }
                Err(err) => {
                    warn!("task check: unable to lock {key} - {err}");
                    continue;
                }
            }

            let result = check_file(&proxy, &handle, &key);
            if let Err(err) = result {
                warn!("task check of {key} failed - {err}");
                let _ = proxy.metastore().mark_file_for_task_check(&key);
            }
            let _ = proxy.metastore().unlock_file(&key);
        }
    }
}

fn check_file(
    proxy: &Proxy,
    handle: &tokio::runtime::Handle,
    key: &ecs_api_types::FileKey,
) -> crate::error::Result<()> {
    let mut meta = match proxy.metastore().get_meta(key, LATEST_VERSION)? {
        Some(meta) => meta,
        None => return Ok(()),
    };
    if meta.status != FileStatus::BgTaskPending && meta.status != FileStatus::PartBgTaskCompleted {
        debug!("task check: {key} has no pending background task");
        return Ok(());
    }

    // chunks the agents cannot produce lose their container assignment
    let present = handle.block_on(proxy.chunk_manager().check_file(&meta))?;
    let mut lost = 0;
    for (i, present) in present.iter().enumerate() {
        if !present && meta.container_ids[i] != INVALID_CONTAINER_ID {
            meta.container_ids[i] = INVALID_CONTAINER_ID;
            lost += 1;
        }
    }
    if lost > 0 {
        info!("task check: {key} lost {lost} background chunks");
        proxy.metastore().update_chunks(&meta)?;
        let _ = proxy.metastore().mark_file_for_repair(key);
    }

    proxy
        .metastore()
        .update_file_status(key, meta.version, FileStatus::AllBgTasksCompleted)?;
    Ok(())
}
