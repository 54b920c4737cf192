//! Repair worker: drains the repair queue while enough containers are
//! alive to rebuild stripes.

use std::sync::Arc;

use log::{info, warn};

use crate::proxy::Proxy;

pub(super) fn tick_fn(
    proxy: Arc<Proxy>,
    handle: tokio::runtime::Handle,
) -> impl FnMut() + Send + 'static {
    move || {
        let batch_size = proxy.config().recovery.batch_size.max(1);

        // rebuilding needs at least k containers with room for new chunks
        let min_alive = proxy
            .classes()
            .resolve("")
            .map(|(_, coding)| coding.k as usize)
            .unwrap_or(1);
        let alive = proxy
            .coordinator()
            .num_alive_containers(true, min_alive as u64);
        if alive < min_alive {
            warn!("repair: only {alive} containers alive, need {min_alive}; waiting");
            return;
        }

        let batch = match proxy.metastore().files_for_repair(batch_size) {
            Ok(batch) => batch,
            Err(err) => {
                warn!("repair: unable to read the repair queue - {err}");
                return;
            }
        };
        if batch.is_empty() {
            return;
        }
        info!("repair: processing {} queued files", batch.len());

        for key in batch {
            match handle.block_on(proxy.repair_file(&key, true)) {
                Ok(()) => {}
                Err(err) => {
                    // stays queued for the next tick
                    warn!("repair of {key} failed - {err}");
                }
            }
        }
    }
}
