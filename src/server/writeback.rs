//! Staging writeback: pushes staged files to the backend according to the
//! configured policy.

use std::sync::Arc;

use log::{debug, info, warn};

use ecs_api_types::{FileKey, HostType, LATEST_VERSION};

use crate::proxy::Proxy;
use crate::tools::{epoch_now, sysinfo};

pub(super) fn tick_fn(
    proxy: Arc<Proxy>,
    handle: tokio::runtime::Handle,
) -> impl FnMut() + Send + 'static {
    move || {
        let config = proxy.config();
        let policy = config.staging.bgwrite_policy.as_str();
        let scan_interval = config.staging.bgwrite_scan_interval;

        let due = match policy {
            "immediate" => true,
            "scheduled" => {
                scheduled_window_open(&config.staging.bgwrite_scheduled_time, scan_interval)
            }
            // write back only while the host is mostly idle
            "idle" => sysinfo::collect(HostType::OnPrem).avg_cpu_usage() < 50.0,
            _ => false,
        };
        if !due {
            return;
        }

        let pending = match proxy.metastore().files_for_writeback() {
            Ok(pending) => pending,
            Err(err) => {
                warn!("writeback: unable to read the pending list - {err}");
                return;
            }
        };

        for key in pending {
            if let Err(err) = write_back_file(&proxy, &handle, &key, scan_interval) {
                warn!("writeback of {key} failed - {err}");
            }
        }
    }
}

/// Whether the current (UTC) time of day falls into the scheduled window.
fn scheduled_window_open(scheduled: &str, scan_interval: u64) -> bool {
    let Some((hh, mm)) = scheduled.split_once(':') else {
        return false;
    };
    let (Ok(hh), Ok(mm)) = (hh.parse::<u64>(), mm.parse::<u64>()) else {
        return false;
    };
    let start = (hh * 60 + mm) * 60;
    let now = epoch_now() as u64 % 86400;
    now >= start && now < start + scan_interval.max(60)
}

fn write_back_file(
    proxy: &Proxy,
    handle: &tokio::runtime::Handle,
    key: &FileKey,
    scan_interval: u64,
) -> crate::error::Result<()> {
    let Some(staging) = proxy.staging() else {
        return Ok(());
    };

    handle.block_on(async {
        let _lock = proxy.lock_file(key).await?;
        let Some(meta) = proxy.metastore().get_meta(key, LATEST_VERSION)? else {
            // deleted while queued
            proxy.metastore().remove_file_from_writeback(key)?;
            return Ok(());
        };
        let Some(staged) = meta.staged.clone() else {
            proxy.metastore().remove_file_from_writeback(key)?;
            return Ok(());
        };

        // leave entries alone while a client is still writing to them
        if staged.mtime + 2 * scan_interval as i64 > epoch_now() {
            debug!("writeback: {key} modified recently, skipping");
            return Ok(());
        }

        let data = staging
            .read_file(key)
            .map_err(|err| crate::error::ProxyError::Internal(format!("staging read failed - {err}")))?;

        let (class_name, coding) = proxy.resolve_storage_class(&staged.storage_class)?;
        let file = proxy
            .write_data_as_version(key, meta.version + 1, class_name, coding, &data)
            .await?;

        // the staged version record (and any backend chunks it still
        // references) is superseded by the backend one
        if proxy.config().misc.overwrite_files && meta.version != file.version {
            proxy.delete_version_data(&meta).await?;
        }
        let _ = staging.unpin(key);
        proxy.metastore().remove_file_from_writeback(key)?;

        info!(
            "writeback: {key} stored to backend ({} bytes, version {})",
            data.len(),
            file.version
        );
        Ok(())
    })
}
