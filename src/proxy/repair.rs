//! File repair entry point, shared by the client operation and the
//! background repair worker.

use log::{debug, info, warn};

use ecs_api_types::{FileKey, INVALID_CONTAINER_ID};

use crate::error::{ProxyError, Result};

use super::Proxy;

impl Proxy {
    /// Restore the redundancy of a file.
    ///
    /// Takes the same advisory lock as any writer, so repair never races a
    /// mutation. Repairing a file with no missing chunks is a no-op that
    /// still reports success. On success the file keeps its version but
    /// gets a fresh uuid; the repaired chunk placements replace the failed
    /// ones.
    pub async fn repair_file(&self, key: &FileKey, is_bg: bool) -> Result<()> {
        let _ticket = self.track_repair();
        let _lock = self.lock_file(key).await?;

        let mut file = match self.get_meta(key)? {
            Some(meta) => meta,
            None => {
                // deleted while queued; nothing left to repair
                self.metastore.remove_file_from_repair(key)?;
                return if is_bg { Ok(()) } else { Err(ProxyError::NotFound) };
            }
        };

        let (mut status, num_failed) = self
            .coordinator
            .check_container_liveness(&file.container_ids, true, false)
            .await;
        // positions flagged corrupt by the checksum scanner count as failed
        for (i, corrupt) in file.corrupted.iter().enumerate() {
            if *corrupt || file.container_ids[i] == INVALID_CONTAINER_ID {
                status[i] = false;
            }
        }
        if status.iter().all(|alive| *alive) {
            debug!("repair {key}: no failed chunks (liveness reported {num_failed})");
            self.metastore.remove_file_from_repair(key)?;
            return Ok(());
        }

        let chunks_per_stripe = file.chunks_per_stripe();
        if chunks_per_stripe == 0 {
            self.metastore.remove_file_from_repair(key)?;
            return Ok(());
        }

        // a new uuid marks the repaired generation; surviving chunks keep
        // their stored names through their own metadata
        file.regen_uuid();

        for stripe_id in 0..file.num_stripes as usize {
            let range = file.stripe_range(stripe_id);
            let stripe_status = status[range.clone()].to_vec();
            let num_failed = stripe_status.iter().filter(|alive| !**alive).count();
            if num_failed == 0 {
                continue;
            }

            let stripe_containers = file.container_ids[range].to_vec();
            let spare = self
                .coordinator
                .find_spare_containers(
                    &stripe_containers,
                    &stripe_status,
                    num_failed,
                    file.size,
                    &file.coding,
                )
                .await;
            if spare.len() < num_failed {
                warn!(
                    "repair {key} stripe {stripe_id}: only {} of {num_failed} spare containers available",
                    spare.len()
                );
                return Err(ProxyError::InsufficientCapacity {
                    needed: num_failed,
                    selected: spare.len(),
                });
            }
            let groups = self
                .coordinator
                .find_chunk_groups(&stripe_containers, &stripe_status);

            self.chunk_manager
                .repair_file_stripe(&mut file, stripe_id, &stripe_status, &spare, &groups)
                .await?;
        }

        self.metastore.update_chunks(&file)?;
        self.clear_write_journal(&file);
        self.metastore.remove_file_from_repair(key)?;
        info!("repair {key}: redundancy restored (version {} unchanged)", file.version);
        Ok(())
    }
}
