//! Stripe write pipeline.

use bytes::Bytes;
use log::{debug, info, warn};

use ecs_api_types::{FileMeta, FileStatus, JournalOp, INVALID_CONTAINER_ID};
use ecs_client::{AgentMessage, ChunkPayload, Opcode};

use crate::error::{ProxyError, Result};
use crate::tools::digest::md5sum;

use super::{stripe_chunk_meta, BgChunkTask, BgWriteEntry, ChunkManager};

/// Outcome of one stripe write.
#[derive(Debug)]
pub struct StripeWriteOutcome {
    /// Whether part of the redundancy is still being written and the file
    /// must be flagged [`FileStatus::BgTaskPending`].
    pub bg_pending: bool,
}

impl ChunkManager {
    /// Encode and store one stripe of a file.
    ///
    /// On success the file's chunk metadata and container ids of the stripe
    /// positions are filled in. When fewer than `k` chunks can be stored the
    /// already-written chunks of this stripe are rolled back (reverted for
    /// an overwrite, deleted otherwise) and the write fails.
    pub async fn write_file_stripe(
        &self,
        file: &mut FileMeta,
        stripe_id: usize,
        data: &[u8],
        spare_containers: &[i32],
        is_overwrite: bool,
    ) -> Result<StripeWriteOutcome> {
        let engine = self.engine(&file.coding)?;
        let num_chunks = engine.num_chunks();
        let num_data = engine.num_data_chunks();
        let base = stripe_id * num_chunks;
        let key = file.key();

        if spare_containers.len() < num_data {
            return Err(ProxyError::InsufficientCapacity {
                needed: num_data,
                selected: spare_containers.len(),
            });
        }

        // encode the stripe
        let stripe = engine.encode(data)?;
        let chunk_size = stripe[0].len() as u32;

        // chunk metadata, checksums and pre-write journal records
        let mut chunks = Vec::with_capacity(num_chunks);
        for (i, chunk_data) in stripe.iter().enumerate() {
            let meta = stripe_chunk_meta(file, base + i, chunk_size, md5sum(chunk_data));
            if let Some(&container_id) = spare_containers.get(i) {
                self.journal_pre_write(&key, &meta, container_id);
            }
            chunks.push(meta);
        }

        let opts = self.opts();
        let num_reqs = spare_containers.len().min(num_chunks);
        let num_fg = if opts.ack_redundancy_in_background {
            num_data.min(num_reqs)
        } else {
            num_reqs
        };

        debug!(
            "write {key} stripe {stripe_id}: issue {num_reqs} chunk requests ({num_fg} foreground)"
        );

        // dispatch; with background writes enabled the redundancy requests
        // start only when needed (promotion) or when queued to background
        let mut handles: Vec<Option<_>> = Vec::with_capacity(num_reqs);
        let mut deferred: Vec<Option<(i32, AgentMessage)>> = vec![None; num_reqs];
        for i in 0..num_reqs {
            let mut request = AgentMessage::new(Opcode::PutChunkReq);
            request.chunks.push(ChunkPayload::with_data(
                chunks[i].clone(),
                Bytes::copy_from_slice(&stripe[i]),
            ));
            request.container_ids.push(spare_containers[i]);
            if i < num_fg || !opts.write_redundancy_in_background {
                handles.push(Some(self.spawn_chunk_request(spare_containers[i], request)));
            } else {
                deferred[i] = Some((spare_containers[i], request));
                handles.push(None);
            }
        }

        // collect the foreground replies
        let mut num_success = 0;
        let mut committed = vec![false; num_chunks];
        let mut container_ids = vec![INVALID_CONTAINER_ID; num_chunks];
        let mut pending: Vec<BgWriteEntry> = Vec::new();

        for i in 0..num_reqs {
            let container_id = spare_containers[i];
            let needs_result = i < num_fg || num_success < num_data;
            if !needs_result {
                // leave the request to the background worker
                let handle = match handles[i].take() {
                    Some(handle) => handle,
                    None => {
                        let (cid, request) = deferred[i].take().unwrap();
                        self.spawn_chunk_request(cid, request)
                    }
                };
                pending.push(BgWriteEntry {
                    position: base + i,
                    container_id,
                    chunk: chunks[i].clone(),
                    handle,
                });
                committed[i] = true;
                container_ids[i] = container_id;
                continue;
            }

            // a foreground slot, or a promoted background one
            let handle = match handles[i].take() {
                Some(handle) => handle,
                None => {
                    let (cid, request) = deferred[i].take().unwrap();
                    debug!("write {key} stripe {stripe_id}: promote request {i} to foreground");
                    self.spawn_chunk_request(cid, request)
                }
            };
            match super::join_chunk_request(handle).await {
                Ok(reply) if reply.is_success_for(Opcode::PutChunkReq) => {
                    let checksum_ok = !opts.verify_chunk_checksum
                        || reply
                            .chunks
                            .first()
                            .map(|c| c.meta.md5 == chunks[i].md5)
                            .unwrap_or(false);
                    if checksum_ok {
                        committed[i] = true;
                        container_ids[i] = container_id;
                        num_success += 1;
                        self.journal_promote(&key, chunks[i].chunk_id, container_id, JournalOp::Write);
                    } else {
                        warn!(
                            "write {key} stripe {stripe_id}: checksum mismatch on chunk {} at container id = {container_id}",
                            chunks[i].chunk_id
                        );
                        // the agent stored something, roll it back with the rest
                        committed[i] = true;
                    }
                }
                Ok(reply) => {
                    warn!(
                        "write {key} stripe {stripe_id}: chunk {} failed at container id = {container_id}, rep = {:?}",
                        chunks[i].chunk_id, reply.opcode
                    );
                }
                Err(err) => {
                    warn!(
                        "write {key} stripe {stripe_id}: chunk {} failed at container id = {container_id} - {err}",
                        chunks[i].chunk_id
                    );
                }
            }
        }

        if num_success < num_data {
            warn!(
                "write {key} stripe {stripe_id}: only {num_success} of {num_data} chunks stored, rolling back"
            );
            // also wait out anything we optimistically queued to background
            for entry in pending {
                let _ = super::join_chunk_request(entry.handle).await;
            }
            let mut rollback = file.clone();
            rollback.num_stripes = 1;
            rollback.chunks = chunks.clone();
            rollback.container_ids = (0..num_chunks)
                .map(|i| {
                    if committed[i] {
                        spare_containers[i]
                    } else {
                        INVALID_CONTAINER_ID
                    }
                })
                .collect();
            rollback.corrupted = vec![false; num_chunks];
            if is_overwrite {
                let _ = self.revert_file(&rollback, &committed).await;
            } else {
                let _ = self.delete_file(&rollback, &committed).await;
            }
            for (i, chunk) in chunks.iter().enumerate() {
                if i < num_reqs {
                    self.journal_remove(&key, chunk.chunk_id, spare_containers[i], JournalOp::Write);
                }
            }
            return Err(ProxyError::StripeUnderReplicated {
                stored: num_success,
                required: num_data,
            });
        }

        // commit the stripe into the file record
        for i in 0..num_chunks {
            file.chunks[base + i] = chunks[i].clone();
            file.container_ids[base + i] = container_ids[i];
            file.corrupted[base + i] = false;
        }

        let bg_pending = !pending.is_empty();
        if bg_pending {
            info!(
                "write {key} stripe {stripe_id}: {} redundancy requests continue in background",
                pending.len()
            );
            let task = BgChunkTask {
                key: key.clone(),
                version: file.version,
                task_name: format!("bg-write {key} stripe {stripe_id}"),
                entries: pending,
            };
            if !self.send_bg_task(task) {
                // no worker; the deferred-commit checker will reconcile
                warn!("write {key} stripe {stripe_id}: background handoff failed");
            }
            file.status = FileStatus::BgTaskPending;
        }

        Ok(StripeWriteOutcome { bg_pending })
    }
}
