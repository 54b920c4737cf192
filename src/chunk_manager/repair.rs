//! Stripe repair pipeline.
//!
//! Multi-node failures and configured proxy-side repair gather surviving
//! chunks on the proxy, apply the repair matrix and redistribute. A single
//! failed node can instead be repaired by an agent (one `RPR_CHUNK`
//! request) or, with CAR enabled, from per-agent partial encodings that the
//! proxy only has to XOR.

use bytes::Bytes;
use log::{debug, info, warn};

use ecs_api_types::{FileMeta, JournalOp};
use ecs_client::{AgentMessage, ChunkPayload, Opcode, RepairContext};

use crate::error::{ProxyError, Result};
use crate::tools::digest::md5sum;

use super::{failed_ids, stripe_chunk_meta, ChunkManager};

impl ChunkManager {
    /// Repair the failed chunks of one stripe onto `spare_containers`.
    ///
    /// `status` is the per-position liveness of the stripe,
    /// `chunk_groups` the alive positions grouped by serving agent (from
    /// the coordinator). On success the file's chunk metadata and container
    /// ids of the repaired positions are updated in place.
    pub async fn repair_file_stripe(
        &self,
        file: &mut FileMeta,
        stripe_id: usize,
        status: &[bool],
        spare_containers: &[i32],
        chunk_groups: &[Vec<usize>],
    ) -> Result<()> {
        let engine = self.engine(&file.coding)?;
        let num_chunks = engine.num_chunks();
        let chunks_per_node = engine.chunks_per_node();
        let base = stripe_id * num_chunks;
        let key = file.key();

        let failed = failed_ids(status);
        if failed.is_empty() {
            return Ok(());
        }
        let failed_nodes = failed
            .iter()
            .filter(|id| *id % chunks_per_node == 0)
            .count();
        if spare_containers.len() < failed_nodes {
            return Err(ProxyError::InsufficientCapacity {
                needed: failed_nodes,
                selected: spare_containers.len(),
            });
        }

        let plan = engine.pre_decode(&failed, true)?;

        let opts = self.opts();
        let repair_at_proxy = opts.repair_at_proxy || failed_nodes > 1;
        let repair_using_car = opts.repair_using_car && failed_nodes == 1;

        debug!(
            "repair {key} stripe {stripe_id}: {failed_nodes} failed nodes, at proxy = {repair_at_proxy}, CAR = {repair_using_car}"
        );

        // metadata of the replacement chunks
        let chunk_size = self.stripe_chunk_size(file, stripe_id, status);
        let targets: Vec<(usize, ecs_api_types::ChunkMeta)> = failed
            .iter()
            .map(|&id| {
                (
                    id,
                    stripe_chunk_meta(file, base + id, chunk_size, [0u8; 16]),
                )
            })
            .collect();

        let repaired: Vec<(usize, ecs_api_types::ChunkMeta)> = if repair_at_proxy {
            let buffers = if repair_using_car {
                self.gather_car_partials(file, stripe_id, &plan, chunk_groups)
                    .await?
            } else {
                self.collect_stripe_inputs(file, stripe_id, &plan).await?
            };
            let input_refs: Vec<(usize, &[u8])> = buffers
                .iter()
                .map(|(id, data)| (*id, data.as_slice()))
                .collect();
            let decoded = engine.decode(&input_refs, &plan, true, &failed)?;

            // store the repaired chunks on the spare containers
            let size = decoded.len() / failed.len();
            let mut requests = Vec::with_capacity(failed.len());
            let mut metas = Vec::with_capacity(failed.len());
            for (i, (id, mut meta)) in targets.into_iter().enumerate() {
                let data = &decoded[i * size..(i + 1) * size];
                meta.size = size as u32;
                meta.md5 = md5sum(data);
                self.journal_pre_write(&key, &meta, spare_containers[i]);
                let mut request = AgentMessage::new(Opcode::PutChunkReq);
                request
                    .chunks
                    .push(ChunkPayload::with_data(meta.clone(), Bytes::copy_from_slice(data)));
                request.container_ids.push(spare_containers[i]);
                requests.push((spare_containers[i], request));
                metas.push((id, meta));
            }
            let replies = self.access_chunks(requests).await;
            for (i, reply) in replies.iter().enumerate() {
                let ok = matches!(reply, Ok(reply) if reply.is_success_for(Opcode::PutChunkReq));
                if !ok {
                    // leave the journal records dangling; the reconciler
                    // cleans up or commits whatever the agents stored
                    warn!(
                        "repair {key} stripe {stripe_id}: failed to store repaired chunk at container id = {}",
                        spare_containers[i]
                    );
                    return Err(ProxyError::AgentReported { op: "repair store" });
                }
                self.journal_promote(&key, metas[i].1.chunk_id, spare_containers[i], JournalOp::Write);
            }
            metas
        } else {
            self.repair_at_agent(file, stripe_id, &plan, &targets, spare_containers, chunk_groups)
                .await?
        };

        // commit the new placements into the file record
        for (i, (id, meta)) in repaired.into_iter().enumerate() {
            file.chunks[base + id] = meta;
            file.container_ids[base + id] = spare_containers[i];
            file.corrupted[base + id] = false;
        }
        info!("repair {key} stripe {stripe_id}: repaired {} chunks", failed.len());
        Ok(())
    }

    /// Chunk size of a stripe, taken from any surviving position.
    fn stripe_chunk_size(&self, file: &FileMeta, stripe_id: usize, status: &[bool]) -> u32 {
        let base = stripe_id * status.len();
        status
            .iter()
            .position(|alive| *alive)
            .map(|i| file.chunks[base + i].size)
            .unwrap_or(0)
    }

    /// CAR repair: ask each agent group for one partial encoding of its
    /// local chunks, combined with the repair-matrix coefficients.
    async fn gather_car_partials(
        &self,
        file: &FileMeta,
        stripe_id: usize,
        plan: &ecs_coding::DecodingPlan,
        chunk_groups: &[Vec<usize>],
    ) -> Result<Vec<(usize, Vec<u8>)>> {
        let num_chunks = self.num_chunks_per_stripe(&file.coding)?;
        let base = stripe_id * num_chunks;
        let selected = &plan.input_chunk_ids()[..plan.min_num_inputs()];
        let matrix = plan.repair_matrix();

        let mut requests = Vec::new();
        for group in chunk_groups {
            // the sub-group of this agent's chunks that are decode inputs
            let mut request = AgentMessage::new(Opcode::EncChunkReq);
            let mut coeffs = Vec::new();
            for &position in group {
                let Some(idx) = selected.iter().position(|&s| s == position) else {
                    continue;
                };
                request
                    .chunks
                    .push(ChunkPayload::meta_only(file.chunks[base + position].clone()));
                request.container_ids.push(file.container_ids[base + position]);
                coeffs.push(matrix[idx]);
            }
            if request.chunks.is_empty() {
                continue;
            }
            let container_id = request.container_ids[0];
            request.repair = Some(RepairContext {
                scheme: file.coding.scheme().to_u8(),
                repair_using_car: true,
                num_input_chunks: request.chunks.len() as u32,
                chunk_id_offset: base as u32,
                matrix: coeffs,
                ..Default::default()
            });
            requests.push((container_id, request));
        }

        let replies = self.access_chunks(requests).await;
        let mut partials = Vec::with_capacity(replies.len());
        for (i, reply) in replies.into_iter().enumerate() {
            match reply {
                Ok(reply) if reply.is_success_for(Opcode::EncChunkReq) => {
                    let data = reply
                        .chunks
                        .into_iter()
                        .next()
                        .and_then(|c| c.data)
                        .ok_or(ProxyError::AgentReported { op: "partial encode" })?;
                    partials.push((i, data.to_vec()));
                }
                Ok(_) | Err(_) => {
                    warn!(
                        "repair {} stripe {stripe_id}: partial encoding of group {i} failed",
                        file.key()
                    );
                    return Err(ProxyError::AgentReported { op: "partial encode" });
                }
            }
        }
        Ok(partials)
    }

    /// Agent-side repair: one request to the first spare container's agent,
    /// carrying the repair matrix, the input chunk list and every address
    /// needed to fetch from peers.
    async fn repair_at_agent(
        &self,
        file: &FileMeta,
        stripe_id: usize,
        plan: &ecs_coding::DecodingPlan,
        targets: &[(usize, ecs_api_types::ChunkMeta)],
        spare_containers: &[i32],
        _chunk_groups: &[Vec<usize>],
    ) -> Result<Vec<(usize, ecs_api_types::ChunkMeta)>> {
        let num_chunks = self.num_chunks_per_stripe(&file.coding)?;
        let base = stripe_id * num_chunks;
        let key = file.key();
        let selected = &plan.input_chunk_ids()[..plan.min_num_inputs()];

        let mut request = AgentMessage::new(Opcode::RprChunkReq);
        for (_, meta) in targets {
            request.chunks.push(ChunkPayload::meta_only(meta.clone()));
        }
        request.container_ids = spare_containers[..targets.len()].to_vec();

        let mut ctx = RepairContext {
            scheme: file.coding.scheme().to_u8(),
            repair_using_car: false,
            num_input_chunks: selected.len() as u32,
            chunk_id_offset: base as u32,
            matrix: plan.repair_matrix().to_vec(),
            ..Default::default()
        };
        for &id in selected {
            request
                .chunks
                .push(ChunkPayload::meta_only(file.chunks[base + id].clone()));
            ctx.container_group_map.push(file.container_ids[base + id]);
            ctx.chunk_group_map.push((base + id) as i32);
            ctx.agents.push(self.container_addr(file.container_ids[base + id])?);
        }
        // replacement agents follow the input agents
        for &container_id in &spare_containers[..targets.len()] {
            ctx.agents.push(self.container_addr(container_id)?);
        }
        request.repair = Some(ctx);

        for (i, (_, meta)) in targets.iter().enumerate() {
            self.journal_pre_write(&key, meta, spare_containers[i]);
        }

        let reply = self
            .spawn_chunk_request(spare_containers[0], request)
            .await
            .map_err(|err| ProxyError::Internal(format!("repair task failed - {err}")))?;
        match reply {
            Ok(reply) if reply.is_success_for(Opcode::RprChunkReq) => {
                let mut repaired = Vec::with_capacity(targets.len());
                for (i, (id, meta)) in targets.iter().enumerate() {
                    // the agent reports the digest of what it stored
                    let mut meta = meta.clone();
                    if let Some(stored) = reply.chunks.get(i) {
                        meta.size = stored.meta.size;
                        meta.md5 = stored.meta.md5;
                    }
                    self.journal_promote(&key, meta.chunk_id, spare_containers[i], JournalOp::Write);
                    repaired.push((*id, meta));
                }
                Ok(repaired)
            }
            Ok(reply) => {
                warn!(
                    "repair {key} stripe {stripe_id}: agent-side repair failed, rep = {:?}",
                    reply.opcode
                );
                Err(ProxyError::AgentReported { op: "agent repair" })
            }
            Err(err) => Err(err.into()),
        }
    }
}
