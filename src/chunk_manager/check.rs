//! Chunk existence checks and batched checksum verification.

use log::warn;

use ecs_api_types::{FileMeta, INVALID_CONTAINER_ID, UNUSED_CONTAINER_ID};
use ecs_client::{AgentMessage, ChunkPayload, Opcode};

use crate::error::Result;

use super::ChunkManager;

impl ChunkManager {
    /// Ask the agents whether each chunk of the file exists. Returns a
    /// per-position presence indicator; positions without a container, and
    /// positions whose check request fails, count as absent.
    pub async fn check_file(&self, file: &FileMeta) -> Result<Vec<bool>> {
        self.batched_indicator_scan(file, Opcode::ChkChunkReq).await
    }

    /// Ask the agents to verify the stored checksum of each chunk. Returns
    /// a per-position corruption indicator. A failed request reports *no*
    /// corruption for its positions; liveness handling is the caller's
    /// business.
    pub async fn verify_file_checksums(&self, file: &FileMeta) -> Result<Vec<bool>> {
        self.batched_indicator_scan(file, Opcode::VrfChunkReq).await
    }

    /// One request per container covering all of the file's chunks there;
    /// the reply carries one indicator per chunk.
    async fn batched_indicator_scan(&self, file: &FileMeta, opcode: Opcode) -> Result<Vec<bool>> {
        let num_chunks = file.num_chunks();
        // a position not answered for stays at the default: absent for the
        // existence check, clean for the checksum verification
        let mut indicators = vec![false; num_chunks];

        let mut per_container: Vec<(i32, AgentMessage, Vec<usize>)> = Vec::new();
        for (i, &container_id) in file.container_ids.iter().enumerate() {
            if container_id == INVALID_CONTAINER_ID || container_id == UNUSED_CONTAINER_ID {
                continue;
            }
            let slot = match per_container.iter().position(|(id, _, _)| *id == container_id) {
                Some(slot) => slot,
                None => {
                    per_container.push((container_id, AgentMessage::new(opcode), Vec::new()));
                    per_container.len() - 1
                }
            };
            let entry = &mut per_container[slot];
            entry.1.chunks.push(ChunkPayload::meta_only(file.chunks[i].clone()));
            entry.1.container_ids.push(container_id);
            entry.2.push(i);
        }

        let positions: Vec<Vec<usize>> = per_container.iter().map(|(_, _, p)| p.clone()).collect();
        let requests: Vec<(i32, AgentMessage)> = per_container
            .into_iter()
            .map(|(id, request, _)| (id, request))
            .collect();

        let replies = self.access_chunks(requests).await;
        for (reply, positions) in replies.into_iter().zip(positions) {
            match reply {
                Ok(reply) if reply.is_success_for(opcode) => {
                    for (slot, &position) in positions.iter().enumerate() {
                        let flag = reply.indicators.get(slot).copied().unwrap_or(false);
                        indicators[position] = flag;
                    }
                }
                Ok(reply) => {
                    warn!(
                        "{opcode:?} on {} failed, rep = {:?}",
                        file.key(),
                        reply.opcode
                    );
                }
                Err(err) => {
                    warn!("{opcode:?} on {} failed - {err}", file.key());
                }
            }
        }
        Ok(indicators)
    }
}
