//! Copy, move, delete and revert pipelines.

use log::{debug, warn};

use ecs_api_types::{FileMeta, INVALID_CONTAINER_ID, UNUSED_CONTAINER_ID};
use ecs_client::{AgentMessage, ChunkPayload, Opcode};

use crate::error::{ProxyError, Result};

use super::{stripe_chunk_meta, ChunkManager};

impl ChunkManager {
    /// Delete every alive chunk of a file. Positions whose indicator is
    /// down, or whose container is invalid or unused, are skipped. Returns
    /// the number of chunks that could not be deleted.
    pub async fn delete_file(&self, file: &FileMeta, status: &[bool]) -> Result<usize> {
        self.operate_on_alive_chunks(file, status, Opcode::DelChunkReq).await
    }

    /// Ask the agents to restore the previous version of every touched
    /// chunk, undoing an uncommitted overwrite.
    pub async fn revert_file(&self, file: &FileMeta, status: &[bool]) -> Result<usize> {
        self.operate_on_alive_chunks(file, status, Opcode::RvtChunkReq).await
    }

    /// Issue one request per container covering all of the file's alive
    /// chunks it holds.
    async fn operate_on_alive_chunks(
        &self,
        file: &FileMeta,
        status: &[bool],
        opcode: Opcode,
    ) -> Result<usize> {
        // group chunk positions by container
        let mut per_container: Vec<(i32, AgentMessage)> = Vec::new();
        for (i, &container_id) in file.container_ids.iter().enumerate() {
            if container_id == INVALID_CONTAINER_ID || container_id == UNUSED_CONTAINER_ID {
                continue;
            }
            if !status.get(i).copied().unwrap_or(true) {
                continue;
            }
            let slot = match per_container.iter().position(|(id, _)| *id == container_id) {
                Some(slot) => slot,
                None => {
                    per_container.push((container_id, AgentMessage::new(opcode)));
                    per_container.len() - 1
                }
            };
            let request = &mut per_container[slot].1;
            request
                .chunks
                .push(ChunkPayload::meta_only(file.chunks[i].clone()));
            request.container_ids.push(container_id);
        }

        let mut num_failed = 0;
        let replies = self.access_chunks(per_container).await;
        for reply in replies {
            match reply {
                Ok(reply) if reply.is_success_for(opcode) => {}
                Ok(reply) => {
                    warn!(
                        "{opcode:?} on {} failed, rep = {:?}",
                        file.key(),
                        reply.opcode
                    );
                    num_failed += 1;
                }
                Err(err) => {
                    warn!("{opcode:?} on {} failed - {err}", file.key());
                    num_failed += 1;
                }
            }
        }
        Ok(num_failed)
    }

    /// Copy the stripes covering `[offset, offset + length)` of `src` into
    /// `dst`, which carries the destination name, uuid and version. Chunks
    /// stay on their containers; the agents duplicate them under the new
    /// chunk names. Returns the copied stripe range.
    pub async fn copy_file(
        &self,
        src: &FileMeta,
        dst: &mut FileMeta,
        offset: u64,
        length: u64,
    ) -> Result<(usize, usize)> {
        self.transfer_file(src, dst, offset, length, false).await
    }

    /// Like [`ChunkManager::copy_file`] but removes the source chunks.
    pub async fn move_file(
        &self,
        src: &FileMeta,
        dst: &mut FileMeta,
        offset: u64,
        length: u64,
    ) -> Result<(usize, usize)> {
        self.transfer_file(src, dst, offset, length, true).await
    }

    async fn transfer_file(
        &self,
        src: &FileMeta,
        dst: &mut FileMeta,
        offset: u64,
        length: u64,
        is_move: bool,
    ) -> Result<(usize, usize)> {
        let engine = self.engine(&src.coding)?;
        let num_chunks = engine.num_chunks();
        let num_data = engine.num_data_chunks();
        let stripe_size = self.max_data_size_per_stripe(&src.coding)?;
        if stripe_size == 0 || src.num_stripes == 0 {
            return Ok((0, 0));
        }
        let start = (offset / stripe_size) as usize;
        let end = (((offset + length) + stripe_size - 1) / stripe_size) as usize;
        let end = end.min(src.num_stripes as usize);
        let opcode = if is_move {
            Opcode::MovChunkReq
        } else {
            Opcode::CpyChunkReq
        };

        for stripe_id in start..end {
            let base = stripe_id * num_chunks;
            let mut requests = Vec::with_capacity(num_chunks);
            let mut positions = Vec::with_capacity(num_chunks);
            for i in 0..num_chunks {
                let container_id = src.container_ids[base + i];
                if container_id == INVALID_CONTAINER_ID || container_id == UNUSED_CONTAINER_ID {
                    continue;
                }
                let src_chunk = &src.chunks[base + i];
                let dst_chunk =
                    stripe_chunk_meta(dst, base + i, src_chunk.size, src_chunk.md5);
                let mut request = AgentMessage::new(opcode);
                request.chunks.push(ChunkPayload::meta_only(src_chunk.clone()));
                request.chunks.push(ChunkPayload::meta_only(dst_chunk));
                request.container_ids.push(container_id);
                requests.push((container_id, request));
                positions.push(base + i);
            }

            let replies = self.access_chunks(requests).await;
            let mut num_success = 0;
            for (&position, reply) in positions.iter().zip(replies) {
                match reply {
                    Ok(reply) if reply.is_success_for(opcode) => {
                        if let Some(copied) = reply.chunks.first() {
                            dst.chunks[position] = copied.meta.clone();
                            dst.container_ids[position] = src.container_ids[position];
                            num_success += 1;
                        }
                    }
                    Ok(reply) => {
                        warn!(
                            "{opcode:?} {} stripe {stripe_id}: chunk at position {position} failed, rep = {:?}",
                            src.key(),
                            reply.opcode
                        );
                    }
                    Err(err) => {
                        warn!(
                            "{opcode:?} {} stripe {stripe_id}: chunk at position {position} failed - {err}",
                            src.key()
                        );
                    }
                }
            }

            if num_success < num_data {
                warn!(
                    "{opcode:?} {} stripe {stripe_id}: only {num_success} of {num_data} chunks transferred, rolling back",
                    src.key()
                );
                let copied = vec![true; dst.chunks.len()];
                let _ = self.delete_file(dst, &copied).await;
                for id in dst.container_ids.iter_mut() {
                    *id = INVALID_CONTAINER_ID;
                }
                return Err(ProxyError::Partial(Box::new(
                    ProxyError::StripeUnderReplicated {
                        stored: num_success,
                        required: num_data,
                    },
                )));
            }
            debug!(
                "{opcode:?} {} stripe {stripe_id}: {num_success} chunks transferred",
                src.key()
            );
        }

        Ok((start, end))
    }
}

#[cfg(test)]
mod test {
    use super::super::test_support::*;
    use ecs_api_types::INVALID_CONTAINER_ID;

    #[tokio::test]
    async fn delete_removes_alive_chunks_only() {
        let env = TestEnv::new(4, 2, 0).await;
        let mut file = env.new_file("a", 1 << 20);
        let data = payload((1 << 20) as usize);
        let spare = env.spare_containers(&file, 4).await;
        env.manager
            .write_file_stripe(&mut file, 0, &data, &spare, false)
            .await
            .unwrap();

        // mark one position as failed; its chunk must not be touched
        let status = vec![false, true, true, true];
        let failed = env.manager.delete_file(&file, &status).await.unwrap();
        assert_eq!(failed, 0);
        assert_eq!(env.cluster.num_chunks(file.container_ids[0]), 1);
        for &id in &file.container_ids[1..] {
            assert_eq!(env.cluster.num_chunks(id), 0);
        }
    }

    #[tokio::test]
    async fn copy_duplicates_chunks_in_place() {
        let env = TestEnv::new(4, 2, 0).await;
        let mut file = env.new_file("a", 1 << 20);
        let data = payload((1 << 20) as usize);
        let spare = env.spare_containers(&file, 4).await;
        env.manager
            .write_file_stripe(&mut file, 0, &data, &spare, false)
            .await
            .unwrap();

        let mut copy = env.new_file("b", file.size);
        copy.copy_storage_policy(&file);
        let (start, end) = env
            .manager
            .copy_file(&file, &mut copy, 0, file.size)
            .await
            .unwrap();
        assert_eq!((start, end), (0, 1));
        assert_eq!(copy.container_ids, file.container_ids);
        // both the original and the copy are stored on each container
        for &id in &file.container_ids {
            assert_eq!(env.cluster.num_chunks(id), 2);
        }
        // the copy reads back identically
        let read = env
            .manager
            .read_file_stripe(&copy, 0, &[true; 4])
            .await
            .unwrap();
        assert_eq!(read, data);
    }

    #[tokio::test]
    async fn failed_copy_rolls_back_destination() {
        let env = TestEnv::new(4, 2, 0).await;
        let mut file = env.new_file("a", 1 << 20);
        let data = payload((1 << 20) as usize);
        let spare = env.spare_containers(&file, 4).await;
        env.manager
            .write_file_stripe(&mut file, 0, &data, &spare, false)
            .await
            .unwrap();

        // three agents down leaves fewer than k copy successes
        for position in [0, 1, 2] {
            let ip = env
                .cluster
                .agent_of_container(file.container_ids[position])
                .unwrap();
            env.cluster.set_agent_down(&ip);
        }

        let mut copy = env.new_file("b", file.size);
        copy.copy_storage_policy(&file);
        let err = env
            .manager
            .copy_file(&file, &mut copy, 0, file.size)
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::ProxyError::Partial(_)));
        assert!(copy
            .container_ids
            .iter()
            .all(|&id| id == INVALID_CONTAINER_ID));
    }
}
