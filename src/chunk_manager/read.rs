//! Stripe read pipeline with degraded-read recovery.

use std::collections::HashMap;

use log::{debug, warn};

use ecs_api_types::FileMeta;
use ecs_client::{AgentMessage, ChunkPayload, Opcode};
use ecs_coding::DecodingPlan;

use crate::error::{ProxyError, Result};
use crate::tools::digest::md5sum;

use super::{failed_ids, ChunkManager};

impl ChunkManager {
    /// Read and decode one stripe.
    ///
    /// `status` holds the liveness indicator of the stripe's chunk
    /// positions. Chunks that fail to arrive are substituted with other
    /// survivors until fewer than `k` remain.
    pub async fn read_file_stripe(
        &self,
        file: &FileMeta,
        stripe_id: usize,
        status: &[bool],
    ) -> Result<Vec<u8>> {
        let engine = self.engine(&file.coding)?;
        debug_assert_eq!(status.len(), engine.num_chunks());

        let failed = failed_ids(status);
        let plan = engine.pre_decode(&failed, false)?;

        let inputs = self.collect_stripe_inputs(file, stripe_id, &plan).await?;
        let input_refs: Vec<(usize, &[u8])> = inputs
            .iter()
            .map(|(id, data)| (*id, data.as_slice()))
            .collect();
        let mut decoded = engine.decode(&input_refs, &plan, false, &[])?;

        let data_size = self.data_size_of_stripe(&file.coding, file.size, stripe_id)? as usize;
        decoded.truncate(data_size);
        Ok(decoded)
    }

    /// Fetch the decode inputs of a plan, substituting failed chunks with
    /// untried survivors. Returns `min_num_inputs` chunks sorted by id, or
    /// `Unrecoverable` when the survivors run out.
    pub(crate) async fn collect_stripe_inputs(
        &self,
        file: &FileMeta,
        stripe_id: usize,
        plan: &DecodingPlan,
    ) -> Result<Vec<(usize, Vec<u8>)>> {
        let num_chunks = self.num_chunks_per_stripe(&file.coding)?;
        let base = stripe_id * num_chunks;
        let num_wanted = plan.min_num_inputs();

        let mut candidates = plan.input_chunk_ids().to_vec();
        let mut selected: Vec<usize> = candidates.drain(..num_wanted).collect();
        let mut fetched: HashMap<usize, Vec<u8>> = HashMap::new();

        while fetched.len() < num_wanted {
            let wanted: Vec<usize> = selected
                .iter()
                .copied()
                .filter(|id| !fetched.contains_key(id))
                .collect();
            let requests: Vec<(i32, AgentMessage)> = wanted
                .iter()
                .map(|&id| {
                    let mut request = AgentMessage::new(Opcode::GetChunkReq);
                    request
                        .chunks
                        .push(ChunkPayload::meta_only(file.chunks[base + id].clone()));
                    request.container_ids.push(file.container_ids[base + id]);
                    (file.container_ids[base + id], request)
                })
                .collect();

            let replies = self.access_chunks(requests).await;
            let mut lost = Vec::new();
            for (&id, reply) in wanted.iter().zip(replies) {
                match reply {
                    Ok(reply) if reply.is_success_for(Opcode::GetChunkReq) => {
                        match self
                            .validate_chunk_data(file, base + id, reply.chunks.into_iter().next())
                        {
                            Some(data) => {
                                fetched.insert(id, data);
                            }
                            None => lost.push(id),
                        }
                    }
                    Ok(reply) => {
                        warn!(
                            "read {} stripe {stripe_id}: chunk {id} failed, rep = {:?}",
                            file.key(),
                            reply.opcode
                        );
                        lost.push(id);
                    }
                    Err(err) => {
                        warn!(
                            "read {} stripe {stripe_id}: chunk {id} failed - {err}",
                            file.key()
                        );
                        lost.push(id);
                    }
                }
            }

            // replace every lost chunk with an untried survivor
            for id in lost {
                selected.retain(|&s| s != id);
                match candidates.pop() {
                    Some(substitute) => {
                        debug!(
                            "read {} stripe {stripe_id}: retry with chunk {substitute} instead of {id}",
                            file.key()
                        );
                        selected.push(substitute);
                    }
                    None => {
                        warn!(
                            "read {} stripe {stripe_id}: no survivor left to replace chunk {id}",
                            file.key()
                        );
                        return Err(ProxyError::Unrecoverable);
                    }
                }
            }
        }

        let mut inputs: Vec<(usize, Vec<u8>)> = fetched.into_iter().collect();
        inputs.sort_by_key(|(id, _)| *id);
        Ok(inputs)
    }

    /// Check a fetched chunk: present data, expected size and, when
    /// verification is on, a matching digest.
    fn validate_chunk_data(
        &self,
        file: &FileMeta,
        position: usize,
        chunk: Option<ChunkPayload>,
    ) -> Option<Vec<u8>> {
        let chunk = chunk?;
        let data = chunk.data?;
        let expected = &file.chunks[position];
        if expected.size != 0 && data.len() as u32 != expected.size {
            warn!(
                "read {}: chunk {} has size {} instead of {}",
                file.key(),
                expected.chunk_id,
                data.len(),
                expected.size
            );
            return None;
        }
        if self.opts().verify_chunk_checksum && md5sum(&data) != expected.md5 {
            warn!(
                "read {}: chunk {} fails checksum verification",
                file.key(),
                expected.chunk_id
            );
            return None;
        }
        Some(data.to_vec())
    }
}

#[cfg(test)]
mod test {
    use super::super::test_support::*;

    #[tokio::test]
    async fn round_trip_single_stripe() {
        let env = TestEnv::new(4, 2, 1).await;
        let mut file = env.new_file("a", 1 << 20);
        let data = payload((1 << 20) as usize);
        let spare = env.spare_containers(&file, 4).await;
        env.manager
            .write_file_stripe(&mut file, 0, &data, &spare, false)
            .await
            .unwrap();

        let read = env
            .manager
            .read_file_stripe(&file, 0, &[true; 4])
            .await
            .unwrap();
        assert_eq!(read, data);
    }

    #[tokio::test]
    async fn degraded_read_with_failures_up_to_n_minus_k() {
        let env = TestEnv::new(4, 2, 0).await;
        let mut file = env.new_file("a", 1 << 20);
        let data = payload((1 << 20) as usize);
        let spare = env.spare_containers(&file, 4).await;
        env.manager
            .write_file_stripe(&mut file, 0, &data, &spare, false)
            .await
            .unwrap();

        // two containers down is still within n - k = 2
        let ip0 = env.cluster.agent_of_container(file.container_ids[0]).unwrap();
        let ip3 = env.cluster.agent_of_container(file.container_ids[3]).unwrap();
        env.cluster.set_agent_down(&ip0);
        env.cluster.set_agent_down(&ip3);

        let status = env.container_status(&file).await;
        assert_eq!(status.iter().filter(|s| !**s).count(), 2);
        let read = env
            .manager
            .read_file_stripe(&file, 0, &status)
            .await
            .unwrap();
        assert_eq!(read, data);
    }

    #[tokio::test]
    async fn read_substitutes_silently_lost_chunks() {
        let env = TestEnv::new(4, 2, 0).await;
        let mut file = env.new_file("a", 1 << 20);
        let data = payload((1 << 20) as usize);
        let spare = env.spare_containers(&file, 4).await;
        env.manager
            .write_file_stripe(&mut file, 0, &data, &spare, false)
            .await
            .unwrap();

        // the agent still answers, but the first data chunk is gone
        let name = file.chunks[0].chunk_name();
        assert!(env.cluster.remove_chunk(file.container_ids[0], &name));

        let read = env
            .manager
            .read_file_stripe(&file, 0, &[true; 4])
            .await
            .unwrap();
        assert_eq!(read, data);
    }

    #[tokio::test]
    async fn read_fails_below_k_survivors() {
        let env = TestEnv::new(4, 2, 0).await;
        let mut file = env.new_file("a", 1 << 20);
        let data = payload((1 << 20) as usize);
        let spare = env.spare_containers(&file, 4).await;
        env.manager
            .write_file_stripe(&mut file, 0, &data, &spare, false)
            .await
            .unwrap();

        for position in [0, 1, 2] {
            let ip = env
                .cluster
                .agent_of_container(file.container_ids[position])
                .unwrap();
            env.cluster.set_agent_down(&ip);
        }
        let status = env.container_status(&file).await;
        let err = env
            .manager
            .read_file_stripe(&file, 0, &status)
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::ProxyError::Unrecoverable));
    }
}
