//! In-process agent cluster.
//!
//! Implements the agent side of the chunk protocol against RAM, including
//! versioned overwrites, partial encodings and peer-fetching repair, plus
//! failure injection. Unit and integration tests drive the whole proxy
//! against this cluster; no network or real agent daemon is involved.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;

use ecs_api_types::{
    AgentRegistration, ContainerInfo, ContainerType, HostType, SysInfo,
};
use ecs_client::{
    AgentMessage, ChunkPayload, Opcode, Transport, TransportError,
};
use ecs_coding::gf256;

use crate::tools::digest::md5sum;

const AGENT_PORT: u16 = 57002;

struct StoredChunk {
    data: Vec<u8>,
    md5: [u8; 16],
    file_version: i32,
    prev: Option<Box<StoredChunk>>,
}

#[derive(Default)]
struct ContainerSim {
    capacity: u64,
    chunks: HashMap<String, StoredChunk>,
}

impl ContainerSim {
    fn usage(&self) -> u64 {
        self.chunks.values().map(|c| c.data.len() as u64).sum()
    }
}

struct AgentSim {
    ip: String,
    alive: bool,
    containers: HashMap<i32, ContainerSim>,
}

#[derive(Default)]
struct ClusterState {
    agents: Vec<AgentSim>,
    next_container_id: i32,
}

impl ClusterState {
    fn agent_by_addr(&mut self, addr: &str) -> Option<&mut AgentSim> {
        let ip = addr.split(':').next()?;
        self.agents.iter_mut().find(|a| a.ip == ip)
    }

    fn container(&mut self, id: i32) -> Option<(&str, &mut ContainerSim)> {
        for agent in self.agents.iter_mut() {
            if agent.containers.contains_key(&id) {
                if !agent.alive {
                    return None;
                }
                let ip = agent.ip.as_str();
                return agent.containers.get_mut(&id).map(move |c| (ip, c));
            }
        }
        None
    }
}

/// A simulated fleet of agents reachable through the [`Transport`] trait.
pub struct MemoryCluster {
    state: Mutex<ClusterState>,
}

impl MemoryCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ClusterState::default()),
        })
    }

    /// Add an agent with `num_containers` fresh containers and return the
    /// registration to feed into the coordinator.
    pub fn add_agent(&self, ip: &str, num_containers: usize, capacity: u64) -> AgentRegistration {
        let mut state = self.state.lock().unwrap();
        let mut containers = HashMap::new();
        let mut infos = Vec::new();
        for _ in 0..num_containers {
            state.next_container_id += 1;
            let id = state.next_container_id;
            containers.insert(
                id,
                ContainerSim {
                    capacity,
                    chunks: HashMap::new(),
                },
            );
            infos.push(ContainerInfo {
                id,
                container_type: ContainerType::Fs,
                usage: 0,
                capacity,
            });
        }
        state.agents.push(AgentSim {
            ip: ip.to_string(),
            alive: true,
            containers,
        });
        AgentRegistration {
            ip: ip.to_string(),
            coord_port: AGENT_PORT,
            host_type: HostType::OnPrem,
            containers: infos,
        }
    }

    pub fn set_agent_down(&self, ip: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(agent) = state.agents.iter_mut().find(|a| a.ip == ip) {
            agent.alive = false;
        }
    }

    pub fn set_agent_up(&self, ip: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(agent) = state.agents.iter_mut().find(|a| a.ip == ip) {
            agent.alive = true;
        }
    }

    /// The ip of the agent owning a container.
    pub fn agent_of_container(&self, container_id: i32) -> Option<String> {
        let state = self.state.lock().unwrap();
        state
            .agents
            .iter()
            .find(|a| a.containers.contains_key(&container_id))
            .map(|a| a.ip.clone())
    }

    pub fn chunk_names(&self, container_id: i32) -> Vec<String> {
        let mut state = self.state.lock().unwrap();
        match state.container(container_id) {
            Some((_, container)) => container.chunks.keys().cloned().collect(),
            None => Vec::new(),
        }
    }

    pub fn num_chunks(&self, container_id: i32) -> usize {
        self.chunk_names(container_id).len()
    }

    /// Flip a byte of a stored chunk without touching its recorded digest.
    pub fn corrupt_chunk(&self, container_id: i32, chunk_name: &str) -> bool {
        let mut state = self.state.lock().unwrap();
        if let Some((_, container)) = state.container(container_id) {
            if let Some(chunk) = container.chunks.get_mut(chunk_name) {
                if let Some(byte) = chunk.data.first_mut() {
                    *byte ^= 0xff;
                    return true;
                }
            }
        }
        false
    }

    /// Drop a stored chunk, simulating silent loss.
    pub fn remove_chunk(&self, container_id: i32, chunk_name: &str) -> bool {
        let mut state = self.state.lock().unwrap();
        match state.container(container_id) {
            Some((_, container)) => container.chunks.remove(chunk_name).is_some(),
            None => false,
        }
    }

    fn handle(&self, addr: &str, request: AgentMessage) -> Result<AgentMessage, TransportError> {
        let mut state = self.state.lock().unwrap();
        {
            let Some(agent) = state.agent_by_addr(addr) else {
                return Err(TransportError::Closed(addr.to_string()));
            };
            if !agent.alive {
                return Err(TransportError::Timeout(addr.to_string()));
            }
        }

        let fail = AgentMessage::reply(request.opcode.fail_mate());
        let mut reply = AgentMessage::reply(request.opcode.success_mate());

        match request.opcode {
            Opcode::PutChunkReq => {
                if request.chunks.len() != request.container_ids.len() {
                    return Ok(fail);
                }
                for (chunk, &cid) in request.chunks.iter().zip(&request.container_ids) {
                    let Some(data) = chunk.data.as_ref() else {
                        return Ok(fail);
                    };
                    let Some((_, container)) = state.container(cid) else {
                        return Ok(fail);
                    };
                    if container.usage() + data.len() as u64 > container.capacity {
                        return Ok(fail);
                    }
                    let stored = StoredChunk {
                        data: data.to_vec(),
                        md5: md5sum(data),
                        file_version: chunk.meta.file_version,
                        prev: None,
                    };
                    let name = chunk.meta.chunk_name();
                    let prev = container.chunks.remove(&name);
                    let mut stored = stored;
                    stored.prev = prev.map(Box::new);
                    let mut meta = chunk.meta.clone();
                    meta.md5 = stored.md5;
                    container.chunks.insert(name, stored);
                    reply.chunks.push(ChunkPayload::meta_only(meta));
                    reply.container_ids.push(cid);
                }
            }
            Opcode::GetChunkReq => {
                for (chunk, &cid) in request.chunks.iter().zip(&request.container_ids) {
                    let Some((_, container)) = state.container(cid) else {
                        return Ok(fail);
                    };
                    let Some(stored) = container.chunks.get(&chunk.meta.chunk_name()) else {
                        return Ok(fail);
                    };
                    let mut meta = chunk.meta.clone();
                    meta.size = stored.data.len() as u32;
                    meta.md5 = md5sum(&stored.data);
                    reply
                        .chunks
                        .push(ChunkPayload::with_data(meta, Bytes::from(stored.data.clone())));
                    reply.container_ids.push(cid);
                }
            }
            Opcode::DelChunkReq => {
                for (chunk, &cid) in request.chunks.iter().zip(&request.container_ids) {
                    let Some((_, container)) = state.container(cid) else {
                        return Ok(fail);
                    };
                    // deleting an absent chunk is a no-op
                    container.chunks.remove(&chunk.meta.chunk_name());
                }
            }
            Opcode::CpyChunkReq | Opcode::MovChunkReq => {
                let pairs = request.container_ids.len();
                if request.chunks.len() != pairs * 2 {
                    return Ok(fail);
                }
                let is_move = request.opcode == Opcode::MovChunkReq;
                for i in 0..pairs {
                    let src_name = request.chunks[i].meta.chunk_name();
                    let dst = &request.chunks[pairs + i];
                    let cid = request.container_ids[i];
                    let Some((_, container)) = state.container(cid) else {
                        return Ok(fail);
                    };
                    let Some(stored) = container.chunks.get(&src_name) else {
                        return Ok(fail);
                    };
                    let copied = StoredChunk {
                        data: stored.data.clone(),
                        md5: stored.md5,
                        file_version: dst.meta.file_version,
                        prev: None,
                    };
                    let mut meta = dst.meta.clone();
                    meta.size = copied.data.len() as u32;
                    meta.md5 = copied.md5;
                    container.chunks.insert(dst.meta.chunk_name(), copied);
                    if is_move {
                        container.chunks.remove(&src_name);
                    }
                    reply.chunks.push(ChunkPayload::meta_only(meta));
                    reply.container_ids.push(cid);
                }
            }
            Opcode::RvtChunkReq => {
                for (chunk, &cid) in request.chunks.iter().zip(&request.container_ids) {
                    let Some((_, container)) = state.container(cid) else {
                        return Ok(fail);
                    };
                    let name = chunk.meta.chunk_name();
                    match container.chunks.remove(&name) {
                        Some(stored) => {
                            // restore the previous version when there is one
                            if let Some(prev) = stored.prev {
                                container.chunks.insert(name, *prev);
                            }
                        }
                        None => continue,
                    }
                }
            }
            Opcode::ChkChunkReq => {
                for (chunk, &cid) in request.chunks.iter().zip(&request.container_ids) {
                    let present = state
                        .container(cid)
                        .map(|(_, c)| c.chunks.contains_key(&chunk.meta.chunk_name()))
                        .unwrap_or(false);
                    reply.indicators.push(present);
                }
            }
            Opcode::VrfChunkReq => {
                for (chunk, &cid) in request.chunks.iter().zip(&request.container_ids) {
                    let corrupted = match state.container(cid) {
                        Some((_, container)) => match container.chunks.get(&chunk.meta.chunk_name()) {
                            Some(stored) => md5sum(&stored.data) != stored.md5,
                            None => true,
                        },
                        None => true,
                    };
                    reply.indicators.push(corrupted);
                }
            }
            Opcode::EncChunkReq => {
                // partially encode this agent's chunks with the supplied
                // coefficients: partial = sum(coeff_i * chunk_i)
                let Some(ctx) = request.repair.as_ref() else {
                    return Ok(fail);
                };
                if ctx.matrix.len() != request.chunks.len() {
                    return Ok(fail);
                }
                let mut partial: Option<Vec<u8>> = None;
                for (i, (chunk, &cid)) in
                    request.chunks.iter().zip(&request.container_ids).enumerate()
                {
                    let Some((_, container)) = state.container(cid) else {
                        return Ok(fail);
                    };
                    let Some(stored) = container.chunks.get(&chunk.meta.chunk_name()) else {
                        return Ok(fail);
                    };
                    let out = partial.get_or_insert_with(|| vec![0u8; stored.data.len()]);
                    gf256::mul_acc(out, &stored.data, ctx.matrix[i]);
                }
                let Some(partial) = partial else {
                    return Ok(fail);
                };
                let mut meta = request.chunks[0].meta.clone();
                meta.size = partial.len() as u32;
                meta.md5 = md5sum(&partial);
                reply
                    .chunks
                    .push(ChunkPayload::with_data(meta, Bytes::from(partial)));
            }
            Opcode::RprChunkReq => {
                // agent-side single-chunk repair: fetch the inputs from peer
                // containers, apply the repair row, store locally
                let Some(ctx) = request.repair.as_ref() else {
                    return Ok(fail);
                };
                let num_inputs = ctx.num_input_chunks as usize;
                let num_targets = request.chunks.len().saturating_sub(num_inputs);
                if num_targets == 0 || ctx.matrix.len() != num_targets * num_inputs {
                    return Ok(fail);
                }
                let targets = &request.chunks[..num_targets];
                let inputs = &request.chunks[num_targets..];

                let mut input_data = Vec::with_capacity(num_inputs);
                for (chunk, &cid) in inputs.iter().zip(&ctx.container_group_map) {
                    let Some((_, container)) = state.container(cid) else {
                        return Ok(fail);
                    };
                    let Some(stored) = container.chunks.get(&chunk.meta.chunk_name()) else {
                        return Ok(fail);
                    };
                    input_data.push(stored.data.clone());
                }
                let chunk_size = input_data.first().map(Vec::len).unwrap_or(0);

                for (t, target) in targets.iter().enumerate() {
                    let mut repaired = vec![0u8; chunk_size];
                    for (i, data) in input_data.iter().enumerate() {
                        gf256::mul_acc(&mut repaired, data, ctx.matrix[t * num_inputs + i]);
                    }
                    let Some(&cid) = request.container_ids.get(t) else {
                        return Ok(fail);
                    };
                    let Some((_, container)) = state.container(cid) else {
                        return Ok(fail);
                    };
                    let mut meta = target.meta.clone();
                    meta.size = repaired.len() as u32;
                    meta.md5 = md5sum(&repaired);
                    container.chunks.insert(
                        target.meta.chunk_name(),
                        StoredChunk {
                            data: repaired,
                            md5: meta.md5,
                            file_version: meta.file_version,
                            prev: None,
                        },
                    );
                    reply.chunks.push(ChunkPayload::meta_only(meta));
                    reply.container_ids.push(cid);
                }
            }
            Opcode::UpdAgentReq => {
                let agent = state.agent_by_addr(addr).unwrap();
                let mut containers: Vec<ContainerInfo> = agent
                    .containers
                    .iter()
                    .map(|(&id, c)| ContainerInfo {
                        id,
                        container_type: ContainerType::Fs,
                        usage: c.usage(),
                        capacity: c.capacity,
                    })
                    .collect();
                containers.sort_by_key(|c| c.id);
                reply.registration = Some(AgentRegistration {
                    ip: agent.ip.clone(),
                    coord_port: AGENT_PORT,
                    host_type: HostType::OnPrem,
                    containers,
                });
                reply.sysinfo = Some(SysInfo {
                    cpu_num: 1,
                    cpu_usage: vec![0.0],
                    mem_total: 1024,
                    mem_free: 512,
                    ..Default::default()
                });
            }
            Opcode::SynPing => {}
            Opcode::GetSysinfoReq => {
                reply.sysinfo = Some(SysInfo::default());
            }
            _ => return Ok(AgentMessage::reply(Opcode::UnknownOp)),
        }

        Ok(reply)
    }
}

#[async_trait]
impl Transport for MemoryCluster {
    async fn exchange(
        &self,
        addr: &str,
        request: AgentMessage,
    ) -> Result<AgentMessage, TransportError> {
        // run the message through the codec so the wire layout is exercised
        let request = AgentMessage::decode(request.encode()).map_err(|err| {
            TransportError::Protocol {
                addr: addr.to_string(),
                err,
            }
        })?;
        self.handle(addr, request)
    }
}

/// A fully-wired proxy over an in-process cluster and memory metastore,
/// for integration tests and local experiments.
pub struct ProxyHarness {
    pub cluster: Arc<MemoryCluster>,
    pub proxy: Arc<crate::proxy::Proxy>,
    pub metastore: Arc<crate::metastore::MemoryMetaStore>,
    pub coordinator: Arc<crate::coordinator::ProxyCoordinator>,
    pub bg_tasks: crossbeam_channel::Receiver<crate::chunk_manager::BgChunkTask>,
    pub progress: Arc<crate::server::BgTaskProgress>,
}

/// Cluster and storage-class shape of a [`ProxyHarness`].
pub struct HarnessParams {
    pub num_agents: usize,
    pub containers_per_agent: usize,
    pub container_capacity: u64,
    pub n: u8,
    pub k: u8,
    pub f: u8,
    pub max_chunk_size: u32,
}

impl Default for HarnessParams {
    fn default() -> Self {
        Self {
            num_agents: 6,
            containers_per_agent: 1,
            container_capacity: 1 << 30,
            n: 4,
            k: 2,
            f: 0,
            max_chunk_size: 1 << 20,
        }
    }
}

impl ProxyHarness {
    pub fn new(mut config: ecs_config::Config, params: HarnessParams) -> Self {
        use ecs_client::{ChunkClient, Transport};
        use ecs_coding::CodingRegistry;
        use std::collections::HashMap;
        use std::time::Duration;

        // the harness always talks to the in-process cluster
        config.metastore.store_type = "memory".to_string();

        let cluster = MemoryCluster::new();
        let transport: Arc<dyn Transport> = cluster.clone();
        let containers = ecs_client::new_container_map();
        let coordinator = Arc::new(crate::coordinator::ProxyCoordinator::new(
            transport.clone(),
            containers.clone(),
            config.data_distribution.policy,
            config.data_distribution.near_ip_ranges.clone(),
            Duration::ZERO,
        ));
        for i in 0..params.num_agents {
            let reg = cluster.add_agent(
                &format!("10.0.0.{}", i + 1),
                params.containers_per_agent,
                params.container_capacity,
            );
            coordinator.register_agent(reg).unwrap();
        }

        let mut classes = HashMap::new();
        classes.insert(
            "standard".to_string(),
            ecs_config::StorageClassConfig {
                coding: "rs".to_string(),
                n: params.n,
                k: params.k,
                f: params.f,
                max_chunk_size: params.max_chunk_size,
                default: true,
            },
        );
        let classes = ecs_config::StorageClassRegistry::from_classes(classes).unwrap();

        let metastore = Arc::new(crate::metastore::MemoryMetaStore::new());
        let registry = Arc::new(CodingRegistry::new(config.misc.repair_using_car));
        let client = Arc::new(ChunkClient::new(transport, containers));
        let (bg_sender, bg_tasks) = crossbeam_channel::unbounded();
        let manager = Arc::new(crate::chunk_manager::ChunkManager::new(
            client,
            registry,
            metastore.clone(),
            coordinator.clone(),
            Some(bg_sender),
            crate::chunk_manager::ChunkManagerOptions {
                verify_chunk_checksum: config.data_integrity.verify_chunk_checksum,
                ack_redundancy_in_background: config.background_write.ack_redundancy_in_background,
                write_redundancy_in_background: config
                    .background_write
                    .write_redundancy_in_background,
                repair_at_proxy: config.misc.repair_at_proxy,
                repair_using_car: config.misc.repair_using_car,
            },
        ));

        let staging = if config.staging.enabled {
            Some(Arc::new(
                crate::staging::Staging::open(&config.staging.url).unwrap(),
            ))
        } else {
            None
        };

        let progress = crate::server::BgTaskProgress::new();
        let proxy = Arc::new(crate::proxy::Proxy::new(
            Arc::new(config),
            classes,
            metastore.clone(),
            coordinator.clone(),
            manager,
            staging,
            progress.clone(),
        ));

        Self {
            cluster,
            proxy,
            metastore,
            coordinator,
            bg_tasks,
            progress,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use ecs_api_types::ChunkMeta;
    use uuid::Uuid;

    fn chunk(fuuid: Uuid, id: u16, version: i32, data: &[u8]) -> ChunkPayload {
        let mut meta = ChunkMeta::default();
        meta.namespace_id = 0;
        meta.fuuid = fuuid;
        meta.chunk_id = id;
        meta.file_version = version;
        meta.size = data.len() as u32;
        meta.md5 = md5sum(data);
        ChunkPayload::with_data(meta, Bytes::copy_from_slice(data))
    }

    #[tokio::test]
    async fn put_get_revert_cycle() {
        let cluster = MemoryCluster::new();
        cluster.add_agent("10.0.0.1", 1, 1 << 20);
        let fuuid = Uuid::new_v4();

        let mut put = AgentMessage::new(Opcode::PutChunkReq);
        put.chunks.push(chunk(fuuid, 0, 0, b"version zero"));
        put.container_ids.push(1);
        let reply = cluster.exchange("10.0.0.1:57002", put).await.unwrap();
        assert_eq!(reply.opcode, Opcode::PutChunkRepSuccess);
        assert_eq!(reply.chunks[0].meta.md5, md5sum(b"version zero"));

        // overwrite the same chunk name, then revert to the old version
        let mut put = AgentMessage::new(Opcode::PutChunkReq);
        put.chunks.push(chunk(fuuid, 0, 1, b"version one"));
        put.container_ids.push(1);
        cluster.exchange("10.0.0.1:57002", put).await.unwrap();

        let mut rvt = AgentMessage::new(Opcode::RvtChunkReq);
        rvt.chunks.push(chunk(fuuid, 0, 1, b""));
        rvt.container_ids.push(1);
        let reply = cluster.exchange("10.0.0.1:57002", rvt).await.unwrap();
        assert_eq!(reply.opcode, Opcode::RvtChunkRepSuccess);

        let mut get = AgentMessage::new(Opcode::GetChunkReq);
        get.chunks.push(chunk(fuuid, 0, 0, b""));
        get.container_ids.push(1);
        let reply = cluster.exchange("10.0.0.1:57002", get).await.unwrap();
        assert_eq!(reply.chunks[0].data.as_deref(), Some(&b"version zero"[..]));
    }

    #[tokio::test]
    async fn down_agent_times_out() {
        let cluster = MemoryCluster::new();
        cluster.add_agent("10.0.0.1", 1, 1 << 20);
        cluster.set_agent_down("10.0.0.1");
        let err = cluster
            .exchange("10.0.0.1:57002", AgentMessage::new(Opcode::SynPing))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Timeout(_)));
    }

    #[tokio::test]
    async fn verify_flags_corruption() {
        let cluster = MemoryCluster::new();
        cluster.add_agent("10.0.0.1", 1, 1 << 20);
        let fuuid = Uuid::new_v4();

        let mut put = AgentMessage::new(Opcode::PutChunkReq);
        put.chunks.push(chunk(fuuid, 0, 0, b"payload"));
        put.container_ids.push(1);
        cluster.exchange("10.0.0.1:57002", put).await.unwrap();

        let name = cluster.chunk_names(1)[0].clone();
        let mut vrf = AgentMessage::new(Opcode::VrfChunkReq);
        vrf.chunks.push(chunk(fuuid, 0, 0, b""));
        vrf.container_ids.push(1);
        let reply = cluster.exchange("10.0.0.1:57002", vrf.clone()).await.unwrap();
        assert_eq!(reply.indicators, vec![false]);

        assert!(cluster.corrupt_chunk(1, &name));
        let reply = cluster.exchange("10.0.0.1:57002", vrf).await.unwrap();
        assert_eq!(reply.indicators, vec![true]);
    }
}
