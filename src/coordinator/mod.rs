//! Placement and liveness coordinator.
//!
//! Owns the agent registry and the container-to-agent map, answers liveness
//! queries for the chunk manager, and picks spare containers for writes and
//! repairs under the placement policy.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use ecs_api_types::{
    AgentRegistration, AgentStatus, CodingMeta, ContainerInfo, HostType, SysInfo,
    DistributionPolicy, MAX_NUM_CONTAINERS_PER_AGENT, UNUSED_CONTAINER_ID,
};
use ecs_client::{AgentMessage, ContainerMap, Opcode, Transport};

mod listener;
mod placement;

pub use listener::run_coordinator_listener;

pub struct AgentInfo {
    pub ip: String,
    pub coord_port: u16,
    pub host_type: HostType,
    pub alive: bool,
    pub is_near: bool,
    pub containers: Vec<ContainerInfo>,
    /// Container index to start screening from under round-robin.
    pub starting_container_index: usize,
    pub sysinfo: SysInfo,
}

impl AgentInfo {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.ip, self.coord_port)
    }
}

pub(crate) struct CoordState {
    /// Registered agents keyed by ip, in registration order.
    pub agents: Vec<AgentInfo>,
    /// Agent index to start screening from under round-robin.
    pub starting_agent_index: usize,
    pub last_checked: Option<Instant>,
}

pub struct ProxyCoordinator {
    transport: Arc<dyn Transport>,
    containers: ContainerMap,
    policy: DistributionPolicy,
    near_ip_ranges: Vec<String>,
    liveness_cache_time: Duration,
    pub(crate) state: Mutex<CoordState>,
}

impl ProxyCoordinator {
    pub fn new(
        transport: Arc<dyn Transport>,
        containers: ContainerMap,
        policy: DistributionPolicy,
        near_ip_ranges: Vec<String>,
        liveness_cache_time: Duration,
    ) -> Self {
        Self {
            transport,
            containers,
            policy,
            near_ip_ranges,
            liveness_cache_time,
            state: Mutex::new(CoordState {
                agents: Vec::new(),
                starting_agent_index: 0,
                last_checked: None,
            }),
        }
    }

    pub fn container_map(&self) -> ContainerMap {
        self.containers.clone()
    }

    fn is_near(&self, ip: &str) -> bool {
        self.near_ip_ranges.iter().any(|range| ip.starts_with(range.as_str()))
    }

    /// Register an agent and its containers.
    ///
    /// A container id already owned by another agent is only transferred
    /// when the previous owner is unreachable; otherwise the registration
    /// is rejected. Re-registration of the same agent replaces its list.
    pub fn register_agent(&self, reg: AgentRegistration) -> Result<(), String> {
        if reg.containers.len() > MAX_NUM_CONTAINERS_PER_AGENT {
            return Err(format!(
                "agent {} registers {} containers, limit is {}",
                reg.ip,
                reg.containers.len(),
                MAX_NUM_CONTAINERS_PER_AGENT
            ));
        }

        let addr = reg.addr();
        let mut state = self.state.lock().unwrap();

        // check ownership of every container id first
        for container in &reg.containers {
            let owner = self.containers.read().unwrap().get(&container.id).cloned();
            if let Some(owner) = owner {
                if owner == addr {
                    continue;
                }
                let owner_ip = owner.split(':').next().unwrap_or("").to_string();
                let owner_alive = state
                    .agents
                    .iter()
                    .any(|a| a.ip == owner_ip && a.alive);
                if owner_alive {
                    return Err(format!(
                        "container id = {} is already owned by alive agent {}",
                        container.id, owner
                    ));
                }
                info!(
                    "transfer container id = {} from unreachable agent {} to {}",
                    container.id, owner, addr
                );
            }
        }

        {
            let mut map = self.containers.write().unwrap();
            for container in &reg.containers {
                map.insert(container.id, addr.clone());
            }
        }

        let is_near = self.is_near(&reg.ip);
        if let Some(agent) = state.agents.iter_mut().find(|a| a.ip == reg.ip) {
            agent.coord_port = reg.coord_port;
            agent.host_type = reg.host_type;
            agent.alive = true;
            agent.is_near = is_near;
            agent.containers = reg.containers;
            info!("updated registration of agent {} ({} containers)", reg.ip, agent.containers.len());
        } else {
            info!(
                "registered agent {} with {} containers (near = {})",
                reg.ip,
                reg.containers.len(),
                is_near
            );
            state.agents.push(AgentInfo {
                ip: reg.ip,
                coord_port: reg.coord_port,
                host_type: reg.host_type,
                alive: true,
                is_near,
                containers: reg.containers,
                starting_container_index: 0,
                sysinfo: SysInfo::default(),
            });
        }
        Ok(())
    }

    pub fn set_agent_alive(&self, ip: &str) -> bool {
        let mut state = self.state.lock().unwrap();
        match state.agents.iter_mut().find(|a| a.ip == ip) {
            Some(agent) => {
                agent.alive = true;
                true
            }
            None => false,
        }
    }

    pub fn set_agent_down(&self, ip: &str) -> bool {
        let mut state = self.state.lock().unwrap();
        match state.agents.iter_mut().find(|a| a.ip == ip) {
            Some(agent) => {
                if agent.alive {
                    warn!("agent {ip} is down");
                }
                agent.alive = false;
                true
            }
            None => false,
        }
    }

    /// Report a transport failure observed while talking to a container's
    /// agent; the agent is marked down until the next successful probe.
    pub fn report_container_failure(&self, container_id: i32) {
        let addr = self.containers.read().unwrap().get(&container_id).cloned();
        if let Some(addr) = addr {
            if let Some(ip) = addr.split(':').next() {
                self.set_agent_down(ip);
            }
        }
    }

    /// Probe every registered agent for liveness, container usage and
    /// sysinfo.
    pub async fn update_agent_status(&self) {
        let probes: Vec<(String, String)> = {
            let state = self.state.lock().unwrap();
            state
                .agents
                .iter()
                .map(|a| (a.ip.clone(), a.addr()))
                .collect()
        };

        for (ip, addr) in probes {
            let reply = self
                .transport
                .exchange(&addr, AgentMessage::new(Opcode::UpdAgentReq))
                .await;
            match reply {
                Ok(reply) if reply.opcode == Opcode::UpdAgentRep => {
                    let mut state = self.state.lock().unwrap();
                    if let Some(agent) = state.agents.iter_mut().find(|a| a.ip == ip) {
                        agent.alive = true;
                        if let Some(reg) = reply.registration {
                            agent.containers = reg.containers;
                            let mut map = self.containers.write().unwrap();
                            for container in &agent.containers {
                                map.insert(container.id, addr.clone());
                            }
                        }
                        if let Some(sysinfo) = reply.sysinfo {
                            agent.sysinfo = sysinfo;
                        }
                    }
                }
                Ok(reply) => {
                    debug!("unexpected status reply {:?} from {addr}", reply.opcode);
                    self.set_agent_down(&ip);
                }
                Err(err) => {
                    debug!("status probe of {addr} failed - {err}");
                    self.set_agent_down(&ip);
                }
            }
        }
        self.state.lock().unwrap().last_checked = Some(Instant::now());
    }

    /// Refresh agent status unless the previous refresh is still fresh.
    pub async fn maybe_update_agent_status(&self) {
        let fresh = {
            let state = self.state.lock().unwrap();
            state
                .last_checked
                .map(|at| at.elapsed() < self.liveness_cache_time)
                .unwrap_or(false)
        };
        if !fresh {
            self.update_agent_status().await;
        }
    }

    /// Check the liveness of a list of containers. A container is alive only
    /// when it is mapped to an agent and that agent is alive. Returns the
    /// per-container status and the number of failures.
    pub async fn check_container_liveness(
        &self,
        container_ids: &[i32],
        update_status_first: bool,
        treat_unused_as_offline: bool,
    ) -> (Vec<bool>, usize) {
        if update_status_first {
            self.maybe_update_agent_status().await;
        }
        self.check_container_liveness_cached(container_ids, treat_unused_as_offline)
    }

    /// Liveness check against the cached agent status only.
    pub fn check_container_liveness_cached(
        &self,
        container_ids: &[i32],
        treat_unused_as_offline: bool,
    ) -> (Vec<bool>, usize) {
        let state = self.state.lock().unwrap();
        let map = self.containers.read().unwrap();
        let mut status = vec![false; container_ids.len()];
        let mut num_failed = 0;
        for (i, &id) in container_ids.iter().enumerate() {
            if id == UNUSED_CONTAINER_ID {
                status[i] = !treat_unused_as_offline;
                if !status[i] {
                    num_failed += 1;
                }
                continue;
            }
            let Some(addr) = map.get(&id) else {
                num_failed += 1;
                continue;
            };
            let ip = addr.split(':').next().unwrap_or("");
            status[i] = state.agents.iter().any(|a| a.ip == ip && a.alive);
            if !status[i] {
                num_failed += 1;
            }
        }
        (status, num_failed)
    }

    /// Number of alive containers, optionally skipping the ones too full to
    /// take another chunk of a `k`-data-chunk stripe.
    pub fn num_alive_containers(&self, skip_full: bool, k: u64) -> usize {
        let state = self.state.lock().unwrap();
        let mut count = 0;
        for agent in state.agents.iter().filter(|a| a.alive) {
            for container in &agent.containers {
                if skip_full && container.usage + 1 + 2 * k >= container.capacity {
                    continue;
                }
                count += 1;
            }
        }
        count
    }

    pub fn num_agents(&self) -> usize {
        self.state.lock().unwrap().agents.len()
    }

    pub fn agent_status(&self) -> Vec<AgentStatus> {
        let state = self.state.lock().unwrap();
        state
            .agents
            .iter()
            .map(|a| AgentStatus {
                ip: a.ip.clone(),
                alive: a.alive,
                host_type: a.host_type,
                sysinfo: a.sysinfo.clone(),
                containers: a.containers.clone(),
            })
            .collect()
    }

    /// Total usage and capacity over all alive containers.
    pub fn storage_usage(&self) -> (u64, u64) {
        let state = self.state.lock().unwrap();
        let mut usage = 0;
        let mut capacity = 0;
        for agent in state.agents.iter().filter(|a| a.alive) {
            for container in &agent.containers {
                usage += container.usage;
                capacity += container.capacity;
            }
        }
        (usage, capacity)
    }

    /// Ask the agents named in the configuration to register themselves.
    pub async fn register_preset_agents(&self, agent_list: &[String]) {
        for addr in agent_list {
            match self
                .transport
                .exchange(addr, AgentMessage::new(Opcode::UpdAgentReq))
                .await
            {
                Ok(reply) => {
                    if let Some(reg) = reply.registration {
                        if let Err(err) = self.register_agent(reg) {
                            warn!("preset agent {addr} registration failed - {err}");
                        }
                    }
                }
                Err(err) => warn!("unable to reach preset agent {addr} - {err}"),
            }
        }
    }

    pub(crate) fn policy(&self) -> DistributionPolicy {
        self.policy
    }

    pub(crate) fn container_owner(&self, container_id: i32) -> Option<String> {
        self.containers.read().unwrap().get(&container_id).cloned()
    }

    /// Estimated chunk footprint of writing `fsize` bytes under parameter
    /// `k`, used for the container space check.
    pub(crate) fn chunk_footprint(fsize: u64, coding: &CodingMeta) -> u64 {
        let k = coding.k.max(1) as u64;
        (fsize + 2 * k) / k
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use async_trait::async_trait;
    use ecs_client::TransportError;

    pub(crate) struct NoopTransport;

    #[async_trait]
    impl Transport for NoopTransport {
        async fn exchange(
            &self,
            addr: &str,
            _request: AgentMessage,
        ) -> Result<AgentMessage, TransportError> {
            Err(TransportError::Timeout(addr.to_string()))
        }
    }

    pub(crate) fn test_coordinator(policy: DistributionPolicy) -> ProxyCoordinator {
        ProxyCoordinator::new(
            Arc::new(NoopTransport),
            ecs_client::new_container_map(),
            policy,
            vec!["10.0.".to_string()],
            Duration::from_secs(3600),
        )
    }

    pub(crate) fn registration(ip: &str, ids: &[i32], usage: u64, capacity: u64) -> AgentRegistration {
        AgentRegistration {
            ip: ip.to_string(),
            coord_port: 57002,
            host_type: HostType::OnPrem,
            containers: ids
                .iter()
                .map(|&id| ContainerInfo {
                    id,
                    container_type: Default::default(),
                    usage,
                    capacity,
                })
                .collect(),
        }
    }

    #[test]
    fn registration_and_duplicate_handling() {
        let coordinator = test_coordinator(DistributionPolicy::Static);
        coordinator
            .register_agent(registration("10.0.0.1", &[1, 2], 0, 1000))
            .unwrap();

        // same id from another alive agent is rejected
        let err = coordinator
            .register_agent(registration("10.0.0.2", &[2], 0, 1000))
            .unwrap_err();
        assert!(err.contains("already owned"));

        // after the owner goes down the id is transferred
        coordinator.set_agent_down("10.0.0.1");
        coordinator
            .register_agent(registration("10.0.0.2", &[2], 0, 1000))
            .unwrap();
        assert_eq!(
            coordinator.container_owner(2).unwrap(),
            "10.0.0.2:57002"
        );
    }

    #[tokio::test]
    async fn liveness_reflects_agent_state() {
        let coordinator = test_coordinator(DistributionPolicy::Static);
        coordinator
            .register_agent(registration("10.0.0.1", &[1], 0, 1000))
            .unwrap();
        coordinator
            .register_agent(registration("10.0.0.2", &[2], 0, 1000))
            .unwrap();

        let (status, failed) = coordinator
            .check_container_liveness(&[1, 2, 9], false, false)
            .await;
        assert_eq!(status, vec![true, true, false]);
        assert_eq!(failed, 1);

        coordinator.set_agent_down("10.0.0.2");
        let (status, failed) = coordinator
            .check_container_liveness(&[1, 2, UNUSED_CONTAINER_ID], false, false)
            .await;
        assert_eq!(status, vec![true, false, true]);
        assert_eq!(failed, 1);

        let (_, failed) = coordinator
            .check_container_liveness(&[UNUSED_CONTAINER_ID], false, true)
            .await;
        assert_eq!(failed, 1);
    }

    #[test]
    fn alive_container_count_skips_full() {
        let coordinator = test_coordinator(DistributionPolicy::Static);
        coordinator
            .register_agent(registration("10.0.0.1", &[1], 995, 1000))
            .unwrap();
        coordinator
            .register_agent(registration("10.0.0.2", &[2], 0, 1000))
            .unwrap();
        assert_eq!(coordinator.num_alive_containers(false, 2), 2);
        assert_eq!(coordinator.num_alive_containers(true, 2), 1);
    }
}
