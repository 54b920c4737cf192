//! Spare-container selection and chunk grouping.

use std::collections::{HashMap, HashSet};

use log::debug;

use ecs_api_types::{CodingMeta, DistributionPolicy};

use super::ProxyCoordinator;

impl ProxyCoordinator {
    /// Find spare containers for new chunks, excluding the alive containers
    /// in `existing`.
    ///
    /// The selection honors three constraints: a container already holding a
    /// live chunk of the stripe is never reused; a container must have room
    /// for one more chunk of `fsize` bytes of data; and no agent serves more
    /// than `(n - k) / f` chunks when the placement constraint `f` is set.
    pub async fn find_spare_containers(
        &self,
        existing: &[i32],
        status: &[bool],
        num_spare: usize,
        fsize: u64,
        coding: &CodingMeta,
    ) -> Vec<i32> {
        if num_spare == 0 {
            return Vec::new();
        }
        self.maybe_update_agent_status().await;

        // alive containers of the stripe, and how many of them each agent
        // already serves
        let mut used: HashSet<i32> = HashSet::new();
        let mut agent_count: HashMap<String, usize> = HashMap::new();
        for (i, &id) in existing.iter().enumerate() {
            if !status.get(i).copied().unwrap_or(false) {
                continue;
            }
            if !used.insert(id) {
                continue;
            }
            if let Some(addr) = self.container_owner(id) {
                let ip = addr.split(':').next().unwrap_or("").to_string();
                *agent_count.entry(ip).or_insert(0) += 1;
            }
        }

        let n = coding.n as usize;
        let k = coding.k as usize;
        // max. containers chosen per agent
        let per_agent_limit = if coding.f > 0 {
            (n - k) / coding.f as usize
        } else {
            n
        };
        let footprint = Self::chunk_footprint(fsize, coding);

        let policy = self.policy();
        let mut selected = Vec::with_capacity(num_spare);
        let mut deferred = Vec::new();

        let mut state = self.state.lock().unwrap();
        let num_agents = state.agents.len();
        let start_index = state.starting_agent_index % num_agents.max(1);

        for offset in 0..num_agents {
            if selected.len() >= num_spare {
                break;
            }
            let idx = (start_index + offset) % num_agents;
            let agent = &mut state.agents[idx];
            if !agent.alive || agent.containers.is_empty() {
                continue;
            }

            let mut local_selected = agent_count.get(&agent.ip).copied().unwrap_or(0);
            if local_selected >= per_agent_limit {
                debug!(
                    "skip agent {} which already serves {local_selected} chunks (limit {per_agent_limit})",
                    agent.ip
                );
                continue;
            }

            // container screening order depends on the policy
            let num_containers = agent.containers.len();
            let order: Vec<usize> = match policy {
                DistributionPolicy::LeastUsed => {
                    let mut by_utilization: Vec<usize> = (0..num_containers).collect();
                    by_utilization.sort_by(|&a, &b| {
                        let ua = utilization(agent.containers[a].usage, agent.containers[a].capacity);
                        let ub = utilization(agent.containers[b].usage, agent.containers[b].capacity);
                        ua.partial_cmp(&ub).unwrap_or(std::cmp::Ordering::Equal)
                    });
                    by_utilization
                }
                DistributionPolicy::RoundRobin => (0..num_containers)
                    .map(|i| (agent.starting_container_index + i) % num_containers)
                    .collect(),
                DistributionPolicy::Static => (0..num_containers).collect(),
            };

            let mut advanced_cursor = false;
            for cidx in order {
                if selected.len() >= num_spare || local_selected >= per_agent_limit {
                    break;
                }
                let container = &agent.containers[cidx];
                if used.contains(&container.id) {
                    // counts towards the agent's quota even though reused
                    local_selected += 1;
                    continue;
                }
                if container.usage + footprint > container.capacity {
                    debug!(
                        "container id = {} too full ({} of {}) for chunk of {footprint}",
                        container.id, container.usage, container.capacity
                    );
                    continue;
                }
                // far agents are a lower-priority pool under the static policy
                if policy == DistributionPolicy::Static && !agent.is_near {
                    deferred.push(container.id);
                } else {
                    selected.push(container.id);
                    if policy == DistributionPolicy::RoundRobin && !advanced_cursor {
                        agent.starting_container_index = (cidx + 1) % num_containers;
                        advanced_cursor = true;
                    }
                }
                local_selected += 1;
            }
        }

        for id in deferred {
            if selected.len() >= num_spare {
                break;
            }
            selected.push(id);
        }

        if policy == DistributionPolicy::RoundRobin && num_agents > 0 {
            state.starting_agent_index = (state.starting_agent_index + 1) % num_agents;
        }

        debug!(
            "selected {} of {num_spare} spare containers: {selected:?}",
            selected.len()
        );
        selected
    }

    /// Group the alive chunk positions of a stripe by their serving agent.
    /// Used by CAR repair to decide which chunks an agent can partially
    /// encode locally.
    pub fn find_chunk_groups(&self, container_ids: &[i32], status: &[bool]) -> Vec<Vec<usize>> {
        let mut agent_to_group: HashMap<String, usize> = HashMap::new();
        let mut groups: Vec<Vec<usize>> = Vec::new();
        for (i, &id) in container_ids.iter().enumerate() {
            if !status.get(i).copied().unwrap_or(false) {
                continue;
            }
            let Some(addr) = self.container_owner(id) else {
                continue;
            };
            let group = *agent_to_group.entry(addr).or_insert_with(|| {
                groups.push(Vec::new());
                groups.len() - 1
            });
            groups[group].push(i);
        }
        groups
    }
}

fn utilization(usage: u64, capacity: u64) -> f64 {
    if capacity == 0 {
        1.0
    } else {
        usage as f64 / capacity as f64
    }
}
