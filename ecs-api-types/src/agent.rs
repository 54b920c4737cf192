use serde::{Deserialize, Serialize};

use crate::SysInfo;

/// Storage backend type of a container, as reported by its agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContainerType {
    Fs,
    Ali,
    Aws,
    Azure,
    Unknown,
}

impl Default for ContainerType {
    fn default() -> Self {
        ContainerType::Unknown
    }
}

impl ContainerType {
    pub fn to_u8(self) -> u8 {
        match self {
            ContainerType::Fs => 0,
            ContainerType::Ali => 1,
            ContainerType::Aws => 2,
            ContainerType::Azure => 3,
            ContainerType::Unknown => 255,
        }
    }

    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => ContainerType::Fs,
            1 => ContainerType::Ali,
            2 => ContainerType::Aws,
            3 => ContainerType::Azure,
            _ => ContainerType::Unknown,
        }
    }
}

/// Host environment an agent runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HostType {
    OnPrem,
    Ali,
    Aws,
    Azure,
    Tencent,
    Gcp,
    Huawei,
    Unknown,
}

impl Default for HostType {
    fn default() -> Self {
        HostType::Unknown
    }
}

impl HostType {
    pub fn to_u8(self) -> u8 {
        match self {
            HostType::OnPrem => 0,
            HostType::Ali => 1,
            HostType::Aws => 2,
            HostType::Azure => 3,
            HostType::Tencent => 4,
            HostType::Gcp => 5,
            HostType::Huawei => 6,
            HostType::Unknown => 255,
        }
    }

    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => HostType::OnPrem,
            1 => HostType::Ali,
            2 => HostType::Aws,
            3 => HostType::Azure,
            4 => HostType::Tencent,
            5 => HostType::Gcp,
            6 => HostType::Huawei,
            _ => HostType::Unknown,
        }
    }
}

/// One container as registered by an agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub id: i32,
    pub container_type: ContainerType,
    pub usage: u64,
    pub capacity: u64,
}

/// Registration request payload sent by an agent to the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRegistration {
    pub ip: String,
    pub coord_port: u16,
    pub host_type: HostType,
    pub containers: Vec<ContainerInfo>,
}

impl AgentRegistration {
    /// Address the proxy uses to reach the agent's chunk service.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.ip, self.coord_port)
    }
}

/// Per-agent status snapshot reported to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStatus {
    pub ip: String,
    pub alive: bool,
    pub host_type: HostType,
    pub sysinfo: SysInfo,
    pub containers: Vec<ContainerInfo>,
}
