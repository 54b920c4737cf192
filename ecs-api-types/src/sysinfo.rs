use serde::{Deserialize, Serialize};

/// Host resource snapshot exchanged over both wire protocols.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SysInfo {
    pub cpu_num: u8,
    /// Per-cpu utilization in percent, `cpu_num` entries.
    pub cpu_usage: Vec<f32>,
    /// Total memory in MiB.
    pub mem_total: u32,
    /// Free memory in MiB.
    pub mem_free: u32,
    /// Inbound network rate in MB/s.
    pub net_in: f64,
    /// Outbound network rate in MB/s.
    pub net_out: f64,
    pub host_type: u8,
}

impl SysInfo {
    /// Average cpu utilization across all cpus, in percent.
    pub fn avg_cpu_usage(&self) -> f32 {
        if self.cpu_usage.is_empty() {
            return 0.0;
        }
        self.cpu_usage.iter().sum::<f32>() / self.cpu_usage.len() as f32
    }
}
