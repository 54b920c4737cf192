//! Proxy configuration.
//!
//! The configuration is a TOML file with one table per concern; every option
//! has a default so a missing table or key never fails the load. Storage
//! classes live in their own file (see [`storage_class`]).

use std::path::Path;

use anyhow::{Context, Error};
use serde::Deserialize;

use ecs_api_types::{ChunkScanSamplingPolicy, DistributionPolicy};

mod storage_class;

pub use storage_class::{StorageClassConfig, StorageClassRegistry};

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProxySection {
    /// Number of this proxy instance within the deployment.
    pub num: u32,
    pub namespace_id: u8,
    /// Address the client interface binds to.
    pub interface: String,
    /// Address of the agent coordinator endpoint.
    pub ip: String,
    pub coord_port: u16,
    /// Path of the storage class definition file.
    pub storage_class_path: String,
}

impl Default for ProxySection {
    fn default() -> Self {
        Self {
            num: 1,
            namespace_id: 0,
            interface: "127.0.0.1".to_string(),
            ip: "127.0.0.1".to_string(),
            coord_port: 57002,
            storage_class_path: "storage_classes.toml".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MetaStoreSection {
    /// Store backend: "memory" ships in-tree; external stores plug in
    /// behind the same trait.
    #[serde(rename = "type")]
    pub store_type: String,
    pub ip: String,
    pub port: u16,
}

impl Default for MetaStoreSection {
    fn default() -> Self {
        Self {
            store_type: "memory".to_string(),
            ip: "127.0.0.1".to_string(),
            port: 6379,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RecoverySection {
    pub trigger_enabled: bool,
    /// Seconds a file must stay unmodified before it is eligible for repair.
    pub trigger_start_interval: u64,
    /// File scan cadence in seconds; 0 disables the scan.
    pub scan_interval: u64,
    /// Chunk checksum scan cadence in seconds; 0 disables the scan.
    pub scan_chunk_interval: u64,
    pub scan_chunk_batch_size: usize,
    /// Files repaired per worker tick.
    pub batch_size: usize,
    pub chunk_scan_sampling_policy: ChunkScanSamplingPolicy,
    pub chunk_scan_sampling_rate: f64,
}

impl Default for RecoverySection {
    fn default() -> Self {
        Self {
            trigger_enabled: true,
            trigger_start_interval: 300,
            scan_interval: 30,
            scan_chunk_interval: 0,
            scan_chunk_batch_size: 1024,
            batch_size: 8,
            chunk_scan_sampling_policy: ChunkScanSamplingPolicy::None,
            chunk_scan_sampling_rate: 1.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MiscSection {
    pub num_workers: usize,
    /// I/O threads of the agent transport.
    pub io_threads: usize,
    pub repair_at_proxy: bool,
    pub repair_using_car: bool,
    /// When set, a mutating operation replaces the previous version instead
    /// of creating a new one.
    pub overwrite_files: bool,
    pub reuse_data_connection: bool,
    /// Seconds an agent liveness result stays fresh.
    pub liveness_cache_time: u64,
    /// Journal reconciler cadence in seconds; 0 disables the reconciler.
    pub journal_check_interval: u64,
    /// Agents registered at startup, as "ip:port" entries.
    pub agent_list: Vec<String>,
}

impl Default for MiscSection {
    fn default() -> Self {
        Self {
            num_workers: 4,
            io_threads: 1,
            repair_at_proxy: true,
            repair_using_car: false,
            overwrite_files: true,
            reuse_data_connection: false,
            liveness_cache_time: 5,
            journal_check_interval: 0,
            agent_list: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DataDistributionSection {
    pub policy: DistributionPolicy,
    /// IP prefixes considered "near" under the static policy.
    pub near_ip_ranges: Vec<String>,
}

impl Default for DataDistributionSection {
    fn default() -> Self {
        Self {
            policy: DistributionPolicy::Static,
            near_ip_ranges: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackgroundWriteSection {
    pub write_redundancy_in_background: bool,
    pub ack_redundancy_in_background: bool,
    pub num_background_chunk_worker: usize,
    pub background_task_check_interval: u64,
}

impl Default for BackgroundWriteSection {
    fn default() -> Self {
        Self {
            write_redundancy_in_background: false,
            ack_redundancy_in_background: false,
            num_background_chunk_worker: 1,
            background_task_check_interval: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InterfaceSection {
    pub num_workers: usize,
    pub port: u16,
}

impl Default for InterfaceSection {
    fn default() -> Self {
        Self {
            num_workers: 4,
            port: 59001,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StagingSection {
    pub enabled: bool,
    /// Local staging area, e.g. "file:///var/lib/ecstore/staging".
    pub url: String,
    pub autoclean_policy: String,
    pub autoclean_scan_interval: u64,
    pub autoclean_num_days_expire: u64,
    /// Writeback policy: "none", "immediate", "scheduled" or "idle".
    pub bgwrite_policy: String,
    pub bgwrite_scan_interval: u64,
    /// "HH:MM" start time under the scheduled policy.
    pub bgwrite_scheduled_time: String,
}

impl Default for StagingSection {
    fn default() -> Self {
        Self {
            enabled: false,
            url: "file:///var/lib/ecstore/staging".to_string(),
            autoclean_policy: "none".to_string(),
            autoclean_scan_interval: 86400,
            autoclean_num_days_expire: 30,
            bgwrite_policy: "immediate".to_string(),
            bgwrite_scan_interval: 60,
            bgwrite_scheduled_time: "03:00".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySection {
    /// Attempts for advisory lock acquisition and chunk request retries.
    pub num: u32,
    /// Back-off between attempts in milliseconds.
    pub interval: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            num: 5,
            interval: 100,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NetworkSection {
    pub listen_all_ips: bool,
    pub tcp_keep_alive: bool,
    pub tcp_buffer_size: usize,
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            listen_all_ips: false,
            tcp_keep_alive: true,
            tcp_buffer_size: 256 * 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct DataIntegritySection {
    pub verify_chunk_checksum: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FailureDetectionSection {
    /// Agent receive timeout in milliseconds.
    pub timeout: u64,
}

impl Default for FailureDetectionSection {
    fn default() -> Self {
        Self { timeout: 10_000 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EventSection {
    /// Coordinator event probe timeout in milliseconds.
    pub event_probe_timeout: u64,
}

impl Default for EventSection {
    fn default() -> Self {
        Self {
            event_probe_timeout: 1_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub proxy: ProxySection,
    pub metastore: MetaStoreSection,
    pub recovery: RecoverySection,
    pub misc: MiscSection,
    pub data_distribution: DataDistributionSection,
    pub background_write: BackgroundWriteSection,
    pub interface: InterfaceSection,
    pub staging: StagingSection,
    pub retry: RetrySection,
    pub network: NetworkSection,
    pub data_integrity: DataIntegritySection,
    pub failure_detection: FailureDetectionSection,
    pub event: EventSection,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {path:?}"))?;
        let config: Config = toml::from_str(&raw)
            .with_context(|| format!("unable to parse config file {path:?}"))?;
        Ok(config)
    }

    /// Address the client interface listens on.
    pub fn client_listen_addr(&self) -> String {
        let host = if self.network.listen_all_ips {
            "0.0.0.0"
        } else {
            &self.proxy.interface
        };
        format!("{}:{}", host, self.interface.port)
    }

    /// Address the agent coordinator listens on.
    pub fn coordinator_listen_addr(&self) -> String {
        let host = if self.network.listen_all_ips {
            "0.0.0.0"
        } else {
            &self.proxy.ip
        };
        format!("{}:{}", host, self.proxy.coord_port)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_cover_missing_sections() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.retry.num, 5);
        assert_eq!(config.misc.liveness_cache_time, 5);
        assert!(config.misc.overwrite_files);
        assert!(!config.staging.enabled);
        assert_eq!(config.recovery.batch_size, 8);
        assert_eq!(
            config.recovery.chunk_scan_sampling_policy,
            ChunkScanSamplingPolicy::None
        );
    }

    #[test]
    fn partial_sections_merge_with_defaults() {
        let raw = r#"
            [misc]
            overwrite_files = false
            repair_using_car = true

            [data_distribution]
            policy = "round-robin"

            [failure_detection]
            timeout = 2500
        "#;
        let config: Config = toml::from_str(raw).unwrap();
        assert!(!config.misc.overwrite_files);
        assert!(config.misc.repair_using_car);
        assert_eq!(config.data_distribution.policy, DistributionPolicy::RoundRobin);
        assert_eq!(config.failure_detection.timeout, 2500);
        // untouched sections keep their defaults
        assert_eq!(config.interface.port, 59001);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(toml::from_str::<Config>("[misc]\nno_such_option = 1\n").is_err());
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[interface]\nport = 12345").unwrap();
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.interface.port, 12345);
        assert_eq!(config.client_listen_addr(), "127.0.0.1:12345");
    }
}
