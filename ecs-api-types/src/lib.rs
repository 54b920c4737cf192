//! Shared data types of the ecstore proxy.
//!
//! Everything here is plain data: the coordinator, chunk manager, metadata
//! store and wire interfaces all exchange these records, so they live in a
//! leaf crate without any I/O dependencies.

use serde::{Deserialize, Serialize};

mod agent;
mod file;
mod sysinfo;

pub use agent::*;
pub use file::*;
pub use sysinfo::*;

/// Container id marking a chunk position as lost or not yet assigned.
pub const INVALID_CONTAINER_ID: i32 = -1;
/// Container id marking a chunk position that is intentionally not backed
/// by any container (e.g. padding positions of a partial stripe).
pub const UNUSED_CONTAINER_ID: i32 = -2;

/// Version selector addressing the most recent version of a file.
pub const LATEST_VERSION: i32 = -1;

/// Upper bound on the number of containers a single agent may register.
pub const MAX_NUM_CONTAINERS_PER_AGENT: usize = 16;

pub const MD5_DIGEST_LENGTH: usize = 16;

/// Erasure-coding scheme identifiers, persisted in file metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CodingScheme {
    ReedSolomon,
    Unknown,
}

impl CodingScheme {
    pub fn to_u8(self) -> u8 {
        match self {
            CodingScheme::ReedSolomon => 0,
            CodingScheme::Unknown => 255,
        }
    }

    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => CodingScheme::ReedSolomon,
            _ => CodingScheme::Unknown,
        }
    }
}

impl std::str::FromStr for CodingScheme {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rs" | "reed-solomon" => Ok(CodingScheme::ReedSolomon),
            other => Err(format!("unknown coding scheme '{other}'")),
        }
    }
}

impl std::fmt::Display for CodingScheme {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            CodingScheme::ReedSolomon => write!(f, "rs"),
            CodingScheme::Unknown => write!(f, "unknown"),
        }
    }
}

/// Container selection policy of the placement coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DistributionPolicy {
    Static,
    RoundRobin,
    LeastUsed,
}

impl Default for DistributionPolicy {
    fn default() -> Self {
        DistributionPolicy::Static
    }
}

impl std::str::FromStr for DistributionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "static" => Ok(DistributionPolicy::Static),
            "round-robin" | "rr" => Ok(DistributionPolicy::RoundRobin),
            "least-used" | "lu" => Ok(DistributionPolicy::LeastUsed),
            other => Err(format!("unknown distribution policy '{other}'")),
        }
    }
}

/// Sampling policy of the background chunk-checksum scanner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChunkScanSamplingPolicy {
    None,
    ChunkLevel,
    StripeLevel,
    FileLevel,
    ContainerLevel,
}

impl Default for ChunkScanSamplingPolicy {
    fn default() -> Self {
        ChunkScanSamplingPolicy::None
    }
}

impl std::str::FromStr for ChunkScanSamplingPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(ChunkScanSamplingPolicy::None),
            "chunk" => Ok(ChunkScanSamplingPolicy::ChunkLevel),
            "stripe" => Ok(ChunkScanSamplingPolicy::StripeLevel),
            "file" => Ok(ChunkScanSamplingPolicy::FileLevel),
            "container" => Ok(ChunkScanSamplingPolicy::ContainerLevel),
            other => Err(format!("unknown sampling policy '{other}'")),
        }
    }
}

/// Background-commit progress of a file write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FileStatus {
    None,
    BgTaskPending,
    PartBgTaskCompleted,
    AllBgTasksCompleted,
}

impl Default for FileStatus {
    fn default() -> Self {
        FileStatus::None
    }
}

/// Coding parameters of a file, snapshotted from its storage class at write
/// time. Immutable for the lifetime of a `(name, version)` pair.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodingMeta {
    pub scheme: Option<CodingScheme>,
    pub n: u8,
    pub k: u8,
    /// Placement constraint: tolerated agent failures. Limits the number of
    /// chunks placed per agent to `(n - k) / f` when non-zero.
    pub f: u8,
    pub max_chunk_size: u32,
    /// Scheme-specific state, `state_size * num_stripes` bytes when present.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub state: Vec<u8>,
}

impl CodingMeta {
    pub fn new(scheme: CodingScheme, n: u8, k: u8, f: u8, max_chunk_size: u32) -> Self {
        Self {
            scheme: Some(scheme),
            n,
            k,
            f,
            max_chunk_size,
            state: Vec::new(),
        }
    }

    pub fn scheme(&self) -> CodingScheme {
        self.scheme.unwrap_or(CodingScheme::Unknown)
    }

    /// Copy the parameters but not the per-file coding state.
    pub fn params(&self) -> Self {
        Self {
            scheme: self.scheme,
            n: self.n,
            k: self.k,
            f: self.f,
            max_chunk_size: self.max_chunk_size,
            state: Vec::new(),
        }
    }
}

impl std::fmt::Display for CodingMeta {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "scheme = {}, n = {}, k = {}, f = {}, max chunk size = {}",
            self.scheme(),
            self.n,
            self.k,
            self.f,
            self.max_chunk_size
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn coding_scheme_round_trip() {
        assert_eq!(
            CodingScheme::from_u8(CodingScheme::ReedSolomon.to_u8()),
            CodingScheme::ReedSolomon
        );
        assert_eq!("rs".parse::<CodingScheme>().unwrap(), CodingScheme::ReedSolomon);
        assert!("lrc".parse::<CodingScheme>().is_err());
    }

    #[test]
    fn coding_meta_params_drop_state() {
        let mut meta = CodingMeta::new(CodingScheme::ReedSolomon, 4, 2, 1, 1 << 20);
        meta.state = vec![1, 2, 3];
        let params = meta.params();
        assert!(params.state.is_empty());
        assert_eq!(params.n, 4);
        assert_eq!(params.k, 2);
    }
}
