//! Shared fixture for the chunk-manager unit tests: an in-process agent
//! cluster wired to a real coordinator, metastore and chunk manager.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Receiver;

use ecs_api_types::{CodingMeta, CodingScheme, DistributionPolicy, FileMeta};
use ecs_client::{ChunkClient, Transport};
use ecs_coding::CodingRegistry;

pub(crate) use crate::metastore::MetaStore;

use crate::coordinator::ProxyCoordinator;
use crate::metastore::MemoryMetaStore;
use crate::testing::MemoryCluster;

use super::{BgChunkTask, ChunkManager, ChunkManagerOptions};

pub(crate) struct TestEnv {
    pub cluster: Arc<MemoryCluster>,
    pub coordinator: Arc<ProxyCoordinator>,
    pub metastore: Arc<MemoryMetaStore>,
    pub manager: ChunkManager,
    pub bg_tasks: Receiver<BgChunkTask>,
    coding: CodingMeta,
}

pub(crate) fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 256) as u8).collect()
}

impl TestEnv {
    pub async fn new(n: u8, k: u8, f: u8) -> Self {
        Self::new_with(n, k, f, |_| {}).await
    }

    /// Build a cluster of `n + 2` single-container agents and a chunk
    /// manager with tweaked options.
    pub async fn new_with(
        n: u8,
        k: u8,
        f: u8,
        configure: impl FnOnce(&mut ChunkManagerOptions),
    ) -> Self {
        let mut opts = ChunkManagerOptions {
            repair_at_proxy: true,
            ..Default::default()
        };
        configure(&mut opts);

        let cluster = MemoryCluster::new();
        let transport: Arc<dyn Transport> = cluster.clone();
        let containers = ecs_client::new_container_map();
        let coordinator = Arc::new(ProxyCoordinator::new(
            transport.clone(),
            containers.clone(),
            DistributionPolicy::Static,
            vec!["10.0.".to_string()],
            Duration::ZERO,
        ));
        for i in 0..(n as usize + 2) {
            let reg = cluster.add_agent(&format!("10.0.0.{}", i + 1), 1, 1 << 30);
            coordinator.register_agent(reg).unwrap();
        }

        let metastore = Arc::new(MemoryMetaStore::new());
        let registry = Arc::new(CodingRegistry::new(opts.repair_using_car));
        let client = Arc::new(ChunkClient::new(transport, containers));
        let (sender, bg_tasks) = crossbeam_channel::unbounded();
        let manager = ChunkManager::new(
            client,
            registry,
            metastore.clone(),
            coordinator.clone(),
            Some(sender),
            opts,
        );

        Self {
            cluster,
            coordinator,
            metastore,
            manager,
            bg_tasks,
            coding: CodingMeta::new(CodingScheme::ReedSolomon, n, k, f, 1 << 20),
        }
    }

    /// A file record ready for stripe writes, with chunk slots allocated.
    pub fn new_file(&self, name: &str, size: u64) -> FileMeta {
        let mut file = FileMeta::new(0, name);
        file.regen_uuid();
        file.size = size;
        file.storage_class = "standard".to_string();
        file.coding = self.coding.clone();
        let stripe_size =
            self.coding.max_chunk_size as u64 * self.coding.k as u64;
        file.num_stripes = ((size + stripe_size - 1) / stripe_size).max(1) as u32;
        file.init_chunks(file.num_stripes as usize * self.coding.n as usize);
        file
    }

    pub async fn spare_containers(&self, file: &FileMeta, want: usize) -> Vec<i32> {
        self.coordinator
            .find_spare_containers(&[], &[], want, file.size, &file.coding)
            .await
    }

    pub async fn container_status(&self, file: &FileMeta) -> Vec<bool> {
        self.coordinator
            .check_container_liveness(&file.container_ids, true, false)
            .await
            .0
    }
}
