//! The ecstore proxy daemon.

use std::sync::Arc;

use anyhow::{bail, Context, Error};
use log::{error, info};

use ecs_client::{ChunkClient, TcpTransport, Transport};
use ecs_coding::CodingRegistry;
use ecs_config::{Config, StorageClassRegistry};

use ecstore::api::run_client_interface;
use ecstore::chunk_manager::{ChunkManager, ChunkManagerOptions};
use ecstore::coordinator::{run_coordinator_listener, ProxyCoordinator};
use ecstore::metastore::{MemoryMetaStore, MetaStore};
use ecstore::proxy::Proxy;
use ecstore::server::{BgTaskProgress, Workers};
use ecstore::staging::Staging;
use ecstore::tools::RunningFlag;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(err) = run() {
        error!("ecstore-proxy failed to start - {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Error> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "ecstore.toml".to_string());
    let config = Arc::new(
        Config::load(&config_path).with_context(|| format!("loading {config_path}"))?,
    );
    let classes = StorageClassRegistry::load(&config.proxy.storage_class_path)
        .with_context(|| format!("loading {}", config.proxy.storage_class_path))?;

    let metastore: Arc<dyn MetaStore> = match config.metastore.store_type.as_str() {
        "memory" => Arc::new(MemoryMetaStore::new()),
        other => bail!("unsupported metadata store type '{other}'"),
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.misc.num_workers.max(1))
        .enable_all()
        .build()
        .context("building the async runtime")?;

    let transport: Arc<dyn Transport> = Arc::new(TcpTransport::new(
        std::time::Duration::from_millis(config.failure_detection.timeout),
        config.misc.reuse_data_connection,
    ));
    let containers = ecs_client::new_container_map();
    let coordinator = Arc::new(ProxyCoordinator::new(
        transport.clone(),
        containers.clone(),
        config.data_distribution.policy,
        config.data_distribution.near_ip_ranges.clone(),
        std::time::Duration::from_secs(config.misc.liveness_cache_time),
    ));

    let registry = Arc::new(CodingRegistry::new(config.misc.repair_using_car));
    let client = Arc::new(ChunkClient::new(transport, containers));
    let (bg_sender, bg_tasks) = crossbeam_channel::unbounded();
    let chunk_manager = Arc::new(ChunkManager::new(
        client,
        registry,
        metastore.clone(),
        coordinator.clone(),
        Some(bg_sender),
        ChunkManagerOptions {
            verify_chunk_checksum: config.data_integrity.verify_chunk_checksum,
            ack_redundancy_in_background: config.background_write.ack_redundancy_in_background,
            write_redundancy_in_background: config.background_write.write_redundancy_in_background,
            repair_at_proxy: config.misc.repair_at_proxy,
            repair_using_car: config.misc.repair_using_car,
        },
    ));

    let staging = if config.staging.enabled {
        Some(Arc::new(
            Staging::open(&config.staging.url).context("opening the staging area")?,
        ))
    } else {
        None
    };

    let progress = BgTaskProgress::new();
    let proxy = Arc::new(Proxy::new(
        config.clone(),
        classes,
        metastore,
        coordinator.clone(),
        chunk_manager,
        staging,
        progress.clone(),
    ));

    let running = RunningFlag::new();

    // bind both listeners before declaring the daemon up
    let (client_listener, coord_listener) = runtime.block_on(async {
        let client_listener = tokio::net::TcpListener::bind(config.client_listen_addr())
            .await
            .with_context(|| format!("binding client interface {}", config.client_listen_addr()))?;
        let coord_listener = tokio::net::TcpListener::bind(config.coordinator_listen_addr())
            .await
            .with_context(|| {
                format!("binding coordinator {}", config.coordinator_listen_addr())
            })?;
        Ok::<_, Error>((client_listener, coord_listener))
    })?;

    let workers = Workers::start(
        proxy.clone(),
        runtime.handle().clone(),
        bg_tasks,
        progress,
        running.clone(),
    );

    runtime.block_on(async {
        tokio::spawn(run_coordinator_listener(
            coordinator.clone(),
            coord_listener,
            running.clone(),
        ));
        tokio::spawn(run_client_interface(
            proxy.clone(),
            client_listener,
            running.clone(),
        ));

        if !config.misc.agent_list.is_empty() {
            coordinator.register_preset_agents(&config.misc.agent_list).await;
        }

        info!(
            "ecstore-proxy {} up (namespace {})",
            config.proxy.num, config.proxy.namespace_id
        );
        tokio::signal::ctrl_c()
            .await
            .context("waiting for shutdown signal")?;
        info!("shutdown requested");
        running.shutdown();
        Ok::<_, Error>(())
    })?;

    workers.shutdown();
    info!("ecstore-proxy stopped");
    Ok(())
}
