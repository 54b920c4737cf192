//! Background redundancy: deferred acks, the background chunk writer and
//! the deferred-commit checker.

use ecs_api_types::{FileKey, FileStatus, INVALID_CONTAINER_ID};
use ecs_config::Config;
use ecstore::metastore::MetaStore;
use ecstore::testing::{HarnessParams, ProxyHarness};

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 256) as u8).collect()
}

fn bg_harness() -> ProxyHarness {
    let mut config = Config::default();
    config.background_write.ack_redundancy_in_background = true;
    ProxyHarness::new(config, HarnessParams::default())
}

fn latest(h: &ProxyHarness, name: &str) -> ecs_api_types::FileMeta {
    h.metastore
        .get_meta(&FileKey::new(0, name), -1)
        .unwrap()
        .unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn deferred_acks_complete_in_background() {
    let h = bg_harness();
    let handle = tokio::runtime::Handle::current();
    let data = pattern(2 << 20);

    // acknowledged after k chunks; the redundancy is still in flight
    h.proxy.write_file(0, "a", "", &data).await.unwrap();
    let meta = latest(&h, "a");
    assert_eq!(meta.status, FileStatus::BgTaskPending);
    assert!(meta.container_ids.iter().all(|&id| id != INVALID_CONTAINER_ID));

    // settle the queued background requests
    {
        let proxy = h.proxy.clone();
        let bg_tasks = h.bg_tasks.clone();
        let progress = h.progress.clone();
        let handle = handle.clone();
        tokio::task::spawn_blocking(move || {
            ecstore::server::drain_bg_tasks(&proxy, &handle, &bg_tasks, &progress);
        })
        .await
        .unwrap();
    }

    let meta = latest(&h, "a");
    assert_eq!(meta.status, FileStatus::AllBgTasksCompleted);
    assert_eq!(h.metastore.num_files_to_repair().unwrap(), 0);

    // the remaining write-journal records resolve as already committed
    let proxy = h.proxy.clone();
    tokio::task::spawn_blocking(move || {
        ecstore::server::trigger_journal_check(proxy, handle);
    })
    .await
    .unwrap();
    assert!(h
        .metastore
        .file_journal(&FileKey::new(0, "a"))
        .unwrap()
        .is_empty());

    // full redundancy: any two containers may fail afterwards
    let meta = latest(&h, "a");
    for position in [0usize, 2] {
        let ip = h
            .cluster
            .agent_of_container(meta.container_ids[position])
            .unwrap();
        h.cluster.set_agent_down(&ip);
    }
    let (_, read) = h.proxy.read_file(0, "a").await.unwrap();
    assert_eq!(read, data);
}

#[tokio::test(flavor = "multi_thread")]
async fn task_check_invalidates_lost_background_chunks() {
    let h = ProxyHarness::new(Config::default(), HarnessParams::default());
    let handle = tokio::runtime::Handle::current();
    let data = pattern(2 << 20);
    h.proxy.write_file(0, "a", "", &data).await.unwrap();
    let meta = latest(&h, "a");
    let key = FileKey::new(0, "a");

    // pretend chunk 3 was a background write that never landed
    let name = meta.chunks[3].chunk_name();
    assert!(h.cluster.remove_chunk(meta.container_ids[3], &name));
    h.metastore
        .update_file_status(&key, meta.version, FileStatus::BgTaskPending)
        .unwrap();
    h.metastore.mark_file_for_task_check(&key).unwrap();

    let proxy = h.proxy.clone();
    tokio::task::spawn_blocking(move || {
        ecstore::server::trigger_task_check(proxy, handle);
    })
    .await
    .unwrap();

    let meta = latest(&h, "a");
    assert_eq!(meta.status, FileStatus::AllBgTasksCompleted);
    assert_eq!(meta.container_ids[3], INVALID_CONTAINER_ID);
    // the damaged file is queued for repair
    assert_eq!(h.metastore.num_files_to_repair().unwrap(), 1);
}
