use ecs_api_types::FileKey;
use ecs_config::Config;
use ecstore::metastore::MetaStore;
use ecstore::testing::{HarnessParams, ProxyHarness};

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 256) as u8).collect()
}

fn harness() -> ProxyHarness {
    ProxyHarness::new(Config::default(), HarnessParams::default())
}

fn latest(h: &ProxyHarness, name: &str) -> ecs_api_types::FileMeta {
    h.metastore
        .get_meta(&FileKey::new(0, name), -1)
        .unwrap()
        .unwrap()
}

#[tokio::test]
async fn copy_preserves_content_digest_and_policy() {
    let h = harness();
    let data = pattern(3 << 20);
    h.proxy.write_file(0, "src", "", &data).await.unwrap();
    let src = latest(&h, "src");

    let copied = h.proxy.copy_file(0, "src", "dst").await.unwrap();
    assert_eq!(copied, data.len() as u64);

    let dst = latest(&h, "dst");
    assert_eq!(dst.md5, src.md5);
    assert_eq!(dst.size, src.size);
    assert_eq!(dst.storage_class, src.storage_class);
    assert_eq!(dst.coding.params(), src.coding.params());
    assert_ne!(dst.uuid, src.uuid);

    let (_, read) = h.proxy.read_file(0, "dst").await.unwrap();
    assert_eq!(read, data);

    // the source is untouched
    let (_, read) = h.proxy.read_file(0, "src").await.unwrap();
    assert_eq!(read, data);
}

#[tokio::test]
async fn rename_changes_only_the_name() {
    let h = harness();
    let data = pattern(2 << 20);
    h.proxy.write_file(0, "old", "", &data).await.unwrap();
    let before = latest(&h, "old");

    h.proxy.rename_file(0, "old", "new").await.unwrap();

    assert!(h
        .metastore
        .get_meta(&FileKey::new(0, "old"), -1)
        .unwrap()
        .is_none());
    let after = latest(&h, "new");
    assert_eq!(after.uuid, before.uuid);
    assert_eq!(after.chunks, before.chunks);
    assert_eq!(after.container_ids, before.container_ids);

    let (_, read) = h.proxy.read_file(0, "new").await.unwrap();
    assert_eq!(read, data);

    // renaming over an existing file is refused
    h.proxy.write_file(0, "other", "", &data).await.unwrap();
    let err = h.proxy.rename_file(0, "new", "other").await.unwrap_err();
    assert!(matches!(err, ecstore::ProxyError::MetadataConflict(_)));
}

#[tokio::test]
async fn delete_removes_metadata_and_chunks() {
    let h = harness();
    let data = pattern(2 << 20);
    h.proxy.write_file(0, "a", "", &data).await.unwrap();
    let meta = latest(&h, "a");

    h.proxy.delete_file(0, "a").await.unwrap();

    assert!(h
        .metastore
        .get_meta(&FileKey::new(0, "a"), -1)
        .unwrap()
        .is_none());
    for &id in &meta.container_ids {
        assert_eq!(h.cluster.num_chunks(id), 0);
    }
    assert!(matches!(
        h.proxy.read_file(0, "a").await.unwrap_err(),
        ecstore::ProxyError::NotFound
    ));
}

#[tokio::test]
async fn delete_skips_chunks_on_dead_containers() {
    let h = harness();
    let data = pattern(2 << 20);
    h.proxy.write_file(0, "a", "", &data).await.unwrap();
    let meta = latest(&h, "a");

    let ip = h.cluster.agent_of_container(meta.container_ids[0]).unwrap();
    h.cluster.set_agent_down(&ip);

    h.proxy.delete_file(0, "a").await.unwrap();

    // the orphan on the dead container survives the delete
    h.cluster.set_agent_up(&ip);
    assert_eq!(h.cluster.num_chunks(meta.container_ids[0]), 1);
    for &id in &meta.container_ids[1..] {
        assert_eq!(h.cluster.num_chunks(id), 0);
    }
}

#[tokio::test]
async fn listing_honors_namespace_and_prefix() {
    let h = harness();
    let data = pattern(1 << 20);
    h.proxy.write_file(0, "docs/a", "", &data).await.unwrap();
    h.proxy.write_file(0, "docs/b", "", &data).await.unwrap();
    h.proxy.write_file(0, "media/c", "", &data).await.unwrap();
    h.proxy.write_file(1, "docs/d", "", &data).await.unwrap();

    let all = h.proxy.list_files(0, "", false).unwrap();
    assert_eq!(all.len(), 3);
    let docs = h.proxy.list_files(0, "docs/", false).unwrap();
    assert_eq!(docs.len(), 2);
    assert!(docs.iter().all(|f| f.name.starts_with("docs/")));
    assert_eq!(h.proxy.list_files(1, "", false).unwrap().len(), 1);

    let folders = h.proxy.list_folders(0, "").unwrap();
    assert_eq!(folders, vec!["docs/".to_string(), "media/".to_string()]);
}

#[tokio::test]
async fn capacity_and_repair_stats_report() {
    let h = harness();
    let data = pattern(2 << 20);
    h.proxy.write_file(0, "a", "", &data).await.unwrap();

    // refresh container usage from the agents
    h.coordinator.update_agent_status().await;
    let (usage, capacity) = h.proxy.get_storage_usage();
    assert!(usage > 0);
    assert!(capacity >= usage);

    let (count, limit) = h.proxy.get_file_count_and_limit().unwrap();
    assert_eq!(count, 1);
    assert!(limit >= count);

    let (files, to_repair) = h.proxy.get_num_files_to_repair().unwrap();
    assert_eq!(files, 1);
    assert_eq!(to_repair, 0);

    let agents = h.proxy.get_agent_status();
    assert_eq!(agents.len(), 6);
    assert!(agents.iter().all(|a| a.alive));
}
