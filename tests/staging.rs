use ecs_api_types::FileKey;
use ecs_config::Config;
use ecstore::metastore::MetaStore;
use ecstore::testing::{HarnessParams, ProxyHarness};

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 256) as u8).collect()
}

fn staged_harness(dir: &tempfile::TempDir) -> ProxyHarness {
    let mut config = Config::default();
    config.staging.enabled = true;
    config.staging.url = format!("file://{}", dir.path().display());
    config.staging.bgwrite_policy = "immediate".to_string();
    // no modification grace period, so writeback runs immediately in tests
    config.staging.bgwrite_scan_interval = 0;
    ProxyHarness::new(config, HarnessParams::default())
}

#[tokio::test(flavor = "multi_thread")]
async fn staged_write_acks_before_backend_write() {
    let dir = tempfile::tempdir().unwrap();
    let h = staged_harness(&dir);
    let data = pattern(2 << 20);

    h.proxy.write_file(0, "a", "", &data).await.unwrap();

    // acknowledged, readable, but no chunk has reached any agent yet
    let (_, read) = h.proxy.read_file(0, "a").await.unwrap();
    assert_eq!(read, data);
    for id in 1..=6 {
        assert_eq!(h.cluster.num_chunks(id), 0);
    }
    let key = FileKey::new(0, "a");
    let meta = h.metastore.get_meta(&key, -1).unwrap().unwrap();
    assert!(meta.staged.is_some());
    assert_eq!(h.metastore.files_for_writeback().unwrap(), vec![key]);
}

#[tokio::test(flavor = "multi_thread")]
async fn writeback_moves_staged_data_to_the_backend() {
    let dir = tempfile::tempdir().unwrap();
    let h = staged_harness(&dir);
    let data = pattern(2 << 20);
    h.proxy.write_file(0, "a", "", &data).await.unwrap();

    let handle = tokio::runtime::Handle::current();
    let proxy = h.proxy.clone();
    tokio::task::spawn_blocking(move || {
        ecstore::server::trigger_writeback(proxy, handle);
    })
    .await
    .unwrap();

    let key = FileKey::new(0, "a");
    assert!(h.metastore.files_for_writeback().unwrap().is_empty());
    let meta = h.metastore.get_meta(&key, -1).unwrap().unwrap();
    assert!(meta.staged.is_none());
    assert!(meta.container_ids.iter().all(|&id| id > 0));

    // with the staged marker gone, reads now decode from the backend
    let (_, read) = h.proxy.read_file(0, "a").await.unwrap();
    assert_eq!(read, data);
}

#[tokio::test(flavor = "multi_thread")]
async fn staged_append_updates_the_staged_copy() {
    let dir = tempfile::tempdir().unwrap();
    let h = staged_harness(&dir);
    let first = pattern(1 << 20);
    h.proxy.write_file(0, "a", "", &first).await.unwrap();

    let second = vec![0x77u8; 1 << 20];
    let new_size = h
        .proxy
        .append_file(0, "a", 1 << 20, &second)
        .await
        .unwrap();
    assert_eq!(new_size, 2 << 20);

    let (_, read) = h.proxy.read_file(0, "a").await.unwrap();
    assert_eq!(&read[..1 << 20], &first[..]);
    assert_eq!(&read[1 << 20..], &second[..]);
}
