use ecs_api_types::FileKey;
use ecs_config::Config;
use ecstore::metastore::MetaStore;
use ecstore::testing::{HarnessParams, ProxyHarness};

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 256) as u8).collect()
}

fn harness() -> ProxyHarness {
    // stripe size is k * max_chunk_size = 2 MiB
    ProxyHarness::new(Config::default(), HarnessParams::default())
}

fn latest(h: &ProxyHarness, name: &str) -> ecs_api_types::FileMeta {
    h.metastore
        .get_meta(&FileKey::new(0, name), -1)
        .unwrap()
        .unwrap()
}

#[tokio::test]
async fn aligned_append_extends_the_file() {
    let h = harness();
    let first = pattern(2 << 20);
    h.proxy.write_file(0, "a", "", &first).await.unwrap();
    let v0 = latest(&h, "a");

    let second: Vec<u8> = pattern(2 << 20).iter().map(|b| b ^ 0xaa).collect();
    let new_size = h
        .proxy
        .append_file(0, "a", 2 << 20, &second)
        .await
        .unwrap();
    assert_eq!(new_size, 4 << 20);

    let v1 = latest(&h, "a");
    assert_eq!(v1.version, v0.version + 1);
    assert_eq!(v1.num_stripes, 2);

    let (_, read) = h.proxy.read_file(0, "a").await.unwrap();
    assert_eq!(&read[..2 << 20], &first[..]);
    assert_eq!(&read[2 << 20..], &second[..]);
}

#[tokio::test]
async fn misplaced_append_is_rejected() {
    let h = harness();
    h.proxy.write_file(0, "a", "", &pattern(2 << 20)).await.unwrap();

    // offset must be exactly the current size
    let err = h
        .proxy
        .append_file(0, "a", 1 << 20, &pattern(2 << 20))
        .await
        .unwrap_err();
    assert!(matches!(err, ecstore::ProxyError::InvalidArguments(_)));

    // a short append leaves the file unaligned; the next append fails
    h.proxy
        .append_file(0, "a", 2 << 20, &pattern(1 << 20))
        .await
        .unwrap();
    let err = h
        .proxy
        .append_file(0, "a", 3 << 20, &pattern(1 << 20))
        .await
        .unwrap_err();
    assert!(matches!(err, ecstore::ProxyError::InvalidArguments(_)));
}

#[tokio::test]
async fn appending_nothing_is_a_noop() {
    let h = harness();
    h.proxy.write_file(0, "a", "", &pattern(2 << 20)).await.unwrap();
    let before = latest(&h, "a");

    let size = h.proxy.append_file(0, "a", 2 << 20, &[]).await.unwrap();
    assert_eq!(size, 2 << 20);

    let after = latest(&h, "a");
    assert_eq!(after.version, before.version);
    assert_eq!(after.size, before.size);
}

#[tokio::test]
async fn unaligned_overwrite_patches_the_enclosing_stripes() {
    let h = harness();
    // 4 MiB file = stripes [0, 2 MiB) and [2 MiB, 4 MiB)
    let original = pattern(4 << 20);
    h.proxy.write_file(0, "a", "", &original).await.unwrap();

    // overwrite [1 MiB, 3 MiB): unaligned, crosses the stripe boundary
    let replacement = vec![0x5au8; 2 << 20];
    let end = h
        .proxy
        .overwrite_file(0, "a", 1 << 20, &replacement)
        .await
        .unwrap();
    assert_eq!(end, 3 << 20);

    let (_, read) = h.proxy.read_file(0, "a").await.unwrap();
    assert_eq!(&read[..1 << 20], &original[..1 << 20], "prefix unchanged");
    assert_eq!(&read[1 << 20..3 << 20], &replacement[..], "patched range");
    assert_eq!(&read[3 << 20..], &original[3 << 20..], "suffix unchanged");
}

#[tokio::test]
async fn overwrite_beyond_the_end_is_rejected() {
    let h = harness();
    h.proxy.write_file(0, "a", "", &pattern(2 << 20)).await.unwrap();
    let err = h
        .proxy
        .overwrite_file(0, "a", 1 << 20, &pattern(2 << 20))
        .await
        .unwrap_err();
    assert!(matches!(err, ecstore::ProxyError::InvalidArguments(_)));
}

#[tokio::test]
async fn mutations_bump_the_version_by_one() {
    let h = harness();
    h.proxy.write_file(0, "a", "", &pattern(2 << 20)).await.unwrap();
    assert_eq!(latest(&h, "a").version, 0);

    h.proxy
        .append_file(0, "a", 2 << 20, &pattern(2 << 20))
        .await
        .unwrap();
    assert_eq!(latest(&h, "a").version, 1);

    h.proxy
        .overwrite_file(0, "a", 0, &vec![1u8; 2 << 20])
        .await
        .unwrap();
    assert_eq!(latest(&h, "a").version, 2);

    h.proxy.write_file(0, "a", "", &pattern(1 << 20)).await.unwrap();
    assert_eq!(latest(&h, "a").version, 3);
}

#[tokio::test]
async fn versioned_mode_keeps_history() {
    let mut config = Config::default();
    config.misc.overwrite_files = false;
    let h = ProxyHarness::new(config, HarnessParams::default());

    h.proxy.write_file(0, "a", "", &pattern(2 << 20)).await.unwrap();
    let patch = vec![7u8; 2 << 20];
    h.proxy.overwrite_file(0, "a", 0, &patch).await.unwrap();

    // both versions remain addressable
    let key = FileKey::new(0, "a");
    assert!(h.metastore.get_meta(&key, 0).unwrap().is_some());
    let v1 = h.metastore.get_meta(&key, 1).unwrap().unwrap();
    assert_eq!(v1.version, 1);

    let (_, read) = h.proxy.read_file(0, "a").await.unwrap();
    assert_eq!(read, patch);
}
