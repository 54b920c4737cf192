//! Deduplication hook.
//!
//! The write path offers every payload to a [`Deduplication`] implementation
//! before encoding. The shipped implementation stores everything; real
//! deduplication can plug in behind the trait without touching the
//! pipelines.

/// Outcome of scanning a payload: the bytes to store plus an opaque commit
/// handle resolved after the metadata commit.
pub struct DedupScan {
    pub data_to_store: Vec<u8>,
    pub commit_id: Option<String>,
}

pub trait Deduplication: Send + Sync {
    /// Inspect a payload before it is encoded; returns what must actually
    /// be stored.
    fn scan(&self, namespace_id: u8, name: &str, data: &[u8]) -> DedupScan;

    /// The metadata of the operation committed.
    fn commit(&self, commit_id: &str);

    /// The operation failed after scanning; release any tracked state.
    fn abort(&self, commit_id: &str);
}

/// Reference implementation: no deduplication at all.
#[derive(Default)]
pub struct DedupNone;

impl Deduplication for DedupNone {
    fn scan(&self, _namespace_id: u8, _name: &str, data: &[u8]) -> DedupScan {
        DedupScan {
            data_to_store: data.to_vec(),
            commit_id: None,
        }
    }

    fn commit(&self, _commit_id: &str) {}

    fn abort(&self, _commit_id: &str) {}
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn none_stores_everything() {
        let dedup = DedupNone;
        let scan = dedup.scan(0, "a", b"payload");
        assert_eq!(scan.data_to_store, b"payload");
        assert!(scan.commit_id.is_none());
    }
}
