//! In-memory reference implementation of the metadata contract.
//!
//! Records are kept as serialized JSON values the way an external KV store
//! would hold them, so the serialization path is exercised even in tests.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use ecs_api_types::{
    FileInfo, FileKey, FileMeta, FileStatus, JournalOp, JournalPhase, JournalRecord,
    LATEST_VERSION,
};

use super::{MetaStore, MetaStoreError, Result};

const DEFAULT_FILE_LIMIT: u64 = 1 << 20;

#[derive(Default)]
struct State {
    /// `ns/name` -> version -> serialized metadata record.
    files: HashMap<String, BTreeMap<i32, String>>,
    locks: HashSet<String>,
    journals: HashMap<String, Vec<JournalRecord>>,
    repair_queue: VecDeque<FileKey>,
    task_queue: VecDeque<FileKey>,
    writeback_queue: VecDeque<FileKey>,
}

pub struct MemoryMetaStore {
    state: Mutex<State>,
    file_limit: u64,
}

fn file_key(key: &FileKey) -> String {
    format!("{}/{}", key.namespace_id, key.name)
}

fn encode(meta: &FileMeta) -> Result<String> {
    serde_json::to_string(meta).map_err(|err| MetaStoreError(format!("encode failed - {err}")))
}

fn decode(raw: &str) -> Result<FileMeta> {
    serde_json::from_str(raw).map_err(|err| MetaStoreError(format!("decode failed - {err}")))
}

fn to_info(meta: &FileMeta) -> FileInfo {
    FileInfo {
        namespace_id: meta.namespace_id,
        name: meta.name.clone(),
        version: meta.version,
        size: meta.size,
        ctime: meta.ctime,
        atime: meta.atime,
        mtime: meta.mtime,
    }
}

impl MemoryMetaStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            file_limit: DEFAULT_FILE_LIMIT,
        }
    }
}

impl Default for MemoryMetaStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MetaStore for MemoryMetaStore {
    fn put_meta(&self, meta: &FileMeta) -> Result<()> {
        let raw = encode(meta)?;
        let mut state = self.state.lock().unwrap();
        state
            .files
            .entry(file_key(&meta.key()))
            .or_default()
            .insert(meta.version, raw);
        Ok(())
    }

    fn get_meta(&self, key: &FileKey, version: i32) -> Result<Option<FileMeta>> {
        let state = self.state.lock().unwrap();
        let Some(versions) = state.files.get(&file_key(key)) else {
            return Ok(None);
        };
        let raw = if version == LATEST_VERSION {
            versions.values().next_back()
        } else {
            versions.get(&version)
        };
        raw.map(|raw| decode(raw)).transpose()
    }

    fn delete_meta(&self, key: &FileKey) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        let existed = state.files.remove(&file_key(key)).is_some();
        state.journals.remove(&file_key(key));
        Ok(existed)
    }

    fn delete_meta_version(&self, key: &FileKey, version: i32) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        let k = file_key(key);
        let Some(versions) = state.files.get_mut(&k) else {
            return Ok(false);
        };
        let existed = versions.remove(&version).is_some();
        if versions.is_empty() {
            state.files.remove(&k);
        }
        Ok(existed)
    }

    fn rename_meta(&self, from: &FileKey, to: &FileKey) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        let from_key = file_key(from);
        let to_key = file_key(to);
        if state.files.contains_key(&to_key) {
            return Err(MetaStoreError(format!("file {to} already exists")));
        }
        let Some(versions) = state.files.remove(&from_key) else {
            return Ok(false);
        };
        // rewrite the embedded name of every version
        let mut renamed = BTreeMap::new();
        for (version, raw) in versions {
            let mut meta = decode(&raw)?;
            meta.namespace_id = to.namespace_id;
            meta.name = to.name.clone();
            renamed.insert(version, encode(&meta)?);
        }
        state.files.insert(to_key.clone(), renamed);
        if let Some(journal) = state.journals.remove(&from_key) {
            state.journals.insert(to_key, journal);
        }
        Ok(true)
    }

    fn update_chunks(&self, meta: &FileMeta) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        let k = file_key(&meta.key());
        let Some(raw) = state.files.get_mut(&k).and_then(|v| v.get_mut(&meta.version)) else {
            return Ok(false);
        };
        let mut stored = decode(raw)?;
        stored.uuid = meta.uuid;
        stored.chunks = meta.chunks.clone();
        stored.container_ids = meta.container_ids.clone();
        stored.corrupted = meta.corrupted.clone();
        *raw = encode(&stored)?;
        Ok(true)
    }

    fn update_file_status(&self, key: &FileKey, version: i32, status: FileStatus) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        let k = file_key(key);
        let Some(versions) = state.files.get_mut(&k) else {
            return Ok(false);
        };
        let raw = if version == LATEST_VERSION {
            versions.values_mut().next_back()
        } else {
            versions.get_mut(&version)
        };
        let Some(raw) = raw else {
            return Ok(false);
        };
        let mut stored = decode(raw)?;
        stored.status = status;
        *raw = encode(&stored)?;
        Ok(true)
    }

    fn list_files(
        &self,
        namespace_id: u8,
        prefix: &str,
        with_versions: bool,
    ) -> Result<Vec<FileInfo>> {
        let state = self.state.lock().unwrap();
        let mut out = Vec::new();
        for versions in state.files.values() {
            let raws: Vec<&String> = if with_versions {
                versions.values().collect()
            } else {
                versions.values().next_back().into_iter().collect()
            };
            for raw in raws {
                let meta = decode(raw)?;
                if meta.namespace_id == namespace_id && meta.name.starts_with(prefix) {
                    out.push(to_info(&meta));
                }
            }
        }
        out.sort_by(|a, b| a.name.cmp(&b.name).then(a.version.cmp(&b.version)));
        Ok(out)
    }

    fn all_files(&self) -> Result<Vec<FileInfo>> {
        let state = self.state.lock().unwrap();
        let mut out = Vec::new();
        for versions in state.files.values() {
            if let Some(raw) = versions.values().next_back() {
                out.push(to_info(&decode(raw)?));
            }
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    fn file_count(&self) -> Result<u64> {
        Ok(self.state.lock().unwrap().files.len() as u64)
    }

    fn file_limit(&self) -> u64 {
        self.file_limit
    }

    fn lock_file(&self, key: &FileKey) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        Ok(state.locks.insert(file_key(key)))
    }

    fn unlock_file(&self, key: &FileKey) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        Ok(state.locks.remove(&file_key(key)))
    }

    fn add_journal_record(&self, key: &FileKey, record: JournalRecord) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state
            .journals
            .entry(file_key(key))
            .or_default()
            .push(record);
        Ok(())
    }

    fn promote_journal_record(
        &self,
        key: &FileKey,
        chunk_id: u16,
        container_id: i32,
        op: JournalOp,
    ) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        let Some(records) = state.journals.get_mut(&file_key(key)) else {
            return Ok(false);
        };
        for record in records.iter_mut() {
            if record.chunk.chunk_id == chunk_id
                && record.container_id == container_id
                && record.op == op
                && record.phase == JournalPhase::Pre
            {
                record.phase = JournalPhase::Post;
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn remove_journal_record(
        &self,
        key: &FileKey,
        chunk_id: u16,
        container_id: i32,
        op: JournalOp,
    ) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        let k = file_key(key);
        let Some(records) = state.journals.get_mut(&k) else {
            return Ok(false);
        };
        let before = records.len();
        records.retain(|r| {
            !(r.chunk.chunk_id == chunk_id && r.container_id == container_id && r.op == op)
        });
        let removed = records.len() != before;
        if records.is_empty() {
            state.journals.remove(&k);
        }
        Ok(removed)
    }

    fn file_journal(&self, key: &FileKey) -> Result<Vec<JournalRecord>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .journals
            .get(&file_key(key))
            .cloned()
            .unwrap_or_default())
    }

    fn files_with_journal(&self) -> Result<Vec<FileKey>> {
        let state = self.state.lock().unwrap();
        let mut out = Vec::new();
        for key in state.journals.keys() {
            if let Some((ns, name)) = key.split_once('/') {
                if let Ok(namespace_id) = ns.parse() {
                    out.push(FileKey::new(namespace_id, name));
                }
            }
        }
        Ok(out)
    }

    fn mark_file_for_repair(&self, key: &FileKey) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        if state.repair_queue.contains(key) {
            return Ok(false);
        }
        state.repair_queue.push_back(key.clone());
        Ok(true)
    }

    fn files_for_repair(&self, batch: usize) -> Result<Vec<FileKey>> {
        let state = self.state.lock().unwrap();
        Ok(state.repair_queue.iter().take(batch).cloned().collect())
    }

    fn remove_file_from_repair(&self, key: &FileKey) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        let before = state.repair_queue.len();
        state.repair_queue.retain(|k| k != key);
        Ok(state.repair_queue.len() != before)
    }

    fn num_files_to_repair(&self) -> Result<u64> {
        Ok(self.state.lock().unwrap().repair_queue.len() as u64)
    }

    fn mark_file_for_task_check(&self, key: &FileKey) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        if state.task_queue.contains(key) {
            return Ok(false);
        }
        state.task_queue.push_back(key.clone());
        Ok(true)
    }

    fn next_file_for_task_check(&self) -> Result<Option<FileKey>> {
        Ok(self.state.lock().unwrap().task_queue.pop_front())
    }

    fn mark_file_for_writeback(&self, key: &FileKey) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        if state.writeback_queue.contains(key) {
            return Ok(false);
        }
        state.writeback_queue.push_back(key.clone());
        Ok(true)
    }

    fn files_for_writeback(&self) -> Result<Vec<FileKey>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .writeback_queue
            .iter()
            .cloned()
            .collect())
    }

    fn remove_file_from_writeback(&self, key: &FileKey) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        let before = state.writeback_queue.len();
        state.writeback_queue.retain(|k| k != key);
        Ok(state.writeback_queue.len() != before)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use ecs_api_types::ChunkMeta;

    fn meta(name: &str, version: i32) -> FileMeta {
        let mut meta = FileMeta::new(0, name);
        meta.version = version;
        meta.size = 100 * (version as u64 + 1);
        meta
    }

    #[test]
    fn versioned_put_get() {
        let store = MemoryMetaStore::new();
        let key = FileKey::new(0, "a");
        store.put_meta(&meta("a", 0)).unwrap();
        store.put_meta(&meta("a", 1)).unwrap();

        assert_eq!(store.get_meta(&key, 0).unwrap().unwrap().size, 100);
        assert_eq!(store.get_meta(&key, LATEST_VERSION).unwrap().unwrap().version, 1);
        assert!(store.get_meta(&key, 7).unwrap().is_none());
        assert_eq!(store.file_count().unwrap(), 1);

        assert!(store.delete_meta_version(&key, 1).unwrap());
        assert_eq!(store.get_meta(&key, LATEST_VERSION).unwrap().unwrap().version, 0);
        assert!(store.delete_meta(&key).unwrap());
        assert!(store.get_meta(&key, LATEST_VERSION).unwrap().is_none());
    }

    #[test]
    fn rename_moves_all_versions() {
        let store = MemoryMetaStore::new();
        store.put_meta(&meta("a", 0)).unwrap();
        store.put_meta(&meta("a", 1)).unwrap();
        let from = FileKey::new(0, "a");
        let to = FileKey::new(0, "b");
        assert!(store.rename_meta(&from, &to).unwrap());
        assert!(store.get_meta(&from, LATEST_VERSION).unwrap().is_none());
        let renamed = store.get_meta(&to, 0).unwrap().unwrap();
        assert_eq!(renamed.name, "b");

        // renaming onto an existing file is a conflict
        store.put_meta(&meta("a", 0)).unwrap();
        assert!(store.rename_meta(&from, &to).is_err());
    }

    #[test]
    fn advisory_lock_is_exclusive() {
        let store = MemoryMetaStore::new();
        let key = FileKey::new(0, "a");
        assert!(store.lock_file(&key).unwrap());
        assert!(!store.lock_file(&key).unwrap());
        assert!(store.unlock_file(&key).unwrap());
        assert!(store.lock_file(&key).unwrap());
    }

    #[test]
    fn journal_promote_and_remove() {
        let store = MemoryMetaStore::new();
        let key = FileKey::new(0, "a");
        let mut chunk = ChunkMeta::default();
        chunk.chunk_id = 3;
        store
            .add_journal_record(
                &key,
                JournalRecord {
                    chunk,
                    container_id: 7,
                    op: JournalOp::Write,
                    phase: JournalPhase::Pre,
                },
            )
            .unwrap();
        assert_eq!(store.files_with_journal().unwrap(), vec![key.clone()]);

        assert!(store.promote_journal_record(&key, 3, 7, JournalOp::Write).unwrap());
        assert!(!store.promote_journal_record(&key, 3, 7, JournalOp::Write).unwrap());
        assert_eq!(
            store.file_journal(&key).unwrap()[0].phase,
            JournalPhase::Post
        );

        assert!(store.remove_journal_record(&key, 3, 7, JournalOp::Write).unwrap());
        assert!(store.files_with_journal().unwrap().is_empty());
    }

    #[test]
    fn repair_queue_keeps_entries_until_removed() {
        let store = MemoryMetaStore::new();
        let a = FileKey::new(0, "a");
        let b = FileKey::new(0, "b");
        assert!(store.mark_file_for_repair(&a).unwrap());
        assert!(!store.mark_file_for_repair(&a).unwrap());
        store.mark_file_for_repair(&b).unwrap();

        assert_eq!(store.files_for_repair(1).unwrap(), vec![a.clone()]);
        assert_eq!(store.num_files_to_repair().unwrap(), 2);
        assert!(store.remove_file_from_repair(&a).unwrap());
        assert_eq!(store.files_for_repair(10).unwrap(), vec![b]);
    }
}
