//! Size queries, listings and system status reporting.

use ecs_api_types::{AgentStatus, FileInfo, FileKey, HostType, SysInfo};

use crate::error::{ProxyError, Result};
use crate::tools::sysinfo;

use super::Proxy;

impl Proxy {
    /// Logical size of a file, preferring the staged copy when newer.
    pub fn get_file_size(&self, namespace_id: u8, name: &str) -> Result<u64> {
        let key = FileKey::new(namespace_id, name);
        let meta = self.get_meta(&key)?.ok_or(ProxyError::NotFound)?;
        if let Some(staged) = &meta.staged {
            if staged.mtime >= meta.mtime {
                return Ok(staged.size);
            }
        }
        Ok(meta.size)
    }

    /// Append alignment of a storage class: the stripe payload size.
    pub fn get_expected_append_size(&self, storage_class: &str) -> Result<u64> {
        let (_, coding) = self.resolve_storage_class(storage_class)?;
        self.chunk_manager.max_data_size_per_stripe(&coding)
    }

    /// Bytes a whole-file read of this file will return.
    pub fn get_expected_read_size(&self, namespace_id: u8, name: &str) -> Result<u64> {
        self.get_file_size(namespace_id, name)
    }

    pub fn list_files(
        &self,
        namespace_id: u8,
        prefix: &str,
        with_versions: bool,
    ) -> Result<Vec<FileInfo>> {
        Ok(self.metastore.list_files(namespace_id, prefix, with_versions)?)
    }

    /// Folders derived from `/` separators in file names under a prefix.
    pub fn list_folders(&self, namespace_id: u8, prefix: &str) -> Result<Vec<String>> {
        let files = self.metastore.list_files(namespace_id, prefix, false)?;
        let mut folders: Vec<String> = files
            .iter()
            .filter_map(|f| {
                let rest = &f.name[prefix.len()..];
                rest.find('/')
                    .map(|at| format!("{}{}", prefix, &rest[..at + 1]))
            })
            .collect();
        folders.sort();
        folders.dedup();
        Ok(folders)
    }

    pub fn get_file_count_and_limit(&self) -> Result<(u64, u64)> {
        Ok((self.metastore.file_count()?, self.metastore.file_limit()))
    }

    /// File count plus the number of files queued or in flight for repair.
    pub fn get_num_files_to_repair(&self) -> Result<(u64, u64)> {
        let count = self.metastore.file_count()?;
        let repair = self.metastore.num_files_to_repair()? + self.repair_in_flight();
        Ok((count, repair))
    }

    pub fn get_storage_usage(&self) -> (u64, u64) {
        self.coordinator.storage_usage()
    }

    pub fn get_agent_status(&self) -> Vec<AgentStatus> {
        self.coordinator.agent_status()
    }

    pub fn get_proxy_status(&self) -> SysInfo {
        sysinfo::collect(HostType::OnPrem)
    }

    /// Name and percent progress of the running background tasks.
    pub fn get_bg_task_progress(&self) -> Vec<(String, i32)> {
        self.bg_progress().snapshot()
    }
}
