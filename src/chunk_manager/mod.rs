//! Stripe-oriented data path.
//!
//! The chunk manager drives every chunk-level pipeline: stripe writes with
//! optional background redundancy, plain and degraded reads, repair (proxy-
//! or agent-side, with CAR partial encodings), copy/move/delete/revert, and
//! existence/checksum sweeps. It coordinates the coding engine, the chunk
//! client and the placement coordinator, journals in-flight writes, and
//! never touches file metadata records itself; committing those is the
//! proxy's job.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crossbeam_channel::Sender;
use log::{debug, warn};
use tokio::task::JoinHandle;

use ecs_api_types::{
    ChunkMeta, CodingMeta, FileKey, FileMeta, JournalOp, JournalPhase, JournalRecord,
};
use ecs_client::{AgentMessage, ChunkClient, ClientError};
use ecs_coding::{CodingEngine, CodingRegistry};

use crate::coordinator::ProxyCoordinator;
use crate::error::{ProxyError, Result};
use crate::metastore::MetaStore;

mod check;
mod read;
mod repair;
#[cfg(test)]
mod test_support;
mod transfer;
mod write;

pub use write::StripeWriteOutcome;

/// One chunk write completing in the background.
pub struct BgWriteEntry {
    pub position: usize,
    pub container_id: i32,
    pub chunk: ChunkMeta,
    pub handle: JoinHandle<std::result::Result<AgentMessage, ClientError>>,
}

/// A stripe whose redundant chunks are still being written; handed to the
/// background chunk worker for commitment.
pub struct BgChunkTask {
    pub key: FileKey,
    pub version: i32,
    pub task_name: String,
    pub entries: Vec<BgWriteEntry>,
}

/// Behavior switches of the chunk manager, taken from the configuration.
#[derive(Debug, Clone, Default)]
pub struct ChunkManagerOptions {
    pub verify_chunk_checksum: bool,
    pub ack_redundancy_in_background: bool,
    pub write_redundancy_in_background: bool,
    pub repair_at_proxy: bool,
    pub repair_using_car: bool,
}

pub struct ChunkManager {
    client: Arc<ChunkClient>,
    registry: Arc<CodingRegistry>,
    metastore: Arc<dyn MetaStore>,
    coordinator: Arc<ProxyCoordinator>,
    bg_tasks: Option<Sender<BgChunkTask>>,
    opts: ChunkManagerOptions,
    event_count: AtomicU32,
}

impl ChunkManager {
    pub fn new(
        client: Arc<ChunkClient>,
        registry: Arc<CodingRegistry>,
        metastore: Arc<dyn MetaStore>,
        coordinator: Arc<ProxyCoordinator>,
        bg_tasks: Option<Sender<BgChunkTask>>,
        opts: ChunkManagerOptions,
    ) -> Self {
        Self {
            client,
            registry,
            metastore,
            coordinator,
            bg_tasks,
            opts,
            event_count: AtomicU32::new(0),
        }
    }

    pub(crate) fn engine(&self, coding: &CodingMeta) -> Result<Arc<dyn CodingEngine>> {
        Ok(self.registry.get_for(coding)?)
    }

    pub fn next_event_id(&self) -> u32 {
        self.event_count.fetch_add(1, Ordering::SeqCst)
    }

    /// Number of containers a file of this storage policy occupies.
    pub fn num_required_containers(&self, coding: &CodingMeta) -> Result<usize> {
        let engine = self.engine(coding)?;
        Ok(engine.num_chunks() / engine.chunks_per_node())
    }

    /// Containers needed before a stripe can be stored at all.
    pub fn min_num_required_containers(&self, coding: &CodingMeta) -> Result<usize> {
        let engine = self.engine(coding)?;
        Ok(engine.num_data_chunks() / engine.chunks_per_node())
    }

    pub fn num_chunks_per_stripe(&self, coding: &CodingMeta) -> Result<usize> {
        Ok(self.engine(coding)?.num_chunks())
    }

    /// Payload bytes per full stripe.
    pub fn max_data_size_per_stripe(&self, coding: &CodingMeta) -> Result<u64> {
        let engine = self.engine(coding)?;
        Ok(coding.max_chunk_size as u64 * engine.num_data_chunks() as u64)
    }

    /// Payload bytes of stripe `stripe_id` of a `size`-byte file.
    pub fn data_size_of_stripe(&self, coding: &CodingMeta, size: u64, stripe_id: usize) -> Result<u64> {
        let stripe_size = self.max_data_size_per_stripe(coding)?;
        let start = stripe_id as u64 * stripe_size;
        Ok(size.saturating_sub(start).min(stripe_size))
    }

    pub(crate) fn coordinator(&self) -> &ProxyCoordinator {
        &self.coordinator
    }

    /// Issue one request per destination concurrently and collect the
    /// replies in request order. Transport failures are reported to the
    /// coordinator so liveness catches up.
    pub(crate) async fn access_chunks(
        &self,
        requests: Vec<(i32, AgentMessage)>,
    ) -> Vec<std::result::Result<AgentMessage, ClientError>> {
        let mut handles = Vec::with_capacity(requests.len());
        for (container_id, request) in requests {
            handles.push(self.spawn_chunk_request(container_id, request));
        }
        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            results.push(join_chunk_request(handle).await);
        }
        results
    }

    /// Dispatch one chunk request on its own task.
    pub(crate) fn spawn_chunk_request(
        &self,
        container_id: i32,
        request: AgentMessage,
    ) -> JoinHandle<std::result::Result<AgentMessage, ClientError>> {
        let client = self.client.clone();
        let coordinator = self.coordinator.clone();
        let event_id = self.next_event_id();
        debug!(
            "event {event_id}: send {:?} with {} chunks to container id = {container_id}",
            request.opcode,
            request.chunks.len()
        );
        tokio::spawn(async move {
            let result = client.send_to_container(container_id, request).await;
            if let Err(ClientError::Transport(err)) = &result {
                debug!("event {event_id}: transport failure - {err}");
                coordinator.report_container_failure(container_id);
            }
            result
        })
    }

    /// Resolve the agent address of a container, for building repair
    /// requests that name peer agents.
    pub(crate) fn container_addr(&self, container_id: i32) -> Result<String> {
        self.coordinator.container_owner(container_id).ok_or_else(|| {
            ProxyError::Internal(format!("no agent mapped to container id = {container_id}"))
        })
    }

    // ------------------ //
    // journal bookkeeping //
    // ------------------ //

    pub(crate) fn journal_pre_write(&self, key: &FileKey, chunk: &ChunkMeta, container_id: i32) {
        let record = JournalRecord {
            chunk: chunk.clone(),
            container_id,
            op: JournalOp::Write,
            phase: JournalPhase::Pre,
        };
        if let Err(err) = self.metastore.add_journal_record(key, record) {
            warn!("unable to journal chunk write of {key} chunk {} - {err}", chunk.chunk_id);
        }
    }

    pub(crate) fn journal_pre_delete(&self, key: &FileKey, chunk: &ChunkMeta, container_id: i32) {
        let record = JournalRecord {
            chunk: chunk.clone(),
            container_id,
            op: JournalOp::Delete,
            phase: JournalPhase::Pre,
        };
        if let Err(err) = self.metastore.add_journal_record(key, record) {
            warn!("unable to journal chunk delete of {key} chunk {} - {err}", chunk.chunk_id);
        }
    }

    pub(crate) fn journal_promote(&self, key: &FileKey, chunk_id: u16, container_id: i32, op: JournalOp) {
        if let Err(err) = self
            .metastore
            .promote_journal_record(key, chunk_id, container_id, op)
        {
            warn!("unable to promote journal record of {key} chunk {chunk_id} - {err}");
        }
    }

    pub(crate) fn journal_remove(&self, key: &FileKey, chunk_id: u16, container_id: i32, op: JournalOp) {
        if let Err(err) = self
            .metastore
            .remove_journal_record(key, chunk_id, container_id, op)
        {
            warn!("unable to remove journal record of {key} chunk {chunk_id} - {err}");
        }
    }

    pub(crate) fn opts(&self) -> &ChunkManagerOptions {
        &self.opts
    }

    pub(crate) fn send_bg_task(&self, task: BgChunkTask) -> bool {
        match &self.bg_tasks {
            Some(sender) => match sender.send(task) {
                Ok(()) => true,
                Err(err) => {
                    warn!("background chunk worker is gone - {err}");
                    false
                }
            },
            None => false,
        }
    }
}

/// Build the chunk metadata of one stripe position of a file.
pub(crate) fn stripe_chunk_meta(
    file: &FileMeta,
    chunk_id: usize,
    size: u32,
    md5: [u8; 16],
) -> ChunkMeta {
    ChunkMeta {
        namespace_id: file.namespace_id,
        fuuid: file.uuid,
        chunk_id: chunk_id as u16,
        file_version: file.version,
        size,
        md5,
    }
}

async fn join_chunk_request(
    handle: JoinHandle<std::result::Result<AgentMessage, ClientError>>,
) -> std::result::Result<AgentMessage, ClientError> {
    match handle.await {
        Ok(result) => result,
        Err(err) => Err(ClientError::Transport(ecs_client::TransportError::Closed(
            format!("request task failed - {err}"),
        ))),
    }
}

/// Positions of a stripe whose indicator is down, as engine chunk ids.
pub(crate) fn failed_ids(status: &[bool]) -> Vec<usize> {
    status
        .iter()
        .enumerate()
        .filter(|(_, alive)| !**alive)
        .map(|(i, _)| i)
        .collect()
}
