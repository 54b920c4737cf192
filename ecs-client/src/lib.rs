//! Chunk-I/O client of the ecstore proxy.
//!
//! This crate owns the proxy-to-agent protocol: the opcode set, the frame
//! layout, the message codec and the transport. The [`ChunkClient`] issues
//! exactly one request and consumes exactly one reply per call; recovery
//! from failures is the caller's business.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

pub mod frame;

mod message;
mod opcode;
mod transport;

pub use message::{encode_sysinfo, decode_sysinfo, AgentMessage, ChunkPayload, RepairContext};
pub use opcode::Opcode;
pub use transport::{TcpTransport, Transport, TransportError};

/// Shared mapping from container id to the owning agent's address. Written
/// by the coordinator, read by everyone who talks to agents.
pub type ContainerMap = Arc<RwLock<HashMap<i32, String>>>;

pub fn new_container_map() -> ContainerMap {
    Arc::new(RwLock::new(HashMap::new()))
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("no agent mapped to container id = {0}")]
    UnknownContainer(i32),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

pub struct ChunkClient {
    transport: Arc<dyn Transport>,
    containers: ContainerMap,
}

impl ChunkClient {
    pub fn new(transport: Arc<dyn Transport>, containers: ContainerMap) -> Self {
        Self {
            transport,
            containers,
        }
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        self.transport.clone()
    }

    /// Agent address currently owning `container_id`.
    pub fn resolve(&self, container_id: i32) -> Option<String> {
        self.containers
            .read()
            .unwrap()
            .get(&container_id)
            .cloned()
    }

    /// Send one request to the agent owning `container_id` and return its
    /// reply. The reply opcode is either the success or the failure mate of
    /// the request; telling them apart is left to the caller.
    pub async fn send_to_container(
        &self,
        container_id: i32,
        request: AgentMessage,
    ) -> Result<AgentMessage, ClientError> {
        let addr = self
            .resolve(container_id)
            .ok_or(ClientError::UnknownContainer(container_id))?;
        Ok(self.transport.exchange(&addr, request).await?)
    }

    /// Send one request to an agent by address.
    pub async fn send_to_agent(
        &self,
        addr: &str,
        request: AgentMessage,
    ) -> Result<AgentMessage, ClientError> {
        Ok(self.transport.exchange(addr, request).await?)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use async_trait::async_trait;

    struct PingTransport;

    #[async_trait]
    impl Transport for PingTransport {
        async fn exchange(
            &self,
            _addr: &str,
            request: AgentMessage,
        ) -> Result<AgentMessage, TransportError> {
            Ok(AgentMessage::reply(request.opcode.success_mate()))
        }
    }

    #[tokio::test]
    async fn container_resolution() {
        let containers = new_container_map();
        containers
            .write()
            .unwrap()
            .insert(3, "10.0.0.1:57002".to_string());
        let client = ChunkClient::new(Arc::new(PingTransport), containers);

        let reply = client
            .send_to_container(3, AgentMessage::new(Opcode::ChkChunkReq))
            .await
            .unwrap();
        assert!(reply.is_success_for(Opcode::ChkChunkReq));

        let err = client
            .send_to_container(4, AgentMessage::new(Opcode::ChkChunkReq))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::UnknownContainer(4)));
    }
}
