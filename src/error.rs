//! The caller-visible error type of the proxy data path.

use ecs_client::{ClientError, TransportError};
use ecs_coding::CodingError;

pub type Result<T> = std::result::Result<T, ProxyError>;

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// Timeout or connection failure talking to an agent, after all
    /// recovery within the chunk manager was exhausted.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// An agent answered with the failure mate of the request.
    #[error("agent reported failure for {op}")]
    AgentReported { op: &'static str },

    /// A returned or stored chunk checksum does not match.
    #[error("chunk checksum mismatch")]
    ChecksumMismatch,

    /// The coordinator cannot satisfy the spare-container constraints.
    #[error("insufficient containers available, need {needed} but selected {selected}")]
    InsufficientCapacity { needed: usize, selected: usize },

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("file not found")]
    NotFound,

    /// Fewer than `k` chunks of a stripe survive.
    #[error("insufficient surviving chunks to decode")]
    Unrecoverable,

    /// Lock timeout or a concurrent metadata change.
    #[error("metadata conflict: {0}")]
    MetadataConflict(String),

    /// A stripe committed fewer than `k` chunks and was rolled back.
    #[error("stripe stored only {stored} of {required} required chunks")]
    StripeUnderReplicated { stored: usize, required: usize },

    /// Later stripes failed after earlier ones committed; the committed
    /// stripes of the mutation were rolled back.
    #[error("operation partially failed - {0}")]
    Partial(#[source] Box<ProxyError>),

    #[error("metadata store failure - {0}")]
    Metadata(String),

    #[error("internal error - {0}")]
    Internal(String),
}

impl From<ClientError> for ProxyError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::Transport(err) => ProxyError::Transport(err),
            ClientError::UnknownContainer(id) => {
                ProxyError::Internal(format!("no agent mapped to container id = {id}"))
            }
        }
    }
}

impl From<CodingError> for ProxyError {
    fn from(err: CodingError) -> Self {
        match err {
            CodingError::InvalidParams(msg) => ProxyError::InvalidArguments(msg),
            CodingError::Unrecoverable { .. } => ProxyError::Unrecoverable,
        }
    }
}

impl From<crate::metastore::MetaStoreError> for ProxyError {
    fn from(err: crate::metastore::MetaStoreError) -> Self {
        ProxyError::Metadata(err.to_string())
    }
}
