//! Message transport towards agents.
//!
//! One `exchange` is a single request message answered by a single reply
//! message. The transport enforces the configured receive timeout and does
//! no retrying of its own; the chunk manager decides what a failure means.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use log::debug;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::frame::FrameError;
use crate::message::AgentMessage;

/// Upper bound on one encoded message; a message carries at most one stripe
/// of chunk data.
const MAX_MESSAGE_SIZE: usize = 1 << 30;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("unable to connect to {addr} - {err}")]
    Connect {
        addr: String,
        err: std::io::Error,
    },
    #[error("timed out waiting for a reply from {0}")]
    Timeout(String),
    #[error("connection to {0} closed before a reply arrived")]
    Closed(String),
    #[error("i/o error talking to {addr} - {err}")]
    Io {
        addr: String,
        err: std::io::Error,
    },
    #[error("protocol error from {addr} - {err}")]
    Protocol {
        addr: String,
        err: FrameError,
    },
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn exchange(
        &self,
        addr: &str,
        request: AgentMessage,
    ) -> Result<AgentMessage, TransportError>;
}

type Connection = Framed<TcpStream, LengthDelimitedCodec>;

/// TCP transport with an optional per-address connection cache.
pub struct TcpTransport {
    receive_timeout: Duration,
    reuse_connections: bool,
    pool: tokio::sync::Mutex<HashMap<String, Connection>>,
}

impl TcpTransport {
    pub fn new(receive_timeout: Duration, reuse_connections: bool) -> Self {
        Self {
            receive_timeout,
            reuse_connections,
            pool: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    fn codec() -> LengthDelimitedCodec {
        LengthDelimitedCodec::builder()
            .little_endian()
            .max_frame_length(MAX_MESSAGE_SIZE)
            .new_codec()
    }

    async fn connect(addr: &str) -> Result<Connection, TransportError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|err| TransportError::Connect {
                addr: addr.to_string(),
                err,
            })?;
        let _ = stream.set_nodelay(true);
        Ok(Framed::new(stream, Self::codec()))
    }

    async fn take_connection(&self, addr: &str) -> Result<Connection, TransportError> {
        if self.reuse_connections {
            if let Some(conn) = self.pool.lock().await.remove(addr) {
                debug!("reusing connection to {addr}");
                return Ok(conn);
            }
        }
        Self::connect(addr).await
    }

    async fn return_connection(&self, addr: &str, conn: Connection) {
        if self.reuse_connections {
            self.pool.lock().await.insert(addr.to_string(), conn);
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn exchange(
        &self,
        addr: &str,
        request: AgentMessage,
    ) -> Result<AgentMessage, TransportError> {
        let mut conn = self.take_connection(addr).await?;

        if let Err(err) = conn.send(request.encode()).await {
            return Err(TransportError::Io {
                addr: addr.to_string(),
                err,
            });
        }

        let reply = match tokio::time::timeout(self.receive_timeout, conn.next()).await {
            Err(_) => return Err(TransportError::Timeout(addr.to_string())),
            Ok(None) => return Err(TransportError::Closed(addr.to_string())),
            Ok(Some(Err(err))) => {
                return Err(TransportError::Io {
                    addr: addr.to_string(),
                    err,
                })
            }
            Ok(Some(Ok(frame))) => {
                AgentMessage::decode(frame.freeze()).map_err(|err| TransportError::Protocol {
                    addr: addr.to_string(),
                    err,
                })?
            }
        };

        self.return_connection(addr, conn).await;
        Ok(reply)
    }
}
