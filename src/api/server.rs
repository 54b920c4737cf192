//! Service loop and request handlers of the client interface.

use std::sync::Arc;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use ecs_client::frame::{FrameReader, FrameWriter};
use ecs_client::encode_sysinfo;

use crate::error::ProxyError;
use crate::proxy::Proxy;
use crate::tools::RunningFlag;

use super::ClientOpcode;

const MAX_MESSAGE_SIZE: usize = 1 << 30;

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .little_endian()
        .max_frame_length(MAX_MESSAGE_SIZE)
        .new_codec()
}

/// Accept loop of the client interface; connections are served by a pool
/// bounded to the configured number of workers.
pub async fn run_client_interface(proxy: Arc<Proxy>, listener: TcpListener, running: RunningFlag) {
    let workers = Arc::new(Semaphore::new(proxy.config().interface.num_workers.max(1)));
    info!(
        "client interface listening on {}",
        listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_default()
    );

    while running.is_running() {
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(err) => {
                error!("client accept failed - {err}");
                continue;
            }
        };
        let _ = stream.set_nodelay(proxy.config().network.tcp_keep_alive);
        let proxy = proxy.clone();
        let workers = workers.clone();
        tokio::spawn(async move {
            let mut framed = Framed::new(stream, codec());
            while let Some(frame) = framed.next().await {
                let frame = match frame {
                    Ok(frame) => frame,
                    Err(err) => {
                        debug!("client connection from {peer} failed - {err}");
                        return;
                    }
                };
                // one worker slot per in-flight request
                let _permit = workers.acquire().await;
                let reply = handle_request(&proxy, frame.freeze()).await;
                if framed.send(reply).await.is_err() {
                    return;
                }
            }
        });
    }
}

fn fail_reply(opcode: ClientOpcode) -> Bytes {
    let mut w = FrameWriter::new();
    w.put_u32_frame(opcode.fail_mate() as u32);
    w.finish()
}

async fn handle_request(proxy: &Proxy, frame: Bytes) -> Bytes {
    let mut r = FrameReader::new(frame);
    let opcode = match r.u32_frame("opcode") {
        Ok(v) => ClientOpcode::from_u32(v),
        Err(err) => {
            warn!("malformed client request - {err}");
            let mut w = FrameWriter::new();
            w.put_u32_frame(ClientOpcode::UnknownClientOp as u32);
            return w.finish();
        }
    };

    match dispatch(proxy, opcode, r).await {
        Ok(reply) => reply,
        Err(err) => {
            warn!("{opcode:?} failed - {err}");
            fail_reply(opcode)
        }
    }
}

/// Resolve the request payload: inline data, or the contents of the named
/// cache file when `is_cached` is set.
async fn request_data(
    r: &mut FrameReader,
    is_cached: bool,
) -> Result<Vec<u8>, ProxyError> {
    if is_cached {
        let path = r
            .str_frame("cache path")
            .map_err(|err| ProxyError::InvalidArguments(err.to_string()))?;
        tokio::fs::read(&path)
            .await
            .map_err(|err| ProxyError::InvalidArguments(format!("unable to read cache file {path} - {err}")))
    } else {
        Ok(r.next_frame("data")
            .map_err(|err| ProxyError::InvalidArguments(err.to_string()))?
            .to_vec())
    }
}

/// Deliver reply data: inline, or into the cache file the client named.
async fn reply_data(
    w: &mut FrameWriter,
    cache_path: Option<&str>,
    data: &[u8],
) -> Result<(), ProxyError> {
    match cache_path {
        Some(path) => {
            tokio::fs::write(path, data).await.map_err(|err| {
                ProxyError::Internal(format!("unable to write cache file {path} - {err}"))
            })?;
            w.put_u8_frame(1);
            w.put_str_frame(path);
        }
        None => {
            w.put_u8_frame(0);
            w.put_frame(data);
        }
    }
    Ok(())
}

async fn dispatch(
    proxy: &Proxy,
    opcode: ClientOpcode,
    mut r: FrameReader,
) -> Result<Bytes, ProxyError> {
    let frame_err = |err: ecs_client::frame::FrameError| ProxyError::InvalidArguments(err.to_string());
    let mut w = FrameWriter::new();
    w.put_u32_frame(opcode.success_mate() as u32);

    match opcode {
        ClientOpcode::WriteFileReq => {
            let ns = r.u8_frame("namespace").map_err(frame_err)?;
            let name = r.str_frame("name").map_err(frame_err)?;
            let size = r.u64_frame("size").map_err(frame_err)?;
            let storage_class = r.str_frame("storage class").map_err(frame_err)?;
            let is_cached = r.u8_frame("is cached").map_err(frame_err)? != 0;
            let data = request_data(&mut r, is_cached).await?;
            if data.len() as u64 != size {
                return Err(ProxyError::InvalidArguments(format!(
                    "payload of {} bytes does not match declared size {size}",
                    data.len()
                )));
            }
            let ns = proxy.resolve_namespace(Some(ns));
            proxy.write_file(ns, &name, &storage_class, &data).await?;
        }

        ClientOpcode::ReadFileReq => {
            let ns = r.u8_frame("namespace").map_err(frame_err)?;
            let name = r.str_frame("name").map_err(frame_err)?;
            let is_cached = r.u8_frame("is cached").map_err(frame_err)? != 0;
            let cache_path = if is_cached {
                Some(r.str_frame("cache path").map_err(frame_err)?)
            } else {
                None
            };
            let ns = proxy.resolve_namespace(Some(ns));
            let (_, data) = proxy.read_file(ns, &name).await?;
            w.put_u64_frame(data.len() as u64);
            reply_data(&mut w, cache_path.as_deref(), &data).await?;
        }

        ClientOpcode::ReadFileRangeReq => {
            let ns = r.u8_frame("namespace").map_err(frame_err)?;
            let name = r.str_frame("name").map_err(frame_err)?;
            let length = r.u64_frame("size").map_err(frame_err)?;
            let offset = r.u64_frame("offset").map_err(frame_err)?;
            let is_cached = r.u8_frame("is cached").map_err(frame_err)? != 0;
            let cache_path = if is_cached {
                Some(r.str_frame("cache path").map_err(frame_err)?)
            } else {
                None
            };
            let ns = proxy.resolve_namespace(Some(ns));
            let (_, data) = proxy.read_file_range(ns, &name, offset, length).await?;
            w.put_u64_frame(offset);
            w.put_u64_frame(data.len() as u64);
            reply_data(&mut w, cache_path.as_deref(), &data).await?;
        }

        ClientOpcode::AppendFileReq | ClientOpcode::OverwriteFileReq => {
            let ns = r.u8_frame("namespace").map_err(frame_err)?;
            let name = r.str_frame("name").map_err(frame_err)?;
            let _size = r.u64_frame("size").map_err(frame_err)?;
            let offset = r.u64_frame("offset").map_err(frame_err)?;
            let is_cached = r.u8_frame("is cached").map_err(frame_err)? != 0;
            let data = request_data(&mut r, is_cached).await?;
            let ns = proxy.resolve_namespace(Some(ns));
            let new_size = if opcode == ClientOpcode::AppendFileReq {
                proxy.append_file(ns, &name, offset, &data).await?
            } else {
                proxy.overwrite_file(ns, &name, offset, &data).await?
            };
            w.put_u64_frame(new_size);
        }

        ClientOpcode::DelFileReq => {
            let ns = r.u8_frame("namespace").map_err(frame_err)?;
            let name = r.str_frame("name").map_err(frame_err)?;
            let ns = proxy.resolve_namespace(Some(ns));
            proxy.delete_file(ns, &name).await?;
        }

        ClientOpcode::RenameFileReq => {
            let ns = r.u8_frame("namespace").map_err(frame_err)?;
            let old_name = r.str_frame("old name").map_err(frame_err)?;
            let _is_cached = r.u8_frame("is cached").map_err(frame_err)?;
            let new_name = r.str_frame("new name").map_err(frame_err)?;
            let ns = proxy.resolve_namespace(Some(ns));
            proxy.rename_file(ns, &old_name, &new_name).await?;
        }

        ClientOpcode::CopyFileReq => {
            let ns = r.u8_frame("namespace").map_err(frame_err)?;
            let src_name = r.str_frame("source name").map_err(frame_err)?;
            let _size = r.u64_frame("size").map_err(frame_err)?;
            let _offset = r.u64_frame("offset").map_err(frame_err)?;
            let _is_cached = r.u8_frame("is cached").map_err(frame_err)?;
            let dst_name = r.str_frame("destination name").map_err(frame_err)?;
            let ns = proxy.resolve_namespace(Some(ns));
            let copied = proxy.copy_file(ns, &src_name, &dst_name).await?;
            w.put_u64_frame(copied);
        }

        ClientOpcode::GetCapacityReq => {
            let (usage, capacity) = proxy.get_storage_usage();
            let (count, limit) = proxy.get_file_count_and_limit()?;
            w.put_u64_frame(usage);
            w.put_u64_frame(capacity);
            w.put_u64_frame(count);
            w.put_u64_frame(limit);
        }

        ClientOpcode::GetFileListReq => {
            let ns = r.u8_frame("namespace").map_err(frame_err)?;
            let prefix = r.str_frame("prefix").map_err(frame_err)?;
            let ns = proxy.resolve_namespace(Some(ns));
            let files = proxy.list_files(ns, &prefix, false)?;
            w.put_u32_frame(files.len() as u32);
            for file in files {
                w.put_str_frame(&file.name);
                w.put_u64_frame(file.size);
                w.put_u64_frame(file.ctime as u64);
                w.put_u64_frame(file.atime as u64);
                w.put_u64_frame(file.mtime as u64);
            }
        }

        ClientOpcode::GetAppendSizeReq => {
            let storage_class = r.str_frame("storage class").map_err(frame_err)?;
            w.put_u64_frame(proxy.get_expected_append_size(&storage_class)?);
        }

        ClientOpcode::GetReadSizeReq => {
            let ns = r.u8_frame("namespace").map_err(frame_err)?;
            let name = r.str_frame("name").map_err(frame_err)?;
            let ns = proxy.resolve_namespace(Some(ns));
            w.put_u64_frame(proxy.get_expected_read_size(ns, &name)?);
        }

        ClientOpcode::GetAgentStatusReq => {
            let agents = proxy.get_agent_status();
            w.put_u32_frame(agents.len() as u32);
            for agent in agents {
                w.put_u8_frame(agent.alive as u8);
                w.put_str_frame(&agent.ip);
                w.put_u8_frame(agent.host_type.to_u8());
                w.put_frame(&encode_sysinfo(&agent.sysinfo));
                w.put_i32_frame(agent.containers.len() as i32);
                let mut buf = Vec::new();
                for c in &agent.containers {
                    buf.extend_from_slice(&c.id.to_le_bytes());
                }
                w.put_frame(&buf);
                buf.clear();
                for c in &agent.containers {
                    buf.push(c.container_type.to_u8());
                }
                w.put_frame(&buf);
                buf.clear();
                for c in &agent.containers {
                    buf.extend_from_slice(&c.usage.to_le_bytes());
                }
                w.put_frame(&buf);
                buf.clear();
                for c in &agent.containers {
                    buf.extend_from_slice(&c.capacity.to_le_bytes());
                }
                w.put_frame(&buf);
            }
        }

        ClientOpcode::GetProxyStatusReq => {
            w.put_frame(&encode_sysinfo(&proxy.get_proxy_status()));
        }

        ClientOpcode::GetBgTaskPrgReq => {
            let tasks = proxy.get_bg_task_progress();
            w.put_u32_frame(tasks.len() as u32);
            for (name, progress) in tasks {
                w.put_str_frame(&name);
                w.put_i32_frame(progress);
            }
        }

        ClientOpcode::GetRepairStatsReq => {
            let (count, repair) = proxy.get_num_files_to_repair()?;
            w.put_u64_frame(count);
            w.put_u64_frame(repair);
        }

        _ => {
            return Err(ProxyError::InvalidArguments(format!(
                "unexpected opcode {opcode:?}"
            )));
        }
    }

    Ok(w.finish())
}
