//! Messages of the proxy-to-agent protocol.
//!
//! One message type covers chunk requests, chunk replies and coordinator
//! events; unused sections stay empty on the wire. The encoding is the frame
//! layout of [`crate::frame`].

use bytes::{Buf, BufMut, Bytes, BytesMut};
use uuid::Uuid;

use ecs_api_types::{
    AgentRegistration, ChunkMeta, ContainerInfo, ContainerType, HostType, SysInfo,
    MD5_DIGEST_LENGTH,
};

use crate::frame::{FrameError, FrameReader, FrameWriter};
use crate::Opcode;

/// Chunk metadata plus the optional data bytes travelling with it.
#[derive(Debug, Clone, Default)]
pub struct ChunkPayload {
    pub meta: ChunkMeta,
    pub data: Option<Bytes>,
}

impl ChunkPayload {
    pub fn meta_only(meta: ChunkMeta) -> Self {
        Self { meta, data: None }
    }

    pub fn with_data(meta: ChunkMeta, data: Bytes) -> Self {
        Self {
            meta,
            data: Some(data),
        }
    }
}

/// Coding information attached to repair and partial-encoding requests.
#[derive(Debug, Clone, Default)]
pub struct RepairContext {
    pub scheme: u8,
    pub repair_using_car: bool,
    pub num_input_chunks: u32,
    /// First chunk id of the stripe, for files with multiple stripes.
    pub chunk_id_offset: u32,
    /// Repair coefficient rows, in chunk-group order.
    pub matrix: Vec<u8>,
    /// Flattened group map: for each group a length followed by chunk ids.
    pub chunk_group_map: Vec<i32>,
    pub container_group_map: Vec<i32>,
    /// Peer agent addresses, in group order; for agent-side repair the
    /// replacement agents follow the input agents.
    pub agents: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct AgentMessage {
    pub opcode: Opcode,
    pub chunks: Vec<ChunkPayload>,
    pub container_ids: Vec<i32>,
    /// Per-position flags in check/verify replies.
    pub indicators: Vec<bool>,
    pub repair: Option<RepairContext>,
    pub registration: Option<AgentRegistration>,
    pub sysinfo: Option<SysInfo>,
}

impl AgentMessage {
    pub fn new(opcode: Opcode) -> Self {
        Self {
            opcode,
            chunks: Vec::new(),
            container_ids: Vec::new(),
            indicators: Vec::new(),
            repair: None,
            registration: None,
            sysinfo: None,
        }
    }

    /// A bare reply carrying only an opcode.
    pub fn reply(opcode: Opcode) -> Self {
        Self::new(opcode)
    }

    /// Whether this message is the success reply of `request`.
    pub fn is_success_for(&self, request: Opcode) -> bool {
        self.opcode == request.success_mate()
    }

    pub fn encode(&self) -> Bytes {
        let mut w = FrameWriter::new();
        w.put_u32_frame(self.opcode as u32);

        // chunk section
        w.put_u32_frame(self.chunks.len() as u32);
        for chunk in &self.chunks {
            let meta = &chunk.meta;
            let mut buf = BytesMut::with_capacity(44);
            buf.put_u8(meta.namespace_id);
            buf.put_slice(meta.fuuid.as_bytes());
            buf.put_u16_le(meta.chunk_id);
            buf.put_i32_le(meta.file_version);
            buf.put_u32_le(meta.size);
            buf.put_slice(&meta.md5);
            buf.put_u8(chunk.data.is_some() as u8);
            w.put_frame(&buf);
            if let Some(data) = &chunk.data {
                w.put_frame(data);
            }
        }

        // container ids
        let mut buf = BytesMut::with_capacity(self.container_ids.len() * 4);
        for id in &self.container_ids {
            buf.put_i32_le(*id);
        }
        w.put_frame(&buf);

        // indicators
        let flags: Vec<u8> = self.indicators.iter().map(|&b| b as u8).collect();
        w.put_frame(&flags);

        // repair context
        match &self.repair {
            None => {
                w.put_u8_frame(0);
            }
            Some(ctx) => {
                w.put_u8_frame(1);
                let mut buf = BytesMut::new();
                buf.put_u8(ctx.scheme);
                buf.put_u8(ctx.repair_using_car as u8);
                buf.put_u32_le(ctx.num_input_chunks);
                buf.put_u32_le(ctx.chunk_id_offset);
                w.put_frame(&buf);
                w.put_frame(&ctx.matrix);
                let mut buf = BytesMut::new();
                for v in &ctx.chunk_group_map {
                    buf.put_i32_le(*v);
                }
                w.put_frame(&buf);
                let mut buf = BytesMut::new();
                for v in &ctx.container_group_map {
                    buf.put_i32_le(*v);
                }
                w.put_frame(&buf);
                w.put_u32_frame(ctx.agents.len() as u32);
                for agent in &ctx.agents {
                    w.put_str_frame(agent);
                }
            }
        }

        // registration
        match &self.registration {
            None => {
                w.put_u8_frame(0);
            }
            Some(reg) => {
                w.put_u8_frame(1);
                let mut buf = BytesMut::new();
                buf.put_u16_le(reg.ip.len() as u16);
                buf.put_slice(reg.ip.as_bytes());
                buf.put_u16_le(reg.coord_port);
                buf.put_u8(reg.host_type.to_u8());
                buf.put_u32_le(reg.containers.len() as u32);
                for c in &reg.containers {
                    buf.put_i32_le(c.id);
                    buf.put_u8(c.container_type.to_u8());
                    buf.put_u64_le(c.usage);
                    buf.put_u64_le(c.capacity);
                }
                w.put_frame(&buf);
            }
        }

        // sysinfo
        match &self.sysinfo {
            None => {
                w.put_u8_frame(0);
            }
            Some(info) => {
                w.put_u8_frame(1);
                w.put_frame(&encode_sysinfo(info));
            }
        }

        w.finish()
    }

    pub fn decode(buf: Bytes) -> Result<Self, FrameError> {
        let mut r = FrameReader::new(buf);
        let opcode = Opcode::from_u32(r.u32_frame("opcode")?);
        let mut msg = AgentMessage::new(opcode);

        let num_chunks = r.u32_frame("chunk count")?;
        for _ in 0..num_chunks {
            let mut meta_buf = r.next_frame("chunk meta")?;
            if meta_buf.len() != 44 {
                return Err(FrameError::Malformed(format!(
                    "chunk meta frame has {} bytes",
                    meta_buf.len()
                )));
            }
            let namespace_id = meta_buf.get_u8();
            let mut fuuid = [0u8; 16];
            meta_buf.copy_to_slice(&mut fuuid);
            let chunk_id = meta_buf.get_u16_le();
            let file_version = meta_buf.get_i32_le();
            let size = meta_buf.get_u32_le();
            let mut md5 = [0u8; MD5_DIGEST_LENGTH];
            meta_buf.copy_to_slice(&mut md5);
            let has_data = meta_buf.get_u8() != 0;
            let data = if has_data {
                Some(r.next_frame("chunk data")?)
            } else {
                None
            };
            msg.chunks.push(ChunkPayload {
                meta: ChunkMeta {
                    namespace_id,
                    fuuid: Uuid::from_bytes(fuuid),
                    chunk_id,
                    file_version,
                    size,
                    md5,
                },
                data,
            });
        }

        let mut ids = r.next_frame("container ids")?;
        if ids.len() % 4 != 0 {
            return Err(FrameError::Malformed("container id frame length".into()));
        }
        while ids.has_remaining() {
            msg.container_ids.push(ids.get_i32_le());
        }

        let flags = r.next_frame("indicators")?;
        msg.indicators = flags.iter().map(|&b| b != 0).collect();

        if r.u8_frame("repair flag")? != 0 {
            let mut buf = r.next_frame("repair header")?;
            if buf.len() != 10 {
                return Err(FrameError::Malformed("repair header frame length".into()));
            }
            let mut ctx = RepairContext {
                scheme: buf.get_u8(),
                repair_using_car: buf.get_u8() != 0,
                num_input_chunks: buf.get_u32_le(),
                chunk_id_offset: buf.get_u32_le(),
                ..Default::default()
            };
            ctx.matrix = r.next_frame("repair matrix")?.to_vec();
            let mut groups = r.next_frame("chunk group map")?;
            while groups.has_remaining() {
                ctx.chunk_group_map.push(groups.get_i32_le());
            }
            let mut groups = r.next_frame("container group map")?;
            while groups.has_remaining() {
                ctx.container_group_map.push(groups.get_i32_le());
            }
            let num_agents = r.u32_frame("agent count")?;
            for _ in 0..num_agents {
                ctx.agents.push(r.str_frame("agent address")?);
            }
            msg.repair = Some(ctx);
        }

        if r.u8_frame("registration flag")? != 0 {
            let mut buf = r.next_frame("registration")?;
            if buf.remaining() < 2 {
                return Err(FrameError::Malformed("registration frame".into()));
            }
            let ip_len = buf.get_u16_le() as usize;
            if buf.remaining() < ip_len + 7 {
                return Err(FrameError::Malformed("registration frame".into()));
            }
            let ip = String::from_utf8(buf.split_to(ip_len).to_vec())
                .map_err(|_| FrameError::Malformed("registration ip".into()))?;
            let coord_port = buf.get_u16_le();
            let host_type = HostType::from_u8(buf.get_u8());
            let num_containers = buf.get_u32_le();
            let mut containers = Vec::with_capacity(num_containers as usize);
            for _ in 0..num_containers {
                if buf.remaining() < 21 {
                    return Err(FrameError::Malformed("registration container".into()));
                }
                containers.push(ContainerInfo {
                    id: buf.get_i32_le(),
                    container_type: ContainerType::from_u8(buf.get_u8()),
                    usage: buf.get_u64_le(),
                    capacity: buf.get_u64_le(),
                });
            }
            msg.registration = Some(AgentRegistration {
                ip,
                coord_port,
                host_type,
                containers,
            });
        }

        if r.u8_frame("sysinfo flag")? != 0 {
            let buf = r.next_frame("sysinfo")?;
            msg.sysinfo = Some(decode_sysinfo(buf)?);
        }

        Ok(msg)
    }
}

pub fn encode_sysinfo(info: &SysInfo) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u8(info.cpu_num);
    for usage in info.cpu_usage.iter().take(info.cpu_num as usize) {
        buf.put_f32_le(*usage);
    }
    buf.put_u32_le(info.mem_total);
    buf.put_u32_le(info.mem_free);
    buf.put_f64_le(info.net_in);
    buf.put_f64_le(info.net_out);
    buf.put_u8(info.host_type);
    buf.freeze()
}

pub fn decode_sysinfo(mut buf: Bytes) -> Result<SysInfo, FrameError> {
    if buf.remaining() < 1 {
        return Err(FrameError::Malformed("sysinfo frame".into()));
    }
    let cpu_num = buf.get_u8();
    if buf.remaining() < cpu_num as usize * 4 + 25 {
        return Err(FrameError::Malformed("sysinfo frame".into()));
    }
    let mut cpu_usage = Vec::with_capacity(cpu_num as usize);
    for _ in 0..cpu_num {
        cpu_usage.push(buf.get_f32_le());
    }
    Ok(SysInfo {
        cpu_num,
        cpu_usage,
        mem_total: buf.get_u32_le(),
        mem_free: buf.get_u32_le(),
        net_in: buf.get_f64_le(),
        net_out: buf.get_f64_le(),
        host_type: buf.get_u8(),
    })
}

#[cfg(test)]
mod test {
    use super::*;

    fn chunk(id: u16, data: Option<&[u8]>) -> ChunkPayload {
        let mut meta = ChunkMeta::default();
        meta.namespace_id = 1;
        meta.fuuid = Uuid::new_v4();
        meta.chunk_id = id;
        meta.file_version = 3;
        meta.size = data.map(|d| d.len() as u32).unwrap_or(0);
        meta.md5 = [id as u8; MD5_DIGEST_LENGTH];
        ChunkPayload {
            meta,
            data: data.map(|d| Bytes::copy_from_slice(d)),
        }
    }

    #[test]
    fn chunk_request_round_trip() {
        let mut msg = AgentMessage::new(Opcode::PutChunkReq);
        msg.chunks.push(chunk(0, Some(b"hello")));
        msg.chunks.push(chunk(1, None));
        msg.container_ids = vec![3, -1];
        let decoded = AgentMessage::decode(msg.encode()).unwrap();
        assert_eq!(decoded.opcode, Opcode::PutChunkReq);
        assert_eq!(decoded.chunks.len(), 2);
        assert_eq!(decoded.chunks[0].data.as_deref(), Some(&b"hello"[..]));
        assert!(decoded.chunks[1].data.is_none());
        assert_eq!(decoded.chunks[1].meta.chunk_id, 1);
        assert_eq!(decoded.container_ids, vec![3, -1]);
        assert!(decoded.repair.is_none());
    }

    #[test]
    fn repair_request_round_trip() {
        let mut msg = AgentMessage::new(Opcode::RprChunkReq);
        msg.chunks.push(chunk(2, None));
        msg.container_ids = vec![9];
        msg.repair = Some(RepairContext {
            scheme: 0,
            repair_using_car: true,
            num_input_chunks: 2,
            chunk_id_offset: 4,
            matrix: vec![1, 2, 3, 4],
            chunk_group_map: vec![2, 0, 1],
            container_group_map: vec![5, 6],
            agents: vec!["10.0.0.1:57002".into(), "10.0.0.2:57002".into()],
        });
        let decoded = AgentMessage::decode(msg.encode()).unwrap();
        let ctx = decoded.repair.unwrap();
        assert!(ctx.repair_using_car);
        assert_eq!(ctx.chunk_id_offset, 4);
        assert_eq!(ctx.matrix, vec![1, 2, 3, 4]);
        assert_eq!(ctx.chunk_group_map, vec![2, 0, 1]);
        assert_eq!(ctx.agents.len(), 2);
    }

    #[test]
    fn coordinator_messages_round_trip() {
        let mut msg = AgentMessage::new(Opcode::RegAgentReq);
        msg.registration = Some(AgentRegistration {
            ip: "10.1.2.3".into(),
            coord_port: 57003,
            host_type: HostType::OnPrem,
            containers: vec![ContainerInfo {
                id: 11,
                container_type: ContainerType::Fs,
                usage: 10,
                capacity: 1000,
            }],
        });
        let decoded = AgentMessage::decode(msg.encode()).unwrap();
        let reg = decoded.registration.unwrap();
        assert_eq!(reg.addr(), "10.1.2.3:57003");
        assert_eq!(reg.containers[0].capacity, 1000);

        let mut msg = AgentMessage::new(Opcode::GetSysinfoRep);
        msg.sysinfo = Some(SysInfo {
            cpu_num: 2,
            cpu_usage: vec![10.0, 20.0],
            mem_total: 2048,
            mem_free: 1024,
            net_in: 1.5,
            net_out: 0.5,
            host_type: 0,
        });
        let decoded = AgentMessage::decode(msg.encode()).unwrap();
        let info = decoded.sysinfo.unwrap();
        assert_eq!(info.cpu_num, 2);
        assert_eq!(info.avg_cpu_usage(), 15.0);

        let ping = AgentMessage::new(Opcode::SynPing);
        let decoded = AgentMessage::decode(ping.encode()).unwrap();
        assert!(decoded.is_success_for(Opcode::SynPing) == false);
        assert_eq!(decoded.opcode, Opcode::SynPing);
    }
}
