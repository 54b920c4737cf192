//! End-to-end checks of the client wire protocol.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use ecs_client::frame::{FrameReader, FrameWriter};
use ecs_config::Config;
use ecstore::api::{run_client_interface, ClientOpcode};
use ecstore::testing::{HarnessParams, ProxyHarness};
use ecstore::tools::RunningFlag;

struct Client {
    framed: Framed<TcpStream, LengthDelimitedCodec>,
}

impl Client {
    async fn connect(addr: &str) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let codec = LengthDelimitedCodec::builder()
            .little_endian()
            .max_frame_length(1 << 30)
            .new_codec();
        Self {
            framed: Framed::new(stream, codec),
        }
    }

    async fn exchange(&mut self, request: Bytes) -> FrameReader {
        self.framed.send(request).await.unwrap();
        let reply = self.framed.next().await.unwrap().unwrap();
        FrameReader::new(reply.freeze())
    }
}

async fn start_service() -> (ProxyHarness, String, RunningFlag) {
    let h = ProxyHarness::new(Config::default(), HarnessParams::default());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let running = RunningFlag::new();
    tokio::spawn(run_client_interface(
        h.proxy.clone(),
        listener,
        running.clone(),
    ));
    (h, addr, running)
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 256) as u8).collect()
}

#[tokio::test]
async fn write_read_list_delete_over_the_wire() {
    let (_h, addr, running) = start_service().await;
    let mut client = Client::connect(&addr).await;
    let data = pattern(3 << 20);

    // write
    let mut w = FrameWriter::new();
    w.put_u32_frame(ClientOpcode::WriteFileReq as u32);
    w.put_u8_frame(0);
    w.put_str_frame("wire/a");
    w.put_u64_frame(data.len() as u64);
    w.put_str_frame("");
    w.put_u8_frame(0);
    w.put_frame(&data);
    let mut r = client.exchange(w.finish()).await;
    assert_eq!(
        r.u32_frame("opcode").unwrap(),
        ClientOpcode::WriteFileRepSuccess as u32
    );

    // read back
    let mut w = FrameWriter::new();
    w.put_u32_frame(ClientOpcode::ReadFileReq as u32);
    w.put_u8_frame(0);
    w.put_str_frame("wire/a");
    w.put_u8_frame(0);
    let mut r = client.exchange(w.finish()).await;
    assert_eq!(
        r.u32_frame("opcode").unwrap(),
        ClientOpcode::ReadFileRepSuccess as u32
    );
    assert_eq!(r.u64_frame("size").unwrap(), data.len() as u64);
    assert_eq!(r.u8_frame("is cached").unwrap(), 0);
    assert_eq!(r.next_frame("data").unwrap(), &data[..]);

    // ranged read
    let mut w = FrameWriter::new();
    w.put_u32_frame(ClientOpcode::ReadFileRangeReq as u32);
    w.put_u8_frame(0);
    w.put_str_frame("wire/a");
    w.put_u64_frame(4096);
    w.put_u64_frame(1 << 20);
    w.put_u8_frame(0);
    let mut r = client.exchange(w.finish()).await;
    assert_eq!(
        r.u32_frame("opcode").unwrap(),
        ClientOpcode::ReadFileRangeRepSuccess as u32
    );
    assert_eq!(r.u64_frame("offset").unwrap(), 1 << 20);
    assert_eq!(r.u64_frame("size").unwrap(), 4096);
    assert_eq!(r.u8_frame("is cached").unwrap(), 0);
    assert_eq!(
        r.next_frame("data").unwrap(),
        &data[1 << 20..(1 << 20) + 4096]
    );

    // list
    let mut w = FrameWriter::new();
    w.put_u32_frame(ClientOpcode::GetFileListReq as u32);
    w.put_u8_frame(0);
    w.put_str_frame("wire/");
    let mut r = client.exchange(w.finish()).await;
    assert_eq!(
        r.u32_frame("opcode").unwrap(),
        ClientOpcode::GetFileListRepSuccess as u32
    );
    assert_eq!(r.u32_frame("total").unwrap(), 1);
    assert_eq!(r.str_frame("name").unwrap(), "wire/a");
    assert_eq!(r.u64_frame("size").unwrap(), data.len() as u64);

    // delete
    let mut w = FrameWriter::new();
    w.put_u32_frame(ClientOpcode::DelFileReq as u32);
    w.put_u8_frame(0);
    w.put_str_frame("wire/a");
    let mut r = client.exchange(w.finish()).await;
    assert_eq!(
        r.u32_frame("opcode").unwrap(),
        ClientOpcode::DelFileRepSuccess as u32
    );

    // reading a deleted file answers with the failure mate only
    let mut w = FrameWriter::new();
    w.put_u32_frame(ClientOpcode::ReadFileReq as u32);
    w.put_u8_frame(0);
    w.put_str_frame("wire/a");
    w.put_u8_frame(0);
    let mut r = client.exchange(w.finish()).await;
    assert_eq!(
        r.u32_frame("opcode").unwrap(),
        ClientOpcode::ReadFileRepFail as u32
    );
    assert!(r.is_empty());

    running.shutdown();
}

#[tokio::test]
async fn status_queries_over_the_wire() {
    let (h, addr, running) = start_service().await;
    let mut client = Client::connect(&addr).await;
    h.proxy
        .write_file(0, "a", "", &pattern(2 << 20))
        .await
        .unwrap();
    h.coordinator.update_agent_status().await;

    // capacity
    let mut w = FrameWriter::new();
    w.put_u32_frame(ClientOpcode::GetCapacityReq as u32);
    let mut r = client.exchange(w.finish()).await;
    assert_eq!(
        r.u32_frame("opcode").unwrap(),
        ClientOpcode::GetCapacityRepSuccess as u32
    );
    let usage = r.u64_frame("usage").unwrap();
    let capacity = r.u64_frame("capacity").unwrap();
    assert!(usage > 0 && capacity >= usage);
    assert_eq!(r.u64_frame("count").unwrap(), 1);
    assert!(r.u64_frame("limit").unwrap() >= 1);

    // append size of the default storage class: k * max_chunk_size
    let mut w = FrameWriter::new();
    w.put_u32_frame(ClientOpcode::GetAppendSizeReq as u32);
    w.put_str_frame("");
    let mut r = client.exchange(w.finish()).await;
    assert_eq!(
        r.u32_frame("opcode").unwrap(),
        ClientOpcode::GetAppendSizeRepSuccess as u32
    );
    assert_eq!(r.u64_frame("length").unwrap(), 2 << 20);

    // agent status
    let mut w = FrameWriter::new();
    w.put_u32_frame(ClientOpcode::GetAgentStatusReq as u32);
    let mut r = client.exchange(w.finish()).await;
    assert_eq!(
        r.u32_frame("opcode").unwrap(),
        ClientOpcode::GetAgentStatusRepSuccess as u32
    );
    let total = r.u32_frame("total").unwrap();
    assert_eq!(total, 6);
    // first agent entry decodes
    assert_eq!(r.u8_frame("alive").unwrap(), 1);
    let ip = r.str_frame("ip").unwrap();
    assert!(ip.starts_with("10.0.0."));

    // repair stats
    let mut w = FrameWriter::new();
    w.put_u32_frame(ClientOpcode::GetRepairStatsReq as u32);
    let mut r = client.exchange(w.finish()).await;
    assert_eq!(
        r.u32_frame("opcode").unwrap(),
        ClientOpcode::GetRepairStatsRepSuccess as u32
    );
    assert_eq!(r.u64_frame("file count").unwrap(), 1);
    assert_eq!(r.u64_frame("repair count").unwrap(), 0);

    running.shutdown();
}

#[tokio::test]
async fn cached_transfer_uses_files() {
    let (_h, addr, running) = start_service().await;
    let mut client = Client::connect(&addr).await;
    let dir = tempfile::tempdir().unwrap();
    let data = pattern(1 << 20);

    let upload = dir.path().join("upload.bin");
    std::fs::write(&upload, &data).unwrap();

    let mut w = FrameWriter::new();
    w.put_u32_frame(ClientOpcode::WriteFileReq as u32);
    w.put_u8_frame(0);
    w.put_str_frame("cached");
    w.put_u64_frame(data.len() as u64);
    w.put_str_frame("");
    w.put_u8_frame(1);
    w.put_str_frame(upload.to_str().unwrap());
    let mut r = client.exchange(w.finish()).await;
    assert_eq!(
        r.u32_frame("opcode").unwrap(),
        ClientOpcode::WriteFileRepSuccess as u32
    );

    let download = dir.path().join("download.bin");
    let mut w = FrameWriter::new();
    w.put_u32_frame(ClientOpcode::ReadFileReq as u32);
    w.put_u8_frame(0);
    w.put_str_frame("cached");
    w.put_u8_frame(1);
    w.put_str_frame(download.to_str().unwrap());
    let mut r = client.exchange(w.finish()).await;
    assert_eq!(
        r.u32_frame("opcode").unwrap(),
        ClientOpcode::ReadFileRepSuccess as u32
    );
    assert_eq!(r.u64_frame("size").unwrap(), data.len() as u64);
    assert_eq!(r.u8_frame("is cached").unwrap(), 1);
    assert_eq!(r.str_frame("path").unwrap(), download.to_str().unwrap());
    assert_eq!(std::fs::read(&download).unwrap(), data);

    running.shutdown();
}
