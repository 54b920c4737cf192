//! Coordinator wire listener: agent registration, keepalive and sysinfo.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use tokio::net::TcpListener;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use ecs_api_types::HostType;
use ecs_client::{AgentMessage, Opcode};

use crate::tools::{sysinfo, RunningFlag};

use super::ProxyCoordinator;

fn handle_event(coordinator: &ProxyCoordinator, request: AgentMessage) -> AgentMessage {
    match request.opcode {
        Opcode::RegAgentReq => match request.registration {
            Some(reg) => {
                let ip = reg.ip.clone();
                match coordinator.register_agent(reg) {
                    Ok(()) => {
                        coordinator.set_agent_alive(&ip);
                        AgentMessage::reply(Opcode::RegAgentRepSuccess)
                    }
                    Err(err) => {
                        warn!("agent registration failed - {err}");
                        AgentMessage::reply(Opcode::RegAgentRepFail)
                    }
                }
            }
            None => AgentMessage::reply(Opcode::RegAgentRepFail),
        },
        Opcode::UpdAgentReq => {
            if let Some(reg) = request.registration {
                let ip = reg.ip.clone();
                if let Err(err) = coordinator.register_agent(reg) {
                    warn!("agent update failed - {err}");
                }
                coordinator.set_agent_alive(&ip);
            }
            AgentMessage::reply(Opcode::UpdAgentRep)
        }
        Opcode::SynPing => {
            if let Some(reg) = &request.registration {
                coordinator.set_agent_alive(&reg.ip);
            }
            AgentMessage::reply(Opcode::AckPing)
        }
        Opcode::GetSysinfoReq => {
            let mut reply = AgentMessage::reply(Opcode::GetSysinfoRep);
            reply.sysinfo = Some(sysinfo::collect(HostType::OnPrem));
            reply
        }
        other => {
            debug!("unexpected coordinator event {other:?}");
            AgentMessage::reply(Opcode::UnknownOp)
        }
    }
}

/// Accept loop of the coordinator endpoint. Runs until shutdown.
pub async fn run_coordinator_listener(
    coordinator: Arc<ProxyCoordinator>,
    listener: TcpListener,
    running: RunningFlag,
) {
    info!(
        "coordinator listening on {}",
        listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_default()
    );
    while running.is_running() {
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(err) => {
                error!("coordinator accept failed - {err}");
                continue;
            }
        };
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            let codec = LengthDelimitedCodec::builder()
                .little_endian()
                .max_frame_length(1 << 24)
                .new_codec();
            let mut framed = Framed::new(stream, codec);
            while let Some(frame) = framed.next().await {
                let frame = match frame {
                    Ok(frame) => frame,
                    Err(err) => {
                        debug!("coordinator connection from {peer} failed - {err}");
                        return;
                    }
                };
                let reply = match AgentMessage::decode(frame.freeze()) {
                    Ok(request) => handle_event(&coordinator, request),
                    Err(err) => {
                        warn!("malformed coordinator event from {peer} - {err}");
                        AgentMessage::reply(Opcode::UnknownOp)
                    }
                };
                if framed.send(reply.encode()).await.is_err() {
                    return;
                }
            }
        });
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::coordinator::test::registration;
    use ecs_api_types::DistributionPolicy;
    use ecs_client::{TcpTransport, Transport};
    use std::time::Duration;

    #[tokio::test]
    async fn register_and_ping_over_the_wire() {
        let transport: Arc<dyn Transport> =
            Arc::new(TcpTransport::new(Duration::from_secs(5), false));
        let coordinator = Arc::new(ProxyCoordinator::new(
            transport.clone(),
            ecs_client::new_container_map(),
            DistributionPolicy::Static,
            Vec::new(),
            Duration::from_secs(3600),
        ));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let running = RunningFlag::new();
        tokio::spawn(run_coordinator_listener(
            coordinator.clone(),
            listener,
            running.clone(),
        ));

        let mut msg = AgentMessage::new(Opcode::RegAgentReq);
        msg.registration = Some(registration("10.9.9.9", &[42], 0, 1000));
        let reply = transport.exchange(&addr, msg).await.unwrap();
        assert_eq!(reply.opcode, Opcode::RegAgentRepSuccess);
        assert_eq!(coordinator.num_agents(), 1);

        let reply = transport
            .exchange(&addr, AgentMessage::new(Opcode::SynPing))
            .await
            .unwrap();
        assert_eq!(reply.opcode, Opcode::AckPing);

        let reply = transport
            .exchange(&addr, AgentMessage::new(Opcode::GetSysinfoReq))
            .await
            .unwrap();
        assert!(reply.sysinfo.is_some());
        running.shutdown();
    }
}
