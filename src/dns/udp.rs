//! UDP receive loop
//!
//! Every datagram is handled on its own task so a slow reply never holds
//! up the socket.

use async_trait::async_trait;
use hickory_proto::op::Message;
use hickory_proto::serialize::binary::BinEncodable;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::dns::server::{dispatch, drain, is_transient, log_task_result, ServerOptions};
use crate::dns::{Handler, ResponseWriter, Transport};
use crate::error::{Result, ServerError};

struct UdpResponseWriter {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
}

#[async_trait]
impl ResponseWriter for UdpResponseWriter {
    fn transport(&self) -> Transport {
        Transport::Udp
    }

    fn remote_addr(&self) -> SocketAddr {
        self.peer
    }

    async fn write_msg(&mut self, msg: &Message) -> Result<()> {
        let bytes = msg.to_bytes()?;
        self.socket.send_to(&bytes, self.peer).await?;
        Ok(())
    }
}

pub(crate) async fn serve(
    socket: UdpSocket,
    handler: Arc<dyn Handler>,
    options: &ServerOptions,
    stop: &CancellationToken,
    abort: &CancellationToken,
) -> Result<()> {
    let socket = Arc::new(socket);
    let mut tasks = JoinSet::new();
    let mut buf = vec![0u8; options.udp_buffer_size];

    let result = loop {
        let received = tokio::select! {
            _ = stop.cancelled() => break Ok(()),
            Some(joined) = tasks.join_next() => {
                log_task_result(joined, Transport::Udp);
                continue;
            }
            received = socket.recv_from(&mut buf) => received,
        };

        match received {
            Ok((len, peer)) => {
                let request = buf[..len].to_vec();
                let mut writer = UdpResponseWriter {
                    socket: socket.clone(),
                    peer,
                };
                let handler = handler.clone();

                tasks.spawn(async move {
                    dispatch(handler.as_ref(), &mut writer, &request).await;
                });
            }
            Err(e) if is_transient(&e) => {
                debug!("Transient UDP receive error: {}", e);
            }
            Err(e) => {
                break Err(ServerError::Transport {
                    transport: Transport::Udp,
                    source: e,
                })
            }
        }
    };

    drain(tasks, abort, Transport::Udp).await;
    result
}
