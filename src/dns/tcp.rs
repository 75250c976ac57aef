//! TCP accept loop
//!
//! Messages are framed with a 2-byte big-endian length prefix. A connection
//! may carry several queries in sequence; it is closed on EOF, on a
//! zero-length frame, on idle/read timeout, or at the next query boundary
//! once shutdown starts.

use async_trait::async_trait;
use hickory_proto::op::Message;
use hickory_proto::serialize::binary::BinEncodable;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::dns::server::{dispatch, drain, is_transient, log_task_result, ServerOptions};
use crate::dns::{Handler, ResponseWriter, Transport};
use crate::error::{Result, ServerError};

/// Pause after a transient accept failure (e.g. descriptor exhaustion)
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

struct TcpResponseWriter {
    stream: OwnedWriteHalf,
    peer: SocketAddr,
}

#[async_trait]
impl ResponseWriter for TcpResponseWriter {
    fn transport(&self) -> Transport {
        Transport::Tcp
    }

    fn remote_addr(&self) -> SocketAddr {
        self.peer
    }

    async fn write_msg(&mut self, msg: &Message) -> Result<()> {
        let bytes = msg.to_bytes()?;
        let len = u16::try_from(bytes.len()).map_err(|_| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("DNS message too large for TCP: {} bytes", bytes.len()),
            )
        })?;

        let mut frame = Vec::with_capacity(bytes.len() + 2);
        frame.extend_from_slice(&len.to_be_bytes());
        frame.extend_from_slice(&bytes);

        self.stream.write_all(&frame).await?;
        self.stream.flush().await?;
        Ok(())
    }
}

pub(crate) async fn serve(
    listener: TcpListener,
    handler: Arc<dyn Handler>,
    options: &ServerOptions,
    stop: &CancellationToken,
    abort: &CancellationToken,
) -> Result<()> {
    let mut tasks = JoinSet::new();

    let result = loop {
        let accepted = tokio::select! {
            _ = stop.cancelled() => break Ok(()),
            Some(joined) = tasks.join_next() => {
                log_task_result(joined, Transport::Tcp);
                continue;
            }
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                debug!("TCP connection from {} (active: {})", peer, tasks.len() + 1);
                tasks.spawn(handle_connection(
                    stream,
                    peer,
                    handler.clone(),
                    *options,
                    stop.clone(),
                ));
            }
            Err(e) if is_transient(&e) => {
                debug!("Transient TCP accept error: {}", e);
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
            Err(e) => {
                break Err(ServerError::Transport {
                    transport: Transport::Tcp,
                    source: e,
                })
            }
        }
    };

    // Refuse new connections while the open ones finish
    drop(listener);
    drain(tasks, abort, Transport::Tcp).await;
    result
}

/// Serve queries on one connection until it closes
async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    handler: Arc<dyn Handler>,
    options: ServerOptions,
    stop: CancellationToken,
) {
    let (mut reader, writer) = stream.into_split();
    let mut writer = TcpResponseWriter {
        stream: writer,
        peer,
    };

    loop {
        let len = tokio::select! {
            _ = stop.cancelled() => break,
            len = tokio::time::timeout(options.tcp_idle_timeout, reader.read_u16()) => len,
        };

        let len = match len {
            Ok(Ok(0)) => break,
            Ok(Ok(len)) => len as usize,
            Ok(Err(e)) => {
                if e.kind() != std::io::ErrorKind::UnexpectedEof {
                    debug!("TCP read error from {}: {}", peer, e);
                }
                break;
            }
            Err(_) => {
                debug!("TCP connection from {} idle, closing", peer);
                break;
            }
        };

        let mut request = vec![0u8; len];
        match tokio::time::timeout(options.tcp_read_timeout, reader.read_exact(&mut request)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                debug!("TCP read error from {}: {}", peer, e);
                break;
            }
            Err(_) => {
                debug!("TCP read from {} timed out", peer);
                break;
            }
        }

        dispatch(handler.as_ref(), &mut writer, &request).await;
    }
}
