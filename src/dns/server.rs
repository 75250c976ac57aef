//! Protocol Server
//!
//! One server per transport. `activate_and_serve` runs the receive/accept
//! loop until `shutdown` is called; `shutdown` waits for the loop to finish
//! within a deadline and aborts whatever is left when it expires.

use async_trait::async_trait;
use hickory_proto::op::{Header, Message, MessageType};
use hickory_proto::serialize::binary::BinDecodable;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{ListenAddress, ServerConfig};
use crate::dns::handler::malformed_reply;
use crate::dns::{tcp, udp, Handler, ResponseWriter, Transport};
use crate::error::{Result, ServerError};
use crate::lifecycle::Service;

/// errno values for descriptor exhaustion (Linux and the BSDs agree)
const ENFILE: i32 = 23;
const EMFILE: i32 = 24;
/// Linux errno for a socket family the kernel was built without
const EAFNOSUPPORT: i32 = 97;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Idle,
    Running,
    ShuttingDown,
    Stopped,
}

/// Per-connection limits shared by both transports
#[derive(Debug, Clone, Copy)]
pub struct ServerOptions {
    pub tcp_read_timeout: Duration,
    pub tcp_idle_timeout: Duration,
    pub udp_buffer_size: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self::from(&ServerConfig::default())
    }
}

impl From<&ServerConfig> for ServerOptions {
    fn from(config: &ServerConfig) -> Self {
        Self {
            tcp_read_timeout: config.tcp_read_timeout(),
            tcp_idle_timeout: config.tcp_idle_timeout(),
            udp_buffer_size: config.udp_buffer_size,
        }
    }
}

pub(crate) enum Listener {
    Udp(UdpSocket),
    Tcp(TcpListener),
}

/// DNS server bound to a single transport
pub struct DnsServer {
    transport: Transport,
    local_addr: SocketAddr,
    /// Taken by the serve loop and dropped when it ends
    listener: Mutex<Option<Listener>>,
    handler: Arc<dyn Handler>,
    options: ServerOptions,
    /// Stop accepting work
    stop: CancellationToken,
    /// Drop in-flight work; fired when the shutdown deadline expires
    abort: CancellationToken,
    state: watch::Sender<ServerState>,
}

impl DnsServer {
    pub async fn bind_udp(
        addr: SocketAddr,
        handler: Arc<dyn Handler>,
        options: ServerOptions,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await.map_err(|source| ServerError::Bind {
            transport: Transport::Udp,
            addr: addr.to_string(),
            source,
        })?;
        let local_addr = socket.local_addr()?;

        Ok(Self::new(Transport::Udp, local_addr, Listener::Udp(socket), handler, options))
    }

    pub async fn bind_tcp(
        addr: SocketAddr,
        handler: Arc<dyn Handler>,
        options: ServerOptions,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await.map_err(|source| ServerError::Bind {
            transport: Transport::Tcp,
            addr: addr.to_string(),
            source,
        })?;
        let local_addr = listener.local_addr()?;

        Ok(Self::new(Transport::Tcp, local_addr, Listener::Tcp(listener), handler, options))
    }

    fn new(
        transport: Transport,
        local_addr: SocketAddr,
        listener: Listener,
        handler: Arc<dyn Handler>,
        options: ServerOptions,
    ) -> Self {
        let (state, _) = watch::channel(ServerState::Idle);
        Self {
            transport,
            local_addr,
            listener: Mutex::new(Some(listener)),
            handler,
            options,
            stop: CancellationToken::new(),
            abort: CancellationToken::new(),
            state,
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> ServerState {
        *self.state.borrow()
    }
}

#[async_trait]
impl Service for DnsServer {
    fn transport(&self) -> Transport {
        self.transport
    }

    async fn activate_and_serve(&self) -> Result<()> {
        let mut previous = ServerState::Idle;
        self.state.send_if_modified(|state| {
            previous = *state;
            if *state == ServerState::Idle {
                *state = ServerState::Running;
                true
            } else {
                false
            }
        });

        match previous {
            ServerState::Idle => {}
            ServerState::Running => return Err(ServerError::AlreadyServing(self.transport)),
            // Shut down before it ever ran
            ServerState::ShuttingDown | ServerState::Stopped => return Ok(()),
        }

        debug!("{} server serving on {}", self.transport, self.local_addr);

        let listener = self.listener.lock().await.take();
        let handler = self.handler.clone();
        let result = match listener {
            Some(Listener::Udp(socket)) => {
                udp::serve(socket, handler, &self.options, &self.stop, &self.abort).await
            }
            Some(Listener::Tcp(listener)) => {
                tcp::serve(listener, handler, &self.options, &self.stop, &self.abort).await
            }
            None => Ok(()),
        };

        self.state.send_replace(ServerState::Stopped);
        result
    }

    async fn shutdown(&self, timeout: Duration) -> Result<()> {
        self.state.send_if_modified(|state| match *state {
            ServerState::Idle => {
                *state = ServerState::Stopped;
                true
            }
            ServerState::Running => {
                *state = ServerState::ShuttingDown;
                true
            }
            ServerState::ShuttingDown | ServerState::Stopped => false,
        });
        self.stop.cancel();

        let mut state = self.state.subscribe();
        let stopped = tokio::time::timeout(
            timeout,
            state.wait_for(|s| *s == ServerState::Stopped),
        )
        .await
        .is_ok();

        if stopped {
            Ok(())
        } else {
            self.abort.cancel();
            Err(ServerError::ShutdownTimeout {
                transport: self.transport,
                timeout,
            })
        }
    }
}

/// Bind UDP then TCP on the same address.
///
/// TCP reuses the port UDP actually got, so `:0` yields one shared port.
/// When UDP fails TCP is never attempted. A wildcard address binds `[::]`
/// and drops to `0.0.0.0` on hosts without IPv6.
pub async fn bind_listeners(
    address: &ListenAddress,
    handler: Arc<dyn Handler>,
    options: ServerOptions,
) -> Result<(Arc<DnsServer>, Arc<DnsServer>)> {
    let addr = address.resolve().await?;

    let udp = match DnsServer::bind_udp(addr, handler.clone(), options).await {
        Err(ServerError::Bind { source, .. }) if address.is_wildcard() && ipv6_unavailable(&source) => {
            debug!("IPv6 unavailable ({}), listening on IPv4 only", source);
            DnsServer::bind_udp(address.ipv4_wildcard(), handler.clone(), options).await?
        }
        bound => bound?,
    };
    let tcp = DnsServer::bind_tcp(udp.local_addr(), handler, options).await?;

    Ok((Arc::new(udp), Arc::new(tcp)))
}

fn ipv6_unavailable(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::AddrNotAvailable | io::ErrorKind::Unsupported
    ) || e.raw_os_error() == Some(EAFNOSUPPORT)
}

/// Decode raw bytes and hand the request to the handler.
///
/// Responses are dropped. Undecodable messages with a readable query header
/// get a bare SERVFAIL.
pub(crate) async fn dispatch(
    handler: &dyn Handler,
    writer: &mut dyn ResponseWriter,
    bytes: &[u8],
) {
    match Message::from_bytes(bytes) {
        Ok(request) if request.message_type() == MessageType::Response => {
            debug!("Ignoring DNS response from {}", writer.remote_addr());
        }
        Ok(request) => handler.serve_dns(writer, &request).await,
        Err(e) => match Header::from_bytes(bytes) {
            Ok(header) if header.message_type() == MessageType::Query => {
                debug!("Malformed DNS query from {}: {}", writer.remote_addr(), e);
                let response = malformed_reply(&header);
                if let Err(e) = writer.write_msg(&response).await {
                    warn!(error = %e, peer = %writer.remote_addr(), "Failed to write DNS response");
                }
            }
            _ => debug!("Dropping undecodable packet from {}: {}", writer.remote_addr(), e),
        },
    }
}

/// Errors a receive/accept loop retries instead of failing on
pub(crate) fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionRefused
    ) || matches!(e.raw_os_error(), Some(ENFILE) | Some(EMFILE))
}

/// Wait for in-flight tasks, or abort them once the shutdown deadline fires
pub(crate) async fn drain(mut tasks: JoinSet<()>, abort: &CancellationToken, transport: Transport) {
    let drained = tokio::select! {
        _ = async {
            while let Some(joined) = tasks.join_next().await {
                log_task_result(joined, transport);
            }
        } => true,
        _ = abort.cancelled() => false,
    };

    if !drained {
        warn!("Aborting {} in-flight {} tasks", tasks.len(), transport);
        tasks.shutdown().await;
    }
}

pub(crate) fn log_task_result(joined: std::result::Result<(), tokio::task::JoinError>, transport: Transport) {
    if let Err(e) = joined {
        if e.is_panic() {
            warn!("{} request task panicked: {:?}", transport, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::test_support::{query_message, RecordingWriter};
    use crate::dns::ServFailHandler;
    use hickory_proto::op::ResponseCode;
    use hickory_proto::rr::RecordType;
    use hickory_proto::serialize::binary::BinEncodable;

    fn loopback() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 0))
    }

    #[test]
    fn test_transient_errors() {
        assert!(is_transient(&io::Error::from(io::ErrorKind::ConnectionReset)));
        assert!(is_transient(&io::Error::from_raw_os_error(EMFILE)));
        assert!(!is_transient(&io::Error::from(io::ErrorKind::PermissionDenied)));
    }

    #[tokio::test]
    async fn test_dispatch_answers_query() {
        let mut writer = RecordingWriter::default();
        let bytes = query_message(11, &[("example.com.", RecordType::A)])
            .to_bytes()
            .unwrap();

        dispatch(&ServFailHandler, &mut writer, &bytes).await;

        assert_eq!(writer.sent.len(), 1);
        assert_eq!(writer.sent[0].id(), 11);
    }

    #[tokio::test]
    async fn test_dispatch_ignores_responses() {
        let mut writer = RecordingWriter::default();
        let mut response = query_message(12, &[("example.com.", RecordType::A)]);
        response.set_message_type(MessageType::Response);

        dispatch(&ServFailHandler, &mut writer, &response.to_bytes().unwrap()).await;

        assert_eq!(writer.attempts, 0);
    }

    #[tokio::test]
    async fn test_dispatch_malformed_query() {
        let mut writer = RecordingWriter::default();
        // Header claims one question that is not there
        let bytes = [0x12, 0x34, 0x01, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0, 0x05];

        dispatch(&ServFailHandler, &mut writer, &bytes).await;

        assert_eq!(writer.sent.len(), 1);
        assert_eq!(writer.sent[0].id(), 0x1234);
        assert_eq!(writer.sent[0].response_code(), ResponseCode::ServFail);
    }

    #[tokio::test]
    async fn test_dispatch_drops_short_garbage() {
        let mut writer = RecordingWriter::default();
        dispatch(&ServFailHandler, &mut writer, &[0xff, 0x00, 0x01]).await;
        assert_eq!(writer.attempts, 0);
    }

    #[tokio::test]
    async fn test_shutdown_before_serve() {
        let server = DnsServer::bind_udp(loopback(), Arc::new(ServFailHandler), ServerOptions::default())
            .await
            .unwrap();

        server.shutdown(Duration::from_secs(1)).await.unwrap();
        assert_eq!(server.state(), ServerState::Stopped);

        // Returns immediately without serving
        server.activate_and_serve().await.unwrap();
        assert_eq!(server.state(), ServerState::Stopped);
    }

    #[tokio::test]
    async fn test_serve_then_shutdown() {
        let server = Arc::new(
            DnsServer::bind_tcp(loopback(), Arc::new(ServFailHandler), ServerOptions::default())
                .await
                .unwrap(),
        );

        let serving = tokio::spawn({
            let server = server.clone();
            async move { server.activate_and_serve().await }
        });

        let mut state = server.state.subscribe();
        state.wait_for(|s| *s == ServerState::Running).await.unwrap();

        assert!(matches!(
            server.activate_and_serve().await,
            Err(ServerError::AlreadyServing(Transport::Tcp))
        ));

        server.shutdown(Duration::from_secs(5)).await.unwrap();
        serving.await.unwrap().unwrap();
        assert_eq!(server.state(), ServerState::Stopped);

        // Idempotent
        server.shutdown(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_bind_listeners_share_port() {
        let address: ListenAddress = "127.0.0.1:0".parse().unwrap();
        let (udp, tcp) = bind_listeners(&address, Arc::new(ServFailHandler), ServerOptions::default())
            .await
            .unwrap();

        assert_eq!(udp.transport(), Transport::Udp);
        assert_eq!(tcp.transport(), Transport::Tcp);
        assert_eq!(udp.local_addr(), tcp.local_addr());
    }

    #[test]
    fn test_ipv6_unavailable_errors() {
        assert!(ipv6_unavailable(&io::Error::from(io::ErrorKind::AddrNotAvailable)));
        assert!(ipv6_unavailable(&io::Error::from_raw_os_error(EAFNOSUPPORT)));
        assert!(!ipv6_unavailable(&io::Error::from(io::ErrorKind::AddrInUse)));
    }

    #[tokio::test]
    async fn test_wildcard_answers_ipv6_and_ipv4() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        // Hosts without an IPv6 loopback cannot exercise the dual-stack path
        let Ok(client) = tokio::net::UdpSocket::bind("[::1]:0").await else {
            return;
        };

        let address: ListenAddress = ":0".parse().unwrap();
        let (udp, tcp) = bind_listeners(&address, Arc::new(ServFailHandler), ServerOptions::default())
            .await
            .unwrap();
        let port = udp.local_addr().port();
        assert!(udp.local_addr().is_ipv6());

        let serving = tokio::spawn({
            let tcp = tcp.clone();
            async move { tcp.activate_and_serve().await }
        });
        let udp_serving = tokio::spawn({
            let udp = udp.clone();
            async move { udp.activate_and_serve().await }
        });

        let bytes = query_message(21, &[("example.com.", RecordType::A)])
            .to_bytes()
            .unwrap();

        client.send_to(&bytes, ("::1", port)).await.unwrap();
        let mut buf = [0u8; 512];
        let (len, _) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let response = Message::from_bytes(&buf[..len]).unwrap();
        assert_eq!(response.id(), 21);
        assert_eq!(response.response_code(), ResponseCode::ServFail);

        for host in ["::1", "127.0.0.1"] {
            let mut stream = tokio::net::TcpStream::connect((host, port)).await.unwrap();
            stream.write_u16(bytes.len() as u16).await.unwrap();
            stream.write_all(&bytes).await.unwrap();
            let len = stream.read_u16().await.unwrap() as usize;
            let mut buf = vec![0u8; len];
            stream.read_exact(&mut buf).await.unwrap();
            assert_eq!(Message::from_bytes(&buf).unwrap().id(), 21);
        }

        udp.shutdown(Duration::from_secs(5)).await.unwrap();
        tcp.shutdown(Duration::from_secs(5)).await.unwrap();
        serving.await.unwrap().unwrap();
        udp_serving.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_bind_listeners_tcp_in_use() {
        let taken = std::net::TcpListener::bind(loopback()).unwrap();
        let address: ListenAddress = taken.local_addr().unwrap().to_string().parse().unwrap();

        let result =
            bind_listeners(&address, Arc::new(ServFailHandler), ServerOptions::default()).await;

        assert!(matches!(
            result,
            Err(ServerError::Bind {
                transport: Transport::Tcp,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_bind_listeners_udp_in_use_skips_tcp() {
        let taken = std::net::UdpSocket::bind(loopback()).unwrap();
        let port = taken.local_addr().unwrap().port();
        let address: ListenAddress = format!("127.0.0.1:{}", port).parse().unwrap();

        let result =
            bind_listeners(&address, Arc::new(ServFailHandler), ServerOptions::default()).await;

        assert!(matches!(
            result,
            Err(ServerError::Bind {
                transport: Transport::Udp,
                ..
            })
        ));
        // TCP was never bound, so the port is still free for TCP
        std::net::TcpListener::bind(("127.0.0.1", port)).unwrap();
    }
}
