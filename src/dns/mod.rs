//! DNS Server Module
//!
//! Accepts DNS queries over UDP and TCP and answers each one with
//! SERVER FAILURE.
//!
//! ## Layout
//!
//! - `handler`: the SERVFAIL query handler
//! - `mux`: dispatch table keyed by domain suffix
//! - `server`: per-transport server with bounded graceful shutdown
//! - `udp` / `tcp`: receive/accept loops and response writers

mod handler;
mod mux;
mod server;
mod tcp;
mod udp;

#[cfg(test)]
pub(crate) mod test_support;

pub use handler::{servfail_reply, ServFailHandler};
pub use mux::ServeMux;
pub use server::{bind_listeners, ServerOptions};
#[cfg(test)]
pub(crate) use server::{DnsServer, ServerState};

use async_trait::async_trait;
use hickory_proto::op::Message;
use std::fmt;
use std::net::SocketAddr;

use crate::error::Result;

/// Transport a query arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Udp,
    Tcp,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Udp => f.write_str("udp"),
            Transport::Tcp => f.write_str("tcp"),
        }
    }
}

/// Sends a response back to the client that asked
#[async_trait]
pub trait ResponseWriter: Send {
    fn transport(&self) -> Transport;

    fn remote_addr(&self) -> SocketAddr;

    /// Serialize and transmit one message
    async fn write_msg(&mut self, msg: &Message) -> Result<()>;
}

/// Answers decoded queries
///
/// Implementations own their failure handling: nothing is returned, so a
/// reply that cannot be sent never affects other in-flight queries.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn serve_dns(&self, writer: &mut dyn ResponseWriter, request: &Message);
}
