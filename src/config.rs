//! Responder Configuration
//!
//! Listen address and the timeouts that bound TCP connections and shutdown.
//! Values come from an optional TOML file, then CLI overrides.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Result, ServerError};

/// Smallest UDP payload every DNS implementation must accept
const DNS_MIN_UDP_SIZE: usize = 512;

/// Main configuration for the responder
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address for both the UDP and TCP listeners (`host:port`, `:port`)
    pub listen: String,

    /// Deadline for each server's graceful close (seconds)
    pub shutdown_timeout_secs: u64,

    /// Time allowed to read a TCP message body once its length arrived (seconds)
    pub tcp_read_timeout_secs: u64,

    /// Time a TCP connection may sit between queries (seconds)
    pub tcp_idle_timeout_secs: u64,

    /// UDP receive buffer size (bytes)
    pub udp_buffer_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: ":5353".to_string(),
            shutdown_timeout_secs: 5,
            tcp_read_timeout_secs: 2,
            tcp_idle_timeout_secs: 8,
            udp_buffer_size: 65535,
        }
    }
}

impl ServerConfig {
    /// Load configuration from TOML file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn with_listen(mut self, listen: Option<String>) -> Self {
        if let Some(listen) = listen {
            self.listen = listen;
        }
        self
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn tcp_read_timeout(&self) -> Duration {
        Duration::from_secs(self.tcp_read_timeout_secs)
    }

    pub fn tcp_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.tcp_idle_timeout_secs)
    }

    /// Parsed form of `listen`
    pub fn listen_address(&self) -> Result<ListenAddress> {
        self.listen.parse()
    }

    /// Validate configuration values
    pub fn validate(&self) -> anyhow::Result<()> {
        self.listen_address()?;

        if self.shutdown_timeout_secs == 0 {
            anyhow::bail!("shutdown_timeout_secs must be greater than 0");
        }

        if self.tcp_read_timeout_secs == 0 || self.tcp_idle_timeout_secs == 0 {
            anyhow::bail!(
                "TCP timeouts must be greater than 0 (read={}, idle={})",
                self.tcp_read_timeout_secs,
                self.tcp_idle_timeout_secs
            );
        }

        if self.udp_buffer_size < DNS_MIN_UDP_SIZE {
            anyhow::bail!(
                "udp_buffer_size ({}) must be at least {} bytes",
                self.udp_buffer_size,
                DNS_MIN_UDP_SIZE
            );
        }

        Ok(())
    }
}

/// A `host:port` pair. An empty host listens on every interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenAddress {
    host: String,
    port: u16,
}

impl ListenAddress {
    /// True for `:port`, which listens on every interface
    pub fn is_wildcard(&self) -> bool {
        self.host.is_empty()
    }

    /// IPv4-only wildcard, for hosts without IPv6
    pub fn ipv4_wildcard(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.port))
    }

    /// Resolve to the first socket address for the host.
    ///
    /// An empty host is the dual-stack wildcard `[::]`.
    pub async fn resolve(&self) -> Result<SocketAddr> {
        if self.is_wildcard() {
            return Ok(SocketAddr::from((Ipv6Addr::UNSPECIFIED, self.port)));
        }

        let target = self.to_string();
        let mut addrs = tokio::net::lookup_host(target.as_str())
            .await
            .map_err(|source| ServerError::Resolve {
                addr: target.clone(),
                source,
            })?;
        let first = addrs.next();
        drop(addrs);

        first.ok_or(ServerError::InvalidListenAddress(target))
    }
}

impl FromStr for ListenAddress {
    type Err = ServerError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || ServerError::InvalidListenAddress(s.to_string());

        let (host, port) = s.rsplit_once(':').ok_or_else(invalid)?;
        let port: u16 = port.parse().map_err(|_| invalid())?;

        let host = match host.strip_prefix('[') {
            Some(rest) => rest.strip_suffix(']').ok_or_else(invalid)?,
            // Bare IPv6 literals are ambiguous without brackets
            None if host.contains(':') => return Err(invalid()),
            None => host,
        };

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for ListenAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.is_empty() {
            write!(f, ":{}", self.port)
        } else if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}
