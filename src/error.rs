//! Error types for the responder
//!
//! Per-query failures never leave the handler; everything here is a
//! lifecycle-level error that the coordinator turns into an exit status.

use std::time::Duration;

use thiserror::Error;

use crate::dns::Transport;

/// Errors raised while binding, serving or shutting down the DNS listeners
#[derive(Debug, Error)]
pub enum ServerError {
    /// Listen address could not be parsed or resolved
    #[error("Invalid listen address '{0}'")]
    InvalidListenAddress(String),

    /// Listen host could not be resolved
    #[error("Failed to resolve listen address '{addr}': {source}")]
    Resolve {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// Socket could not be acquired
    #[error("Failed to listen on {transport} {addr}: {source}")]
    Bind {
        transport: Transport,
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// Receive/accept loop failed unexpectedly
    #[error("{transport} transport fault: {source}")]
    Transport {
        transport: Transport,
        #[source]
        source: std::io::Error,
    },

    /// Graceful close did not finish within the deadline
    #[error("{transport} server did not shut down within {timeout:?}")]
    ShutdownTimeout {
        transport: Transport,
        timeout: Duration,
    },

    #[error("{0} server is already serving")]
    AlreadyServing(Transport),

    /// DNS wire format error
    #[error("DNS codec error: {0}")]
    Codec(#[from] hickory_proto::ProtoError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A supervised task panicked or was aborted
    #[error("Task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// Shutdown was requested; not a failure
    #[error("Shutdown requested")]
    Cancelled,
}

impl ServerError {
    /// True for the expected cancellation outcome, false for real failures
    pub fn is_cancellation(&self) -> bool {
        matches!(self, ServerError::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, ServerError>;
