//! Lifecycle Coordinator
//!
//! Supervises the protocol servers and the signal watcher as one group of
//! tasks sharing a single cancellation token:
//!
//! ```text
//!   signal ──┐
//!            ├──► cancel ──► shutdown(udp) ─┐
//!   fault  ──┘            └► shutdown(tcp) ─┴──► wait for every task ──► outcome
//! ```
//!
//! The first real failure wins and cancels everything else. Cancellation on
//! its own is a clean exit; a shutdown that overruns its deadline is not.

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, Instrument};

use crate::dns::Transport;
use crate::error::{Result, ServerError};

/// A server the coordinator can start and stop
#[async_trait]
pub trait Service: Send + Sync + 'static {
    fn transport(&self) -> Transport;

    /// Serve until `shutdown` is called. Errors only on a transport fault.
    async fn activate_and_serve(&self) -> Result<()>;

    /// Stop accepting work and wait for in-flight work, bounded by `timeout`
    async fn shutdown(&self, timeout: Duration) -> Result<()>;
}

pub struct Coordinator {
    cancel: CancellationToken,
    shutdown_timeout: Duration,
}

impl Coordinator {
    pub fn new(shutdown_timeout: Duration) -> Self {
        Self {
            cancel: CancellationToken::new(),
            shutdown_timeout,
        }
    }

    /// Handle to the shared cancellation token
    #[cfg(test)]
    pub(crate) fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run every service until the signal fires or one of them fails.
    ///
    /// Returns `Ok` for a clean shutdown and the first non-cancellation
    /// error otherwise. Every spawned task has finished when this returns.
    pub async fn run<S>(self, services: Vec<Arc<dyn Service>>, signal: S) -> Result<()>
    where
        S: Future<Output = ()> + Send + 'static,
    {
        let mut tasks: JoinSet<Result<()>> = JoinSet::new();

        let cancel = self.cancel.clone();
        tasks.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = signal => cancel.cancel(),
            }
            Err(ServerError::Cancelled)
        });

        for service in services {
            let span = info_span!("dns_server", transport = %service.transport());

            let server = service.clone();
            tasks.spawn(async move { server.activate_and_serve().await }.instrument(span.clone()));

            let cancel = self.cancel.clone();
            let timeout = self.shutdown_timeout;
            tasks.spawn(
                async move {
                    cancel.cancelled().await;
                    match service.shutdown(timeout).await {
                        Ok(()) => {
                            info!("{} server stopped", service.transport());
                            Ok(())
                        }
                        Err(e) => {
                            error!(error = %e, "Shutdown failed");
                            Err(e)
                        }
                    }
                }
                .instrument(span),
            );
        }

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            let outcome = joined.map_err(ServerError::from).and_then(|r| r);

            match outcome {
                Ok(()) => {}
                Err(e) if e.is_cancellation() => {}
                Err(e) => {
                    self.cancel.cancel();
                    if first_error.is_none() {
                        first_error = Some(e);
                    } else {
                        debug!("Discarding additional error: {}", e);
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
