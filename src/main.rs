//! Placeholder DNS Responder
//!
//! Listens for DNS queries on UDP and TCP, logs every question and answers
//! each query with SERVER FAILURE. Useful for exercising network plumbing,
//! failure injection, or capturing query traffic.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                    SERVFAIL DNS                         │
//! ├────────────────────────────────────────────────────────┤
//! │  UDP server  ──┐                                        │
//! │  TCP server  ──┼──► ServeMux "." ──► ServFailHandler    │
//! │  Signals     ──┘                                        │
//! │  Coordinator ── shared cancellation, bounded shutdown   │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! Exit status is 0 after a signal-driven shutdown and 1 on any bind
//! failure, transport fault or shutdown timeout.

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};

mod config;
mod dns;
mod error;
mod lifecycle;
mod signal;

use config::ServerConfig;
use dns::{bind_listeners, Handler, ServFailHandler, ServeMux, ServerOptions};
use lifecycle::{Coordinator, Service};
use signal::TerminationSignal;

/// Answers every DNS query with SERVFAIL
#[derive(Parser, Debug)]
#[command(name = "servfail-dns")]
#[command(version)]
#[command(about = "Placeholder DNS responder that fails every query", long_about = None)]
struct Args {
    /// Address to listen on for both UDP and TCP (host:port, default ":5353")
    #[arg(long)]
    listen: Option<String>,

    /// Path to configuration file
    #[arg(short, long, default_value = "servfail-dns.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse_from(normalize_args(std::env::args()));

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .init();

    exit_code(run(args).await)
}

/// 0 after a clean shutdown, 1 for every failure
fn exit_code(result: anyhow::Result<()>) -> ExitCode {
    match result {
        Ok(()) => {
            info!("👋 DNS responder stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %format!("{:#}", e), "Failed to serve DNS");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = if args.config.exists() {
        ServerConfig::load(&args.config)?
    } else {
        warn!("Config file not found, using defaults");
        ServerConfig::default()
    };

    let config = config.with_listen(args.listen);
    config.validate()?;

    let signals = TerminationSignal::register()?;

    let mut mux = ServeMux::new();
    mux.handle(".", Arc::new(ServFailHandler));
    let handler: Arc<dyn Handler> = Arc::new(mux);

    let address = config.listen_address()?;
    let (udp, tcp) = bind_listeners(&address, handler, ServerOptions::from(&config)).await?;

    info!(address = %tcp.local_addr(), "Listening for DNS queries (UDP/TCP)");

    let services = vec![udp as Arc<dyn Service>, tcp];
    Coordinator::new(config.shutdown_timeout())
        .run(services, signals.recv())
        .await?;

    Ok(())
}

/// Accept the single-dash `-listen` spelling alongside `--listen`
fn normalize_args(args: impl IntoIterator<Item = String>) -> Vec<String> {
    args.into_iter()
        .map(|arg| {
            if arg == "-listen" || arg.starts_with("-listen=") {
                format!("-{}", arg)
            } else {
                arg
            }
        })
        .collect()
}
