//! ctrd-shim - supervises one container on behalf of ctrd.

use anyhow::{Context, Result};
use clap::Parser;
use ctrd_shim::grpc::ShimGrpc;
use ctrd_shim::proto::shim_server::ShimServer;
use ctrd_shim::{RuncRuntime, ShimService};
use log::{info, warn};
use nix::sys::prctl;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::UnixListener;
use tokio::signal::unix::{SignalKind, signal};
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::Server;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "ctrd-shim")]
#[command(version = VERSION)]
#[command(about = "Per-container shim for ctrd")]
struct Args {
    /// Container ID
    #[arg(long)]
    id: String,

    /// Unix socket to serve the shim API on
    #[arg(long)]
    socket: PathBuf,

    /// Directory for pid files and process descriptions
    #[arg(long)]
    work_dir: PathBuf,

    /// OCI runtime binary
    #[arg(long, default_value = "runc")]
    runtime: PathBuf,

    /// State root passed to the OCI runtime
    #[arg(long)]
    runtime_root: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_millis()
        .init();

    info!("ctrd-shim v{VERSION} starting for container {}", args.id);

    // Container inits are reparented to us once the runtime exits
    prctl::set_child_subreaper(true)
        .map_err(|e| anyhow::anyhow!("Failed to set as child subreaper: {}", e))?;

    let runtime = Arc::new(RuncRuntime::new(
        args.runtime,
        args.runtime_root,
        args.work_dir.clone(),
    ));
    let service = ShimService::new(runtime);

    if args.socket.exists() {
        std::fs::remove_file(&args.socket)
            .with_context(|| format!("removing stale socket {}", args.socket.display()))?;
    }
    let listener = UnixListener::bind(&args.socket)
        .with_context(|| format!("binding {}", args.socket.display()))?;
    info!("Listening on {}", args.socket.display());

    let shutdown = {
        let service = service.clone();
        async move {
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    warn!("Failed to install SIGTERM handler: {e}");
                    service.shutdown_requested().await;
                    return;
                }
            };
            tokio::select! {
                _ = service.shutdown_requested() => info!("Shutting down on request"),
                _ = sigterm.recv() => info!("Received SIGTERM"),
                _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
            }
            // End open event streams so the server can drain
            let _ = service.shutdown(true);
        }
    };

    Server::builder()
        .add_service(ShimServer::new(ShimGrpc::new(service)))
        .serve_with_incoming_shutdown(UnixListenerStream::new(listener), shutdown)
        .await?;

    if let Err(e) = std::fs::remove_file(&args.socket) {
        warn!("Failed to remove {}: {e}", args.socket.display());
    }
    info!("ctrd-shim for {} exited", args.id);
    Ok(())
}
