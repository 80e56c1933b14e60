use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use nix::sys::prctl;
use tokio::net::UnixListener;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ctrd_supervisor::shim::{LocalLauncher, RemoteLauncher, ShimLauncher};
use ctrd_supervisor::{Config, DEFAULT_EXEC_WORKERS, Supervisor, grpc};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ShimMode {
    /// One ctrd-shim process per container
    Remote,
    /// Shims run inside the daemon
    Local,
}

#[derive(Parser)]
#[command(name = "ctrd")]
#[command(version)]
#[command(about = "ctrd container supervisor daemon")]
struct Args {
    /// State directory for container work directories
    #[arg(long, default_value = ctrd_supervisor::DEFAULT_ROOT)]
    root: PathBuf,

    /// Unix socket to serve the execution API on
    #[arg(short, long, default_value = "/run/ctrd/ctrd.sock")]
    socket: PathBuf,

    /// How shims are run
    #[arg(long, value_enum, default_value_t = ShimMode::Remote)]
    shim: ShimMode,

    /// Shim binary used in remote mode
    #[arg(long, default_value = "ctrd-shim")]
    shim_binary: PathBuf,

    /// OCI runtime binary
    #[arg(long, default_value = "runc")]
    runtime: PathBuf,

    /// State root passed to the OCI runtime
    #[arg(long)]
    runtime_root: Option<PathBuf>,

    /// Number of exec workers
    #[arg(long, default_value_t = DEFAULT_EXEC_WORKERS)]
    exec_workers: usize,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

fn bind_socket(path: &Path) -> anyhow::Result<UnixListener> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    if path.exists() {
        std::fs::remove_file(path)
            .with_context(|| format!("removing stale socket {}", path.display()))?;
    }

    let listener =
        UnixListener::bind(path).with_context(|| format!("binding {}", path.display()))?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o660))
        .with_context(|| format!("setting permissions on {}", path.display()))?;
    Ok(listener)
}

async fn shutdown_signal() {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let directive = if args.debug {
        "ctrd_supervisor=debug"
    } else {
        "ctrd_supervisor=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(directive.parse()?))
        .init();

    info!(root = %args.root.display(), shim = ?args.shim, "initializing ctrd");

    let launcher: Arc<dyn ShimLauncher> = match args.shim {
        ShimMode::Remote => Arc::new(RemoteLauncher::new(
            args.shim_binary,
            args.runtime,
            args.runtime_root,
            args.debug,
        )),
        ShimMode::Local => {
            // Container inits are reparented to the daemon once the runtime exits
            prctl::set_child_subreaper(true)
                .map_err(|e| anyhow::anyhow!("failed to set as child subreaper: {e}"))?;
            Arc::new(LocalLauncher::runc(args.runtime, args.runtime_root))
        }
    };

    let config = Config {
        root: args.root,
        exec_workers: args.exec_workers,
        ..Default::default()
    };

    let token = CancellationToken::new();
    let supervisor = Arc::new(
        Supervisor::new(config, launcher, token.clone())
            .await
            .context("initializing supervisor")?,
    );
    info!(containers = supervisor.container_ids().len(), "supervisor ready");

    let listener = bind_socket(&args.socket)?;
    info!(socket = %args.socket.display(), "starting gRPC server");

    // Cancelling ends open event streams so the server can drain
    let shutdown = async move {
        shutdown_signal().await;
        token.cancel();
    };
    grpc::serve(supervisor, listener, shutdown).await?;

    if let Err(e) = std::fs::remove_file(&args.socket) {
        warn!(error = %e, "failed to remove socket");
    }
    info!("ctrd stopped");
    Ok(())
}
