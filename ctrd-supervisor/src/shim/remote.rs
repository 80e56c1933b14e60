use async_trait::async_trait;
use ctrd_shim::proto::shim_client::ShimClient;
use ctrd_shim::proto::{
    DeleteRequest, EventsRequest, KillRequest, PauseRequest, ResumeRequest, ShutdownRequest,
    StartRequest, StateRequest,
};
use ctrd_shim::{CreateOptions, DeleteResult, Event, ExecOptions, State};
use hyper_util::rt::TokioIo;
use std::fs::File;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UnixStream;
use tokio::process::Command;
use tokio_stream::StreamExt;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;
use tracing::{debug, info, warn};

use super::{EventStream, Shim, ShimLauncher};
use crate::bundle::Bundle;
use crate::error::{Error, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const CONNECT_RETRY: Duration = Duration::from_millis(20);

/// Shim running as a separate `ctrd-shim` process, reached over gRPC on its
/// unix socket.
pub struct RemoteShim {
    id: String,
    client: ShimClient<Channel>,
}

impl RemoteShim {
    /// Connect to the shim listening on `socket`.
    pub async fn connect(id: &str, socket: &Path) -> Result<Self> {
        let channel = unix_channel(socket).await?;
        debug!(id, socket = %socket.display(), "connected to shim");
        Ok(Self {
            id: id.to_string(),
            client: ShimClient::new(channel),
        })
    }

    fn client(&self) -> ShimClient<Channel> {
        self.client.clone()
    }
}

/// Create a tonic channel over a unix socket.
pub async fn unix_channel(socket: &Path) -> Result<Channel> {
    // The URI is a placeholder, the connector dials the socket
    let endpoint = Endpoint::from_static("http://[::]:50051").connect_timeout(CONNECT_TIMEOUT);

    let path = socket.to_path_buf();
    let channel = endpoint
        .connect_with_connector(service_fn(move |_: Uri| {
            let path = path.clone();
            async move {
                let stream = UnixStream::connect(&path).await?;
                Ok::<_, std::io::Error>(TokioIo::new(stream))
            }
        }))
        .await
        .map_err(ctrd_shim::Error::from)?;

    Ok(channel)
}

#[async_trait]
impl Shim for RemoteShim {
    async fn create(&self, opts: CreateOptions) -> Result<u32> {
        let resp = self
            .client()
            .create(ctrd_shim::proto::CreateRequest::from(opts))
            .await
            .map_err(ctrd_shim::Error::from)?;
        Ok(resp.into_inner().pid)
    }

    async fn start(&self) -> Result<()> {
        self.client()
            .start(StartRequest {})
            .await
            .map_err(ctrd_shim::Error::from)?;
        Ok(())
    }

    async fn exec(&self, opts: ExecOptions) -> Result<u32> {
        let resp = self
            .client()
            .exec(ctrd_shim::proto::ExecRequest::from(opts))
            .await
            .map_err(ctrd_shim::Error::from)?;
        Ok(resp.into_inner().pid)
    }

    async fn kill(&self, pid: u32, signal: u32, all: bool) -> Result<()> {
        self.client()
            .kill(KillRequest { pid, signal, all })
            .await
            .map_err(ctrd_shim::Error::from)?;
        Ok(())
    }

    async fn delete(&self, pid: u32) -> Result<DeleteResult> {
        let resp = self
            .client()
            .delete(DeleteRequest { pid })
            .await
            .map_err(ctrd_shim::Error::from)?;
        Ok(resp.into_inner().into())
    }

    async fn pause(&self) -> Result<()> {
        self.client()
            .pause(PauseRequest {})
            .await
            .map_err(ctrd_shim::Error::from)?;
        Ok(())
    }

    async fn resume(&self) -> Result<()> {
        self.client()
            .resume(ResumeRequest {})
            .await
            .map_err(ctrd_shim::Error::from)?;
        Ok(())
    }

    async fn state(&self) -> Result<State> {
        let resp = self
            .client()
            .state(StateRequest {})
            .await
            .map_err(ctrd_shim::Error::from)?;
        Ok(State::try_from(resp.into_inner())?)
    }

    async fn events(&self) -> Result<EventStream> {
        let stream = self
            .client()
            .events(EventsRequest {})
            .await
            .map_err(ctrd_shim::Error::from)?
            .into_inner();

        let stream = stream.map(|item| -> Result<Event> {
            let event = item.map_err(ctrd_shim::Error::from)?;
            Ok(Event::try_from(event)?)
        });
        Ok(Box::pin(stream))
    }

    async fn shutdown(&self) -> Result<()> {
        info!(id = %self.id, "shutting down shim");
        self.client()
            .shutdown(ShutdownRequest { now: false })
            .await
            .map_err(ctrd_shim::Error::from)?;
        Ok(())
    }
}

/// Spawns `ctrd-shim` processes and connects to them.
pub struct RemoteLauncher {
    shim_binary: PathBuf,
    runtime: PathBuf,
    runtime_root: Option<PathBuf>,
    debug: bool,
}

impl RemoteLauncher {
    pub fn new(
        shim_binary: PathBuf,
        runtime: PathBuf,
        runtime_root: Option<PathBuf>,
        debug: bool,
    ) -> Self {
        Self {
            shim_binary,
            runtime,
            runtime_root,
            debug,
        }
    }

    fn command(&self, bundle: &Bundle) -> Result<Command> {
        let log = File::create(bundle.log_path())?;
        let log_err = log.try_clone()?;

        let mut cmd = std::process::Command::new(&self.shim_binary);
        cmd.arg("--id")
            .arg(&bundle.id)
            .arg("--socket")
            .arg(bundle.socket_path())
            .arg("--work-dir")
            .arg(&bundle.work_dir)
            .arg("--runtime")
            .arg(&self.runtime)
            .current_dir(&bundle.work_dir)
            .stdin(Stdio::null())
            .stdout(log)
            .stderr(log_err)
            // Own process group so daemon signals do not reach the shim
            .process_group(0);
        if let Some(root) = &self.runtime_root {
            cmd.arg("--runtime-root").arg(root);
        }
        if self.debug {
            cmd.arg("--debug");
        }

        Ok(Command::from(cmd))
    }
}

#[async_trait]
impl ShimLauncher for RemoteLauncher {
    async fn launch(&self, bundle: &Bundle) -> Result<Arc<dyn Shim>> {
        let id = bundle.id.as_str();
        let socket = bundle.socket_path();
        let mut child = self.command(bundle)?.spawn().map_err(|e| {
            Error::Internal(format!(
                "failed to spawn {}: {e}",
                self.shim_binary.display()
            ))
        })?;
        let pid = child.id().unwrap_or_default();
        info!(id, pid, "spawned shim");

        let start = Instant::now();
        let shim = loop {
            if let Some(status) = child.try_wait()? {
                let log = tokio::fs::read_to_string(bundle.log_path())
                    .await
                    .unwrap_or_default();
                return Err(Error::Internal(format!(
                    "shim for {id} exited with {status}: {}",
                    log.trim()
                )));
            }

            if socket.exists()
                && let Ok(shim) = RemoteShim::connect(id, &socket).await
            {
                break shim;
            }

            if start.elapsed() > CONNECT_TIMEOUT {
                let _ = child.start_kill();
                return Err(Error::Shim(ctrd_shim::Error::Unavailable(format!(
                    "shim for {id} did not come up within {CONNECT_TIMEOUT:?}"
                ))));
            }
            tokio::time::sleep(CONNECT_RETRY).await;
        };

        // Reap the shim when it exits; it is not tied to our lifetime
        let id = id.to_string();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => info!(id = %id, pid, %status, "shim exited"),
                Err(e) => warn!(id = %id, pid, error = %e, "failed to wait for shim"),
            }
        });

        Ok(Arc::new(shim))
    }

    async fn connect(&self, bundle: &Bundle) -> Result<Arc<dyn Shim>> {
        let socket = bundle.socket_path();
        if !socket.exists() {
            return Err(Error::NotFound(format!("{} (no shim socket)", bundle.id)));
        }
        Ok(Arc::new(RemoteShim::connect(&bundle.id, &socket).await?))
    }
}
