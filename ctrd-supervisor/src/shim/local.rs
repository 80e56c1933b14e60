use async_trait::async_trait;
use ctrd_shim::{
    CreateOptions, DeleteResult, ExecOptions, RuncRuntime, Runtime, ShimService, State,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_stream::StreamExt;
use tracing::debug;

use super::{EventStream, Shim, ShimLauncher};
use crate::bundle::Bundle;
use crate::error::{Error, Result};

/// In-process shim: calls the shim service directly.
pub struct LocalShim {
    service: Arc<ShimService>,
}

impl LocalShim {
    pub fn new(service: Arc<ShimService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl Shim for LocalShim {
    async fn create(&self, opts: CreateOptions) -> Result<u32> {
        Ok(self.service.create(opts).await?)
    }

    async fn start(&self) -> Result<()> {
        Ok(self.service.start().await?)
    }

    async fn exec(&self, opts: ExecOptions) -> Result<u32> {
        Ok(self.service.exec(opts).await?)
    }

    async fn kill(&self, pid: u32, signal: u32, all: bool) -> Result<()> {
        Ok(self.service.kill(pid, signal, all).await?)
    }

    async fn delete(&self, pid: u32) -> Result<DeleteResult> {
        Ok(self.service.delete(pid).await?)
    }

    async fn pause(&self) -> Result<()> {
        Ok(self.service.pause().await?)
    }

    async fn resume(&self) -> Result<()> {
        Ok(self.service.resume().await?)
    }

    async fn state(&self) -> Result<State> {
        Ok(self.service.state()?)
    }

    async fn events(&self) -> Result<EventStream> {
        Ok(Box::pin(self.service.events().map(Ok)))
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(self.service.shutdown(true)?)
    }
}

/// Builds the runtime for one container from its ID and work directory.
pub type RuntimeFactory = Arc<dyn Fn(&str, &Path) -> Arc<dyn Runtime> + Send + Sync>;

/// Runs shims inside the daemon. Containers do not survive a daemon
/// restart in this mode, so [`ShimLauncher::connect`] always fails.
pub struct LocalLauncher {
    runtime: RuntimeFactory,
}

impl LocalLauncher {
    pub fn new(runtime: RuntimeFactory) -> Self {
        Self { runtime }
    }

    /// Drive `binary` (runc, youki) with an optional state root.
    pub fn runc(binary: PathBuf, root: Option<PathBuf>) -> Self {
        Self::new(Arc::new(move |_id: &str, work_dir: &Path| {
            Arc::new(RuncRuntime::new(binary.clone(), root.clone(), work_dir)) as Arc<dyn Runtime>
        }))
    }
}

#[async_trait]
impl ShimLauncher for LocalLauncher {
    async fn launch(&self, bundle: &Bundle) -> Result<Arc<dyn Shim>> {
        debug!(id = %bundle.id, work_dir = %bundle.work_dir.display(), "starting in-process shim");
        let runtime = (self.runtime)(&bundle.id, &bundle.work_dir);
        Ok(Arc::new(LocalShim::new(ShimService::new(runtime))))
    }

    async fn connect(&self, bundle: &Bundle) -> Result<Arc<dyn Shim>> {
        Err(Error::Unimplemented(format!(
            "in-process shim for {} cannot be reattached",
            bundle.id
        )))
    }
}
